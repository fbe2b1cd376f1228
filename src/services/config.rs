//! Configuration loading and validation.
//!
//! Team config merges programmatic defaults, the project YAML, and
//! `TASKBREW_`-prefixed environment variables (highest priority). Role
//! configs are one YAML file per role under `config/roles/`.

use crate::domain::errors::{BoardError, BoardResult};
use crate::domain::models::{RoleConfig, TeamConfig};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Load the team config with hierarchical merging.
pub fn load_team_config(path: &Path) -> BoardResult<TeamConfig> {
    let team: TeamConfig = Figment::new()
        .merge(Serialized::defaults(TeamConfig::default()))
        .merge(Yaml::file(path))
        .merge(Env::prefixed("TASKBREW_").split("__"))
        .extract()
        .map_err(|e| BoardError::Config(format!("failed to load team config: {e}")))?;
    validate_team(&team)?;
    Ok(team)
}

/// Load every `*.yaml` role file from a directory, keyed by role name.
pub fn load_roles(dir: &Path) -> BoardResult<HashMap<String, RoleConfig>> {
    let mut roles = HashMap::new();
    if !dir.is_dir() {
        return Ok(roles);
    }

    let entries = std::fs::read_dir(dir)
        .map_err(|e| BoardError::Config(format!("cannot read roles dir: {e}")))?;
    for entry in entries {
        let entry = entry.map_err(|e| BoardError::Config(e.to_string()))?;
        let path = entry.path();
        let is_yaml = path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml");
        if !is_yaml {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| BoardError::Config(format!("cannot read {}: {e}", path.display())))?;
        let role: RoleConfig = serde_yaml::from_str(&text)
            .map_err(|e| BoardError::Config(format!("invalid role file {}: {e}", path.display())))?;
        roles.insert(role.role.clone(), role);
    }
    Ok(roles)
}

/// Sanity checks on the merged team config.
pub fn validate_team(team: &TeamConfig) -> BoardResult<()> {
    if team.db_path.is_empty() {
        return Err(BoardError::Config("db_path cannot be empty".to_string()));
    }
    if team.default_poll_interval <= 0.0 {
        return Err(BoardError::Config(format!(
            "default_poll_interval must be positive, got {}",
            team.default_poll_interval
        )));
    }
    if team.max_instances_default == 0 {
        return Err(BoardError::Config(
            "max_instances_default must be at least 1".to_string(),
        ));
    }
    if team.guardrails.rejection_cycle_limit == 0 {
        return Err(BoardError::Config(
            "rejection_cycle_limit must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Cross-role consistency: every route must point at a known role that
/// accepts the routed task types, and prefixes must be unique.
pub fn validate_routing(roles: &HashMap<String, RoleConfig>) -> Vec<String> {
    let mut errors = Vec::new();

    let mut seen_prefixes: HashMap<&str, &str> = HashMap::new();
    for (name, role) in roles {
        if role.prefix.is_empty() {
            errors.push(format!("role '{name}' has an empty prefix"));
        } else if let Some(other) = seen_prefixes.insert(role.prefix.as_str(), name) {
            errors.push(format!(
                "roles '{other}' and '{name}' share prefix '{}'",
                role.prefix
            ));
        }

        for route in &role.routes_to {
            let Some(target) = roles.get(&route.role) else {
                errors.push(format!(
                    "role '{name}' routes to unknown role '{}'",
                    route.role
                ));
                continue;
            };
            let target_accepts: HashSet<&str> =
                target.accepts.iter().map(String::as_str).collect();
            for task_type in &route.task_types {
                if !target_accepts.contains(task_type.as_str()) {
                    errors.push(format!(
                        "role '{name}' routes task_type '{task_type}' to '{}', which does not accept it",
                        route.role
                    ));
                }
            }
        }
    }

    errors.sort();
    errors
}
