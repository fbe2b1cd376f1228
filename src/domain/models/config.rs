//! Validated configuration consumed by the orchestrator.
//!
//! The core receives already-parsed values; loading/merging lives in
//! `services::config`. Defaults here mirror the shipped `team.yaml`.

use serde::{Deserialize, Serialize};

/// Team-level configuration (`config/team.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TeamConfig {
    pub team_name: String,
    /// Path to the SQLite database file.
    pub db_path: String,
    pub dashboard_host: String,
    pub dashboard_port: u16,
    /// Seconds between poll attempts for idle agents.
    pub default_poll_interval: f64,
    /// Fallback instance count for roles that do not set `max_instances`.
    pub max_instances_default: usize,
    /// External LLM CLI binary to invoke (`claude` by default).
    pub cli_provider: String,
    pub guardrails: GuardrailLimits,
}

impl Default for TeamConfig {
    fn default() -> Self {
        Self {
            team_name: "taskbrew".to_string(),
            db_path: ".taskbrew/taskbrew.db".to_string(),
            dashboard_host: "127.0.0.1".to_string(),
            dashboard_port: 8420,
            default_poll_interval: 5.0,
            max_instances_default: 1,
            cli_provider: "claude".to_string(),
            guardrails: GuardrailLimits::default(),
        }
    }
}

/// Hard limits on task-graph growth, enforced at task creation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailLimits {
    /// Maximum length of a parent chain.
    pub max_task_depth: usize,
    /// Maximum number of tasks per group.
    pub max_tasks_per_group: usize,
    /// Maximum revision/bug_fix ancestors in a rejection chain.
    pub rejection_cycle_limit: usize,
}

impl Default for GuardrailLimits {
    fn default() -> Self {
        Self {
            max_task_depth: 10,
            max_tasks_per_group: 50,
            rejection_cycle_limit: 3,
        }
    }
}

/// Whether a role may route tasks to any target or only to those listed in
/// its `routes_to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    Open,
    Restricted,
}

impl Default for RoutingMode {
    fn default() -> Self {
        Self::Open
    }
}

/// One allowed routing edge for a restricted role.
///
/// An empty `task_types` list permits every task type for the target role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTarget {
    pub role: String,
    #[serde(default)]
    pub task_types: Vec<String>,
}

/// Auto-scaling policy for a role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoScaleConfig {
    pub enabled: bool,
    /// Scale up when `backlog / max(1, idle)` exceeds this ratio.
    pub scale_up_threshold: f64,
    /// Scale an auto-spawned instance down after this many idle minutes.
    pub scale_down_idle_minutes: u64,
}

impl Default for AutoScaleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            scale_up_threshold: 3.0,
            scale_down_idle_minutes: 10,
        }
    }
}

/// Per-role configuration (`config/roles/*.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    /// Role name, e.g. `"coder"`. Instances are `"{role}-{n}"`.
    pub role: String,
    #[serde(default)]
    pub display_name: String,
    /// Task-ID prefix, e.g. `"CD"`.
    pub prefix: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Tools granted to the agent CLI. Roles with `Bash` get workspace
    /// isolation so they cannot mutate the main checkout.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Task types this role accepts.
    #[serde(default)]
    pub accepts: Vec<String>,
    /// Task types this role is expected to produce.
    #[serde(default)]
    pub produces: Vec<String>,
    #[serde(default)]
    pub routes_to: Vec<RouteTarget>,
    #[serde(default)]
    pub routing_mode: RoutingMode,
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Per-task execution timeout in seconds.
    #[serde(default = "default_max_execution_time")]
    pub max_execution_time: u64,
    #[serde(default)]
    pub auto_scale: Option<AutoScaleConfig>,
    #[serde(default)]
    pub can_create_groups: bool,
    /// Group-ID prefix when this role creates groups (e.g. `"FEAT"`).
    #[serde(default)]
    pub group_type: Option<String>,
    /// Named prompt sections to include when building agent context
    /// (e.g. `parent_artifact`, `sibling_summary`).
    #[serde(default = "default_context_includes")]
    pub context_includes: Vec<String>,
}

fn default_max_instances() -> usize {
    1
}

fn default_max_turns() -> u32 {
    30
}

fn default_max_execution_time() -> u64 {
    1800
}

fn default_context_includes() -> Vec<String> {
    vec!["parent_artifact".to_string(), "sibling_summary".to_string()]
}

impl RoleConfig {
    /// Minimal role for tests.
    pub fn new(role: impl Into<String>, prefix: impl Into<String>) -> Self {
        let role = role.into();
        Self {
            display_name: role.clone(),
            role,
            prefix: prefix.into(),
            system_prompt: String::new(),
            model: None,
            tools: Vec::new(),
            accepts: Vec::new(),
            produces: Vec::new(),
            routes_to: Vec::new(),
            routing_mode: RoutingMode::Open,
            max_instances: 1,
            max_turns: default_max_turns(),
            max_execution_time: default_max_execution_time(),
            auto_scale: None,
            can_create_groups: false,
            group_type: None,
            context_includes: default_context_includes(),
        }
    }

    /// Whether this role needs an isolated workspace for shell access.
    pub fn needs_workspace(&self) -> bool {
        self.tools.iter().any(|t| t == "Bash")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn team_defaults() {
        let cfg = TeamConfig::default();
        assert_eq!(cfg.dashboard_port, 8420);
        assert_eq!(cfg.guardrails.rejection_cycle_limit, 3);
        assert!((cfg.default_poll_interval - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn role_yaml_round_trip() {
        let yaml = r#"
role: coder
display_name: "Coder"
prefix: "CD"
tools: [Read, Bash]
accepts: [implementation, bug_fix]
routes_to:
  - role: verifier
    task_types: [verification]
routing_mode: restricted
max_instances: 2
"#;
        let role: RoleConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(role.role, "coder");
        assert_eq!(role.prefix, "CD");
        assert_eq!(role.routing_mode, RoutingMode::Restricted);
        assert_eq!(role.max_instances, 2);
        assert_eq!(role.max_execution_time, 1800);
        assert!(role.needs_workspace());
        assert_eq!(role.routes_to[0].role, "verifier");
    }
}
