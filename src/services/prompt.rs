//! Prompt context assembly for agent task execution.
//!
//! Builds the textual context fed to the LLM CLI: role identity, the task
//! header, parent artifacts, revision feedback, a capped sibling summary,
//! and routing hints. Every section degrades gracefully when its data is
//! missing.

use crate::domain::errors::BoardResult;
use crate::domain::models::config::RoutingMode;
use crate::domain::models::{RoleConfig, Task, TaskStatus};
use crate::services::task_board::TaskBoard;
use std::collections::HashMap;
use std::fmt::Write as _;

/// Recently-completed sibling titles are capped at this many entries.
const SIBLING_TITLE_CAP: usize = 10;

/// Builds prompt context for one role's agent instances.
pub struct PromptBuilder<'a> {
    pub instance_id: &'a str,
    pub role: &'a RoleConfig,
    pub all_roles: &'a HashMap<String, RoleConfig>,
}

impl<'a> PromptBuilder<'a> {
    pub fn new(
        instance_id: &'a str,
        role: &'a RoleConfig,
        all_roles: &'a HashMap<String, RoleConfig>,
    ) -> Self {
        Self {
            instance_id,
            role,
            all_roles,
        }
    }

    fn includes(&self, section: &str) -> bool {
        self.role.context_includes.iter().any(|s| s == section)
    }

    /// Assemble the full context for `task`.
    pub async fn build(&self, board: &TaskBoard, task: &Task) -> BoardResult<String> {
        let mut out = String::new();

        let display = if self.role.display_name.is_empty() {
            &self.role.role
        } else {
            &self.role.display_name
        };
        let _ = writeln!(out, "You are {display} (instance {}).\n", self.instance_id);
        out.push_str("## Your Task\n");
        let _ = writeln!(out, "**{}**: {}", task.id, task.title);
        let _ = writeln!(
            out,
            "Type: {} | Priority: {}",
            task.task_type.as_deref().unwrap_or("unspecified"),
            task.priority
        );
        if let Some(ref group_id) = task.group_id {
            let _ = writeln!(out, "Group: {group_id}");
        }

        if let Some(ref description) = task.description {
            let _ = write!(out, "\n## Description\n{description}\n");
        }

        if self.includes("parent_artifact") {
            self.push_parent_section(board, task, &mut out).await?;
        }

        self.push_revision_section(board, task, &mut out).await?;

        if self.includes("sibling_summary") {
            self.push_sibling_section(board, task, &mut out).await?;
        }

        self.push_routing_section(&mut out);

        Ok(out)
    }

    /// Parent task context: description plus any recorded output.
    async fn push_parent_section(
        &self,
        board: &TaskBoard,
        task: &Task,
        out: &mut String,
    ) -> BoardResult<()> {
        let Some(ref parent_id) = task.parent_id else {
            return Ok(());
        };
        let Some(parent) = board.get_task(parent_id).await? else {
            return Ok(());
        };

        let _ = write!(out, "\n## Parent Task ({}): {}\n", parent.id, parent.title);
        if let Some(ref description) = parent.description {
            let _ = writeln!(out, "Description: {description}");
        }
        if let Some(ref output) = parent.output_text {
            let _ = write!(out, "\n### Parent Output:\n{output}\n");
        }
        Ok(())
    }

    /// Rejection context forwarded to revision tasks.
    async fn push_revision_section(
        &self,
        board: &TaskBoard,
        task: &Task,
        out: &mut String,
    ) -> BoardResult<()> {
        let Some(ref revision_of) = task.revision_of else {
            return Ok(());
        };
        let Some(original) = board.get_task(revision_of).await? else {
            return Ok(());
        };

        let reason = original
            .rejection_reason
            .as_deref()
            .unwrap_or("No reason provided");
        out.push_str("\n## Revision Context\n");
        let _ = writeln!(
            out,
            "This is a revision of task {}. The original was rejected/failed because:",
            original.id
        );
        let _ = writeln!(out, "{reason}");
        out.push_str("Please address the feedback above in your implementation.\n");
        Ok(())
    }

    /// Group progress summary, capped for token efficiency.
    async fn push_sibling_section(
        &self,
        board: &TaskBoard,
        task: &Task,
        out: &mut String,
    ) -> BoardResult<()> {
        let Some(ref group_id) = task.group_id else {
            return Ok(());
        };
        let group_tasks = board.get_group_tasks(group_id).await?;

        let completed: Vec<&Task> = group_tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .collect();
        let in_progress: Vec<&Task> = group_tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .collect();
        let pending = group_tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Blocked))
            .count();

        let _ = write!(out, "\n## Group Progress ({group_id})\n");
        let _ = writeln!(out, "- Completed: {} tasks", completed.len());
        let _ = writeln!(out, "- In Progress: {} tasks", in_progress.len());
        let _ = writeln!(out, "- Pending: {pending} tasks");

        if !completed.is_empty() {
            let start = completed.len().saturating_sub(SIBLING_TITLE_CAP);
            let titles: Vec<&str> = completed[start..].iter().map(|t| t.title.as_str()).collect();
            let _ = writeln!(out, "Recently completed: {}", titles.join(", "));
        }
        if !in_progress.is_empty() {
            let titles: Vec<&str> = in_progress.iter().map(|t| t.title.as_str()).collect();
            let _ = writeln!(out, "In progress: {}", titles.join(", "));
        }
        Ok(())
    }

    /// Routing hints: a full agent manifest for open roles, or the
    /// configured route targets for restricted ones.
    fn push_routing_section(&self, out: &mut String) {
        if self.role.routing_mode == RoutingMode::Open && !self.all_roles.is_empty() {
            out.push_str("\n## Available Agents\n");
            out.push_str("You may create tasks for any of these agents:\n\n");
            let mut names: Vec<&String> = self.all_roles.keys().collect();
            names.sort();
            for name in names {
                if name == &self.role.role {
                    continue;
                }
                let role = &self.all_roles[name];
                let accepts = if role.accepts.is_empty() {
                    "any".to_string()
                } else {
                    role.accepts.join(", ")
                };
                let display = if role.display_name.is_empty() {
                    &role.role
                } else {
                    &role.display_name
                };
                let _ = writeln!(
                    out,
                    "- **{display}** ({}): assigned_to=\"{name}\", accepts: [{accepts}]",
                    role.prefix
                );
            }
            out.push_str(
                "\nUse create_task(assigned_to=\"<role>\", task_type=\"<type>\") to delegate work.\n",
            );
        } else if !self.role.routes_to.is_empty() {
            out.push_str("\n## When Complete\nCreate tasks for:\n");
            for route in &self.role.routes_to {
                let _ = writeln!(
                    out,
                    "- **{}** (types: {})",
                    route.role,
                    route.task_types.join(", ")
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::connection::create_test_pool;
    use crate::adapters::sqlite::Store;
    use crate::domain::models::config::RouteTarget;
    use crate::domain::ports::clock::system_clock;
    use crate::services::task_board::NewTask;

    async fn board() -> TaskBoard {
        let pool = create_test_pool().await.unwrap();
        let store = Store::from_pool(pool, system_clock());
        store.migrate().await.unwrap();
        let board = TaskBoard::new(store);
        board
            .register_prefixes(HashMap::from([
                ("coder".to_string(), "CD".to_string()),
                ("architect".to_string(), "AR".to_string()),
            ]))
            .await
            .unwrap();
        board
    }

    fn roles() -> HashMap<String, RoleConfig> {
        let mut coder = RoleConfig::new("coder", "CD");
        coder.display_name = "Coder".to_string();
        coder.accepts = vec!["implementation".to_string()];
        let mut architect = RoleConfig::new("architect", "AR");
        architect.display_name = "Architect".to_string();
        architect.accepts = vec!["tech_design".to_string()];
        HashMap::from([
            ("coder".to_string(), coder),
            ("architect".to_string(), architect),
        ])
    }

    fn new_task(group_id: &str, title: &str) -> NewTask {
        NewTask {
            group_id: group_id.to_string(),
            title: title.to_string(),
            task_type: "implementation".to_string(),
            assigned_to: "coder".to_string(),
            ..NewTask::default()
        }
    }

    #[tokio::test]
    async fn test_basic_sections() {
        let b = board().await;
        let g = b.create_group("Login", None, None).await.unwrap();
        let task = b
            .create_task(NewTask {
                description: Some("Wire up the login form.".to_string()),
                ..new_task(&g.id, "Build login")
            })
            .await
            .unwrap();

        let all = roles();
        let role = all["coder"].clone();
        let ctx = PromptBuilder::new("coder-1", &role, &all)
            .build(&b, &task)
            .await
            .unwrap();

        assert!(ctx.contains("You are Coder (instance coder-1)"));
        assert!(ctx.contains(&format!("**{}**: Build login", task.id)));
        assert!(ctx.contains("## Description\nWire up the login form."));
        assert!(ctx.contains("## Group Progress"));
        // Open routing: the manifest lists the other role but not itself.
        assert!(ctx.contains("## Available Agents"));
        assert!(ctx.contains("**Architect**"));
        assert!(!ctx.contains("assigned_to=\"coder\""));
    }

    #[tokio::test]
    async fn test_parent_and_revision_context() {
        let b = board().await;
        let g = b.create_group("Login", None, None).await.unwrap();
        let parent = b
            .create_task(new_task(&g.id, "Design login"))
            .await
            .unwrap();
        b.claim_task("coder", "coder-1").await.unwrap().unwrap();
        b.complete_task_with_output(&parent.id, "Use OAuth with PKCE.")
            .await
            .unwrap();

        let rejected = b.create_task(new_task(&g.id, "First try")).await.unwrap();
        b.reject_task(&rejected.id, "Missing error handling").await.unwrap();

        let task = b
            .create_task(NewTask {
                parent_id: Some(parent.id.clone()),
                revision_of: Some(rejected.id.clone()),
                ..new_task(&g.id, "Second try")
            })
            .await
            .unwrap();

        let all = roles();
        let role = all["coder"].clone();
        let ctx = PromptBuilder::new("coder-1", &role, &all)
            .build(&b, &task)
            .await
            .unwrap();

        assert!(ctx.contains(&format!("## Parent Task ({})", parent.id)));
        assert!(ctx.contains("Use OAuth with PKCE."));
        assert!(ctx.contains("## Revision Context"));
        assert!(ctx.contains("Missing error handling"));
    }

    #[tokio::test]
    async fn test_restricted_routing_hints() {
        let b = board().await;
        let g = b.create_group("Login", None, None).await.unwrap();
        let task = b.create_task(new_task(&g.id, "Build")).await.unwrap();

        let mut role = RoleConfig::new("coder", "CD");
        role.routing_mode = RoutingMode::Restricted;
        role.routes_to = vec![RouteTarget {
            role: "architect".to_string(),
            task_types: vec!["tech_design".to_string()],
        }];
        let all = roles();

        let ctx = PromptBuilder::new("coder-1", &role, &all)
            .build(&b, &task)
            .await
            .unwrap();
        assert!(ctx.contains("## When Complete"));
        assert!(ctx.contains("**architect** (types: tech_design)"));
        assert!(!ctx.contains("## Available Agents"));
    }

    #[tokio::test]
    async fn test_sections_omitted_when_config_excludes() {
        let b = board().await;
        let g = b.create_group("Login", None, None).await.unwrap();
        let task = b.create_task(new_task(&g.id, "Build")).await.unwrap();

        let mut role = RoleConfig::new("coder", "CD");
        role.context_includes = vec![];
        let all = roles();

        let ctx = PromptBuilder::new("coder-1", &role, &all)
            .build(&b, &task)
            .await
            .unwrap();
        assert!(!ctx.contains("## Group Progress"));
    }
}
