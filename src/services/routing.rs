//! Route validation and creation guardrails.
//!
//! Applied when a task is created through the API. Routing rules only bind
//! role-initiated creations (`assigned_by != "human"`); the growth
//! guardrails bind everyone.

use crate::domain::errors::{BoardError, BoardResult};
use crate::domain::models::config::RoutingMode;
use crate::domain::models::{GuardrailLimits, RoleConfig};
use crate::services::task_board::{NewTask, TaskBoard};
use std::collections::HashMap;

/// Safety cap on parent-chain walks, independent of configured limits.
const MAX_CHAIN_WALK: usize = 100;

/// Task types that count toward the rejection-cycle limit.
const REJECTION_CHAIN_TYPES: [&str; 2] = ["revision", "bug_fix"];

/// Validates cross-role task creation against the team's routing rules and
/// guardrail limits.
pub struct RouteValidator {
    roles: HashMap<String, RoleConfig>,
    guardrails: GuardrailLimits,
}

impl RouteValidator {
    pub fn new(roles: HashMap<String, RoleConfig>, guardrails: GuardrailLimits) -> Self {
        Self { roles, guardrails }
    }

    pub fn roles(&self) -> &HashMap<String, RoleConfig> {
        &self.roles
    }

    /// Parse the creator's role from an `assigned_by` value by stripping the
    /// `-N` instance suffix. `"coder-2"` → `"coder"`; `"human"` → `None`.
    pub fn creator_role<'a>(&self, assigned_by: &'a str) -> Option<&'a str> {
        let (role, suffix) = assigned_by.rsplit_once('-')?;
        if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
            Some(role)
        } else {
            None
        }
    }

    /// Validate a creation request. `assigned_by` is the creating agent
    /// instance id, or `"human"` for operator-initiated tasks.
    pub async fn validate(
        &self,
        board: &TaskBoard,
        new: &NewTask,
        assigned_by: &str,
    ) -> BoardResult<()> {
        if assigned_by != "human" && !self.roles.is_empty() {
            self.validate_route(new, assigned_by)?;
        }
        self.validate_guardrails(board, new).await
    }

    fn validate_route(&self, new: &NewTask, assigned_by: &str) -> BoardResult<()> {
        // 1. Target must be a registered role.
        let Some(target) = self.roles.get(&new.assigned_to) else {
            return Err(BoardError::InvalidRole(new.assigned_to.clone()));
        };

        // 2. Target must accept the task type.
        if !target.accepts.iter().any(|t| t == &new.task_type) {
            return Err(BoardError::UnacceptedType {
                role: new.assigned_to.clone(),
                task_type: new.task_type.clone(),
            });
        }

        // 3. Restricted creators may only follow their configured routes.
        if let Some(creator_role) = self.creator_role(assigned_by) {
            if let Some(creator) = self.roles.get(creator_role) {
                if creator.routing_mode == RoutingMode::Restricted {
                    let allowed = creator.routes_to.iter().any(|route| {
                        route.role == new.assigned_to
                            && (route.task_types.is_empty()
                                || route.task_types.iter().any(|t| t == &new.task_type))
                    });
                    if !allowed {
                        return Err(BoardError::RouteForbidden {
                            creator: creator_role.to_string(),
                            target: new.assigned_to.clone(),
                            task_type: new.task_type.clone(),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    async fn validate_guardrails(&self, board: &TaskBoard, new: &NewTask) -> BoardResult<()> {
        // Group size cap.
        if !new.group_id.is_empty() {
            let group_tasks = board.get_group_tasks(&new.group_id).await?;
            if group_tasks.len() >= self.guardrails.max_tasks_per_group {
                return Err(BoardError::GroupFull {
                    group_id: new.group_id.clone(),
                    count: group_tasks.len(),
                    limit: self.guardrails.max_tasks_per_group,
                });
            }
        }

        // Depth cap over the parent chain.
        if let Some(ref parent_id) = new.parent_id {
            let depth = self.parent_chain_depth(board, parent_id).await?;
            if depth >= self.guardrails.max_task_depth {
                return Err(BoardError::DepthExceeded {
                    depth,
                    limit: self.guardrails.max_task_depth,
                });
            }
        }

        // Rejection-cycle cap: revision/bug_fix ancestors in the chain.
        if REJECTION_CHAIN_TYPES.contains(&new.task_type.as_str()) {
            if let Some(ref parent_id) = new.parent_id {
                let count = self.rejection_chain_length(board, parent_id).await?;
                if count >= self.guardrails.rejection_cycle_limit {
                    return Err(BoardError::CycleLimit { count });
                }
            }
        }

        Ok(())
    }

    async fn parent_chain_depth(&self, board: &TaskBoard, start: &str) -> BoardResult<usize> {
        let mut depth = 0;
        let mut current = Some(start.to_string());
        while let Some(id) = current {
            if depth >= MAX_CHAIN_WALK {
                break;
            }
            let Some(task) = board.get_task(&id).await? else {
                break;
            };
            depth += 1;
            current = task.parent_id;
        }
        Ok(depth)
    }

    async fn rejection_chain_length(&self, board: &TaskBoard, start: &str) -> BoardResult<usize> {
        let mut count = 0;
        let mut walked = 0;
        let mut current = Some(start.to_string());
        while let Some(id) = current {
            if walked >= MAX_CHAIN_WALK {
                break;
            }
            let Some(task) = board.get_task(&id).await? else {
                break;
            };
            if task
                .task_type
                .as_deref()
                .is_some_and(|t| REJECTION_CHAIN_TYPES.contains(&t))
            {
                count += 1;
            }
            walked += 1;
            current = task.parent_id;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::connection::create_test_pool;
    use crate::adapters::sqlite::Store;
    use crate::domain::models::config::RouteTarget;
    use crate::domain::models::TaskPriority;
    use crate::domain::ports::clock::system_clock;

    async fn board() -> TaskBoard {
        let pool = create_test_pool().await.unwrap();
        let store = Store::from_pool(pool, system_clock());
        store.migrate().await.unwrap();
        let board = TaskBoard::new(store);
        board
            .register_prefixes(HashMap::from([
                ("pm".to_string(), "PM".to_string()),
                ("architect".to_string(), "AR".to_string()),
                ("coder".to_string(), "CD".to_string()),
            ]))
            .await
            .unwrap();
        board
    }

    fn roles() -> HashMap<String, RoleConfig> {
        let mut pm = RoleConfig::new("pm", "PM");
        pm.accepts = vec!["goal".to_string()];

        let mut architect = RoleConfig::new("architect", "AR");
        architect.accepts = vec!["tech_design".to_string()];

        let mut coder = RoleConfig::new("coder", "CD");
        coder.accepts = vec![
            "implementation".to_string(),
            "revision".to_string(),
            "bug_fix".to_string(),
        ];
        coder.routing_mode = RoutingMode::Restricted;
        coder.routes_to = vec![RouteTarget {
            role: "architect".to_string(),
            task_types: vec!["tech_design".to_string()],
        }];

        HashMap::from([
            ("pm".to_string(), pm),
            ("architect".to_string(), architect),
            ("coder".to_string(), coder),
        ])
    }

    fn validator() -> RouteValidator {
        RouteValidator::new(roles(), GuardrailLimits::default())
    }

    fn request(group_id: &str, assigned_to: &str, task_type: &str) -> NewTask {
        NewTask {
            group_id: group_id.to_string(),
            title: "t".to_string(),
            task_type: task_type.to_string(),
            assigned_to: assigned_to.to_string(),
            ..NewTask::default()
        }
    }

    #[test]
    fn test_creator_role_parsing() {
        let v = validator();
        assert_eq!(v.creator_role("coder-1"), Some("coder"));
        assert_eq!(v.creator_role("architect-12"), Some("architect"));
        assert_eq!(v.creator_role("human"), None);
        assert_eq!(v.creator_role("no-suffix-x"), None);
    }

    #[tokio::test]
    async fn test_unknown_target_role() {
        let b = board().await;
        let err = validator()
            .validate(&b, &request("", "reviewer", "review"), "pm-1")
            .await
            .unwrap_err();
        assert!(matches!(err, BoardError::InvalidRole(_)));
    }

    #[tokio::test]
    async fn test_unaccepted_type() {
        let b = board().await;
        let err = validator()
            .validate(&b, &request("", "architect", "implementation"), "pm-1")
            .await
            .unwrap_err();
        assert!(matches!(err, BoardError::UnacceptedType { .. }));
    }

    #[tokio::test]
    async fn test_restricted_routing() {
        let b = board().await;
        let v = validator();

        // coder may route tech_design to architect.
        v.validate(&b, &request("", "architect", "tech_design"), "coder-1")
            .await
            .unwrap();

        // coder may not route work back to pm.
        let err = v
            .validate(&b, &request("", "pm", "goal"), "coder-1")
            .await
            .unwrap_err();
        assert!(matches!(err, BoardError::RouteForbidden { .. }));
    }

    #[tokio::test]
    async fn test_open_routing_skips_route_check() {
        let b = board().await;
        // pm is in open mode: any registered target that accepts the type.
        validator()
            .validate(&b, &request("", "architect", "tech_design"), "pm-1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_human_skips_route_checks_but_not_guardrails() {
        let b = board().await;
        // Routing would reject an unknown role, but humans bypass routing.
        validator()
            .validate(&b, &request("", "reviewer", "anything"), "human")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_group_full() {
        let b = board().await;
        let g = b.create_group("g", None, None).await.unwrap();
        for i in 0..2 {
            b.create_task(request(&g.id, "coder", "implementation").with_title(i))
                .await
                .unwrap();
        }

        let v = RouteValidator::new(
            roles(),
            GuardrailLimits {
                max_tasks_per_group: 2,
                ..GuardrailLimits::default()
            },
        );
        let err = v
            .validate(&b, &request(&g.id, "coder", "implementation"), "human")
            .await
            .unwrap_err();
        assert!(matches!(err, BoardError::GroupFull { .. }));
    }

    #[tokio::test]
    async fn test_depth_exceeded() {
        let b = board().await;
        let g = b.create_group("g", None, None).await.unwrap();
        let mut parent: Option<String> = None;
        for i in 0..3 {
            let task = b
                .create_task(NewTask {
                    parent_id: parent.clone(),
                    ..request(&g.id, "coder", "implementation").with_title(i)
                })
                .await
                .unwrap();
            parent = Some(task.id);
        }

        let v = RouteValidator::new(
            roles(),
            GuardrailLimits {
                max_task_depth: 3,
                max_tasks_per_group: 100,
                ..GuardrailLimits::default()
            },
        );
        let err = v
            .validate(
                &b,
                &NewTask {
                    parent_id: parent,
                    ..request(&g.id, "coder", "implementation")
                },
                "human",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BoardError::DepthExceeded { .. }));
    }

    #[tokio::test]
    async fn test_rejection_cycle_limit() {
        let b = board().await;
        let g = b.create_group("g", None, None).await.unwrap();
        let v = validator();

        let t0 = b
            .create_task(request(&g.id, "coder", "implementation"))
            .await
            .unwrap();
        let mut parent = t0.id;
        for i in 0..3 {
            let task = b
                .create_task(NewTask {
                    parent_id: Some(parent.clone()),
                    ..request(&g.id, "coder", "revision").with_title(i)
                })
                .await
                .unwrap();
            parent = task.id;
        }

        // T4 would be the fourth revision in the chain; limit is 3.
        let err = v
            .validate(
                &b,
                &NewTask {
                    parent_id: Some(parent),
                    ..request(&g.id, "coder", "revision")
                },
                "human",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BoardError::CycleLimit { count: 3 }));
    }

    impl NewTask {
        fn with_title(mut self, n: usize) -> Self {
            self.title = format!("t{n}");
            self.priority = TaskPriority::Medium;
            self
        }
    }
}
