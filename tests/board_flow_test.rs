//! End-to-end task graph scenarios: goal intake through the role chain,
//! dependency propagation, cycle rejection, cascade failure, and the
//! rejection-cycle guardrail.

use std::collections::HashMap;
use std::sync::Arc;
use taskbrew::adapters::runners::MockRunner;
use taskbrew::adapters::sqlite::{create_test_pool, Store};
use taskbrew::domain::errors::BoardError;
use taskbrew::domain::models::config::{RouteTarget, RoutingMode};
use taskbrew::domain::models::{GroupStatus, RoleConfig, TaskPriority, TaskStatus, TeamConfig};
use taskbrew::domain::ports::clock::system_clock;
use taskbrew::services::task_board::NewTask;
use taskbrew::Orchestrator;

fn team_roles() -> HashMap<String, RoleConfig> {
    let mut pm = RoleConfig::new("pm", "PM");
    pm.display_name = "Project Manager".to_string();
    pm.accepts = vec!["goal".to_string()];
    pm.can_create_groups = true;
    pm.group_type = Some("FEAT".to_string());
    pm.routing_mode = RoutingMode::Restricted;
    pm.routes_to = vec![RouteTarget {
        role: "architect".to_string(),
        task_types: vec!["tech_design".to_string()],
    }];

    let mut architect = RoleConfig::new("architect", "AR");
    architect.accepts = vec!["tech_design".to_string()];
    architect.routing_mode = RoutingMode::Restricted;
    architect.routes_to = vec![RouteTarget {
        role: "coder".to_string(),
        task_types: vec!["implementation".to_string()],
    }];

    let mut coder = RoleConfig::new("coder", "CD");
    coder.accepts = vec![
        "implementation".to_string(),
        "revision".to_string(),
        "bug_fix".to_string(),
    ];

    HashMap::from([
        ("pm".to_string(), pm),
        ("architect".to_string(), architect),
        ("coder".to_string(), coder),
    ])
}

async fn orchestrator() -> Arc<Orchestrator> {
    let pool = create_test_pool().await.unwrap();
    let clock = system_clock();
    let store = Store::from_pool(pool, clock.clone());
    store.migrate().await.unwrap();

    let orch = Orchestrator::assemble(
        TeamConfig::default(),
        team_roles(),
        Arc::new(MockRunner::always("done")),
        None,
        store,
        clock,
    )
    .unwrap();

    let prefixes: HashMap<String, String> = orch
        .roles()
        .iter()
        .map(|(name, role)| (name.clone(), role.prefix.clone()))
        .collect();
    orch.board().register_prefixes(prefixes).await.unwrap();
    orch
}

/// A validated cross-role creation, as the task-creation API performs it.
async fn create_routed(
    orch: &Arc<Orchestrator>,
    new: NewTask,
    assigned_by: &str,
) -> Result<taskbrew::domain::models::Task, BoardError> {
    orch.validator()
        .validate(orch.board(), &new, assigned_by)
        .await?;
    orch.board().create_task(new).await
}

#[tokio::test]
async fn full_happy_path_through_role_chain() {
    let orch = orchestrator().await;
    let board = orch.board();

    // Goal intake: group FEAT-001 plus the PM seed task.
    let (group, pm_task) = orch.submit_goal("Add login", "").await.unwrap();
    assert_eq!(group.id, "FEAT-001");
    assert_eq!(pm_task.id, "PM-001");

    // PM claims its task and produces the architect handoff.
    let claimed = board.claim_task("pm", "pm-1").await.unwrap().unwrap();
    assert_eq!(claimed.id, pm_task.id);
    let ar_task = create_routed(
        &orch,
        NewTask {
            group_id: group.id.clone(),
            title: "Design login flow".to_string(),
            task_type: "tech_design".to_string(),
            assigned_to: "architect".to_string(),
            created_by: Some("pm-1".to_string()),
            parent_id: Some(pm_task.id.clone()),
            ..NewTask::default()
        },
        "pm-1",
    )
    .await
    .unwrap();
    assert_eq!(ar_task.id, "AR-001");
    board.complete_task(&pm_task.id).await.unwrap();

    // Architect claims and hands off to the coder.
    board.claim_task("architect", "architect-1").await.unwrap().unwrap();
    let cd_task = create_routed(
        &orch,
        NewTask {
            group_id: group.id.clone(),
            title: "Implement login".to_string(),
            task_type: "implementation".to_string(),
            assigned_to: "coder".to_string(),
            created_by: Some("architect-1".to_string()),
            parent_id: Some(ar_task.id.clone()),
            ..NewTask::default()
        },
        "architect-1",
    )
    .await
    .unwrap();
    assert_eq!(cd_task.id, "CD-001");
    board.complete_task(&ar_task.id).await.unwrap();

    // Coder finishes; the whole group closes.
    board.claim_task("coder", "coder-1").await.unwrap().unwrap();
    board
        .complete_task_with_output(&cd_task.id, "implemented")
        .await
        .unwrap();

    for id in [pm_task.id, ar_task.id, cd_task.id] {
        let task = board.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed, "{id} should be completed");
    }
    let group = board.get_group(&group.id).await.unwrap().unwrap();
    assert_eq!(group.status, GroupStatus::Completed);
}

#[tokio::test]
async fn dependency_propagation() {
    let orch = orchestrator().await;
    let board = orch.board();
    let group = board.create_group("g", None, Some("pm")).await.unwrap();

    let a = board
        .create_task(NewTask {
            group_id: group.id.clone(),
            title: "A".to_string(),
            task_type: "implementation".to_string(),
            assigned_to: "coder".to_string(),
            ..NewTask::default()
        })
        .await
        .unwrap();
    let b = board
        .create_task(NewTask {
            group_id: group.id.clone(),
            title: "B".to_string(),
            task_type: "implementation".to_string(),
            assigned_to: "coder".to_string(),
            blocked_by: vec![a.id.clone()],
            ..NewTask::default()
        })
        .await
        .unwrap();
    assert_eq!(a.status, TaskStatus::Pending);
    assert_eq!(b.status, TaskStatus::Blocked);

    // B is invisible to claims while blocked.
    let claimed = board.claim_task("coder", "coder-1").await.unwrap().unwrap();
    assert_eq!(claimed.id, a.id);
    board.complete_task(&a.id).await.unwrap();

    // Completing A unblocks B; a worker then takes it through to done.
    let b_now = board.get_task(&b.id).await.unwrap().unwrap();
    assert_eq!(b_now.status, TaskStatus::Pending);
    let claimed = board.claim_task("coder", "coder-1").await.unwrap().unwrap();
    assert_eq!(claimed.id, b.id);
    assert_eq!(claimed.status, TaskStatus::InProgress);
    board.complete_task(&b.id).await.unwrap();
}

#[tokio::test]
async fn cycle_detection_rejects_and_inserts_nothing() {
    let orch = orchestrator().await;
    let board = orch.board();
    let group = board.create_group("g", None, Some("pm")).await.unwrap();

    let a = board
        .create_task(NewTask {
            group_id: group.id.clone(),
            title: "A".to_string(),
            task_type: "implementation".to_string(),
            assigned_to: "coder".to_string(),
            ..NewTask::default()
        })
        .await
        .unwrap();
    let b = board
        .create_task(NewTask {
            group_id: group.id.clone(),
            title: "B".to_string(),
            task_type: "implementation".to_string(),
            assigned_to: "coder".to_string(),
            blocked_by: vec![a.id.clone()],
            ..NewTask::default()
        })
        .await
        .unwrap();

    // The edge A ← B exists, so A blocked-by B would close a cycle.
    assert!(board.has_cycle(&a.id, &b.id).await.unwrap());
    // And transitively through a longer chain.
    let c = board
        .create_task(NewTask {
            group_id: group.id.clone(),
            title: "C".to_string(),
            task_type: "implementation".to_string(),
            assigned_to: "coder".to_string(),
            blocked_by: vec![b.id.clone()],
            ..NewTask::default()
        })
        .await
        .unwrap();
    assert!(board.has_cycle(&a.id, &c.id).await.unwrap());
}

#[tokio::test]
async fn cascade_failure_through_chain() {
    let orch = orchestrator().await;
    let board = orch.board();
    let group = board.create_group("g", None, Some("pm")).await.unwrap();

    let mk = |title: &str, blocked_by: Vec<String>| NewTask {
        group_id: group.id.clone(),
        title: title.to_string(),
        task_type: "implementation".to_string(),
        assigned_to: "coder".to_string(),
        blocked_by,
        ..NewTask::default()
    };
    let a = board.create_task(mk("A", vec![])).await.unwrap();
    let b = board.create_task(mk("B", vec![a.id.clone()])).await.unwrap();
    let c = board.create_task(mk("C", vec![b.id.clone()])).await.unwrap();

    board.claim_task("coder", "coder-1").await.unwrap().unwrap();
    board.fail_task(&a.id).await.unwrap();

    assert_eq!(
        board.get_task(&b.id).await.unwrap().unwrap().status,
        TaskStatus::Failed
    );
    assert_eq!(
        board.get_task(&c.id).await.unwrap().unwrap().status,
        TaskStatus::Failed
    );

    // Every terminal member fails the group closed.
    let group = board.get_group(&group.id).await.unwrap().unwrap();
    assert_eq!(group.status, GroupStatus::Completed);
}

#[tokio::test]
async fn rejection_cycle_cap_blocks_fourth_revision() {
    let orch = orchestrator().await;
    let board = orch.board();
    let group = board.create_group("g", None, Some("pm")).await.unwrap();

    let t0 = board
        .create_task(NewTask {
            group_id: group.id.clone(),
            title: "T0".to_string(),
            task_type: "implementation".to_string(),
            assigned_to: "coder".to_string(),
            ..NewTask::default()
        })
        .await
        .unwrap();

    let mut parent = t0.id;
    for i in 1..=3 {
        let revision = create_routed(
            &orch,
            NewTask {
                group_id: group.id.clone(),
                title: format!("T{i}"),
                task_type: "revision".to_string(),
                assigned_to: "coder".to_string(),
                parent_id: Some(parent.clone()),
                priority: TaskPriority::Medium,
                ..NewTask::default()
            },
            "human",
        )
        .await
        .unwrap();
        parent = revision.id;
    }

    // T4 exceeds rejection_cycle_limit = 3.
    let err = create_routed(
        &orch,
        NewTask {
            group_id: group.id.clone(),
            title: "T4".to_string(),
            task_type: "revision".to_string(),
            assigned_to: "coder".to_string(),
            parent_id: Some(parent),
            ..NewTask::default()
        },
        "human",
    )
    .await
    .unwrap_err();
    assert!(matches!(err, BoardError::CycleLimit { count: 3 }));
}

#[tokio::test]
async fn restricted_routing_enforced_between_roles() {
    let orch = orchestrator().await;
    let board = orch.board();
    let group = board.create_group("g", None, Some("pm")).await.unwrap();

    // Architect may not route implementation work to pm.
    let err = create_routed(
        &orch,
        NewTask {
            group_id: group.id.clone(),
            title: "sneaky".to_string(),
            task_type: "goal".to_string(),
            assigned_to: "pm".to_string(),
            ..NewTask::default()
        },
        "architect-1",
    )
    .await
    .unwrap_err();
    assert!(matches!(err, BoardError::RouteForbidden { .. }));

    // Unknown target role is rejected outright.
    let err = create_routed(
        &orch,
        NewTask {
            group_id: group.id.clone(),
            title: "lost".to_string(),
            task_type: "anything".to_string(),
            assigned_to: "reviewer".to_string(),
            ..NewTask::default()
        },
        "pm-1",
    )
    .await
    .unwrap_err();
    assert!(matches!(err, BoardError::InvalidRole(_)));
}

#[tokio::test]
async fn concurrent_claims_take_distinct_tasks() {
    let orch = orchestrator().await;
    let board = orch.board();
    let group = board.create_group("g", None, Some("pm")).await.unwrap();

    for i in 0..4 {
        board
            .create_task(NewTask {
                group_id: group.id.clone(),
                title: format!("t{i}"),
                task_type: "implementation".to_string(),
                assigned_to: "coder".to_string(),
                ..NewTask::default()
            })
            .await
            .unwrap();
    }

    // Issue many claims from different instances; each task must be handed
    // to exactly one claimant.
    let mut claimed_ids = Vec::new();
    for i in 0..6 {
        if let Some(task) = board
            .claim_task("coder", &format!("coder-{i}"))
            .await
            .unwrap()
        {
            claimed_ids.push(task.id);
        }
    }
    claimed_ids.sort();
    claimed_ids.dedup();
    assert_eq!(claimed_ids.len(), 4, "each task claimed exactly once");
}
