//! Orchestrator supervisor: constructs the component graph, runs startup
//! recovery, owns the agent loops and background tasks, and performs
//! graceful shutdown.

use crate::adapters::sqlite::Store;
use crate::domain::errors::{BoardError, BoardResult};
use crate::domain::models::{
    BrewEvent, Group, InstanceStatus, RoleConfig, Task, TaskPriority, TeamConfig,
};
use crate::domain::ports::{Clock, Runner, Workspace};
use crate::services::auto_scaler::{AgentPool, AutoScaler};
use crate::services::event_bus::{EventBus, EventBusConfig};
use crate::services::instance_manager::{InstanceManager, DEFAULT_STALE_TIMEOUT_SECS};
use crate::services::routing::RouteValidator;
use crate::services::task_board::{NewTask, TaskBoard};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Cadence of the background orphan-recovery loop.
pub const RECOVERY_INTERVAL_SECS: u64 = 30;
/// Drain window before in-flight agent tasks are force-cancelled.
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 30;

struct AgentHandle {
    agent: Arc<crate::application::agent_loop::AgentLoop>,
    task: JoinHandle<()>,
}

/// Central container owning every orchestration component.
pub struct Orchestrator {
    team: TeamConfig,
    roles: HashMap<String, RoleConfig>,
    store: Store,
    board: Arc<TaskBoard>,
    bus: Arc<EventBus>,
    instances: Arc<InstanceManager>,
    validator: Arc<RouteValidator>,
    runner: Arc<dyn Runner>,
    workspace: Option<Arc<dyn Workspace>>,
    agents: Mutex<HashMap<String, AgentHandle>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    scaler: Mutex<Option<Arc<AutoScaler>>>,
    shutting_down: AtomicBool,
}

impl Orchestrator {
    /// Build the component graph from validated configuration: open the
    /// store (running migrations), wire the bus, board, instance manager,
    /// and route validator. Fatal on any store error.
    pub async fn build(
        team: TeamConfig,
        roles: HashMap<String, RoleConfig>,
        runner: Arc<dyn Runner>,
        workspace: Option<Arc<dyn Workspace>>,
        clock: Arc<dyn Clock>,
    ) -> BoardResult<Arc<Self>> {
        let store = Store::open(&team.db_path, clock.clone()).await?;
        Self::assemble(team, roles, runner, workspace, store, clock)
    }

    /// Assemble over an existing store (tests use in-memory pools).
    pub fn assemble(
        team: TeamConfig,
        roles: HashMap<String, RoleConfig>,
        runner: Arc<dyn Runner>,
        workspace: Option<Arc<dyn Workspace>>,
        store: Store,
        clock: Arc<dyn Clock>,
    ) -> BoardResult<Arc<Self>> {
        let bus = Arc::new(
            EventBus::new(EventBusConfig::default(), clock).with_store(store.clone()),
        );
        let board = Arc::new(TaskBoard::new(store.clone()));

        let group_prefixes: HashMap<String, String> = roles
            .iter()
            .filter(|(_, role)| role.can_create_groups)
            .filter_map(|(name, role)| {
                role.group_type
                    .as_ref()
                    .map(|prefix| (name.clone(), prefix.clone()))
            })
            .collect();
        board.set_group_prefixes(group_prefixes);

        let validator = Arc::new(RouteValidator::new(roles.clone(), team.guardrails));
        let instances = Arc::new(InstanceManager::new(store.clone()));

        Ok(Arc::new(Self {
            team,
            roles,
            store,
            board,
            bus,
            instances,
            validator,
            runner,
            workspace,
            agents: Mutex::new(HashMap::new()),
            background: Mutex::new(Vec::new()),
            scaler: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        }))
    }

    // -- Accessors ------------------------------------------------------

    pub fn team(&self) -> &TeamConfig {
        &self.team
    }

    pub fn roles(&self) -> &HashMap<String, RoleConfig> {
        &self.roles
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn board(&self) -> &Arc<TaskBoard> {
        &self.board
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn instances(&self) -> &Arc<InstanceManager> {
        &self.instances
    }

    pub fn validator(&self) -> &Arc<RouteValidator> {
        &self.validator
    }

    pub fn shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn agent_count(&self) -> usize {
        self.agents.lock().unwrap().len()
    }

    // -- Startup --------------------------------------------------------

    /// Start the orchestrator: register prefixes, recover state, spawn one
    /// agent loop per configured instance, and start the background
    /// recovery loop and (if enabled anywhere) the auto-scaler.
    pub async fn start(self: &Arc<Self>) -> BoardResult<()> {
        let role_prefixes: HashMap<String, String> = self
            .roles
            .iter()
            .map(|(name, role)| (name.clone(), role.prefix.clone()))
            .collect();
        self.board.register_prefixes(role_prefixes).await?;

        // Startup recovery: every in_progress task is an orphan because all
        // agents are new in this process.
        let orphaned = self.board.recover_orphaned_tasks().await?;
        if !orphaned.is_empty() {
            info!(count = orphaned.len(), "Recovered orphaned in_progress tasks");
            for task in &orphaned {
                self.bus
                    .emit(BrewEvent::TaskRecovered {
                        task_id: task.id.clone(),
                    })
                    .await;
            }
        }

        let stuck = self.board.recover_stuck_blocked_tasks().await?;
        if !stuck.is_empty() {
            info!(count = stuck.len(), "Recovered stuck blocked tasks");
            for task in &stuck {
                self.bus
                    .emit(BrewEvent::TaskRecovered {
                        task_id: task.id.clone(),
                    })
                    .await;
            }
        }

        self.spawn_recovery_loop();

        // One loop per configured instance, named "{role}-{i}".
        let roles: Vec<RoleConfig> = self.roles.values().cloned().collect();
        for role in roles {
            for i in 1..=role.max_instances {
                let instance_id = format!("{}-{i}", role.role);
                self.spawn_agent(&instance_id, role.clone());
            }
        }

        if self
            .roles
            .values()
            .any(|r| r.auto_scale.is_some_and(|a| a.enabled))
        {
            let pool: Arc<dyn AgentPool> = self.clone();
            let scaler = Arc::new(AutoScaler::new(
                self.board.clone(),
                self.instances.clone(),
                self.roles.clone(),
                pool,
                self.store.clock().clone(),
            ));
            let handle = {
                let scaler = scaler.clone();
                tokio::spawn(async move { scaler.run().await })
            };
            self.background.lock().unwrap().push(handle);
            *self.scaler.lock().unwrap() = Some(scaler);
            info!("Auto-scaler started");
        }

        info!(agents = self.agent_count(), "Orchestrator started");
        Ok(())
    }

    fn spawn_agent(self: &Arc<Self>, instance_id: &str, role: RoleConfig) {
        let workspace = if role.needs_workspace() {
            self.workspace.clone()
        } else {
            None
        };
        let agent = Arc::new(crate::application::agent_loop::AgentLoop::new(
            instance_id,
            role,
            self.roles.clone(),
            self.board.clone(),
            self.bus.clone(),
            self.instances.clone(),
            self.runner.clone(),
            workspace,
            Duration::from_secs_f64(self.team.default_poll_interval),
        ));
        let task = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.run().await })
        };
        self.agents
            .lock()
            .unwrap()
            .insert(instance_id.to_string(), AgentHandle { agent, task });
    }

    /// Background loop reclaiming work from dead agents and repairing
    /// missed dependency resolutions.
    fn spawn_recovery_loop(self: &Arc<Self>) {
        let orch = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(RECOVERY_INTERVAL_SECS)).await;
                let Some(orch) = orch.upgrade() else { break };
                if orch.shutting_down() {
                    break;
                }
                if let Err(err) = orch.recovery_pass().await {
                    error!(error = %err, "Orphan recovery pass failed");
                }
            }
        });
        self.background.lock().unwrap().push(handle);
    }

    /// One pass of the recovery loop. Public so tests can drive it without
    /// waiting for the interval.
    pub async fn recovery_pass(&self) -> BoardResult<()> {
        // 1. Reclaim tasks held by instances with stale heartbeats.
        let stale = self
            .instances
            .get_stale_instances(DEFAULT_STALE_TIMEOUT_SECS)
            .await?;
        if !stale.is_empty() {
            let stale_ids: Vec<String> =
                stale.iter().map(|i| i.instance_id.clone()).collect();
            warn!(?stale_ids, "Detected stale agent instances");
            let recovered = self
                .board
                .recover_stale_in_progress_tasks(&stale_ids)
                .await?;
            for task in &recovered {
                info!(task_id = %task.id, "Reclaimed task from stale instance");
                self.bus
                    .emit(BrewEvent::TaskRecovered {
                        task_id: task.id.clone(),
                    })
                    .await;
            }
            for instance_id in &stale_ids {
                self.instances
                    .update_status(instance_id, InstanceStatus::Idle, None)
                    .await?;
            }
        }

        // 2. Repair blocked tasks whose blockers are all terminal.
        let stuck = self.board.recover_stuck_blocked_tasks().await?;
        for task in &stuck {
            self.bus
                .emit(BrewEvent::TaskRecovered {
                    task_id: task.id.clone(),
                })
                .await;
        }

        Ok(())
    }

    // -- Goal submission ------------------------------------------------

    /// Create a group and its seed PM task for a new goal.
    pub async fn submit_goal(
        &self,
        title: &str,
        description: &str,
    ) -> BoardResult<(Group, Task)> {
        let group = self
            .board
            .create_group(title, Some("pm"), Some("pm"))
            .await?;
        let task = self
            .board
            .create_task(NewTask {
                group_id: group.id.clone(),
                title: format!("Create PRD: {title}"),
                description: if description.is_empty() {
                    None
                } else {
                    Some(description.to_string())
                },
                task_type: "goal".to_string(),
                assigned_to: "pm".to_string(),
                created_by: Some("human".to_string()),
                priority: TaskPriority::High,
                ..NewTask::default()
            })
            .await?;

        self.bus
            .emit(BrewEvent::GroupCreated {
                group_id: group.id.clone(),
                title: title.to_string(),
            })
            .await;
        self.bus
            .emit(BrewEvent::TaskCreated {
                task_id: task.id.clone(),
                group_id: Some(group.id.clone()),
            })
            .await;

        Ok((group, task))
    }

    // -- Shutdown -------------------------------------------------------

    /// Graceful shutdown. Idempotent.
    ///
    /// Phase 1 signals every agent loop to stop; phase 2 waits up to
    /// `timeout` for them to drain and force-cancels stragglers; phase 3
    /// cleans up workspaces best-effort; phase 4 closes the store. Tasks
    /// force-cancelled here stay `in_progress` and are recovered as orphans
    /// on next startup.
    pub async fn shutdown(&self, timeout: Duration) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Graceful shutdown initiated");

        // Phase 1 — signal loops and background tasks.
        if let Some(scaler) = self.scaler.lock().unwrap().take() {
            scaler.stop();
        }
        let handles: Vec<(String, AgentHandle)> =
            self.agents.lock().unwrap().drain().collect();
        for (_, handle) in &handles {
            handle.agent.stop();
        }
        let background: Vec<JoinHandle<()>> =
            self.background.lock().unwrap().drain(..).collect();
        for handle in &background {
            handle.abort();
        }

        // Phase 2 — wait for agent tasks, force-cancel stragglers.
        if !handles.is_empty() {
            info!(count = handles.len(), "Waiting for agent tasks to drain");
            let deadline = tokio::time::Instant::now() + timeout;
            for (instance_id, mut handle) in handles {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                match tokio::time::timeout(remaining, &mut handle.task).await {
                    Ok(_) => {}
                    Err(_) => {
                        warn!(instance_id = %instance_id, "Force-cancelling agent task");
                        handle.task.abort();
                    }
                }
            }
        }

        // Phase 3 — workspace cleanup, best-effort.
        if let Some(ref workspace) = self.workspace {
            if let Err(err) = workspace.cleanup_all().await {
                error!(error = %err, "Workspace cleanup failed during shutdown");
            }
        }

        // Phase 4 — close the store.
        self.store.close().await;
        info!("Shutdown complete");
    }
}

#[async_trait]
impl AgentPool for Orchestrator {
    async fn spawn_instance(&self, instance_id: &str, role: &str) -> BoardResult<()> {
        let role_config = self
            .roles
            .get(role)
            .cloned()
            .ok_or_else(|| BoardError::InvalidRole(role.to_string()))?;

        let workspace = if role_config.needs_workspace() {
            self.workspace.clone()
        } else {
            None
        };
        let agent = Arc::new(crate::application::agent_loop::AgentLoop::new(
            instance_id,
            role_config,
            self.roles.clone(),
            self.board.clone(),
            self.bus.clone(),
            self.instances.clone(),
            self.runner.clone(),
            workspace,
            Duration::from_secs_f64(self.team.default_poll_interval),
        ));
        let task = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.run().await })
        };
        self.agents
            .lock()
            .unwrap()
            .insert(instance_id.to_string(), AgentHandle { agent, task });
        Ok(())
    }

    async fn stop_instance(&self, instance_id: &str) -> BoardResult<()> {
        let handle = self.agents.lock().unwrap().remove(instance_id);
        if let Some(handle) = handle {
            handle.agent.stop();
            handle.task.abort();
        }
        self.instances.remove_instance(instance_id).await?;
        Ok(())
    }
}
