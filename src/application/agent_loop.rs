//! Agent loop: the poll/claim/execute/complete cycle for one worker.
//!
//! One loop runs per agent instance. It owns no persistent state; task
//! ownership lives in the store and liveness is signalled through
//! heartbeats. The outer loop never dies: unexpected errors reset the
//! instance to idle and polling continues.

use crate::domain::errors::{BoardError, BoardResult};
use crate::domain::models::{BrewEvent, InstanceStatus, RoleConfig, Task, TaskUsage};
use crate::domain::ports::{Runner, RunnerRequest, Workspace, WorkspaceLease};
use crate::services::event_bus::EventBus;
use crate::services::instance_manager::InstanceManager;
use crate::services::prompt::PromptBuilder;
use crate::services::task_board::TaskBoard;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Maximum retry attempts after the initial execution.
pub const MAX_RETRIES: u32 = 3;
/// Base delay for the `base * 3^attempt` retry backoff.
pub const RETRY_BASE_DELAY_SECS: u64 = 5;
/// Heartbeat cadence while a task is executing.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 15;

/// Continuous worker loop for one agent instance.
pub struct AgentLoop {
    instance_id: String,
    role: RoleConfig,
    all_roles: HashMap<String, RoleConfig>,
    board: Arc<TaskBoard>,
    bus: Arc<EventBus>,
    instances: Arc<InstanceManager>,
    runner: Arc<dyn Runner>,
    workspace: Option<Arc<dyn Workspace>>,
    poll_interval: Duration,
    max_retries: u32,
    retry_base_delay: Duration,
    running: AtomicBool,
}

impl AgentLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance_id: impl Into<String>,
        role: RoleConfig,
        all_roles: HashMap<String, RoleConfig>,
        board: Arc<TaskBoard>,
        bus: Arc<EventBus>,
        instances: Arc<InstanceManager>,
        runner: Arc<dyn Runner>,
        workspace: Option<Arc<dyn Workspace>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            role,
            all_roles,
            board,
            bus,
            instances,
            runner,
            workspace,
            poll_interval,
            max_retries: MAX_RETRIES,
            retry_base_delay: Duration::from_secs(RETRY_BASE_DELAY_SECS),
            running: AtomicBool::new(false),
        }
    }

    /// Shrink retry timing (tests only need the schedule's shape).
    pub fn with_retry_timing(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base_delay = base_delay;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn role_name(&self) -> &str {
        &self.role.role
    }

    /// Signal the run loop to stop after the current iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Main continuous loop: poll, execute, heartbeat, repeat until stopped.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        if let Err(err) = self
            .instances
            .register_instance(&self.instance_id, &self.role.role)
            .await
        {
            error!(instance_id = %self.instance_id, error = %err, "Failed to register instance");
            return;
        }
        self.emit_status(InstanceStatus::Idle).await;
        info!(
            instance_id = %self.instance_id,
            poll_interval_secs = self.poll_interval.as_secs_f64(),
            "Agent started"
        );

        while self.running.load(Ordering::SeqCst) {
            match self.run_once().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.poll_interval).await,
                Err(err) => {
                    error!(
                        instance_id = %self.instance_id,
                        error = %err,
                        "Agent cycle crashed, recovering"
                    );
                    let _ = self
                        .instances
                        .update_status(&self.instance_id, InstanceStatus::Idle, None)
                        .await;
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
            let _ = self.instances.heartbeat(&self.instance_id).await;
        }

        let _ = self
            .instances
            .update_status(&self.instance_id, InstanceStatus::Stopped, None)
            .await;
        self.bus
            .emit(BrewEvent::AgentStopped {
                instance_id: self.instance_id.clone(),
            })
            .await;
    }

    /// One poll/claim/execute/complete cycle. Returns whether a task was
    /// processed.
    pub async fn run_once(&self) -> BoardResult<bool> {
        // Administrative pause short-circuits polling entirely.
        if self.instances.is_role_paused(&self.role.role) {
            let current = self.instances.get_instance(&self.instance_id).await?;
            if current.is_some_and(|i| i.status != InstanceStatus::Paused) {
                self.instances
                    .update_status(&self.instance_id, InstanceStatus::Paused, None)
                    .await?;
                self.emit_status(InstanceStatus::Paused).await;
            }
            return Ok(false);
        }

        // Resumed after a pause: back to idle before polling.
        let current = self.instances.get_instance(&self.instance_id).await?;
        if current.is_some_and(|i| i.status == InstanceStatus::Paused) {
            self.instances
                .update_status(&self.instance_id, InstanceStatus::Idle, None)
                .await?;
            self.emit_status(InstanceStatus::Idle).await;
        }

        let Some(task) = self
            .board
            .claim_task(&self.role.role, &self.instance_id)
            .await?
        else {
            return Ok(false);
        };

        let correlation_id = format!(
            "{}-{}",
            task.id,
            self.board.store().clock().unix_seconds()
        );
        info!(
            instance_id = %self.instance_id,
            task_id = %task.id,
            correlation_id = %correlation_id,
            title = %task.title,
            "Claimed task"
        );

        self.instances
            .update_status(&self.instance_id, InstanceStatus::Working, Some(&task.id))
            .await?;
        self.bus
            .emit(BrewEvent::TaskClaimed {
                task_id: task.id.clone(),
                claimed_by: self.instance_id.clone(),
                model: self.role.model.clone(),
                correlation_id: correlation_id.clone(),
            })
            .await;

        // Workspace creation happens once, outside the retry loop.
        let lease = match self.create_workspace(&task).await {
            Ok(lease) => lease,
            Err(err) => {
                error!(
                    instance_id = %self.instance_id,
                    task_id = %task.id,
                    error = %err,
                    "Workspace creation failed"
                );
                self.fail_with_event(&task, None, Some(err.to_string()), &correlation_id)
                    .await?;
                self.finish_cycle().await;
                return Ok(true);
            }
        };

        let heartbeat = self.spawn_heartbeat();
        let execution = self.execute_with_retry(&task, lease.as_ref(), &correlation_id).await;
        heartbeat.abort();

        match execution {
            ExecutionOutcome::Completed(output) => {
                info!(
                    instance_id = %self.instance_id,
                    task_id = %task.id,
                    correlation_id = %correlation_id,
                    "Task completed"
                );
                if let Err(err) = self.complete_and_handoff(&task, &output).await {
                    error!(task_id = %task.id, error = %err, "Completion failed");
                }
            }
            ExecutionOutcome::TimedOut => {
                // Handled inside execute_with_retry (fail + event), nothing
                // more to do here.
            }
            ExecutionOutcome::Failed(err) => {
                error!(
                    instance_id = %self.instance_id,
                    task_id = %task.id,
                    correlation_id = %correlation_id,
                    error = %err,
                    "Task failed"
                );
                self.fail_with_event(&task, None, Some(err), &correlation_id)
                    .await?;
            }
        }

        self.cleanup_workspace().await;
        self.finish_cycle().await;
        Ok(true)
    }

    async fn finish_cycle(&self) {
        let _ = self
            .instances
            .update_status(&self.instance_id, InstanceStatus::Idle, None)
            .await;
    }

    async fn emit_status(&self, status: InstanceStatus) {
        self.bus
            .emit(BrewEvent::AgentStatusChanged {
                instance_id: self.instance_id.clone(),
                role: self.role.role.clone(),
                status: status.as_str().to_string(),
            })
            .await;
    }

    async fn create_workspace(&self, task: &Task) -> BoardResult<Option<WorkspaceLease>> {
        let Some(ref workspace) = self.workspace else {
            return Ok(None);
        };
        let branch = format!("feat/{}", task.id.to_lowercase());
        let lease = workspace.create(&self.instance_id, &branch).await?;
        info!(
            instance_id = %self.instance_id,
            path = %lease.path,
            branch = %lease.branch,
            "Using isolated workspace"
        );
        Ok(Some(lease))
    }

    async fn cleanup_workspace(&self) {
        if let Some(ref workspace) = self.workspace {
            if let Err(err) = workspace.cleanup(&self.instance_id).await {
                warn!(
                    instance_id = %self.instance_id,
                    error = %err,
                    "Workspace cleanup failed"
                );
            }
        }
    }

    fn spawn_heartbeat(&self) -> tokio::task::JoinHandle<()> {
        let instances = self.instances.clone();
        let instance_id = self.instance_id.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
            ticker.tick().await; // first tick is immediate
            loop {
                ticker.tick().await;
                if let Err(err) = instances.heartbeat(&instance_id).await {
                    warn!(instance_id = %instance_id, error = %err, "Heartbeat failed");
                }
            }
        })
    }

    /// Execute with the role's per-task timeout and exponential backoff.
    /// Timeouts are terminal: the task is failed immediately with no retry.
    async fn execute_with_retry(
        &self,
        task: &Task,
        lease: Option<&WorkspaceLease>,
        correlation_id: &str,
    ) -> ExecutionOutcome {
        let task_timeout = Duration::from_secs(self.role.max_execution_time);
        let mut last_error = String::new();

        for attempt in 0..=self.max_retries {
            match timeout(task_timeout, self.execute_task(task, lease)).await {
                Ok(Ok(output)) => return ExecutionOutcome::Completed(output),
                Ok(Err(err)) => {
                    last_error = err.to_string();
                    if attempt < self.max_retries {
                        let delay = self.retry_base_delay * 3u32.pow(attempt);
                        warn!(
                            task_id = %task.id,
                            attempt = attempt + 1,
                            delay_secs = delay.as_secs_f64(),
                            error = %last_error,
                            "Task attempt failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(_) => {
                    error!(
                        task_id = %task.id,
                        timeout_secs = task_timeout.as_secs(),
                        "Task timed out"
                    );
                    if let Err(err) = self
                        .fail_with_event(
                            task,
                            Some("timeout".to_string()),
                            None,
                            correlation_id,
                        )
                        .await
                    {
                        error!(task_id = %task.id, error = %err, "Failed to record timeout");
                    }
                    return ExecutionOutcome::TimedOut;
                }
            }
        }

        ExecutionOutcome::Failed(last_error)
    }

    /// One runner invocation: build context, run, record usage.
    async fn execute_task(
        &self,
        task: &Task,
        lease: Option<&WorkspaceLease>,
    ) -> BoardResult<String> {
        let builder = PromptBuilder::new(&self.instance_id, &self.role, &self.all_roles);
        let mut context = builder.build(&self.board, task).await?;

        if let Some(lease) = lease {
            let _ = write!(
                context,
                "\n\n## Git Workspace\nYou are working in an isolated checkout on branch \
                 `{}`. Commit your changes directly to this branch — do NOT create new \
                 branches or switch branches.",
                lease.branch
            );
        }

        let result = self
            .runner
            .run(RunnerRequest {
                system_prompt: self.role.system_prompt.clone(),
                prompt: context,
                model: self.role.model.clone(),
                max_turns: self.role.max_turns,
                allowed_tools: self.role.tools.clone(),
                cwd: lease.map(|l| l.path.clone()),
            })
            .await
            .map_err(|e| BoardError::Execution(e.to_string()))?;

        if let Some(ref usage) = result.usage {
            let record = TaskUsage {
                task_id: task.id.clone(),
                agent_id: self.instance_id.clone(),
                model: self.role.model.clone().unwrap_or_default(),
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                cost_usd: usage.cost_usd,
                duration_api_ms: usage.duration_api_ms,
                num_turns: usage.num_turns,
                recorded_at: self.board.store().clock().now(),
            };
            if let Err(err) = self.board.store().record_task_usage(&record).await {
                warn!(task_id = %task.id, error = %err, "Usage recording failed");
            }
        }

        Ok(result.output)
    }

    /// Complete the task, store output, and emit the completion event.
    ///
    /// Checks for existing downstream tasks first so that a retried cycle
    /// does not duplicate handoffs; the completion itself always proceeds.
    async fn complete_and_handoff(&self, task: &Task, output: &str) -> BoardResult<()> {
        let children = self.board.get_task_children(&task.id).await?;
        if let Some(existing) = children
            .iter()
            .find(|t| t.status != crate::domain::models::TaskStatus::Cancelled)
        {
            warn!(
                task_id = %task.id,
                existing = %existing.id,
                "Downstream task already exists; completing without new handoff"
            );
        }

        self.board
            .complete_task_with_output(&task.id, output)
            .await?;
        self.bus
            .emit(BrewEvent::TaskCompleted {
                task_id: task.id.clone(),
                group_id: task.group_id.clone(),
                agent_id: self.instance_id.clone(),
                model: self.role.model.clone(),
            })
            .await;
        Ok(())
    }

    async fn fail_with_event(
        &self,
        task: &Task,
        reason: Option<String>,
        error_message: Option<String>,
        correlation_id: &str,
    ) -> BoardResult<()> {
        self.board.fail_task(&task.id).await?;
        self.bus
            .emit(BrewEvent::TaskFailed {
                task_id: task.id.clone(),
                instance_id: Some(self.instance_id.clone()),
                reason,
                error: error_message,
                correlation_id: Some(correlation_id.to_string()),
            })
            .await;
        Ok(())
    }
}

enum ExecutionOutcome {
    Completed(String),
    TimedOut,
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::runners::{MockOutcome, MockRunner};
    use crate::adapters::sqlite::connection::create_test_pool;
    use crate::adapters::sqlite::Store;
    use crate::domain::models::TaskStatus;
    use crate::domain::ports::clock::system_clock;
    use crate::services::event_bus::EventBusConfig;
    use crate::services::task_board::NewTask;

    struct Fixture {
        board: Arc<TaskBoard>,
        bus: Arc<EventBus>,
        instances: Arc<InstanceManager>,
    }

    async fn fixture() -> Fixture {
        let pool = create_test_pool().await.unwrap();
        let store = Store::from_pool(pool, system_clock());
        store.migrate().await.unwrap();
        let board = Arc::new(TaskBoard::new(store.clone()));
        board
            .register_prefixes(HashMap::from([("coder".to_string(), "CD".to_string())]))
            .await
            .unwrap();
        let bus = Arc::new(EventBus::new(
            EventBusConfig {
                persist_events: false,
                ..EventBusConfig::default()
            },
            system_clock(),
        ));
        let instances = Arc::new(InstanceManager::new(store));
        Fixture {
            board,
            bus,
            instances,
        }
    }

    fn coder_role() -> RoleConfig {
        let mut role = RoleConfig::new("coder", "CD");
        role.accepts = vec!["implementation".to_string()];
        role.max_execution_time = 5;
        role
    }

    fn agent(fx: &Fixture, runner: Arc<dyn Runner>) -> AgentLoop {
        AgentLoop::new(
            "coder-1",
            coder_role(),
            HashMap::from([("coder".to_string(), coder_role())]),
            fx.board.clone(),
            fx.bus.clone(),
            fx.instances.clone(),
            runner,
            None,
            Duration::from_millis(10),
        )
        .with_retry_timing(2, Duration::from_millis(5))
    }

    async fn seed_task(fx: &Fixture, title: &str) -> Task {
        let group = fx.board.create_group("g", None, None).await.unwrap();
        fx.board
            .create_task(NewTask {
                group_id: group.id,
                title: title.to_string(),
                task_type: "implementation".to_string(),
                assigned_to: "coder".to_string(),
                ..NewTask::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_run_once_without_tasks() {
        let fx = fixture().await;
        let agent = agent(&fx, Arc::new(MockRunner::always("ok")));
        fx.instances
            .register_instance("coder-1", "coder")
            .await
            .unwrap();
        assert!(!agent.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn test_successful_cycle_completes_task() {
        let fx = fixture().await;
        let task = seed_task(&fx, "build").await;
        let agent = agent(&fx, Arc::new(MockRunner::always("done!")));
        fx.instances
            .register_instance("coder-1", "coder")
            .await
            .unwrap();
        let mut rx = fx.bus.subscribe();

        assert!(agent.run_once().await.unwrap());

        let done = fx.board.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.output_text.as_deref(), Some("done!"));

        // Usage was recorded from the runner result.
        let summary = fx
            .board
            .store()
            .usage_summary("2000-01-01T00:00:00Z")
            .await
            .unwrap();
        assert_eq!(summary.tasks_completed, 1);

        // Events: claimed then completed.
        let claimed = rx.recv().await.unwrap();
        assert_eq!(claimed.event.kind(), "task.claimed");
        let completed = rx.recv().await.unwrap();
        assert_eq!(completed.event.kind(), "task.completed");

        // Instance is idle again.
        let inst = fx.instances.get_instance("coder-1").await.unwrap().unwrap();
        assert_eq!(inst.status, InstanceStatus::Idle);
        assert!(inst.current_task.is_none());
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let fx = fixture().await;
        let task = seed_task(&fx, "flaky").await;
        let runner = Arc::new(MockRunner::new(vec![
            MockOutcome::Error("transient".into()),
            MockOutcome::Success("recovered".into()),
        ]));
        let agent = agent(&fx, runner.clone());
        fx.instances
            .register_instance("coder-1", "coder")
            .await
            .unwrap();

        assert!(agent.run_once().await.unwrap());
        assert_eq!(runner.call_count(), 2);
        let done = fx.board.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_task() {
        let fx = fixture().await;
        let task = seed_task(&fx, "broken").await;
        let runner = Arc::new(MockRunner::new(vec![MockOutcome::Error("boom".into())]));
        let agent = agent(&fx, runner.clone());
        fx.instances
            .register_instance("coder-1", "coder")
            .await
            .unwrap();
        let mut rx = fx.bus.subscribe();

        assert!(agent.run_once().await.unwrap());
        // Initial attempt + 2 retries.
        assert_eq!(runner.call_count(), 3);

        let failed = fx.board.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);

        let _claimed = rx.recv().await.unwrap();
        let failure = rx.recv().await.unwrap();
        assert_eq!(failure.event.kind(), "task.failed");
        assert_eq!(failure.event.data()["error"], "Execution failed: boom");
    }

    #[tokio::test]
    async fn test_timeout_is_terminal_no_retry() {
        let fx = fixture().await;
        let task = seed_task(&fx, "slow").await;
        let runner = Arc::new(MockRunner::new(vec![MockOutcome::Slow(
            Duration::from_secs(10),
            "too late".into(),
        )]));
        let mut role = coder_role();
        role.max_execution_time = 1; // seconds

        let agent = AgentLoop::new(
            "coder-1",
            role.clone(),
            HashMap::from([("coder".to_string(), role)]),
            fx.board.clone(),
            fx.bus.clone(),
            fx.instances.clone(),
            runner.clone(),
            None,
            Duration::from_millis(10),
        )
        .with_retry_timing(3, Duration::from_millis(5));
        fx.instances
            .register_instance("coder-1", "coder")
            .await
            .unwrap();
        let mut rx = fx.bus.subscribe();

        assert!(agent.run_once().await.unwrap());
        // Exactly one attempt: timeouts never retry.
        assert_eq!(runner.call_count(), 1);

        let failed = fx.board.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);

        let _claimed = rx.recv().await.unwrap();
        let failure = rx.recv().await.unwrap();
        assert_eq!(failure.event.kind(), "task.failed");
        assert_eq!(failure.event.data()["reason"], "timeout");
    }

    #[tokio::test]
    async fn test_paused_role_skips_polling() {
        let fx = fixture().await;
        seed_task(&fx, "waiting").await;
        let runner = Arc::new(MockRunner::always("nope"));
        let agent = agent(&fx, runner.clone());
        fx.instances
            .register_instance("coder-1", "coder")
            .await
            .unwrap();

        fx.instances.pause_role("coder");
        assert!(!agent.run_once().await.unwrap());
        assert_eq!(runner.call_count(), 0);
        let inst = fx.instances.get_instance("coder-1").await.unwrap().unwrap();
        assert_eq!(inst.status, InstanceStatus::Paused);

        // Resume: the next cycle claims and executes.
        fx.instances.resume_role("coder");
        assert!(agent.run_once().await.unwrap());
        assert_eq!(runner.call_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_flag_ends_run() {
        let fx = fixture().await;
        let agent = Arc::new(agent(&fx, Arc::new(MockRunner::always("ok"))));
        let handle = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.run().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(agent.is_running());
        agent.stop();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop should stop promptly")
            .unwrap();

        let inst = fx.instances.get_instance("coder-1").await.unwrap().unwrap();
        assert_eq!(inst.status, InstanceStatus::Stopped);
    }
}
