//! Auto-scaler: adjusts per-role worker counts to queue depth.
//!
//! Scale-up spawns an extra agent loop when the pending backlog per idle
//! agent exceeds the role's threshold; scale-down retires auto-spawned
//! instances that have sat idle past the configured window. The scaler only
//! decides; spawning and stopping go through the injected [`AgentPool`].

use crate::domain::errors::BoardResult;
use crate::domain::models::{InstanceStatus, RoleConfig};
use crate::domain::ports::Clock;
use crate::services::instance_manager::InstanceManager;
use crate::services::task_board::TaskBoard;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Default decision cadence.
pub const SCALE_INTERVAL_SECS: u64 = 30;

/// Spawns and stops agent loops on the scaler's behalf. Implemented by the
/// orchestrator, which owns the loop handles.
#[async_trait]
pub trait AgentPool: Send + Sync {
    async fn spawn_instance(&self, instance_id: &str, role: &str) -> BoardResult<()>;

    /// Stop the loop, cancel its task, and remove it from the registry.
    async fn stop_instance(&self, instance_id: &str) -> BoardResult<()>;
}

struct SpawnedState {
    role: String,
    idle_since: Option<DateTime<Utc>>,
}

/// Periodic scaling loop over all auto-scaling roles.
pub struct AutoScaler {
    board: Arc<TaskBoard>,
    instances: Arc<InstanceManager>,
    roles: HashMap<String, RoleConfig>,
    pool: Arc<dyn AgentPool>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    /// Instances this scaler spawned, with idle tracking for scale-down.
    spawned: Mutex<HashMap<String, SpawnedState>>,
    /// Next instance index per role (continues past the base pool).
    next_index: Mutex<HashMap<String, usize>>,
    running: AtomicBool,
}

impl AutoScaler {
    pub fn new(
        board: Arc<TaskBoard>,
        instances: Arc<InstanceManager>,
        roles: HashMap<String, RoleConfig>,
        pool: Arc<dyn AgentPool>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let next_index = roles
            .iter()
            .map(|(name, role)| (name.clone(), role.max_instances + 1))
            .collect();
        Self {
            board,
            instances,
            roles,
            pool,
            clock,
            interval: Duration::from_secs(SCALE_INTERVAL_SECS),
            spawned: Mutex::new(HashMap::new()),
            next_index: Mutex::new(next_index),
            running: AtomicBool::new(false),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Run the decision loop until stopped.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(self.interval).await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if let Err(err) = self.tick().await {
                warn!(error = %err, "Auto-scaler tick failed");
            }
        }
    }

    /// One decision pass over every auto-scaling role.
    pub async fn tick(&self) -> BoardResult<()> {
        for (role_name, role) in &self.roles {
            let Some(auto) = role.auto_scale else { continue };
            if !auto.enabled {
                continue;
            }

            let backlog = self.board.pending_count_for_role(role_name).await?;
            let role_instances = self.instances.get_role_instances(role_name).await?;
            let active = role_instances
                .iter()
                .filter(|i| i.status != InstanceStatus::Stopped)
                .count();
            let idle = role_instances
                .iter()
                .filter(|i| i.status == InstanceStatus::Idle)
                .count();

            // Extra capacity is bounded at one auto-spawned loop per base
            // instance (total never exceeds twice the configured pool).
            let max_total = role.max_instances * 2;
            #[allow(clippy::cast_precision_loss)]
            let pressure = backlog as f64 / idle.max(1) as f64;

            if pressure > auto.scale_up_threshold && active < max_total {
                self.scale_up(role_name).await?;
            }

            self.track_idle_and_scale_down(
                role_name,
                auto.scale_down_idle_minutes,
                role.max_instances,
                &role_instances,
            )
            .await?;
        }
        Ok(())
    }

    async fn scale_up(&self, role_name: &str) -> BoardResult<()> {
        let instance_id = {
            let mut indices = self.next_index.lock().unwrap();
            let index = indices.entry(role_name.to_string()).or_insert(1);
            let id = format!("{role_name}-{index}");
            *index += 1;
            id
        };

        info!(role = role_name, instance_id = %instance_id, "Scaling up");
        self.pool.spawn_instance(&instance_id, role_name).await?;
        self.spawned.lock().unwrap().insert(
            instance_id,
            SpawnedState {
                role: role_name.to_string(),
                idle_since: None,
            },
        );
        Ok(())
    }

    async fn track_idle_and_scale_down(
        &self,
        role_name: &str,
        idle_minutes: u64,
        base_count: usize,
        role_instances: &[crate::domain::models::AgentInstance],
    ) -> BoardResult<()> {
        let now = self.clock.now();
        let active = role_instances
            .iter()
            .filter(|i| i.status != InstanceStatus::Stopped)
            .count();

        let mut to_stop: Vec<String> = Vec::new();
        {
            let mut spawned = self.spawned.lock().unwrap();
            for instance in role_instances {
                let Some(state) = spawned.get_mut(&instance.instance_id) else {
                    continue;
                };
                if state.role != role_name {
                    continue;
                }
                if instance.status == InstanceStatus::Idle {
                    let since = *state.idle_since.get_or_insert(now);
                    let idle_for = now - since;
                    if idle_for >= chrono::Duration::minutes(i64::try_from(idle_minutes).unwrap_or(i64::MAX))
                        && active > base_count
                    {
                        to_stop.push(instance.instance_id.clone());
                    }
                } else {
                    state.idle_since = None;
                }
            }
            for id in &to_stop {
                spawned.remove(id);
            }
        }

        for instance_id in to_stop {
            info!(role = role_name, instance_id = %instance_id, "Scaling down idle instance");
            self.pool.stop_instance(&instance_id).await?;
        }
        Ok(())
    }
}
