//! Agent instance registry with heartbeat-based staleness detection.

use crate::adapters::sqlite::util::parse_datetime_opt;
use crate::adapters::sqlite::Store;
use crate::domain::errors::BoardResult;
use crate::domain::models::{AgentInstance, InstanceStatus};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashSet;
use std::sync::RwLock;
use tracing::debug;

/// Default heartbeat age (seconds) after which an instance counts as stale.
pub const DEFAULT_STALE_TIMEOUT_SECS: i64 = 90;

/// Registry of agent worker instances.
///
/// Instance rows live in the store; the administrative pause set is
/// in-memory only and resets on restart.
pub struct InstanceManager {
    store: Store,
    paused_roles: RwLock<HashSet<String>>,
}

impl InstanceManager {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            paused_roles: RwLock::new(HashSet::new()),
        }
    }

    fn row_to_instance(row: &SqliteRow) -> AgentInstance {
        let status_str: String = row.get("status");
        AgentInstance {
            instance_id: row.get("instance_id"),
            role: row.get("role"),
            status: InstanceStatus::from_str(&status_str).unwrap_or(InstanceStatus::Idle),
            current_task: row.get("current_task"),
            started_at: parse_datetime_opt(row.get::<Option<String>, _>("started_at").as_deref()),
            last_heartbeat: parse_datetime_opt(
                row.get::<Option<String>, _>("last_heartbeat").as_deref(),
            ),
        }
    }

    /// Register (or re-register) an instance as idle with a fresh heartbeat.
    pub async fn register_instance(&self, instance_id: &str, role: &str) -> BoardResult<()> {
        let now = self.store.clock().now().to_rfc3339();
        sqlx::query(
            "INSERT INTO agent_instances
             (instance_id, role, status, current_task, started_at, last_heartbeat)
             VALUES (?, ?, 'idle', NULL, ?, ?)
             ON CONFLICT(instance_id) DO UPDATE SET
               role = excluded.role,
               status = 'idle',
               current_task = NULL,
               started_at = excluded.started_at,
               last_heartbeat = excluded.last_heartbeat",
        )
        .bind(instance_id)
        .bind(role)
        .bind(&now)
        .bind(&now)
        .execute(self.store.pool())
        .await?;
        debug!(instance_id, role, "Instance registered");
        Ok(())
    }

    /// Refresh the heartbeat timestamp.
    pub async fn heartbeat(&self, instance_id: &str) -> BoardResult<()> {
        let now = self.store.clock().now().to_rfc3339();
        sqlx::query("UPDATE agent_instances SET last_heartbeat = ? WHERE instance_id = ?")
            .bind(&now)
            .bind(instance_id)
            .execute(self.store.pool())
            .await?;
        Ok(())
    }

    /// Update the status (and optionally the current task) of an instance.
    pub async fn update_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        current_task: Option<&str>,
    ) -> BoardResult<()> {
        let now = self.store.clock().now().to_rfc3339();
        sqlx::query(
            "UPDATE agent_instances
             SET status = ?, current_task = ?, last_heartbeat = ?
             WHERE instance_id = ?",
        )
        .bind(status.as_str())
        .bind(current_task)
        .bind(&now)
        .bind(instance_id)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    pub async fn get_instance(&self, instance_id: &str) -> BoardResult<Option<AgentInstance>> {
        let row = sqlx::query("SELECT * FROM agent_instances WHERE instance_id = ?")
            .bind(instance_id)
            .fetch_optional(self.store.pool())
            .await?;
        Ok(row.as_ref().map(Self::row_to_instance))
    }

    pub async fn get_all_instances(&self) -> BoardResult<Vec<AgentInstance>> {
        let rows = sqlx::query("SELECT * FROM agent_instances ORDER BY instance_id")
            .fetch_all(self.store.pool())
            .await?;
        Ok(rows.iter().map(Self::row_to_instance).collect())
    }

    pub async fn get_role_instances(&self, role: &str) -> BoardResult<Vec<AgentInstance>> {
        let rows = sqlx::query("SELECT * FROM agent_instances WHERE role = ? ORDER BY instance_id")
            .bind(role)
            .fetch_all(self.store.pool())
            .await?;
        Ok(rows.iter().map(Self::row_to_instance).collect())
    }

    /// Instances whose heartbeat is older than `timeout_seconds` and whose
    /// status is neither stopped nor paused.
    pub async fn get_stale_instances(
        &self,
        timeout_seconds: i64,
    ) -> BoardResult<Vec<AgentInstance>> {
        let threshold =
            (self.store.clock().now() - chrono::Duration::seconds(timeout_seconds)).to_rfc3339();
        let rows = sqlx::query(
            "SELECT * FROM agent_instances
             WHERE status NOT IN ('stopped', 'paused')
               AND (last_heartbeat IS NULL OR last_heartbeat < ?)",
        )
        .bind(&threshold)
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows.iter().map(Self::row_to_instance).collect())
    }

    pub async fn remove_instance(&self, instance_id: &str) -> BoardResult<()> {
        sqlx::query("DELETE FROM agent_instances WHERE instance_id = ?")
            .bind(instance_id)
            .execute(self.store.pool())
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Administrative role pause (in-memory)
    // ------------------------------------------------------------------

    pub fn pause_role(&self, role: &str) {
        self.paused_roles.write().unwrap().insert(role.to_string());
    }

    pub fn resume_role(&self, role: &str) {
        self.paused_roles.write().unwrap().remove(role);
    }

    pub fn is_role_paused(&self, role: &str) -> bool {
        self.paused_roles.read().unwrap().contains(role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::connection::create_test_pool;
    use crate::domain::ports::clock::test_support::FixedClock;
    use crate::domain::ports::clock::system_clock;
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    async fn manager_with_clock(clock: Arc<dyn crate::domain::ports::Clock>) -> InstanceManager {
        let pool = create_test_pool().await.unwrap();
        let store = Store::from_pool(pool, clock);
        store.migrate().await.unwrap();
        InstanceManager::new(store)
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let mgr = manager_with_clock(system_clock()).await;
        mgr.register_instance("coder-1", "coder").await.unwrap();

        let instance = mgr.get_instance("coder-1").await.unwrap().unwrap();
        assert_eq!(instance.role, "coder");
        assert_eq!(instance.status, InstanceStatus::Idle);
        assert!(instance.last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn test_update_status_with_task() {
        let mgr = manager_with_clock(system_clock()).await;
        // current_task has a foreign key into tasks.
        sqlx::query(
            "INSERT INTO tasks (id, title, status, created_at)
             VALUES ('CD-001', 'stub', 'in_progress', '2025-01-01T00:00:00Z')",
        )
        .execute(mgr.store.pool())
        .await
        .unwrap();

        mgr.register_instance("coder-1", "coder").await.unwrap();
        mgr.update_status("coder-1", InstanceStatus::Working, Some("CD-001"))
            .await
            .unwrap();

        let instance = mgr.get_instance("coder-1").await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Working);
        assert_eq!(instance.current_task.as_deref(), Some("CD-001"));

        mgr.update_status("coder-1", InstanceStatus::Idle, None)
            .await
            .unwrap();
        let instance = mgr.get_instance("coder-1").await.unwrap().unwrap();
        assert!(instance.current_task.is_none());
    }

    #[tokio::test]
    async fn test_stale_detection() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let mgr = manager_with_clock(clock.clone()).await;
        mgr.register_instance("coder-1", "coder").await.unwrap();
        mgr.register_instance("coder-2", "coder").await.unwrap();
        mgr.register_instance("pm-1", "pm").await.unwrap();
        mgr.update_status("pm-1", InstanceStatus::Stopped, None)
            .await
            .unwrap();

        // Freeze coder-1's heartbeat while time passes for the others.
        clock.advance(Duration::seconds(120));
        mgr.heartbeat("coder-2").await.unwrap();

        let stale = mgr
            .get_stale_instances(DEFAULT_STALE_TIMEOUT_SECS)
            .await
            .unwrap();
        let ids: Vec<_> = stale.iter().map(|i| i.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["coder-1"]);
    }

    #[tokio::test]
    async fn test_role_pause_flags() {
        let mgr = manager_with_clock(system_clock()).await;
        assert!(!mgr.is_role_paused("coder"));
        mgr.pause_role("coder");
        assert!(mgr.is_role_paused("coder"));
        mgr.resume_role("coder");
        assert!(!mgr.is_role_paused("coder"));
    }

    #[tokio::test]
    async fn test_remove_instance() {
        let mgr = manager_with_clock(system_clock()).await;
        mgr.register_instance("coder-1", "coder").await.unwrap();
        mgr.remove_instance("coder-1").await.unwrap();
        assert!(mgr.get_instance("coder-1").await.unwrap().is_none());
    }
}
