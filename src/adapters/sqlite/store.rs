//! The persistent store (C1).
//!
//! Owns the connection pool and the cross-cutting persistence concerns that
//! are not task-graph logic: schema/migrations, atomic ID sequences, the
//! append-only event log, and usage metrics. The task board and instance
//! manager receive a handle and issue their own queries through the pool.

use crate::adapters::sqlite::connection::{create_pool, PoolConfig};
use crate::adapters::sqlite::migrations::{all_embedded_migrations, Migrator};
use crate::adapters::sqlite::util::parse_datetime;
use crate::domain::errors::{BoardError, BoardResult};
use crate::domain::models::{TaskUsage, UsageSummary};
use crate::domain::ports::Clock;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::info;

/// Handle to the SQLite store.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl Store {
    /// Open the database at `db_path`, apply schema migrations, and return a
    /// ready store. Fatal on migration failure.
    pub async fn open(db_path: &str, clock: Arc<dyn Clock>) -> BoardResult<Self> {
        let url = if db_path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{db_path}")
        };
        let pool = create_pool(&url, Some(PoolConfig::default()))
            .await
            .map_err(|e| BoardError::Database(e.to_string()))?;
        let store = Self::from_pool(pool, clock);
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool (used by tests with in-memory pools).
    pub fn from_pool(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Apply all pending embedded migrations.
    pub async fn migrate(&self) -> BoardResult<()> {
        let applied = Migrator::new(self.pool.clone())
            .run_embedded_migrations(all_embedded_migrations())
            .await
            .map_err(|e| BoardError::Database(e.to_string()))?;
        if applied > 0 {
            info!(applied, "Applied schema migrations");
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ------------------------------------------------------------------
    // ID sequences
    // ------------------------------------------------------------------

    /// Ensure a prefix row exists. Idempotent.
    pub async fn register_prefix(&self, prefix: &str) -> BoardResult<()> {
        sqlx::query("INSERT OR IGNORE INTO id_sequences (prefix, next_val) VALUES (?, 1)")
            .bind(prefix)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Atomically increment the sequence for `prefix` and return a formatted
    /// `"PREFIX-NNN"` ID. Fails if the prefix is unregistered.
    pub async fn allocate_id(&self, prefix: &str) -> BoardResult<String> {
        let row = sqlx::query(
            "UPDATE id_sequences SET next_val = next_val + 1
             WHERE prefix = ? RETURNING next_val - 1 AS val",
        )
        .bind(prefix)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(BoardError::UnregisteredPrefix(prefix.to_string()));
        };
        let val: i64 = row.get("val");
        Ok(format!("{prefix}-{val:03}"))
    }

    // ------------------------------------------------------------------
    // Event log
    // ------------------------------------------------------------------

    /// Append one event row. The in-memory bus delivers events; this log
    /// provides replay and audit.
    pub async fn append_event(
        &self,
        event_type: &str,
        task_id: Option<&str>,
        group_id: Option<&str>,
        agent_id: Option<&str>,
        data: &Value,
    ) -> BoardResult<()> {
        let now = self.clock.now().to_rfc3339();
        let data_json = serde_json::to_string(data)?;
        sqlx::query(
            "INSERT INTO events (event_type, group_id, task_id, agent_id, data, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(event_type)
        .bind(group_id)
        .bind(task_id)
        .bind(agent_id)
        .bind(data_json)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Return the most recent `limit` persisted events, oldest first.
    pub async fn recent_events(&self, limit: i64) -> BoardResult<Vec<Value>> {
        let rows = sqlx::query(
            "SELECT event_type, group_id, task_id, agent_id, data, created_at
             FROM events ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut events: Vec<Value> = rows
            .iter()
            .map(|row| {
                let data: Option<String> = row.get("data");
                let parsed = data
                    .as_deref()
                    .and_then(|d| serde_json::from_str(d).ok())
                    .unwrap_or(Value::Null);
                serde_json::json!({
                    "event_type": row.get::<Option<String>, _>("event_type"),
                    "group_id": row.get::<Option<String>, _>("group_id"),
                    "task_id": row.get::<Option<String>, _>("task_id"),
                    "agent_id": row.get::<Option<String>, _>("agent_id"),
                    "data": parsed,
                    "created_at": row.get::<String, _>("created_at"),
                })
            })
            .collect();
        events.reverse();
        Ok(events)
    }

    // ------------------------------------------------------------------
    // Usage metrics
    // ------------------------------------------------------------------

    /// Record one usage row for a task execution.
    pub async fn record_task_usage(&self, usage: &TaskUsage) -> BoardResult<()> {
        sqlx::query(
            "INSERT INTO task_usage
             (task_id, agent_id, model, input_tokens, output_tokens, cost_usd,
              duration_api_ms, num_turns, recorded_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&usage.task_id)
        .bind(&usage.agent_id)
        .bind(&usage.model)
        .bind(usage.input_tokens)
        .bind(usage.output_tokens)
        .bind(usage.cost_usd)
        .bind(usage.duration_api_ms)
        .bind(usage.num_turns)
        .bind(usage.recorded_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Aggregate usage recorded since the given RFC 3339 instant.
    pub async fn usage_summary(&self, since: &str) -> BoardResult<UsageSummary> {
        // Validate the boundary so a bad query string fails loudly.
        parse_datetime(since)?;
        let row = sqlx::query(
            "SELECT COALESCE(SUM(input_tokens), 0) AS input_tokens,
                    COALESCE(SUM(output_tokens), 0) AS output_tokens,
                    COALESCE(SUM(cost_usd), 0) AS cost_usd,
                    COALESCE(SUM(duration_api_ms), 0) AS duration_api_ms,
                    COALESCE(SUM(num_turns), 0) AS num_turns,
                    COUNT(*) AS tasks_completed
             FROM task_usage WHERE recorded_at >= ?",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(UsageSummary {
            input_tokens: row.get("input_tokens"),
            output_tokens: row.get("output_tokens"),
            cost_usd: row.get("cost_usd"),
            duration_api_ms: row.get("duration_api_ms"),
            num_turns: row.get("num_turns"),
            tasks_completed: row.get("tasks_completed"),
        })
    }

    /// Usage bucketed by hour or day for the metrics timeseries endpoint.
    pub async fn usage_timeseries(
        &self,
        since: &str,
        granularity: &str,
    ) -> BoardResult<Vec<Value>> {
        parse_datetime(since)?;
        let bucket = match granularity {
            "day" => "strftime('%Y-%m-%dT00:00:00Z', recorded_at)",
            _ => "strftime('%Y-%m-%dT%H:00:00Z', recorded_at)",
        };
        let sql = format!(
            "SELECT {bucket} AS bucket,
                    COALESCE(SUM(input_tokens), 0) AS input_tokens,
                    COALESCE(SUM(output_tokens), 0) AS output_tokens,
                    COALESCE(SUM(cost_usd), 0) AS cost_usd,
                    COUNT(*) AS tasks
             FROM task_usage WHERE recorded_at >= ?
             GROUP BY bucket ORDER BY bucket"
        );
        let rows = sqlx::query(&sql).bind(since).fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| {
                serde_json::json!({
                    "bucket": row.get::<Option<String>, _>("bucket"),
                    "input_tokens": row.get::<i64, _>("input_tokens"),
                    "output_tokens": row.get::<i64, _>("output_tokens"),
                    "cost_usd": row.get::<f64, _>("cost_usd"),
                    "tasks": row.get::<i64, _>("tasks"),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::connection::create_test_pool;
    use crate::domain::ports::clock::system_clock;
    use chrono::Utc;

    async fn test_store() -> Store {
        let pool = create_test_pool().await.unwrap();
        let store = Store::from_pool(pool, system_clock());
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_allocate_id_monotonic() {
        let store = test_store().await;
        store.register_prefix("CD").await.unwrap();

        assert_eq!(store.allocate_id("CD").await.unwrap(), "CD-001");
        assert_eq!(store.allocate_id("CD").await.unwrap(), "CD-002");
        assert_eq!(store.allocate_id("CD").await.unwrap(), "CD-003");
    }

    #[tokio::test]
    async fn test_allocate_id_grows_past_padding() {
        let store = test_store().await;
        store.register_prefix("PM").await.unwrap();
        for _ in 0..999 {
            store.allocate_id("PM").await.unwrap();
        }
        assert_eq!(store.allocate_id("PM").await.unwrap(), "PM-1000");
    }

    #[tokio::test]
    async fn test_allocate_unregistered_prefix_fails() {
        let store = test_store().await;
        let err = store.allocate_id("XX").await.unwrap_err();
        assert!(matches!(err, BoardError::UnregisteredPrefix(_)));
    }

    #[tokio::test]
    async fn test_register_prefix_idempotent() {
        let store = test_store().await;
        store.register_prefix("AR").await.unwrap();
        store.register_prefix("AR").await.unwrap();
        assert_eq!(store.allocate_id("AR").await.unwrap(), "AR-001");
    }

    #[tokio::test]
    async fn test_event_log_round_trip() {
        let store = test_store().await;
        store
            .append_event(
                "task.created",
                Some("CD-001"),
                Some("FEAT-001"),
                None,
                &serde_json::json!({ "task_id": "CD-001" }),
            )
            .await
            .unwrap();

        let events = store.recent_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["event_type"], "task.created");
        assert_eq!(events[0]["data"]["task_id"], "CD-001");
    }

    #[tokio::test]
    async fn test_usage_summary() {
        let store = test_store().await;
        let usage = TaskUsage {
            task_id: "CD-001".into(),
            agent_id: "coder-1".into(),
            model: "claude-sonnet-4-6".into(),
            input_tokens: 1200,
            output_tokens: 400,
            cost_usd: 0.05,
            duration_api_ms: 9000,
            num_turns: 4,
            recorded_at: Utc::now(),
        };
        store.record_task_usage(&usage).await.unwrap();

        let summary = store
            .usage_summary("2000-01-01T00:00:00Z")
            .await
            .unwrap();
        assert_eq!(summary.input_tokens, 1200);
        assert_eq!(summary.output_tokens, 400);
        assert_eq!(summary.tasks_completed, 1);
    }
}
