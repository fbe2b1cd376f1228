//! Task board: high-level operations on the persistent task graph.
//!
//! Every mutation of groups, tasks, and dependencies flows through this
//! service, which concentrates the graph invariants: acyclic dependencies,
//! consistent status transitions, atomic claims, cascade failure, and group
//! completion. All state lives in the store; the board holds only the
//! role-to-prefix mappings.

use crate::adapters::sqlite::util::{parse_datetime, parse_datetime_opt};
use crate::adapters::sqlite::Store;
use crate::domain::errors::{BoardError, BoardResult};
use crate::domain::models::{
    Group, GroupStatus, Task, TaskDependency, TaskPriority, TaskStatus,
};
use serde::Deserialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::RwLock;
use tracing::{info, warn};

/// Priority CASE expression used by the claim query (lower value wins).
const PRIORITY_CASE: &str = "CASE priority \
     WHEN 'critical' THEN 0 WHEN 'high' THEN 1 \
     WHEN 'medium' THEN 2 WHEN 'low' THEN 3 ELSE 99 END";

/// Statuses that never transition again except via explicit retry.
const TERMINAL_STATUSES: &str = "('completed', 'failed', 'rejected', 'cancelled')";

/// Agent output is persisted truncated to this many characters, with no
/// delimiter; consumers must treat it as "first 2000 chars".
const OUTPUT_TEXT_LIMIT: usize = 2000;

/// Parameters for [`TaskBoard::create_task`].
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub group_id: String,
    pub title: String,
    pub task_type: String,
    pub assigned_to: String,
    pub created_by: Option<String>,
    pub description: Option<String>,
    pub priority: TaskPriority,
    pub parent_id: Option<String>,
    pub revision_of: Option<String>,
    pub blocked_by: Vec<String>,
}

/// Optional filters for the board view.
#[derive(Debug, Clone, Default)]
pub struct BoardFilters {
    pub group_id: Option<String>,
    pub assigned_to: Option<String>,
    pub claimed_by: Option<String>,
    pub task_type: Option<String>,
    pub priority: Option<String>,
}

/// Search parameters with pagination.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub query: String,
    pub group_id: Option<String>,
    pub status: Option<String>,
    pub assigned_to: Option<String>,
    pub task_type: Option<String>,
    pub priority: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            query: String::new(),
            group_id: None,
            status: None,
            assigned_to: None,
            task_type: None,
            priority: None,
            limit: 50,
            offset: 0,
        }
    }
}

/// Pagination-aware search result.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub tasks: Vec<Task>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Vectorized batch action. Rows failing their precondition are skipped.
#[derive(Debug, Clone)]
pub enum BatchAction {
    Cancel { reason: Option<String> },
    Reassign { assigned_to: String },
    ChangePriority { priority: TaskPriority },
    Retry,
}

/// Outcome of a batch update.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub updated: usize,
    pub task_ids: Vec<String>,
}

/// A stored task template.
#[derive(Debug, Clone)]
pub struct TaskTemplate {
    pub id: String,
    pub name: String,
    pub title_template: String,
    pub description_template: Option<String>,
    pub task_type: String,
    pub assigned_to: String,
    pub priority: TaskPriority,
}

/// One step of a workflow definition (JSON-encoded in `steps`).
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowStep {
    pub title: String,
    #[serde(default = "default_step_type")]
    pub task_type: String,
    #[serde(default = "default_step_assignee")]
    pub assigned_to: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
}

fn default_step_type() -> String {
    "workflow_step".to_string()
}

fn default_step_assignee() -> String {
    "coder".to_string()
}

/// Classification of a task failure, keyed off the recorded reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Network errors, timeouts, rate limits: safe to auto-retry.
    Transient,
    /// Code bugs and assertion failures: needs a fix first.
    Logic,
    /// Missing resources: retrying will not help.
    Permanent,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Logic => "logic",
            Self::Permanent => "permanent",
        }
    }
}

/// High-level CRUD interface for groups, tasks, and dependencies.
pub struct TaskBoard {
    store: Store,
    /// `role -> group prefix` for roles with group-creation privileges.
    group_prefixes: RwLock<HashMap<String, String>>,
    /// `role -> task prefix` populated by [`register_prefixes`](Self::register_prefixes).
    role_prefixes: RwLock<HashMap<String, String>>,
}

impl TaskBoard {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            group_prefixes: RwLock::new(HashMap::new()),
            role_prefixes: RwLock::new(HashMap::new()),
        }
    }

    /// Handle to the underlying store (usage recording, event log).
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Replace the group prefix mapping.
    pub fn set_group_prefixes(&self, prefixes: HashMap<String, String>) {
        *self.group_prefixes.write().unwrap() = prefixes;
    }

    /// Register all role prefixes in the store and cache the mapping.
    pub async fn register_prefixes(
        &self,
        role_prefixes: HashMap<String, String>,
    ) -> BoardResult<()> {
        for prefix in role_prefixes.values() {
            self.store.register_prefix(prefix).await?;
        }
        let group_prefixes: Vec<String> =
            self.group_prefixes.read().unwrap().values().cloned().collect();
        for prefix in group_prefixes {
            self.store.register_prefix(&prefix).await?;
        }
        *self.role_prefixes.write().unwrap() = role_prefixes;
        Ok(())
    }

    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.store.clock().now()
    }

    // ------------------------------------------------------------------
    // Row mapping
    // ------------------------------------------------------------------

    fn row_to_task(row: &SqliteRow) -> BoardResult<Task> {
        let status_str: String = row.get("status");
        let status = TaskStatus::from_str(&status_str)
            .ok_or_else(|| BoardError::Database(format!("unknown task status '{status_str}'")))?;
        let priority_str: String = row.get("priority");

        Ok(Task {
            id: row.get("id"),
            group_id: row.get("group_id"),
            parent_id: row.get("parent_id"),
            title: row.get("title"),
            description: row.get("description"),
            task_type: row.get("task_type"),
            priority: TaskPriority::from_str(&priority_str).unwrap_or_default(),
            assigned_to: row.get("assigned_to"),
            claimed_by: row.get("claimed_by"),
            status,
            created_by: row.get("created_by"),
            created_at: parse_datetime(row.get::<String, _>("created_at").as_str())?,
            started_at: parse_datetime_opt(row.get::<Option<String>, _>("started_at").as_deref()),
            completed_at: parse_datetime_opt(
                row.get::<Option<String>, _>("completed_at").as_deref(),
            ),
            rejection_reason: row.get("rejection_reason"),
            revision_of: row.get("revision_of"),
            output_text: row.get("output_text"),
        })
    }

    fn row_to_group(row: &SqliteRow) -> BoardResult<Group> {
        let status_str: String = row.get("status");
        let status = GroupStatus::from_str(&status_str)
            .ok_or_else(|| BoardError::Database(format!("unknown group status '{status_str}'")))?;
        Ok(Group {
            id: row.get("id"),
            title: row.get("title"),
            origin: row.get("origin"),
            status,
            created_by: row.get("created_by"),
            created_at: parse_datetime(row.get::<String, _>("created_at").as_str())?,
            completed_at: parse_datetime_opt(
                row.get::<Option<String>, _>("completed_at").as_deref(),
            ),
        })
    }

    async fn fetch_task(&self, task_id: &str) -> BoardResult<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(self.store.pool())
            .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn fetch_task_required(&self, task_id: &str) -> BoardResult<Task> {
        self.fetch_task(task_id)
            .await?
            .ok_or_else(|| BoardError::TaskNotFound(task_id.to_string()))
    }

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    /// Create a new group. The ID prefix comes from the creator's group
    /// prefix mapping, falling back to `"GRP"`.
    pub async fn create_group(
        &self,
        title: &str,
        origin: Option<&str>,
        created_by: Option<&str>,
    ) -> BoardResult<Group> {
        let prefix = {
            let prefixes = self.group_prefixes.read().unwrap();
            created_by
                .and_then(|role| prefixes.get(role).cloned())
                .unwrap_or_else(|| "GRP".to_string())
        };
        self.store.register_prefix(&prefix).await?;
        let group_id = self.store.allocate_id(&prefix).await?;
        let now = self.now();

        sqlx::query(
            "INSERT INTO groups (id, title, origin, status, created_by, created_at)
             VALUES (?, ?, ?, 'active', ?, ?)",
        )
        .bind(&group_id)
        .bind(title)
        .bind(origin)
        .bind(created_by)
        .bind(now.to_rfc3339())
        .execute(self.store.pool())
        .await?;

        Ok(Group {
            id: group_id,
            title: title.to_string(),
            origin: origin.map(str::to_string),
            status: GroupStatus::Active,
            created_by: created_by.map(str::to_string),
            created_at: now,
            completed_at: None,
        })
    }

    pub async fn get_group(&self, group_id: &str) -> BoardResult<Option<Group>> {
        let row = sqlx::query("SELECT * FROM groups WHERE id = ?")
            .bind(group_id)
            .fetch_optional(self.store.pool())
            .await?;
        row.as_ref().map(Self::row_to_group).transpose()
    }

    /// All groups, optionally filtered by status, ordered by creation time.
    pub async fn get_groups(&self, status: Option<GroupStatus>) -> BoardResult<Vec<Group>> {
        let rows = match status {
            Some(s) => {
                sqlx::query("SELECT * FROM groups WHERE status = ? ORDER BY created_at")
                    .bind(s.as_str())
                    .fetch_all(self.store.pool())
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM groups ORDER BY created_at")
                    .fetch_all(self.store.pool())
                    .await?
            }
        };
        rows.iter().map(Self::row_to_group).collect()
    }

    // ------------------------------------------------------------------
    // Task creation
    // ------------------------------------------------------------------

    /// Create a task with an auto-allocated ID. Dependencies are checked for
    /// cycles before any edge row is inserted; a detected cycle fails the
    /// whole creation with no rows written.
    pub async fn create_task(&self, new: NewTask) -> BoardResult<Task> {
        let prefix = {
            let prefixes = self.role_prefixes.read().unwrap();
            prefixes.get(&new.assigned_to).cloned().unwrap_or_else(|| {
                new.assigned_to
                    .chars()
                    .take(2)
                    .collect::<String>()
                    .to_uppercase()
            })
        };
        self.store.register_prefix(&prefix).await?;
        let task_id = self.store.allocate_id(&prefix).await?;
        let now = self.now();

        // Verify every dependency edge up front: a self-edge or an upstream
        // path back to the new task is rejected before anything is written.
        for dep_id in &new.blocked_by {
            if self.has_cycle(&task_id, dep_id).await? {
                return Err(BoardError::CycleInDependency {
                    task_id,
                    blocked_by: dep_id.clone(),
                });
            }
        }

        let status = if new.blocked_by.is_empty() {
            TaskStatus::Pending
        } else {
            TaskStatus::Blocked
        };

        let mut tx = self.store.pool().begin().await?;
        sqlx::query(
            "INSERT INTO tasks
             (id, group_id, parent_id, title, description, task_type,
              priority, assigned_to, status, created_by, created_at, revision_of)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task_id)
        .bind(&new.group_id)
        .bind(&new.parent_id)
        .bind(&new.title)
        .bind(&new.description)
        .bind(&new.task_type)
        .bind(new.priority.as_str())
        .bind(&new.assigned_to)
        .bind(status.as_str())
        .bind(&new.created_by)
        .bind(now.to_rfc3339())
        .bind(&new.revision_of)
        .execute(&mut *tx)
        .await?;

        for dep_id in &new.blocked_by {
            sqlx::query("INSERT INTO task_dependencies (task_id, blocked_by) VALUES (?, ?)")
                .bind(&task_id)
                .bind(dep_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(Task {
            id: task_id,
            group_id: Some(new.group_id),
            parent_id: new.parent_id,
            title: new.title,
            description: new.description,
            task_type: Some(new.task_type),
            priority: new.priority,
            assigned_to: Some(new.assigned_to),
            claimed_by: None,
            status,
            created_by: new.created_by,
            created_at: now,
            started_at: None,
            completed_at: None,
            rejection_reason: None,
            revision_of: new.revision_of,
            output_text: None,
        })
    }

    pub async fn get_task(&self, task_id: &str) -> BoardResult<Option<Task>> {
        self.fetch_task(task_id).await
    }

    pub async fn get_group_tasks(&self, group_id: &str) -> BoardResult<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE group_id = ? ORDER BY created_at")
            .bind(group_id)
            .fetch_all(self.store.pool())
            .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    /// Direct children linked via `parent_id`.
    pub async fn get_task_children(&self, task_id: &str) -> BoardResult<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE parent_id = ? ORDER BY created_at")
            .bind(task_id)
            .fetch_all(self.store.pool())
            .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    /// Dependency rows targeting `task_id`.
    pub async fn get_task_dependencies(&self, task_id: &str) -> BoardResult<Vec<TaskDependency>> {
        let rows = sqlx::query(
            "SELECT task_id, blocked_by, resolved, resolved_at
             FROM task_dependencies WHERE task_id = ?",
        )
        .bind(task_id)
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|row| TaskDependency {
                task_id: row.get("task_id"),
                blocked_by: row.get("blocked_by"),
                resolved: row.get::<i64, _>("resolved") != 0,
                resolved_at: parse_datetime_opt(
                    row.get::<Option<String>, _>("resolved_at").as_deref(),
                ),
            })
            .collect())
    }

    /// All dependency edges between tasks of one group (for the graph view).
    pub async fn get_group_dependencies(
        &self,
        group_id: &str,
    ) -> BoardResult<Vec<TaskDependency>> {
        let rows = sqlx::query(
            "SELECT d.task_id, d.blocked_by, d.resolved, d.resolved_at
             FROM task_dependencies d
             JOIN tasks t ON t.id = d.task_id
             WHERE t.group_id = ?",
        )
        .bind(group_id)
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|row| TaskDependency {
                task_id: row.get("task_id"),
                blocked_by: row.get("blocked_by"),
                resolved: row.get::<i64, _>("resolved") != 0,
                resolved_at: parse_datetime_opt(
                    row.get::<Option<String>, _>("resolved_at").as_deref(),
                ),
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Claim / Complete / Reject / Fail / Cancel
    // ------------------------------------------------------------------

    /// Atomically claim the highest-priority pending task for `role`.
    ///
    /// SELECT-then-UPDATE inside one transaction; the UPDATE re-checks
    /// `status = 'pending' AND claimed_by IS NULL`, so if another worker won
    /// the race the update affects zero rows and this claim returns `None`.
    pub async fn claim_task(&self, role: &str, instance_id: &str) -> BoardResult<Option<Task>> {
        let now = self.now().to_rfc3339();
        let mut tx = self.store.pool().begin().await?;

        let select_sql = format!(
            "SELECT id FROM tasks
             WHERE assigned_to = ? AND status = 'pending' AND claimed_by IS NULL
             ORDER BY {PRIORITY_CASE}, created_at
             LIMIT 1"
        );
        let row = sqlx::query(&select_sql)
            .bind(role)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let task_id: String = row.get("id");

        let update = sqlx::query(
            "UPDATE tasks SET claimed_by = ?, status = 'in_progress', started_at = ?
             WHERE id = ? AND status = 'pending' AND claimed_by IS NULL",
        )
        .bind(instance_id)
        .bind(&now)
        .bind(&task_id)
        .execute(&mut *tx)
        .await?;

        if update.rows_affected() == 0 {
            // Another worker got there between the SELECT and the UPDATE.
            tx.rollback().await?;
            return Ok(None);
        }

        let task_row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(&task_id)
            .fetch_one(&mut *tx)
            .await?;
        let task = Self::row_to_task(&task_row)?;
        tx.commit().await?;

        info!(task_id = %task.id, instance_id, "Task claimed");
        Ok(Some(task))
    }

    /// Mark a task completed and resolve downstream dependencies.
    ///
    /// A task that is already terminal is logged and returned unchanged;
    /// this tolerates idempotent retries from the agent layer.
    pub async fn complete_task(&self, task_id: &str) -> BoardResult<Task> {
        self.complete_inner(task_id, None).await
    }

    /// Mark a task completed and store its (truncated) output.
    pub async fn complete_task_with_output(
        &self,
        task_id: &str,
        output: &str,
    ) -> BoardResult<Task> {
        self.complete_inner(task_id, Some(output)).await
    }

    async fn complete_inner(&self, task_id: &str, output: Option<&str>) -> BoardResult<Task> {
        let now = self.now().to_rfc3339();
        let updated = match output {
            Some(output) => {
                let truncated: String = output.chars().take(OUTPUT_TEXT_LIMIT).collect();
                sqlx::query(
                    "UPDATE tasks SET status = 'completed', completed_at = ?, output_text = ?
                     WHERE id = ? AND status = 'in_progress'",
                )
                .bind(&now)
                .bind(truncated)
                .bind(task_id)
                .execute(self.store.pool())
                .await?
            }
            None => {
                sqlx::query(
                    "UPDATE tasks SET status = 'completed', completed_at = ?
                     WHERE id = ? AND status = 'in_progress'",
                )
                .bind(&now)
                .bind(task_id)
                .execute(self.store.pool())
                .await?
            }
        };

        if updated.rows_affected() == 0 {
            let existing = self.fetch_task_required(task_id).await?;
            warn!(
                task_id,
                status = %existing.status,
                "complete_task skipped: expected 'in_progress'"
            );
            return Ok(existing);
        }

        self.resolve_dependencies(task_id).await?;
        self.check_group_completion(task_id).await?;
        info!(task_id, "Task completed");
        self.fetch_task_required(task_id).await
    }

    /// Mark a task rejected with a reason. Allowed from any status.
    pub async fn reject_task(&self, task_id: &str, reason: &str) -> BoardResult<Task> {
        let updated = sqlx::query(
            "UPDATE tasks SET status = 'rejected', rejection_reason = ? WHERE id = ?",
        )
        .bind(reason)
        .bind(task_id)
        .execute(self.store.pool())
        .await?;
        if updated.rows_affected() == 0 {
            return Err(BoardError::TaskNotFound(task_id.to_string()));
        }
        self.fetch_task_required(task_id).await
    }

    /// Mark an in-progress task failed, cascade failure to blocked
    /// dependents, and cancel pending direct children.
    pub async fn fail_task(&self, task_id: &str) -> BoardResult<Task> {
        let updated = sqlx::query(
            "UPDATE tasks SET status = 'failed' WHERE id = ? AND status = 'in_progress'",
        )
        .bind(task_id)
        .execute(self.store.pool())
        .await?;

        if updated.rows_affected() == 0 {
            let existing = self.fetch_task_required(task_id).await?;
            warn!(
                task_id,
                status = %existing.status,
                "fail_task skipped: expected 'in_progress'"
            );
            return Ok(existing);
        }

        self.cascade_failure(task_id).await?;
        sqlx::query(
            "UPDATE tasks SET status = 'cancelled' WHERE parent_id = ? AND status = 'pending'",
        )
        .bind(task_id)
        .execute(self.store.pool())
        .await?;
        self.check_group_completion(task_id).await?;
        info!(task_id, "Task failed");
        self.fetch_task_required(task_id).await
    }

    /// Cancel a task (any status), recording the reason, and cascade as a
    /// failure to still-blocked dependents.
    pub async fn cancel_task(&self, task_id: &str, reason: Option<&str>) -> BoardResult<Task> {
        let now = self.now().to_rfc3339();
        let updated = sqlx::query(
            "UPDATE tasks SET status = 'cancelled', completed_at = ?, rejection_reason = ?
             WHERE id = ?",
        )
        .bind(&now)
        .bind(reason)
        .bind(task_id)
        .execute(self.store.pool())
        .await?;
        if updated.rows_affected() == 0 {
            return Err(BoardError::TaskNotFound(task_id.to_string()));
        }
        self.cascade_failure(task_id).await?;
        self.check_group_completion(task_id).await?;
        self.fetch_task_required(task_id).await
    }

    /// Reset a failed, rejected, or cancelled task back to pending, clearing
    /// the claim and completion timestamp.
    pub async fn retry_task(&self, task_id: &str) -> BoardResult<Task> {
        let task = self.fetch_task_required(task_id).await?;
        if !task.status.is_retryable() {
            return Err(BoardError::IllegalStatus {
                task_id: task_id.to_string(),
                status: task.status.to_string(),
                action: "retry",
            });
        }

        sqlx::query(
            "UPDATE tasks SET status = 'pending', claimed_by = NULL, completed_at = NULL
             WHERE id = ?",
        )
        .bind(task_id)
        .execute(self.store.pool())
        .await?;
        self.fetch_task_required(task_id).await
    }

    /// Reassign a pending or blocked task to a new role.
    pub async fn reassign_task(&self, task_id: &str, new_assignee: &str) -> BoardResult<Task> {
        let task = self.fetch_task_required(task_id).await?;
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Blocked) {
            return Err(BoardError::IllegalStatus {
                task_id: task_id.to_string(),
                status: task.status.to_string(),
                action: "reassign",
            });
        }

        sqlx::query("UPDATE tasks SET assigned_to = ? WHERE id = ?")
            .bind(new_assignee)
            .bind(task_id)
            .execute(self.store.pool())
            .await?;
        self.fetch_task_required(task_id).await
    }

    /// Change a task's priority. No status precondition.
    pub async fn change_priority(
        &self,
        task_id: &str,
        priority: TaskPriority,
    ) -> BoardResult<Task> {
        let updated = sqlx::query("UPDATE tasks SET priority = ? WHERE id = ?")
            .bind(priority.as_str())
            .bind(task_id)
            .execute(self.store.pool())
            .await?;
        if updated.rows_affected() == 0 {
            return Err(BoardError::TaskNotFound(task_id.to_string()));
        }
        self.fetch_task_required(task_id).await
    }

    /// Whitelist field update backing the PATCH endpoint. Status values are
    /// validated against the legal set but applied directly; this is an
    /// administrative override, not a lifecycle transition.
    pub async fn update_task_fields(
        &self,
        task_id: &str,
        priority: Option<TaskPriority>,
        assigned_to: Option<&str>,
        status: Option<TaskStatus>,
    ) -> BoardResult<Task> {
        // Ensure the task exists before applying partial updates.
        self.fetch_task_required(task_id).await?;

        if let Some(priority) = priority {
            sqlx::query("UPDATE tasks SET priority = ? WHERE id = ?")
                .bind(priority.as_str())
                .bind(task_id)
                .execute(self.store.pool())
                .await?;
        }
        if let Some(assigned_to) = assigned_to {
            sqlx::query("UPDATE tasks SET assigned_to = ? WHERE id = ?")
                .bind(assigned_to)
                .bind(task_id)
                .execute(self.store.pool())
                .await?;
        }
        if let Some(status) = status {
            sqlx::query("UPDATE tasks SET status = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(task_id)
                .execute(self.store.pool())
                .await?;
        }

        self.fetch_task_required(task_id).await
    }

    // ------------------------------------------------------------------
    // Dependency resolution & cascade
    // ------------------------------------------------------------------

    /// When a task fails (or is cancelled), fail all still-blocked tasks
    /// that depend on it. Iterative BFS over unresolved dependency edges.
    async fn cascade_failure(&self, task_id: &str) -> BoardResult<()> {
        let mut queue: VecDeque<String> = VecDeque::from([task_id.to_string()]);
        while let Some(current) = queue.pop_front() {
            let dependents = sqlx::query(
                "SELECT task_id FROM task_dependencies WHERE blocked_by = ? AND resolved = 0",
            )
            .bind(&current)
            .fetch_all(self.store.pool())
            .await?;

            for dep in dependents {
                let dep_id: String = dep.get("task_id");
                let updated = sqlx::query(
                    "UPDATE tasks SET status = 'failed'
                     WHERE id = ? AND status IN ('pending', 'blocked')",
                )
                .bind(&dep_id)
                .execute(self.store.pool())
                .await?;
                if updated.rows_affected() > 0 {
                    queue.push_back(dep_id);
                }
            }
        }
        Ok(())
    }

    /// Resolve dependencies after `completed_task_id` finished: mark the
    /// outgoing edges resolved, then flip any blocked task with zero
    /// remaining unresolved dependencies to pending. Runs in one
    /// transaction so a task is never observed terminal with stale edges.
    async fn resolve_dependencies(&self, completed_task_id: &str) -> BoardResult<()> {
        let now = self.now().to_rfc3339();
        let mut tx = self.store.pool().begin().await?;

        sqlx::query(
            "UPDATE task_dependencies SET resolved = 1, resolved_at = ?
             WHERE blocked_by = ? AND resolved = 0",
        )
        .bind(&now)
        .bind(completed_task_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE tasks SET status = 'pending'
             WHERE status = 'blocked'
               AND NOT EXISTS (
                 SELECT 1 FROM task_dependencies d
                 WHERE d.task_id = tasks.id AND d.resolved = 0
               )",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Mark the task's group completed once every member task is terminal.
    /// Idempotent; harmless when racing with other terminal transitions.
    async fn check_group_completion(&self, task_id: &str) -> BoardResult<()> {
        let row = sqlx::query("SELECT group_id FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(self.store.pool())
            .await?;
        let Some(row) = row else { return Ok(()) };
        let Some(group_id) = row.get::<Option<String>, _>("group_id") else {
            return Ok(());
        };

        let non_terminal_sql = format!(
            "SELECT 1 FROM tasks WHERE group_id = ? AND status NOT IN {TERMINAL_STATUSES} LIMIT 1"
        );
        let non_terminal = sqlx::query(&non_terminal_sql)
            .bind(&group_id)
            .fetch_optional(self.store.pool())
            .await?;
        if non_terminal.is_some() {
            return Ok(());
        }

        let now = self.now().to_rfc3339();
        sqlx::query(
            "UPDATE groups SET status = 'completed', completed_at = ?
             WHERE id = ? AND status = 'active'",
        )
        .bind(&now)
        .bind(&group_id)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cycle detection
    // ------------------------------------------------------------------

    /// Would adding the edge `task_id blocked-by blocked_by_id` create a
    /// cycle? BFS upstream from the blocker through unresolved edges; a path
    /// back to `task_id` (or a self-edge) is a cycle.
    pub async fn has_cycle(&self, task_id: &str, blocked_by_id: &str) -> BoardResult<bool> {
        if task_id == blocked_by_id {
            return Ok(true);
        }

        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::from([blocked_by_id.to_string()]);

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }
            let rows = sqlx::query(
                "SELECT blocked_by FROM task_dependencies WHERE task_id = ? AND resolved = 0",
            )
            .bind(&current)
            .fetch_all(self.store.pool())
            .await?;
            for row in rows {
                let upstream: String = row.get("blocked_by");
                if upstream == task_id {
                    return Ok(true);
                }
                if !visited.contains(&upstream) {
                    queue.push_back(upstream);
                }
            }
        }

        Ok(false)
    }

    // ------------------------------------------------------------------
    // Board view & search
    // ------------------------------------------------------------------

    /// Tasks grouped by status, with optional filters.
    pub async fn get_board(
        &self,
        filters: &BoardFilters,
    ) -> BoardResult<BTreeMap<String, Vec<Task>>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut params: Vec<&str> = Vec::new();

        if let Some(ref v) = filters.group_id {
            clauses.push("group_id = ?");
            params.push(v.as_str());
        }
        if let Some(ref v) = filters.assigned_to {
            clauses.push("assigned_to = ?");
            params.push(v.as_str());
        }
        if let Some(ref v) = filters.claimed_by {
            clauses.push("claimed_by = ?");
            params.push(v.as_str());
        }
        if let Some(ref v) = filters.task_type {
            clauses.push("task_type = ?");
            params.push(v.as_str());
        }
        if let Some(ref v) = filters.priority {
            clauses.push("priority = ?");
            params.push(v.as_str());
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let sql = format!("SELECT * FROM tasks{where_clause} ORDER BY created_at");

        let mut query = sqlx::query(&sql);
        for param in params {
            query = query.bind(param);
        }
        let rows = query.fetch_all(self.store.pool()).await?;

        let mut board: BTreeMap<String, Vec<Task>> = BTreeMap::new();
        for row in &rows {
            let task = Self::row_to_task(row)?;
            board
                .entry(task.status.to_string())
                .or_default()
                .push(task);
        }
        Ok(board)
    }

    /// LIKE-based search over title and description with optional filters
    /// and a total count for pagination.
    pub async fn search_tasks(&self, search: &SearchQuery) -> BoardResult<SearchResult> {
        let like = format!("%{}%", search.query);
        let mut clauses = vec!["(title LIKE ? OR description LIKE ?)".to_string()];
        let mut params: Vec<&str> = vec![like.as_str(), like.as_str()];

        if let Some(ref v) = search.group_id {
            clauses.push("group_id = ?".to_string());
            params.push(v.as_str());
        }
        if let Some(ref v) = search.status {
            clauses.push("status = ?".to_string());
            params.push(v.as_str());
        }
        if let Some(ref v) = search.assigned_to {
            clauses.push("assigned_to = ?".to_string());
            params.push(v.as_str());
        }
        if let Some(ref v) = search.task_type {
            clauses.push("task_type = ?".to_string());
            params.push(v.as_str());
        }
        if let Some(ref v) = search.priority {
            clauses.push("priority = ?".to_string());
            params.push(v.as_str());
        }

        let where_clause = format!(" WHERE {}", clauses.join(" AND "));

        let count_sql = format!("SELECT COUNT(*) AS total FROM tasks{where_clause}");
        let mut count_query = sqlx::query(&count_sql);
        for param in &params {
            count_query = count_query.bind(*param);
        }
        let total: i64 = count_query
            .fetch_one(self.store.pool())
            .await?
            .get("total");

        let page_sql =
            format!("SELECT * FROM tasks{where_clause} ORDER BY created_at LIMIT ? OFFSET ?");
        let mut page_query = sqlx::query(&page_sql);
        for param in &params {
            page_query = page_query.bind(*param);
        }
        let rows = page_query
            .bind(search.limit)
            .bind(search.offset)
            .fetch_all(self.store.pool())
            .await?;
        let tasks: BoardResult<Vec<Task>> = rows.iter().map(Self::row_to_task).collect();

        Ok(SearchResult {
            tasks: tasks?,
            total,
            limit: search.limit,
            offset: search.offset,
        })
    }

    /// Distinct filter values for the dashboard filter bar.
    pub async fn board_filter_values(&self) -> BoardResult<serde_json::Value> {
        let assignees: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT assigned_to FROM tasks WHERE assigned_to IS NOT NULL ORDER BY 1",
        )
        .fetch_all(self.store.pool())
        .await?;
        let task_types: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT task_type FROM tasks WHERE task_type IS NOT NULL ORDER BY 1",
        )
        .fetch_all(self.store.pool())
        .await?;
        let groups: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM groups ORDER BY created_at")
                .fetch_all(self.store.pool())
                .await?;

        Ok(serde_json::json!({
            "assignees": assignees.into_iter().map(|t| t.0).collect::<Vec<_>>(),
            "task_types": task_types.into_iter().map(|t| t.0).collect::<Vec<_>>(),
            "priorities": ["critical", "high", "medium", "low"],
            "groups": groups.into_iter().map(|t| t.0).collect::<Vec<_>>(),
        }))
    }

    /// Number of claimable tasks for a role (auto-scaler backlog signal).
    pub async fn pending_count_for_role(&self, role: &str) -> BoardResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM tasks
             WHERE assigned_to = ? AND status = 'pending' AND claimed_by IS NULL",
        )
        .bind(role)
        .fetch_one(self.store.pool())
        .await?;
        Ok(row.get("n"))
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Startup-only: reset every in_progress task to pending with a cleared
    /// claim. Safe only because a single process owns the database and all
    /// agents are new on restart.
    pub async fn recover_orphaned_tasks(&self) -> BoardResult<Vec<Task>> {
        let rows = sqlx::query(
            "UPDATE tasks SET status = 'pending', claimed_by = NULL, started_at = NULL
             WHERE status = 'in_progress' RETURNING *",
        )
        .fetch_all(self.store.pool())
        .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    /// Reset in_progress tasks claimed by the given (stale) instances. Safe
    /// during normal operation. Dependencies of the recovered tasks are
    /// re-resolved to unblock any consistency misses.
    pub async fn recover_stale_in_progress_tasks(
        &self,
        stale_instance_ids: &[String],
    ) -> BoardResult<Vec<Task>> {
        if stale_instance_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; stale_instance_ids.len()].join(", ");
        let sql = format!(
            "UPDATE tasks SET status = 'pending', claimed_by = NULL, started_at = NULL
             WHERE status = 'in_progress' AND claimed_by IN ({placeholders})
             RETURNING *"
        );
        let mut query = sqlx::query(&sql);
        for id in stale_instance_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(self.store.pool()).await?;
        let recovered: BoardResult<Vec<Task>> = rows.iter().map(Self::row_to_task).collect();
        let recovered = recovered?;

        // No-op on pending tasks, but re-checks blocked dependents.
        for task in &recovered {
            self.resolve_dependencies(&task.id).await?;
        }

        Ok(recovered)
    }

    /// Repair blocked tasks whose unresolved blockers already reached a
    /// terminal state (missed resolution after a crash or race). Failed
    /// blockers cascade; fully-resolved tasks flip to pending.
    pub async fn recover_stuck_blocked_tasks(&self) -> BoardResult<Vec<Task>> {
        let stuck = sqlx::query(
            "SELECT DISTINCT d.task_id, d.blocked_by, t2.status AS blocker_status
             FROM task_dependencies d
             JOIN tasks t ON t.id = d.task_id AND t.status = 'blocked'
             JOIN tasks t2 ON t2.id = d.blocked_by
             WHERE d.resolved = 0
               AND t2.status IN ('completed', 'failed')",
        )
        .fetch_all(self.store.pool())
        .await?;
        if stuck.is_empty() {
            return Ok(Vec::new());
        }

        let mut repaired: Vec<Task> = Vec::new();
        let mut failed_seen: HashSet<String> = HashSet::new();

        for row in &stuck {
            let task_id: String = row.get("task_id");
            let blocker_status: String = row.get("blocker_status");

            sqlx::query(
                "UPDATE task_dependencies SET resolved = 1
                 WHERE task_id = ? AND blocked_by = ?",
            )
            .bind(&task_id)
            .bind(row.get::<String, _>("blocked_by"))
            .execute(self.store.pool())
            .await?;

            if blocker_status == "failed" && failed_seen.insert(task_id.clone()) {
                sqlx::query(
                    "UPDATE tasks SET status = 'failed' WHERE id = ? AND status = 'blocked'",
                )
                .bind(&task_id)
                .execute(self.store.pool())
                .await?;
                if let Some(task) = self.fetch_task(&task_id).await? {
                    repaired.push(task);
                }
                self.cascade_failure(&task_id).await?;
            }
        }

        // Flip any task that is now fully unblocked.
        let newly_free = sqlx::query(
            "UPDATE tasks SET status = 'pending'
             WHERE status = 'blocked'
               AND NOT EXISTS (
                 SELECT 1 FROM task_dependencies d
                 WHERE d.task_id = tasks.id AND d.resolved = 0
               )
             RETURNING *",
        )
        .fetch_all(self.store.pool())
        .await?;
        for row in &newly_free {
            repaired.push(Self::row_to_task(row)?);
        }

        Ok(repaired)
    }

    // ------------------------------------------------------------------
    // Batch operations
    // ------------------------------------------------------------------

    /// Apply one action to many tasks, skipping rows that fail their
    /// precondition instead of aborting the batch.
    pub async fn batch_update_tasks(
        &self,
        task_ids: &[String],
        action: &BatchAction,
    ) -> BoardResult<BatchResult> {
        let mut result = BatchResult::default();

        for task_id in task_ids {
            let outcome = match action {
                BatchAction::Cancel { reason } => {
                    self.cancel_task(task_id, reason.as_deref()).await
                }
                BatchAction::Reassign { assigned_to } => {
                    self.reassign_task(task_id, assigned_to).await
                }
                BatchAction::ChangePriority { priority } => {
                    self.change_priority(task_id, *priority).await
                }
                BatchAction::Retry => self.retry_task(task_id).await,
            };
            match outcome {
                Ok(_) => {
                    result.updated += 1;
                    result.task_ids.push(task_id.clone());
                }
                Err(err) if err.is_precondition() => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(result)
    }

    // ------------------------------------------------------------------
    // Templates
    // ------------------------------------------------------------------

    /// Insert a new task template.
    pub async fn create_template(
        &self,
        name: &str,
        title_template: &str,
        description_template: Option<&str>,
        task_type: &str,
        assigned_to: &str,
        priority: TaskPriority,
    ) -> BoardResult<TaskTemplate> {
        self.store.register_prefix("TPL").await?;
        let template_id = self.store.allocate_id("TPL").await?;
        let now = self.now().to_rfc3339();

        sqlx::query(
            "INSERT INTO task_templates
             (id, name, title_template, description_template, task_type,
              assigned_to, priority, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&template_id)
        .bind(name)
        .bind(title_template)
        .bind(description_template)
        .bind(task_type)
        .bind(assigned_to)
        .bind(priority.as_str())
        .bind(now)
        .execute(self.store.pool())
        .await?;

        Ok(TaskTemplate {
            id: template_id,
            name: name.to_string(),
            title_template: title_template.to_string(),
            description_template: description_template.map(str::to_string),
            task_type: task_type.to_string(),
            assigned_to: assigned_to.to_string(),
            priority,
        })
    }

    pub async fn get_templates(&self) -> BoardResult<Vec<TaskTemplate>> {
        let rows = sqlx::query("SELECT * FROM task_templates ORDER BY created_at")
            .fetch_all(self.store.pool())
            .await?;
        Ok(rows
            .iter()
            .map(|row| TaskTemplate {
                id: row.get("id"),
                name: row.get("name"),
                title_template: row.get("title_template"),
                description_template: row.get("description_template"),
                task_type: row.get::<Option<String>, _>("task_type").unwrap_or_default(),
                assigned_to: row
                    .get::<Option<String>, _>("assigned_to")
                    .unwrap_or_default(),
                priority: row
                    .get::<Option<String>, _>("priority")
                    .as_deref()
                    .and_then(TaskPriority::from_str)
                    .unwrap_or_default(),
            })
            .collect())
    }

    /// Create a task from a named template, substituting `{key}`
    /// placeholders in title and description.
    pub async fn create_from_template(
        &self,
        template_name: &str,
        group_id: &str,
        variables: &HashMap<String, String>,
    ) -> BoardResult<Task> {
        let row = sqlx::query("SELECT * FROM task_templates WHERE name = ?")
            .bind(template_name)
            .fetch_optional(self.store.pool())
            .await?
            .ok_or_else(|| BoardError::TemplateNotFound(template_name.to_string()))?;

        let mut title: String = row.get("title_template");
        let mut description: String = row
            .get::<Option<String>, _>("description_template")
            .unwrap_or_default();
        for (key, value) in variables {
            let placeholder = format!("{{{key}}}");
            title = title.replace(&placeholder, value);
            description = description.replace(&placeholder, value);
        }

        let priority = row
            .get::<Option<String>, _>("priority")
            .as_deref()
            .and_then(TaskPriority::from_str)
            .unwrap_or_default();

        self.create_task(NewTask {
            group_id: group_id.to_string(),
            title,
            task_type: row.get::<Option<String>, _>("task_type").unwrap_or_default(),
            assigned_to: row
                .get::<Option<String>, _>("assigned_to")
                .unwrap_or_default(),
            description: if description.is_empty() {
                None
            } else {
                Some(description)
            },
            priority,
            ..NewTask::default()
        })
        .await
    }

    // ------------------------------------------------------------------
    // Workflows
    // ------------------------------------------------------------------

    /// Insert a workflow definition. `steps` must be a JSON array of step
    /// objects (validated here).
    pub async fn create_workflow(
        &self,
        name: &str,
        description: Option<&str>,
        steps: &serde_json::Value,
    ) -> BoardResult<String> {
        let _: Vec<WorkflowStep> = serde_json::from_value(steps.clone())?;
        self.store.register_prefix("WF").await?;
        let workflow_id = self.store.allocate_id("WF").await?;
        let now = self.now().to_rfc3339();

        sqlx::query(
            "INSERT INTO workflow_definitions (id, name, description, steps, active, created_at)
             VALUES (?, ?, ?, ?, 1, ?)",
        )
        .bind(&workflow_id)
        .bind(name)
        .bind(description)
        .bind(serde_json::to_string(steps)?)
        .bind(now)
        .execute(self.store.pool())
        .await?;

        Ok(workflow_id)
    }

    pub async fn get_workflows(&self) -> BoardResult<Vec<serde_json::Value>> {
        let rows = sqlx::query("SELECT * FROM workflow_definitions ORDER BY created_at")
            .fetch_all(self.store.pool())
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let steps: String = row.get("steps");
                serde_json::json!({
                    "id": row.get::<String, _>("id"),
                    "name": row.get::<String, _>("name"),
                    "description": row.get::<Option<String>, _>("description"),
                    "steps": serde_json::from_str::<serde_json::Value>(&steps)
                        .unwrap_or(serde_json::Value::Null),
                    "active": row.get::<i64, _>("active") != 0,
                })
            })
            .collect())
    }

    /// Load a workflow and create its tasks in `group_id`, each step
    /// blocked by the previous one.
    pub async fn start_workflow(
        &self,
        workflow_id: &str,
        group_id: &str,
    ) -> BoardResult<Vec<Task>> {
        let row = sqlx::query("SELECT * FROM workflow_definitions WHERE id = ?")
            .bind(workflow_id)
            .fetch_optional(self.store.pool())
            .await?
            .ok_or_else(|| BoardError::WorkflowNotFound(workflow_id.to_string()))?;

        let steps_json: String = row.get("steps");
        let steps: Vec<WorkflowStep> = serde_json::from_str(&steps_json)?;

        let mut created: Vec<Task> = Vec::with_capacity(steps.len());
        let mut prev_task_id: Option<String> = None;

        for step in steps {
            let blocked_by = prev_task_id.clone().into_iter().collect();
            let task = self
                .create_task(NewTask {
                    group_id: group_id.to_string(),
                    title: step.title,
                    task_type: step.task_type,
                    assigned_to: step.assigned_to,
                    description: step.description,
                    priority: step
                        .priority
                        .as_deref()
                        .and_then(TaskPriority::from_str)
                        .unwrap_or_default(),
                    blocked_by,
                    ..NewTask::default()
                })
                .await?;
            prev_task_id = Some(task.id.clone());
            created.push(task);
        }

        Ok(created)
    }

    // ------------------------------------------------------------------
    // Failure classification
    // ------------------------------------------------------------------

    /// Classify a failure via keyword matching on the recorded reason.
    pub async fn classify_failure(&self, task_id: &str) -> BoardResult<FailureClass> {
        let task = self.fetch_task_required(task_id).await?;
        let reason = task.rejection_reason.unwrap_or_default().to_lowercase();

        const TRANSIENT: &[&str] = &[
            "timeout",
            "timed out",
            "network",
            "connection",
            "rate limit",
            "ratelimit",
            "retry",
            "503",
            "502",
            "504",
            "temporary",
            "unavailable",
        ];
        const PERMANENT: &[&str] = &[
            "not found",
            "missing",
            "does not exist",
            "404",
            "forbidden",
            "403",
            "deleted",
            "gone",
            "no such",
            "permission denied",
        ];

        if TRANSIENT.iter().any(|kw| reason.contains(kw)) {
            return Ok(FailureClass::Transient);
        }
        if PERMANENT.iter().any(|kw| reason.contains(kw)) {
            return Ok(FailureClass::Permanent);
        }
        Ok(FailureClass::Logic)
    }
}
