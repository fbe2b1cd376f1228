//! Task domain model.
//!
//! Tasks are units of agent work identified by `"PREFIX-NNN"` strings.
//! Dependencies between tasks form a DAG persisted as edge rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a task on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on at least one unresolved dependency.
    Blocked,
    /// Ready to be claimed by an agent of the assigned role.
    Pending,
    /// Claimed by an agent instance and executing.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Execution failed (or failure cascaded from a blocker).
    Failed,
    /// Rejected by a reviewer with a reason.
    Rejected,
    /// Cancelled by an operator or a failing parent.
    Cancelled,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocked => "blocked",
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "blocked" => Some(Self::Blocked),
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "rejected" => Some(Self::Rejected),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal states never transition again except via an explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Rejected | Self::Cancelled
        )
    }

    /// Whether a task in this status may be reset to pending via retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed | Self::Rejected | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority level used by the claim query. Lower claim order wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Medium
    }
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    /// Integer used in the claim query's CASE expression.
    pub fn claim_order(&self) -> i64 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of agent work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier, `"PREFIX-NNN"`.
    pub id: String,
    /// Group this task belongs to.
    pub group_id: Option<String>,
    /// Parent task for revision/refinement chains.
    pub parent_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    /// Free-form type string agreed between roles (e.g. `tech_design`).
    pub task_type: Option<String>,
    pub priority: TaskPriority,
    /// Role name this task is assigned to.
    pub assigned_to: Option<String>,
    /// Instance id holding the claim while in progress.
    pub claimed_by: Option<String>,
    pub status: TaskStatus,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    /// Task this one revises, carrying rejection context forward.
    pub revision_of: Option<String>,
    /// Truncated agent output (first 2000 chars, no delimiter).
    pub output_text: Option<String>,
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Edge row of the dependency DAG: `task_id` is blocked by `blocked_by`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDependency {
    pub task_id: String,
    pub blocked_by: String,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for s in [
            TaskStatus::Blocked,
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Rejected,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::from_str(s.as_str()), Some(s));
        }
        assert_eq!(TaskStatus::from_str("bogus"), None);
        // Accept the single-l spelling seen in older rows.
        assert_eq!(TaskStatus::from_str("canceled"), Some(TaskStatus::Cancelled));
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Rejected.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Blocked.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn retryable_states() {
        assert!(TaskStatus::Failed.is_retryable());
        assert!(TaskStatus::Rejected.is_retryable());
        assert!(TaskStatus::Cancelled.is_retryable());
        assert!(!TaskStatus::Completed.is_retryable());
        assert!(!TaskStatus::InProgress.is_retryable());
    }

    #[test]
    fn priority_claim_order() {
        assert!(TaskPriority::Critical.claim_order() < TaskPriority::High.claim_order());
        assert!(TaskPriority::High.claim_order() < TaskPriority::Medium.claim_order());
        assert!(TaskPriority::Medium.claim_order() < TaskPriority::Low.claim_order());
    }
}
