//! Domain errors for the TaskBrew orchestration engine.

use thiserror::Error;

/// Errors raised by the task board, route validator, and supporting services.
///
/// Precondition variants map to 4xx responses at the API boundary and are
/// never retried automatically. Infrastructure variants are fatal at startup.
#[derive(Debug, Error)]
pub enum BoardError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Unregistered ID prefix: {0}")]
    UnregisteredPrefix(String),

    #[error("Dependency {task_id} -> {blocked_by} would create a cycle")]
    CycleInDependency { task_id: String, blocked_by: String },

    #[error("Cannot {action} task {task_id} in status '{status}'")]
    IllegalStatus {
        task_id: String,
        status: String,
        action: &'static str,
    },

    #[error("Unknown target role: '{0}'")]
    InvalidRole(String),

    #[error("Role '{role}' does not accept task_type '{task_type}'")]
    UnacceptedType { role: String, task_type: String },

    #[error(
        "Role '{creator}' is not allowed to create '{task_type}' tasks for role '{target}' (restricted routing mode)"
    )]
    RouteForbidden {
        creator: String,
        target: String,
        task_type: String,
    },

    #[error("Group '{group_id}' has {count} tasks, exceeding limit of {limit}")]
    GroupFull {
        group_id: String,
        count: usize,
        limit: usize,
    },

    #[error("Task depth {depth} exceeds limit of {limit}")]
    DepthExceeded { depth: usize, limit: usize },

    #[error(
        "Rejection cycle limit reached ({count} revision/bug_fix tasks in chain). Human intervention required."
    )]
    CycleLimit { count: usize },

    #[error("Unknown batch action: '{0}'")]
    UnknownBatchAction(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Convenience alias used throughout the services and application layers.
pub type BoardResult<T> = Result<T, BoardError>;

impl From<sqlx::Error> for BoardError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for BoardError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl BoardError {
    /// Whether this error is a caller precondition failure (4xx-equivalent)
    /// rather than an infrastructure fault.
    pub fn is_precondition(&self) -> bool {
        !matches!(
            self,
            Self::Database(_) | Self::Serialization(_) | Self::Execution(_) | Self::Config(_)
        )
    }
}
