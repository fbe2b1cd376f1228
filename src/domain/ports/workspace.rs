//! Workspace isolation port.
//!
//! Roles with shell access run each task in an isolated checkout so they
//! cannot mutate the main tree. The git worktree implementation is an
//! external collaborator; the core only depends on this seam.

use crate::domain::errors::BoardResult;
use async_trait::async_trait;

/// A leased workspace for one task execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLease {
    pub path: String,
    pub branch: String,
}

/// Provider of isolated working directories.
#[async_trait]
pub trait Workspace: Send + Sync {
    /// Create (or reuse) an isolated workspace for `instance_id` on `branch`.
    async fn create(&self, instance_id: &str, branch: &str) -> BoardResult<WorkspaceLease>;

    /// Tear down the workspace held by `instance_id`. Best-effort.
    async fn cleanup(&self, instance_id: &str) -> BoardResult<()>;

    /// Tear down every workspace. Called during shutdown. Best-effort.
    async fn cleanup_all(&self) -> BoardResult<()>;
}

/// Default provider that performs no isolation: tasks run in the project
/// directory directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWorkspace;

#[async_trait]
impl Workspace for NoWorkspace {
    async fn create(&self, _instance_id: &str, branch: &str) -> BoardResult<WorkspaceLease> {
        Ok(WorkspaceLease {
            path: ".".to_string(),
            branch: branch.to_string(),
        })
    }

    async fn cleanup(&self, _instance_id: &str) -> BoardResult<()> {
        Ok(())
    }

    async fn cleanup_all(&self) -> BoardResult<()> {
        Ok(())
    }
}
