//! TaskBrew — multi-agent AI team orchestrator.
//!
//! The core is a task orchestration engine:
//! - Persistent task graph (groups, tasks, blocking dependencies) over
//!   SQLite with WAL mode
//! - Atomic claim/execute/complete cycle per agent worker with timeout and
//!   retry handling
//! - Heartbeat-driven recovery of orphaned and stuck tasks
//! - Per-role auto-scaling and validated cross-role task routing
//! - Event bus feeding in-process subscribers and the dashboard WebSocket

pub mod adapters;
pub mod api;
pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use application::Orchestrator;
pub use domain::{BoardError, BoardResult};
pub use services::TaskBoard;
