//! Per-task usage metrics recorded after each agent execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One usage row: tokens, cost, wall time, and turn count for a single
/// execution of a task by an agent instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUsage {
    pub task_id: String,
    pub agent_id: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
    pub duration_api_ms: i64,
    pub num_turns: i64,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregated usage over a time window, backing the metrics endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
    pub duration_api_ms: i64,
    pub num_turns: i64,
    pub tasks_completed: i64,
}
