//! Runner port: the boundary to the external LLM CLI.
//!
//! The agent loop hands the assembled prompt to a [`Runner`] and records the
//! returned output and usage. Timeout enforcement lives in the agent loop,
//! not in runner implementations.

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by a runner invocation.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to spawn CLI process '{binary}': {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("CLI process exited with status {status}: {stderr}")]
    NonZeroExit { status: i32, stderr: String },

    #[error("Failed to read CLI output: {0}")]
    Io(#[from] std::io::Error),

    #[error("Runner error: {0}")]
    Other(String),
}

/// One execution request: prompt plus per-role invocation settings.
#[derive(Debug, Clone)]
pub struct RunnerRequest {
    /// Role system prompt.
    pub system_prompt: String,
    /// Assembled task context (see `services::prompt`).
    pub prompt: String,
    pub model: Option<String>,
    pub max_turns: u32,
    /// Tools the agent is allowed to use.
    pub allowed_tools: Vec<String>,
    /// Working directory (workspace path when isolated).
    pub cwd: Option<String>,
}

/// Usage metrics reported by the CLI for one invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunnerUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
    pub duration_api_ms: i64,
    pub num_turns: i64,
}

/// Output of a successful runner invocation.
#[derive(Debug, Clone, Default)]
pub struct RunnerResult {
    pub output: String,
    pub usage: Option<RunnerUsage>,
}

/// External agent execution boundary.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Human-readable runner name for logs.
    fn name(&self) -> &str;

    /// Execute one agent turn sequence and return the final output.
    async fn run(&self, request: RunnerRequest) -> Result<RunnerResult, RunnerError>;
}
