//! Runner adapters implementing the LLM CLI boundary.

pub mod claude_cli;
pub mod mock;

pub use claude_cli::{ClaudeCliConfig, ClaudeCliRunner};
pub use mock::{MockOutcome, MockRunner};
