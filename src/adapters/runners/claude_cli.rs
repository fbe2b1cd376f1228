//! Claude CLI runner.
//!
//! Spawns the `claude` command-line tool in non-interactive print mode and
//! parses its JSON result envelope for output text and usage metrics.

use crate::domain::ports::{Runner, RunnerError, RunnerRequest, RunnerResult, RunnerUsage};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

/// Configuration for the CLI runner.
#[derive(Debug, Clone)]
pub struct ClaudeCliConfig {
    /// Path to the CLI binary.
    pub binary_path: String,
    /// Extra flags appended to every invocation.
    pub extra_flags: Vec<String>,
}

impl Default for ClaudeCliConfig {
    fn default() -> Self {
        Self {
            binary_path: "claude".to_string(),
            extra_flags: vec![],
        }
    }
}

/// Runner invoking the Claude CLI as a subprocess per task.
pub struct ClaudeCliRunner {
    config: ClaudeCliConfig,
}

impl ClaudeCliRunner {
    pub fn new(config: ClaudeCliConfig) -> Self {
        Self { config }
    }

    /// Check whether the configured binary responds to `--version`.
    pub async fn is_available(&self) -> bool {
        Command::new(&self.config.binary_path)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn build_args(&self, request: &RunnerRequest) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "json".to_string(),
            "--max-turns".to_string(),
            request.max_turns.to_string(),
        ];

        if let Some(ref model) = request.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        if !request.system_prompt.is_empty() {
            args.push("--system-prompt".to_string());
            args.push(request.system_prompt.clone());
        }

        if !request.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(request.allowed_tools.join(","));
        }

        args.extend(self.config.extra_flags.clone());

        args.push("-p".to_string());
        args.push(request.prompt.clone());

        args
    }

    /// Parse the CLI's JSON envelope. Plain text output is accepted as-is
    /// with no usage attached.
    fn parse_output(stdout: &str) -> RunnerResult {
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(stdout.trim()) {
            let output = json
                .get("result")
                .and_then(|r| r.as_str())
                .unwrap_or("")
                .to_string();
            let usage = json.get("usage").map(|u| RunnerUsage {
                input_tokens: u.get("input_tokens").and_then(serde_json::Value::as_i64).unwrap_or(0),
                output_tokens: u
                    .get("output_tokens")
                    .and_then(serde_json::Value::as_i64)
                    .unwrap_or(0),
                cost_usd: json
                    .get("total_cost_usd")
                    .and_then(serde_json::Value::as_f64)
                    .unwrap_or(0.0),
                duration_api_ms: json
                    .get("duration_api_ms")
                    .and_then(serde_json::Value::as_i64)
                    .unwrap_or(0),
                num_turns: json
                    .get("num_turns")
                    .and_then(serde_json::Value::as_i64)
                    .unwrap_or(0),
            });
            return RunnerResult { output, usage };
        }

        RunnerResult {
            output: stdout.to_string(),
            usage: None,
        }
    }
}

#[async_trait]
impl Runner for ClaudeCliRunner {
    fn name(&self) -> &str {
        "claude_cli"
    }

    async fn run(&self, request: RunnerRequest) -> Result<RunnerResult, RunnerError> {
        let args = self.build_args(&request);
        let mut command = Command::new(&self.config.binary_path);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = request.cwd {
            command.current_dir(cwd);
        }

        let output = command.output().await.map_err(|e| RunnerError::Spawn {
            binary: self.config.binary_path.clone(),
            source: e,
        })?;

        if !output.status.success() {
            return Err(RunnerError::NonZeroExit {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(Self::parse_output(&stdout))
    }
}
