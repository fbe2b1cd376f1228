//! Mock runner for tests and dry runs.

use crate::domain::ports::{Runner, RunnerError, RunnerRequest, RunnerResult, RunnerUsage};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Scripted outcome for one invocation.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Succeed with this output text.
    Success(String),
    /// Fail with this error message.
    Error(String),
    /// Sleep this long before succeeding (for timeout tests).
    Slow(Duration, String),
}

/// Runner returning scripted outcomes in order; repeats the last outcome
/// once the script is exhausted.
pub struct MockRunner {
    script: Mutex<Vec<MockOutcome>>,
    calls: AtomicUsize,
}

impl MockRunner {
    pub fn new(script: Vec<MockOutcome>) -> Self {
        Self {
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
        }
    }

    /// Runner that always succeeds with the given output.
    pub fn always(output: impl Into<String>) -> Self {
        Self::new(vec![MockOutcome::Success(output.into())])
    }

    /// Number of invocations so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Runner for MockRunner {
    fn name(&self) -> &str {
        "mock"
    }

    async fn run(&self, _request: RunnerRequest) -> Result<RunnerResult, RunnerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = {
            let script = self.script.lock().unwrap();
            let idx = call.min(script.len().saturating_sub(1));
            script
                .get(idx)
                .cloned()
                .unwrap_or_else(|| MockOutcome::Success(String::new()))
        };

        match outcome {
            MockOutcome::Success(output) => Ok(RunnerResult {
                output,
                usage: Some(RunnerUsage {
                    input_tokens: 100,
                    output_tokens: 50,
                    cost_usd: 0.001,
                    duration_api_ms: 10,
                    num_turns: 1,
                }),
            }),
            MockOutcome::Error(message) => Err(RunnerError::Other(message)),
            MockOutcome::Slow(delay, output) => {
                tokio::time::sleep(delay).await;
                Ok(RunnerResult {
                    output,
                    usage: None,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RunnerRequest {
        RunnerRequest {
            system_prompt: String::new(),
            prompt: "do it".into(),
            model: None,
            max_turns: 1,
            allowed_tools: vec![],
            cwd: None,
        }
    }

    #[tokio::test]
    async fn scripted_outcomes_in_order() {
        let runner = MockRunner::new(vec![
            MockOutcome::Error("transient".into()),
            MockOutcome::Success("ok".into()),
        ]);

        assert!(runner.run(request()).await.is_err());
        let result = runner.run(request()).await.unwrap();
        assert_eq!(result.output, "ok");
        // Script is exhausted: last outcome repeats.
        assert_eq!(runner.run(request()).await.unwrap().output, "ok");
        assert_eq!(runner.call_count(), 3);
    }
}
