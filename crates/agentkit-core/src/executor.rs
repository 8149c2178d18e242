//! Tool Executor
//!
//! Resolves a batch of tool calls against the registry and runs them
//! concurrently behind a semaphore. Every call produces exactly one
//! [`ToolResult`]; failures are captured as values and never abort siblings.
//!
//! Each invocation runs on its own task. When a call times out the task is
//! left to finish on its own and its permit is released.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::Semaphore;

use crate::error::ToolErrorKind;
use crate::tool::{ToolCall, ToolRegistry, ToolResult};

/// Executor limits
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Calls allowed to run at once
    pub max_concurrency: usize,

    /// Budget for a single call
    pub call_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            call_timeout: Duration::from_secs(30),
        }
    }
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    permits: Arc<Semaphore>,
    call_timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, config: &ExecutorConfig) -> Self {
        Self {
            registry,
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            call_timeout: config.call_timeout,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Run a batch. Results come back in call order, one per call.
    pub async fn execute(&self, calls: &[ToolCall]) -> Vec<ToolResult> {
        join_all(calls.iter().map(|call| self.execute_one(call))).await
    }

    async fn execute_one(&self, call: &ToolCall) -> ToolResult {
        let started = Instant::now();
        let result = self.run_call(call).await;
        audit(call, &result, started.elapsed());
        result
    }

    async fn run_call(&self, call: &ToolCall) -> ToolResult {
        let handle = match self.registry.resolve(call) {
            Ok(spec) => Arc::clone(&spec.handle),
            Err(kind) => return ToolResult::failure(call, kind),
        };

        let Ok(_permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return ToolResult::failure(call, ToolErrorKind::Execution("executor closed".into()));
        };

        let arguments = call.arguments.clone();
        let task = tokio::spawn(async move { handle.invoke(&arguments).await });

        match tokio::time::timeout(self.call_timeout, task).await {
            Ok(Ok(Ok(output))) => ToolResult::success(call, output),
            Ok(Ok(Err(e))) => ToolResult::failure(call, ToolErrorKind::Execution(format!("{e:#}"))),
            Ok(Err(join_err)) => ToolResult::failure(
                call,
                ToolErrorKind::Execution(if join_err.is_panic() {
                    "tool panicked".into()
                } else {
                    "tool task aborted".into()
                }),
            ),
            Err(_) => ToolResult::failure(
                call,
                ToolErrorKind::ToolTimeout(
                    u64::try_from(self.call_timeout.as_millis()).unwrap_or(u64::MAX),
                ),
            ),
        }
    }
}

fn audit(call: &ToolCall, result: &ToolResult, elapsed: Duration) {
    let outcome = match &result.error {
        None => "ok",
        Some(ToolErrorKind::UnknownTool(_)) => "unknown_tool",
        Some(ToolErrorKind::InvalidArguments(_)) => "invalid_arguments",
        Some(ToolErrorKind::ToolTimeout(_)) => "timeout",
        Some(ToolErrorKind::Execution(_)) => "error",
        Some(ToolErrorKind::Cancelled) => "cancelled",
    };
    tracing::info!(
        tool = %call.name,
        call_id = %call.id,
        ok = result.is_success(),
        outcome,
        duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        args_preview = %args_preview(&call.arguments),
        "tool_audit"
    );
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{EchoTool, FailingTool, SlowTool};
    use crate::tool::ToolStatus;
    use serde_json::json;
    use std::collections::HashSet;

    fn executor(max_concurrency: usize, call_timeout: Duration) -> ToolExecutor {
        let registry = ToolRegistry::builder()
            .register(EchoTool)
            .register(FailingTool)
            .register(SlowTool::new(Duration::from_millis(200)))
            .build()
            .unwrap();
        ToolExecutor::new(
            Arc::new(registry),
            &ExecutorConfig { max_concurrency, call_timeout },
        )
    }

    #[tokio::test]
    async fn test_one_result_per_call_in_order() {
        let exec = executor(4, Duration::from_secs(5));
        let calls = vec![
            ToolCall::new("a", "echo", json!({"text": "hi"})),
            ToolCall::new("b", "nope", json!({})),
            ToolCall::new("c", "echo", json!({"text": 3})),
            ToolCall::new("d", "fail", json!({})),
        ];
        let results = exec.execute(&calls).await;

        assert_eq!(results.len(), calls.len());
        let ids: Vec<_> = results.iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);

        assert_eq!(results[0].status, ToolStatus::Success);
        assert_eq!(results[0].output, Some(json!({"text": "hi"})));
        assert_eq!(results[1].error, Some(ToolErrorKind::UnknownTool("nope".into())));
        assert!(matches!(results[2].error, Some(ToolErrorKind::InvalidArguments(_))));
        assert!(matches!(results[3].error, Some(ToolErrorKind::Execution(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_isolated() {
        let exec = executor(4, Duration::from_millis(50));
        let calls = vec![
            ToolCall::new("slow", "slow", json!({})),
            ToolCall::new("fast", "echo", json!({"text": "ok"})),
        ];
        let results = exec.execute(&calls).await;
        assert_eq!(results[0].error, Some(ToolErrorKind::ToolTimeout(50)));
        assert!(results[1].is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let slow = SlowTool::new(Duration::from_millis(100));
        let peak = slow.peak();
        let registry = ToolRegistry::builder().register(slow).build().unwrap();
        let exec = ToolExecutor::new(
            Arc::new(registry),
            &ExecutorConfig { max_concurrency: 2, call_timeout: Duration::from_secs(5) },
        );
        let calls: Vec<_> = (0..6)
            .map(|i| ToolCall::new(format!("c{i}"), "slow", json!({})))
            .collect();
        let results = exec.execute(&calls).await;

        assert!(results.iter().all(ToolResult::is_success));
        let unique: HashSet<_> = results.iter().map(|r| r.call_id.clone()).collect();
        assert_eq!(unique.len(), 6);
        assert_eq!(peak.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn test_args_preview_truncates() {
        let long = json!({"text": "x".repeat(500)});
        assert!(args_preview(&long).ends_with("..."));
        assert_eq!(args_preview(&json!({})), "{}");
    }
}
