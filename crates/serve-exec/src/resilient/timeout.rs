//! Deadline enforcement

use async_trait::async_trait;
use serve_core::{ExecOptions, ExecutionResult, ExecutionTarget, HostIdentity, TimeoutConfig};
use std::sync::Arc;
use tracing::warn;

/// Bounds every command by a deadline.
///
/// When the deadline elapses the inner future is dropped, which cancels the
/// in-flight command, and a timed-out result is returned.
pub struct TimeoutExecutor {
    inner: Arc<dyn ExecutionTarget>,
    config: TimeoutConfig,
}

impl TimeoutExecutor {
    pub fn new(inner: Arc<dyn ExecutionTarget>, config: TimeoutConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl ExecutionTarget for TimeoutExecutor {
    fn identity(&self) -> &HostIdentity {
        self.inner.identity()
    }

    async fn execute(&self, command: &str, options: &ExecOptions) -> ExecutionResult {
        // A tighter per-call deadline wins over the configured one
        let timeout_ms = options
            .timeout_ms
            .map_or(self.config.timeout_ms, |ms| ms.min(self.config.timeout_ms));

        match tokio::time::timeout(
            std::time::Duration::from_millis(timeout_ms),
            self.inner.execute(command, options),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(host = %self.inner.identity(), timeout_ms, command, "Command timed out");
                ExecutionResult::timed_out(timeout_ms)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serve_core::{ErrorClassifier, ErrorKind};
    use serve_dev::ScriptedTarget;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_slow_command_times_out() {
        let scripted = Arc::new(ScriptedTarget::new().on_delayed(
            "sleep",
            Duration::from_millis(500),
            ExecutionResult::ok("done"),
        ));
        let executor = TimeoutExecutor::new(scripted, TimeoutConfig { timeout_ms: 50 });

        let started = Instant::now();
        let result = executor.run("sleep 1").await;

        assert!(started.elapsed() < Duration::from_millis(300));
        assert!(!result.success);
        assert!(result.timed_out);
        assert_eq!(result.exit_code, -1);
        assert!(result.error_text().contains("50ms"));
        assert_eq!(ErrorClassifier::classify_result(&result), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_fast_command_passes_through() {
        let scripted = Arc::new(ScriptedTarget::new().otherwise(ExecutionResult::ok("hello")));
        let executor = TimeoutExecutor::new(scripted, TimeoutConfig { timeout_ms: 1_000 });

        let result = executor.run("echo hello").await;

        assert!(result.success);
        assert!(!result.timed_out);
        assert_eq!(result.stdout, "hello");
    }

    #[tokio::test]
    async fn test_per_call_deadline_is_tighter() {
        let scripted = Arc::new(ScriptedTarget::new().on_delayed(
            "slow",
            Duration::from_millis(500),
            ExecutionResult::ok("done"),
        ));
        let executor = TimeoutExecutor::new(scripted, TimeoutConfig { timeout_ms: 10_000 });

        let options = ExecOptions::new().with_timeout_ms(30);
        let result = executor.execute("slow", &options).await;

        assert!(result.timed_out);
        assert!(result.error_text().contains("30ms"));
    }
}
