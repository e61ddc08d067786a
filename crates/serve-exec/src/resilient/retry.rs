//! Retry with exponential backoff

use async_trait::async_trait;
use serve_core::{ErrorClassifier, ExecOptions, ExecutionResult, ExecutionTarget, HostIdentity, RetryConfig};
use std::sync::Arc;
use tracing::{debug, warn};

/// Re-runs failed commands whose failure classifies as retryable.
///
/// Attempt `n` (zero-based) waits `initial_delay * multiplier^n` before the
/// next one. The returned result records how many attempts were made.
pub struct RetryExecutor {
    inner: Arc<dyn ExecutionTarget>,
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(inner: Arc<dyn ExecutionTarget>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl ExecutionTarget for RetryExecutor {
    fn identity(&self) -> &HostIdentity {
        self.inner.identity()
    }

    async fn execute(&self, command: &str, options: &ExecOptions) -> ExecutionResult {
        let max_attempts = self.config.max_retries + 1;
        let mut attempt = 1;

        loop {
            let mut result = self.inner.execute(command, options).await;

            let retryable = !result.success && ErrorClassifier::is_retryable_result(&result);
            if !retryable || attempt >= max_attempts {
                if !result.success && retryable {
                    warn!(
                        host = %self.inner.identity(),
                        attempts = attempt,
                        "Command failed after exhausting retries: {}",
                        result.error_text()
                    );
                }
                result.attempts = attempt;
                result.retried = attempt > 1;
                return result;
            }

            let delay = self.config.delay_for_attempt(attempt - 1);
            debug!(
                host = %self.inner.identity(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                kind = %ErrorClassifier::classify_result(&result),
                "Retrying command"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
