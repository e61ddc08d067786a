//! Structured command logging

use async_trait::async_trait;
use serve_core::{ErrorClassifier, ExecOptions, ExecutionResult, ExecutionTarget, HostIdentity};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Emits a record before and after each command and stamps the measured
/// duration on the result.
pub struct LoggingExecutor {
    inner: Arc<dyn ExecutionTarget>,
}

impl LoggingExecutor {
    pub fn new(inner: Arc<dyn ExecutionTarget>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ExecutionTarget for LoggingExecutor {
    fn identity(&self) -> &HostIdentity {
        self.inner.identity()
    }

    async fn execute(&self, command: &str, options: &ExecOptions) -> ExecutionResult {
        let host = self.inner.identity().to_string();
        debug!(host = %host, command, "Executing command");

        let started = Instant::now();
        let result = self.inner.execute(command, options).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        if result.success {
            info!(
                host = %host,
                command,
                exit_code = result.exit_code,
                duration_ms,
                attempts = result.attempts,
                "Command succeeded"
            );
        } else {
            warn!(
                host = %host,
                command,
                exit_code = result.exit_code,
                duration_ms,
                attempts = result.attempts,
                timed_out = result.timed_out,
                kind = %ErrorClassifier::classify_result(&result),
                "Command failed: {}",
                result.error_text()
            );
        }

        result.with_duration_ms(duration_ms)
    }
}
