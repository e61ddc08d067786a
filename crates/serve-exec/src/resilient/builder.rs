//! Decorator composition

use super::{LoggingExecutor, RetryExecutor, TimeoutExecutor};
use serve_core::{ExecutionTarget, RetryConfig, TimeoutConfig};
use std::sync::Arc;

/// Wraps a base target in decorators, innermost first.
///
/// `ExecutorBuilder::new(t).with_retry(r).with_timeout(d).with_logging()`
/// produces `Logging(Timeout(Retry(t)))`: the deadline bounds the whole
/// retry loop and the log records the final outcome.
pub struct ExecutorBuilder {
    target: Arc<dyn ExecutionTarget>,
}

impl ExecutorBuilder {
    pub fn new(target: Arc<dyn ExecutionTarget>) -> Self {
        Self { target }
    }

    pub fn with_retry(self, config: RetryConfig) -> Self {
        Self {
            target: Arc::new(RetryExecutor::new(self.target, config)),
        }
    }

    pub fn with_timeout(self, config: TimeoutConfig) -> Self {
        Self {
            target: Arc::new(TimeoutExecutor::new(self.target, config)),
        }
    }

    pub fn with_logging(self) -> Self {
        Self {
            target: Arc::new(LoggingExecutor::new(self.target)),
        }
    }

    pub fn build(self) -> Arc<dyn ExecutionTarget> {
        self.target
    }
}
