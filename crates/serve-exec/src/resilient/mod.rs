//! Resilience decorators
//!
//! Each decorator implements [`serve_core::ExecutionTarget`] around an inner
//! target, so they stack in any order. [`ExecutorBuilder`] composes them.

pub mod builder;
pub mod logging;
pub mod retry;
pub mod timeout;

pub use builder::ExecutorBuilder;
pub use logging::LoggingExecutor;
pub use retry::RetryExecutor;
pub use timeout::TimeoutExecutor;
