//! # serve-exec
//!
//! Execution targets and connection handling for servectl.
//!
//! This crate provides:
//! - [`LocalTarget`]: runs commands through the local shell with a stable locale
//! - [`RemoteShellTarget`]: runs commands over a multiplexed SSH session
//! - [`ConnectionPool`]: one pooled connection per host identity with idle/age eviction
//! - [`PooledTarget`]: an execution target that checks a pooled connection out per command
//! - Retry, timeout and logging decorators composed with [`ExecutorBuilder`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use serve_core::{ExecutionTarget, RetryConfig, TimeoutConfig};
//! use serve_exec::{ExecutorBuilder, LocalTarget};
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let executor = ExecutorBuilder::new(Arc::new(LocalTarget::new()))
//!     .with_retry(RetryConfig::default())
//!     .with_timeout(TimeoutConfig::default())
//!     .with_logging()
//!     .build();
//!
//! let result = executor.run("uname -a").await;
//! println!("{}", result.stdout);
//! # }
//! ```

use thiserror::Error;

pub mod connector;
pub mod local;
pub mod pool;
pub mod pooled;
pub mod remote;
pub mod resilient;

// Re-export commonly used types
pub use connector::{Connector, SshConnector};
pub use local::LocalTarget;
pub use pool::{ConnectionPool, PoolEntryInfo, PoolStats, PoolStatsSnapshot};
pub use pooled::PooledTarget;
pub use remote::{Credential, RemoteShellTarget};
pub use resilient::{ExecutorBuilder, LoggingExecutor, RetryExecutor, TimeoutExecutor};

/// Result type for transport-level operations
pub type Result<T> = std::result::Result<T, ExecError>;

/// Errors raised while establishing a remote session
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("Key error: {0}")]
    Key(#[from] russh_keys::Error),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Missing credential: {0}")]
    MissingCredential(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ExecError> for serve_core::Error {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::MissingCredential(msg) => serve_core::Error::unknown_host(msg),
            other => serve_core::Error::connection(other.to_string()),
        }
    }
}
