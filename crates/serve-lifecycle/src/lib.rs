//! # serve-lifecycle
//!
//! Start and stop long-running inference services on servectl hosts.
//!
//! This crate provides:
//! - The service state machine (`stopped → starting → running → stopping`)
//! - Start-command cleaning and signature extraction
//! - Environment-tool discovery (conda, mamba, micromamba) over a fallback ladder
//! - Port and process-table probes over the shell
//! - A cascading, best-effort stop that does not rely on a remembered pid
//!
//! ## Example
//!
//! ```rust,no_run
//! use serve_lifecycle::{ServiceDescriptor, ServiceLifecycleManager};
//! # use std::sync::Arc;
//! # async fn example(manager: ServiceLifecycleManager) -> serve_lifecycle::Result<()> {
//! let descriptor = ServiceDescriptor::new("llm", "gpu-box-1", "python server.py --port 9000");
//!
//! let report = manager.start(&descriptor).await?;
//! println!("{} (pid {:?})", report.state, report.pid);
//!
//! let stopped = manager.stop(&descriptor).await?;
//! println!("killed {:?}", stopped.killed);
//! # Ok(())
//! # }
//! ```

use thiserror::Error;

pub mod command;
pub mod discovery;
pub mod manager;
pub mod matcher;
pub mod probe;
pub mod types;

// Re-export main types
pub use command::{CommandSignature, ParsedCommand};
pub use discovery::{DiscoveryStep, ToolDiscovery};
pub use manager::ServiceLifecycleManager;
pub use matcher::{DefaultProcessMatcher, ProcessMatcher};
pub use probe::ProcessInfo;
pub use types::{
    EnvType, ObservedState, ServiceDescriptor, ServiceSnapshot, ServiceState, ServiceStatus, StartReport,
    StepOutcome, StopReport, StopStep,
};

/// Result type for lifecycle operations
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Errors raised by the lifecycle manager.
///
/// A service that fails to come up is not an error: it is a
/// [`StartReport`] in the `error` state. These variants cover requests the
/// manager cannot act on at all.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Invalid state transition for service {service}: {from} -> {to}")]
    InvalidTransition {
        service: String,
        from: ServiceState,
        to: ServiceState,
    },

    #[error("Invalid service descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Invalid start command: {0}")]
    InvalidCommand(String),

    #[error(transparent)]
    Core(#[from] serve_core::Error),
}

impl LifecycleError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            LifecycleError::Core(e) => e.is_retryable(),
            _ => false,
        }
    }
}
