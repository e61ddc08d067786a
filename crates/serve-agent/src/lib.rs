//! # serve-agent
//!
//! Application wiring and the inbound API for servectl.
//!
//! This crate owns the process-wide singletons (connection pool, error bus,
//! accelerator registry, lifecycle manager), constructed once in an
//! [`AppContext`] and passed explicitly. [`ServeApi`] exposes every
//! operation as a `{success, data, error}` response, and the `servectl`
//! binary drives that API from the command line.

pub mod api;
pub mod context;
pub mod servers;
pub mod sysinfo;

// Re-export commonly used types
pub use api::{AcceleratorInventory, ApiResponse, ConnectionCheck, KillOutcome, ServeApi, ServerSummary};
pub use context::AppContext;
pub use servers::{PoolResolver, ServerRegistry, LOCAL_SERVER_ID};
pub use sysinfo::{DiskUsage, MemoryInfo, SystemInfo};

use serve_core::LoggingConfig;

// Error handling
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Core error: {0}")]
    Core(#[from] serve_core::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Core(e) => e.is_retryable(),
            AgentError::Config(_) => false,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            AgentError::Config(_) => "config",
            AgentError::Core(e) => e.category(),
        }
    }
}

/// Initialize logging and tracing. `RUST_LOG` overrides the configured level.
pub fn init_logging(logging_config: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging_config.level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(logging_config.show_target)
        .with_thread_ids(logging_config.show_thread_ids)
        .with_line_number(logging_config.show_line_numbers);

    let installed = match logging_config.format.as_str() {
        "json" => subscriber.json().try_init(),
        _ => subscriber.try_init(),
    };

    installed.map_err(|e| AgentError::Config(format!("failed to install log subscriber: {}", e)))
}
