//! # serve-accel
//!
//! Accelerator discovery and process control for servectl.
//!
//! Everything here talks to a host through an
//! [`ExecutionTarget`](serve_core::ExecutionTarget) and parses the text
//! output of the vendor tools:
//!
//! - **NVIDIA**: `nvidia-smi` CSV queries
//! - **AMD**: `rocm-smi` CSV and process tables
//! - **Intel**: `xpu-smi` JSON output
//!
//! Output that cannot be parsed degrades to empty results; a host without
//! any accelerator is a normal outcome, not an error.
//!
//! ## Example
//!
//! ```rust,no_run
//! use serve_accel::AcceleratorRegistry;
//! use serve_exec::LocalTarget;
//!
//! # async fn example() {
//! let registry = AcceleratorRegistry::default();
//! let host = LocalTarget::new();
//!
//! match registry.summary(&host).await {
//!     Some(summary) => println!("{} x {}", summary.device_count, summary.vendor),
//!     None => println!("no accelerators"),
//! }
//! # }
//! ```

use thiserror::Error;

pub mod amd;
pub mod handler;
pub mod intel;
pub mod kill;
pub mod nvidia;
pub mod registry;
pub mod types;

// Re-export main types
pub use amd::AmdHandler;
pub use handler::{AcceleratorHandler, KillPolicy};
pub use intel::IntelHandler;
pub use kill::Signal;
pub use nvidia::NvidiaHandler;
pub use registry::AcceleratorRegistry;
pub use types::{AcceleratorDevice, AcceleratorProcess, AcceleratorSummary, Vendor};

/// Result type for accelerator operations
pub type Result<T> = std::result::Result<T, AccelError>;

/// Errors that can occur while interpreting accelerator tool output
#[derive(Error, Debug)]
pub enum AccelError {
    #[error("Unrecognised {tool} output: {message}")]
    Parse { tool: &'static str, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Accelerator tool failed: {0}")]
    ToolFailed(String),
}

impl AccelError {
    pub fn parse(tool: &'static str, message: impl Into<String>) -> Self {
        Self::Parse {
            tool,
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            AccelError::ToolFailed(message) => serve_core::ErrorClassifier::is_retryable(message),
            _ => false,
        }
    }
}
