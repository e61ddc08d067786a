//! # serve-core
//!
//! Core types, traits, and utilities for servectl - remote execution and
//! model-serving lifecycle orchestration.
//!
//! This crate provides the foundational pieces shared by every other crate:
//!
//! - Host identities and the structured [`ExecutionResult`]
//! - The [`ExecutionTarget`] / [`Connection`] execution seam
//! - The closed failure taxonomy, [`ErrorClassifier`] and [`ErrorBus`]
//! - Configuration schema and loading
//! - The unified [`Error`] type

pub mod bus;
pub mod classify;
pub mod config;
pub mod error;
pub mod traits;
pub mod types;

// Re-export commonly used types at the crate root
pub use bus::{ChannelSubscriber, ErrorBus, ErrorSubscriber, LoggingSubscriber, Subscription};
pub use classify::{ErrorClassifier, ErrorKind, ErrorRecord};
pub use config::{
    AuthConfig, LifecycleConfig, LoggingConfig, PoolConfig, RetryConfig, ServeConfig,
    ServerEntry, TimeoutConfig,
};
pub use error::{Error, Result};
pub use traits::{Connection, ExecutionTarget, TargetResolver};
pub use types::{truncate_output, ExecOptions, ExecutionResult, HostIdentity, HostKind};
