//! # serve-dev
//!
//! Development and testing utilities for servectl.
//!
//! This crate provides:
//! - [`ScriptedTarget`]: an execution target answering from substring rules
//! - [`SimulatedHost`]: a fake host with a process table, listening ports,
//!   GPUs and files that understands the shell commands servectl emits
//! - [`CountingConnector`]: a pool connector that counts dials and disconnects
//! - [`StaticResolver`]: a fixed server-id to target table

pub mod connector;
pub mod host;
pub mod resolver;
pub mod scripted;
pub mod utils;

// Re-export commonly used types
pub use connector::{CountingConnection, CountingConnector};
pub use host::{LaunchBehavior, SimProcess, SimulatedHost};
pub use resolver::StaticResolver;
pub use scripted::ScriptedTarget;
pub use utils::setup_test_logging;
