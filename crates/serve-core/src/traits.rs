//! Core traits for servectl components
//!
//! These traits define the execution seam shared by the local and remote
//! targets, the pooled connections, the resilience decorators and the
//! orchestration layer.

use crate::{ExecOptions, ExecutionResult, HostIdentity, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Runs one command and reports a structured result.
///
/// Implementations never retry internally and never return an error for a
/// failed command: every failure, including a missing connection, is an
/// [`ExecutionResult`] with `success == false`.
#[async_trait]
pub trait ExecutionTarget: Send + Sync {
    /// Identity of the host commands run on
    fn identity(&self) -> &HostIdentity;

    /// Execute `command` with the given options
    async fn execute(&self, command: &str, options: &ExecOptions) -> ExecutionResult;

    /// Execute `command` with default options
    async fn run(&self, command: &str) -> ExecutionResult {
        self.execute(command, &ExecOptions::default()).await
    }
}

/// An execution target with an explicit connection lifecycle
#[async_trait]
pub trait Connection: ExecutionTarget {
    /// Establish the connection. Calling this on a ready connection is a
    /// no-op that succeeds.
    async fn connect(&self) -> Result<()>;

    /// Whether the underlying session is still usable
    fn is_connected(&self) -> bool;

    /// Release the underlying session
    async fn disconnect(&self) -> Result<()>;
}

/// Maps a server id onto an execution target
#[async_trait]
pub trait TargetResolver: Send + Sync {
    async fn resolve(&self, server_id: &str) -> Result<Arc<dyn ExecutionTarget>>;
}
