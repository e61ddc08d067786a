//! Execution target backed by the connection pool

use crate::ConnectionPool;
use async_trait::async_trait;
use serve_core::{Error, ExecOptions, ExecutionResult, ExecutionTarget, HostIdentity};
use tracing::{debug, warn};

/// Checks a pooled connection out for each command and returns it afterwards.
///
/// Failing to obtain a connection is reported as a failed
/// [`ExecutionResult`] carrying the dial error, so the retry decorator can
/// classify it like any other command failure.
#[derive(Clone)]
pub struct PooledTarget {
    pool: ConnectionPool,
    identity: HostIdentity,
}

impl PooledTarget {
    pub fn new(pool: ConnectionPool, identity: HostIdentity) -> Self {
        Self { pool, identity }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

#[async_trait]
impl ExecutionTarget for PooledTarget {
    fn identity(&self) -> &HostIdentity {
        &self.identity
    }

    async fn execute(&self, command: &str, options: &ExecOptions) -> ExecutionResult {
        let connection = match self.pool.acquire(&self.identity).await {
            Ok(connection) => connection,
            Err(e) => {
                debug!(host = %self.identity, "Failed to acquire connection: {}", e);
                let message = match e {
                    Error::Connection { message, .. } => message,
                    other => other.to_string(),
                };
                return ExecutionResult::failure(message);
            }
        };

        let lease = Lease::new(&self.pool, &self.identity);
        let result = connection.execute(command, options).await;
        lease.release().await;
        result
    }
}

/// Returns an acquired lease when dropped, so a command cancelled mid-flight
/// (for example by a timeout) still gives its connection back
struct Lease {
    pool: ConnectionPool,
    identity: HostIdentity,
    armed: bool,
}

impl Lease {
    fn new(pool: &ConnectionPool, identity: &HostIdentity) -> Self {
        Self {
            pool: pool.clone(),
            identity: identity.clone(),
            armed: true,
        }
    }

    async fn release(mut self) {
        self.pool.release(&self.identity).await;
        self.armed = false;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        debug!(host = %self.identity, "Command cancelled, releasing its lease");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = self.pool.clone();
                let identity = self.identity.clone();
                handle.spawn(async move { pool.release(&identity).await });
            }
            Err(_) => warn!(host = %self.identity, "No runtime to release a cancelled lease"),
        }
    }
}
