//! Counting connector for pool tests

use async_trait::async_trait;
use serve_core::{Connection, ExecOptions, ExecutionResult, ExecutionTarget, HostIdentity};
use serve_exec::Connector;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A fake connection that answers every command with its own serial number
pub struct CountingConnection {
    identity: HostIdentity,
    serial: usize,
    connected: AtomicBool,
    disconnects: Arc<AtomicUsize>,
    exec_delay: Option<Duration>,
}

impl CountingConnection {
    pub fn serial(&self) -> usize {
        self.serial
    }

    /// Simulate the remote end dropping the session
    pub fn drop_session(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExecutionTarget for CountingConnection {
    fn identity(&self) -> &HostIdentity {
        &self.identity
    }

    async fn execute(&self, _command: &str, _options: &ExecOptions) -> ExecutionResult {
        if let Some(delay) = self.exec_delay {
            tokio::time::sleep(delay).await;
        }
        if !self.connected.load(Ordering::SeqCst) {
            return ExecutionResult::not_connected(&self.identity);
        }
        ExecutionResult::ok(format!("connection-{}", self.serial))
    }
}

#[async_trait]
impl Connection for CountingConnection {
    async fn connect(&self) -> serve_core::Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> serve_core::Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector that hands out [`CountingConnection`]s and counts dials
#[derive(Default)]
pub struct CountingConnector {
    dials: AtomicUsize,
    disconnects: Arc<AtomicUsize>,
    dial_delay: Option<Duration>,
    exec_delay: Option<Duration>,
    failure: Mutex<Option<String>>,
    connections: Mutex<Vec<Arc<CountingConnection>>>,
}

impl CountingConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every dial take `delay`
    pub fn with_dial_delay(mut self, delay: Duration) -> Self {
        self.dial_delay = Some(delay);
        self
    }

    /// Make every command on the handed-out connections take `delay`
    pub fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = Some(delay);
        self
    }

    /// Make dials fail with `message` until cleared with `None`
    pub fn fail_with(&self, message: Option<&str>) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = message.map(str::to_string);
        }
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Every connection handed out so far, in dial order
    pub fn connections(&self) -> Vec<Arc<CountingConnection>> {
        self.connections.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Connector for CountingConnector {
    async fn connect(&self, identity: &HostIdentity) -> serve_core::Result<Arc<dyn Connection>> {
        if let Some(delay) = self.dial_delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.failure.lock().ok().and_then(|f| f.clone());
        if let Some(message) = failure {
            return Err(serve_core::Error::connection(message));
        }

        let serial = self.dials.fetch_add(1, Ordering::SeqCst) + 1;
        let connection = Arc::new(CountingConnection {
            identity: identity.clone(),
            serial,
            connected: AtomicBool::new(true),
            disconnects: Arc::clone(&self.disconnects),
            exec_delay: self.exec_delay,
        });
        if let Ok(mut connections) = self.connections.lock() {
            connections.push(Arc::clone(&connection));
        }
        Ok(connection)
    }
}
