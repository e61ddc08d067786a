//! Process-wide services, constructed once and passed explicitly

use crate::servers::{PoolResolver, ServerRegistry};
use crate::Result;
use serve_accel::{AcceleratorRegistry, KillPolicy};
use serve_core::{ErrorBus, ExecutionTarget, LoggingSubscriber, ServeConfig, Subscription, TargetResolver};
use serve_exec::{ConnectionPool, Connector, Credential, SshConnector};
use serve_lifecycle::ServiceLifecycleManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// Everything the API layer needs: the pool, the error bus, the
/// accelerator registry and the lifecycle manager, all sharing one
/// configuration.
pub struct AppContext {
    config: ServeConfig,
    servers: Arc<ServerRegistry>,
    pool: ConnectionPool,
    bus: ErrorBus,
    accelerators: Arc<AcceleratorRegistry>,
    resolver: Arc<dyn TargetResolver>,
    lifecycle: ServiceLifecycleManager,
    _log_subscription: Subscription,
}

impl AppContext {
    /// Build the context with SSH transport for every configured server
    pub fn new(config: ServeConfig) -> Result<Self> {
        config.validate()?;

        let connector = SshConnector::new(config.pool.connect_timeout());
        for server in &config.servers {
            connector.register(&server.identity(), Credential::from(&server.auth));
        }
        Self::with_connector(config, Arc::new(connector))
    }

    /// Build the context over a custom connector
    pub fn with_connector(config: ServeConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;

        let servers = Arc::new(ServerRegistry::from_entries(&config.servers));
        let pool = ConnectionPool::new(connector, config.pool.clone());
        let resolver = Arc::new(PoolResolver::new(
            pool.clone(),
            Arc::clone(&servers),
            config.retry.clone(),
            config.timeout.clone(),
        ));
        Ok(Self::assemble(config, servers, pool, resolver))
    }

    /// Build the context with server ids resolved by `resolver` instead of
    /// the pool
    pub fn with_resolver(config: ServeConfig, resolver: Arc<dyn TargetResolver>) -> Result<Self> {
        config.validate()?;

        let connector = Arc::new(SshConnector::new(config.pool.connect_timeout()));
        let servers = Arc::new(ServerRegistry::from_entries(&config.servers));
        let pool = ConnectionPool::new(connector, config.pool.clone());
        Ok(Self::assemble(config, servers, pool, resolver))
    }

    fn assemble(
        config: ServeConfig,
        servers: Arc<ServerRegistry>,
        pool: ConnectionPool,
        resolver: Arc<dyn TargetResolver>,
    ) -> Self {
        let bus = ErrorBus::new();
        let log_subscription = bus.subscribe(LoggingSubscriber);
        let accelerators = Arc::new(AcceleratorRegistry::new(KillPolicy::from(&config.lifecycle)));
        let lifecycle =
            ServiceLifecycleManager::new(Arc::clone(&resolver), Arc::clone(&accelerators), config.lifecycle.clone())
                .with_error_bus(bus.clone());

        info!(servers = servers.len(), "Application context ready");

        Self {
            config,
            servers,
            pool,
            bus,
            accelerators,
            resolver,
            lifecycle,
            _log_subscription: log_subscription,
        }
    }

    pub fn config(&self) -> &ServeConfig {
        &self.config
    }

    pub fn servers(&self) -> &Arc<ServerRegistry> {
        &self.servers
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn error_bus(&self) -> &ErrorBus {
        &self.bus
    }

    pub fn accelerators(&self) -> &Arc<AcceleratorRegistry> {
        &self.accelerators
    }

    pub fn lifecycle(&self) -> &ServiceLifecycleManager {
        &self.lifecycle
    }

    /// Decorated execution target for `server_id`
    pub async fn target(&self, server_id: &str) -> serve_core::Result<Arc<dyn ExecutionTarget>> {
        self.resolver.resolve(server_id).await
    }

    /// Evict idle and over-age connections every `interval`
    pub fn start_maintenance(&self, interval: Duration) -> JoinHandle<()> {
        self.pool.start_cleanup_task(interval)
    }

    /// Disconnect every pooled connection
    pub async fn shutdown(&self) {
        info!("Shutting down application context");
        self.pool.shutdown().await;
    }
}
