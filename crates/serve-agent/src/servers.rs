//! Known servers and resolution of server ids to decorated executors

use async_trait::async_trait;
use dashmap::DashMap;
use serve_core::{
    Error, ExecutionTarget, HostIdentity, Result, RetryConfig, ServerEntry, TargetResolver, TimeoutConfig,
};
use serve_exec::{ConnectionPool, ExecutorBuilder, PooledTarget};
use std::sync::Arc;
use tracing::debug;

/// Server id that always refers to the machine servectl runs on
pub const LOCAL_SERVER_ID: &str = "local";

/// Server entries by id
#[derive(Debug, Default)]
pub struct ServerRegistry {
    entries: DashMap<String, ServerEntry>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: &[ServerEntry]) -> Self {
        let registry = Self::new();
        for entry in entries {
            registry.insert(entry.clone());
        }
        registry
    }

    /// Add or replace an entry; returns the previous one
    pub fn insert(&self, entry: ServerEntry) -> Option<ServerEntry> {
        self.entries.insert(entry.id.clone(), entry)
    }

    pub fn remove(&self, server_id: &str) -> Option<ServerEntry> {
        self.entries.remove(server_id).map(|(_, entry)| entry)
    }

    pub fn get(&self, server_id: &str) -> Option<ServerEntry> {
        self.entries.get(server_id).map(|entry| entry.value().clone())
    }

    /// Host identity for `server_id`; unknown ids are a caller error
    pub fn identity(&self, server_id: &str) -> Result<HostIdentity> {
        if server_id == LOCAL_SERVER_ID {
            return Ok(HostIdentity::local());
        }
        self.entries
            .get(server_id)
            .map(|entry| entry.identity())
            .ok_or_else(|| Error::unknown_host(format!("Unknown server: {}", server_id)))
    }

    /// Sorted server ids
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn entries(&self) -> Vec<ServerEntry> {
        let mut entries: Vec<ServerEntry> = self.entries.iter().map(|entry| entry.value().clone()).collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolves server ids to pooled targets wrapped as
/// `Logging(Timeout(Retry(Pooled)))`
pub struct PoolResolver {
    pool: ConnectionPool,
    servers: Arc<ServerRegistry>,
    retry: RetryConfig,
    timeout: TimeoutConfig,
}

impl PoolResolver {
    pub fn new(pool: ConnectionPool, servers: Arc<ServerRegistry>, retry: RetryConfig, timeout: TimeoutConfig) -> Self {
        Self {
            pool,
            servers,
            retry,
            timeout,
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

#[async_trait]
impl TargetResolver for PoolResolver {
    async fn resolve(&self, server_id: &str) -> Result<Arc<dyn ExecutionTarget>> {
        let identity = self.servers.identity(server_id)?;
        debug!(server = server_id, host = %identity, "Resolved server");

        let base: Arc<dyn ExecutionTarget> = Arc::new(PooledTarget::new(self.pool.clone(), identity));
        Ok(ExecutorBuilder::new(base)
            .with_retry(self.retry.clone())
            .with_timeout(self.timeout.clone())
            .with_logging()
            .build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serve_core::{AuthConfig, PoolConfig};
    use serve_dev::CountingConnector;

    fn entry(id: &str, host: &str) -> ServerEntry {
        ServerEntry {
            id: id.to_string(),
            name: None,
            host: host.to_string(),
            port: 22,
            username: "ml".to_string(),
            auth: AuthConfig::Password {
                password: "secret".to_string(),
            },
        }
    }

    #[test]
    fn test_registry_identity_lookup() {
        let registry = ServerRegistry::from_entries(&[entry("gpu2", "10.0.0.2"), entry("gpu1", "10.0.0.1")]);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.ids(), vec!["gpu1", "gpu2"]);
        assert_eq!(registry.identity("gpu1").unwrap().key(), "10.0.0.1:22@ml");
        assert!(registry.identity(LOCAL_SERVER_ID).unwrap().is_local());
        assert!(matches!(registry.identity("gpu9"), Err(Error::UnknownHost(_))));

        assert!(registry.remove("gpu2").is_some());
        assert!(registry.get("gpu2").is_none());
    }

    #[tokio::test]
    async fn test_pool_resolver_reuses_pooled_connection() {
        let connector = Arc::new(CountingConnector::new());
        let pool = ConnectionPool::new(connector.clone(), PoolConfig::default());
        let servers = Arc::new(ServerRegistry::from_entries(&[entry("gpu1", "10.0.0.1")]));
        let resolver = PoolResolver::new(pool, servers, RetryConfig::default(), TimeoutConfig::default());

        let target = resolver.resolve("gpu1").await.unwrap();
        assert_eq!(target.identity().key(), "10.0.0.1:22@ml");

        let first = target.run("hostname").await;
        let second = resolver.resolve("gpu1").await.unwrap().run("hostname").await;

        assert!(first.success);
        assert_eq!(first.stdout, second.stdout);
        assert_eq!(connector.dial_count(), 1);
        assert_eq!(first.attempts, 1);
    }

    #[tokio::test]
    async fn test_pool_resolver_rejects_unknown_server() {
        let pool = ConnectionPool::new(Arc::new(CountingConnector::new()), PoolConfig::default());
        let resolver = PoolResolver::new(
            pool,
            Arc::new(ServerRegistry::new()),
            RetryConfig::default(),
            TimeoutConfig::default(),
        );

        assert!(resolver.resolve("nowhere").await.is_err());
    }
}
