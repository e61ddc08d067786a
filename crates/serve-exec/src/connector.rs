//! Connection factories used by the pool

use crate::{Credential, ExecError, LocalTarget, RemoteShellTarget};
use async_trait::async_trait;
use dashmap::DashMap;
use serve_core::{Connection, HostIdentity, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Creates connected [`Connection`]s for host identities
#[async_trait]
pub trait Connector: Send + Sync {
    /// Dial and authenticate a new connection for `identity`
    async fn connect(&self, identity: &HostIdentity) -> Result<Arc<dyn Connection>>;
}

/// Connector that opens SSH sessions for remote identities and hands out
/// [`LocalTarget`]s for the local host.
pub struct SshConnector {
    credentials: DashMap<String, Credential>,
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            credentials: DashMap::new(),
            connect_timeout,
        }
    }

    /// Register the credential used when dialing `identity`
    pub fn register(&self, identity: &HostIdentity, credential: Credential) {
        self.credentials.insert(identity.key(), credential);
    }

    /// Forget the credential for `identity`
    pub fn forget(&self, identity: &HostIdentity) -> bool {
        self.credentials.remove(&identity.key()).is_some()
    }

    pub fn knows(&self, identity: &HostIdentity) -> bool {
        identity.is_local() || self.credentials.contains_key(&identity.key())
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, identity: &HostIdentity) -> Result<Arc<dyn Connection>> {
        if identity.is_local() {
            return Ok(Arc::new(LocalTarget::new()));
        }

        let credential = self
            .credentials
            .get(&identity.key())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ExecError::MissingCredential(format!("no credential registered for {}", identity)))?;

        debug!(host = %identity, "Dialing remote host");
        let target = RemoteShellTarget::new(identity.clone(), credential, self.connect_timeout);
        target.connect().await?;
        Ok(Arc::new(target))
    }
}
