//! Connection pooling for efficient connection reuse
//!
//! The pool keeps at most one connection per host identity. A live entry is
//! shared by concurrent callers through a lease count (commands multiplex
//! over the session), and an entry is only evicted once every lease has been
//! released.

use crate::Connector;
use dashmap::DashMap;
use serde::Serialize;
use serve_core::{Connection, HostIdentity, PoolConfig, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Upper bound on a single disconnect during eviction
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A pooled connection with metadata
struct PooledConnection {
    connection: Arc<dyn Connection>,
    created_at: Instant,
    last_used: Instant,
    leases: usize,
    use_count: usize,
}

impl PooledConnection {
    fn new(connection: Arc<dyn Connection>) -> Self {
        let now = Instant::now();
        Self {
            connection,
            created_at: now,
            last_used: now,
            leases: 1,
            use_count: 1,
        }
    }

    fn in_use(&self) -> bool {
        self.leases > 0
    }

    /// A leased entry stays shareable past its max age; only a dead session
    /// forces replacement while someone holds it.
    fn reusable(&self, max_age: Duration) -> bool {
        self.connection.is_connected() && (self.in_use() || self.created_at.elapsed() < max_age)
    }

    fn expired(&self, config: &PoolConfig) -> bool {
        !self.in_use()
            && (self.last_used.elapsed() >= config.idle_timeout()
                || self.created_at.elapsed() >= config.max_age()
                || !self.connection.is_connected())
    }
}

type Slot = Arc<Mutex<Option<PooledConnection>>>;

/// Pool statistics
#[derive(Debug, Default)]
pub struct PoolStats {
    pub connections_created: AtomicUsize,
    pub connections_reused: AtomicUsize,
    pub connections_closed: AtomicUsize,
    pub pool_hits: AtomicUsize,
    pub pool_misses: AtomicUsize,
}

impl PoolStats {
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_reused: self.connections_reused.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            pool_hits: self.pool_hits.load(Ordering::Relaxed),
            pool_misses: self.pool_misses.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PoolStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatsSnapshot {
    pub connections_created: usize,
    pub connections_reused: usize,
    pub connections_closed: usize,
    pub pool_hits: usize,
    pub pool_misses: usize,
}

/// Description of one pooled entry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolEntryInfo {
    pub key: String,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub leases: usize,
    pub use_count: usize,
    pub connected: bool,
}

struct PoolInner {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    slots: DashMap<String, Slot>,
    stats: PoolStats,
}

/// Identity-keyed connection pool
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a new connection pool
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                config,
                slots: DashMap::new(),
                stats: PoolStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get pool statistics
    pub fn stats(&self) -> &PoolStats {
        &self.inner.stats
    }

    /// Check out the connection for `identity`, dialing if none is usable.
    ///
    /// Every successful acquire must be paired with [`ConnectionPool::release`].
    pub async fn acquire(&self, identity: &HostIdentity) -> Result<Arc<dyn Connection>> {
        let key = identity.key();
        let slot = self.inner.slot(&key);
        let mut guard = slot.lock().await;

        if let Some(entry) = guard.as_mut() {
            if entry.reusable(self.inner.config.max_age()) {
                entry.leases += 1;
                entry.use_count += 1;
                entry.last_used = Instant::now();
                self.inner.stats.pool_hits.fetch_add(1, Ordering::Relaxed);
                self.inner.stats.connections_reused.fetch_add(1, Ordering::Relaxed);
                debug!(host = %key, leases = entry.leases, "Reusing pooled connection");
                return Ok(Arc::clone(&entry.connection));
            }
        }

        if let Some(stale) = guard.take() {
            if stale.in_use() {
                warn!(host = %key, leases = stale.leases, "Replacing dead connection that is still leased");
            }
            self.inner.close(&key, stale.connection, "stale").await;
        }

        self.inner.stats.pool_misses.fetch_add(1, Ordering::Relaxed);
        self.inner.enforce_capacity(&key).await;

        // The slot stays locked while dialing so concurrent acquirers for the
        // same identity wait for this connection instead of dialing their own
        debug!(host = %key, "Creating new pooled connection");
        let connection = match self.inner.connector.connect(identity).await {
            Ok(connection) => connection,
            Err(e) => {
                drop(guard);
                drop(slot);
                self.inner.prune(&key);
                return Err(e);
            }
        };
        *guard = Some(PooledConnection::new(Arc::clone(&connection)));
        self.inner.stats.connections_created.fetch_add(1, Ordering::Relaxed);

        Ok(connection)
    }

    /// Return a lease taken by [`ConnectionPool::acquire`]
    pub async fn release(&self, identity: &HostIdentity) {
        let key = identity.key();
        let Some(slot) = self.inner.existing_slot(&key) else {
            return;
        };

        let mut guard = slot.lock().await;
        let Some(entry) = guard.as_mut() else {
            return;
        };

        entry.leases = entry.leases.saturating_sub(1);
        entry.last_used = Instant::now();
        if !entry.in_use() {
            drop(guard);
            self.schedule_idle_eviction(key);
        }
    }

    /// Tear down the connection for `identity`, leased or not
    pub async fn disconnect(&self, identity: &HostIdentity) -> bool {
        let key = identity.key();
        let Some(slot) = self.inner.existing_slot(&key) else {
            return false;
        };

        let mut guard = slot.lock().await;
        let closed = match guard.take() {
            Some(entry) => {
                if entry.in_use() {
                    warn!(host = %key, leases = entry.leases, "Disconnecting connection that is still leased");
                }
                self.inner.close(&key, entry.connection, "disconnect").await;
                true
            }
            None => false,
        };
        drop(guard);
        drop(slot);
        self.inner.prune(&key);
        closed
    }

    /// Close every pooled connection
    pub async fn shutdown(&self) {
        let mut closed = 0;
        for (key, slot) in self.inner.all_slots() {
            let mut guard = slot.lock().await;
            if let Some(entry) = guard.take() {
                self.inner.close(&key, entry.connection, "shutdown").await;
                closed += 1;
            }
            drop(guard);
            drop(slot);
            self.inner.prune(&key);
        }
        info!("Connection pool shut down, closed {} connections", closed);
    }

    /// Evict every idle entry past its idle timeout or max age, or whose
    /// session has died. Busy entries are skipped.
    pub async fn evict_expired(&self) -> usize {
        self.inner.evict_expired().await
    }

    /// Number of pooled connections
    pub async fn live_connections(&self) -> usize {
        let mut live = 0;
        for (_, slot) in self.inner.all_slots() {
            if slot.lock().await.is_some() {
                live += 1;
            }
        }
        live
    }

    /// Describe every pooled entry
    pub async fn snapshot(&self) -> Vec<PoolEntryInfo> {
        let mut entries = Vec::new();
        for (key, slot) in self.inner.all_slots() {
            let guard = slot.lock().await;
            if let Some(entry) = guard.as_ref() {
                entries.push(PoolEntryInfo {
                    key,
                    age_ms: entry.created_at.elapsed().as_millis() as u64,
                    idle_ms: entry.last_used.elapsed().as_millis() as u64,
                    leases: entry.leases,
                    use_count: entry.use_count,
                    connected: entry.connection.is_connected(),
                });
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// Start a periodic sweep of expired entries. The task ends once the
    /// pool is dropped.
    pub fn start_cleanup_task(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let cleaned = inner.evict_expired().await;
                if cleaned > 0 {
                    debug!("Cleaned up {} expired connections", cleaned);
                }
            }
        })
    }

    fn schedule_idle_eviction(&self, key: String) {
        let weak = Arc::downgrade(&self.inner);
        let idle_timeout = self.inner.config.idle_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(idle_timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.evict_if_idle(&key).await;
            }
        });
    }
}

impl PoolInner {
    fn slot(&self, key: &str) -> Slot {
        Arc::clone(
            self.slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .value(),
        )
    }

    fn existing_slot(&self, key: &str) -> Option<Slot> {
        self.slots.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of identities with a slot, empty or not
    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Forget the slot for `key` once it is empty and no caller holds it.
    /// Callers drop their own guard and handle first.
    fn prune(&self, key: &str) {
        self.slots
            .remove_if(key, |_, slot| Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|g| g.is_none()));
    }

    fn all_slots(&self) -> Vec<(String, Slot)> {
        self.slots
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    /// Disconnect first, then count the entry as closed. Failures are logged
    /// and swallowed.
    async fn close(&self, key: &str, connection: Arc<dyn Connection>, reason: &str) {
        match timeout(DISCONNECT_TIMEOUT, connection.disconnect()).await {
            Ok(Ok(())) => debug!(host = %key, reason, "Closed pooled connection"),
            Ok(Err(e)) => warn!(host = %key, reason, "Failed to close pooled connection: {}", e),
            Err(_) => warn!(host = %key, reason, "Timed out closing pooled connection"),
        }
        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    async fn evict_if_idle(&self, key: &str) {
        let Some(slot) = self.existing_slot(key) else {
            return;
        };

        let mut guard = slot.lock().await;
        let idle = guard
            .as_ref()
            .map(|entry| !entry.in_use() && entry.last_used.elapsed() >= self.config.idle_timeout())
            .unwrap_or(false);

        if idle {
            if let Some(entry) = guard.take() {
                self.close(key, entry.connection, "idle").await;
            }
            drop(guard);
            drop(slot);
            self.prune(key);
        }
    }

    async fn evict_expired(&self) -> usize {
        let mut evicted = 0;
        for (key, slot) in self.all_slots() {
            let Ok(mut guard) = slot.try_lock() else {
                continue;
            };
            let expired = guard.as_ref().map(|entry| entry.expired(&self.config)).unwrap_or(false);
            if expired {
                if let Some(entry) = guard.take() {
                    self.close(&key, entry.connection, "expired").await;
                    evicted += 1;
                }
                drop(guard);
                drop(slot);
                self.prune(&key);
            }
        }
        evicted
    }

    /// Make room for a new entry under `incoming`. The cap is soft: when
    /// every other entry is busy the pool grows past it.
    async fn enforce_capacity(&self, incoming: &str) {
        let others: Vec<(String, Slot)> = self
            .all_slots()
            .into_iter()
            .filter(|(key, _)| key != incoming)
            .collect();

        let mut live = 0;
        let mut lru: Option<(String, Instant)> = None;
        for (key, slot) in &others {
            let Ok(guard) = slot.try_lock() else {
                // Busy slots are being dialed or torn down; count them as live
                live += 1;
                continue;
            };
            if let Some(entry) = guard.as_ref() {
                live += 1;
                if !entry.in_use() && lru.as_ref().map_or(true, |(_, used)| entry.last_used < *used) {
                    lru = Some((key.clone(), entry.last_used));
                }
            }
        }

        drop(others);
        if live < self.config.max_size {
            return;
        }

        let Some((victim, _)) = lru else {
            warn!(
                live,
                max_size = self.config.max_size,
                "Connection pool over capacity with every entry in use"
            );
            return;
        };

        if let Some(slot) = self.existing_slot(&victim) {
            if let Ok(mut guard) = slot.try_lock() {
                if guard.as_ref().is_some_and(|entry| !entry.in_use()) {
                    if let Some(entry) = guard.take() {
                        self.close(&victim, entry.connection, "capacity").await;
                    }
                }
            }
        }
        self.prune(&victim);
    }
}
