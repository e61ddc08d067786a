//! Vendor detection and dispatch

use crate::kill;
use crate::{
    AcceleratorDevice, AcceleratorHandler, AcceleratorProcess, AcceleratorSummary, AmdHandler, IntelHandler,
    KillPolicy, NvidiaHandler, Vendor,
};
use dashmap::DashMap;
use serve_core::{ExecutionTarget, HostIdentity};
use std::sync::Arc;
use tracing::{debug, info};

/// Probes vendors in priority order (NVIDIA, AMD, Intel) and remembers the
/// first available vendor per host until cleared.
///
/// Only positive detections are cached, so a host that gains drivers later
/// is picked up on the next call.
pub struct AcceleratorRegistry {
    handlers: Vec<Arc<dyn AcceleratorHandler>>,
    detected: DashMap<String, Vendor>,
    policy: KillPolicy,
}

impl AcceleratorRegistry {
    pub fn new(policy: KillPolicy) -> Self {
        Self::with_handlers(
            vec![
                Arc::new(NvidiaHandler::new(policy)),
                Arc::new(AmdHandler::new(policy)),
                Arc::new(IntelHandler::new(policy)),
            ],
            policy,
        )
    }

    /// Use custom handlers; they are probed in the given order
    pub fn with_handlers(handlers: Vec<Arc<dyn AcceleratorHandler>>, policy: KillPolicy) -> Self {
        Self {
            handlers,
            detected: DashMap::new(),
            policy,
        }
    }

    pub fn kill_policy(&self) -> KillPolicy {
        self.policy
    }

    fn handler(&self, vendor: Vendor) -> Option<Arc<dyn AcceleratorHandler>> {
        self.handlers.iter().find(|h| h.vendor() == vendor).cloned()
    }

    /// Handler for the first available vendor on `host`, or `None` when the
    /// host has no accelerator
    pub async fn handler_for(&self, host: &dyn ExecutionTarget) -> Option<Arc<dyn AcceleratorHandler>> {
        let key = host.identity().key();
        let cached = self.detected.get(&key).map(|entry| *entry.value());
        if let Some(vendor) = cached {
            return self.handler(vendor);
        }

        for handler in &self.handlers {
            if handler.is_available(host).await {
                info!(host = %host.identity(), vendor = %handler.vendor(), "Detected accelerator vendor");
                self.detected.insert(key, handler.vendor());
                return Some(Arc::clone(handler));
            }
        }

        debug!(host = %host.identity(), "No accelerator detected");
        None
    }

    pub fn cached_vendor(&self, identity: &HostIdentity) -> Option<Vendor> {
        self.detected.get(&identity.key()).map(|entry| *entry.value())
    }

    /// Forget the detected vendor for `identity`
    pub fn clear(&self, identity: &HostIdentity) -> bool {
        self.detected.remove(&identity.key()).is_some()
    }

    pub fn clear_all(&self) {
        self.detected.clear();
    }

    pub async fn vendor(&self, host: &dyn ExecutionTarget) -> Option<Vendor> {
        self.handler_for(host).await.map(|h| h.vendor())
    }

    pub async fn list_devices(&self, host: &dyn ExecutionTarget) -> Vec<AcceleratorDevice> {
        match self.handler_for(host).await {
            Some(handler) => handler.list_devices(host).await,
            None => Vec::new(),
        }
    }

    pub async fn list_processes(&self, host: &dyn ExecutionTarget) -> Vec<AcceleratorProcess> {
        match self.handler_for(host).await {
            Some(handler) => handler.list_processes(host).await,
            None => Vec::new(),
        }
    }

    /// Totals over a single device query
    pub async fn summary(&self, host: &dyn ExecutionTarget) -> Option<AcceleratorSummary> {
        let handler = self.handler_for(host).await?;
        let devices = handler.list_devices(host).await;
        Some(AcceleratorSummary::from_devices(handler.vendor(), &devices))
    }

    /// Terminate `pid`. Works without an accelerator, since signalling is
    /// vendor-neutral.
    pub async fn kill_process(&self, host: &dyn ExecutionTarget, pid: u32) -> bool {
        match self.handler_for(host).await {
            Some(handler) => handler.kill_process(host, pid).await,
            None => kill::terminate(host, pid, self.policy.grace).await,
        }
    }

    /// Terminate `pids` in bounded batches; returns the pids terminated
    pub async fn kill_processes(&self, host: &dyn ExecutionTarget, pids: &[u32]) -> Vec<u32> {
        match self.handler_for(host).await {
            Some(handler) => handler.kill_processes(host, pids).await,
            None => kill::terminate_all(host, pids, self.policy).await,
        }
    }
}

impl Default for AcceleratorRegistry {
    fn default() -> Self {
        Self::new(KillPolicy::default())
    }
}
