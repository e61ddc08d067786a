//! Fixed server-id to target mapping

use async_trait::async_trait;
use serve_core::{Error, ExecutionTarget, Result, TargetResolver};
use std::collections::HashMap;
use std::sync::Arc;

/// Resolves server ids from a fixed table; unknown ids are
/// [`Error::UnknownHost`]
#[derive(Default, Clone)]
pub struct StaticResolver {
    targets: HashMap<String, Arc<dyn ExecutionTarget>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(mut self, server_id: impl Into<String>, target: Arc<dyn ExecutionTarget>) -> Self {
        self.targets.insert(server_id.into(), target);
        self
    }
}

#[async_trait]
impl TargetResolver for StaticResolver {
    async fn resolve(&self, server_id: &str) -> Result<Arc<dyn ExecutionTarget>> {
        self.targets
            .get(server_id)
            .cloned()
            .ok_or_else(|| Error::unknown_host(format!("Unknown server: {}", server_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScriptedTarget;

    #[tokio::test]
    async fn test_resolves_known_ids_only() {
        let resolver = StaticResolver::new().with_target("gpu1", Arc::new(ScriptedTarget::new()));

        assert!(resolver.resolve("gpu1").await.is_ok());
        assert!(matches!(resolver.resolve("gpu2").await, Err(Error::UnknownHost(_))));
    }
}
