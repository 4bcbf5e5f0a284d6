//! Task definition cache.
//!
//! Registered task definitions are immutable, so entries are keyed by ARN and
//! never invalidated. The cache is injected into both schedulers rather than
//! held in a global.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::backend::orchestrator::TaskDefinition;
use crate::backend::{BackendResult, Orchestrator};

/// Cache statistics.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
}

/// ARN-keyed cache of task definitions.
#[derive(Debug, Default)]
pub struct TaskDefinitionCache {
    entries: RwLock<HashMap<String, Arc<TaskDefinition>>>,
    stats: CacheStats,
}

impl TaskDefinitionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached definition, describing it on a miss.
    pub async fn get(
        &self,
        orchestrator: &dyn Orchestrator,
        arn: &str,
    ) -> BackendResult<Arc<TaskDefinition>> {
        if let Some(definition) = self.entries.read().await.get(arn) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(definition.clone());
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        debug!(arn = %arn, "Task definition cache miss");

        let definition = orchestrator.describe_task_definition(arn).await?;
        Ok(self.insert(definition).await)
    }

    /// Record a definition, typically right after registering it.
    pub async fn insert(&self, definition: TaskDefinition) -> Arc<TaskDefinition> {
        let definition = Arc::new(definition);
        self.entries
            .write()
            .await
            .entry(definition.arn.clone())
            .or_insert(definition)
            .clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryOrchestrator;
    use crate::backend::orchestrator::{ContainerDefinition, TaskDefinitionInput};

    #[tokio::test]
    async fn test_cache_describes_once() {
        let orchestrator = MemoryOrchestrator::new();
        let registered = orchestrator
            .register_task_definition(TaskDefinitionInput {
                family: "1234--web".to_string(),
                containers: vec![ContainerDefinition {
                    name: "web".to_string(),
                    ..Default::default()
                }],
            })
            .await
            .unwrap();

        let cache = TaskDefinitionCache::new();
        let first = cache.get(&orchestrator, &registered.arn).await.unwrap();
        let second = cache.get(&orchestrator, &registered.arn).await.unwrap();

        assert_eq!(first.arn, second.arn);
        assert_eq!(orchestrator.task_definition_lookups(), 1);
        assert_eq!(cache.stats().hits.load(Ordering::Relaxed), 1);
        assert_eq!(cache.stats().misses.load(Ordering::Relaxed), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_cache_miss_propagates_backend_error() {
        let orchestrator = MemoryOrchestrator::new();
        let cache = TaskDefinitionCache::new();

        let result = cache.get(&orchestrator, "arn:missing").await;
        assert!(result.is_err());
        assert!(cache.is_empty().await);
    }
}
