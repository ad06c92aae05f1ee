//! In-process container over a concurrent map.
//!
//! Nothing survives the process. Useful as a cache backend in tests and for
//! applications that only want the cache's hook and dirty-tracking behavior.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream;

use super::{EntryStream, StorageContainer, not_found};
use crate::decomposed::DecomposedObject;
use crate::error::{StorageError, StorageResult};
use crate::schema::Predicate;

/// A [`StorageContainer`] kept in memory. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryContainer {
    objects: Arc<DashMap<String, DecomposedObject>>,
}

impl MemoryContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl StorageContainer for MemoryContainer {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn store(&self, key: &str, object: &DecomposedObject) -> StorageResult<()> {
        self.objects.insert(key.to_string(), object.clone());
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> StorageResult<DecomposedObject> {
        self.objects
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| not_found(key))
    }

    /// Keys are snapshotted up front; objects are read as the stream is polled,
    /// so an object deleted in between is skipped.
    fn retrieve_all(&self, predicate: Option<&Predicate>) -> EntryStream {
        let mut keys: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        let objects = Arc::clone(&self.objects);
        let predicate = predicate.cloned();
        stream::iter(keys)
            .filter_map(move |key| {
                let found = objects
                    .get(&key)
                    .map(|entry| entry.value().clone())
                    .filter(|object| predicate.as_ref().is_none_or(|p| p.matches(object)))
                    .map(|object| Ok::<_, StorageError>((key, object)));
                async move { found }
            })
            .boxed()
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.objects.remove(key);
        Ok(())
    }

    async fn keys(&self) -> StorageResult<Vec<String>> {
        let mut keys: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }

    async fn contains(&self, key: &str) -> StorageResult<bool> {
        Ok(self.objects.contains_key(key))
    }
}

// ── tests ────────────────────────────────────────────────────────────
