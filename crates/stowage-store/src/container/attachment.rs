//! Attachment-store container.
//!
//! Objects are written onto a host object's own key-value extension point
//! instead of a standalone backend. The host environment supplies the hosts
//! through a [`HostResolver`]; this layer never owns them. Each leaf of the
//! decomposed object becomes one attached primitive under the container's
//! namespace, keyed by its dotted path.
//!
//! There is no connection to retry: a host is either there or it is not, and
//! an operation on a missing or dead host fails with
//! [`StorageError::HostObjectUnavailable`].

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream;
use tracing::debug;

use super::{EntryStream, StorageContainer, not_found};
use crate::decomposed::DecomposedObject;
use crate::error::{StorageError, StorageResult};
use crate::schema::Predicate;
use crate::value::Value;

/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "stowage";

/// A host object's per-object key-value store.
pub trait AttachmentPoint: Send + Sync {
    fn get_attached(&self, namespace: &str, key: &str) -> Option<Value>;

    fn set_attached(&self, namespace: &str, key: &str, value: Value);

    fn remove_attached(&self, namespace: &str, key: &str);

    /// Keys currently attached under `namespace`.
    fn attached_keys(&self, namespace: &str) -> Vec<String>;

    /// Whether the host still exists. A dead host rejects every operation.
    fn is_alive(&self) -> bool {
        true
    }
}

/// Finds the host object addressed by a storage key.
pub trait HostResolver: Send + Sync {
    fn resolve(&self, key: &str) -> Option<Arc<dyn AttachmentPoint>>;

    /// Keys of every host currently known.
    fn host_keys(&self) -> Vec<String>;
}

/// A [`StorageContainer`] over host attachment points.
#[derive(Clone)]
pub struct AttachmentContainer {
    resolver: Arc<dyn HostResolver>,
    namespace: String,
}

impl AttachmentContainer {
    pub fn new(resolver: Arc<dyn HostResolver>) -> Self {
        Self::with_namespace(resolver, DEFAULT_NAMESPACE)
    }

    pub fn with_namespace(resolver: Arc<dyn HostResolver>, namespace: impl Into<String>) -> Self {
        Self {
            resolver,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn host(&self, key: &str) -> StorageResult<Arc<dyn AttachmentPoint>> {
        self.resolver
            .resolve(key)
            .filter(|host| host.is_alive())
            .ok_or_else(|| StorageError::HostObjectUnavailable {
                key: key.to_string(),
            })
    }

    fn read(namespace: &str, host: &dyn AttachmentPoint) -> Option<DecomposedObject> {
        let keys = host.attached_keys(namespace);
        if keys.is_empty() {
            return None;
        }
        let leaves = keys
            .into_iter()
            .filter_map(|k| host.get_attached(namespace, &k).map(|v| (k, v)));
        Some(DecomposedObject::from_flat(leaves))
    }
}

impl std::fmt::Debug for AttachmentContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentContainer")
            .field("namespace", &self.namespace)
            .finish()
    }
}

#[async_trait]
impl StorageContainer for AttachmentContainer {
    fn backend(&self) -> &'static str {
        "attachment"
    }

    async fn store(&self, key: &str, object: &DecomposedObject) -> StorageResult<()> {
        let host = self.host(key)?;
        let leaves = object.flatten();
        let fresh: HashSet<&str> = leaves.iter().map(|(path, _)| path.as_str()).collect();
        let stale: Vec<String> = host
            .attached_keys(&self.namespace)
            .into_iter()
            .filter(|k| !fresh.contains(k.as_str()))
            .collect();

        for (path, value) in &leaves {
            host.set_attached(&self.namespace, path, value.clone());
        }
        for path in &stale {
            host.remove_attached(&self.namespace, path);
        }
        debug!(key, leaves = leaves.len(), stale = stale.len(), "attached object stored");
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> StorageResult<DecomposedObject> {
        let host = self.host(key)?;
        Self::read(&self.namespace, host.as_ref()).ok_or_else(|| not_found(key))
    }

    /// Walks every known host, skipping hosts with nothing attached and
    /// hosts that disappeared since the walk started.
    fn retrieve_all(&self, predicate: Option<&Predicate>) -> EntryStream {
        let this = self.clone();
        let predicate = predicate.cloned();
        stream::iter(self.resolver.host_keys())
            .filter_map(move |key| {
                let found = this
                    .host(&key)
                    .ok()
                    .and_then(|host| Self::read(&this.namespace, host.as_ref()))
                    .filter(|object| predicate.as_ref().is_none_or(|p| p.matches(object)))
                    .map(|object| Ok::<_, StorageError>((key, object)));
                async move { found }
            })
            .boxed()
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let host = self.host(key)?;
        for path in host.attached_keys(&self.namespace) {
            host.remove_attached(&self.namespace, &path);
        }
        Ok(())
    }

    /// Keys of live hosts that carry an object in this namespace.
    async fn keys(&self) -> StorageResult<Vec<String>> {
        Ok(self
            .resolver
            .host_keys()
            .into_iter()
            .filter(|key| {
                self.host(key)
                    .is_ok_and(|host| !host.attached_keys(&self.namespace).is_empty())
            })
            .collect())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  In-process hosts
// ═══════════════════════════════════════════════════════════════════════

/// An in-process [`AttachmentPoint`].
#[derive(Debug)]
pub struct MemoryHost {
    attached: DashMap<(String, String), Value>,
    alive: AtomicBool,
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self {
            attached: DashMap::new(),
            alive: AtomicBool::new(true),
        }
    }
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the host as gone. Every later operation on it fails.
    pub fn destroy(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl AttachmentPoint for MemoryHost {
    fn get_attached(&self, namespace: &str, key: &str) -> Option<Value> {
        self.attached
            .get(&(namespace.to_string(), key.to_string()))
            .map(|v| v.value().clone())
    }

    fn set_attached(&self, namespace: &str, key: &str, value: Value) {
        self.attached
            .insert((namespace.to_string(), key.to_string()), value);
    }

    fn remove_attached(&self, namespace: &str, key: &str) {
        self.attached.remove(&(namespace.to_string(), key.to_string()));
    }

    fn attached_keys(&self, namespace: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .attached
            .iter()
            .filter(|e| e.key().0 == namespace)
            .map(|e| e.key().1.clone())
            .collect();
        keys.sort();
        keys
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// A [`HostResolver`] over an explicit key → host map.
#[derive(Default)]
pub struct HostRegistry {
    hosts: DashMap<String, Arc<dyn AttachmentPoint>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: impl Into<String>, host: Arc<dyn AttachmentPoint>) {
        self.hosts.insert(key.into(), host);
    }

    /// Forget a host. Its attached data stays on the host itself.
    pub fn unregister(&self, key: &str) -> Option<Arc<dyn AttachmentPoint>> {
        self.hosts.remove(key).map(|(_, host)| host)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

impl HostResolver for HostRegistry {
    fn resolve(&self, key: &str) -> Option<Arc<dyn AttachmentPoint>> {
        self.hosts.get(key).map(|h| Arc::clone(h.value()))
    }

    fn host_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.hosts.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

// ── tests ────────────────────────────────────────────────────────────
