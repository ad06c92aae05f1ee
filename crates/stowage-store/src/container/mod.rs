//! The storage container contract and its backends.
//!
//! A [`StorageContainer`] persists [`DecomposedObject`]s under string keys.
//! It owns no cached state; it is a codec plus transport for one backend
//! configuration and may be shared (`Arc<dyn StorageContainer>`) by any
//! number of caches.
//!
//! | Backend | Module | Key |
//! |---------|--------|-----|
//! | flat-file (JSON / YAML) | [`flatfile`] | dotted path into one document |
//! | relational (SQLite) | [`relational`] | value of the key column |
//! | attachment store | [`attachment`] | address of a host object |
//! | in-process | [`memory`] | opaque string |

pub mod attachment;
pub mod flatfile;
pub mod memory;
pub mod relational;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Deserialize;
use tracing::info;

use crate::db::Database;
use crate::decomposed::DecomposedObject;
use crate::error::{StorageError, StorageResult};
use crate::hooks::{HookRegistry, Operation};
use crate::schema::{Predicate, Table};
use crate::settings::StorageSettings;

pub use attachment::{AttachmentContainer, AttachmentPoint, HostRegistry, HostResolver, MemoryHost};
pub use flatfile::{DocumentFormat, FlatFileContainer};
pub use memory::MemoryContainer;
pub use relational::RelationalContainer;

/// Lazily produced `(key, object)` pairs from [`StorageContainer::retrieve_all`].
pub type EntryStream = BoxStream<'static, StorageResult<(String, DecomposedObject)>>;

/// One backend behind the shared persistence contract.
#[async_trait]
pub trait StorageContainer: Send + Sync {
    /// Short backend name, used in logs and errors.
    fn backend(&self) -> &'static str;

    /// Persist `object` under `key`, replacing whatever was there.
    async fn store(&self, key: &str, object: &DecomposedObject) -> StorageResult<()>;

    /// Load the object under `key`, or [`StorageError::NotFound`].
    async fn retrieve(&self, key: &str) -> StorageResult<DecomposedObject>;

    /// Stream every stored object, optionally filtered by `predicate`.
    fn retrieve_all(&self, predicate: Option<&Predicate>) -> EntryStream;

    /// Remove the object under `key`. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Every key currently stored.
    async fn keys(&self) -> StorageResult<Vec<String>>;

    async fn contains(&self, key: &str) -> StorageResult<bool> {
        match self.retrieve(key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Load the object under `key`, or `fallback` when nothing is stored there.
    async fn retrieve_or(
        &self,
        key: &str,
        fallback: DecomposedObject,
    ) -> StorageResult<DecomposedObject> {
        match self.retrieve(key).await {
            Err(StorageError::NotFound { .. }) => Ok(fallback),
            other => other,
        }
    }

    /// Store each pair in order. The first failure is returned and the
    /// pairs after it are not attempted.
    async fn store_all(&self, objects: &[(String, DecomposedObject)]) -> StorageResult<()> {
        for (key, object) in objects {
            self.store(key, object).await?;
        }
        Ok(())
    }

    /// Delete each key in order, stopping at the first failure.
    async fn delete_all(&self, keys: &[String]) -> StorageResult<()> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(())
    }
}

fn not_found(key: &str) -> StorageError {
    StorageError::NotFound {
        key: key.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Hooked container
// ═══════════════════════════════════════════════════════════════════════

/// Runs a [`HookRegistry`] around every operation of an inner container.
pub struct HookedContainer {
    inner: Arc<dyn StorageContainer>,
    hooks: Arc<HookRegistry>,
}

impl HookedContainer {
    pub fn new(inner: Arc<dyn StorageContainer>, hooks: Arc<HookRegistry>) -> Self {
        Self { inner, hooks }
    }

    pub fn inner(&self) -> &Arc<dyn StorageContainer> {
        &self.inner
    }
}

#[async_trait]
impl StorageContainer for HookedContainer {
    fn backend(&self) -> &'static str {
        self.inner.backend()
    }

    async fn store(&self, key: &str, object: &DecomposedObject) -> StorageResult<()> {
        self.hooks.run_before(Operation::Store, key, Some(object))?;
        self.inner.store(key, object).await?;
        self.hooks.run_after(Operation::Store, key, Some(object));
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> StorageResult<DecomposedObject> {
        self.hooks.run_before(Operation::Retrieve, key, None)?;
        let object = self.inner.retrieve(key).await?;
        self.hooks.run_after(Operation::Retrieve, key, Some(&object));
        Ok(object)
    }

    /// Retrieve hooks run per entry; a vetoed entry is yielded as an error.
    fn retrieve_all(&self, predicate: Option<&Predicate>) -> EntryStream {
        let hooks = Arc::clone(&self.hooks);
        self.inner
            .retrieve_all(predicate)
            .map(move |item| -> StorageResult<(String, DecomposedObject)> {
                let (key, object) = item?;
                hooks.run_before(Operation::Retrieve, &key, None)?;
                hooks.run_after(Operation::Retrieve, &key, Some(&object));
                Ok((key, object))
            })
            .boxed()
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.hooks.run_before(Operation::Delete, key, None)?;
        self.inner.delete(key).await?;
        self.hooks.run_after(Operation::Delete, key, None);
        Ok(())
    }

    async fn keys(&self) -> StorageResult<Vec<String>> {
        self.inner.keys().await
    }

    async fn contains(&self, key: &str) -> StorageResult<bool> {
        self.inner.contains(key).await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Configuration
// ═══════════════════════════════════════════════════════════════════════

/// Path value that selects an in-memory SQLite database.
pub const IN_MEMORY: &str = ":memory:";

/// Backend selection, as written in a config file.
///
/// ```toml
/// [container]
/// kind = "flat_file"
/// path = "data/users.yml"
/// format = "yaml"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContainerConfig {
    FlatFile {
        path: PathBuf,
        #[serde(default)]
        format: DocumentFormat,
    },
    Relational {
        /// Database file, or `":memory:"`.
        path: String,
        table: Table,
    },
}

impl ContainerConfig {
    /// Construct the configured backend.
    pub async fn open(&self, settings: &StorageSettings) -> StorageResult<Arc<dyn StorageContainer>> {
        let container: Arc<dyn StorageContainer> = match self {
            Self::FlatFile { path, format } => Arc::new(
                FlatFileContainer::new(path.clone(), *format).with_lock_timeout(settings.lock_timeout()),
            ),
            Self::Relational { path, table } => {
                let db = if path == IN_MEMORY {
                    Database::open_in_memory()?
                } else {
                    Database::open_async(path.clone()).await?
                };
                Arc::new(RelationalContainer::new(db, table.clone()).with_retry(settings.retry()))
            }
        };
        info!(backend = container.backend(), "storage container opened");
        Ok(container)
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::TryStreamExt;

    use super::*;
    use crate::hooks::HookDecision;
    use crate::value::Value;

    fn hooked(hooks: HookRegistry) -> (Arc<MemoryContainer>, HookedContainer) {
        let inner = Arc::new(MemoryContainer::new());
        let hooked = HookedContainer::new(inner.clone(), Arc::new(hooks));
        (inner, hooked)
    }

    #[tokio::test]
    async fn before_store_veto_leaves_backend_untouched() {
        let mut hooks = HookRegistry::new();
        hooks.before(Operation::Store, |ctx| match ctx.object.and_then(|o| o.get("age")) {
            Some(Value::Int(age)) if *age < 0 => HookDecision::veto("negative age"),
            _ => HookDecision::Proceed,
        });
        let (inner, container) = hooked(hooks);

        let err = container
            .store("u", &DecomposedObject::new().with("age", -5))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::HookRejected { .. }));
        assert!(!inner.contains("u").await.unwrap());

        container
            .store("u", &DecomposedObject::new().with("age", 5))
            .await
            .unwrap();
        assert!(inner.contains("u").await.unwrap());
    }

    #[tokio::test]
    async fn after_hooks_see_retrieved_objects_and_skip_failures() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let mut hooks = HookRegistry::new();
        hooks.after(Operation::Retrieve, move |ctx| {
            assert!(ctx.object.is_some());
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (_, container) = hooked(hooks);

        assert!(matches!(
            container.retrieve("nobody").await,
            Err(StorageError::NotFound { .. })
        ));
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        container
            .store("a", &DecomposedObject::new().with("n", 1))
            .await
            .unwrap();
        container.retrieve("a").await.unwrap();
        let all: Vec<_> = container.retrieve_all(None).try_collect().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn before_delete_veto_keeps_the_object() {
        let mut hooks = HookRegistry::new();
        hooks.before(Operation::Delete, |ctx| {
            if ctx.key.starts_with("locked:") {
                HookDecision::veto("locked")
            } else {
                HookDecision::Proceed
            }
        });
        let (inner, container) = hooked(hooks);
        let object = DecomposedObject::new().with("n", 1);
        inner.store("locked:1", &object).await.unwrap();

        assert!(container.delete("locked:1").await.is_err());
        assert!(inner.contains("locked:1").await.unwrap());
    }

    #[tokio::test]
    async fn batch_operations_stop_at_the_first_failure() {
        let mut hooks = HookRegistry::new();
        hooks.before(Operation::Store, |ctx| {
            if ctx.key == "b" {
                HookDecision::veto("b is reserved")
            } else {
                HookDecision::Proceed
            }
        });
        let (inner, container) = hooked(hooks);
        let batch: Vec<(String, DecomposedObject)> = ["a", "b", "c"]
            .into_iter()
            .map(|k| (k.to_string(), DecomposedObject::new().with("id", k)))
            .collect();

        let err = container.store_all(&batch).await.unwrap_err();
        assert!(matches!(err, StorageError::HookRejected { ref key, .. } if key == "b"));
        assert_eq!(inner.keys().await.unwrap(), vec!["a"]);

        container.store_all(&batch[2..]).await.unwrap();
        container
            .delete_all(&["a".to_string(), "missing".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert!(inner.is_empty());
    }

    #[tokio::test]
    async fn retrieve_or_falls_back_only_when_missing() {
        let container = MemoryContainer::new();
        let fallback = DecomposedObject::new().with("n", 0);
        assert_eq!(container.retrieve_or("k", fallback.clone()).await.unwrap(), fallback);

        let stored = DecomposedObject::new().with("n", 7);
        container.store("k", &stored).await.unwrap();
        assert_eq!(container.retrieve_or("k", fallback).await.unwrap(), stored);
    }

    #[tokio::test]
    async fn config_selects_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config: ContainerConfig = toml::from_str(&format!(
            "kind = \"flat_file\"\npath = {:?}\nformat = \"yaml\"\n",
            dir.path().join("doc.yml")
        ))
        .unwrap();
        let container = config.open(&StorageSettings::default()).await.unwrap();
        assert_eq!(container.backend(), "flat-file");

        let config: ContainerConfig = toml::from_str(
            r#"
            kind = "relational"
            path = ":memory:"
            [table]
            name = "scores"
            columns = [{ name = "id", type = "int" }, { name = "score", type = "double" }]
            "#,
        )
        .unwrap();
        let container = config.open(&StorageSettings::default()).await.unwrap();
        assert_eq!(container.backend(), "relational");
        container
            .store("1", &DecomposedObject::new().with("score", 9.5))
            .await
            .unwrap();
        assert!(container.contains("1").await.unwrap());

        let bad = toml::from_str::<ContainerConfig>("kind = \"carrier_pigeon\"");
        assert!(bad.is_err());
    }
}
