//! Flat-file container: one structured document per container.
//!
//! The document is a tree of maps. A key is a dotted path into that tree
//! (`users.alice` addresses `{"users": {"alice": {...}}}`), and the object
//! stored at a key is the sub-tree found there. Two textual encodings share
//! the same tree: strict JSON and permissive YAML. The encoding comes from
//! configuration, never from inspecting the file.
//!
//! An object stored under `users.alice` cannot be told apart from a
//! composite field `alice` of an object stored under `users`, so
//! [`keys`](StorageContainer::keys) and
//! [`retrieve_all`](StorageContainer::retrieve_all) only enumerate the top
//! level. [`FlatFileContainer::keys_at`] lists the children of one path.
//!
//! Writes rewrite the whole document (read, modify, write) while holding an
//! exclusive per-document lock taken from a process-wide registry, and land
//! through a temp file plus rename so readers never see a partial document.
//! Reads take no lock.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument};

use super::{EntryStream, StorageContainer, not_found};
use crate::decomposed::{DecomposedObject, PATH_SEPARATOR};
use crate::error::{StorageError, StorageResult};
use crate::schema::Predicate;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// One exclusive lock per document, shared by every container in the process.
static DOCUMENT_LOCKS: LazyLock<DashMap<PathBuf, Arc<Mutex<()>>>> = LazyLock::new(DashMap::new);

/// Textual encoding of a document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    /// Strict nested-map syntax.
    #[default]
    Json,
    /// Permissive indent-based syntax.
    Yaml,
}

impl DocumentFormat {
    fn parse(self, text: &str) -> StorageResult<Map<String, Json>> {
        if text.trim().is_empty() {
            return Ok(Map::new());
        }
        let tree: Json = match self {
            Self::Json => serde_json::from_str(text)?,
            Self::Yaml => serde_yaml::from_str(text)?,
        };
        match tree {
            Json::Object(map) => Ok(map),
            Json::Null => Ok(Map::new()),
            other => Err(StorageError::mismatch("", "document map", json_kind(&other))),
        }
    }

    fn render(self, document: &Map<String, Json>) -> StorageResult<String> {
        Ok(match self {
            Self::Json => {
                let mut text = serde_json::to_string_pretty(document)?;
                text.push('\n');
                text
            }
            Self::Yaml => serde_yaml::to_string(document)?,
        })
    }
}

fn json_kind(node: &Json) -> &'static str {
    match node {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "list",
        Json::Object(_) => "composite",
    }
}

/// A [`StorageContainer`] backed by one JSON or YAML document.
#[derive(Debug, Clone)]
pub struct FlatFileContainer {
    path: PathBuf,
    format: DocumentFormat,
    lock_timeout: Duration,
}

impl FlatFileContainer {
    pub fn new(path: impl Into<PathBuf>, format: DocumentFormat) -> Self {
        Self {
            path: path.into(),
            format,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn json(path: impl Into<PathBuf>) -> Self {
        Self::new(path, DocumentFormat::Json)
    }

    pub fn yaml(path: impl Into<PathBuf>) -> Self {
        Self::new(path, DocumentFormat::Yaml)
    }

    /// Bound on the wait for the document lock before [`StorageError::LockTimeout`].
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> DocumentFormat {
        self.format
    }

    async fn lock(&self) -> StorageResult<OwnedMutexGuard<()>> {
        let id = std::path::absolute(&self.path).unwrap_or_else(|_| self.path.clone());
        let lock = Arc::clone(DOCUMENT_LOCKS.entry(id).or_default().value());
        tokio::time::timeout(self.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| StorageError::LockTimeout {
                resource: self.path.display().to_string(),
                waited: self.lock_timeout,
            })
    }

    /// Read the raw text; a missing file reads as empty.
    async fn read_text(path: &Path) -> StorageResult<String> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn load(path: &Path, format: DocumentFormat) -> StorageResult<Map<String, Json>> {
        format.parse(&Self::read_text(path).await?)
    }

    /// Dotted keys of the entries directly under `path`, sorted. Empty when
    /// nothing is stored there or the node is not a composite.
    pub async fn keys_at(&self, path: &str) -> StorageResult<Vec<String>> {
        let parts = segments(path)?;
        let document = Self::load(&self.path, self.format).await?;
        Ok(match lookup(&document, &parts) {
            Some(Json::Object(children)) => children
                .keys()
                .map(|child| format!("{path}{PATH_SEPARATOR}{child}"))
                .collect(),
            _ => Vec::new(),
        })
    }

    /// Read-modify-write under the document lock. `edit` returns whether it
    /// changed anything; unchanged documents are not rewritten.
    async fn modify<F>(&self, edit: F) -> StorageResult<()>
    where
        F: FnOnce(&mut Map<String, Json>) -> StorageResult<bool>,
    {
        let _guard = self.lock().await?;
        let before = Self::read_text(&self.path).await?;
        let mut document = self.format.parse(&before)?;
        if !edit(&mut document)? {
            return Ok(());
        }
        let after = self.format.render(&document)?;
        if after == before {
            debug!(path = %self.path.display(), "document unchanged, skipping write");
            return Ok(());
        }
        self.replace(after).await
    }

    async fn replace(&self, text: String) -> StorageResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                StorageError::InvalidArgument(format!("`{}` is not a file path", self.path.display()))
            })?;
        let temp = self.path.with_file_name(format!(".{file_name}.tmp"));
        tokio::fs::write(&temp, text.as_bytes()).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        debug!(path = %self.path.display(), bytes = text.len(), "document written");
        Ok(())
    }
}

fn segments(key: &str) -> StorageResult<Vec<&str>> {
    let parts: Vec<&str> = key.split(PATH_SEPARATOR).collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(StorageError::InvalidArgument(format!("invalid key `{key}`")));
    }
    Ok(parts)
}

/// Walk to the node at `path`, if every step is a map.
fn lookup<'a>(document: &'a Map<String, Json>, path: &[&str]) -> Option<&'a Json> {
    let (last, parents) = path.split_last()?;
    let mut node = document;
    for segment in parents {
        node = node.get(*segment)?.as_object()?;
    }
    node.get(*last)
}

/// Walk to the map that will hold `path`'s last segment, creating maps along
/// the way. Non-map intermediates are replaced.
fn parent_mut<'a>(
    document: &'a mut Map<String, Json>,
    parents: &[&str],
) -> StorageResult<&'a mut Map<String, Json>> {
    let mut node = document;
    for segment in parents {
        let slot = node
            .entry(segment.to_string())
            .or_insert_with(|| Json::Object(Map::new()));
        if !slot.is_object() {
            *slot = Json::Object(Map::new());
        }
        node = slot
            .as_object_mut()
            .ok_or_else(|| StorageError::mismatch(*segment, "composite", "primitive"))?;
    }
    Ok(node)
}

fn to_object(key: &str, node: Json) -> StorageResult<DecomposedObject> {
    match node {
        Json::Object(map) => Ok(DecomposedObject::from_json(Json::Object(map))?),
        other => Err(StorageError::mismatch(key, "composite", json_kind(&other))),
    }
}

#[async_trait]
impl StorageContainer for FlatFileContainer {
    fn backend(&self) -> &'static str {
        "flat-file"
    }

    #[instrument(skip(self, object), fields(path = %self.path.display()))]
    async fn store(&self, key: &str, object: &DecomposedObject) -> StorageResult<()> {
        let path = segments(key)?;
        let tree = object.to_json()?;
        self.modify(move |document| {
            let (last, parents) = path
                .split_last()
                .ok_or_else(|| StorageError::InvalidArgument("empty key".into()))?;
            parent_mut(document, parents)?.insert(last.to_string(), tree);
            Ok(true)
        })
        .await
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn retrieve(&self, key: &str) -> StorageResult<DecomposedObject> {
        let path = segments(key)?;
        let document = Self::load(&self.path, self.format).await?;
        let node = lookup(&document, &path).ok_or_else(|| not_found(key))?;
        to_object(key, node.clone())
    }

    /// Streams the composite entries at the top level of the document.
    fn retrieve_all(&self, predicate: Option<&Predicate>) -> EntryStream {
        let path = self.path.clone();
        let format = self.format;
        let predicate = predicate.cloned();
        stream::once(async move { Self::load(&path, format).await })
            .map(move |loaded| match loaded {
                Ok(document) => {
                    let predicate = predicate.clone();
                    stream::iter(document)
                        .filter_map(move |(key, node)| {
                            let item = match node {
                                Json::Object(_) => match to_object(&key, node) {
                                    Ok(object)
                                        if predicate.as_ref().is_none_or(|p| p.matches(&object)) =>
                                    {
                                        Some(Ok((key, object)))
                                    }
                                    Ok(_) => None,
                                    Err(e) => Some(Err(e)),
                                },
                                _ => None,
                            };
                            async move { item }
                        })
                        .boxed()
                }
                Err(e) => stream::once(async move { Err(e) }).boxed(),
            })
            .flatten()
            .boxed()
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = segments(key)?;
        self.modify(move |document| {
            let Some((last, parents)) = path.split_last() else {
                return Ok(false);
            };
            let mut node = document;
            for segment in parents {
                match node.get_mut(*segment).and_then(Json::as_object_mut) {
                    Some(child) => node = child,
                    None => return Ok(false),
                }
            }
            Ok(node.remove(*last).is_some())
        })
        .await
    }

    /// Top-level keys of the document.
    async fn keys(&self) -> StorageResult<Vec<String>> {
        let document = Self::load(&self.path, self.format).await?;
        Ok(document.keys().cloned().collect())
    }

    async fn contains(&self, key: &str) -> StorageResult<bool> {
        let path = segments(key)?;
        let document = Self::load(&self.path, self.format).await?;
        Ok(lookup(&document, &path).is_some())
    }
}

// ── tests ────────────────────────────────────────────────────────────
