//! # stowage-store
//!
//! Object persistence for typed application objects.
//!
//! Objects are decomposed into a backend-neutral [`DecomposedObject`], held
//! in a write-behind [`Cache`], and persisted through any
//! [`StorageContainer`]: a JSON or YAML document, a SQLite table, a host
//! object's attachment store, or memory.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │  Cache<T> (dirty tracking, scheduled flush, hooks)  │
//! ├─────────────────────────────────────────────────────┤
//! │  Decomposer (Stored types ⇄ DecomposedObject)       │
//! ├─────────────────────────────────────────────────────┤
//! │  StorageContainer                                   │
//! │    FlatFileContainer    (JSON / YAML document)      │
//! │    RelationalContainer  (SQLite table via schema)   │
//! │    AttachmentContainer  (host key-value stores)     │
//! │    MemoryContainer                                  │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use stowage_store::{Cache, FlatFileContainer, StorageSettings, stored};
//!
//! #[derive(Clone)]
//! struct Player { name: String, score: i64 }
//! stored!(Player { name: String, score: i64 });
//!
//! let container = Arc::new(FlatFileContainer::yaml("data/players.yml"));
//! let cache: Cache<Player> = Cache::builder(container)
//!     .settings(StorageSettings::load("stowage.toml")?)
//!     .build();
//! let _flusher = cache.start_flush_task();
//! cache.put("alice", Player { name: "Alice".into(), score: 0 }).await?;
//! ```

pub mod cache;
pub mod container;
pub mod db;
pub mod decomposed;
pub mod decomposer;
pub mod error;
pub mod hooks;
pub mod retry;
pub mod schema;
pub mod settings;
pub mod value;

// ── re-exports ───────────────────────────────────────────────────────

pub use cache::{Cache, CacheBuilder, CacheStats, CachedObject, EntryState, FlushReport, FlushTask};
pub use container::{
    AttachmentContainer, AttachmentPoint, ContainerConfig, DocumentFormat, EntryStream,
    FlatFileContainer, HookedContainer, HostRegistry, HostResolver, MemoryContainer, MemoryHost,
    RelationalContainer, StorageContainer,
};
pub use db::Database;
pub use decomposed::DecomposedObject;
pub use decomposer::{Decomposer, FieldKind, FieldSchema, FieldValue, Stored, TypeDescriptor};
pub use error::{StorageError, StorageResult};
pub use hooks::{HookContext, HookDecision, HookPhase, HookRegistry, Operation};
pub use retry::RetryPolicy;
pub use schema::{Column, ColumnPredicate, CompareOp, DataType, Predicate, Table};
pub use settings::{FlushMode, StorageSettings, WriteMode};
pub use value::{Blob, Value, ValueKind};
