//! Error types for the stowage-store crate.
//!
//! Every public operation returns [`StorageError`] via [`StorageResult`].
//! The first block of variants is the storage taxonomy callers are expected
//! to match on; the second block wraps the underlying libraries.

use std::time::Duration;

use thiserror::Error;

use crate::hooks::HookPhase;

/// Alias for `Result<T, StorageError>`.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur anywhere in the persistence layer.
#[derive(Debug, Error)]
pub enum StorageError {
    // -- Decomposition / recomposition -------------------------------------
    /// A required field path was absent from a decomposed object.
    #[error("missing field: {path}")]
    MissingField { path: String },

    /// A stored primitive could not be converted losslessly to the declared kind.
    #[error("type mismatch at `{path}`: expected {expected}, found {found}")]
    TypeMismatch {
        path: String,
        expected: String,
        found: String,
    },

    // -- Schema -------------------------------------------------------------
    /// A declared table does not agree with the backend's actual schema, or
    /// an object carries a field the table has no column for.
    #[error("incompatible schema for table `{table}`: {reason}")]
    IncompatibleSchema { table: String, reason: String },

    // -- Backend ------------------------------------------------------------
    /// The requested key does not exist in the backend.
    #[error("key not found: {key}")]
    NotFound { key: String },

    /// A backend kept failing transiently after all retry attempts.
    #[error("{backend} backend unavailable after {attempts} attempt(s): {reason}")]
    BackendUnavailable {
        backend: &'static str,
        attempts: u32,
        reason: String,
    },

    /// The host object addressed by a key no longer exists.
    #[error("host object unavailable: {key}")]
    HostObjectUnavailable { key: String },

    /// A `before-*` hook vetoed the operation.
    #[error("{phase} hook rejected `{key}`: {reason}")]
    HookRejected {
        phase: HookPhase,
        key: String,
        reason: String,
    },

    /// An exclusive document lock could not be acquired in time.
    #[error("timed out after {waited:?} waiting for lock on {resource}")]
    LockTimeout { resource: String, waited: Duration },

    // -- Wrapped library errors ----------------------------------------------
    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization or deserialization failed.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Filesystem I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings or container configuration was invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An invalid argument was provided to a storage operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl StorageError {
    /// Shorthand for a [`StorageError::TypeMismatch`].
    pub fn mismatch(
        path: impl Into<String>,
        expected: impl ToString,
        found: impl ToString,
    ) -> Self {
        Self::TypeMismatch {
            path: path.into(),
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    /// Shorthand for a [`StorageError::MissingField`].
    pub fn missing(path: impl Into<String>) -> Self {
        Self::MissingField { path: path.into() }
    }

    /// Whether a retry might succeed.
    ///
    /// Only SQLite contention and I/O style failures qualify; everything else
    /// is a property of the data or the schema and will fail the same way
    /// again.
    pub fn is_transient(&self) -> bool {
        use rusqlite::ErrorCode;

        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::CannotOpen
                    | ErrorCode::SystemIoFailure
            ),
            Self::BackendUnavailable { .. } => true,
            _ => false,
        }
    }

    /// Re-root the field path of a decomposition error under `prefix`.
    ///
    /// Used when a nested composite fails so the caller sees `address.city`
    /// instead of `city`. Other variants pass through untouched.
    pub fn under(self, prefix: &str) -> Self {
        let join = |path: String| {
            if path.is_empty() {
                prefix.to_string()
            } else {
                format!("{prefix}.{path}")
            }
        };
        match self {
            Self::MissingField { path } => Self::MissingField { path: join(path) },
            Self::TypeMismatch {
                path,
                expected,
                found,
            } => Self::TypeMismatch {
                path: join(path),
                expected,
                found,
            },
            other => other,
        }
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn under_prefixes_field_paths() {
        let err = StorageError::missing("city").under("address");
        assert!(matches!(err, StorageError::MissingField { ref path } if path == "address.city"));

        let err = StorageError::mismatch("", "int", "string").under("items.0");
        match err {
            StorageError::TypeMismatch { path, .. } => assert_eq!(path, "items.0"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn under_leaves_other_variants_alone() {
        let err = StorageError::NotFound { key: "k".into() }.under("x");
        assert!(matches!(err, StorageError::NotFound { ref key } if key == "k"));
    }

    #[test]
    fn busy_sqlite_errors_are_transient() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(StorageError::from(busy).is_transient());

        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert!(!StorageError::from(constraint).is_transient());
        assert!(!StorageError::missing("a").is_transient());
    }

    #[test]
    fn display_includes_context() {
        let err = StorageError::LockTimeout {
            resource: "/tmp/doc.json".into(),
            waited: Duration::from_millis(20),
        };
        assert!(err.to_string().contains("/tmp/doc.json"));
    }
}
