//! SQLite connection handle used by the relational container.
//!
//! The [`Database`] struct wraps a `rusqlite::Connection` behind an
//! `Arc<Mutex<>>` and exposes async methods that use
//! `tokio::task::spawn_blocking` to avoid blocking the async runtime.
//! Clones share the connection, so several relational containers (one per
//! table) can sit on one database file.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};

/// Milliseconds SQLite waits on a locked database before reporting `SQLITE_BUSY`.
const BUSY_TIMEOUT_MS: i32 = 5_000;

/// Thread-safe handle to a SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (or create) a database at `path` and apply pragmas.
    ///
    /// This call blocks briefly (file I/O); use [`Database::open_async`] from
    /// async code.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::apply_pragmas(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open on the blocking pool.
    pub async fn open_async(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        tokio::task::spawn_blocking(move || Self::open(&path)).await?
    }

    /// Create an in-memory database.
    pub fn open_in_memory() -> StorageResult<Self> {
        debug!("opening in-memory database");

        let conn = Connection::open_in_memory()?;
        Self::apply_pragmas(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// File backing this database; `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Execute a closure against the connection on the blocking pool.
    ///
    /// ```ignore
    /// let count: i64 = db.execute(|conn| {
    ///     Ok(conn.query_row("SELECT count(*) FROM users", [], |row| row.get(0))?)
    /// }).await?;
    /// ```
    pub async fn execute<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Connection) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StorageError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&conn)
        })
        .await?
    }

    /// Execute a mutable closure (for transactions) on the blocking pool.
    pub async fn execute_mut<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&mut Connection) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StorageError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&mut conn)
        })
        .await?
    }

    // ── pragmas ──────────────────────────────────────────────────────

    fn apply_pragmas(conn: &Connection) -> StorageResult<()> {
        // WAL: readers do not block the writer.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS)?;

        debug!("database pragmas applied");
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_works() {
        let db = Database::open_in_memory().unwrap();
        let version: String = db
            .execute(|conn| {
                let v: String = conn.query_row("SELECT sqlite_version()", [], |row| row.get(0))?;
                Ok(v)
            })
            .await
            .unwrap();
        assert!(!version.is_empty());
        assert!(db.path().is_none());
    }

    #[tokio::test]
    async fn file_database_uses_wal_and_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.db");
        let db = Database::open_async(path.clone()).await.unwrap();
        assert!(path.exists());

        let journal: String = db
            .execute(|conn| {
                let v: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
                Ok(v)
            })
            .await
            .unwrap();
        assert_eq!(journal.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn execute_mut_runs_transactions() {
        let db = Database::open_in_memory().unwrap();
        db.execute_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute("CREATE TABLE t (v INTEGER)", [])?;
            tx.execute("INSERT INTO t VALUES (1), (2)", [])?;
            tx.commit()?;
            Ok(())
        })
        .await
        .unwrap();

        let sum: i64 = db
            .execute(|conn| Ok(conn.query_row("SELECT sum(v) FROM t", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(sum, 3);
    }
}
