//! Relational container over SQLite.
//!
//! Each container maps one [`Table`]. On first use the schema is checked:
//! a missing table is created from the declared columns, an existing one is
//! validated column by column (by SQLite affinity) and missing columns are
//! added. Stores are single-statement upserts keyed by the table's key
//! column, so no application-level lock is needed. A batch store runs in
//! one transaction.
//!
//! Transient SQLite failures (busy, locked, I/O) are retried with the
//! configured [`RetryPolicy`] before surfacing as `BackendUnavailable`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use rusqlite::types::Value as SqlValue;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

use super::{EntryStream, StorageContainer, not_found};
use crate::db::Database;
use crate::decomposed::DecomposedObject;
use crate::error::StorageResult;
use crate::retry::RetryPolicy;
use crate::schema::{Predicate, Table, quote_ident};

const BACKEND: &str = "relational";

/// Rows fetched per round trip by `retrieve_all`.
const PAGE_SIZE: usize = 64;

/// A [`StorageContainer`] mapping objects onto rows of one table.
#[derive(Debug, Clone)]
pub struct RelationalContainer {
    db: Database,
    table: Arc<Table>,
    retry: RetryPolicy,
    schema_ready: Arc<OnceCell<()>>,
}

impl RelationalContainer {
    pub fn new(db: Database, table: Table) -> Self {
        Self {
            db,
            table: Arc::new(table),
            retry: RetryPolicy::default(),
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Run `f` on the blocking pool, retrying transient failures.
    async fn run<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: Fn(&rusqlite::Connection, &Table) -> StorageResult<T> + Clone + Send + 'static,
        T: Send + 'static,
    {
        self.retry
            .run(BACKEND, || {
                let f = f.clone();
                let table = Arc::clone(&self.table);
                let db = self.db.clone();
                async move { db.execute(move |conn| f(conn, &*table)).await }
            })
            .await
    }

    /// Create or validate the table once per container.
    pub async fn ensure_schema(&self) -> StorageResult<()> {
        self.schema_ready
            .get_or_try_init(|| self.run(|conn, table| prepare_table(conn, table)))
            .await
            .map(|_| ())
    }

    async fn page(
        &self,
        predicate: Option<Predicate>,
        offset: usize,
    ) -> StorageResult<Vec<(String, DecomposedObject)>> {
        self.ensure_schema().await?;
        let (filter, params) = match &predicate {
            Some(p) if !p.is_empty() => {
                let (body, params) = p.to_sql(&self.table)?;
                (format!(" WHERE {body}"), params)
            }
            _ => (String::new(), Vec::new()),
        };
        self.run(move |conn, table| {
            let sql = format!(
                "SELECT {} FROM {}{filter} ORDER BY {} LIMIT {PAGE_SIZE} OFFSET {offset}",
                table.column_list(),
                table.quoted_name(),
                quote_ident(&table.key_column().name),
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
            let mut page = Vec::new();
            while let Some(row) = rows.next()? {
                page.push(table.decode_row(row)?);
            }
            Ok(page)
        })
        .await
    }
}

/// Create the table, or reconcile an existing one with the declared layout.
fn prepare_table(conn: &rusqlite::Connection, table: &Table) -> StorageResult<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table.quoted_name()))?;
    let actual = stmt
        .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    if actual.is_empty() {
        conn.execute(&table.create_sql(), [])?;
        info!(table = table.name(), "table created");
        return Ok(());
    }

    for column in table.reconcile(&actual)? {
        conn.execute(
            &format!(
                "ALTER TABLE {} ADD COLUMN {}",
                table.quoted_name(),
                column.added_definition()
            ),
            [],
        )?;
        info!(table = table.name(), column = %column.name, "column added");
    }
    debug!(table = table.name(), "table schema validated");
    Ok(())
}

fn select_by_key(table: &Table) -> String {
    format!(
        "SELECT {} FROM {} WHERE {} = ?1",
        table.column_list(),
        table.quoted_name(),
        quote_ident(&table.key_column().name)
    )
}

#[async_trait]
impl StorageContainer for RelationalContainer {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    #[instrument(skip(self, object), fields(table = self.table.name()))]
    async fn store(&self, key: &str, object: &DecomposedObject) -> StorageResult<()> {
        self.ensure_schema().await?;
        let row = self.table.encode_row(key, object)?;
        self.run(move |conn, table| {
            conn.execute(&table.upsert_sql(), rusqlite::params_from_iter(row.iter()))?;
            Ok(())
        })
        .await
    }

    /// Every row is encoded before any is written, then the batch is upserted
    /// in one transaction: either all rows land or none do.
    #[instrument(skip(self, objects), fields(table = self.table.name(), rows = objects.len()))]
    async fn store_all(&self, objects: &[(String, DecomposedObject)]) -> StorageResult<()> {
        self.ensure_schema().await?;
        let rows = objects
            .iter()
            .map(|(key, object)| self.table.encode_row(key, object))
            .collect::<StorageResult<Vec<_>>>()?;
        let rows = Arc::new(rows);
        self.retry
            .run(BACKEND, || {
                let rows = Arc::clone(&rows);
                let table = Arc::clone(&self.table);
                let db = self.db.clone();
                async move {
                    db.execute_mut(move |conn| {
                        let tx = conn.transaction()?;
                        {
                            let mut stmt = tx.prepare(&table.upsert_sql())?;
                            for row in rows.iter() {
                                stmt.execute(rusqlite::params_from_iter(row.iter()))?;
                            }
                        }
                        tx.commit()?;
                        Ok(())
                    })
                    .await
                }
            })
            .await
    }

    #[instrument(skip(self), fields(table = self.table.name()))]
    async fn retrieve(&self, key: &str) -> StorageResult<DecomposedObject> {
        self.ensure_schema().await?;
        let key_value = self.table.key_column().data_type.encode_key(key)?;
        let found = self
            .run(move |conn, table| {
                let mut stmt = conn.prepare(&select_by_key(table))?;
                let mut rows = stmt.query([&key_value])?;
                match rows.next()? {
                    Some(row) => table.decode_row(row).map(|(_, object)| Some(object)),
                    None => Ok(None),
                }
            })
            .await?;
        found.ok_or_else(|| not_found(key))
    }

    /// Pages through the table in key order, one page per poll batch.
    fn retrieve_all(&self, predicate: Option<&Predicate>) -> EntryStream {
        let this = self.clone();
        let predicate = predicate.cloned();
        stream::unfold(Some(0_usize), move |offset| {
            let this = this.clone();
            let predicate = predicate.clone();
            async move {
                let offset = offset?;
                let (page, next) = match this.page(predicate, offset).await {
                    Ok(rows) => {
                        let next = (rows.len() == PAGE_SIZE).then_some(offset + rows.len());
                        (rows.into_iter().map(Ok).collect::<Vec<_>>(), next)
                    }
                    Err(e) => (vec![Err(e)], None),
                };
                Some((stream::iter(page), next))
            }
        })
        .flatten()
        .boxed()
    }

    #[instrument(skip(self), fields(table = self.table.name()))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.ensure_schema().await?;
        let key_value = self.table.key_column().data_type.encode_key(key)?;
        let removed = self
            .run(move |conn, table| {
                let sql = format!(
                    "DELETE FROM {} WHERE {} = ?1",
                    table.quoted_name(),
                    quote_ident(&table.key_column().name)
                );
                Ok(conn.execute(&sql, [&key_value])?)
            })
            .await?;
        debug!(key, removed, "row delete");
        Ok(())
    }

    async fn keys(&self) -> StorageResult<Vec<String>> {
        self.ensure_schema().await?;
        self.run(|conn, table| {
            let key = quote_ident(&table.key_column().name);
            let sql = format!("SELECT {key} FROM {} ORDER BY {key}", table.quoted_name());
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            let mut keys = Vec::new();
            while let Some(row) = rows.next()? {
                keys.push(table.key_column().data_type.decode_key(row.get_ref(0)?)?);
            }
            Ok(keys)
        })
        .await
    }

    async fn contains(&self, key: &str) -> StorageResult<bool> {
        self.ensure_schema().await?;
        let key_value: SqlValue = self.table.key_column().data_type.encode_key(key)?;
        self.run(move |conn, table| {
            let sql = format!(
                "SELECT 1 FROM {} WHERE {} = ?1 LIMIT 1",
                table.quoted_name(),
                quote_ident(&table.key_column().name)
            );
            let mut stmt = conn.prepare(&sql)?;
            Ok(stmt.exists([&key_value])?)
        })
        .await
    }
}

// ── tests ────────────────────────────────────────────────────────────
