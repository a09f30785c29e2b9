// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relational store for replicated entities.
//!
//! A small SQLite-backed store that the capture hook observes and the replay
//! service writes into. Every entity table has the same shape:
//!
//! ```text
//! id          INTEGER PRIMARY KEY AUTOINCREMENT
//! payload     TEXT NOT NULL            -- JSON encoding of the entity
//! updated_at  INTEGER NOT NULL         -- epoch millis of the last write
//! deleted_at  INTEGER                  -- epoch millis of the soft delete
//! ```
//!
//! Deletes are soft so that backfill can re-announce them.
//!
//! # Hooks
//!
//! Registered [`StoreHook`]s run after every create, update and delete, even
//! when the write failed or hooks are suppressed; the [`HookContext`] says
//! which. Inside the default transaction a hook error rolls the write back.
//! With [`WriteOptions::skip_default_transaction`] the statement has already
//! committed and the hook error is only reported.
//!
//! # SQLite Busy Handling
//!
//! Connections carry a busy timeout, and reads retry SQLITE_BUSY/SQLITE_LOCKED
//! with exponential backoff.

use crate::error::{RelayError, Result};
use crate::messaging::BoxFuture;
use crate::registry::ErasedEntity;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;
const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
pub fn validate_table_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid && name.len() <= 64 {
        Ok(())
    } else {
        Err(RelayError::Config(format!("invalid table name: {:?}", name)))
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Write options and hooks
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-write session settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Tell hooks this write must not be observed.
    pub skip_hooks: bool,
    /// Run the statement in autocommit mode instead of a transaction.
    pub skip_default_transaction: bool,
    /// Write to this table instead of the entity's own (sharding).
    pub table: Option<String>,
}

impl WriteOptions {
    /// Session used when applying replicated mutations.
    pub fn replay() -> Self {
        Self {
            skip_hooks: true,
            skip_default_transaction: true,
            table: None,
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }
}

/// Which kind of write a hook is observing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Create => "create",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
        }
    }
}

/// What a hook gets to see about the write that just ran.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub kind: MutationKind,
    pub table: String,
    pub rows_affected: u64,
    /// Error text if the write itself failed.
    pub error: Option<String>,
    pub hooks_suppressed: bool,
}

/// Observer for entity writes.
pub trait StoreHook: Send + Sync + 'static {
    fn after_create<'a>(&'a self, _ctx: &'a HookContext, _entity: &'a dyn ErasedEntity) -> BoxFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn after_update<'a>(&'a self, _ctx: &'a HookContext, _entity: &'a dyn ErasedEntity) -> BoxFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn after_delete<'a>(&'a self, _ctx: &'a HookContext, _entity: &'a dyn ErasedEntity) -> BoxFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rows
// ═══════════════════════════════════════════════════════════════════════════════

/// A stored row as read back for backfill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub id: u64,
    pub payload: String,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl From<(i64, String, i64, Option<i64>)> for StoredRow {
    fn from((id, payload, updated_at, deleted_at): (i64, String, i64, Option<i64>)) -> Self {
        Self {
            id: id.max(0) as u64,
            payload,
            updated_at,
            deleted_at,
        }
    }
}

/// Keyset position for paging: `(timestamp, id)` of the last row seen.
pub type PageCursor = (i64, u64);

// ═══════════════════════════════════════════════════════════════════════════════
// Store
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLite-backed entity store.
pub struct SqlStore {
    pool: SqlitePool,
    hooks: RwLock<Vec<Arc<dyn StoreHook>>>,
    tables: DashSet<String>,
    path: String,
}

impl SqlStore {
    /// Open (or create) a store at the given path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        Self::open(&crate::config::StoreConfig {
            sqlite_path: path_str,
            wal_mode: true,
        })
        .await
    }

    /// Open a private in-memory store.
    pub async fn in_memory() -> Result<Self> {
        Self::open(&crate::config::StoreConfig::in_memory()).await
    }

    pub async fn open(config: &crate::config::StoreConfig) -> Result<Self> {
        let path_str = config.sqlite_path.clone();
        info!(path = %path_str, "Initializing entity store");

        let in_memory = path_str == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path_str)
        };

        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| RelayError::Config(format!("Invalid SQLite path: {}", e)))?
            .busy_timeout(SQLITE_BUSY_TIMEOUT)
            .create_if_missing(true);
        if config.wal_mode && !in_memory {
            options = options
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        }

        // Each in-memory connection is its own database: pin exactly one.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };

        let pool = pool_options.connect_with(options).await?;

        Ok(Self {
            pool,
            hooks: RwLock::new(Vec::new()),
            tables: DashSet::new(),
            path: path_str,
        })
    }

    /// Register a hook. Hooks run in registration order.
    pub fn add_hook(&self, hook: Arc<dyn StoreHook>) {
        self.hooks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(hook);
    }

    fn hook_snapshot(&self) -> Vec<Arc<dyn StoreHook>> {
        self.hooks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Create the table for `name` if this store hasn't seen it yet.
    pub async fn ensure_table(&self, name: &str) -> Result<()> {
        if self.tables.contains(name) {
            return Ok(());
        }
        validate_table_name(name)?;

        let pool = &self.pool;
        let create = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {name} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payload TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                deleted_at INTEGER
            )
            "#
        );
        let index_updated = format!("CREATE INDEX IF NOT EXISTS {name}_updated_at ON {name} (updated_at, id)");
        let index_deleted = format!("CREATE INDEX IF NOT EXISTS {name}_deleted_at ON {name} (deleted_at, id)");

        for statement in [&create, &index_updated, &index_deleted] {
            execute_with_retry("ensure_table", || async {
                sqlx::query(statement).execute(pool).await
            })
            .await?;
        }

        self.tables.insert(name.to_string());
        debug!(table = %name, "Entity table ready");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a new row. A missing or zero identity is assigned by the store
    /// and written back into the entity.
    pub async fn create(&self, entity: &mut dyn ErasedEntity, opts: &WriteOptions) -> Result<u64> {
        self.write(MutationKind::Create, WriteOp::Create, entity, opts).await
    }

    /// Update an existing live row by identity. Returns rows affected.
    pub async fn update(&self, entity: &mut dyn ErasedEntity, opts: &WriteOptions) -> Result<u64> {
        self.write(MutationKind::Update, WriteOp::Update, entity, opts).await
    }

    /// Upsert by identity; creates when the entity has no identity yet.
    pub async fn save(&self, entity: &mut dyn ErasedEntity, opts: &WriteOptions) -> Result<u64> {
        match entity.identity() {
            Some(id) if id > 0 => self.write(MutationKind::Update, WriteOp::Upsert, entity, opts).await,
            _ => self.create(entity, opts).await,
        }
    }

    /// Soft-delete by identity. Returns rows affected (0 if already deleted).
    pub async fn delete(&self, entity: &mut dyn ErasedEntity, opts: &WriteOptions) -> Result<u64> {
        self.write(MutationKind::Delete, WriteOp::Delete, entity, opts).await
    }

    async fn write(
        &self,
        kind: MutationKind,
        op: WriteOp,
        entity: &mut dyn ErasedEntity,
        opts: &WriteOptions,
    ) -> Result<u64> {
        let table = opts
            .table
            .clone()
            .unwrap_or_else(|| entity.table_name().to_string());
        self.ensure_table(&table).await?;

        if opts.skip_default_transaction {
            let mut conn = self.pool.acquire().await?;
            let result = apply_write(&mut conn, op, &table, entity).await;
            let hook_result = self.run_hooks(kind, &table, entity, &result, opts).await;
            let rows = result?;
            hook_result?;
            return Ok(rows);
        }

        let mut tx = self.pool.begin().await?;
        let result = apply_write(&mut tx, op, &table, entity).await;
        let hook_result = self.run_hooks(kind, &table, entity, &result, opts).await;
        match (result, hook_result) {
            (Ok(rows), Ok(())) => {
                tx.commit().await?;
                Ok(rows)
            }
            (Err(e), _) | (Ok(_), Err(e)) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(table = %table, error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn run_hooks(
        &self,
        kind: MutationKind,
        table: &str,
        entity: &dyn ErasedEntity,
        result: &Result<u64>,
        opts: &WriteOptions,
    ) -> Result<()> {
        let hooks = self.hook_snapshot();
        if hooks.is_empty() {
            return Ok(());
        }

        let ctx = HookContext {
            kind,
            table: table.to_string(),
            rows_affected: *result.as_ref().unwrap_or(&0),
            error: result.as_ref().err().map(|e| e.to_string()),
            hooks_suppressed: opts.skip_hooks,
        };

        for hook in hooks {
            match kind {
                MutationKind::Create => hook.after_create(&ctx, entity).await?,
                MutationKind::Update => hook.after_update(&ctx, entity).await?,
                MutationKind::Delete => hook.after_delete(&ctx, entity).await?,
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Fetch a row by id, including soft-deleted rows.
    pub async fn fetch_row(&self, table: &str, id: u64) -> Result<Option<StoredRow>> {
        self.ensure_table(table).await?;
        let pool = &self.pool;
        let sql = format!("SELECT id, payload, updated_at, deleted_at FROM {table} WHERE id = ?");

        let row: Option<(i64, String, i64, Option<i64>)> = execute_with_retry("fetch_row", || async {
            sqlx::query_as(&sql).bind(id as i64).fetch_optional(pool).await
        })
        .await?;

        Ok(row.map(StoredRow::from))
    }

    /// Fetch and decode a live entity by id.
    pub async fn get<T: crate::registry::Entity>(&self, id: u64) -> Result<Option<T>> {
        match self.fetch_row(<T as crate::registry::Entity>::table_name(), id).await? {
            Some(row) if row.deleted_at.is_none() => Ok(Some(serde_json::from_str(&row.payload)?)),
            _ => Ok(None),
        }
    }

    /// Count rows in a table.
    pub async fn count(&self, table: &str, include_deleted: bool) -> Result<u64> {
        self.ensure_table(table).await?;
        let pool = &self.pool;
        let sql = if include_deleted {
            format!("SELECT COUNT(*) FROM {table}")
        } else {
            format!("SELECT COUNT(*) FROM {table} WHERE deleted_at IS NULL")
        };

        let (count,): (i64,) = execute_with_retry("count", || async {
            sqlx::query_as(&sql).fetch_one(pool).await
        })
        .await?;
        Ok(count.max(0) as u64)
    }

    /// Live rows with `updated_at` in `[since, to)`, ordered by `(updated_at, id)`,
    /// starting after `after`.
    pub async fn page_updated(
        &self,
        table: &str,
        since: DateTime<Utc>,
        to: DateTime<Utc>,
        after: Option<PageCursor>,
        limit: usize,
    ) -> Result<Vec<StoredRow>> {
        self.page(table, "updated_at", "deleted_at IS NULL", since, to, after, limit)
            .await
    }

    /// Soft-deleted rows with `deleted_at` in `[since, to)`, ordered by
    /// `(deleted_at, id)`, starting after `after`.
    pub async fn page_deleted(
        &self,
        table: &str,
        since: DateTime<Utc>,
        to: DateTime<Utc>,
        after: Option<PageCursor>,
        limit: usize,
    ) -> Result<Vec<StoredRow>> {
        self.page(table, "deleted_at", "deleted_at IS NOT NULL", since, to, after, limit)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn page(
        &self,
        table: &str,
        column: &str,
        filter: &str,
        since: DateTime<Utc>,
        to: DateTime<Utc>,
        after: Option<PageCursor>,
        limit: usize,
    ) -> Result<Vec<StoredRow>> {
        self.ensure_table(table).await?;
        let pool = &self.pool;
        let (after_ts, after_id) = after
            .map(|(ts, id)| (ts, id as i64))
            .unwrap_or((i64::MIN, -1));

        let sql = format!(
            r#"
            SELECT id, payload, updated_at, deleted_at FROM {table}
            WHERE {filter}
              AND {column} >= ? AND {column} < ?
              AND ({column} > ? OR ({column} = ? AND id > ?))
            ORDER BY {column}, id
            LIMIT ?
            "#
        );

        let rows: Vec<(i64, String, i64, Option<i64>)> = execute_with_retry("page", || async {
            sqlx::query_as(&sql)
                .bind(since.timestamp_millis())
                .bind(to.timestamp_millis())
                .bind(after_ts)
                .bind(after_ts)
                .bind(after_id)
                .bind(limit.min(i64::MAX as usize) as i64)
                .fetch_all(pool)
                .await
        })
        .await?;

        Ok(rows.into_iter().map(StoredRow::from).collect())
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Entity store closed");
    }
}

#[derive(Debug, Clone, Copy)]
enum WriteOp {
    Create,
    Update,
    Upsert,
    Delete,
}

async fn apply_write(
    conn: &mut SqliteConnection,
    op: WriteOp,
    table: &str,
    entity: &mut dyn ErasedEntity,
) -> Result<u64> {
    let now = now_millis();
    let identity = entity.identity().filter(|id| *id > 0);

    match op {
        WriteOp::Create => {
            let id = match identity {
                Some(id) => {
                    let payload = String::from_utf8(entity.to_json()?)
                        .map_err(|e| RelayError::Serialization(e.to_string()))?;
                    sqlx::query(&format!(
                        "INSERT INTO {table} (id, payload, updated_at, deleted_at) VALUES (?, ?, ?, NULL)"
                    ))
                    .bind(id as i64)
                    .bind(payload)
                    .bind(now)
                    .execute(&mut *conn)
                    .await?;
                    id
                }
                None => {
                    // Reserve a rowid, then store the payload that carries it.
                    let done = sqlx::query(&format!(
                        "INSERT INTO {table} (payload, updated_at, deleted_at) VALUES ('{{}}', ?, NULL)"
                    ))
                    .bind(now)
                    .execute(&mut *conn)
                    .await?;
                    let id = done.last_insert_rowid().max(0) as u64;
                    entity.set_identity(id);
                    let payload = String::from_utf8(entity.to_json()?)
                        .map_err(|e| RelayError::Serialization(e.to_string()))?;
                    sqlx::query(&format!("UPDATE {table} SET payload = ? WHERE id = ?"))
                        .bind(payload)
                        .bind(id as i64)
                        .execute(&mut *conn)
                        .await?;
                    id
                }
            };
            debug!(table = %table, id, "Row created");
            Ok(1)
        }
        WriteOp::Update => {
            let Some(id) = identity else { return Ok(0) };
            let payload = String::from_utf8(entity.to_json()?)
                .map_err(|e| RelayError::Serialization(e.to_string()))?;
            let done = sqlx::query(&format!(
                "UPDATE {table} SET payload = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL"
            ))
            .bind(payload)
            .bind(now)
            .bind(id as i64)
            .execute(&mut *conn)
            .await?;
            Ok(done.rows_affected())
        }
        WriteOp::Upsert => {
            let Some(id) = identity else { return Ok(0) };
            let payload = String::from_utf8(entity.to_json()?)
                .map_err(|e| RelayError::Serialization(e.to_string()))?;
            let done = sqlx::query(&format!(
                r#"
                INSERT INTO {table} (id, payload, updated_at, deleted_at)
                VALUES (?, ?, ?, NULL)
                ON CONFLICT(id) DO UPDATE SET
                    payload = excluded.payload,
                    updated_at = excluded.updated_at,
                    deleted_at = NULL
                "#
            ))
            .bind(id as i64)
            .bind(payload)
            .bind(now)
            .execute(&mut *conn)
            .await?;
            Ok(done.rows_affected())
        }
        WriteOp::Delete => {
            let Some(id) = identity else { return Ok(0) };
            let done = sqlx::query(&format!(
                "UPDATE {table} SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL"
            ))
            .bind(now)
            .bind(now)
            .bind(id as i64)
            .execute(&mut *conn)
            .await?;
            Ok(done.rows_affected())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Entity;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Note {
        id: u64,
        body: String,
    }

    impl Entity for Note {
        fn table_name() -> &'static str {
            "notes"
        }
        fn identity(&self) -> Option<u64> {
            Some(self.id)
        }
        fn set_identity(&mut self, id: u64) {
            self.id = id;
        }
    }

    fn note(id: u64, body: &str) -> Note {
        Note { id, body: body.to_string() }
    }

    #[test]
    fn test_validate_table_name() {
        assert!(validate_table_name("users").is_ok());
        assert!(validate_table_name("_shard_01").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("1users").is_err());
        assert!(validate_table_name("users; DROP TABLE x").is_err());
        assert!(validate_table_name(&"a".repeat(65)).is_err());
    }

    #[tokio::test]
    async fn test_create_assigns_identity() {
        let store = SqlStore::in_memory().await.unwrap();
        let mut n = note(0, "first");

        store.create(&mut n, &WriteOptions::default()).await.unwrap();
        assert!(n.id > 0);

        let loaded: Note = store.get(n.id).await.unwrap().unwrap();
        assert_eq!(loaded, n);
    }

    #[tokio::test]
    async fn test_save_twice_keeps_one_row() {
        let store = SqlStore::in_memory().await.unwrap();

        store.save(&mut note(7, "a"), &WriteOptions::replay()).await.unwrap();
        store.save(&mut note(7, "b"), &WriteOptions::replay()).await.unwrap();

        assert_eq!(store.count("notes", true).await.unwrap(), 1);
        let loaded: Note = store.get(7).await.unwrap().unwrap();
        assert_eq!(loaded.body, "b");
    }

    #[tokio::test]
    async fn test_soft_delete_and_resurrect() {
        let store = SqlStore::in_memory().await.unwrap();
        let mut n = note(3, "x");
        store.save(&mut n, &WriteOptions::default()).await.unwrap();

        assert_eq!(store.delete(&mut n, &WriteOptions::default()).await.unwrap(), 1);
        assert_eq!(store.delete(&mut n, &WriteOptions::default()).await.unwrap(), 0);
        assert!(store.get::<Note>(3).await.unwrap().is_none());
        assert_eq!(store.count("notes", false).await.unwrap(), 0);
        assert_eq!(store.count("notes", true).await.unwrap(), 1);

        // A later save brings the row back.
        store.save(&mut n, &WriteOptions::default()).await.unwrap();
        assert!(store.get::<Note>(3).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_zero_identity_affects_nothing() {
        let store = SqlStore::in_memory().await.unwrap();
        store.save(&mut note(1, "keep"), &WriteOptions::default()).await.unwrap();

        let rows = store.delete(&mut note(0, ""), &WriteOptions::default()).await.unwrap();
        assert_eq!(rows, 0);
        assert_eq!(store.count("notes", false).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_table_override() {
        let store = SqlStore::in_memory().await.unwrap();
        let opts = WriteOptions::replay().with_table("notes_shard_1");
        store.save(&mut note(5, "s"), &opts).await.unwrap();

        assert_eq!(store.count("notes_shard_1", true).await.unwrap(), 1);
        assert_eq!(store.count("notes", true).await.unwrap(), 0);
    }

    struct CountingHook {
        seen: AtomicUsize,
        suppressed: AtomicUsize,
        fail: bool,
    }

    impl StoreHook for CountingHook {
        fn after_create<'a>(&'a self, ctx: &'a HookContext, _e: &'a dyn ErasedEntity) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                self.seen.fetch_add(1, Ordering::SeqCst);
                if ctx.hooks_suppressed {
                    self.suppressed.fetch_add(1, Ordering::SeqCst);
                }
                if self.fail {
                    return Err(RelayError::Serialization("hook refused".into()));
                }
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_hooks_see_suppression_flag() {
        let store = SqlStore::in_memory().await.unwrap();
        let hook = Arc::new(CountingHook { seen: AtomicUsize::new(0), suppressed: AtomicUsize::new(0), fail: false });
        store.add_hook(hook.clone());

        store.create(&mut note(0, "a"), &WriteOptions::default()).await.unwrap();
        store
            .create(&mut note(0, "b"), &WriteOptions { skip_hooks: true, ..Default::default() })
            .await
            .unwrap();

        assert_eq!(hook.seen.load(Ordering::SeqCst), 2);
        assert_eq!(hook.suppressed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hook_error_rolls_back_transaction() {
        let store = SqlStore::in_memory().await.unwrap();
        store.add_hook(Arc::new(CountingHook { seen: AtomicUsize::new(0), suppressed: AtomicUsize::new(0), fail: true }));

        let err = store.create(&mut note(0, "a"), &WriteOptions::default()).await.unwrap_err();
        assert!(matches!(err, RelayError::Serialization(_)));
        assert_eq!(store.count("notes", true).await.unwrap(), 0);

        // Without the default transaction the row stays, the error is still reported.
        let opts = WriteOptions { skip_default_transaction: true, ..Default::default() };
        assert!(store.create(&mut note(0, "b"), &opts).await.is_err());
        assert_eq!(store.count("notes", true).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_paging_is_keyset_ordered() {
        let store = SqlStore::in_memory().await.unwrap();
        for i in 1..=25 {
            store.save(&mut note(i, "p"), &WriteOptions::replay()).await.unwrap();
        }

        let since = DateTime::<Utc>::UNIX_EPOCH;
        let to = Utc::now() + chrono::Duration::minutes(1);
        let mut after = None;
        let mut seen = Vec::new();
        loop {
            let page = store.page_updated("notes", since, to, after, 10).await.unwrap();
            seen.extend(page.iter().map(|r| r.id));
            if page.len() < 10 {
                break;
            }
            let last = page.last().unwrap();
            after = Some((last.updated_at, last.id));
        }
        assert_eq!(seen, (1..=25).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_page_deleted_only_returns_deleted() {
        let store = SqlStore::in_memory().await.unwrap();
        for i in 1..=4 {
            store.save(&mut note(i, "d"), &WriteOptions::replay()).await.unwrap();
        }
        store.delete(&mut note(2, ""), &WriteOptions::replay()).await.unwrap();

        let since = DateTime::<Utc>::UNIX_EPOCH;
        let to = Utc::now() + chrono::Duration::minutes(1);
        let deleted = store.page_deleted("notes", since, to, None, 100).await.unwrap();
        let live = store.page_updated("notes", since, to, None, 100).await.unwrap();

        assert_eq!(deleted.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2]);
        assert_eq!(live.len(), 3);
    }

    #[tokio::test]
    async fn test_store_persistence() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("relay.db");

        {
            let store = SqlStore::new(&db_path).await.unwrap();
            store.save(&mut note(9, "durable"), &WriteOptions::default()).await.unwrap();
            store.close().await;
        }
        {
            let store = SqlStore::new(&db_path).await.unwrap();
            let loaded: Note = store.get(9).await.unwrap().unwrap();
            assert_eq!(loaded.body, "durable");
            store.close().await;
        }
    }
}
