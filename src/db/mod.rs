//! Database module for mailsink.
//!
//! This module provides SQLite connectivity, migration management, the
//! write gate that serializes mutations, and full-text index setup.

mod schema;

pub use schema::{FTS_SCHEMA, FTS_TABLE, MIGRATIONS};

use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::{MailsinkError, Result};

/// Busy timeout applied to every connection.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connections kept by an on-disk pool.
const MAX_FILE_CONNECTIONS: u32 = 8;

/// How the store answers search queries. Chosen once at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// FTS5 index maintained by triggers.
    FullText,
    /// Case-insensitive `LIKE` scan.
    Substring,
}

/// An open write transaction.
///
/// Holds the write gate for its whole lifetime. Dropping it without
/// calling [`WriteTxn::commit`] rolls the transaction back.
pub struct WriteTxn<'a> {
    _gate: MutexGuard<'a, ()>,
    tx: Transaction<'static, Sqlite>,
}

impl WriteTxn<'_> {
    /// Connection to execute statements on.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    /// Commit and release the write gate.
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

/// Database handle.
///
/// Cheap to clone; clones share the pool, the write gate and the closed
/// flag.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    search_mode: SearchMode,
    write_gate: Arc<Mutex<()>>,
    closed: Arc<AtomicBool>,
}

impl Database {
    /// Open a database at the specified path.
    ///
    /// If the database file doesn't exist, it will be created.
    /// Migrations are automatically applied and full-text search is
    /// enabled when available.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_file(path.as_ref(), true).await
    }

    /// Open the database described by the storage configuration.
    pub async fn open_with(config: &StorageConfig) -> Result<Self> {
        Self::open_file(Path::new(&config.path), config.full_text_search).await
    }

    /// Open an in-memory database for testing.
    pub async fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with(true).await
    }

    /// Open an in-memory database, optionally without the full-text index.
    pub async fn open_in_memory_with(full_text_search: bool) -> Result<Self> {
        debug!("Opening in-memory database");
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        // Every connection to :memory: is a separate database, so the pool
        // must hold exactly one and never recycle it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::initialize(pool, full_text_search).await
    }

    async fn open_file(path: &Path, full_text_search: bool) -> Result<Self> {
        info!("Opening database at {:?}", path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_FILE_CONNECTIONS)
            .connect_with(options)
            .await?;

        Self::initialize(pool, full_text_search).await
    }

    async fn initialize(pool: SqlitePool, full_text_search: bool) -> Result<Self> {
        let mut db = Self {
            pool,
            search_mode: SearchMode::Substring,
            write_gate: Arc::new(Mutex::new(())),
            closed: Arc::new(AtomicBool::new(false)),
        };
        db.migrate().await?;

        db.search_mode = if full_text_search {
            db.enable_full_text().await
        } else {
            info!("Full-text search disabled by configuration");
            SearchMode::Substring
        };

        Ok(db)
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Search mode selected at open.
    pub fn search_mode(&self) -> SearchMode {
        self.search_mode
    }

    /// Whether [`Database::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Begin a write transaction, waiting for any other writer to finish.
    ///
    /// Fails with [`MailsinkError::Shutdown`] once the store is closed.
    /// Callers already queued on the gate when [`Database::close`] starts
    /// still get their turn.
    pub async fn begin_write(&self) -> Result<WriteTxn<'_>> {
        if self.is_closed() {
            return Err(MailsinkError::Shutdown);
        }
        // The gate is FIFO and `close` holds it until the pool is shut, so
        // only writers that queued after `close` see a closed pool here.
        let gate = self.write_gate.lock().await;
        if self.pool.is_closed() {
            return Err(MailsinkError::Shutdown);
        }
        let tx = self.pool.begin().await.map_err(|e| match e {
            sqlx::Error::PoolClosed => MailsinkError::Shutdown,
            e => e.into(),
        })?;
        Ok(WriteTxn { _gate: gate, tx })
    }

    /// Stop accepting writes, wait up to `grace` for the writers already
    /// in flight or queued, then close the pool.
    pub async fn close(&self, grace: Duration) {
        self.closed.store(true, Ordering::SeqCst);

        let gate = match tokio::time::timeout(grace, self.write_gate.lock()).await {
            Ok(gate) => {
                debug!("No write in flight, closing database");
                Some(gate)
            }
            Err(_) => {
                warn!(
                    grace_secs = grace.as_secs_f64(),
                    "Write still in flight after grace period, closing database anyway"
                );
                None
            }
        };

        self.pool.close().await;
        drop(gate);
        info!("Database closed");
    }

    /// Get the current schema version.
    pub async fn schema_version(&self) -> Result<i64> {
        if !self.table_exists("schema_version").await? {
            return Ok(0);
        }

        let (version,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM schema_version")
                .fetch_one(&self.pool)
                .await?;

        Ok(version)
    }

    /// Apply pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        let current_version = self.schema_version().await?;
        let migrations = MIGRATIONS;

        if current_version as usize >= migrations.len() {
            debug!("Database is up to date (version {})", current_version);
            return Ok(());
        }

        info!(
            "Migrating database from version {} to {}",
            current_version,
            migrations.len()
        );

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version     INTEGER PRIMARY KEY,
                applied_at  TEXT NOT NULL DEFAULT (datetime('now'))
            )",
        )
        .execute(&self.pool)
        .await?;

        for (i, migration) in migrations.iter().enumerate().skip(current_version as usize) {
            let version = (i + 1) as i64;
            info!("Applying migration v{}", version);

            let mut tx = self.pool.begin().await?;
            sqlx::query(migration).execute(&mut *tx).await?;
            sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
                .bind(version)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            debug!("Migration v{} applied successfully", version);
        }

        info!(
            "Database migration complete (now at version {})",
            migrations.len()
        );
        Ok(())
    }

    /// Create the FTS5 index and its triggers, falling back to substring
    /// search if that fails.
    async fn enable_full_text(&self) -> SearchMode {
        match self.create_full_text_index().await {
            Ok(()) => {
                info!("FTS5 full-text search enabled");
                SearchMode::FullText
            }
            Err(e) => {
                warn!(error = %e, "FTS5 not available, search will use substring matching");
                SearchMode::Substring
            }
        }
    }

    async fn create_full_text_index(&self) -> Result<()> {
        let existed = self.table_exists(FTS_TABLE).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(FTS_SCHEMA).execute(&mut *tx).await?;
        if !existed {
            sqlx::query(schema::FTS_REBUILD).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Check if a table exists.
    pub async fn table_exists(&self, table_name: &str) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name=?)",
        )
        .bind(table_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("search_mode", &self.search_mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}
