//! # Storage Module
//!
//! Local SQLite database shared by the lookup cache and the persistent queue.
//!
//! ## Architecture
//!
//! One long-lived [`SqlitePool`] is opened at startup and handed to every
//! consumer. Its size bounds how many storage calls run at once; callers past
//! that limit wait on acquisition instead of piling up connections.
//!
//! The data is disposable, so durability is relaxed: WAL journal,
//! `synchronous = NORMAL`, uncommitted reads allowed and temp tables in memory.
//!
//! ## Schema versioning
//!
//! `PRAGMA user_version` records the schema revision. When an older revision is
//! found the cache tables are dropped and rebuilt; the queue table is kept so
//! pending tracks survive upgrades.

pub mod cache;
pub mod persist_queue;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub use cache::{CacheHit, CacheLevel, CacheTable, LocalCache};
pub use persist_queue::{PersistentQueue, QueueRecord};

/// Bumped whenever the cache tables change shape.
pub const SCHEMA_VERSION: i64 = 3;

const MIGRATIONS: &[&str] = &[
    include_str!("../../migrations/0001_cache_tables.sql"),
    include_str!("../../migrations/0002_persist_queue.sql"),
];

const DROP_CACHE_TABLES: &str = include_str!("../../migrations/drop_cache_tables.sql");

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("migration error: {0}")]
    Migration(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Handle to the local database. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (or creates) the database file and brings the schema up to date.
    pub async fn open(path: &Path, workers: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(workers.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(Self::tune(options))
            .await?;

        let db = Self { pool };
        db.migrate().await?;

        info!("🗄️ Base de datos abierta en {} ({} conexiones)", path.display(), workers.max(1));
        Ok(db)
    }

    /// Single-connection in-memory database. The connection is never recycled,
    /// otherwise the data would vanish with it.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(Self::tune(options))
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    fn tune(options: SqliteConnectOptions) -> SqliteConnectOptions {
        options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .pragma("temp_store", "2")
            .pragma("read_uncommitted", "1")
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn schema_version(&self) -> Result<i64> {
        let row = sqlx::query("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>(0))
    }

    async fn migrate(&self) -> Result<()> {
        let found = self.schema_version().await?;
        if found != 0 && found != SCHEMA_VERSION {
            warn!(
                "🔄 Esquema de caché v{} obsoleto, reconstruyendo como v{}",
                found, SCHEMA_VERSION
            );
            sqlx::query(DROP_CACHE_TABLES)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Migration(e.to_string()))?;
        }

        for migration in MIGRATIONS {
            sqlx::query(migration)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Migration(e.to_string()))?;
        }

        // PRAGMA no admite parámetros enlazados
        sqlx::query(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Migration(e.to_string()))?;

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
