//! Database module for Lingosync
//!
//! Provides the SQLite device database: the key/value `settings` table used as
//! durable per-device storage, and the `records` table backing the local store.

use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("No data directory available")]
    NoDataDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Durable per-device key/value storage.
///
/// Values are opaque strings; callers own their encoding.
pub trait DeviceStorage: Send + Sync {
    fn get_item(&self, key: &str) -> DbResult<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> DbResult<()>;
    fn remove_item(&self, key: &str) -> DbResult<()>;
}

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Open (or create) the database file and apply the schema
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(&db_path);

        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(2))
            .connection_timeout(std::time::Duration::from_secs(10))
            .test_on_check_out(false)
            .build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;
        Self::init_schema(&conn)?;
        drop(conn);

        log::info!("Opened device database at {}", db_path.display());

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Open the database at the platform data directory
    pub fn open_default() -> DbResult<Self> {
        Self::new(Self::default_path()?)
    }

    /// Platform-specific default database location
    pub fn default_path() -> DbResult<PathBuf> {
        directories::ProjectDirs::from("com", "lingosync", "Lingosync")
            .map(|dirs| dirs.data_dir().join("lingosync.db"))
            .ok_or(DbError::NoDataDir)
    }

    /// Create an in-memory database (for testing)
    ///
    /// Every pooled connection to `:memory:` is its own database, so the pool
    /// is capped at a single connection.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(std::time::Duration::from_secs(5))
            .build(manager)?;

        let conn = pool.get()?;
        Self::init_schema(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    fn init_schema(conn: &Connection) -> DbResult<()> {
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;
        Ok(())
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a setting value
    pub fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        match self.get_item(key)? {
            Some(json) => {
                let value: T = serde_json::from_str(&json)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Set a setting value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let json = serde_json::to_string(value)
            .map_err(|e| DbError::Serialization(e.to_string()))?;
        self.set_item(key, &json)
    }

    // =========================================================================
    // HELPER METHODS (for the local store and other internal use)
    // =========================================================================

    /// Execute a SQL statement and return affected rows
    pub fn execute<P>(&self, sql: &str, params: P) -> DbResult<usize>
    where
        P: rusqlite::Params,
    {
        let conn = self.get_conn()?;

        let affected = conn.execute(sql, params)?;
        Ok(affected)
    }

    /// Query database and map results
    pub fn query<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<Vec<T>>
    where
        P: rusqlite::Params,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, f)?;

        rows.collect::<rusqlite::Result<Vec<T>>>()
            .map_err(DbError::from)
    }

    /// Query a single optional row
    pub fn query_opt<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<Option<T>>
    where
        P: rusqlite::Params,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;

        match conn.query_row(sql, params, f) {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Execute batch SQL
    pub fn execute_batch(&self, sql: &str) -> DbResult<()> {
        let conn = self.get_conn()?;

        conn.execute_batch(sql).map_err(DbError::from)
    }
}

impl DeviceStorage for Database {
    fn get_item(&self, key: &str) -> DbResult<Option<String>> {
        self.query_opt(
            "SELECT value FROM settings WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
    }

    fn set_item(&self, key: &str, value: &str) -> DbResult<()> {
        self.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> DbResult<()> {
        self.execute("DELETE FROM settings WHERE key = ?1", [key])?;
        Ok(())
    }
}
