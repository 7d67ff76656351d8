//! Local Store - device-resident records
//!
//! Thin get/put/delete/list-by-scope adapter over the `records` table. Every
//! call is local; writes are visible to the next read.

use super::models::{EntityKind, SyncRecord};
use crate::db::{Database, DbError};
use rusqlite::params;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Corrupt {kind} record '{id}': {source}")]
    Corrupt {
        kind: EntityKind,
        id: String,
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Local durable store for one record kind
pub trait LocalStore<R: SyncRecord>: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<R>, StoreError>;

    /// Whole-record overwrite
    fn put(&self, record: R) -> Result<R, StoreError>;

    /// Returns whether a record was removed
    fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// Records in one owner scope, most recently updated first
    fn list_by_owner(&self, scope: &str) -> Result<Vec<R>, StoreError>;

    fn list_all(&self) -> Result<Vec<R>, StoreError>;

    /// Distinct owner scopes holding at least one record
    fn scopes(&self) -> Result<Vec<String>, StoreError>;
}

/// SQLite-backed store shared by all record kinds
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Database>,
}

impl SqliteStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Remove every record of every kind. Returns the number removed.
    pub fn clear_all(&self) -> Result<usize, StoreError> {
        Ok(self.db.execute("DELETE FROM records", [])?)
    }

    fn decode<R: SyncRecord>(id: String, payload: String) -> Result<R, StoreError> {
        serde_json::from_str(&payload).map_err(|source| StoreError::Corrupt {
            kind: R::KIND,
            id,
            source,
        })
    }

    fn decode_rows<R: SyncRecord>(rows: Vec<(String, String)>) -> Result<Vec<R>, StoreError> {
        rows.into_iter()
            .map(|(id, payload)| Self::decode::<R>(id, payload))
            .collect()
    }
}

impl<R: SyncRecord> LocalStore<R> for SqliteStore {
    fn get(&self, id: &str) -> Result<Option<R>, StoreError> {
        let payload: Option<String> = self.db.query_opt(
            "SELECT payload FROM records WHERE kind = ?1 AND id = ?2",
            params![R::KIND.as_str(), id],
            |row| row.get(0),
        )?;

        payload.map(|p| Self::decode::<R>(id.to_string(), p)).transpose()
    }

    fn put(&self, record: R) -> Result<R, StoreError> {
        let payload = serde_json::to_string(&record)?;
        self.db.execute(
            r#"
            INSERT OR REPLACE INTO records (kind, id, scope, updated_at, payload)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                R::KIND.as_str(),
                record.id(),
                record.scope(),
                record.updated_at(),
                payload
            ],
        )?;
        Ok(record)
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let removed = self.db.execute(
            "DELETE FROM records WHERE kind = ?1 AND id = ?2",
            params![R::KIND.as_str(), id],
        )?;
        Ok(removed > 0)
    }

    fn list_by_owner(&self, scope: &str) -> Result<Vec<R>, StoreError> {
        let rows = self.db.query(
            r#"
            SELECT id, payload FROM records
            WHERE kind = ?1 AND scope = ?2
            ORDER BY updated_at DESC
            "#,
            params![R::KIND.as_str(), scope],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Self::decode_rows(rows)
    }

    fn list_all(&self) -> Result<Vec<R>, StoreError> {
        let rows = self.db.query(
            "SELECT id, payload FROM records WHERE kind = ?1 ORDER BY updated_at DESC",
            params![R::KIND.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Self::decode_rows(rows)
    }

    fn scopes(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.db.query(
            "SELECT DISTINCT scope FROM records WHERE kind = ?1 AND scope != '' ORDER BY scope",
            params![R::KIND.as_str()],
            |row| row.get(0),
        )?)
    }
}
