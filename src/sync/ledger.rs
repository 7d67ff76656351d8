//! Tombstone Ledger - persisted delete intents
//!
//! Pending deletes are written to device storage as soon as they are
//! recorded, so a reload before the next flush does not lose them. Stored as a
//! JSON array of `{"id", "deletedAt"}` objects under
//! `pending-deletes:<kind>:<userId>`.

use super::models::EntityKind;
use crate::db::{DbError, DeviceStorage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// id -> deletedAt
pub type Tombstones = BTreeMap<String, String>;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LedgerEntry {
    id: String,
    deleted_at: String,
}

/// Storage key of the ledger for one (kind, user)
pub fn ledger_key(kind: EntityKind, user_id: &str) -> String {
    format!("pending-deletes:{}:{}", kind.as_str(), user_id)
}

#[derive(Clone)]
pub struct TombstoneLedger {
    storage: Arc<dyn DeviceStorage>,
}

impl TombstoneLedger {
    pub fn new(storage: Arc<dyn DeviceStorage>) -> Self {
        Self { storage }
    }

    /// Load the ledger. Never fails: unreadable storage or malformed JSON
    /// yields an empty map, malformed entries are skipped.
    pub fn load(&self, key: &str) -> Tombstones {
        let key = key.trim();
        if key.is_empty() {
            return Tombstones::new();
        }

        let raw = match self.storage.get_item(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Tombstones::new(),
            Err(e) => {
                log::warn!("Failed to read tombstone ledger {}: {}", key, e);
                return Tombstones::new();
            }
        };

        let entries = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(entries)) => entries,
            Ok(_) => {
                log::warn!("Tombstone ledger {} is not an array, ignoring", key);
                return Tombstones::new();
            }
            Err(e) => {
                log::warn!("Tombstone ledger {} is not valid JSON: {}", key, e);
                return Tombstones::new();
            }
        };

        let mut tombstones = Tombstones::new();
        let mut skipped = 0usize;
        for entry in &entries {
            match parse_entry(entry) {
                Some((id, deleted_at)) => {
                    tombstones.insert(id, deleted_at);
                }
                None => skipped += 1,
            }
        }

        if skipped > 0 {
            log::warn!("Skipped {} malformed entries in tombstone ledger {}", skipped, key);
        }
        tombstones
    }

    pub fn save(&self, key: &str, tombstones: &Tombstones) -> Result<(), DbError> {
        let key = key.trim();
        if key.is_empty() {
            return Ok(());
        }

        let entries: Vec<LedgerEntry> = tombstones
            .iter()
            .map(|(id, deleted_at)| LedgerEntry {
                id: id.clone(),
                deleted_at: deleted_at.clone(),
            })
            .collect();
        let json = serde_json::to_string(&entries)
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        self.storage.set_item(key, &json)
    }
}

/// Accepts `{"id", "deletedAt"}` objects and `[id, deletedAt]` pairs
fn parse_entry(entry: &Value) -> Option<(String, String)> {
    let (id, deleted_at) = match entry {
        Value::Object(map) => (map.get("id")?, map.get("deletedAt")?),
        Value::Array(pair) if pair.len() == 2 => (&pair[0], &pair[1]),
        _ => return None,
    };

    let id = id.as_str()?.trim();
    let deleted_at = deleted_at.as_str()?;
    if id.is_empty() || deleted_at.is_empty() {
        return None;
    }
    Some((id.to_string(), deleted_at.to_string()))
}
