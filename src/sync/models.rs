//! Sync Data Models - Shared Structures
//!
//! Defines the entity kinds that take part in sync, the `SyncRecord` contract
//! every kind implements, timestamp helpers, and sync configuration.
//!
//! Timestamps are stored as fixed-width `YYYY-MM-DDTHH:MM:SS.mmmZ` strings so
//! that lexical comparison is chronological comparison.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

// ============================================================================
// Entity Kinds
// ============================================================================

/// Kind of synced entity. Each kind has its own queues and remote table scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    BookVocabulary,
    GlobalVocabulary,
    ReadingProgress,
    Book,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BookVocabulary => "book-vocab",
            Self::GlobalVocabulary => "global-vocab",
            Self::ReadingProgress => "progress",
            Self::Book => "book",
        }
    }

    /// Remote table holding rows of this kind
    pub fn table(&self) -> &'static str {
        match self {
            Self::BookVocabulary | Self::GlobalVocabulary => "vocabulary",
            Self::ReadingProgress => "progress",
            Self::Book => "books",
        }
    }

    /// Value of the `kind` discriminator column for tables shared by kinds
    pub fn row_kind(&self) -> Option<&'static str> {
        match self {
            Self::BookVocabulary => Some("book"),
            Self::GlobalVocabulary => Some("global"),
            _ => None,
        }
    }

    /// Column carrying the record id remotely
    pub fn id_column(&self) -> &'static str {
        match self {
            Self::ReadingProgress => "book_id",
            _ => "id",
        }
    }

    /// Column a scoped pull filters on
    pub fn scope_column(&self) -> Option<&'static str> {
        match self {
            Self::BookVocabulary | Self::ReadingProgress => Some("book_id"),
            Self::GlobalVocabulary => Some("language"),
            Self::Book => None,
        }
    }

    /// Upsert conflict target (owner + id)
    pub fn conflict_key(&self) -> &'static str {
        match self {
            Self::ReadingProgress => "user_id,book_id",
            _ => "user_id,id",
        }
    }

    /// Map a realtime `(table, row)` pair back to its kind
    pub fn from_table_row(table: &str, row: &Value) -> Option<Self> {
        match table {
            "vocabulary" => match row.get("kind").and_then(Value::as_str) {
                Some("global") => Some(Self::GlobalVocabulary),
                Some("book") => Some(Self::BookVocabulary),
                // Rows without a discriminator are book-scoped if they carry a book
                _ if row.get("book_id").map_or(false, |v| !v.is_null()) => {
                    Some(Self::BookVocabulary)
                }
                _ => None,
            },
            "progress" => Some(Self::ReadingProgress),
            "books" => Some(Self::Book),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Timestamps
// ============================================================================

/// Format a UTC instant as a fixed-width ISO-8601 string
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time as a fixed-width ISO-8601 string
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Re-render any RFC 3339 timestamp (e.g. `+00:00` offsets from the backend)
/// in the fixed-width form. Returns `None` if it does not parse.
pub fn normalize_timestamp(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(trimmed)
        .ok()
        .map(|dt| format_timestamp(dt.with_timezone(&Utc)))
}

/// Stamp for a new local write: now, but never earlier than the previous stamp
pub fn next_write_timestamp(previous: Option<&str>) -> String {
    let now = now_timestamp();
    match previous {
        Some(prev) if prev > now.as_str() => prev.to_string(),
        _ => now,
    }
}

// ============================================================================
// Record Contract
// ============================================================================

/// A remote row could not be mapped to a local record
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RowError {
    #[error("Row is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("Row field '{0}' has an invalid value")]
    InvalidField(&'static str),
}

/// Shape shared by every synced entity kind
pub trait SyncRecord:
    Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    const KIND: EntityKind;

    /// Unique within the owning user + kind
    fn id(&self) -> &str;

    /// Owner scope inside the user (book id, language, ...)
    fn scope(&self) -> &str;

    fn updated_at(&self) -> &str;
    fn set_updated_at(&mut self, timestamp: String);

    fn created_at(&self) -> &str;
    fn set_created_at(&mut self, timestamp: String);

    /// Remote row for this record, owned by `user_id`
    fn to_row(&self, user_id: &str) -> Value;

    /// Local record from a remote row
    fn from_row(row: &Value) -> Result<Self, RowError>;
}

// ============================================================================
// Row Helpers
// ============================================================================

pub(crate) fn row_str(row: &Value, key: &str) -> Option<String> {
    match row.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Numeric field, tolerating strings and nulls (null and garbage become 0)
pub(crate) fn row_f64(row: &Value, key: &str) -> f64 {
    match row.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()).unwrap_or(0.0),
        _ => 0.0,
    }
}

pub(crate) fn row_i64(row: &Value, key: &str) -> i64 {
    row_f64(row, key).trunc() as i64
}

pub(crate) fn row_timestamp(row: &Value, key: &str) -> Option<String> {
    row_str(row, key).map(|raw| normalize_timestamp(&raw).unwrap_or(raw))
}

pub(crate) fn row_string_list(row: &Value, key: &str) -> Vec<String> {
    match row.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Required `updated_at`, with `created_at` falling back to it
pub(crate) fn row_stamps(row: &Value) -> Result<(String, String), RowError> {
    let updated_at = row_timestamp(row, "updated_at").ok_or(RowError::MissingField("updated_at"))?;
    let created_at = row_timestamp(row, "created_at").unwrap_or_else(|| updated_at.clone());
    Ok((created_at, updated_at))
}

/// Normalize a word for id building: lowercase, trimmed of surrounding punctuation
pub fn normalize_word(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_string()
}

// ============================================================================
// Sync Configuration
// ============================================================================

/// Sync configuration and state
///
/// Stored in the SQLite settings table under `sync_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Whether sync is enabled
    pub enabled: bool,

    /// Signed-in user (None when signed out)
    pub user_id: Option<String>,

    /// Unique device identifier (UUID v4)
    pub device_id: String,

    /// Device name, defaults to the hostname
    pub device_name: String,

    /// Periodic full sync interval in minutes
    pub sync_interval_minutes: u64,

    /// Run a full sync when a session starts
    pub sync_on_startup: bool,

    /// Debounce applied to ordinary upserts before a flush
    pub debounce_ms: u64,

    /// Delay before re-flushing items retained during a flush
    pub follow_up_ms: u64,

    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,

    /// Max ids per remote round trip
    pub batch_size: usize,

    /// Window during which an identical error status is not re-published
    pub status_throttle_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            user_id: None,
            device_id: uuid::Uuid::new_v4().to_string(),
            device_name: default_device_name(),
            sync_interval_minutes: 5,
            sync_on_startup: true,
            debounce_ms: 1200,
            follow_up_ms: 250,
            backoff_base_ms: 1500,
            backoff_max_ms: 30_000,
            batch_size: 100,
            status_throttle_secs: 10,
        }
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn follow_up(&self) -> Duration {
        Duration::from_millis(self.follow_up_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

/// Get default device name from hostname
fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "Lingosync Device".to_string())
}

/// Remote endpoint configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Base URL of the row API (e.g. `https://project.example.co`)
    pub api_url: String,

    /// Project API key sent with every request
    pub api_key: String,

    /// Websocket endpoint for realtime pushes; derived from `api_url` if unset
    pub realtime_url: Option<String>,

    pub timeout_secs: u64,
}

impl RemoteConfig {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into().trim().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            realtime_url: None,
            timeout_secs: 30,
        }
    }

    /// Load from `LINGOSYNC_*` environment variables (after `.env` is applied).
    /// Returns `None` when no API URL is configured.
    pub fn from_env() -> Option<Self> {
        let api_url = std::env::var("LINGOSYNC_API_URL").ok().filter(|v| !v.trim().is_empty())?;
        let api_key = std::env::var("LINGOSYNC_API_KEY").unwrap_or_default();

        let mut config = Self::new(api_url, api_key);
        config.realtime_url = std::env::var("LINGOSYNC_REALTIME_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());
        if let Some(secs) = std::env::var("LINGOSYNC_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.timeout_secs = secs;
        }
        Some(config)
    }

    pub fn is_configured(&self) -> bool {
        !self.api_url.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
