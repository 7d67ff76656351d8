//! Sync API Client - row API of the sync backend
//!
//! Handles the owner-scoped row operations the sync engine consumes:
//! - Existence/timestamp lookup by ids (before deletes)
//! - Batched delete and batched upsert (insert-or-replace by owner + id)
//! - Delta pull ordered by `updated_at`
//! - Owner-wide delete of a table (data erasure)
//! - Realtime change subscription (see `realtime`)

use super::models::{EntityKind, RemoteConfig};
use super::realtime;
use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

const REST_PATH: &str = "/rest/v1";

// ============================================================================
// Remote Client Contract
// ============================================================================

/// Type of a pushed row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeEvent {
    Insert,
    Update,
    Delete,
}

/// One owner-scoped row change pushed by the backend
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    pub kind: EntityKind,
    pub event: ChangeEvent,
    /// New row, or the old row (at least its key) for deletes
    pub row: Value,
}

pub type ChangeStream = BoxStream<'static, Result<RemoteChange, SyncApiError>>;

/// Row-oriented backend operations. Every call is idempotent when retried
/// with the same arguments.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Current rows (full) for `ids`; absent ids are simply missing
    async fn select_by_ids(
        &self,
        kind: EntityKind,
        user_id: &str,
        ids: &[String],
    ) -> Result<Vec<Value>, SyncApiError>;

    async fn delete_by_ids(
        &self,
        kind: EntityKind,
        user_id: &str,
        ids: &[String],
    ) -> Result<(), SyncApiError>;

    /// Insert-or-replace keyed by `kind.conflict_key()`
    async fn upsert_rows(&self, kind: EntityKind, rows: &[Value]) -> Result<(), SyncApiError>;

    /// Rows changed after `since` (all rows when `None`), oldest first
    async fn select_since(
        &self,
        kind: EntityKind,
        user_id: &str,
        scope: Option<&str>,
        since: Option<&str>,
    ) -> Result<Vec<Value>, SyncApiError>;

    /// Push stream of changes to rows owned by `user_id`
    async fn subscribe(&self, user_id: &str) -> Result<ChangeStream, SyncApiError>;

    /// Delete every row `user_id` owns in `kind`'s table. The vocabulary
    /// table is shared, so this removes both vocabulary kinds.
    async fn delete_owned(&self, kind: EntityKind, user_id: &str) -> Result<(), SyncApiError>;
}

// ============================================================================
// REST Client
// ============================================================================

/// HTTP client for the row API
pub struct RestRemoteClient {
    client: Client,
    config: RemoteConfig,
    /// User access token (cached in memory); the API key is used when absent
    access_token: Arc<RwLock<Option<String>>>,
}

impl RestRemoteClient {
    /// Create new API client
    pub fn new(config: RemoteConfig) -> Result<Self, SyncApiError> {
        if !config.is_configured() {
            return Err(SyncApiError::NotConfigured);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            config,
            access_token: Arc::new(RwLock::new(None)),
        })
    }

    /// Set access token (after login)
    pub async fn set_token(&self, token: String) {
        let mut guard = self.access_token.write().await;
        *guard = Some(token);
    }

    /// Get current token
    pub async fn get_token(&self) -> Option<String> {
        self.access_token.read().await.clone()
    }

    /// Clear token (logout)
    pub async fn clear_token(&self) {
        let mut guard = self.access_token.write().await;
        *guard = None;
    }

    fn table_url(&self, kind: EntityKind) -> String {
        format!("{}{}/{}", self.config.api_url, REST_PATH, kind.table())
    }

    /// Attach API key and bearer credentials
    async fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let bearer = self
            .get_token()
            .await
            .unwrap_or_else(|| self.config.api_key.clone());

        request
            .header("apikey", &self.config.api_key)
            .bearer_auth(bearer)
    }

    /// Owner filter plus the kind discriminator for shared tables
    fn owner_filters(kind: EntityKind, user_id: &str) -> Vec<(String, String)> {
        let mut filters = vec![("user_id".to_string(), format!("eq.{}", user_id))];
        if let Some(row_kind) = kind.row_kind() {
            filters.push(("kind".to_string(), format!("eq.{}", row_kind)));
        }
        filters
    }

    fn realtime_url(&self) -> Result<String, SyncApiError> {
        if let Some(url) = &self.config.realtime_url {
            return Ok(url.clone());
        }

        let mut url = url::Url::parse(&self.config.api_url)
            .map_err(|e| SyncApiError::InvalidUrl(e.to_string()))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| SyncApiError::InvalidUrl(self.config.api_url.clone()))?;
        url.set_path("/realtime/v1/websocket");
        url.query_pairs_mut()
            .append_pair("apikey", &self.config.api_key)
            .append_pair("vsn", "1.0.0");
        Ok(url.to_string())
    }
}

#[async_trait]
impl RemoteClient for RestRemoteClient {
    async fn select_by_ids(
        &self,
        kind: EntityKind,
        user_id: &str,
        ids: &[String],
    ) -> Result<Vec<Value>, SyncApiError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = Self::owner_filters(kind, user_id);
        query.push(("select".to_string(), "*".to_string()));
        query.push((kind.id_column().to_string(), in_filter(ids)));

        let request = self.client.get(self.table_url(kind)).query(&query);
        let response = self.authorize(request).await.send().await?;

        handle_response(response).await
    }

    async fn delete_by_ids(
        &self,
        kind: EntityKind,
        user_id: &str,
        ids: &[String],
    ) -> Result<(), SyncApiError> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut query = Self::owner_filters(kind, user_id);
        query.push((kind.id_column().to_string(), in_filter(ids)));

        let request = self
            .client
            .delete(self.table_url(kind))
            .query(&query)
            .header("Prefer", "return=minimal");
        let response = self.authorize(request).await.send().await?;

        if response.status().is_success() {
            log::debug!("Deleted {} remote {} rows", ids.len(), kind);
            Ok(())
        } else {
            Err(handle_error(response).await)
        }
    }

    async fn upsert_rows(&self, kind: EntityKind, rows: &[Value]) -> Result<(), SyncApiError> {
        if rows.is_empty() {
            return Ok(());
        }

        let request = self
            .client
            .post(self.table_url(kind))
            .query(&[("on_conflict", kind.conflict_key())])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(rows);
        let response = self.authorize(request).await.send().await?;

        if response.status().is_success() {
            log::debug!("Upserted {} remote {} rows", rows.len(), kind);
            Ok(())
        } else {
            Err(handle_error(response).await)
        }
    }

    async fn select_since(
        &self,
        kind: EntityKind,
        user_id: &str,
        scope: Option<&str>,
        since: Option<&str>,
    ) -> Result<Vec<Value>, SyncApiError> {
        let mut query = Self::owner_filters(kind, user_id);
        query.push(("select".to_string(), "*".to_string()));
        if let (Some(column), Some(scope)) = (kind.scope_column(), scope) {
            query.push((column.to_string(), format!("eq.{}", scope)));
        }
        if let Some(since) = since {
            query.push(("updated_at".to_string(), format!("gt.{}", since)));
        }
        query.push(("order".to_string(), "updated_at.asc".to_string()));

        let request = self.client.get(self.table_url(kind)).query(&query);
        let response = self.authorize(request).await.send().await?;

        handle_response(response).await
    }

    async fn subscribe(&self, user_id: &str) -> Result<ChangeStream, SyncApiError> {
        let url = self.realtime_url()?;
        let token = self
            .get_token()
            .await
            .unwrap_or_else(|| self.config.api_key.clone());

        realtime::connect(&url, user_id, &token).await
    }

    async fn delete_owned(&self, kind: EntityKind, user_id: &str) -> Result<(), SyncApiError> {
        let request = self
            .client
            .delete(self.table_url(kind))
            .query(&[("user_id", format!("eq.{}", user_id))])
            .header("Prefer", "return=minimal");
        let response = self.authorize(request).await.send().await?;

        if response.status().is_success() {
            log::info!("Deleted all remote {} rows for {}", kind.table(), user_id);
            Ok(())
        } else {
            Err(handle_error(response).await)
        }
    }
}

/// `in.("a","b")` list filter, quoting each id
fn in_filter(ids: &[String]) -> String {
    let quoted: Vec<String> = ids
        .iter()
        .map(|id| format!("\"{}\"", id.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("in.({})", quoted.join(","))
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Unauthorized - login required")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Invalid response from server")]
    InvalidResponse,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Realtime connection error: {0}")]
    WebSocket(String),

    #[error("Sync backend is not configured")]
    NotConfigured,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorResponse {
    message: String,
}

/// Handle successful JSON response
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, SyncApiError> {
    let status = response.status();

    if status.is_success() {
        response.json::<T>().await
            .map_err(|_| SyncApiError::InvalidResponse)
    } else {
        Err(handle_error(response).await)
    }
}

/// Convert error response to SyncApiError
async fn handle_error(response: reqwest::Response) -> SyncApiError {
    let status = response.status();
    let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
    let msg = serde_json::from_str::<ErrorResponse>(&body)
        .map(|e| e.message)
        .unwrap_or(body);

    match status {
        StatusCode::UNAUTHORIZED => SyncApiError::Unauthorized,
        StatusCode::FORBIDDEN => SyncApiError::Forbidden(msg),
        StatusCode::TOO_MANY_REQUESTS => SyncApiError::RateLimitExceeded,
        s if s.is_server_error() => SyncApiError::ServerError(msg),
        _ => SyncApiError::NetworkError(format!("{}: {}", status, msg)),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn client(url: &str) -> RestRemoteClient {
        RestRemoteClient::new(RemoteConfig::new(url, "anon-key")).unwrap()
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_requires_configuration() {
        assert!(matches!(
            RestRemoteClient::new(RemoteConfig::new("", "key")),
            Err(SyncApiError::NotConfigured)
        ));
    }

    #[test]
    fn test_in_filter_quotes_ids() {
        assert_eq!(in_filter(&ids(&["b1:cat", "b1:\"x\""])), r#"in.("b1:cat","b1:\"x\"")"#);
    }

    #[test]
    fn test_realtime_url_is_derived() {
        let client = client("https://project.example.co");
        assert_eq!(
            client.realtime_url().unwrap(),
            "wss://project.example.co/realtime/v1/websocket?apikey=anon-key&vsn=1.0.0"
        );
    }

    #[tokio::test]
    async fn test_token_management() {
        let client = client("http://localhost");
        assert!(client.get_token().await.is_none());

        client.set_token("jwt".to_string()).await;
        assert_eq!(client.get_token().await, Some("jwt".to_string()));

        client.clear_token().await;
        assert!(client.get_token().await.is_none());
    }

    #[tokio::test]
    async fn test_select_since_builds_delta_query() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/rest/v1/vocabulary")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("user_id".into(), "eq.u1".into()),
                Matcher::UrlEncoded("kind".into(), "eq.book".into()),
                Matcher::UrlEncoded("book_id".into(), "eq.b1".into()),
                Matcher::UrlEncoded("updated_at".into(), "gt.2024-01-01T00:00:00.000Z".into()),
                Matcher::UrlEncoded("order".into(), "updated_at.asc".into()),
            ]))
            .match_header("apikey", "anon-key")
            .match_header("authorization", "Bearer anon-key")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"id": "b1:cat", "updated_at": "2024-01-02T00:00:00.000Z"}]"#)
            .create_async()
            .await;

        let rows = client(&server.url())
            .select_since(
                EntityKind::BookVocabulary,
                "u1",
                Some("b1"),
                Some("2024-01-01T00:00:00.000Z"),
            )
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], "b1:cat");
    }

    #[tokio::test]
    async fn test_select_by_ids_uses_progress_key_column() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/rest/v1/progress")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("user_id".into(), "eq.u1".into()),
                Matcher::UrlEncoded("book_id".into(), r#"in.("b1","b2")"#.into()),
            ]))
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let client = client(&server.url());
        client.set_token("user-jwt".to_string()).await;
        let rows = client
            .select_by_ids(EntityKind::ReadingProgress, "u1", &ids(&["b1", "b2"]))
            .await
            .unwrap();

        mock.assert_async().await;
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_sends_conflict_key() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/rest/v1/vocabulary")
            .match_query(Matcher::UrlEncoded("on_conflict".into(), "user_id,id".into()))
            .match_header("prefer", "resolution=merge-duplicates,return=minimal")
            .match_body(Matcher::Regex(r#""id":"en:cat""#.into()))
            .with_status(201)
            .create_async()
            .await;

        client(&server.url())
            .upsert_rows(
                EntityKind::GlobalVocabulary,
                &[json!({"id": "en:cat", "kind": "global", "user_id": "u1"})],
            )
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_delete_owned_filters_by_owner_only() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("DELETE", "/rest/v1/vocabulary")
            .match_query(Matcher::Exact("user_id=eq.u1".into()))
            .match_header("prefer", "return=minimal")
            .with_status(204)
            .create_async()
            .await;

        client(&server.url())
            .delete_owned(EntityKind::BookVocabulary, "u1")
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_empty_batches_make_no_requests() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("GET", Matcher::Any).expect(0).create_async().await;

        let client = client(&server.url());
        assert!(client
            .select_by_ids(EntityKind::Book, "u1", &[])
            .await
            .unwrap()
            .is_empty());
        client.delete_by_ids(EntityKind::Book, "u1", &[]).await.unwrap();
        client.upsert_rows(EntityKind::Book, &[]).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_statuses_are_mapped() {
        let mut server = mockito::Server::new_async().await;
        let _unauthorized = server
            .mock("DELETE", "/rest/v1/books")
            .match_query(Matcher::Any)
            .with_status(401)
            .create_async()
            .await;
        let _server_error = server
            .mock("GET", "/rest/v1/books")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body(r#"{"message": "maintenance"}"#)
            .create_async()
            .await;

        let client = client(&server.url());
        assert!(matches!(
            client.delete_by_ids(EntityKind::Book, "u1", &ids(&["b1"])).await,
            Err(SyncApiError::Unauthorized)
        ));
        match client.select_since(EntityKind::Book, "u1", None, None).await {
            Err(SyncApiError::ServerError(msg)) => assert_eq!(msg, "maintenance"),
            other => panic!("unexpected result: {:?}", other.map(|rows| rows.len())),
        }
    }
}
