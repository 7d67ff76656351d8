//! Realtime change feed
//!
//! Websocket channel speaking the backend's channel protocol: join an
//! owner-scoped topic listening for row changes on the synced tables, send a
//! heartbeat every 30s, and forward `postgres_changes` frames as
//! `RemoteChange`s.

use super::api::{ChangeEvent, ChangeStream, RemoteChange, SyncApiError};
use super::models::EntityKind;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CHANNEL_CAPACITY: usize = 64;
const JOIN_REF: &str = "1";
const SYNCED_TABLES: [&str; 3] = ["vocabulary", "progress", "books"];

/// A decoded server frame
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Frame {
    Changes(Vec<RemoteChange>),
    JoinFailed(String),
    Other,
}

pub(crate) fn topic(user_id: &str) -> String {
    format!("realtime:lingosync:{}", user_id)
}

pub(crate) fn join_message(user_id: &str, access_token: &str) -> Value {
    let filter = format!("user_id=eq.{}", user_id);
    let changes: Vec<Value> = SYNCED_TABLES
        .iter()
        .map(|table| {
            json!({
                "event": "*",
                "schema": "public",
                "table": table,
                "filter": filter,
            })
        })
        .collect();

    json!({
        "topic": topic(user_id),
        "event": "phx_join",
        "payload": {
            "config": { "postgres_changes": changes },
            "access_token": access_token,
        },
        "ref": JOIN_REF,
    })
}

fn heartbeat_message(msg_ref: u64) -> Value {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": msg_ref.to_string(),
    })
}

/// Decode one text frame. Unknown or irrelevant frames are `Frame::Other`.
pub(crate) fn parse_frame(text: &str) -> Frame {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        log::warn!("Ignoring non-JSON realtime frame");
        return Frame::Other;
    };

    match frame.get("event").and_then(Value::as_str) {
        Some("postgres_changes") => {
            let changes = parse_changes(&frame["payload"]["data"]);
            if changes.is_empty() {
                Frame::Other
            } else {
                Frame::Changes(changes)
            }
        }
        Some("phx_reply") if frame.get("ref").and_then(Value::as_str) == Some(JOIN_REF) => {
            let payload = &frame["payload"];
            if payload.get("status").and_then(Value::as_str) == Some("error") {
                let reason = payload["response"]["reason"]
                    .as_str()
                    .unwrap_or("join rejected")
                    .to_string();
                Frame::JoinFailed(reason)
            } else {
                Frame::Other
            }
        }
        _ => Frame::Other,
    }
}

/// A delete's old record may carry only the primary key. For the shared
/// vocabulary table that leaves the kind unknown, so the delete is fanned out
/// to both vocabulary kinds; the one that does not hold the id ignores it.
fn parse_changes(data: &Value) -> Vec<RemoteChange> {
    let Some(table) = data.get("table").and_then(Value::as_str) else {
        return Vec::new();
    };
    let event = match data.get("type").and_then(Value::as_str) {
        Some("INSERT") => ChangeEvent::Insert,
        Some("UPDATE") => ChangeEvent::Update,
        Some("DELETE") => ChangeEvent::Delete,
        _ => return Vec::new(),
    };

    let row = match event {
        ChangeEvent::Delete => data.get("old_record"),
        _ => data.get("record"),
    };
    let Some(row) = row.filter(|r| r.is_object()) else {
        return Vec::new();
    };

    let kinds = match EntityKind::from_table_row(table, row) {
        Some(kind) => vec![kind],
        None if event == ChangeEvent::Delete && table == EntityKind::GlobalVocabulary.table() => {
            log::debug!("Vocabulary delete without a kind, applying to both vocabulary kinds");
            vec![EntityKind::BookVocabulary, EntityKind::GlobalVocabulary]
        }
        None => return Vec::new(),
    };

    kinds
        .into_iter()
        .map(|kind| RemoteChange {
            kind,
            event,
            row: row.clone(),
        })
        .collect()
}

/// Open the websocket, join the user's topic, and return the change stream.
/// The stream ends when the connection closes; errors are yielded once.
pub async fn connect(url: &str, user_id: &str, access_token: &str) -> Result<ChangeStream, SyncApiError> {
    let (socket, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| SyncApiError::WebSocket(e.to_string()))?;
    let (mut sink, mut source) = socket.split();

    sink.send(Message::Text(join_message(user_id, access_token).to_string()))
        .await
        .map_err(|e| SyncApiError::WebSocket(e.to_string()))?;
    log::info!("Realtime channel joined for user {}", user_id);

    let (tx, rx) = mpsc::channel::<Result<RemoteChange, SyncApiError>>(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut msg_ref: u64 = 1;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    msg_ref += 1;
                    let beat = Message::Text(heartbeat_message(msg_ref).to_string());
                    if let Err(e) = sink.send(beat).await {
                        let _ = tx.send(Err(SyncApiError::WebSocket(e.to_string()))).await;
                        break;
                    }
                }
                message = source.next() => match message {
                    Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                        Frame::Changes(changes) => {
                            let mut closed = false;
                            for change in changes {
                                if tx.send(Ok(change)).await.is_err() {
                                    closed = true;
                                    break;
                                }
                            }
                            if closed {
                                break;
                            }
                        }
                        Frame::JoinFailed(reason) => {
                            let _ = tx.send(Err(SyncApiError::WebSocket(reason))).await;
                            break;
                        }
                        Frame::Other => {}
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Realtime channel closed by server");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = tx.send(Err(SyncApiError::WebSocket(e.to_string()))).await;
                        break;
                    }
                },
                _ = tx.closed() => {
                    log::debug!("Realtime subscriber dropped, closing channel");
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    Ok(stream.boxed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_message_scopes_every_table_to_user() {
        let join = join_message("u1", "token");
        assert_eq!(join["topic"], "realtime:lingosync:u1");
        assert_eq!(join["event"], "phx_join");

        let changes = join["payload"]["config"]["postgres_changes"].as_array().unwrap();
        assert_eq!(changes.len(), 3);
        assert!(changes.iter().all(|c| c["filter"] == "user_id=eq.u1"));
    }

    #[test]
    fn test_parse_update_frame() {
        let frame = r#"{
            "topic": "realtime:lingosync:u1",
            "event": "postgres_changes",
            "payload": {"data": {
                "table": "vocabulary",
                "type": "UPDATE",
                "record": {"id": "en:cat", "kind": "global", "updated_at": "2024-01-01T10:05:00.000Z"},
                "old_record": {"id": "en:cat"}
            }},
            "ref": null
        }"#;

        match parse_frame(frame) {
            Frame::Changes(changes) => {
                assert_eq!(changes.len(), 1);
                let change = &changes[0];
                assert_eq!(change.kind, EntityKind::GlobalVocabulary);
                assert_eq!(change.event, ChangeEvent::Update);
                assert_eq!(change.row["updated_at"], "2024-01-01T10:05:00.000Z");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_parse_delete_frame_uses_old_record() {
        let frame = r#"{
            "event": "postgres_changes",
            "payload": {"data": {
                "table": "progress",
                "type": "DELETE",
                "record": null,
                "old_record": {"book_id": "b1"}
            }}
        }"#;

        match parse_frame(frame) {
            Frame::Changes(changes) => {
                assert_eq!(changes.len(), 1);
                let change = &changes[0];
                assert_eq!(change.kind, EntityKind::ReadingProgress);
                assert_eq!(change.event, ChangeEvent::Delete);
                assert_eq!(change.row["book_id"], "b1");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_key_only_vocabulary_delete_reaches_both_kinds() {
        let frame = r#"{
            "event": "postgres_changes",
            "payload": {"data": {
                "table": "vocabulary",
                "type": "DELETE",
                "record": null,
                "old_record": {"user_id": "u1", "id": "b1:cat"}
            }}
        }"#;

        let Frame::Changes(changes) = parse_frame(frame) else {
            panic!("key-only delete was dropped");
        };
        let kinds: Vec<EntityKind> = changes.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![EntityKind::BookVocabulary, EntityKind::GlobalVocabulary]);
        assert!(changes.iter().all(|c| c.event == ChangeEvent::Delete && c.row["id"] == "b1:cat"));
    }

    #[test]
    fn test_key_only_vocabulary_update_is_ignored() {
        let frame = r#"{"event": "postgres_changes", "payload": {"data": {
            "table": "vocabulary", "type": "UPDATE", "record": {"id": "b1:cat"}}}}"#;
        assert_eq!(parse_frame(frame), Frame::Other);
    }

    #[test]
    fn test_parse_join_reply() {
        let ok = r#"{"event": "phx_reply", "ref": "1", "payload": {"status": "ok", "response": {}}}"#;
        assert_eq!(parse_frame(ok), Frame::Other);

        let rejected = r#"{"event": "phx_reply", "ref": "1",
            "payload": {"status": "error", "response": {"reason": "unauthorized"}}}"#;
        assert_eq!(parse_frame(rejected), Frame::JoinFailed("unauthorized".to_string()));

        let heartbeat_reply = r#"{"event": "phx_reply", "ref": "7", "payload": {"status": "error"}}"#;
        assert_eq!(parse_frame(heartbeat_reply), Frame::Other);
    }

    #[test]
    fn test_irrelevant_frames_are_ignored() {
        assert_eq!(parse_frame("not json"), Frame::Other);
        assert_eq!(parse_frame(r#"{"event": "presence_state"}"#), Frame::Other);
        assert_eq!(
            parse_frame(r#"{"event": "postgres_changes", "payload": {"data": {"table": "other", "type": "INSERT", "record": {}}}}"#),
            Frame::Other
        );
    }
}
