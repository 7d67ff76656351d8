//! In-memory `RemoteClient` for engine and manager tests

use super::api::{ChangeStream, RemoteChange, RemoteClient, SyncApiError};
use super::models::{row_str, EntityKind};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    SelectByIds(EntityKind, usize),
    DeleteByIds(EntityKind, Vec<String>),
    UpsertRows(EntityKind, usize),
    SelectSince(EntityKind, Option<String>, Option<String>),
    Subscribe(String),
    DeleteOwned(EntityKind),
}

impl Call {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::SelectByIds(..) => "select_by_ids",
            Self::DeleteByIds(..) => "delete_by_ids",
            Self::UpsertRows(..) => "upsert_rows",
            Self::SelectSince(..) => "select_since",
            Self::Subscribe(_) => "subscribe",
            Self::DeleteOwned(_) => "delete_owned",
        }
    }
}

/// Holds the next `upsert_rows` call until released
#[derive(Clone)]
pub(crate) struct UpsertGate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl UpsertGate {
    pub(crate) async fn entered(&self) {
        self.entered.notified().await;
    }

    pub(crate) fn release(&self) {
        self.release.notify_one();
    }
}

#[derive(Default)]
pub(crate) struct FakeRemote {
    tables: Mutex<HashMap<EntityKind, BTreeMap<String, Value>>>,
    calls: Mutex<Vec<(Instant, Call)>>,
    failing: AtomicBool,
    gate: Mutex<Option<UpsertGate>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Result<RemoteChange, SyncApiError>>>>,
}

impl FakeRemote {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, call: Call) -> Result<(), SyncApiError> {
        self.calls.lock().unwrap().push((Instant::now(), call));
        if self.failing.load(Ordering::SeqCst) {
            Err(SyncApiError::NetworkError("simulated outage".to_string()))
        } else {
            Ok(())
        }
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn insert_row(&self, kind: EntityKind, row: Value) {
        let id = row_str(&row, kind.id_column()).expect("row without key");
        self.tables.lock().unwrap().entry(kind).or_default().insert(id, row);
    }

    pub(crate) fn row(&self, kind: EntityKind, id: &str) -> Option<Value> {
        self.tables.lock().unwrap().get(&kind)?.get(id).cloned()
    }

    pub(crate) fn rows(&self, kind: EntityKind) -> Vec<Value> {
        self.tables
            .lock()
            .unwrap()
            .get(&kind)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().iter().map(|(_, c)| c.clone()).collect()
    }

    /// When each call named `name` was made
    pub(crate) fn call_times(&self, name: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c)| c.name() == name)
            .map(|(at, _)| *at)
            .collect()
    }

    pub(crate) fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub(crate) fn hold_upserts(&self) -> UpsertGate {
        let gate = UpsertGate {
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        };
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Deliver a change to every open subscription
    pub(crate) fn push_change(&self, change: RemoteChange) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.unbounded_send(Ok(change.clone())).is_ok());
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().iter().filter(|tx| !tx.is_closed()).count()
    }
}

#[async_trait]
impl RemoteClient for FakeRemote {
    async fn select_by_ids(
        &self,
        kind: EntityKind,
        _user_id: &str,
        ids: &[String],
    ) -> Result<Vec<Value>, SyncApiError> {
        self.record(Call::SelectByIds(kind, ids.len()))?;
        Ok(ids.iter().filter_map(|id| self.row(kind, id)).collect())
    }

    async fn delete_by_ids(
        &self,
        kind: EntityKind,
        _user_id: &str,
        ids: &[String],
    ) -> Result<(), SyncApiError> {
        self.record(Call::DeleteByIds(kind, ids.to_vec()))?;
        if let Some(table) = self.tables.lock().unwrap().get_mut(&kind) {
            for id in ids {
                table.remove(id);
            }
        }
        Ok(())
    }

    async fn upsert_rows(&self, kind: EntityKind, rows: &[Value]) -> Result<(), SyncApiError> {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        self.record(Call::UpsertRows(kind, rows.len()))?;
        for row in rows {
            self.insert_row(kind, row.clone());
        }
        Ok(())
    }

    async fn select_since(
        &self,
        kind: EntityKind,
        _user_id: &str,
        scope: Option<&str>,
        since: Option<&str>,
    ) -> Result<Vec<Value>, SyncApiError> {
        self.record(Call::SelectSince(
            kind,
            scope.map(str::to_string),
            since.map(str::to_string),
        ))?;

        let mut rows: Vec<Value> = self
            .rows(kind)
            .into_iter()
            .filter(|row| match (kind.scope_column(), scope) {
                (Some(column), Some(scope)) => row_str(row, column).as_deref() == Some(scope),
                _ => true,
            })
            .filter(|row| match since {
                Some(since) => row_str(row, "updated_at").map_or(false, |u| u.as_str() > since),
                None => true,
            })
            .collect();
        rows.sort_by_key(|row| row_str(row, "updated_at"));
        Ok(rows)
    }

    async fn subscribe(&self, user_id: &str) -> Result<ChangeStream, SyncApiError> {
        self.record(Call::Subscribe(user_id.to_string()))?;
        let (tx, rx) = mpsc::unbounded();
        self.subscribers.lock().unwrap().push(tx);
        Ok(rx.boxed())
    }

    async fn delete_owned(&self, kind: EntityKind, _user_id: &str) -> Result<(), SyncApiError> {
        self.record(Call::DeleteOwned(kind))?;
        self.tables
            .lock()
            .unwrap()
            .retain(|other, _| other.table() != kind.table());
        Ok(())
    }
}
