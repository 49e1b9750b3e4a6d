//! In-memory table of known executions, the single source of truth for readers.
//!
//! Only the reconciliation engine writes; everything else holds a cloned
//! handle and reads or subscribes to change notifications.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::execution::{ExecutionId, ExecutionRecord, ExecutionStatus};

const EVENT_CAPACITY: usize = 256;

/// Result of merging one record into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
    /// The incoming record carried older information and was ignored.
    Rejected,
}

impl UpsertOutcome {
    pub fn changed(self) -> bool {
        matches!(self, Self::Inserted | Self::Updated)
    }
}

/// How an upsert treats the incoming log text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogMerge {
    /// List payloads carry no logs: empty text keeps what is known.
    KeepIfEmpty,
    /// Detail snapshots are authoritative, even when empty.
    Replace,
}

/// Notification sent after every upsert that changed observable state.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEvent {
    pub id: ExecutionId,
    pub previous: Option<ExecutionStatus>,
    pub status: ExecutionStatus,
}

impl StoreEvent {
    pub fn is_transition(&self) -> bool {
        self.previous.is_some_and(|p| p != self.status)
    }
}

#[derive(Clone)]
pub struct ExecutionStore {
    records: Arc<RwLock<HashMap<ExecutionId, ExecutionRecord>>>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for ExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    pub fn get(&self, id: ExecutionId) -> Option<ExecutionRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    pub fn status_of(&self, id: ExecutionId) -> Option<ExecutionStatus> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .map(|r| r.status)
    }

    /// Snapshot of every record, most recently started first.
    pub fn list(&self) -> Vec<ExecutionRecord> {
        let mut all: Vec<ExecutionRecord> = self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        all
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receive a [`StoreEvent`] for each change from now on.
    ///
    /// A receiver that falls more than a few hundred events behind observes
    /// `RecvError::Lagged` and should re-read [`list`](Self::list).
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Merge a record from a list page or a full-record fetch.
    ///
    /// Status only moves forward and never leaves a terminal state; an incoming
    /// record with an older status is rejected outright. Identity fields
    /// (`project_id`, `started_at`, `input_parameters`) keep their first
    /// observed value and `finished_at` is set once. Empty incoming logs keep
    /// the known text; anything else replaces it.
    pub(crate) fn upsert(&self, incoming: ExecutionRecord) -> UpsertOutcome {
        self.upsert_with(incoming, LogMerge::KeepIfEmpty)
    }

    /// Merge a record built from a detail snapshot; its logs always win.
    pub(crate) fn upsert_detail(&self, incoming: ExecutionRecord) -> UpsertOutcome {
        self.upsert_with(incoming, LogMerge::Replace)
    }

    fn upsert_with(&self, incoming: ExecutionRecord, logs: LogMerge) -> UpsertOutcome {
        let now = Utc::now();
        let id = incoming.id;

        let (outcome, event) = {
            let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
            match records.get_mut(&id) {
                None => {
                    let mut rec = incoming;
                    rec.normalize(now);
                    let event = StoreEvent {
                        id,
                        previous: None,
                        status: rec.status,
                    };
                    records.insert(id, rec);
                    (UpsertOutcome::Inserted, Some(event))
                }
                Some(existing) => {
                    if !existing.status.can_advance_to(incoming.status) {
                        debug!(
                            execution_id = %id,
                            known = %existing.status,
                            incoming = %incoming.status,
                            "ignoring stale execution state"
                        );
                        (UpsertOutcome::Rejected, None)
                    } else {
                        let merged = merge(existing, incoming, logs, now);
                        if merged == *existing {
                            (UpsertOutcome::Unchanged, None)
                        } else {
                            let event = StoreEvent {
                                id,
                                previous: Some(existing.status),
                                status: merged.status,
                            };
                            *existing = merged;
                            (UpsertOutcome::Updated, Some(event))
                        }
                    }
                }
            }
        };

        if let Some(event) = event {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
        outcome
    }
}

fn merge(
    existing: &ExecutionRecord,
    incoming: ExecutionRecord,
    log_merge: LogMerge,
    now: chrono::DateTime<Utc>,
) -> ExecutionRecord {
    let input_parameters = if is_blank(&existing.input_parameters) {
        incoming.input_parameters
    } else {
        existing.input_parameters.clone()
    };
    let logs = if incoming.logs.is_empty() && log_merge == LogMerge::KeepIfEmpty {
        existing.logs.clone()
    } else {
        incoming.logs
    };

    let mut merged = ExecutionRecord {
        id: existing.id,
        project_id: existing.project_id,
        status: incoming.status,
        started_at: existing.started_at,
        finished_at: existing.finished_at.or(incoming.finished_at),
        input_parameters,
        result: incoming.result.or_else(|| existing.result.clone()),
        logs,
    };
    merged.normalize(now);
    merged
}

fn is_blank(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}
