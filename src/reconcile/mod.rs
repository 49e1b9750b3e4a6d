//! Merges remote snapshots into the store and detects status transitions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::execution::{ExecutionError, ExecutionId, ExecutionRecord, ExecutionStatus, LogSnapshot};
use crate::gateway::RemoteExecutionGateway;
use crate::store::{ExecutionStore, UpsertOutcome};

/// What a detail merge observed.
#[derive(Debug, Clone, PartialEq)]
pub struct DetailOutcome {
    pub id: ExecutionId,
    /// Status known before the merge; `None` on first observation.
    pub previous: Option<ExecutionStatus>,
    /// Status known after the merge.
    pub status: ExecutionStatus,
    pub transitioned: bool,
    pub list_resynced: bool,
}

impl DetailOutcome {
    /// The watched execution reached a terminal state; its detail timer can stop.
    pub fn is_done(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Sole writer of the [`ExecutionStore`].
pub struct ReconciliationEngine {
    store: ExecutionStore,
    gateway: Arc<dyn RemoteExecutionGateway>,
    resyncs: AtomicU64,
}

impl ReconciliationEngine {
    pub fn new(store: ExecutionStore, gateway: Arc<dyn RemoteExecutionGateway>) -> Self {
        Self {
            store,
            gateway,
            resyncs: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &ExecutionStore {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<dyn RemoteExecutionGateway> {
        &self.gateway
    }

    /// Number of out-of-band list refreshes triggered by detail transitions.
    pub fn list_resyncs(&self) -> u64 {
        self.resyncs.load(Ordering::Relaxed)
    }

    /// Merge a list page. Returns how many records changed.
    pub fn merge_list(&self, records: Vec<ExecutionRecord>) -> usize {
        records
            .into_iter()
            .map(|r| self.store.upsert(r))
            .filter(|o| o.changed())
            .count()
    }

    /// Merge the record returned by a launch: its first observation.
    pub fn merge_launched(&self, record: ExecutionRecord) -> UpsertOutcome {
        info!(execution_id = %record.id, project_id = %record.project_id, "execution launched");
        self.store.upsert(record)
    }

    /// Merge one detail snapshot for `id`.
    ///
    /// A status change (including first observation) forces exactly one list
    /// refresh so list readers do not wait for the slower list timer. Logs
    /// are replaced wholesale either way.
    ///
    /// Detail payloads carry no identity fields, so an id the store has not
    /// seen yet is loaded with [`RemoteExecutionGateway::fetch_execution`]
    /// first. If that fails the snapshot is dropped and the next tick retries
    /// without touching the list.
    pub async fn merge_detail(&self, id: ExecutionId, snapshot: LogSnapshot) -> DetailOutcome {
        let previous = self.store.status_of(id);

        let transitioned = match previous {
            Some(prev) => {
                let outcome = self.apply_snapshot(id, &snapshot);
                outcome == UpsertOutcome::Updated && prev != snapshot.status
            }
            None => match self.gateway.fetch_execution(id).await {
                Ok(record) => {
                    self.store.upsert(record);
                    if self.apply_snapshot(id, &snapshot) == UpsertOutcome::Rejected {
                        debug!(execution_id = %id, "detail snapshot older than fetched record");
                    }
                    self.store.status_of(id).is_some()
                }
                Err(e) => {
                    warn!(execution_id = %id, error = %e, "could not load execution record");
                    false
                }
            },
        };

        let mut list_resynced = false;
        if transitioned {
            info!(
                execution_id = %id,
                from = ?previous.map(|s| s.as_str()),
                to = %snapshot.status,
                "execution status changed, resynchronizing list"
            );
            self.resyncs.fetch_add(1, Ordering::Relaxed);
            list_resynced = true;
            if let Err(e) = self.refresh_list().await {
                warn!(execution_id = %id, error = %e, "list resync after transition failed");
            }
        }

        DetailOutcome {
            id,
            previous,
            status: self.store.status_of(id).unwrap_or(snapshot.status),
            transitioned,
            list_resynced,
        }
    }

    /// Fetch the list and merge it.
    pub async fn refresh_list(&self) -> Result<usize, ExecutionError> {
        let records = self.gateway.list_executions().await?;
        let total = records.len();
        let changed = self.merge_list(records);
        debug!(total, changed, "list merged");
        Ok(changed)
    }

    /// Fetch the detail of `id` and merge it.
    pub async fn refresh_detail(&self, id: ExecutionId) -> Result<DetailOutcome, ExecutionError> {
        let snapshot = self.gateway.fetch_logs(id).await?;
        Ok(self.merge_detail(id, snapshot).await)
    }

    fn apply_snapshot(&self, id: ExecutionId, snapshot: &LogSnapshot) -> UpsertOutcome {
        let Some(mut rec) = self.store.get(id) else {
            return UpsertOutcome::Rejected;
        };
        rec.status = snapshot.status;
        rec.logs = snapshot.logs.clone();
        if snapshot.result.is_some() {
            rec.result = snapshot.result.clone();
        }
        if snapshot.finished_at.is_some() {
            rec.finished_at = snapshot.finished_at;
        }
        self.store.upsert_detail(rec)
    }
}
