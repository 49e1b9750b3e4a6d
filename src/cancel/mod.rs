//! User-initiated cancellation.
//!
//! The backend stays authoritative on the final state: a cancel request may
//! race with natural completion, so nothing is written locally. After the
//! acknowledgement the affected timers are nudged (or a one-shot refresh is
//! run) so the real outcome shows up without waiting a full interval.

use std::sync::Arc;

use tracing::{info, warn};

use crate::execution::{ExecutionError, ExecutionId};
use crate::scheduler::{PollTarget, PollingScheduler};

pub struct CancellationController {
    scheduler: Arc<PollingScheduler>,
}

impl CancellationController {
    pub fn new(scheduler: Arc<PollingScheduler>) -> Self {
        Self { scheduler }
    }

    /// Request cancellation of `id`.
    ///
    /// Fails fast, without any network call, unless the locally known status is
    /// `pending` or `running`. Remote failures are returned as-is and never
    /// retried.
    pub async fn cancel(&self, id: ExecutionId) -> Result<(), ExecutionError> {
        let engine = self.scheduler.engine();

        let status = engine
            .store()
            .status_of(id)
            .ok_or(ExecutionError::NotFound(id))?;
        if status.is_terminal() {
            return Err(ExecutionError::InvalidState {
                id,
                message: format!("already {status}"),
            });
        }

        info!(execution_id = %id, %status, "requesting cancellation");
        engine.gateway().cancel_execution(id).await?;

        if !self.scheduler.poll_now(PollTarget::Detail(id)) {
            // No detail scope is open; fetch the authoritative state once.
            match engine.refresh_detail(id).await {
                Ok(outcome) => info!(execution_id = %id, status = %outcome.status, "post-cancel refresh"),
                Err(e) => warn!(execution_id = %id, error = %e, "post-cancel refresh failed"),
            }
        }
        self.scheduler.poll_now(PollTarget::List);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ExecutionRecord, ExecutionStatus, LogSnapshot, ProjectId};
    use crate::gateway::RemoteExecutionGateway;
    use crate::reconcile::ReconciliationEngine;
    use crate::store::ExecutionStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    struct Recording {
        initial: ExecutionStatus,
        cancel_result: Mutex<Result<(), ExecutionError>>,
        calls: AtomicU64,
        cancels: AtomicU64,
    }

    impl Recording {
        fn new(initial: ExecutionStatus) -> Arc<Self> {
            Arc::new(Self {
                initial,
                cancel_result: Mutex::new(Ok(())),
                calls: AtomicU64::new(0),
                cancels: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl RemoteExecutionGateway for Recording {
        async fn list_executions(&self) -> Result<Vec<ExecutionRecord>, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut rec = ExecutionRecord::new(ExecutionId(1), ProjectId(1), Utc::now());
            rec.status = self.initial;
            Ok(vec![rec])
        }

        async fn fetch_execution(&self, id: ExecutionId) -> Result<ExecutionRecord, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ExecutionError::NotFound(id))
        }

        async fn fetch_logs(&self, _id: ExecutionId) -> Result<LogSnapshot, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(LogSnapshot {
                status: ExecutionStatus::Cancelled,
                logs: "cancelled by user\n".into(),
                result: None,
                finished_at: None,
            })
        }

        async fn cancel_execution(&self, _id: ExecutionId) -> Result<(), ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.cancels.fetch_add(1, Ordering::SeqCst);
            self.cancel_result.lock().unwrap().clone()
        }

        async fn launch_execution(
            &self,
            project: ProjectId,
            _input: serde_json::Value,
        ) -> Result<ExecutionRecord, ExecutionError> {
            Err(ExecutionError::ProjectNotFound(project))
        }
    }

    async fn controller(gw: Arc<Recording>) -> CancellationController {
        let engine = Arc::new(ReconciliationEngine::new(ExecutionStore::new(), gw));
        engine.refresh_list().await.unwrap();
        CancellationController::new(Arc::new(PollingScheduler::new(engine)))
    }

    #[tokio::test]
    async fn test_terminal_fails_fast_without_network() {
        let gw = Recording::new(ExecutionStatus::Success);
        let ctl = controller(gw.clone()).await;
        let before = gw.calls.load(Ordering::SeqCst);

        let err = ctl.cancel(ExecutionId(1)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidState { .. }));
        assert_eq!(gw.calls.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn test_unknown_id_fails_fast() {
        let gw = Recording::new(ExecutionStatus::Running);
        let ctl = controller(gw.clone()).await;

        let err = ctl.cancel(ExecutionId(77)).await.unwrap_err();
        assert_eq!(err, ExecutionError::NotFound(ExecutionId(77)));
        assert_eq!(gw.cancels.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remote_failure_is_surfaced_and_state_untouched() {
        let gw = Recording::new(ExecutionStatus::Running);
        *gw.cancel_result.lock().unwrap() = Err(ExecutionError::InvalidState {
            id: ExecutionId(1),
            message: "cannot be cancelled".into(),
        });
        let ctl = controller(gw.clone()).await;

        let err = ctl.cancel(ExecutionId(1)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidState { .. }));
        assert_eq!(gw.cancels.load(Ordering::SeqCst), 1);

        let store = ctl.scheduler.engine().store();
        assert_eq!(store.status_of(ExecutionId(1)), Some(ExecutionStatus::Running));
    }

    #[tokio::test]
    async fn test_ack_refreshes_from_backend() {
        let gw = Recording::new(ExecutionStatus::Running);
        let ctl = controller(gw.clone()).await;

        ctl.cancel(ExecutionId(1)).await.unwrap();

        let rec = ctl.scheduler.engine().store().get(ExecutionId(1)).unwrap();
        assert_eq!(rec.status, ExecutionStatus::Cancelled);
        assert!(rec.finished_at.is_some());
        assert_eq!(rec.logs, "cancelled by user\n");
    }
}
