//! Entry point for presentation layers: one monitor wires the store, the
//! reconciliation engine, the scheduler and cancellation around an injected
//! gateway.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::cancel::CancellationController;
use crate::config::{MonitorConfig, PollingConfig};
use crate::execution::{ExecutionError, ExecutionId, ExecutionRecord, ProjectId};
use crate::gateway::{CredentialProvider, HttpGateway, RemoteExecutionGateway, StaticCredential};
use crate::reconcile::{DetailOutcome, ReconciliationEngine};
use crate::scheduler::{DetailEvent, DetailWatch, PollHandle, PollingScheduler};
use crate::store::ExecutionStore;

pub struct ExecutionMonitor {
    store: ExecutionStore,
    engine: Arc<ReconciliationEngine>,
    scheduler: Arc<PollingScheduler>,
    cancellation: CancellationController,
    polling: PollingConfig,
}

impl ExecutionMonitor {
    pub fn new(gateway: Arc<dyn RemoteExecutionGateway>, polling: PollingConfig) -> Self {
        let store = ExecutionStore::new();
        let engine = Arc::new(ReconciliationEngine::new(store.clone(), gateway));
        let scheduler = Arc::new(PollingScheduler::new(engine.clone()));
        let cancellation = CancellationController::new(scheduler.clone());
        Self {
            store,
            engine,
            scheduler,
            cancellation,
            polling,
        }
    }

    /// Build a monitor talking HTTP to the configured backend.
    pub fn from_config(cfg: &MonitorConfig) -> Result<Self> {
        let credentials: Arc<dyn CredentialProvider> = Arc::new(StaticCredential::acquire(
            cfg.auth.token.as_deref(),
            &cfg.auth.token_env,
        ));
        let gateway = HttpGateway::new(
            &cfg.backend.base_url,
            cfg.backend.request_timeout(),
            cfg.backend.list_limit,
            credentials,
        )?;
        info!(base_url = %cfg.backend.base_url, "monitor configured");
        Ok(Self::new(Arc::new(gateway), cfg.polling.clone()))
    }

    /// Read-only view shared with every reader.
    pub fn store(&self) -> &ExecutionStore {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<PollingScheduler> {
        &self.scheduler
    }

    /// Manual list refresh. Unlike a background tick, errors are returned.
    pub async fn refresh(&self) -> Result<usize, ExecutionError> {
        self.engine.refresh_list().await
    }

    /// One-shot detail refresh of `id`.
    pub async fn refresh_execution(&self, id: ExecutionId) -> Result<DetailOutcome, ExecutionError> {
        self.engine.refresh_detail(id).await
    }

    /// Start a new execution and record it.
    pub async fn launch(
        &self,
        project: ProjectId,
        input_parameters: serde_json::Value,
    ) -> Result<ExecutionRecord, ExecutionError> {
        let record = self
            .engine
            .gateway()
            .launch_execution(project, input_parameters)
            .await?;
        self.engine.merge_launched(record.clone());
        Ok(self.store.get(record.id).unwrap_or(record))
    }

    pub async fn cancel(&self, id: ExecutionId) -> Result<(), ExecutionError> {
        self.cancellation.cancel(id).await
    }

    /// Open the list scope at the configured cadence.
    #[must_use = "dropping the handle stops the timer"]
    pub fn watch_list(&self) -> PollHandle {
        self.scheduler.start_list_polling(self.polling.list_interval())
    }

    /// Open a detail scope on `id` at the configured cadence.
    #[must_use = "dropping the watch stops the timer"]
    pub fn watch_execution(&self, id: ExecutionId) -> ExecutionWatch {
        ExecutionWatch {
            inner: self
                .scheduler
                .start_detail_polling(id, self.polling.detail_interval()),
            stop_on_terminal: self.polling.stop_detail_on_terminal,
        }
    }

    /// Stop every open scope and wait for in-flight ticks.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}

/// Detail scope that can close itself once the execution is terminal.
#[derive(Debug)]
pub struct ExecutionWatch {
    inner: DetailWatch,
    stop_on_terminal: bool,
}

impl ExecutionWatch {
    pub fn handle(&self) -> &PollHandle {
        self.inner.handle()
    }

    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Next report from the detail timer; `None` once the timer has stopped.
    pub async fn next(&mut self) -> Option<DetailEvent> {
        let event = self.inner.next().await?;
        if let DetailEvent::Merged(outcome) = &event {
            if outcome.is_done() && self.stop_on_terminal {
                info!(execution_id = %outcome.id, status = %outcome.status, "execution finished, closing detail scope");
                self.inner.stop();
            }
        }
        Some(event)
    }
}
