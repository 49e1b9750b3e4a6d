//! End-to-end monitoring scenarios against a scripted in-process backend.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use devflow_monitor::config::PollingConfig;
use devflow_monitor::gateway::RemoteExecutionGateway;
use devflow_monitor::scheduler::{DetailEvent, PollTarget};
use devflow_monitor::{
    ExecutionError, ExecutionId, ExecutionMonitor, ExecutionRecord, ExecutionStatus, LogSnapshot,
    ProjectId,
};

/// Backend double: a fixed list page, a queue of detail responses, and
/// per-operation call counters.
#[derive(Default)]
struct ScriptedGateway {
    list: Mutex<Vec<ExecutionRecord>>,
    /// Fetchable by id but past the list page.
    detached: Mutex<Vec<ExecutionRecord>>,
    details: Mutex<VecDeque<Result<LogSnapshot, ExecutionError>>>,
    /// Returned once the detail queue is empty.
    steady_detail: Mutex<Option<LogSnapshot>>,
    cancelled: AtomicBool,
    list_calls: AtomicU64,
    detail_calls: AtomicU64,
    cancel_calls: AtomicU64,
}

impl ScriptedGateway {
    fn lists(&self) -> u64 {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteExecutionGateway for ScriptedGateway {
    async fn list_executions(&self) -> Result<Vec<ExecutionRecord>, ExecutionError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.list.lock().unwrap().clone())
    }

    async fn fetch_execution(&self, id: ExecutionId) -> Result<ExecutionRecord, ExecutionError> {
        let list = self.list.lock().unwrap();
        let detached = self.detached.lock().unwrap();
        list.iter()
            .chain(detached.iter())
            .find(|r| r.id == id)
            .cloned()
            .ok_or(ExecutionError::NotFound(id))
    }

    async fn fetch_logs(&self, id: ExecutionId) -> Result<LogSnapshot, ExecutionError> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(next) = self.details.lock().unwrap().pop_front() {
            return next;
        }
        if self.cancelled.load(Ordering::SeqCst) {
            return Ok(snapshot(ExecutionStatus::Cancelled, "start\ncancelled by user\n", None));
        }
        self.steady_detail
            .lock()
            .unwrap()
            .clone()
            .ok_or(ExecutionError::NotFound(id))
    }

    async fn cancel_execution(&self, _id: ExecutionId) -> Result<(), ExecutionError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        self.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn launch_execution(
        &self,
        project: ProjectId,
        input_parameters: serde_json::Value,
    ) -> Result<ExecutionRecord, ExecutionError> {
        let mut rec = record(50, ExecutionStatus::Pending);
        rec.project_id = project;
        rec.input_parameters = input_parameters;
        Ok(rec)
    }
}

fn record(id: i64, status: ExecutionStatus) -> ExecutionRecord {
    let started = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
    let mut rec = ExecutionRecord::new(ExecutionId(id), ProjectId(7), started);
    rec.status = status;
    rec
}

fn snapshot(status: ExecutionStatus, logs: &str, result: Option<serde_json::Value>) -> LogSnapshot {
    LogSnapshot {
        status,
        logs: logs.to_string(),
        result,
        finished_at: None,
    }
}

fn monitor(gw: Arc<ScriptedGateway>) -> ExecutionMonitor {
    ExecutionMonitor::new(gw, PollingConfig::default())
}

#[tokio::test(start_paused = true)]
async fn test_scenario_pending_running_success() {
    let gw = Arc::new(ScriptedGateway::default());
    *gw.list.lock().unwrap() = vec![record(1, ExecutionStatus::Pending)];
    gw.details.lock().unwrap().extend([
        Ok(snapshot(ExecutionStatus::Running, "start\n", None)),
        Ok(snapshot(
            ExecutionStatus::Success,
            "start\ndone\n",
            Some(serde_json::json!({"ok": true})),
        )),
    ]);
    let monitor = monitor(gw.clone());

    monitor.refresh().await.unwrap();
    assert_eq!(monitor.store().status_of(ExecutionId(1)), Some(ExecutionStatus::Pending));

    let mut scope = monitor.watch_execution(ExecutionId(1));
    let mut transitions = Vec::new();
    while let Some(event) = scope.next().await {
        match event {
            DetailEvent::Merged(outcome) => {
                if outcome.transitioned {
                    transitions.push((outcome.previous, outcome.status));
                }
            }
            DetailEvent::Failed(e) => panic!("unexpected failure: {e}"),
        }
    }

    assert_eq!(
        transitions,
        vec![
            (Some(ExecutionStatus::Pending), ExecutionStatus::Running),
            (Some(ExecutionStatus::Running), ExecutionStatus::Success),
        ]
    );
    // one manual refresh plus one resync per transition
    assert_eq!(gw.lists(), 3);
    assert_eq!(monitor.scheduler().engine().list_resyncs(), 2);

    let rec = monitor.store().get(ExecutionId(1)).unwrap();
    assert_eq!(rec.status, ExecutionStatus::Success);
    assert!(rec.finished_at.is_some());
    assert_eq!(rec.result, Some(serde_json::json!({"ok": true})));
    assert_eq!(rec.logs, "start\ndone\n");

    // the scope closed itself on the terminal status
    assert!(scope.handle().is_stopped());
    assert_eq!(monitor.scheduler().active_timers(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_scenario_cancel_waits_for_backend() {
    let gw = Arc::new(ScriptedGateway::default());
    *gw.list.lock().unwrap() = vec![record(1, ExecutionStatus::Running)];
    *gw.steady_detail.lock().unwrap() = Some(snapshot(ExecutionStatus::Running, "start\n", None));
    let monitor = monitor(gw.clone());
    monitor.refresh().await.unwrap();

    let mut scope = monitor.watch_execution(ExecutionId(1));
    assert!(matches!(scope.next().await, Some(DetailEvent::Merged(o)) if !o.transitioned));

    let mut changes = monitor.store().subscribe();
    monitor.cancel(ExecutionId(1)).await.unwrap();
    assert_eq!(gw.cancel_calls.load(Ordering::SeqCst), 1);

    // acknowledged, but nothing was written locally yet
    assert_eq!(monitor.store().status_of(ExecutionId(1)), Some(ExecutionStatus::Running));
    assert!(changes.try_recv().is_err());

    // the nudged detail timer picks up the authoritative state right away
    let before = tokio::time::Instant::now();
    match scope.next().await {
        Some(DetailEvent::Merged(outcome)) => {
            assert!(outcome.transitioned);
            assert_eq!(outcome.status, ExecutionStatus::Cancelled);
        }
        other => panic!("expected merged cancellation, got {other:?}"),
    }
    assert!(before.elapsed() < Duration::from_secs(3));

    let first_change = changes.recv().await.unwrap();
    assert_eq!(first_change.previous, Some(ExecutionStatus::Running));
    assert_eq!(first_change.status, ExecutionStatus::Cancelled);

    let rec = monitor.store().get(ExecutionId(1)).unwrap();
    assert_eq!(rec.status, ExecutionStatus::Cancelled);
    assert!(rec.finished_at.is_some());
}

#[tokio::test]
async fn test_cancel_terminal_makes_no_network_call() {
    let gw = Arc::new(ScriptedGateway::default());
    *gw.list.lock().unwrap() = vec![record(1, ExecutionStatus::Success)];
    let monitor = monitor(gw.clone());
    monitor.refresh().await.unwrap();
    let calls_before = gw.lists() + gw.detail_calls.load(Ordering::SeqCst);

    let err = monitor.cancel(ExecutionId(1)).await.unwrap_err();
    assert!(matches!(err, ExecutionError::InvalidState { .. }));
    assert_eq!(gw.cancel_calls.load(Ordering::SeqCst), 0);
    assert_eq!(gw.lists() + gw.detail_calls.load(Ordering::SeqCst), calls_before);
}

#[tokio::test(start_paused = true)]
async fn test_scenario_unknown_id_reported_list_unaffected() {
    let gw = Arc::new(ScriptedGateway::default());
    *gw.list.lock().unwrap() = vec![record(1, ExecutionStatus::Running)];
    let monitor = monitor(gw.clone());

    let _list = monitor.watch_list();
    let mut scope = monitor.watch_execution(ExecutionId(99));

    match scope.next().await {
        Some(DetailEvent::Failed(ExecutionError::NotFound(id))) => assert_eq!(id, ExecutionId(99)),
        other => panic!("expected not-found, got {other:?}"),
    }
    scope.stop();

    let lists_before = gw.lists();
    tokio::time::sleep(Duration::from_millis(10_100)).await;
    assert!(gw.lists() >= lists_before + 2);
    assert!(monitor.scheduler().is_polling(PollTarget::List));
    assert_eq!(monitor.store().status_of(ExecutionId(1)), Some(ExecutionStatus::Running));
}

#[tokio::test]
async fn test_launch_is_first_observation() {
    let gw = Arc::new(ScriptedGateway::default());
    let monitor = monitor(gw);

    let rec = monitor
        .launch(ProjectId(3), serde_json::json!({"prompt": "fix the build"}))
        .await
        .unwrap();
    assert_eq!(rec.project_id, ProjectId(3));

    let stored = monitor.store().get(ExecutionId(50)).unwrap();
    assert_eq!(stored.status, ExecutionStatus::Pending);
    assert_eq!(stored.input_parameters, serde_json::json!({"prompt": "fix the build"}));
}

#[tokio::test(start_paused = true)]
async fn test_watch_execution_past_the_list_page() {
    let gw = Arc::new(ScriptedGateway::default());
    *gw.list.lock().unwrap() = vec![record(1, ExecutionStatus::Running)];
    *gw.detached.lock().unwrap() = vec![record(500, ExecutionStatus::Running)];
    *gw.steady_detail.lock().unwrap() = Some(snapshot(ExecutionStatus::Running, "step 1\n", None));
    let monitor = monitor(gw.clone());

    let mut scope = monitor.watch_execution(ExecutionId(500));
    let mut transitions = 0;
    for _ in 0..5 {
        match scope.next().await {
            Some(DetailEvent::Merged(outcome)) if outcome.transitioned => transitions += 1,
            Some(DetailEvent::Merged(_)) => {}
            other => panic!("unexpected detail event: {other:?}"),
        }
    }
    scope.stop();

    // only the first observation counts, and it resyncs the list once
    assert_eq!(transitions, 1);
    assert_eq!(gw.lists(), 1);
    assert_eq!(monitor.scheduler().engine().list_resyncs(), 1);

    let stored = monitor.store().get(ExecutionId(500)).unwrap();
    assert_eq!(stored.status, ExecutionStatus::Running);
    assert_eq!(stored.logs, "step 1\n");
}
