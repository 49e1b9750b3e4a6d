//! Periodic list and detail polling with scope-owned, cancellable timers.
//!
//! Each `start_*` call spawns one timer task and returns a [`PollHandle`].
//! The handle is the timer's lifetime: stopping it (or dropping it when the
//! owning scope closes) cancels the timer before its next tick. A tick that
//! is already running completes and its result is still merged.

mod engine;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::execution::{ExecutionError, ExecutionId};
use crate::reconcile::{DetailOutcome, ReconciliationEngine};

pub const DEFAULT_LIST_INTERVAL: Duration = Duration::from_millis(5000);
pub const DEFAULT_DETAIL_INTERVAL: Duration = Duration::from_millis(3000);

/// Shortest accepted period; shorter requests are raised to it.
pub const MIN_INTERVAL: Duration = Duration::from_millis(100);

const DETAIL_EVENT_BUFFER: usize = 16;

/// What a timer polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollTarget {
    List,
    Detail(ExecutionId),
}

/// Reported by a detail timer to the scope that started it.
#[derive(Debug, Clone, PartialEq)]
pub enum DetailEvent {
    Merged(DetailOutcome),
    /// A non-transient failure, e.g. the backend no longer knows the id.
    Failed(ExecutionError),
}

#[derive(Debug)]
struct Timer {
    target: PollTarget,
    token: CancellationToken,
    nudge: Arc<Notify>,
}

type Registry = Arc<Mutex<HashMap<u64, Timer>>>;

pub struct PollingScheduler {
    engine: Arc<ReconciliationEngine>,
    timers: Registry,
    tracker: TaskTracker,
    next_id: AtomicU64,
}

impl PollingScheduler {
    pub fn new(engine: Arc<ReconciliationEngine>) -> Self {
        Self {
            engine,
            timers: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn engine(&self) -> &Arc<ReconciliationEngine> {
        &self.engine
    }

    /// Poll the execution list every `period`, starting now.
    #[must_use = "dropping the handle stops the timer"]
    pub fn start_list_polling(&self, period: Duration) -> PollHandle {
        let period = clamp_period(PollTarget::List, period);
        let (handle, nudge, token) = self.register(PollTarget::List);
        self.tracker.spawn(engine::run_list_loop(
            self.engine.clone(),
            period,
            nudge,
            token,
        ));
        handle
    }

    /// Poll the logs of one execution every `period`, starting now.
    ///
    /// The scheduler never looks at the status it fetches: the returned
    /// watch yields each [`DetailOutcome`] and the owner decides when to stop.
    #[must_use = "dropping the watch stops the timer"]
    pub fn start_detail_polling(&self, id: ExecutionId, period: Duration) -> DetailWatch {
        let period = clamp_period(PollTarget::Detail(id), period);
        let (handle, nudge, token) = self.register(PollTarget::Detail(id));
        let (tx, rx) = mpsc::channel(DETAIL_EVENT_BUFFER);
        self.tracker.spawn(engine::run_detail_loop(
            self.engine.clone(),
            id,
            period,
            nudge,
            token,
            tx,
        ));
        DetailWatch { handle, events: rx }
    }

    /// Stop the timer behind `handle`. Stopping twice is a no-op.
    pub fn stop(&self, handle: &PollHandle) {
        handle.stop();
    }

    /// Make every active timer for `target` tick now instead of waiting out
    /// its period. Returns `false` when no such timer is running.
    pub fn poll_now(&self, target: PollTarget) -> bool {
        let timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        let mut nudged = false;
        for timer in timers.values().filter(|t| t.target == target) {
            timer.nudge.notify_one();
            nudged = true;
        }
        nudged
    }

    pub fn is_polling(&self, target: PollTarget) -> bool {
        self.timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .any(|t| t.target == target)
    }

    pub fn active_timers(&self) -> usize {
        self.timers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Stop every timer and wait for in-flight ticks to finish.
    pub async fn shutdown(&self) {
        let drained: Vec<Timer> = {
            let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
            timers.drain().map(|(_, t)| t).collect()
        };
        for timer in &drained {
            timer.token.cancel();
        }
        self.tracker.close();
        self.tracker.wait().await;
        info!(stopped = drained.len(), "polling scheduler shut down");
    }

    fn register(&self, target: PollTarget) -> (PollHandle, Arc<Notify>, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let nudge = Arc::new(Notify::new());

        self.timers.lock().unwrap_or_else(|e| e.into_inner()).insert(
            id,
            Timer {
                target,
                token: token.clone(),
                nudge: nudge.clone(),
            },
        );

        let handle = PollHandle {
            id,
            target,
            token: token.clone(),
            timers: self.timers.clone(),
        };
        (handle, nudge, token)
    }
}

fn clamp_period(target: PollTarget, period: Duration) -> Duration {
    if period >= MIN_INTERVAL {
        return period;
    }
    warn!(
        poll = ?target,
        requested_ms = period.as_millis() as u64,
        "poll period too short, using minimum"
    );
    MIN_INTERVAL
}

/// Ownership of one running timer. Dropping the handle stops the timer.
#[derive(Debug)]
pub struct PollHandle {
    id: u64,
    target: PollTarget,
    token: CancellationToken,
    timers: Registry,
}

impl PollHandle {
    pub fn target(&self) -> PollTarget {
        self.target
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the timer. Idempotent.
    pub fn stop(&self) {
        let was_running = !self.token.is_cancelled();
        self.token.cancel();
        self.timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
        if was_running {
            info!(poll = ?self.target, "poll timer stopped");
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A running detail timer together with the events it reports.
#[derive(Debug)]
pub struct DetailWatch {
    handle: PollHandle,
    events: mpsc::Receiver<DetailEvent>,
}

impl DetailWatch {
    pub fn handle(&self) -> &PollHandle {
        &self.handle
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Next report from the timer; `None` once it has stopped and drained.
    pub async fn next(&mut self) -> Option<DetailEvent> {
        self.events.recv().await
    }
}
