use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::DetailEvent;
use crate::execution::ExecutionId;
use crate::reconcile::ReconciliationEngine;

/// Wait for the next tick, an immediate-poll nudge, or cancellation.
///
/// Returns `false` once the timer is stopped. Cancellation is checked first so
/// no tick starts after `stop` has returned.
async fn next_tick(
    ticker: &mut tokio::time::Interval,
    nudge: &Notify,
    token: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => return false,
        _ = ticker.tick() => {}
        _ = nudge.notified() => ticker.reset(),
    }
    !token.is_cancelled()
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// List timer loop. The first tick fires immediately.
pub(super) async fn run_list_loop(
    engine: Arc<ReconciliationEngine>,
    period: Duration,
    nudge: Arc<Notify>,
    token: CancellationToken,
) {
    info!(period_ms = period.as_millis() as u64, "list polling started");
    let mut ticker = ticker(period);

    while next_tick(&mut ticker, &nudge, &token).await {
        match engine.refresh_list().await {
            Ok(changed) => debug!(changed, "list tick complete"),
            // Never stop the schedule over one failed tick.
            Err(e) => warn!(error = %e, "list tick failed"),
        }
    }

    info!("list polling stopped");
}

/// Detail timer loop for one execution.
///
/// Every merge is reported on `events`; transient fetch failures are only
/// logged, anything else (an unknown id) is reported as well. The loop ends
/// when stopped or when the receiving scope has gone away.
pub(super) async fn run_detail_loop(
    engine: Arc<ReconciliationEngine>,
    id: ExecutionId,
    period: Duration,
    nudge: Arc<Notify>,
    token: CancellationToken,
    events: mpsc::Sender<DetailEvent>,
) {
    info!(execution_id = %id, period_ms = period.as_millis() as u64, "detail polling started");
    let mut ticker = ticker(period);

    while next_tick(&mut ticker, &nudge, &token).await {
        let event = match engine.refresh_detail(id).await {
            Ok(outcome) => DetailEvent::Merged(outcome),
            Err(e) if e.is_transient() => {
                warn!(execution_id = %id, error = %e, "detail tick failed");
                continue;
            }
            Err(e) => {
                warn!(execution_id = %id, error = %e, "detail tick hit a stale reference");
                DetailEvent::Failed(e)
            }
        };

        let delivered = tokio::select! {
            sent = events.send(event) => sent.is_ok(),
            _ = token.cancelled() => break,
        };
        if !delivered {
            debug!(execution_id = %id, "detail watcher dropped, stopping");
            token.cancel();
            break;
        }
    }

    info!(execution_id = %id, "detail polling stopped");
}
