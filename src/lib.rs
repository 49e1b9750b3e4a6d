//! DevFlow monitor -- keeps a client's view of remote agent executions in
//! sync with the backend.
//!
//! The core polls the backend on two independent timers (the execution list
//! and, optionally, one execution's logs), merges what it fetches into an
//! in-memory store, and lets the user cancel a running execution. The
//! backend is reached through the [`gateway::RemoteExecutionGateway`] trait so
//! any presentation layer can inject its own transport.

pub mod cancel;
pub mod config;
pub mod execution;
pub mod gateway;
pub mod monitor;
pub mod reconcile;
pub mod scheduler;
pub mod store;

pub use execution::{ExecutionError, ExecutionId, ExecutionRecord, ExecutionStatus, LogSnapshot, ProjectId};
pub use monitor::{ExecutionMonitor, ExecutionWatch};

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` wins over `level`.
pub fn init_tracing(logging: &config::LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
