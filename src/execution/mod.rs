//! Execution records and the error taxonomy shared by the monitoring core.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Backend identifier of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub i64);

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Backend identifier of the project an execution belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub i64);

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    /// Position in the forward-only lifecycle. All terminal states share a rank.
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Success | Self::Failed | Self::Cancelled => 2,
        }
    }

    /// Whether a record currently in `self` may move to `next`.
    ///
    /// Staying in the same state is always allowed. Otherwise the move must be
    /// strictly forward and must not leave a terminal state.
    pub fn can_advance_to(self, next: ExecutionStatus) -> bool {
        if self == next {
            return true;
        }
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable state of one execution as the client knows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub project_id: ProjectId,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub input_parameters: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub logs: String,
}

impl ExecutionRecord {
    pub fn new(id: ExecutionId, project_id: ProjectId, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            project_id,
            status: ExecutionStatus::Pending,
            started_at,
            finished_at: None,
            input_parameters: serde_json::Value::Object(Default::default()),
            result: None,
            logs: String::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Enforce `finished_at` present iff terminal, and no `result` before then.
    ///
    /// A terminal record without a finish time is stamped with `observed_at`.
    pub(crate) fn normalize(&mut self, observed_at: DateTime<Utc>) {
        if self.status.is_terminal() {
            if self.finished_at.is_none() {
                self.finished_at = Some(observed_at);
            }
        } else {
            self.finished_at = None;
            self.result = None;
        }
    }
}

/// Response of the detail (logs) endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct LogSnapshot {
    pub status: ExecutionStatus,
    pub logs: String,
    pub result: Option<serde_json::Value>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Failures the monitoring core distinguishes.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionError {
    #[error("network error: {0}")]
    Network(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("execution {0} not found")]
    NotFound(ExecutionId),

    #[error("project {0} not found")]
    ProjectNotFound(ProjectId),

    #[error("execution {id} cannot be changed: {message}")]
    InvalidState { id: ExecutionId, message: String },

    #[error("malformed backend payload: {0}")]
    Decode(String),
}

impl ExecutionError {
    /// Errors a background poll may swallow and retry on its next tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Auth(_) | Self::Decode(_))
    }
}
