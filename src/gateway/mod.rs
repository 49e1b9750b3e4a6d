//! Remote operations the monitoring core consumes from the backend.

pub mod credentials;
pub mod http;
pub mod wire;

use async_trait::async_trait;

use crate::execution::{ExecutionError, ExecutionId, ExecutionRecord, LogSnapshot, ProjectId};

pub use self::credentials::{CredentialProvider, StaticCredential};
pub use self::http::HttpGateway;

/// Trait for the backend seen by the core.
///
/// Implementations do not touch the store; results flow back through the
/// reconciliation engine.
#[async_trait]
pub trait RemoteExecutionGateway: Send + Sync {
    /// Executions visible to the current user, newest first.
    async fn list_executions(&self) -> Result<Vec<ExecutionRecord>, ExecutionError>;

    /// Full record of one execution, identity fields included.
    async fn fetch_execution(&self, id: ExecutionId) -> Result<ExecutionRecord, ExecutionError>;

    /// Current status, full log text and result of one execution.
    async fn fetch_logs(&self, id: ExecutionId) -> Result<LogSnapshot, ExecutionError>;

    /// Ask the backend to cancel. Success only acknowledges the request.
    async fn cancel_execution(&self, id: ExecutionId) -> Result<(), ExecutionError>;

    /// Start a new execution of `project` with the given input parameters.
    async fn launch_execution(
        &self,
        project: ProjectId,
        input_parameters: serde_json::Value,
    ) -> Result<ExecutionRecord, ExecutionError>;
}
