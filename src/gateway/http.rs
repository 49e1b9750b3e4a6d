use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::credentials::CredentialProvider;
use super::wire::{ErrorBody, ExecutionPayload, LaunchRequest, LogsPayload};
use super::RemoteExecutionGateway;
use crate::execution::{ExecutionError, ExecutionId, ExecutionRecord, LogSnapshot, ProjectId};

/// REST gateway to the DevFlow backend.
pub struct HttpGateway {
    client: Client,
    base_url: String,
    list_limit: u32,
    credentials: Arc<dyn CredentialProvider>,
}

/// What a request was about, used to map 404/400 to the right error.
#[derive(Debug, Clone, Copy)]
enum Target {
    Collection,
    Execution(ExecutionId),
    Project(ProjectId),
}

impl HttpGateway {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        list_limit: u32,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            list_limit,
            credentials,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match self.credentials.bearer_token() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder, target: Target) -> Result<Response, ExecutionError> {
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| ExecutionError::Network(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let detail = match resp.json::<ErrorBody>().await {
            Ok(body) => body.message(),
            Err(_) => status.to_string(),
        };
        debug!(%status, %detail, "backend rejected request");

        Err(match (status, target) {
            (StatusCode::UNAUTHORIZED, _) => {
                self.credentials.invalidate();
                ExecutionError::Auth(detail)
            }
            (StatusCode::FORBIDDEN, _) => ExecutionError::Auth(detail),
            (StatusCode::NOT_FOUND, Target::Execution(id)) => ExecutionError::NotFound(id),
            (StatusCode::NOT_FOUND, Target::Project(id)) => ExecutionError::ProjectNotFound(id),
            (StatusCode::BAD_REQUEST | StatusCode::CONFLICT, Target::Execution(id)) => {
                ExecutionError::InvalidState { id, message: detail }
            }
            _ => ExecutionError::Network(format!("unexpected status {status}: {detail}")),
        })
    }

    async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ExecutionError> {
        resp.json::<T>()
            .await
            .map_err(|e| ExecutionError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RemoteExecutionGateway for HttpGateway {
    async fn list_executions(&self) -> Result<Vec<ExecutionRecord>, ExecutionError> {
        let req = self
            .client
            .get(self.url("/execucoes/"))
            .query(&[("skip", 0), ("limit", self.list_limit)]);
        let resp = self.send(req, Target::Collection).await?;
        let payload: Vec<ExecutionPayload> = Self::decode(resp).await?;
        Ok(payload.into_iter().map(ExecutionRecord::from).collect())
    }

    async fn fetch_execution(&self, id: ExecutionId) -> Result<ExecutionRecord, ExecutionError> {
        let req = self.client.get(self.url(&format!("/execucoes/{}", id.0)));
        let resp = self.send(req, Target::Execution(id)).await?;
        let payload: ExecutionPayload = Self::decode(resp).await?;
        Ok(payload.into())
    }

    async fn fetch_logs(&self, id: ExecutionId) -> Result<LogSnapshot, ExecutionError> {
        let req = self.client.get(self.url(&format!("/execucoes/{}/logs", id.0)));
        let resp = self.send(req, Target::Execution(id)).await?;
        let payload: LogsPayload = Self::decode(resp).await?;
        Ok(payload.into())
    }

    async fn cancel_execution(&self, id: ExecutionId) -> Result<(), ExecutionError> {
        let req = self.client.post(self.url(&format!("/execucoes/{}/cancelar", id.0)));
        // The acknowledgement body carries the backend's view of the record; the
        // authoritative state is picked up by the next poll instead.
        self.send(req, Target::Execution(id)).await?;
        Ok(())
    }

    async fn launch_execution(
        &self,
        project: ProjectId,
        input_parameters: serde_json::Value,
    ) -> Result<ExecutionRecord, ExecutionError> {
        let req = self
            .client
            .post(self.url(&format!("/projetos/{}/execucoes", project.0)))
            .json(&LaunchRequest {
                parametros_entrada: &input_parameters,
            });
        let resp = self.send(req, Target::Project(project)).await?;
        let payload: ExecutionPayload = Self::decode(resp).await?;
        Ok(payload.into())
    }
}
