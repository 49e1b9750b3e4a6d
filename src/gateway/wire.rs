//! JSON shapes of the backend REST API and their conversion into core types.
//!
//! The backend names fields in Portuguese (`projeto_id`, `iniciado_em`, ...)
//! and emits timestamps without an offset; those are taken as UTC.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::execution::{ExecutionId, ExecutionRecord, ExecutionStatus, LogSnapshot, ProjectId};

/// One element of `GET /execucoes/` and the body returned by a launch.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionPayload {
    pub id: i64,
    pub projeto_id: i64,
    pub status: ExecutionStatus,
    #[serde(deserialize_with = "timestamp")]
    pub iniciado_em: DateTime<Utc>,
    #[serde(default, deserialize_with = "optional_timestamp")]
    pub finalizado_em: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parametros_entrada: Option<serde_json::Value>,
    #[serde(default)]
    pub resultado: Option<serde_json::Value>,
    #[serde(default)]
    pub logs: Option<String>,
}

impl From<ExecutionPayload> for ExecutionRecord {
    fn from(p: ExecutionPayload) -> Self {
        Self {
            id: ExecutionId(p.id),
            project_id: ProjectId(p.projeto_id),
            status: p.status,
            started_at: p.iniciado_em,
            finished_at: p.finalizado_em,
            input_parameters: p
                .parametros_entrada
                .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
            result: p.resultado.filter(|v| !v.is_null()),
            logs: p.logs.unwrap_or_default(),
        }
    }
}

/// Body of `GET /execucoes/{id}/logs`.
#[derive(Debug, Clone, Deserialize)]
pub struct LogsPayload {
    pub status: ExecutionStatus,
    #[serde(default)]
    pub logs: Option<String>,
    #[serde(default)]
    pub resultado: Option<serde_json::Value>,
    #[serde(default, deserialize_with = "optional_timestamp")]
    pub finalizado_em: Option<DateTime<Utc>>,
}

impl From<LogsPayload> for LogSnapshot {
    fn from(p: LogsPayload) -> Self {
        Self {
            status: p.status,
            logs: p.logs.unwrap_or_default(),
            result: p.resultado.filter(|v| !v.is_null()),
            finished_at: p.finalizado_em,
        }
    }
}

/// Body of `POST /projetos/{id}/execucoes`.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchRequest<'a> {
    pub parametros_entrada: &'a serde_json::Value,
}

/// Error body the backend attaches to 4xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    pub detail: serde_json::Value,
}

impl ErrorBody {
    pub fn message(&self) -> String {
        match &self.detail {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Parse an ISO-8601 timestamp, with or without offset.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => Ok(dt.with_timezone(&Utc)),
        Err(_) => NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
            .map(|naive| naive.and_utc()),
    }
}

fn timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

fn optional_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) => parse_timestamp(&raw).map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}
