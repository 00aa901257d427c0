//! HTTP-facing error and response types: the taxonomy mapped onto status
//! codes, and the JobResponse envelope returned by the command endpoints.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use switchboard_common::cache::CacheError;
use switchboard_common::credentials::CredentialError;
use switchboard_common::error::ErrorKind;
use switchboard_common::job::{Job, JobStatus};
use switchboard_common::kv::KvError;
use switchboard_common::monitor::MonitorError;
use switchboard_common::queue::QueueError;

use crate::inventory::InventoryError;
use crate::parser::ParserError;

/// An error surfaced on an HTTP response: `{error: <kind>, detail: ...}`
/// with the taxonomy's status code. Secrets never reach `detail`; inputs
/// that might carry them are summarized before constructing one of these.
#[derive(Error, Debug)]
#[error("{kind}: {detail}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn validation(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, detail)
    }

    fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Plain-text rendition for `raw_output` mode.
    pub fn into_plain_response(self) -> Response {
        (self.status(), format!("{}: {}", self.kind.label(), self.detail)).into_response()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.kind.label(),
            "detail": self.detail,
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<QueueError> for ApiError {
    fn from(error: QueueError) -> Self {
        match error {
            QueueError::JobNotFound(id) => Self::not_found(format!("job {} not found", id)),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<InventoryError> for ApiError {
    fn from(error: InventoryError) -> Self {
        match error {
            InventoryError::DeviceNotFound(name) => {
                Self::not_found(format!("device {} not found in inventory", name))
            }
            InventoryError::UnknownFilter(name) => {
                Self::validation(format!("unknown named filter {}", name))
            }
            InventoryError::BadFilter(detail) => Self::validation(detail),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<ParserError> for ApiError {
    fn from(error: ParserError) -> Self {
        match &error {
            ParserError::TemplateNotFound(_) => {
                Self::new(ErrorKind::TemplateNotFound, error.to_string())
            }
            ParserError::UnknownEngine(_) => Self::validation(error.to_string()),
            _ => Self::new(ErrorKind::ParseError, error.to_string()),
        }
    }
}

impl From<CacheError> for ApiError {
    fn from(error: CacheError) -> Self {
        Self::internal(error.to_string())
    }
}

impl From<MonitorError> for ApiError {
    fn from(error: MonitorError) -> Self {
        Self::internal(error.to_string())
    }
}

impl From<KvError> for ApiError {
    fn from(error: KvError) -> Self {
        Self::internal(error.to_string())
    }
}

impl From<CredentialError> for ApiError {
    fn from(error: CredentialError) -> Self {
        Self::internal(error.to_string())
    }
}

/// The JSON envelope for job submission and polling responses.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<switchboard_common::job::JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<switchboard_common::error::JobError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed: Option<Value>,
}

impl JobResponse {
    pub fn from_job(job: Job) -> Self {
        Self {
            job_id: job.job_id,
            status: job.status,
            attempts: job.attempts,
            result: job.result,
            error: job.error,
            parsed: None,
        }
    }

    pub fn with_parsed(mut self, parsed: Option<Value>) -> Self {
        self.parsed = parsed;
        self
    }
}

/// Render a completed multi-command result as plain text, one block per
/// command with the delimiter line clients split on.
pub fn raw_output_body(job: &Job) -> String {
    let Some(result) = &job.result else {
        return String::new();
    };
    if result.data.len() == 1 {
        return result
            .data
            .values()
            .next()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
    }
    let mut body = String::new();
    for (command, output) in &result.data {
        body.push_str(&format!("### {} ###\n", command));
        body.push_str(output.as_str().unwrap_or_default());
        if !body.ends_with('\n') {
            body.push('\n');
        }
    }
    body
}
