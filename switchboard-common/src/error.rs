//! The stable error taxonomy shared between the HTTP surface and the job
//! pipeline. Kind labels are part of the client contract and must not change.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whether a failed operation is worth re-queueing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryHint {
    /// Worth retrying: network glitches, device-busy gating, timeouts.
    Transient,
    /// Retrying cannot help: hard auth denial, bad command syntax, unknown host.
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    AuthRequired,
    AuthDenied,
    NotFound,
    TemplateNotFound,
    ParseError,
    GatingError,
    TransportError,
    AuthFailure,
    TimeoutError,
    Internal,
}

impl ErrorKind {
    /// Stable wire label for this kind.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::AuthRequired => "AUTH_REQUIRED",
            ErrorKind::AuthDenied => "AUTH_DENIED",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::TemplateNotFound => "TEMPLATE_NOT_FOUND",
            ErrorKind::ParseError => "PARSE_ERROR",
            ErrorKind::GatingError => "GATING_ERROR",
            ErrorKind::TransportError => "TRANSPORT_ERROR",
            ErrorKind::AuthFailure => "AUTH_FAILURE",
            ErrorKind::TimeoutError => "TIMEOUT_ERROR",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    /// Retry classification for worker-side failure accounting.
    pub fn retry_hint(&self) -> Option<RetryHint> {
        match self {
            ErrorKind::GatingError | ErrorKind::TransportError | ErrorKind::TimeoutError => {
                Some(RetryHint::Transient)
            }
            ErrorKind::AuthFailure => Some(RetryHint::Fatal),
            _ => None,
        }
    }

    /// HTTP status for errors surfaced directly on a response.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::AuthRequired => 401,
            ErrorKind::AuthDenied => 403,
            ErrorKind::NotFound | ErrorKind::TemplateNotFound => 404,
            ErrorKind::ParseError => 422,
            ErrorKind::GatingError | ErrorKind::Internal => 500,
            ErrorKind::TransportError | ErrorKind::AuthFailure => 502,
            ErrorKind::TimeoutError => 504,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A structured error attached to a FAILED job and surfaced to clients.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn retry_hint(&self) -> RetryHint {
        self.kind.retry_hint().unwrap_or(RetryHint::Fatal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(ErrorKind::AuthRequired.label(), "AUTH_REQUIRED");
        assert_eq!(ErrorKind::TemplateNotFound.label(), "TEMPLATE_NOT_FOUND");
        assert_eq!(
            serde_json::to_string(&ErrorKind::TimeoutError).unwrap(),
            "\"TIMEOUT_ERROR\""
        );
    }

    #[test]
    fn transport_failures_are_transient_but_device_auth_is_fatal() {
        assert_eq!(
            ErrorKind::TransportError.retry_hint(),
            Some(RetryHint::Transient)
        );
        assert_eq!(
            ErrorKind::GatingError.retry_hint(),
            Some(RetryHint::Transient)
        );
        assert_eq!(ErrorKind::AuthFailure.retry_hint(), Some(RetryHint::Fatal));
        assert_eq!(ErrorKind::Validation.retry_hint(), None);
    }

    #[test]
    fn authz_maps_to_403_not_401() {
        assert_eq!(ErrorKind::AuthDenied.http_status(), 403);
        assert_eq!(ErrorKind::AuthRequired.http_status(), 401);
    }
}
