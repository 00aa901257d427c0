//! Classification of worker-side failures into the stable taxonomy, with
//! the retry hint the queue uses for its accounting.

use thiserror::Error;

use switchboard_common::credentials::CredentialError;
use switchboard_common::error::{ErrorKind, JobError, RetryHint};
use switchboard_common::gate::GateError;
use switchboard_common::queue::QueueError;

use crate::transport::TransportError;

/// Errors that stop the worker loop itself, as opposed to failing one job.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("queue operation failed: {0}")]
    Queue(#[from] QueueError),
    #[error("worker task panicked: {0}")]
    TaskPanic(String),
}

/// Classify a transport failure.
///
/// Device error banners and unresolvable hostnames cannot be fixed by a
/// retry; everything network-shaped can.
pub fn classify_transport(error: &TransportError) -> (JobError, RetryHint) {
    match error {
        TransportError::Resolve(_) => (
            JobError::new(ErrorKind::TransportError, error.to_string()),
            RetryHint::Fatal,
        ),
        TransportError::AuthFailure(_) => (
            JobError::new(ErrorKind::AuthFailure, error.to_string()),
            RetryHint::Fatal,
        ),
        TransportError::CommandRejected { .. } => (
            JobError::new(ErrorKind::TransportError, error.to_string()),
            RetryHint::Fatal,
        ),
        TransportError::Timeout { .. } => (
            JobError::new(ErrorKind::TimeoutError, error.to_string()),
            RetryHint::Transient,
        ),
        TransportError::Connect { .. } | TransportError::Session(_) => (
            JobError::new(ErrorKind::TransportError, error.to_string()),
            RetryHint::Transient,
        ),
        // Cancellation is resolved by the caller before classification.
        TransportError::Cancelled => (
            JobError::new(ErrorKind::GatingError, error.to_string()),
            RetryHint::Transient,
        ),
    }
}

pub fn classify_gate(error: &GateError) -> (JobError, RetryHint) {
    (
        JobError::new(ErrorKind::GatingError, error.to_string()),
        RetryHint::Transient,
    )
}

pub fn classify_credential(error: &CredentialError) -> (JobError, RetryHint) {
    match error {
        CredentialError::NotFound(_) | CredentialError::UnknownPlugin(_) => (
            JobError::new(ErrorKind::AuthFailure, error.to_string()),
            RetryHint::Fatal,
        ),
        CredentialError::Timeout | CredentialError::Backend(_) => (
            JobError::new(ErrorKind::TransportError, error.to_string()),
            RetryHint::Transient,
        ),
    }
}
