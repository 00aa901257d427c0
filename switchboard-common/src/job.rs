//! The job envelope: the single JSON document that carries one unit of work
//! from the controller through the queue to a worker and back.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::CacheStatus;
use crate::error::JobError;

/// Which SSH transport family carries the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Adapter {
    /// One exec channel per command.
    Exec,
    /// One interactive shell channel, prompt-driven.
    Shell,
}

impl fmt::Display for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Adapter::Exec => write!(f, "exec"),
            Adapter::Shell => write!(f, "shell"),
        }
    }
}

/// Enumeration of possible statuses for a Job.
///
/// `New` only exists inside the enqueue operation; externally observable
/// lifecycles begin at `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    New,
    Queued,
    Active,
    Complete,
    Failed,
    Aborted,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Failed | JobStatus::Aborted
        )
    }

    /// Whether a transition along the lifecycle state machine is legal.
    /// Transitions are monotone: terminal states never transition again,
    /// except FAILED which may still be marked ABORTED.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::New, JobStatus::Queued)
                | (JobStatus::Queued, JobStatus::Active)
                | (JobStatus::Active, JobStatus::Complete)
                | (JobStatus::Active, JobStatus::Queued)
                | (JobStatus::Active, JobStatus::Failed)
                | (JobStatus::Active, JobStatus::Aborted)
                | (JobStatus::Failed, JobStatus::Aborted)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::New => "NEW",
            JobStatus::Queued => "QUEUED",
            JobStatus::Active => "ACTIVE",
            JobStatus::Complete => "COMPLETE",
            JobStatus::Failed => "FAILED",
            JobStatus::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// How the worker obtains the device credential.
///
/// The inline form exists for callers that explicitly supply a username and
/// password on the request; it is the only case where a secret transits the
/// queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CredentialRef {
    Id(String),
    Inline { username: String, password: String },
}

/// The executable portion of a job, consumed by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub host: String,
    pub port: u16,
    pub adapter: Adapter,
    pub adapter_driver: String,
    pub commands: Vec<String>,
    pub credential_ref: CredentialRef,
    #[serde(default)]
    pub adapter_options: Map<String, Value>,
    pub retries_remaining: u32,
    pub max_queue_wait_s: u64,
    pub timeout_s: u64,
    /// Cache controls resolved by the controller at submission time.
    #[serde(default)]
    pub use_cache: bool,
    #[serde(default)]
    pub cache_refresh: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl: Option<u64>,
}

/// Per-command parse controls for multi-command jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parser: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_raw: Option<bool>,
}

/// Bookkeeping preserved for retrieval-time operations (re-parsing a
/// completed job on a later poll).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
    #[serde(default)]
    pub parse: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parser: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default)]
    pub include_raw: bool,
}

/// Per-command cache disposition recorded in a completed job's result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMeta {
    pub cache_status: CacheStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_seconds: Option<i64>,
}

impl CacheMeta {
    pub fn bypass() -> Self {
        Self {
            cache_status: CacheStatus::Bypass,
            cached_at: None,
            age_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMeta {
    #[serde(default)]
    pub cache: HashMap<String, CacheMeta>,
}

/// Present iff the job completed. `data` preserves the declared command
/// order (serde_json maps keep insertion order in this workspace).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub data: Map<String, Value>,
    pub meta: ResultMeta,
}

/// The persisted job envelope. The KV store is the single source of truth
/// for this document; nothing else mirrors job state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquired_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<i64>,
    pub payload: JobPayload,
    #[serde(default)]
    pub metadata: JobMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl Job {
    pub fn new(payload: JobPayload, metadata: JobMetadata) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            status: JobStatus::New,
            attempts: 0,
            created_at: chrono::Utc::now().timestamp(),
            acquired_at: None,
            consumer_id: None,
            last_heartbeat: None,
            payload,
            metadata,
            result: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> JobPayload {
        JobPayload {
            host: "rtr1.example.net".to_string(),
            port: 22,
            adapter: Adapter::Shell,
            adapter_driver: "cisco_ios".to_string(),
            commands: vec!["show version".to_string()],
            credential_ref: CredentialRef::Id("lab".to_string()),
            adapter_options: Map::new(),
            retries_remaining: 2,
            max_queue_wait_s: 30,
            timeout_s: 60,
            use_cache: false,
            cache_refresh: false,
            cache_ttl: None,
        }
    }

    #[test]
    fn statuses_serialize_as_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Complete).unwrap(),
            "\"COMPLETE\""
        );
        assert_eq!(
            serde_json::from_str::<JobStatus>("\"QUEUED\"").unwrap(),
            JobStatus::Queued
        );
    }

    #[test]
    fn transitions_follow_the_state_machine() {
        use JobStatus::*;
        assert!(New.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Active));
        assert!(Active.can_transition_to(Complete));
        assert!(Active.can_transition_to(Queued)); // transient retry
        assert!(Active.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Aborted));

        // Monotonicity: terminal states never go back.
        assert!(!Complete.can_transition_to(Active));
        assert!(!Complete.can_transition_to(Queued));
        assert!(!Aborted.can_transition_to(Active));
        assert!(!Queued.can_transition_to(Complete));
    }

    #[test]
    fn credential_ref_roundtrips_both_forms() {
        let by_id: CredentialRef = serde_json::from_str("\"lab\"").unwrap();
        assert_eq!(by_id, CredentialRef::Id("lab".to_string()));

        let inline: CredentialRef =
            serde_json::from_str(r#"{"username":"admin","password":"s3cret"}"#).unwrap();
        assert_eq!(
            inline,
            CredentialRef::Inline {
                username: "admin".to_string(),
                password: "s3cret".to_string()
            }
        );
    }

    #[test]
    fn envelope_roundtrips_through_json() {
        let job = Job::new(payload(), JobMetadata::default());
        let encoded = serde_json::to_string(&job).unwrap();
        let decoded: Job = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.job_id, job.job_id);
        assert_eq!(decoded.status, JobStatus::New);
        assert_eq!(decoded.payload, job.payload);
    }
}
