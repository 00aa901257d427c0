//! # JobQueue
//!
//! The job lifecycle driver, implemented on the shared KV store: envelopes
//! as JSON documents, a list for ready work, a sorted set for delayed
//! retries and a set of in-flight ids swept by the supervisor.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::warn;

use crate::error::{ErrorKind, JobError, RetryHint};
use crate::job::{Job, JobMetadata, JobPayload, JobResult, JobStatus};
use crate::kv::{KvClient, KvError};
use crate::retry::{wait_poll_interval, RetryPolicy};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("job {0} not found")]
    JobNotFound(String),
    #[error("job {id} cannot transition {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("kv operation failed: {0}")]
    Kv(#[from] KvError),
    #[error("job envelope could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

pub struct JobQueue {
    kv: Arc<dyn KvClient>,
    prefix: String,
    retry_policy: RetryPolicy,
    /// How long terminal envelopes stay readable for polling.
    result_ttl: Duration,
}

impl JobQueue {
    pub fn new(kv: Arc<dyn KvClient>, prefix: &str) -> Self {
        Self {
            kv,
            prefix: prefix.to_owned(),
            retry_policy: RetryPolicy::default(),
            result_ttl: Duration::from_secs(86400),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_result_ttl(mut self, result_ttl: Duration) -> Self {
        self.result_ttl = result_ttl;
        self
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn queue_key(&self) -> String {
        format!("{}:jobs:queue", self.prefix)
    }

    fn scheduled_key(&self) -> String {
        format!("{}:jobs:scheduled", self.prefix)
    }

    fn active_key(&self) -> String {
        format!("{}:jobs:active", self.prefix)
    }

    async fn load(&self, id: &str) -> QueueResult<Job> {
        match self.kv.get(self.job_key(id)).await {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(KvError::NotFound) => Err(QueueError::JobNotFound(id.to_owned())),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, job: &Job) -> QueueResult<()> {
        let raw = serde_json::to_string(job)?;
        let key = self.job_key(&job.job_id);
        if job.status.is_terminal() {
            self.kv
                .setex(key, raw, self.result_ttl.as_secs())
                .await?;
        } else {
            self.kv.set(key, raw).await?;
        }
        Ok(())
    }

    /// Persist a NEW job and make it visible to workers.
    ///
    /// The envelope write happens before the queue push so a controller
    /// crash between the two leaves a pollable (if never-executed) job
    /// rather than a queue entry pointing at nothing.
    pub async fn enqueue(
        &self,
        payload: JobPayload,
        metadata: JobMetadata,
    ) -> QueueResult<String> {
        let mut job = Job::new(payload, metadata);
        job.status = JobStatus::Queued;
        self.store(&job).await?;
        self.kv
            .lpush(self.queue_key(), job.job_id.clone())
            .await?;

        metrics::counter!("jobs_enqueued_total").increment(1);

        Ok(job.job_id)
    }

    /// Move retry-scheduled jobs whose backoff has elapsed onto the queue.
    async fn promote_scheduled(&self) -> QueueResult<()> {
        let now = Utc::now().timestamp();
        let due = self
            .kv
            .zrangebyscore(
                self.scheduled_key(),
                "-inf".to_string(),
                now.to_string(),
            )
            .await?;
        for id in due {
            self.kv.zrem(self.scheduled_key(), id.clone()).await?;
            self.kv.lpush(self.queue_key(), id).await?;
        }
        Ok(())
    }

    /// Blocking pull by a worker. Returns `None` when the timeout elapses
    /// with nothing to do.
    pub async fn fetch(
        &self,
        consumer_id: &str,
        timeout: Duration,
    ) -> QueueResult<Option<Job>> {
        self.promote_scheduled().await?;

        let Some(id) = self
            .kv
            .brpop(self.queue_key(), timeout.as_secs().max(1))
            .await?
        else {
            return Ok(None);
        };

        let mut job = match self.load(&id).await {
            Ok(job) => job,
            Err(QueueError::JobNotFound(_)) => {
                // The envelope expired or was purged; drop the stale queue entry.
                warn!(job_id = %id, "dropping queue entry without envelope");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if job.status != JobStatus::Queued {
            // Typically a sweep already re-routed this job; skip it.
            return Ok(None);
        }

        let now = Utc::now().timestamp();
        job.status = JobStatus::Active;
        job.attempts += 1;
        job.acquired_at = Some(now);
        job.consumer_id = Some(consumer_id.to_owned());
        job.last_heartbeat = Some(now);
        self.store(&job).await?;
        self.kv.sadd(self.active_key(), id).await?;

        Ok(Some(job))
    }

    /// ACTIVE -> COMPLETE. Calling it again on a terminal job is a no-op;
    /// the stored result is left unchanged.
    pub async fn complete(&self, id: &str, result: JobResult) -> QueueResult<Job> {
        let mut job = self.load(id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        if !job.status.can_transition_to(JobStatus::Complete) {
            return Err(QueueError::InvalidTransition {
                id: id.to_owned(),
                from: job.status,
                to: JobStatus::Complete,
            });
        }

        job.status = JobStatus::Complete;
        job.result = Some(result);
        job.error = None;
        self.store(&job).await?;
        self.kv.srem(self.active_key(), id.to_owned()).await?;

        metrics::counter!("jobs_completed_total").increment(1);

        Ok(job)
    }

    /// Classify a worker-side failure: FATAL or an exhausted retry budget
    /// terminates the job; a TRANSIENT failure with budget left re-queues it
    /// after the policy's backoff.
    pub async fn fail(
        &self,
        id: &str,
        error: JobError,
        hint: RetryHint,
    ) -> QueueResult<Job> {
        let mut job = self.load(id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }

        let retryable = hint == RetryHint::Transient && job.payload.retries_remaining > 0;
        if retryable {
            job.payload.retries_remaining -= 1;
            job.status = JobStatus::Queued;
            job.consumer_id = None;
            job.last_heartbeat = None;
            // The error invariant: `error` is only set on FAILED envelopes.
            job.error = None;
            self.store(&job).await?;
            self.kv.srem(self.active_key(), id.to_owned()).await?;

            let ready_at = Utc::now().timestamp()
                + self.retry_policy.time_until_next_retry(job.attempts).as_secs() as i64;
            self.kv
                .zadd(self.scheduled_key(), id.to_owned(), ready_at as f64)
                .await?;

            metrics::counter!("jobs_retried_total").increment(1);
        } else {
            job.status = JobStatus::Failed;
            job.error = Some(error);
            self.store(&job).await?;
            self.kv.srem(self.active_key(), id.to_owned()).await?;

            metrics::counter!("jobs_failed_total").increment(1);
        }

        Ok(job)
    }

    /// ACTIVE/FAILED -> ABORTED. Cooperative: an active worker notices the
    /// transition at its next heartbeat and stops.
    pub async fn abort(&self, id: &str) -> QueueResult<Job> {
        let mut job = self.load(id).await?;
        if matches!(job.status, JobStatus::Complete | JobStatus::Aborted) {
            return Ok(job);
        }
        if !job.status.can_transition_to(JobStatus::Aborted) {
            return Err(QueueError::InvalidTransition {
                id: id.to_owned(),
                from: job.status,
                to: JobStatus::Aborted,
            });
        }

        job.status = JobStatus::Aborted;
        self.store(&job).await?;
        self.kv.srem(self.active_key(), id.to_owned()).await?;

        Ok(job)
    }

    /// Idempotent snapshot read.
    pub async fn poll(&self, id: &str) -> QueueResult<Job> {
        self.load(id).await
    }

    /// Read-through polling with exponential backoff until the job is
    /// terminal or the deadline expires. On expiry the latest (possibly
    /// non-terminal) snapshot is returned; the job itself is untouched and
    /// remains visible to later polls.
    pub async fn wait(&self, id: &str, deadline: Duration) -> QueueResult<Job> {
        let started = tokio::time::Instant::now();
        let mut iteration = 0u32;
        loop {
            let job = self.load(id).await?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            let interval = wait_poll_interval(iteration);
            if started.elapsed() + interval >= deadline {
                return Ok(job);
            }
            tokio::time::sleep(interval).await;
            iteration += 1;
        }
    }

    /// Record a liveness tick for an ACTIVE job. Returns false when the job
    /// is no longer active under this consumer (aborted, swept or
    /// completed elsewhere); the worker must stop executing it.
    pub async fn heartbeat(&self, id: &str, consumer_id: &str) -> QueueResult<bool> {
        let mut job = match self.load(id).await {
            Ok(job) => job,
            Err(QueueError::JobNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if job.status != JobStatus::Active || job.consumer_id.as_deref() != Some(consumer_id) {
            return Ok(false);
        }
        job.last_heartbeat = Some(Utc::now().timestamp());
        self.store(&job).await?;
        Ok(true)
    }

    /// Supervisor sweep: re-queue ACTIVE jobs whose last heartbeat is older
    /// than the liveness window, spending one retry. Jobs with no budget
    /// left are failed terminally so they do not get lost in silence.
    pub async fn sweep(&self, liveness: Duration) -> QueueResult<u64> {
        let cutoff = Utc::now().timestamp() - liveness.as_secs() as i64;
        let mut swept = 0u64;

        for id in self.kv.smembers(self.active_key()).await? {
            let mut job = match self.load(&id).await {
                Ok(job) => job,
                Err(QueueError::JobNotFound(_)) => {
                    self.kv.srem(self.active_key(), id).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if job.status != JobStatus::Active {
                self.kv.srem(self.active_key(), id).await?;
                continue;
            }
            let last_tick = job.last_heartbeat.or(job.acquired_at).unwrap_or(0);
            if last_tick > cutoff {
                continue;
            }

            warn!(job_id = %id, consumer = ?job.consumer_id, "requeueing job with stale heartbeat");
            if job.payload.retries_remaining > 0 {
                job.payload.retries_remaining -= 1;
                job.status = JobStatus::Queued;
                job.consumer_id = None;
                job.last_heartbeat = None;
                self.store(&job).await?;
                self.kv.lpush(self.queue_key(), id.clone()).await?;
            } else {
                job.status = JobStatus::Failed;
                job.error = Some(JobError::new(
                    ErrorKind::TransportError,
                    "worker stopped heartbeating and the retry budget is exhausted",
                ));
                self.store(&job).await?;
            }
            self.kv.srem(self.active_key(), id).await?;
            swept += 1;
        }

        if swept > 0 {
            metrics::counter!("jobs_swept_total").increment(swept);
        }

        Ok(swept)
    }
}
