//! The worker main loop: pull jobs, partition commands against the cache,
//! execute the misses in one transport session under the device lease, and
//! publish the outcome.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use health::HealthHandle;
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, warn};

use switchboard_common::cache::{CacheStatus, ResponseCache};
use switchboard_common::credentials::{Credential, CredentialStore};
use switchboard_common::error::RetryHint;
use switchboard_common::gate::{DeviceGate, GateError, Lease};
use switchboard_common::job::{CacheMeta, CredentialRef, Job, JobResult};
use switchboard_common::monitor::{FailureRecord, Monitor, WorkerStatus};
use switchboard_common::queue::JobQueue;

use crate::error::{classify_credential, classify_gate, classify_transport, WorkerError};
use crate::transport::{SessionTarget, Transport, TransportError, TransportSet};

/// Why an in-flight execution was asked to stop.
const CANCEL_NONE: u8 = 0;
const CANCEL_ABORTED: u8 = 1;
const CANCEL_LEASE_LOST: u8 = 2;

#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicU8>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed) != CANCEL_NONE
    }

    fn set_aborted(&self) {
        let _ = self
            .0
            .compare_exchange(CANCEL_NONE, CANCEL_ABORTED, Ordering::Relaxed, Ordering::Relaxed);
    }

    fn set_lease_lost(&self) {
        let _ = self.0.compare_exchange(
            CANCEL_NONE,
            CANCEL_LEASE_LOST,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    fn reason(&self) -> u8 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Outcome of one execution attempt, before it is pushed into the queue's
/// lifecycle operations.
enum Attempt {
    Completed(JobResult),
    /// The envelope was externally aborted; there is nothing to transition.
    Aborted,
    Failed {
        error: switchboard_common::error::JobError,
        hint: RetryHint,
    },
}

pub struct Worker {
    name: String,
    queue: Arc<JobQueue>,
    gate: Arc<DeviceGate>,
    cache: Arc<ResponseCache>,
    credentials: Arc<dyn CredentialStore>,
    transports: TransportSet,
    monitor: Arc<Monitor>,
    poll_interval: Duration,
    max_concurrent_jobs: usize,
    heartbeat_interval: Duration,
    liveness: HealthHandle,
    liveness_window: Duration,
    started_at: i64,
    in_flight: Arc<Semaphore>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        queue: Arc<JobQueue>,
        gate: Arc<DeviceGate>,
        cache: Arc<ResponseCache>,
        credentials: Arc<dyn CredentialStore>,
        transports: TransportSet,
        monitor: Arc<Monitor>,
        poll_interval: Duration,
        max_concurrent_jobs: usize,
        heartbeat_interval: Duration,
        liveness: HealthHandle,
        liveness_window: Duration,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            gate,
            cache,
            credentials,
            transports,
            monitor,
            poll_interval,
            max_concurrent_jobs,
            heartbeat_interval,
            liveness,
            liveness_window,
            started_at: Utc::now().timestamp(),
            in_flight: Arc::new(Semaphore::new(max_concurrent_jobs)),
        }
    }

    /// Wait until a job becomes available, reporting liveness and presence
    /// on every poll. Returns `None` once shutdown is requested.
    async fn wait_for_job(
        &self,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<Option<Job>, WorkerError> {
        loop {
            if *shutdown.borrow() {
                return Ok(None);
            }
            self.liveness.report_healthy().await;
            self.advertise().await;

            match self.queue.fetch(&self.name, self.poll_interval).await {
                Ok(Some(job)) => return Ok(Some(job)),
                Ok(None) => continue,
                Err(e) => {
                    error!("failed to fetch from queue: {}", e);
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    async fn advertise(&self) {
        let status = WorkerStatus {
            name: self.name.clone(),
            in_flight: self.max_concurrent_jobs - self.in_flight.available_permits(),
            started_at: self.started_at,
            last_seen: Utc::now().timestamp(),
        };
        if let Err(e) = self
            .monitor
            .advertise_worker(&status, self.liveness_window)
            .await
        {
            warn!("failed to advertise worker status: {}", e);
        }
    }

    /// Run until shutdown flips, then drain in-flight jobs within the grace
    /// period. Workers hold no state beyond their name, so stopping one at
    /// any point is safe: the supervisor sweep re-queues whatever was lost.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        shutdown_grace: Duration,
    ) -> Result<(), WorkerError> {
        let fetch_shutdown = shutdown.clone();
        loop {
            let report_saturation = || {
                metrics::gauge!("worker_saturation_percent").set(
                    1f64 - self.in_flight.available_permits() as f64
                        / self.max_concurrent_jobs as f64,
                );
            };
            report_saturation();

            let job = tokio::select! {
                job = self.wait_for_job(&fetch_shutdown) => job?,
                _ = shutdown.changed() => None,
            };
            let Some(job) = job else { break };

            let permit = self
                .in_flight
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore has been closed");
            metrics::counter!("worker_jobs_total").increment(1);

            let worker = self.clone();
            tokio::spawn(async move {
                let job_id = job.job_id.clone();
                if let Err(e) = worker.process_job(job).await {
                    error!(job_id = %job_id, "failed to process job: {}", e);
                }
                drop(permit);
            });
        }

        // Graceful drain: all permits back means all spawned jobs finished.
        debug!("waiting up to {:?} for in-flight jobs", shutdown_grace);
        let drained = tokio::time::timeout(
            shutdown_grace,
            self.in_flight.acquire_many(self.max_concurrent_jobs as u32),
        )
        .await;
        if drained.is_err() {
            warn!("shutdown grace period expired with jobs still in flight");
        }
        Ok(())
    }

    /// Execute one job end-to-end and publish its terminal transition.
    pub async fn process_job(&self, job: Job) -> Result<(), WorkerError> {
        let started = tokio::time::Instant::now();
        let attempt = self.execute(&job).await;
        let elapsed = started.elapsed().as_secs_f64();

        match attempt {
            Attempt::Completed(result) => {
                self.queue.complete(&job.job_id, result).await?;
                metrics::counter!("worker_jobs_completed").increment(1);
                metrics::histogram!("worker_job_duration_seconds").record(elapsed);
            }
            Attempt::Aborted => {
                debug!(job_id = %job.job_id, "job was aborted while executing");
            }
            Attempt::Failed { error, hint } => {
                if let Err(e) = self
                    .monitor
                    .record_failure(&FailureRecord {
                        job_id: job.job_id.clone(),
                        device: job.payload.host.clone(),
                        kind: error.kind,
                        message: error.message.clone(),
                        at: Utc::now().timestamp(),
                    })
                    .await
                {
                    warn!("failed to record failure: {}", e);
                }
                self.queue.fail(&job.job_id, error, hint).await?;
                metrics::counter!("worker_jobs_failed").increment(1);
            }
        }
        Ok(())
    }

    async fn execute(&self, job: &Job) -> Attempt {
        let payload = &job.payload;

        // Phase 1: consult the cache before touching the gate. A fully
        // cached request never contends for the device at all.
        let mut hits: HashMap<String, switchboard_common::cache::CacheEntry> = HashMap::new();
        let mut misses: Vec<String> = Vec::new();
        for command in &payload.commands {
            if payload.use_cache && !payload.cache_refresh {
                match self.cache.lookup(&payload.host, command).await {
                    Ok(Some(entry)) => {
                        hits.insert(command.clone(), entry);
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => warn!("cache lookup failed, treating as miss: {}", e),
                }
            }
            if !misses.contains(command) {
                misses.push(command.clone());
            }
        }

        if misses.is_empty() {
            drop(
                self.monitor
                    .record_device(&payload.host, 0, hits.len() as i64, false)
                    .await,
            );
            return Attempt::Completed(assemble_result(payload, &hits, &HashMap::new()));
        }

        // Abort checkpoint between the cache phase and execution.
        match self.queue.heartbeat(&job.job_id, &self.name).await {
            Ok(true) => {}
            Ok(false) => return Attempt::Aborted,
            Err(e) => warn!("heartbeat failed before execution: {}", e),
        }

        // Credentials resolve at execution time and die with this scope.
        let credential = match self.resolve_credential(&payload.credential_ref).await {
            Ok(credential) => credential,
            Err(e) => {
                let (error, hint) = classify_credential(&e);
                return Attempt::Failed { error, hint };
            }
        };

        let holder_id = format!("{}:{}", self.name, job.job_id);
        let lease = match self
            .gate
            .acquire(
                &payload.host,
                &holder_id,
                Duration::from_secs(payload.max_queue_wait_s),
            )
            .await
        {
            Ok(lease) => lease,
            Err(e) => {
                let (error, hint) = classify_gate(&e);
                return Attempt::Failed { error, hint };
            }
        };

        let cancel = CancelFlag::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.queue.clone(),
            self.gate.clone(),
            lease.clone(),
            job.job_id.clone(),
            self.name.clone(),
            self.heartbeat_interval,
            cancel.clone(),
        ));

        let transport = self.transports.for_adapter(payload.adapter);
        let target = SessionTarget::from_payload(payload);
        let commands = misses.clone();
        let command_timeout = Duration::from_secs(payload.timeout_s.max(1));
        let blocking_cancel = cancel.clone();
        let join = tokio::task::spawn_blocking(move || {
            run_commands(
                transport,
                target,
                credential,
                commands,
                command_timeout,
                blocking_cancel,
            )
        })
        .await;

        heartbeat.abort();
        self.gate.release(&lease).await;

        let (executed, transport_error) = match join {
            Ok(outcome) => outcome,
            Err(e) => {
                return Attempt::Failed {
                    error: switchboard_common::error::JobError::new(
                        switchboard_common::error::ErrorKind::Internal,
                        format!("execution task panicked: {}", e),
                    ),
                    hint: RetryHint::Fatal,
                };
            }
        };

        // Whatever executed successfully is cacheable, even when a later
        // command in the batch failed: the output is real, and a retry will
        // then only re-run the remaining misses.
        if payload.use_cache || payload.cache_refresh {
            for (command, output) in &executed {
                if let Err(e) = self
                    .cache
                    .store(&payload.host, command, output, payload.cache_ttl)
                    .await
                {
                    warn!("failed to store cache entry: {}", e);
                }
            }
        }

        drop(
            self.monitor
                .record_device(
                    &payload.host,
                    executed.len() as i64,
                    hits.len() as i64,
                    transport_error.is_some(),
                )
                .await,
        );

        if let Some(error) = transport_error {
            if matches!(error, TransportError::Cancelled) {
                return match cancel.reason() {
                    CANCEL_ABORTED => Attempt::Aborted,
                    _ => {
                        // Lease loss is an involuntary abort, transient for
                        // the retry accounting.
                        let (error, hint) = classify_transport(&TransportError::Cancelled);
                        Attempt::Failed { error, hint }
                    }
                };
            }
            let (error, hint) = classify_transport(&error);
            return Attempt::Failed { error, hint };
        }

        let executed: HashMap<String, String> = executed.into_iter().collect();
        Attempt::Completed(assemble_result(payload, &hits, &executed))
    }

    async fn resolve_credential(
        &self,
        credential_ref: &CredentialRef,
    ) -> Result<Credential, switchboard_common::credentials::CredentialError> {
        match credential_ref {
            CredentialRef::Id(id) => self.credentials.get(id).await,
            CredentialRef::Inline { username, password } => Ok(Credential {
                username: username.clone(),
                password: switchboard_common::credentials::Secret::new(password.clone()),
            }),
        }
    }
}

/// Heartbeat ticks plus lease renewal. Renewal happens at half the lease
/// TTL; heartbeats tick more often so the supervisor sweep never mistakes a
/// busy worker for a dead one.
async fn heartbeat_loop(
    queue: Arc<JobQueue>,
    gate: Arc<DeviceGate>,
    lease: Lease,
    job_id: String,
    consumer: String,
    interval: Duration,
    cancel: CancelFlag,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; skip it.
    ticker.tick().await;

    let mut since_renewal = Duration::ZERO;
    loop {
        ticker.tick().await;
        since_renewal += interval;

        match queue.heartbeat(&job_id, &consumer).await {
            Ok(true) => {}
            Ok(false) => {
                cancel.set_aborted();
                return;
            }
            Err(e) => warn!(job_id = %job_id, "heartbeat publish failed: {}", e),
        }

        if since_renewal >= gate.renewal_interval() {
            since_renewal = Duration::ZERO;
            match gate.renew(&lease).await {
                Ok(()) => {}
                Err(GateError::LeaseLost(device)) => {
                    warn!(job_id = %job_id, device = %device, "lease was reclaimed mid-command");
                    cancel.set_lease_lost();
                    return;
                }
                Err(e) => warn!(job_id = %job_id, "lease renewal failed: {}", e),
            }
        }
    }
}

/// Open one session and run every command in declared order, stopping at
/// the first failure or cancellation. Outputs collected before the stop are
/// returned alongside the error.
fn run_commands(
    transport: Arc<dyn Transport>,
    target: SessionTarget,
    credential: Credential,
    commands: Vec<String>,
    timeout: Duration,
    cancel: CancelFlag,
) -> (Vec<(String, String)>, Option<TransportError>) {
    let mut session = match transport.open(&target, &credential) {
        Ok(session) => session,
        Err(e) => return (Vec::new(), Some(e)),
    };

    let mut outputs = Vec::new();
    let mut error = None;
    for command in commands {
        if cancel.is_set() {
            error = Some(TransportError::Cancelled);
            break;
        }
        match session.send(&command, timeout) {
            Ok(output) => outputs.push((command, output)),
            Err(e) => {
                error = Some(e);
                break;
            }
        }
    }
    session.close();

    (outputs, error)
}

/// Merge cache hits and fresh outputs back into declared command order,
/// recording each command's cache disposition.
fn assemble_result(
    payload: &switchboard_common::job::JobPayload,
    hits: &HashMap<String, switchboard_common::cache::CacheEntry>,
    executed: &HashMap<String, String>,
) -> JobResult {
    let mut result = JobResult::default();
    for command in &payload.commands {
        if let Some(entry) = hits.get(command) {
            result
                .data
                .insert(command.clone(), Value::String(entry.raw_output.clone()));
            result.meta.cache.insert(
                command.clone(),
                CacheMeta {
                    cache_status: CacheStatus::Hit,
                    cached_at: Some(entry.cached_at),
                    age_seconds: Some(entry.age_seconds()),
                },
            );
        } else if let Some(output) = executed.get(command) {
            result
                .data
                .insert(command.clone(), Value::String(output.clone()));
            let cache_status = if payload.cache_refresh {
                CacheStatus::Refresh
            } else if payload.use_cache {
                CacheStatus::Miss
            } else {
                CacheStatus::Bypass
            };
            result.meta.cache.insert(
                command.clone(),
                CacheMeta {
                    cache_status,
                    cached_at: None,
                    age_seconds: None,
                },
            );
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use switchboard_common::credentials::CredentialError;
    use switchboard_common::error::ErrorKind;
    use switchboard_common::job::{Adapter, JobMetadata, JobPayload, JobStatus};
    use switchboard_common::kv::{KvClient, MemoryKv};
    use switchboard_common::retry::RetryPolicy;

    /// Scripted transport: canned output per command, optional scripted
    /// failure, and a record of every session opened and command sent.
    struct ScriptedTransport {
        outputs: HashMap<String, String>,
        fail_with: Mutex<Option<TransportError>>,
        opened: Mutex<u32>,
        sent: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(outputs: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                outputs: outputs
                    .iter()
                    .map(|(c, o)| (c.to_string(), o.to_string()))
                    .collect(),
                fail_with: Mutex::new(None),
                opened: Mutex::new(0),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn failing(error: TransportError) -> Arc<Self> {
            let transport = Self::new(&[]);
            *transport.fail_with.lock().unwrap() = Some(error);
            transport
        }

        fn opened(&self) -> u32 {
            *self.opened.lock().unwrap()
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    struct ScriptedSession {
        transport: Arc<ScriptedTransport>,
    }

    impl Transport for Arc<ScriptedTransport> {
        fn open(
            &self,
            _target: &SessionTarget,
            _credential: &Credential,
        ) -> Result<Box<dyn Session>, TransportError> {
            *self.opened.lock().unwrap() += 1;
            Ok(Box::new(ScriptedSession {
                transport: self.clone(),
            }))
        }
    }

    use crate::transport::Session;

    impl Session for ScriptedSession {
        fn send(&mut self, command: &str, _timeout: Duration) -> Result<String, TransportError> {
            if let Some(error) = self.transport.fail_with.lock().unwrap().take() {
                return Err(error);
            }
            self.transport.sent.lock().unwrap().push(command.to_owned());
            Ok(self
                .transport
                .outputs
                .get(command)
                .cloned()
                .unwrap_or_else(|| format!("output of {}", command)))
        }

        fn close(&mut self) {}
    }

    struct StaticCredentials;

    #[async_trait::async_trait]
    impl CredentialStore for StaticCredentials {
        async fn get(&self, credential_id: &str) -> Result<Credential, CredentialError> {
            if credential_id == "lab" {
                Ok(Credential {
                    username: "admin".to_string(),
                    password: switchboard_common::credentials::Secret::new("hunter2"),
                })
            } else {
                Err(CredentialError::NotFound(credential_id.to_owned()))
            }
        }

        async fn list_ids(&self, _wait: Duration) -> Result<Vec<String>, CredentialError> {
            Ok(vec!["lab".to_string()])
        }
    }

    struct Harness {
        worker: Worker,
        queue: Arc<JobQueue>,
        cache: Arc<ResponseCache>,
        transport: Arc<ScriptedTransport>,
    }

    async fn harness(transport: Arc<ScriptedTransport>) -> Harness {
        let kv: Arc<dyn KvClient> = Arc::new(MemoryKv::new());
        let queue = Arc::new(
            JobQueue::new(kv.clone(), "sb")
                .with_retry_policy(RetryPolicy::new(2, Duration::from_secs(0), None)),
        );
        let gate = Arc::new(DeviceGate::new(kv.clone(), "sb", Duration::from_secs(30)));
        let cache = Arc::new(ResponseCache::new(
            kv.clone(),
            "sb",
            Duration::from_secs(300),
            Duration::from_secs(3600),
        ));
        let monitor = Arc::new(Monitor::new(kv.clone(), "sb"));
        let registry = health::HealthRegistry::new("test-liveness");
        let liveness = registry
            .register("worker".to_string(), time::Duration::seconds(60))
            .await;

        let transports = TransportSet {
            exec: Arc::new(transport.clone()),
            shell: Arc::new(transport.clone()),
        };
        let worker = Worker::new(
            "worker-test",
            queue.clone(),
            gate,
            cache.clone(),
            Arc::new(StaticCredentials),
            transports,
            monitor,
            Duration::from_millis(100),
            4,
            Duration::from_secs(10),
            liveness,
            Duration::from_secs(60),
        );
        Harness {
            worker,
            queue,
            cache,
            transport,
        }
    }

    fn payload(commands: &[&str], use_cache: bool) -> JobPayload {
        JobPayload {
            host: "rtr1.example.net".to_string(),
            port: 22,
            adapter: Adapter::Shell,
            adapter_driver: "cisco_ios".to_string(),
            commands: commands.iter().map(|c| c.to_string()).collect(),
            credential_ref: CredentialRef::Id("lab".to_string()),
            adapter_options: serde_json::Map::new(),
            retries_remaining: 0,
            max_queue_wait_s: 1,
            timeout_s: 10,
            use_cache,
            cache_refresh: false,
            cache_ttl: None,
        }
    }

    async fn enqueue_and_fetch(harness: &Harness, payload: JobPayload) -> Job {
        harness
            .queue
            .enqueue(payload, JobMetadata::default())
            .await
            .unwrap();
        harness
            .queue
            .fetch("worker-test", Duration::from_secs(1))
            .await
            .unwrap()
            .expect("job should be fetchable")
    }

    #[tokio::test]
    async fn executes_commands_and_completes() {
        let transport = ScriptedTransport::new(&[("show version", "IOS 15.2")]);
        let harness = harness(transport).await;

        let job = enqueue_and_fetch(&harness, payload(&["show version"], false)).await;
        harness.worker.process_job(job.clone()).await.unwrap();

        let done = harness.queue.poll(&job.job_id).await.unwrap();
        assert_eq!(done.status, JobStatus::Complete);
        let result = done.result.unwrap();
        assert_eq!(
            result.data.get("show version").unwrap().as_str().unwrap(),
            "IOS 15.2"
        );
        assert_eq!(
            result.meta.cache.get("show version").unwrap().cache_status,
            CacheStatus::Bypass
        );
        assert_eq!(harness.transport.opened(), 1);
    }

    #[tokio::test]
    async fn partial_cache_hit_executes_only_the_misses_in_one_session() {
        let transport = ScriptedTransport::new(&[("b", "fresh-b")]);
        let harness = harness(transport).await;

        // a and c are already cached; b is not.
        harness.cache.store("rtr1.example.net", "a", "cached-a", None).await.unwrap();
        harness.cache.store("rtr1.example.net", "c", "cached-c", None).await.unwrap();

        let job = enqueue_and_fetch(&harness, payload(&["a", "b", "c"], true)).await;
        harness.worker.process_job(job.clone()).await.unwrap();

        // Exactly one session, running exactly the one miss.
        assert_eq!(harness.transport.opened(), 1);
        assert_eq!(harness.transport.sent(), vec!["b".to_string()]);

        let done = harness.queue.poll(&job.job_id).await.unwrap();
        let result = done.result.unwrap();

        // Declared order is preserved across hits and the fresh output.
        let keys: Vec<&String> = result.data.keys().collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(result.data.get("b").unwrap().as_str().unwrap(), "fresh-b");

        assert_eq!(
            result.meta.cache.get("a").unwrap().cache_status,
            CacheStatus::Hit
        );
        assert_eq!(
            result.meta.cache.get("b").unwrap().cache_status,
            CacheStatus::Miss
        );
        assert_eq!(
            result.meta.cache.get("c").unwrap().cache_status,
            CacheStatus::Hit
        );
        assert!(result.meta.cache.get("a").unwrap().age_seconds.is_some());

        // The fresh output landed in the cache for the next request.
        let entry = harness
            .cache
            .lookup("rtr1.example.net", "b")
            .await
            .unwrap()
            .expect("b should now be cached");
        assert_eq!(entry.raw_output, "fresh-b");
    }

    #[tokio::test]
    async fn fully_cached_requests_never_open_a_session() {
        let transport = ScriptedTransport::new(&[]);
        let harness = harness(transport).await;

        harness.cache.store("rtr1.example.net", "a", "cached-a", None).await.unwrap();

        let job = enqueue_and_fetch(&harness, payload(&["a"], true)).await;
        harness.worker.process_job(job.clone()).await.unwrap();

        assert_eq!(harness.transport.opened(), 0);
        let done = harness.queue.poll(&job.job_id).await.unwrap();
        assert_eq!(done.status, JobStatus::Complete);
    }

    #[tokio::test]
    async fn device_auth_denial_fails_the_job_fatally() {
        let transport =
            ScriptedTransport::failing(TransportError::AuthFailure("denied".to_string()));
        let harness = harness(transport).await;

        // Plenty of retry budget, which a FATAL failure must ignore.
        let mut p = payload(&["show version"], false);
        p.retries_remaining = 3;
        let job = enqueue_and_fetch(&harness, p).await;
        harness.worker.process_job(job.clone()).await.unwrap();

        let done = harness.queue.poll(&job.job_id).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.error.unwrap().kind, ErrorKind::AuthFailure);
        assert_eq!(done.payload.retries_remaining, 3);
    }

    #[tokio::test]
    async fn transient_transport_failure_requeues() {
        let transport = ScriptedTransport::failing(TransportError::Connect {
            host: "rtr1.example.net".to_string(),
            port: 22,
            detail: "connection reset".to_string(),
        });
        let harness = harness(transport).await;

        let mut p = payload(&["show version"], false);
        p.retries_remaining = 1;
        let job = enqueue_and_fetch(&harness, p).await;
        harness.worker.process_job(job.clone()).await.unwrap();

        let requeued = harness.queue.poll(&job.job_id).await.unwrap();
        assert_eq!(requeued.status, JobStatus::Queued);
        assert_eq!(requeued.payload.retries_remaining, 0);
    }

    #[tokio::test]
    async fn unknown_credential_is_fatal() {
        let transport = ScriptedTransport::new(&[]);
        let harness = harness(transport).await;

        let mut p = payload(&["show version"], false);
        p.credential_ref = CredentialRef::Id("nope".to_string());
        p.retries_remaining = 2;
        let job = enqueue_and_fetch(&harness, p).await;
        harness.worker.process_job(job.clone()).await.unwrap();

        let done = harness.queue.poll(&job.job_id).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.error.unwrap().kind, ErrorKind::AuthFailure);
        // No session was ever attempted.
        assert_eq!(harness.transport.opened(), 0);
    }

    #[tokio::test]
    async fn inline_credentials_bypass_the_store() {
        let transport = ScriptedTransport::new(&[("show clock", "12:00:00")]);
        let harness = harness(transport).await;

        let mut p = payload(&["show clock"], false);
        p.credential_ref = CredentialRef::Inline {
            username: "oneshot".to_string(),
            password: "pw".to_string(),
        };
        let job = enqueue_and_fetch(&harness, p).await;
        harness.worker.process_job(job.clone()).await.unwrap();

        let done = harness.queue.poll(&job.job_id).await.unwrap();
        assert_eq!(done.status, JobStatus::Complete);
    }

    #[tokio::test]
    async fn refresh_mode_overwrites_the_cached_entry() {
        let transport = ScriptedTransport::new(&[("a", "fresh-a")]);
        let harness = harness(transport).await;

        harness.cache.store("rtr1.example.net", "a", "stale-a", None).await.unwrap();

        let mut p = payload(&["a"], true);
        p.cache_refresh = true;
        let job = enqueue_and_fetch(&harness, p).await;
        harness.worker.process_job(job.clone()).await.unwrap();

        // The lookup was skipped, the device was hit, the entry overwritten.
        assert_eq!(harness.transport.sent(), vec!["a".to_string()]);
        let done = harness.queue.poll(&job.job_id).await.unwrap();
        let result = done.result.unwrap();
        assert_eq!(
            result.meta.cache.get("a").unwrap().cache_status,
            CacheStatus::Refresh
        );
        let entry = harness
            .cache
            .lookup("rtr1.example.net", "a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.raw_output, "fresh-a");
    }
}
