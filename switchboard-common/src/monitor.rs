//! Operational visibility: worker presence, a capped stream of recent
//! failures and per-device counters. Workers write, the controller's
//! monitoring endpoints read.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;
use crate::kv::{KvClient, KvError};

const FAILURE_STREAM_LEN: usize = 200;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("kv operation failed: {0}")]
    Kv(#[from] KvError),
    #[error("monitoring record could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
}

/// One worker's self-advertisement, refreshed on every liveness tick and
/// expiring with the liveness window when the worker dies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub name: String,
    pub in_flight: usize,
    pub started_at: i64,
    pub last_seen: i64,
}

/// One failed command execution, kept in a capped recent-failures stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub job_id: String,
    pub device: String,
    pub kind: ErrorKind,
    pub message: String,
    pub at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceStats {
    pub commands_executed: i64,
    pub jobs_failed: i64,
    pub cache_hits: i64,
}

pub struct Monitor {
    kv: Arc<dyn KvClient>,
    prefix: String,
}

impl Monitor {
    pub fn new(kv: Arc<dyn KvClient>, prefix: &str) -> Self {
        Self {
            kv,
            prefix: prefix.to_owned(),
        }
    }

    fn worker_key(&self, name: &str) -> String {
        format!("{}:workers:{}", self.prefix, name)
    }

    fn failures_key(&self) -> String {
        format!("{}:monitor:failures", self.prefix)
    }

    fn device_key(&self, host: &str) -> String {
        format!("{}:monitor:device:{}", self.prefix, host)
    }

    pub async fn advertise_worker(
        &self,
        status: &WorkerStatus,
        ttl: Duration,
    ) -> Result<(), MonitorError> {
        self.kv
            .setex(
                self.worker_key(&status.name),
                serde_json::to_string(status)?,
                ttl.as_secs(),
            )
            .await?;
        Ok(())
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerStatus>, MonitorError> {
        let keys = self.kv.keys(format!("{}:workers:*", self.prefix)).await?;
        let values = self.kv.mget(keys).await?;
        let mut workers = Vec::new();
        for value in values.into_iter().flatten() {
            workers.push(serde_json::from_str(&value)?);
        }
        workers.sort_by(|a: &WorkerStatus, b: &WorkerStatus| a.name.cmp(&b.name));
        Ok(workers)
    }

    pub async fn record_failure(&self, record: &FailureRecord) -> Result<(), MonitorError> {
        self.kv
            .lpush_capped(
                self.failures_key(),
                serde_json::to_string(record)?,
                FAILURE_STREAM_LEN,
            )
            .await?;
        Ok(())
    }

    pub async fn recent_failures(&self, limit: usize) -> Result<Vec<FailureRecord>, MonitorError> {
        let raw = self
            .kv
            .lrange(self.failures_key(), 0, limit as isize - 1)
            .await?;
        let mut failures = Vec::with_capacity(raw.len());
        for value in raw {
            failures.push(serde_json::from_str(&value)?);
        }
        Ok(failures)
    }

    pub async fn record_device(
        &self,
        host: &str,
        commands_executed: i64,
        cache_hits: i64,
        failed: bool,
    ) -> Result<(), MonitorError> {
        let key = self.device_key(host);
        if commands_executed > 0 {
            self.kv
                .hincrby(key.clone(), "commands_executed".to_string(), commands_executed)
                .await?;
        }
        if cache_hits > 0 {
            self.kv
                .hincrby(key.clone(), "cache_hits".to_string(), cache_hits)
                .await?;
        }
        if failed {
            self.kv.hincrby(key, "jobs_failed".to_string(), 1).await?;
        }
        Ok(())
    }

    pub async fn device_stats(&self, host: &str) -> Result<DeviceStats, MonitorError> {
        let fields = self.kv.hgetall(self.device_key(host)).await?;
        let read = |name: &str| -> i64 {
            fields
                .get(name)
                .and_then(|v| v.parse().ok())
                .unwrap_or_default()
        };
        Ok(DeviceStats {
            commands_executed: read("commands_executed"),
            jobs_failed: read("jobs_failed"),
            cache_hits: read("cache_hits"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    #[tokio::test]
    async fn workers_advertise_and_list() {
        let monitor = Monitor::new(Arc::new(MemoryKv::new()), "sb");
        let status = WorkerStatus {
            name: "worker-1".to_string(),
            in_flight: 2,
            started_at: 100,
            last_seen: 160,
        };
        monitor
            .advertise_worker(&status, Duration::from_secs(60))
            .await
            .unwrap();

        let workers = monitor.list_workers().await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].name, "worker-1");
        assert_eq!(workers[0].in_flight, 2);
    }

    #[tokio::test]
    async fn failures_are_capped_and_newest_first() {
        let monitor = Monitor::new(Arc::new(MemoryKv::new()), "sb");
        for i in 0..3 {
            monitor
                .record_failure(&FailureRecord {
                    job_id: format!("job-{}", i),
                    device: "rtr1".to_string(),
                    kind: ErrorKind::TransportError,
                    message: "connection reset".to_string(),
                    at: i,
                })
                .await
                .unwrap();
        }

        let recent = monitor.recent_failures(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].job_id, "job-2");
    }

    #[tokio::test]
    async fn device_stats_accumulate() {
        let monitor = Monitor::new(Arc::new(MemoryKv::new()), "sb");
        monitor.record_device("rtr1", 3, 1, false).await.unwrap();
        monitor.record_device("rtr1", 2, 0, true).await.unwrap();

        let stats = monitor.device_stats("rtr1").await.unwrap();
        assert_eq!(stats.commands_executed, 5);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.jobs_failed, 1);

        let empty = monitor.device_stats("rtr9").await.unwrap();
        assert_eq!(empty.commands_executed, 0);
    }
}
