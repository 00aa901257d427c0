//! Per-device concurrency gate: a named lease in the shared KV store so at
//! most one transport session touches a device across the whole worker
//! fleet.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::kv::{KvClient, KvError};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
const JITTER_RATIO: f64 = 0.25;

#[derive(Error, Debug)]
pub enum GateError {
    #[error("device {device_key} is busy; gave up after {waited_ms} ms")]
    Contended { device_key: String, waited_ms: u128 },
    #[error("lease on {0} was reclaimed while the session was running")]
    LeaseLost(String),
    #[error("kv operation failed: {0}")]
    Kv(#[from] KvError),
}

/// A granted lease. Hold it for the duration of the transport session and
/// release it on every exit path.
#[derive(Debug, Clone)]
pub struct Lease {
    pub device_key: String,
    pub holder_id: String,
    pub acquired_at: std::time::Instant,
}

pub struct DeviceGate {
    kv: Arc<dyn KvClient>,
    prefix: String,
    lease_ttl: Duration,
}

impl DeviceGate {
    pub fn new(kv: Arc<dyn KvClient>, prefix: &str, lease_ttl: Duration) -> Self {
        Self {
            kv,
            prefix: prefix.to_owned(),
            lease_ttl,
        }
    }

    fn lease_key(&self, device_key: &str) -> String {
        format!("{}:lease:{}", self.prefix, device_key)
    }

    /// How often a holder must refresh a long-lived lease.
    pub fn renewal_interval(&self) -> Duration {
        self.lease_ttl / 2
    }

    /// Try to take the single-occupancy lease for a device, waiting up to
    /// `max_wait` with jittered exponential backoff between attempts.
    pub async fn acquire(
        &self,
        device_key: &str,
        holder_id: &str,
        max_wait: Duration,
    ) -> Result<Lease, GateError> {
        let started = std::time::Instant::now();
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let granted = self
                .kv
                .set_nx_ex(
                    self.lease_key(device_key),
                    holder_id.to_owned(),
                    self.lease_ttl.as_secs(),
                )
                .await?;
            if granted {
                metrics::gauge!("device_lease_active", "device" => device_key.to_owned())
                    .increment(1.0);
                debug!(device = device_key, holder = holder_id, "lease acquired");
                return Ok(Lease {
                    device_key: device_key.to_owned(),
                    holder_id: holder_id.to_owned(),
                    acquired_at: started,
                });
            }

            let jittered = jitter(backoff);
            if started.elapsed() + jittered > max_wait {
                return Err(GateError::Contended {
                    device_key: device_key.to_owned(),
                    waited_ms: started.elapsed().as_millis(),
                });
            }
            tokio::time::sleep(jittered).await;
            backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
        }
    }

    /// Release a lease. Idempotent, and a no-op when the key has already
    /// been reclaimed and re-granted to another holder.
    pub async fn release(&self, lease: &Lease) {
        let key = self.lease_key(&lease.device_key);
        match self.kv.get(key.clone()).await {
            Ok(holder) if holder == lease.holder_id => {
                if let Err(e) = self.kv.del(key).await {
                    warn!(device = %lease.device_key, "failed to delete lease key: {}", e);
                    return;
                }
                metrics::gauge!("device_lease_active", "device" => lease.device_key.clone())
                    .decrement(1.0);
            }
            Ok(_) | Err(KvError::NotFound) => {}
            Err(e) => warn!(device = %lease.device_key, "failed to read lease key: {}", e),
        }
    }

    /// Refresh the TTL on a held lease. Call at `renewal_interval()`.
    /// Failing with `LeaseLost` means another holder owns the device now and
    /// the running command must be abandoned.
    pub async fn renew(&self, lease: &Lease) -> Result<(), GateError> {
        let key = self.lease_key(&lease.device_key);
        match self.kv.get(key.clone()).await {
            Ok(holder) if holder == lease.holder_id => {
                self.kv
                    .setex(key, lease.holder_id.clone(), self.lease_ttl.as_secs())
                    .await?;
                Ok(())
            }
            Ok(_) | Err(KvError::NotFound) => {
                Err(GateError::LeaseLost(lease.device_key.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn jitter(base: Duration) -> Duration {
    let spread = base.as_millis() as f64 * JITTER_RATIO;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_millis((base.as_millis() as f64 + offset).max(0.0) as u64)
}
