use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use switchboard_common::config::RedisConfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,

    #[envconfig(from = "WORKER_LOG_LEVEL", default = "info")]
    pub log_level: String,

    #[envconfig(from = "WORKER_NAME", default = "worker")]
    pub worker_name: String,

    #[envconfig(nested = true)]
    pub redis: RedisConfig,

    #[envconfig(from = "WORKER_CREDENTIAL_PLUGIN", default = "yaml")]
    pub credential_plugin: NonEmptyString,

    #[envconfig(from = "WORKER_POLL_INTERVAL_S", default = "2")]
    pub poll_interval_s: u64,

    #[envconfig(from = "WORKER_MAX_CONCURRENT_JOBS", default = "16")]
    pub max_concurrent_jobs: usize,

    #[envconfig(from = "WORKER_HEARTBEAT_INTERVAL_S", default = "10")]
    pub heartbeat_interval_s: u64,

    #[envconfig(from = "WORKER_LIVENESS_S", default = "60")]
    pub worker_liveness_s: u64,

    #[envconfig(from = "WORKER_LEASE_TTL_S", default = "300")]
    pub lease_ttl_s: u64,

    #[envconfig(from = "WORKER_SHUTDOWN_GRACE_S", default = "30")]
    pub shutdown_grace_s: u64,

    #[envconfig(from = "WORKER_SWEEP_INTERVAL_S", default = "30")]
    pub sweep_interval_s: u64,

    #[envconfig(from = "CACHE_DEFAULT_TTL", default = "300")]
    pub cache_default_ttl_s: u64,

    #[envconfig(from = "CACHE_MAX_TTL", default = "3600")]
    pub cache_max_ttl_s: u64,

    #[envconfig(from = "JOB_RESULT_TTL_S", default = "86400")]
    pub job_result_ttl_s: u64,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn poll_interval(&self) -> time::Duration {
        time::Duration::from_secs(self.poll_interval_s)
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
