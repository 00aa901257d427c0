//! Consume queued device-command jobs and execute them over SSH.

use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use eyre::WrapErr;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use health::HealthRegistry;
use switchboard_common::cache::ResponseCache;
use switchboard_common::credentials::credential_store;
use switchboard_common::gate::DeviceGate;
use switchboard_common::kv::{KvClient, RedisKv};
use switchboard_common::metrics::{serve, setup_metrics_routes};
use switchboard_common::monitor::Monitor;
use switchboard_common::queue::JobQueue;
use switchboard_worker::config::Config;
use switchboard_worker::transport::TransportSet;
use switchboard_worker::worker::Worker;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // An optional env file seeds the environment; real env vars win.
    let env_file = std::env::var("SWITCHBOARD_WORKER_ENV_FILE")
        .unwrap_or_else(|_| ".env".to_string());
    drop(dotenvy::from_filename(env_file));

    let config = Config::init_from_env().wrap_err("invalid configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let kv: Arc<dyn KvClient> =
        Arc::new(RedisKv::new(config.redis.url()).wrap_err("failed to create redis client")?);
    let prefix = config.redis.key_prefix.clone();

    let queue = Arc::new(
        JobQueue::new(kv.clone(), &prefix)
            .with_result_ttl(Duration::from_secs(config.job_result_ttl_s)),
    );
    let gate = Arc::new(DeviceGate::new(
        kv.clone(),
        &prefix,
        Duration::from_secs(config.lease_ttl_s),
    ));
    let cache = Arc::new(ResponseCache::new(
        kv.clone(),
        &prefix,
        Duration::from_secs(config.cache_default_ttl_s),
        Duration::from_secs(config.cache_max_ttl_s),
    ));
    let monitor = Arc::new(Monitor::new(kv.clone(), &prefix));
    let credentials = credential_store(config.credential_plugin.as_str())
        .wrap_err("failed to initialize credential plugin")?;

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register(
            "worker".to_string(),
            time::Duration::seconds(config.worker_liveness_s as i64),
        )
        .await;

    let worker = Arc::new(Worker::new(
        &config.worker_name,
        queue.clone(),
        gate,
        cache,
        Arc::from(credentials),
        TransportSet::ssh(),
        monitor,
        config.poll_interval(),
        config.max_concurrent_jobs,
        Duration::from_secs(config.heartbeat_interval_s),
        worker_liveness,
        Duration::from_secs(config.worker_liveness_s),
    ));

    // Health + metrics server, as a sidecar to the worker loop.
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router);
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to start serving metrics: {}", e);
        }
    });

    // Supervisor sweep: jobs abandoned by a dead worker get re-queued once
    // their heartbeat goes stale.
    let sweep_queue = queue.clone();
    let sweep_interval = Duration::from_secs(config.sweep_interval_s);
    let liveness_window = Duration::from_secs(config.worker_liveness_s);
    tokio::task::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            match sweep_queue.sweep(liveness_window).await {
                Ok(0) => {}
                Ok(n) => info!("supervisor sweep re-routed {} stale jobs", n),
                Err(e) => error!("supervisor sweep failed: {}", e),
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::task::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received, draining in-flight jobs");
            let _ = shutdown_tx.send(true);
        }
    });

    worker
        .run(shutdown_rx, Duration::from_secs(config.shutdown_grace_s))
        .await?;

    Ok(())
}

pub async fn index() -> &'static str {
    "switchboard worker"
}
