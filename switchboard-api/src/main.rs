//! The switchboard controller binary: accept device-command requests over
//! HTTP, enqueue them for workers, and serve results back.

use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use eyre::WrapErr;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use health::{ComponentStatus, HealthHandle, HealthRegistry};
use switchboard_api::auth::AuthState;
use switchboard_api::config::Config;
use switchboard_api::handlers::{add_routes, AppState};
use switchboard_api::inventory::inventory;
use switchboard_api::parser::ParserDispatch;
use switchboard_common::cache::ResponseCache;
use switchboard_common::credentials::credential_store;
use switchboard_common::kv::{KvClient, RedisKv};
use switchboard_common::metrics::setup_metrics_routes;
use switchboard_common::monitor::Monitor;
use switchboard_common::queue::JobQueue;

async fn listen(app: Router, bind: String) -> eyre::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("listening on {:?}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            drop(tokio::signal::ctrl_c().await);
        })
        .await?;

    Ok(())
}

/// The controller has no consumer loop of its own, so its liveness hangs on
/// the thing it cannot work without: the shared KV store. A probe pings it
/// and reports into the registry; losing Redis flips the liveness check.
async fn probe_kv(kv: Arc<dyn KvClient>, prefix: String, handle: HealthHandle) {
    let mut interval = tokio::time::interval(Duration::from_secs(15));
    loop {
        interval.tick().await;
        match kv.get(format!("{}:liveness-probe", prefix)).await {
            Ok(_) | Err(switchboard_common::kv::KvError::NotFound) => {
                handle.report_healthy().await
            }
            Err(e) => {
                warn!("kv liveness probe failed: {}", e);
                handle.report_status(ComponentStatus::Unhealthy).await
            }
        }
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // An optional env file seeds the environment; real env vars win.
    let env_file =
        std::env::var("SWITCHBOARD_API_ENV_FILE").unwrap_or_else(|_| ".env".to_string());
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

    let state = AppState {
        queue: Arc::new(JobQueue::new(kv.clone(), &prefix)),
        cache: Arc::new(ResponseCache::new(
            kv.clone(),
            &prefix,
            Duration::from_secs(config.cache_default_ttl_s),
            Duration::from_secs(config.cache_max_ttl_s),
        )),
        monitor: Arc::new(Monitor::new(kv.clone(), &prefix)),
        inventory: Arc::from(
            inventory(&config.inventory_type).wrap_err("failed to initialize inventory plugin")?,
        ),
        credentials: Arc::from(
            credential_store(&config.credential_plugin)
                .wrap_err("failed to initialize credential plugin")?,
        ),
        parser: Arc::new(ParserDispatch::new(&config.template_dir)),
        auth: Arc::new(AuthState::from_config(&config)?),
        kv,
        config: Arc::new(config.clone()),
    };

    let liveness = HealthRegistry::new("liveness");
    let kv_liveness = liveness
        .register("kv".to_string(), time::Duration::seconds(60))
        .await;
    tokio::task::spawn(probe_kv(
        state.kv.clone(),
        prefix.clone(),
        kv_liveness,
    ));

    let app = Router::new()
        .route("/_readiness", get(|| ready("switchboard api")))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let app = add_routes(app, state);
    let app = setup_metrics_routes(app);

    listen(app, config.bind()).await
}
