//! Route table and shared request state for the controller.

pub mod cache;
pub mod device;
pub mod inventory;
pub mod job;
pub mod monitoring;
pub mod templates;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde_json::json;

use switchboard_common::cache::ResponseCache;
use switchboard_common::credentials::CredentialStore;
use switchboard_common::kv::KvClient;
use switchboard_common::monitor::Monitor;
use switchboard_common::queue::JobQueue;

use crate::auth::{AuthState, Principal};
use crate::config::Config;
use crate::inventory::Inventory;
use crate::parser::ParserDispatch;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub kv: Arc<dyn KvClient>,
    pub queue: Arc<JobQueue>,
    pub cache: Arc<ResponseCache>,
    pub monitor: Arc<Monitor>,
    pub inventory: Arc<dyn Inventory>,
    pub credentials: Arc<dyn CredentialStore>,
    pub parser: Arc<ParserDispatch>,
    pub auth: Arc<AuthState>,
}

async fn index() -> &'static str {
    "switchboard"
}

/// Authenticated echo of the caller: auth mode, typed claims and whatever
/// custom claims the token carried.
async fn auth_debug(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Json<serde_json::Value> {
    let custom_claims = principal
        .claims
        .as_ref()
        .map(|claims| claims.extra.clone())
        .unwrap_or_default();
    Json(json!({
        "auth_mode": state.auth.mode.as_str(),
        "principal": principal,
        "custom_claims": custom_claims,
    }))
}

async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    match state.auth.authenticate(request.headers()).await {
        Ok(principal) => {
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        Err(error) => error.into_response(),
    }
}

/// Assemble the `/api` surface onto an existing router.
pub fn add_routes(router: Router, state: AppState) -> Router {
    let api = Router::new()
        .route("/device/:name/send_command", post(device::send_command))
        .route("/device/:name/send_commands", post(device::send_commands))
        .route("/raw/send_exec", post(device::send_raw_exec))
        .route("/raw/send_shell", post(device::send_raw_shell))
        .route("/job/:id", get(job::get_job))
        .route("/job/:id/abort", post(job::abort_job))
        .route("/inventory/export", get(inventory::export))
        .route("/inventory/export/raw", get(inventory::export_raw))
        .route("/inventory/fields", get(inventory::fields))
        .route("/inventory/filters", get(inventory::filters))
        .route("/inventory/:name", get(inventory::get_device))
        .route("/templates/match", get(templates::match_template))
        .route("/templates/:engine", get(templates::list))
        .route("/parse/test", post(templates::parse_test))
        .route("/credentials", get(monitoring::credentials))
        .route(
            "/cache",
            get(cache::list).delete(cache::invalidate_all),
        )
        .route(
            "/cache/:device",
            get(cache::list_device).delete(cache::invalidate_device),
        )
        .route("/monitoring/workers", get(monitoring::workers))
        .route("/monitoring/failures", get(monitoring::failures))
        .route("/monitoring/devices/:host", get(monitoring::device_stats))
        .route("/auth/debug", get(auth_debug))
        .layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .with_state(state);

    router.route("/", get(index)).nest("/api", api)
}
