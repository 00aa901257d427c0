//! Operational endpoints: worker presence, the recent-failure stream,
//! per-device counters and credential-id listing.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use switchboard_common::monitor::{DeviceStats, FailureRecord, WorkerStatus};

use crate::api::ApiError;

use super::AppState;

const CREDENTIAL_LIST_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn workers(
    State(state): State<AppState>,
) -> Result<Json<Vec<WorkerStatus>>, ApiError> {
    Ok(Json(state.monitor.list_workers().await?))
}

#[derive(Debug, Deserialize)]
pub struct FailuresQuery {
    pub limit: Option<usize>,
}

pub async fn failures(
    State(state): State<AppState>,
    Query(query): Query<FailuresQuery>,
) -> Result<Json<Vec<FailureRecord>>, ApiError> {
    let limit = query.limit.unwrap_or(50).min(200);
    Ok(Json(state.monitor.recent_failures(limit).await?))
}

pub async fn device_stats(
    State(state): State<AppState>,
    Path(host): Path<String>,
) -> Result<Json<DeviceStats>, ApiError> {
    Ok(Json(state.monitor.device_stats(&host).await?))
}

/// Credential ids only; values never leave the credential plugin.
pub async fn credentials(
    State(state): State<AppState>,
) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(
        state.credentials.list_ids(CREDENTIAL_LIST_TIMEOUT).await?,
    ))
}
