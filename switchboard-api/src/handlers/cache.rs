//! Cache inspection and invalidation, for operators.

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use switchboard_common::cache::CacheEntry;

use crate::api::ApiError;

use super::AppState;

/// What inspection shows per entry. Raw output is summarized by size, not
/// echoed back.
#[derive(Debug, Serialize)]
pub struct CacheEntrySummary {
    pub device: String,
    pub command: String,
    pub cached_at: i64,
    pub age_seconds: i64,
    pub ttl_s: u64,
    pub bytes: usize,
}

impl From<CacheEntry> for CacheEntrySummary {
    fn from(entry: CacheEntry) -> Self {
        Self {
            age_seconds: entry.age_seconds(),
            bytes: entry.raw_output.len(),
            device: entry.device,
            command: entry.command,
            cached_at: entry.cached_at,
            ttl_s: entry.ttl_s,
        }
    }
}

pub async fn list(
    State(state): State<AppState>,
) -> Result<Json<Vec<CacheEntrySummary>>, ApiError> {
    let entries = state.cache.list().await?;
    Ok(Json(entries.into_iter().map(Into::into).collect()))
}

pub async fn list_device(
    State(state): State<AppState>,
    Path(device): Path<String>,
) -> Result<Json<Vec<CacheEntrySummary>>, ApiError> {
    let entries = state.cache.list_device(&device).await?;
    Ok(Json(entries.into_iter().map(Into::into).collect()))
}

pub async fn invalidate_all(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let removed = state.cache.invalidate_all().await?;
    Ok(Json(json!({ "removed": removed })))
}

pub async fn invalidate_device(
    State(state): State<AppState>,
    Path(device): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let removed = state.cache.invalidate_device(&device).await?;
    Ok(Json(json!({ "removed": removed })))
}
