//! Inventory surface: descriptor lookup and filtered exports.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde_json::Value;

use crate::api::ApiError;
use crate::inventory::{DeviceDescriptor, DeviceFilter, NamedDescriptor};

use super::AppState;

/// Query parameters become the filter: `filter=<name>` selects a named
/// filter (replacing everything else), any other key is an inline
/// field-to-regex constraint.
fn filter_from_query(params: HashMap<String, String>) -> DeviceFilter {
    let mut filter = DeviceFilter::default();
    for (key, value) in params {
        if key == "filter" {
            filter.named = Some(value);
        } else {
            filter.fields.push((key, value));
        }
    }
    filter
}

pub async fn get_device(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<DeviceDescriptor>, ApiError> {
    Ok(Json(state.inventory.get_device(&name).await?))
}

pub async fn export(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<NamedDescriptor>>, ApiError> {
    let filter = filter_from_query(params);
    Ok(Json(state.inventory.list_devices(&filter).await?))
}

pub async fn export_raw(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let filter = filter_from_query(params);
    Ok(Json(state.inventory.list_raw(&filter).await?))
}

pub async fn fields(State(state): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.inventory.filterable_fields().await?))
}

pub async fn filters(
    State(state): State<AppState>,
) -> Result<Json<std::collections::BTreeMap<String, String>>, ApiError> {
    Ok(Json(state.inventory.named_filters().await?))
}
