//! Template listing, dry-run selection and ad-hoc parse testing.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::ApiError;
use crate::parser::{Engine, TemplateListing};

use super::AppState;

pub async fn list(
    State(state): State<AppState>,
    Path(engine): Path<String>,
) -> Result<Json<Vec<TemplateListing>>, ApiError> {
    let engine: Engine = engine.parse()?;
    Ok(Json(state.parser.list(engine)))
}

#[derive(Debug, Deserialize)]
pub struct MatchQuery {
    pub engine: Option<String>,
    pub hostname: Option<String>,
    pub platform: String,
    pub command: String,
}

/// Report which template auto-selection would pick for a device's
/// platform/command pair, without parsing anything.
pub async fn match_template(
    State(state): State<AppState>,
    Query(query): Query<MatchQuery>,
) -> Result<Json<Value>, ApiError> {
    let engine: Engine = query.engine.as_deref().unwrap_or("textfsm").parse()?;
    let (template, source) = state.parser.find_template(
        engine,
        query.hostname.as_deref(),
        &query.platform,
        &query.command,
    )?;
    Ok(Json(json!({
        "engine": engine,
        "template": template,
        "source": source,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ParseTestRequest {
    pub engine: Option<String>,
    pub template: Option<String>,
    /// Inline template text; hierarchical engine only.
    pub text: Option<String>,
    pub hostname: Option<String>,
    pub platform: Option<String>,
    pub command: Option<String>,
    pub raw: String,
    #[serde(default)]
    pub include_raw: bool,
}

/// Parse arbitrary text against a chosen template, for template authors.
pub async fn parse_test(
    State(state): State<AppState>,
    Json(request): Json<ParseTestRequest>,
) -> Result<Json<Value>, ApiError> {
    let engine: Engine = request.engine.as_deref().unwrap_or("textfsm").parse()?;
    let resolved = state.parser.resolve(
        engine,
        request.template.as_deref(),
        request.text.as_deref(),
        request.hostname.as_deref(),
        request.platform.as_deref(),
        request.command.as_deref(),
    )?;
    let outcome = state
        .parser
        .run(engine, &resolved, &request.raw, request.include_raw)?;
    Ok(Json(outcome.envelope()))
}
