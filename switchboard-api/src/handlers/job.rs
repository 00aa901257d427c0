//! Job retrieval and retrieval-time parsing. Parsing happens here in the
//! controller, never in the worker: a completed job can be re-parsed with
//! different templates on any later poll, straight from its stored raw
//! output and metadata.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::warn;

use switchboard_common::job::{Job, JobStatus};
use switchboard_common::queue::QueueError;

use crate::api::{ApiError, JobResponse};
use crate::parser::Engine;

use super::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct JobQuery {
    pub parse: Option<bool>,
    pub parser: Option<String>,
    pub template: Option<String>,
    pub include_raw: Option<bool>,
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<JobQuery>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state.queue.poll(&id).await?;
    let parsed = parsed_output(&state, &job, Some(&query));
    Ok(Json(JobResponse::from_job(job).with_parsed(parsed)))
}

pub async fn abort_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    match state.queue.abort(&id).await {
        Ok(job) => Ok(Json(JobResponse::from_job(job))),
        Err(QueueError::InvalidTransition { from, .. }) => Err(ApiError::validation(format!(
            "job is {} and cannot be aborted",
            from
        ))),
        Err(error) => Err(error.into()),
    }
}

/// Settings for one command, after the field-by-field merge of per-command
/// spec > query override > request-level metadata.
struct EffectiveParse {
    parse: bool,
    parser: String,
    template: Option<String>,
    include_raw: bool,
}

/// Template-directed parsing of a completed job's output.
///
/// Returns `None` when nothing asked for parsing, or when the job is not
/// complete yet (logged at warning level; the response then carries raw
/// output only). Single-command jobs get the bare records; multi-command
/// jobs get a per-command map of parse envelopes.
pub(crate) fn parsed_output(
    state: &AppState,
    job: &Job,
    overrides: Option<&JobQuery>,
) -> Option<Value> {
    let metadata = &job.metadata;
    let request_parse = overrides
        .and_then(|q| q.parse)
        .unwrap_or(metadata.parse);
    let request_parser = overrides
        .and_then(|q| q.parser.clone())
        .or_else(|| metadata.parser.clone());
    let request_template = overrides
        .and_then(|q| q.template.clone())
        .or_else(|| metadata.template.clone());
    let request_include_raw = overrides
        .and_then(|q| q.include_raw)
        .unwrap_or(metadata.include_raw);

    let effective = |command: &str| -> EffectiveParse {
        let spec = metadata.commands.iter().find(|s| s.command == command);
        EffectiveParse {
            parse: spec.and_then(|s| s.parse).unwrap_or(request_parse),
            parser: spec
                .and_then(|s| s.parser.clone())
                .or_else(|| request_parser.clone())
                .unwrap_or_else(|| "textfsm".to_owned()),
            template: spec
                .and_then(|s| s.template.clone())
                .or_else(|| request_template.clone()),
            include_raw: spec.and_then(|s| s.include_raw).unwrap_or(request_include_raw),
        }
    };

    let wants_parsing = job
        .payload
        .commands
        .iter()
        .any(|command| effective(command).parse);
    if !wants_parsing {
        return None;
    }

    if job.status != JobStatus::Complete {
        warn!(
            job_id = %job.job_id,
            status = %job.status,
            "parse requested but the job is not complete; returning raw output only"
        );
        return None;
    }
    let result = job.result.as_ref()?;
    let platform = metadata.device_type.as_deref();
    let hostname = job.payload.host.as_str();

    let parse_one = |command: &str, output: &str| -> Value {
        let settings = effective(command);
        let run = || -> Result<Value, ApiError> {
            let engine: Engine = settings.parser.parse()?;
            let resolved = state.parser.resolve(
                engine,
                settings.template.as_deref(),
                None,
                Some(hostname),
                platform,
                Some(command),
            )?;
            let outcome = state
                .parser
                .run(engine, &resolved, output, settings.include_raw)?;
            Ok(outcome.envelope())
        };
        match run() {
            Ok(envelope) => envelope,
            Err(error) => json!({
                "error": error.kind.label(),
                "detail": error.detail,
            }),
        }
    };

    if result.data.len() == 1 {
        let (command, output) = result.data.iter().next()?;
        let envelope = parse_one(command, output.as_str().unwrap_or_default());
        // Single-command responses surface the records directly.
        return match envelope.get("parsed") {
            Some(parsed) => Some(parsed.clone()),
            None => Some(envelope),
        };
    }

    let mut by_command = Map::new();
    for (command, output) in &result.data {
        if !effective(command).parse {
            continue;
        }
        by_command.insert(
            command.clone(),
            parse_one(command, output.as_str().unwrap_or_default()),
        );
    }
    Some(Value::Object(by_command))
}
