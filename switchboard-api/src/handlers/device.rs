//! Command submission endpoints: inventory-resolved devices and the raw
//! adapter bypasses.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::Map;

use switchboard_common::error::ErrorKind;
use switchboard_common::job::{
    Adapter, CommandSpec, CredentialRef, JobMetadata, JobPayload, JobStatus,
};

use crate::api::{raw_output_body, ApiError, JobResponse};
use crate::inventory::DeviceDescriptor;

use super::job::parsed_output;
use super::AppState;

/// Options shared by all submission endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendCommandRequest {
    pub command: Option<String>,
    pub commands: Option<Vec<CommandItem>>,
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub raw_output: bool,
    pub timeout: Option<u64>,
    pub use_cache: Option<bool>,
    pub cache_ttl: Option<u64>,
    #[serde(default)]
    pub cache_refresh: bool,
    #[serde(default)]
    pub parse: bool,
    pub parser: Option<String>,
    pub template: Option<String>,
    #[serde(default)]
    pub include_raw: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub retries: Option<u32>,
    pub max_queue_wait: Option<u64>,
}

/// Multi-command entries: plain strings or full per-command specs.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CommandItem {
    Plain(String),
    Spec(CommandSpec),
}

impl CommandItem {
    fn into_spec(self) -> CommandSpec {
        match self {
            CommandItem::Plain(command) => CommandSpec {
                command,
                ..Default::default()
            },
            CommandItem::Spec(spec) => spec,
        }
    }
}

impl SendCommandRequest {
    /// Pull the command list out of whichever field the endpoint used.
    fn command_specs(&self) -> Result<Vec<CommandSpec>, ApiError> {
        let specs: Vec<CommandSpec> = match (&self.command, &self.commands) {
            (Some(command), None) => vec![CommandSpec {
                command: command.clone(),
                ..Default::default()
            }],
            (None, Some(items)) => items.iter().cloned().map(CommandItem::into_spec).collect(),
            (Some(_), Some(_)) => {
                return Err(ApiError::validation(
                    "provide either command or commands, not both",
                ))
            }
            (None, None) => Vec::new(),
        };
        if specs.is_empty() {
            return Err(ApiError::validation("commands list must not be empty"));
        }
        if specs.iter().any(|spec| spec.command.trim().is_empty()) {
            return Err(ApiError::validation("commands must not be blank"));
        }
        Ok(specs)
    }

    fn credential_override(&self) -> Result<Option<(String, String)>, ApiError> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => {
                Ok(Some((username.clone(), password.clone())))
            }
            (None, None) => Ok(None),
            _ => Err(ApiError::validation(
                "username and password must be supplied together",
            )),
        }
    }
}

pub async fn send_command(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<SendCommandRequest>,
) -> Response {
    submit_for_device(state, name, request).await
}

pub async fn send_commands(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<SendCommandRequest>,
) -> Response {
    submit_for_device(state, name, request).await
}

async fn submit_for_device(
    state: AppState,
    name: String,
    request: SendCommandRequest,
) -> Response {
    let descriptor = match state.inventory.get_device(&name).await {
        Ok(descriptor) => descriptor,
        Err(error) => return ApiError::from(error).into_response(),
    };
    let device_type = Some(descriptor.adapter_driver.clone());
    submit(state, descriptor, device_type, request).await
}

/// Inline request for the inventory-bypassing raw endpoints.
#[derive(Debug, Deserialize)]
pub struct RawSendRequest {
    pub host: String,
    pub port: Option<u16>,
    pub driver: String,
    pub username: String,
    pub password: String,
    #[serde(flatten)]
    pub options: SendCommandRequest,
}

pub async fn send_raw_exec(
    State(state): State<AppState>,
    Json(request): Json<RawSendRequest>,
) -> Response {
    submit_raw(state, request, Adapter::Exec).await
}

pub async fn send_raw_shell(
    State(state): State<AppState>,
    Json(request): Json<RawSendRequest>,
) -> Response {
    submit_raw(state, request, Adapter::Shell).await
}

async fn submit_raw(state: AppState, request: RawSendRequest, adapter: Adapter) -> Response {
    let descriptor = DeviceDescriptor {
        host: request.host,
        port: request.port.unwrap_or(22),
        adapter,
        adapter_driver: request.driver.clone(),
        credential_id: String::new(),
        adapter_options: Map::new(),
    };
    let mut options = request.options;
    options.username = Some(request.username);
    options.password = Some(request.password);
    submit(state, descriptor, Some(request.driver), options).await
}

/// The common submission path: validate, build the envelope, enqueue, and
/// answer synchronously or with a pollable handle.
async fn submit(
    state: AppState,
    descriptor: DeviceDescriptor,
    device_type: Option<String>,
    request: SendCommandRequest,
) -> Response {
    match try_submit(state, descriptor, device_type, &request).await {
        Ok(response) => response,
        Err(error) if request.raw_output => error.into_plain_response(),
        Err(error) => error.into_response(),
    }
}

async fn try_submit(
    state: AppState,
    descriptor: DeviceDescriptor,
    device_type: Option<String>,
    request: &SendCommandRequest,
) -> Result<Response, ApiError> {
    let specs = request.command_specs()?;
    if request.raw_output && !request.wait {
        return Err(ApiError::validation("raw_output requires wait=true"));
    }

    let credential_ref = match request.credential_override()? {
        Some((username, password)) => CredentialRef::Inline { username, password },
        None => {
            if descriptor.credential_id.is_empty() {
                return Err(ApiError::validation(
                    "device has no credential_id; supply username and password",
                ));
            }
            CredentialRef::Id(descriptor.credential_id.clone())
        }
    };

    let config = &state.config;
    let use_cache = config.cache_enabled && request.use_cache.unwrap_or(false);
    // Over-limit TTLs are clamped, never rejected.
    let cache_ttl = request.cache_ttl.map(|ttl| ttl.min(config.cache_max_ttl_s));

    let payload = JobPayload {
        host: descriptor.host,
        port: descriptor.port,
        adapter: descriptor.adapter,
        adapter_driver: descriptor.adapter_driver,
        commands: specs.iter().map(|spec| spec.command.clone()).collect(),
        credential_ref,
        adapter_options: descriptor.adapter_options,
        retries_remaining: request.retries.unwrap_or(config.default_retries),
        max_queue_wait_s: request
            .max_queue_wait
            .unwrap_or(config.default_max_queue_wait_s),
        timeout_s: request.timeout.unwrap_or(config.default_timeout_s),
        use_cache,
        cache_refresh: request.cache_refresh && config.cache_enabled,
        cache_ttl,
    };
    let metadata = JobMetadata {
        device_type,
        commands: specs,
        parse: request.parse,
        parser: request.parser.clone(),
        template: request.template.clone(),
        include_raw: request.include_raw,
    };

    let job_id = state.queue.enqueue(payload, metadata).await?;

    if !request.wait {
        let job = state.queue.poll(&job_id).await?;
        return Ok(Json(JobResponse::from_job(job)).into_response());
    }

    let deadline = Duration::from_secs(request.timeout.unwrap_or(config.default_timeout_s));
    let job = state.queue.wait(&job_id, deadline).await?;

    if !job.status.is_terminal() {
        // The deadline fired first. The job is not cancelled: it stays
        // visible to later polls and may still complete.
        return Err(ApiError::new(
            ErrorKind::TimeoutError,
            format!("job {} did not finish within {}s", job_id, deadline.as_secs()),
        ));
    }

    if request.raw_output {
        return Ok(match (&job.status, &job.error) {
            (JobStatus::Complete, _) => raw_output_body(&job).into_response(),
            (_, Some(error)) => {
                ApiError::new(error.kind, error.message.clone()).into_plain_response()
            }
            (status, None) => {
                ApiError::internal(format!("job ended {} without error detail", status))
                    .into_plain_response()
            }
        });
    }

    let parsed = parsed_output(&state, &job, None);
    Ok(Json(JobResponse::from_job(job).with_parsed(parsed)).into_response())
}
