//! Device transport adapters: a uniform `open -> send -> close` capability
//! over two SSH session families. `exec` runs each command in its own exec
//! channel; `shell` drives one interactive channel with driver-directed
//! prompt matching. Both block, and are driven from `spawn_blocking` by the
//! worker.

pub mod drivers;
pub mod exec;
pub mod shell;

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use switchboard_common::credentials::Credential;
use switchboard_common::job::{Adapter, JobPayload};

use drivers::DriverProfile;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("hostname {0} did not resolve")]
    Resolve(String),
    #[error("could not reach {host}:{port}: {detail}")]
    Connect {
        host: String,
        port: u16,
        detail: String,
    },
    #[error("device rejected authentication: {0}")]
    AuthFailure(String),
    #[error("device rejected command {command:?}: {detail}")]
    CommandRejected { command: String, detail: String },
    #[error("command {command:?} timed out")]
    Timeout { command: String },
    #[error("ssh session error: {0}")]
    Session(String),
    #[error("execution cancelled")]
    Cancelled,
}

/// Connection coordinates plus the driver profile, resolved from a job
/// payload before handing off to the blocking side.
#[derive(Debug, Clone)]
pub struct SessionTarget {
    pub host: String,
    pub port: u16,
    pub driver: DriverProfile,
    pub connect_timeout: Duration,
}

impl SessionTarget {
    pub fn from_payload(payload: &JobPayload) -> Self {
        // adapter_options may override the connect timeout; everything else
        // in the mapping is passed through for driver-specific use.
        let connect_timeout = payload
            .adapter_options
            .get("connect_timeout_s")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(15));
        Self {
            host: payload.host.clone(),
            port: payload.port,
            driver: drivers::profile(&payload.adapter_driver),
            connect_timeout,
        }
    }
}

/// An open session against one device. Commands run strictly in call order.
pub trait Session: Send {
    fn send(&mut self, command: &str, timeout: Duration) -> Result<String, TransportError>;
    /// Idempotent.
    fn close(&mut self);
}

pub trait Transport: Send + Sync {
    fn open(
        &self,
        target: &SessionTarget,
        credential: &Credential,
    ) -> Result<Box<dyn Session>, TransportError>;
}

/// The two statically-linked transport families, picked per job.
#[derive(Clone)]
pub struct TransportSet {
    pub exec: Arc<dyn Transport>,
    pub shell: Arc<dyn Transport>,
}

impl TransportSet {
    pub fn ssh() -> Self {
        Self {
            exec: Arc::new(exec::ExecTransport),
            shell: Arc::new(shell::ShellTransport),
        }
    }

    pub fn for_adapter(&self, adapter: Adapter) -> Arc<dyn Transport> {
        match adapter {
            Adapter::Exec => self.exec.clone(),
            Adapter::Shell => self.shell.clone(),
        }
    }
}

/// TCP connect + SSH handshake + password auth, shared by both families.
pub(crate) fn authenticate(
    target: &SessionTarget,
    credential: &Credential,
) -> Result<ssh2::Session, TransportError> {
    let address = format!("{}:{}", target.host, target.port);
    let mut addresses = address
        .to_socket_addrs()
        .map_err(|_| TransportError::Resolve(target.host.clone()))?;
    let addr = addresses
        .next()
        .ok_or_else(|| TransportError::Resolve(target.host.clone()))?;

    let stream =
        TcpStream::connect_timeout(&addr, target.connect_timeout).map_err(|e| {
            TransportError::Connect {
                host: target.host.clone(),
                port: target.port,
                detail: e.to_string(),
            }
        })?;

    let mut session = ssh2::Session::new().map_err(|e| TransportError::Session(e.to_string()))?;
    session.set_tcp_stream(stream);
    session
        .handshake()
        .map_err(|e| TransportError::Connect {
            host: target.host.clone(),
            port: target.port,
            detail: e.to_string(),
        })?;

    session
        .userauth_password(&credential.username, credential.password.expose())
        .map_err(|e| TransportError::AuthFailure(e.message().to_owned()))?;
    if !session.authenticated() {
        return Err(TransportError::AuthFailure(
            "authentication did not complete".to_owned(),
        ));
    }

    Ok(session)
}

/// Map an ssh2 error during command I/O to the taxonomy. libssh2 reports
/// its read timeout as error code -9.
pub(crate) fn map_io_error(command: &str, error: &ssh2::Error) -> TransportError {
    match error.code() {
        ssh2::ErrorCode::Session(-9) => TransportError::Timeout {
            command: command.to_owned(),
        },
        _ => TransportError::Session(error.message().to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use switchboard_common::job::CredentialRef;

    #[test]
    fn session_target_honors_option_overrides() {
        let mut options = Map::new();
        options.insert(
            "connect_timeout_s".to_string(),
            serde_json::Value::from(3u64),
        );
        let payload = JobPayload {
            host: "rtr1".to_string(),
            port: 2222,
            adapter: Adapter::Shell,
            adapter_driver: "cisco_ios".to_string(),
            commands: vec![],
            credential_ref: CredentialRef::Id("lab".to_string()),
            adapter_options: options,
            retries_remaining: 0,
            max_queue_wait_s: 0,
            timeout_s: 30,
            use_cache: false,
            cache_refresh: false,
            cache_ttl: None,
        };

        let target = SessionTarget::from_payload(&payload);
        assert_eq!(target.port, 2222);
        assert_eq!(target.connect_timeout, Duration::from_secs(3));
        assert_eq!(target.driver.name, "cisco_ios");
    }
}
