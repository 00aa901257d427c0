//! The exec transport family: every command runs in its own SSH exec
//! channel. Suits hosts with a proper remote-exec subsystem (Linux boxes,
//! some NOSes); network devices that only offer an interactive CLI should
//! use the shell family instead.

use std::io::Read;
use std::time::Duration;

use switchboard_common::credentials::Credential;

use super::drivers::DriverProfile;
use super::{authenticate, map_io_error, Session, SessionTarget, Transport, TransportError};

pub struct ExecTransport;

impl Transport for ExecTransport {
    fn open(
        &self,
        target: &SessionTarget,
        credential: &Credential,
    ) -> Result<Box<dyn Session>, TransportError> {
        let session = authenticate(target, credential)?;
        Ok(Box::new(ExecSession {
            session,
            driver: target.driver.clone(),
            closed: false,
        }))
    }
}

struct ExecSession {
    session: ssh2::Session,
    driver: DriverProfile,
    closed: bool,
}

impl Session for ExecSession {
    fn send(&mut self, command: &str, timeout: Duration) -> Result<String, TransportError> {
        self.session.set_timeout(timeout.as_millis() as u32);

        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| map_io_error(command, &e))?;
        channel.exec(command).map_err(|e| map_io_error(command, &e))?;

        let mut output = String::new();
        channel
            .read_to_string(&mut output)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                    TransportError::Timeout {
                        command: command.to_owned(),
                    }
                }
                _ => TransportError::Session(e.to_string()),
            })?;

        let mut stderr = String::new();
        drop(channel.stderr().read_to_string(&mut stderr));
        drop(channel.wait_close());

        if let Some(marker) = self.driver.find_error_marker(&output) {
            return Err(TransportError::CommandRejected {
                command: command.to_owned(),
                detail: marker.to_owned(),
            });
        }
        // Hosts with real exit codes (the linux driver) report rejection on
        // stderr with a non-zero status.
        if let Ok(status) = channel.exit_status() {
            if status != 0 && !stderr.trim().is_empty() {
                return Err(TransportError::CommandRejected {
                    command: command.to_owned(),
                    detail: stderr.trim().to_owned(),
                });
            }
        }

        Ok(output)
    }

    fn close(&mut self) {
        if !self.closed {
            drop(self.session.disconnect(None, "closing session", None));
            self.closed = true;
        }
    }
}

impl Drop for ExecSession {
    fn drop(&mut self) {
        self.close();
    }
}
