//! The shell transport family: one interactive channel with a PTY, driven
//! by the driver profile's prompt regex. This is the path for network
//! operating systems whose CLI expects a human: command echo is stripped,
//! the pager is disabled once at session start, and output accumulates
//! until the prompt returns.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use switchboard_common::credentials::Credential;

use super::drivers::DriverProfile;
use super::{authenticate, Session, SessionTarget, Transport, TransportError};

// Granularity of the read loop; each blocking read gives up after this so
// the deadline can be checked.
const READ_SLICE: Duration = Duration::from_millis(500);

pub struct ShellTransport;

impl Transport for ShellTransport {
    fn open(
        &self,
        target: &SessionTarget,
        credential: &Credential,
    ) -> Result<Box<dyn Session>, TransportError> {
        let session = authenticate(target, credential)?;

        let mut channel = session
            .channel_session()
            .map_err(|e| TransportError::Session(e.message().to_owned()))?;
        channel
            .request_pty("vt100", None, Some((512, 64, 0, 0)))
            .map_err(|e| TransportError::Session(e.message().to_owned()))?;
        channel
            .shell()
            .map_err(|e| TransportError::Session(e.message().to_owned()))?;

        let mut shell = ShellSession {
            session,
            channel,
            driver: target.driver.clone(),
            closed: false,
        };

        // Swallow the login banner up to the first prompt, then turn the
        // pager off so multi-page output arrives in one piece.
        shell.read_until_prompt("login", Duration::from_secs(15))?;
        if let Some(pager_disable) = shell.driver.pager_disable.clone() {
            shell.write_line(&pager_disable)?;
            shell.read_until_prompt(&pager_disable, Duration::from_secs(15))?;
        }

        Ok(Box::new(shell))
    }
}

struct ShellSession {
    session: ssh2::Session,
    channel: ssh2::Channel,
    driver: DriverProfile,
    closed: bool,
}

impl ShellSession {
    fn write_line(&mut self, command: &str) -> Result<(), TransportError> {
        self.channel
            .write_all(format!("{}\n", command).as_bytes())
            .map_err(|e| TransportError::Session(e.to_string()))?;
        self.channel
            .flush()
            .map_err(|e| TransportError::Session(e.to_string()))?;
        Ok(())
    }

    /// Accumulate output until the driver prompt shows up at the tail, or
    /// the deadline passes.
    fn read_until_prompt(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<String, TransportError> {
        let deadline = Instant::now() + timeout;
        self.session.set_timeout(READ_SLICE.as_millis() as u32);

        let mut collected = String::new();
        let mut chunk = [0u8; 4096];
        loop {
            match self.channel.read(&mut chunk) {
                Ok(0) => {
                    // Remote closed the channel; whatever arrived is final.
                    return Ok(collected);
                }
                Ok(n) => {
                    collected.push_str(&String::from_utf8_lossy(&chunk[..n]));
                    if self.driver.prompt.is_match(&collected) {
                        return Ok(collected);
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                    ) => {}
                Err(e) => return Err(TransportError::Session(e.to_string())),
            }
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout {
                    command: command.to_owned(),
                });
            }
        }
    }

}

/// Drop the echoed command from the head and the prompt from the tail.
fn strip_echo_and_prompt(driver: &DriverProfile, command: &str, raw: &str) -> String {
    let mut lines: Vec<&str> = raw.lines().collect();
    if lines.first().is_some_and(|l| l.trim() == command.trim()) {
        lines.remove(0);
    }
    while lines
        .last()
        .is_some_and(|l| driver.prompt.is_match(l) || l.trim().is_empty())
    {
        lines.pop();
    }
    lines.join("\n")
}

impl Session for ShellSession {
    fn send(&mut self, command: &str, timeout: Duration) -> Result<String, TransportError> {
        self.write_line(command)?;
        let raw = self.read_until_prompt(command, timeout)?;
        let output = strip_echo_and_prompt(&self.driver, command, &raw);

        if let Some(marker) = self.driver.find_error_marker(&output) {
            return Err(TransportError::CommandRejected {
                command: command.to_owned(),
                detail: marker.to_owned(),
            });
        }
        Ok(output)
    }

    fn close(&mut self) {
        if !self.closed {
            drop(self.channel.close());
            drop(self.session.disconnect(None, "closing session", None));
            self.closed = true;
        }
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::drivers;

    #[test]
    fn echo_and_prompt_are_stripped() {
        let driver = drivers::profile("cisco_ios");
        let raw = "show version\nCisco IOS Software, Version 15.2\nUptime is 1 week\nrtr1#";
        assert_eq!(
            strip_echo_and_prompt(&driver, "show version", raw),
            "Cisco IOS Software, Version 15.2\nUptime is 1 week"
        );
    }

    #[test]
    fn output_without_echo_is_left_intact() {
        let driver = drivers::profile("cisco_ios");
        let raw = "Interface GigabitEthernet0/0 is up\nrtr1>";
        assert_eq!(
            strip_echo_and_prompt(&driver, "show interfaces", raw),
            "Interface GigabitEthernet0/0 is up"
        );
    }
}
