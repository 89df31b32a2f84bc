//! Command execution over pooled sessions
//!
//! Every call opens its own channel on the host's shared session, so commands
//! on one host run concurrently and finish in any order. The call's timeout
//! covers waiting for a session as well as the command itself; hitting it
//! abandons this command only and leaves the session alone.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::connection_registry::{ConnectionRegistryError, HostConnectionRegistry};
use super::error::SshError;
use super::handle_owner::CLOSE_POLL_INTERVAL;
use super::transport::wait_closed;

/// Result of one remote command. A non-zero exit code is a normal result.
///
/// Output is text: bytes that are not valid UTF-8 are replaced with U+FFFD.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

#[derive(Clone)]
pub struct CommandExecutor {
    registry: Arc<HostConnectionRegistry>,
}

impl CommandExecutor {
    pub fn new(registry: Arc<HostConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<HostConnectionRegistry> {
        &self.registry
    }

    /// Run `command` on `host_id`
    ///
    /// `timeout` defaults to the host's `RetryConfig.timeoutMs`.
    pub async fn execute(
        &self,
        host_id: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandResult, ConnectionRegistryError> {
        let entry = self.registry.get_connection(host_id)?;
        let timeout = timeout.unwrap_or_else(|| entry.retry_config().timeout());
        let timeout_ms = timeout.as_millis() as u64;
        let started = Instant::now();
        let deadline = started + timeout;

        let (session, cancel) = self
            .registry
            .acquire_session(host_id, deadline, timeout_ms)
            .await?;

        debug!("Executing on {} (session {}): {}", host_id, session.id, command);

        let closed = session.remote.closed();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ConnectionRegistryError::Cancelled),
            result = tokio::time::timeout_at(deadline, session.remote.exec(command)) => match result {
                Ok(result) => result,
                Err(_) => {
                    warn!("Command on {} timed out after {}ms", host_id, timeout_ms);
                    return Err(ConnectionRegistryError::Timeout { timeout_ms });
                }
            },
            _ = wait_closed(closed) => Err(SshError::Disconnected),
        };

        match outcome {
            Ok(output) => Ok(CommandResult {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.exit_code,
                duration_ms: started.elapsed().as_millis() as u64,
            }),
            Err(SshError::ChannelError(msg)) => {
                // A dying transport can fail its channels before it reports
                // closure; give the close signal one poll interval to land.
                let grace = (Instant::now() + CLOSE_POLL_INTERVAL).min(deadline);
                let close_seen =
                    tokio::time::timeout_at(grace, wait_closed(session.remote.closed()))
                        .await
                        .is_ok();
                if cancel.is_cancelled() {
                    return Err(ConnectionRegistryError::Cancelled);
                }
                if !close_seen {
                    // Only this channel failed; the session stays up
                    warn!("Channel error on {}: {}", host_id, msg);
                    return Err(ConnectionRegistryError::ChannelError(msg));
                }
                let reason = format!("session closed: {}", msg);
                self.registry.report_session_lost(host_id, session.id, &reason);
                Err(ConnectionRegistryError::ConnectionLost(reason))
            }
            Err(e) => {
                let reason = e.to_string();
                self.registry.report_session_lost(host_id, session.id, &reason);
                Err(ConnectionRegistryError::ConnectionLost(reason))
            }
        }
    }
}
