//! Handle Owner Task
//!
//! This module implements the "single owner" pattern for SSH Handle.
//!
//! # Architecture
//!
//! Only one task owns the `Handle<ClientHandler>`. All other components
//! communicate with it via `HandleController` which sends commands through
//! an mpsc channel. Every `execute()` opens its own session channel through
//! the controller, so concurrent commands share one authenticated connection.
//!
//! This avoids:
//! - `Arc<Mutex<Handle>>` lock contention
//! - Deadlocks from holding locks across `.await`
//! - Protocol violations from concurrent Handle access
//!
//! When the owner task exits (remote close, keepalive death, explicit
//! disconnect) the `closed` watch flips to `true` and queued requests are
//! answered with `Disconnected`.

use std::time::Duration;

use async_trait::async_trait;
use russh::client::{Handle, Msg};
use russh::{Channel, ChannelMsg};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;
use super::transport::{ExecOutput, RemoteSession};

/// How often the owner task checks whether russh has closed the transport
pub(crate) const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Keepalive reply timeout
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Ping result, distinguishing failure causes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    /// Connection is fine
    Ok,
    /// No reply in time (network latency, may recover)
    Timeout,
    /// Transport is gone; reconnect now
    IoError,
}

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (for exec)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Ping the connection (for keepalive check)
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },

    /// Ask whether russh has closed the transport; the owner exits if so
    CheckClosed { reply_tx: oneshot::Sender<bool> },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning is cheap (an mpsc sender plus a watch receiver). Any holder can
/// open channels or disconnect the session, so it never leaves the process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    closed_rx: watch::Receiver<bool>,
}

impl HandleController {
    #[cfg(test)]
    pub(crate) fn new(cmd_tx: mpsc::Sender<HandleCommand>, closed_rx: watch::Receiver<bool>) -> Self {
        Self { cmd_tx, closed_rx }
    }

    /// Open a session channel
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| match e {
                russh::Error::Disconnect => SshError::Disconnected,
                other => SshError::ChannelError(other.to_string()),
            })
    }

    /// Disconnect the SSH connection
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Ping the connection (for keepalive check)
    pub async fn ping(&self) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(HandleCommand::Ping { reply_tx }).await.is_err() {
            return PingResult::IoError;
        }
        reply_rx.await.unwrap_or(PingResult::IoError)
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed() && !*self.closed_rx.borrow()
    }

    /// Ask the owner whether the transport is still up.
    ///
    /// `is_connected` lags a dropped transport by up to one close poll; the
    /// owner holds the Handle and sees it immediately.
    pub async fn transport_alive(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(HandleCommand::CheckClosed { reply_tx })
            .await
            .is_err()
        {
            return false;
        }
        matches!(reply_rx.await, Ok(false))
    }
}

#[async_trait]
impl RemoteSession for HandleController {
    async fn exec(&self, command: &str) -> Result<ExecOutput, SshError> {
        let mut channel = self.open_session_channel().await?;

        if let Err(e) = channel.exec(true, command).await {
            return Err(self.channel_failure(format!("exec request failed: {}", e)).await);
        }

        match collect_output(&mut channel).await {
            Ok(output) => Ok(output),
            Err(msg) => Err(self.channel_failure(msg).await),
        }
    }

    async fn ping(&self) -> PingResult {
        HandleController::ping(self).await
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    fn is_closed(&self) -> bool {
        !self.is_connected()
    }

    async fn disconnect(&self) {
        HandleController::disconnect(self).await
    }
}

impl HandleController {
    /// A channel failure on a dead session is a session failure
    async fn channel_failure(&self, msg: String) -> SshError {
        if self.transport_alive().await {
            SshError::ChannelError(msg)
        } else {
            SshError::Disconnected
        }
    }
}

/// Source of channel messages; `None` once the channel is gone
#[async_trait]
trait ChannelMessages: Send {
    async fn next_msg(&mut self) -> Option<ChannelMsg>;
}

#[async_trait]
impl ChannelMessages for Channel<Msg> {
    async fn next_msg(&mut self) -> Option<ChannelMsg> {
        self.wait().await
    }
}

/// Drain a channel until it closes, gathering stdout/stderr and exit status
async fn collect_output<C: ChannelMessages>(channel: &mut C) -> Result<ExecOutput, String> {
    let mut output = ExecOutput::default();
    let mut exit_code: Option<i32> = None;

    while let Some(msg) = channel.next_msg().await {
        match msg {
            ChannelMsg::Data { data } => output.stdout.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, ext } => {
                // ext 1 = stderr
                if ext == 1 {
                    output.stderr.extend_from_slice(&data);
                }
            }
            ChannelMsg::ExitStatus { exit_status } => {
                exit_code = Some(exit_status as i32);
            }
            ChannelMsg::ExitSignal { signal_name, .. } => {
                debug!("Remote command terminated by signal {:?}", signal_name);
                exit_code.get_or_insert(-1);
            }
            ChannelMsg::Eof => {}
            ChannelMsg::Close => break,
            _ => {}
        }
    }

    match exit_code {
        Some(code) => {
            output.exit_code = code;
            Ok(output)
        }
        None => Err("channel closed without exit status".to_string()),
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes ownership of the Handle and returns a HandleController for sending commands.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    session_label: String,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (closed_tx, closed_rx) = watch::channel(false);

    tokio::spawn(async move {
        let handle = handle; // Move into task, becomes sole owner
        let mut close_poll = tokio::time::interval(CLOSE_POLL_INTERVAL);
        close_poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("Handle owner task started for {}", session_label);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        info!("All controllers dropped for {}", session_label);
                        break;
                    };

                    match cmd {
                        HandleCommand::ChannelOpenSession { reply_tx } => {
                            let result = handle.channel_open_session().await;
                            if reply_tx.send(result).is_err() {
                                // Channel is dropped here; the server closes it
                                warn!("Caller dropped before receiving channel_open_session result");
                            }
                        }

                        HandleCommand::Ping { reply_tx } => {
                            // keepalive@openssh.com with want_reply=true
                            let result = match tokio::time::timeout(
                                PING_TIMEOUT,
                                handle.send_keepalive(true),
                            )
                            .await
                            {
                                Ok(Ok(())) => PingResult::Ok,
                                Ok(Err(russh::Error::Disconnect)) => {
                                    warn!("Keepalive found {} disconnected", session_label);
                                    PingResult::IoError
                                }
                                Ok(Err(e)) => {
                                    warn!("Keepalive error for {} (soft failure): {:?}", session_label, e);
                                    PingResult::Timeout
                                }
                                Err(_) => {
                                    warn!("Keepalive timeout for {} ({:?})", session_label, PING_TIMEOUT);
                                    PingResult::Timeout
                                }
                            };
                            let _ = reply_tx.send(result);
                        }

                        HandleCommand::CheckClosed { reply_tx } => {
                            let closed = handle.is_closed();
                            let _ = reply_tx.send(closed);
                            if closed {
                                warn!("Transport closed for {}", session_label);
                                break;
                            }
                        }

                        HandleCommand::Disconnect => {
                            info!("Disconnect requested for {}", session_label);
                            break;
                        }
                    }
                }

                _ = close_poll.tick() => {
                    if handle.is_closed() {
                        warn!("Transport closed for {}", session_label);
                        break;
                    }
                }
            }
        }

        // Cleanup: announce closure first so in-flight commands fail fast
        closed_tx.send_replace(true);
        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for {}", session_label);
    });

    HandleController { cmd_tx, closed_rx }
}

/// Drain all pending commands, returning Disconnected error to each
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::CheckClosed { reply_tx } => {
                let _ = reply_tx.send(true);
            }
            HandleCommand::Disconnect => {}
        }
    }
}
