//! Transport seam between the connection pool and SSH
//!
//! The pool only sees two capabilities: a connector that produces an
//! authenticated session for a host, and a session that can run a command on
//! a fresh channel, answer a keepalive probe and report its own closure.
//! `ssh::client::SshConnector` is the russh-backed implementation.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use super::error::SshError;
use super::handle_owner::PingResult;
use crate::config::Host;

/// Raw output of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

/// One live authenticated session; commands get their own channels
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Open a channel, run `command`, collect output until the channel closes.
    ///
    /// Returns `SshError::Disconnected` when the session itself is gone and
    /// `SshError::ChannelError` when only this channel failed.
    async fn exec(&self, command: &str) -> Result<ExecOutput, SshError>;

    /// Keepalive probe
    async fn ping(&self) -> PingResult;

    /// Closure signal; flips to `true` once and stays there
    fn closed(&self) -> watch::Receiver<bool>;

    fn is_closed(&self) -> bool;

    /// Tear the session down
    async fn disconnect(&self);
}

/// Establishes sessions
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Handshake + authenticate. The caller bounds this with its own timeout.
    async fn connect(&self, host: &Host) -> Result<Arc<dyn RemoteSession>, SshError>;
}

/// Resolve once `rx` reports closure (or its sender is gone)
pub async fn wait_closed(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}
