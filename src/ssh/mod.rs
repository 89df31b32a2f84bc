//! SSH module - pooled, reconnecting sessions to the configured hosts
//!
//! This module provides the core SSH functionality using russh library.
//!
//! # Features
//! - One authenticated session per host, owned by a single task
//! - Connection registry with backoff, retry budget and manual controls
//! - Keepalive heartbeat and remote-close detection
//! - Host key verification via ~/.ssh/known_hosts
//! - Command execution on independent channels over the shared session

mod client;
mod config;
pub mod connection_registry;
mod error;
pub mod exec;
mod handle_owner;
pub mod known_hosts;
pub mod retry;
pub mod transport;

pub use client::{ClientHandler, SshClient, SshConnector};
pub use config::{AuthKind, AuthMethod, SshConfig};
pub use connection_registry::{
    ConnectionEntry, ConnectionPoolConfig, ConnectionPoolStats, ConnectionRegistryError,
    ConnectionState, HostConnectionRegistry, HostStatus, LiveSession,
};
pub use error::{ErrorKind, SshError};
pub use exec::{CommandExecutor, CommandResult};
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController, PingResult};
pub use known_hosts::{HostKeyVerification, KnownHostsStore};
pub use retry::{calculate_backoff, RetryConfig, RetryPolicy};
pub use transport::{ExecOutput, RemoteSession, SessionConnector};
