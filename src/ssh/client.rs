//! SSH Client implementation using russh

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use tracing::{debug, info, warn};

use super::config::{AuthMethod, SshConfig};
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use super::known_hosts::{HostKeyVerification, KnownHostsStore};
use super::transport::{RemoteSession, SessionConnector};
use crate::config::Host;

/// One-shot SSH connect: handshake, host key check, authentication
pub struct SshClient {
    config: SshConfig,
    known_hosts: Arc<KnownHostsStore>,
}

impl SshClient {
    pub fn new(config: SshConfig, known_hosts: Arc<KnownHostsStore>) -> Self {
        Self {
            config,
            known_hosts,
        }
    }

    /// Connect and hand the authenticated Handle to an owner task
    pub async fn connect(self) -> Result<HandleController, SshError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!("Connecting to SSH server at {}", addr);

        let socket_addr = tokio::net::lookup_host(&addr)
            .await
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve address: {}", e)))?
            .next()
            .ok_or_else(|| SshError::ConnectionFailed("No address found".to_string()))?;

        let ssh_config = client::Config {
            // Liveness is handled by the pool heartbeat
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(
            self.config.host.clone(),
            self.config.port,
            self.config.strict_host_key_checking,
            self.known_hosts.clone(),
        );

        let mut handle = tokio::time::timeout(
            Duration::from_millis(self.config.timeout_ms),
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout("Connection timed out".to_string()))??;

        debug!("SSH handshake completed with {}", addr);

        let authenticated = match &self.config.auth {
            AuthMethod::Password { password } => handle
                .authenticate_password(&self.config.username, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())
                    .map_err(|e| SshError::KeyError(e.to_string()))?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

                handle
                    .authenticate_publickey(&self.config.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }

        info!("SSH authentication successful for {}@{}", self.config.username, addr);

        let label = format!("{}@{}", self.config.username, addr);
        Ok(spawn_handle_owner_task(handle, label))
    }
}

/// Client handler for russh callbacks (host key verification)
pub struct ClientHandler {
    host: String,
    port: u16,
    /// true: reject unknown keys; false: trust on first use and record them
    strict: bool,
    known_hosts: Arc<KnownHostsStore>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, strict: bool, known_hosts: Arc<KnownHostsStore>) -> Self {
        Self {
            host,
            port,
            strict,
            known_hosts,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match self
            .known_hosts
            .verify(&self.host, self.port, server_public_key)
        {
            HostKeyVerification::Verified => {
                debug!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            HostKeyVerification::Unknown { fingerprint } if self.strict => {
                warn!(
                    "Unknown host key for {}:{} (fingerprint: {}), strict mode rejects it",
                    self.host, self.port, fingerprint
                );
                Err(SshError::HostKeyRejected(format!(
                    "unknown host {}:{} with fingerprint {}",
                    self.host, self.port, fingerprint
                )))
            }
            HostKeyVerification::Unknown { fingerprint } => {
                info!(
                    "New host {}:{}, adding to known_hosts (fingerprint: {})",
                    self.host, self.port, fingerprint
                );
                if let Err(e) = self
                    .known_hosts
                    .add_host(&self.host, self.port, server_public_key)
                {
                    warn!("Failed to save host key: {}", e);
                }
                Ok(true)
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                warn!(
                    "HOST KEY CHANGED for {}:{}! Expected {}, got {}",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                );
                Err(SshError::HostKeyRejected(format!(
                    "key for {}:{} has changed (expected {}, got {})",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                )))
            }
        }
    }
}

/// russh-backed `SessionConnector` used by the connection pool
pub struct SshConnector {
    known_hosts: Arc<KnownHostsStore>,
    strict_host_key_checking: bool,
}

impl SshConnector {
    pub fn new(known_hosts: Arc<KnownHostsStore>, strict_host_key_checking: bool) -> Self {
        Self {
            known_hosts,
            strict_host_key_checking,
        }
    }
}

#[async_trait]
impl SessionConnector for SshConnector {
    async fn connect(&self, host: &Host) -> Result<Arc<dyn RemoteSession>, SshError> {
        let client = SshClient::new(
            host.ssh_config(self.strict_host_key_checking),
            self.known_hosts.clone(),
        );
        let controller = client.connect().await?;
        Ok(Arc::new(controller))
    }
}
