//! Host Registry
//!
//! The fixed set of compute hosts reachable over SSH. Built once at startup
//! from the config file and never mutated afterwards.

use serde::Serialize;

use crate::ssh::{AuthKind, AuthMethod, RetryConfig, SshConfig};

/// One reachable host, with credentials already resolved
#[derive(Debug, Clone)]
pub struct Host {
    /// Stable key (`alpha`, `beta`, ...)
    pub id: String,
    pub display_name: String,
    pub address: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
    /// Retry configuration in effect for this host
    pub retry: RetryConfig,
}

impl Host {
    /// Handshake parameters for this host
    pub fn ssh_config(&self, strict_host_key_checking: bool) -> SshConfig {
        SshConfig {
            host: self.address.clone(),
            port: self.port,
            username: self.username.clone(),
            auth: self.auth.clone(),
            timeout_ms: self.retry.timeout_ms,
            strict_host_key_checking,
        }
    }

    /// Static identity, safe to hand to the UI
    pub fn info(&self) -> HostInfo {
        HostInfo {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            address: self.address.clone(),
            port: self.port,
            username: self.username.clone(),
            auth: self.auth.kind(),
        }
    }
}

/// Host identity as shown on the dashboard (no credentials)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    pub id: String,
    pub display_name: String,
    pub address: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthKind,
}

/// Ordered, immutable host set
#[derive(Debug, Clone, Default)]
pub struct HostRegistry {
    hosts: Vec<Host>,
}

impl HostRegistry {
    /// Build a registry, rejecting duplicate ids
    pub fn new(hosts: Vec<Host>) -> Result<Self, String> {
        for (idx, host) in hosts.iter().enumerate() {
            if host.id.trim().is_empty() {
                return Err(format!("host #{} has an empty id", idx + 1));
            }
            if hosts[..idx].iter().any(|h| h.id == host.id) {
                return Err(format!("duplicate host id: {}", host.id));
            }
        }
        Ok(Self { hosts })
    }

    pub fn get(&self, id: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.id == id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.hosts.iter().map(|h| h.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

impl IntoIterator for HostRegistry {
    type Item = Host;
    type IntoIter = std::vec::IntoIter<Host>;

    fn into_iter(self) -> Self::IntoIter {
        self.hosts.into_iter()
    }
}
