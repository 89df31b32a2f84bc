//! Configuration file types
//!
//! Serialized form of `hosts.json`. Credentials never live in the file;
//! hosts name the environment variables that carry them.

use serde::{Deserialize, Serialize};

use crate::ssh::{ConnectionPoolConfig, RetryConfig};

/// Current config file format version
pub const CONFIG_VERSION: u32 = 1;

/// Default HTTP listen address
pub const DEFAULT_LISTEN: &str = "127.0.0.1:7878";

/// Top-level config file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    #[serde(default = "default_version")]
    pub version: u32,

    /// HTTP listen address for the dashboard API
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Pool-wide behaviour (heartbeat, eager connect)
    #[serde(default)]
    pub pool: ConnectionPoolConfig,

    /// Retry configuration shared by hosts that don't override it
    #[serde(default)]
    pub retry: RetryConfig,

    /// known_hosts file; defaults to ~/.ssh/known_hosts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<String>,

    /// Reject unknown host keys instead of trusting them on first use
    #[serde(default)]
    pub strict_host_key_checking: bool,

    pub hosts: Vec<SavedHost>,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

/// One host entry as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedHost {
    pub id: String,

    /// Defaults to the id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub username: String,

    pub auth: SavedAuth,

    /// Per-host override of the shared retry configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

fn default_port() -> u16 {
    22
}

/// Credential references
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SavedAuth {
    /// Password read from an environment variable
    Password {
        #[serde(rename = "passwordEnv")]
        password_env: String,
    },

    /// Private key file, optional passphrase from an environment variable
    Key {
        #[serde(rename = "keyPath")]
        key_path: String,
        #[serde(
            rename = "passphraseEnv",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        passphrase_env: Option<String>,
    },
}
