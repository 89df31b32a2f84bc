//! SSH Configuration

use std::fmt;

use serde::{Deserialize, Serialize};

/// Parameters for one SSH handshake
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Remote host address
    pub host: String,

    /// SSH port
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Handshake + authentication timeout in milliseconds
    pub timeout_ms: u64,

    /// Strict host key checking
    /// - true: reject connections to unknown hosts
    /// - false: trust on first use, still reject changed keys
    pub strict_host_key_checking: bool,
}

/// Authentication material, resolved from the environment at startup
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// SSH key authentication
    Key {
        /// Path to private key file
        key_path: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            key_path: key_path.into(),
            passphrase,
        }
    }

    /// Short label for logs and the diagnostics view
    pub fn kind(&self) -> AuthKind {
        match self {
            AuthMethod::Password { .. } => AuthKind::Password,
            AuthMethod::Key { .. } => AuthKind::Key,
        }
    }
}

// Secrets never reach logs
impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password { .. } => f
                .debug_struct("Password")
                .field("password", &"<redacted>")
                .finish(),
            AuthMethod::Key {
                key_path,
                passphrase,
            } => f
                .debug_struct("Key")
                .field("key_path", key_path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    Password,
    Key,
}
