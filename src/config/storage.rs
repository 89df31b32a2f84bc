//! Configuration Storage
//!
//! Reads `hosts.json` from disk and resolves it into a `LoadedConfig`.
//! Config location: ~/.gpudeck/hosts.json, overridable with `GPUDECK_CONFIG`.

use std::path::{Path, PathBuf};

use tokio::fs;

use super::credentials::resolve_auth;
use super::hosts::{Host, HostRegistry};
use super::types::{ConfigFile, CONFIG_VERSION};
use crate::ssh::{ConnectionPoolConfig, RetryConfig};

/// Environment variable overriding the config file path
pub const CONFIG_PATH_ENV: &str = "GPUDECK_CONFIG";

/// Environment variable overriding the listen address
pub const LISTEN_ENV: &str = "GPUDECK_LISTEN";

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Host {host}: credential variable {variable} is not set")]
    MissingCredential { host: String, variable: String },
}

/// Get the GpuDeck configuration directory (~/.gpudeck)
pub fn config_dir() -> Result<PathBuf, StorageError> {
    dirs::home_dir()
        .map(|home| home.join(".gpudeck"))
        .ok_or(StorageError::NoConfigDir)
}

/// Resolve the hosts file path, honouring `GPUDECK_CONFIG`
pub fn hosts_file() -> Result<PathBuf, StorageError> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(config_dir()?.join("hosts.json"))
}

/// Fully resolved startup configuration
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub listen: String,
    pub pool: ConnectionPoolConfig,
    pub hosts: HostRegistry,
    pub known_hosts_path: Option<PathBuf>,
    pub strict_host_key_checking: bool,
}

/// Configuration storage manager
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Create a storage manager for the default (or env-overridden) path
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: hosts_file()?,
        })
    }

    /// Create storage manager with custom path (for testing)
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the config file
    pub async fn load(&self) -> Result<ConfigFile, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(self.path.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let config: ConfigFile = serde_json::from_str(&contents)?;
        if config.version > CONFIG_VERSION {
            return Err(StorageError::VersionTooNew {
                found: config.version,
                supported: CONFIG_VERSION,
            });
        }

        tracing::info!(
            "Loaded config from {:?} ({} hosts)",
            self.path,
            config.hosts.len()
        );
        Ok(config)
    }

    /// Load, validate and resolve credentials from the process environment
    pub async fn load_resolved(&self) -> Result<LoadedConfig, StorageError> {
        let file = self.load().await?;
        let mut loaded = resolve(file)?;

        if let Ok(listen) = std::env::var(LISTEN_ENV) {
            if !listen.trim().is_empty() {
                loaded.listen = listen;
            }
        }
        Ok(loaded)
    }
}

/// Validate a parsed config file and resolve it into runtime types
pub fn resolve(file: ConfigFile) -> Result<LoadedConfig, StorageError> {
    if file.hosts.is_empty() {
        return Err(StorageError::Invalid("no hosts configured".to_string()));
    }
    if file.pool.heartbeat_interval_secs == 0 {
        return Err(StorageError::Invalid(
            "pool.heartbeatIntervalSecs must be positive".to_string(),
        ));
    }
    validate_retry("retry", &file.retry)?;

    let mut hosts = Vec::with_capacity(file.hosts.len());
    for saved in file.hosts {
        let retry = saved.retry.unwrap_or(file.retry);
        validate_retry(&format!("hosts.{}.retry", saved.id), &retry)?;

        let auth = resolve_auth(&saved.id, &saved.auth)?;
        hosts.push(Host {
            display_name: saved.display_name.unwrap_or_else(|| saved.id.clone()),
            id: saved.id,
            address: saved.host,
            port: saved.port,
            username: saved.username,
            auth,
            retry,
        });
    }

    let hosts = HostRegistry::new(hosts).map_err(StorageError::Invalid)?;

    Ok(LoadedConfig {
        listen: file.listen,
        pool: file.pool,
        hosts,
        known_hosts_path: file.known_hosts_path.map(PathBuf::from),
        strict_host_key_checking: file.strict_host_key_checking,
    })
}

fn validate_retry(context: &str, retry: &RetryConfig) -> Result<(), StorageError> {
    retry
        .validate()
        .map_err(|e| StorageError::Invalid(format!("{}: {}", context, e)))
}
