//! Configuration Management Module
//!
//! Loads the host set and retry/pool settings from `hosts.json` and resolves
//! credential references from the environment.

pub mod credentials;
pub mod hosts;
pub mod storage;
pub mod types;

pub use credentials::{resolve_auth, resolve_auth_with};
pub use hosts::{Host, HostInfo, HostRegistry};
pub use storage::{config_dir, hosts_file, resolve, ConfigStorage, LoadedConfig, StorageError};
pub use types::{ConfigFile, SavedAuth, SavedHost, CONFIG_VERSION, DEFAULT_LISTEN};
