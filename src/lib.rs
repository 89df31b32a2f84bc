//! GpuDeck - connection pool for the GPU dashboard
//!
//! Keeps one reconnecting SSH session per compute host and serves command
//! execution and connection diagnostics over HTTP.

// Use mimalloc as the global allocator (many small per-command buffers)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod bridge;
pub mod commands;
pub mod config;
pub mod ssh;

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bridge::AppState;
use commands::DiagnosticsReporter;
use config::{ConfigStorage, StorageError};
use ssh::{CommandExecutor, HostConnectionRegistry, KnownHostsStore, SshConnector};

/// Startup failures
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Append a line to ~/.gpudeck/startup.log (useful when stdout is not captured)
fn write_startup_log(message: &str) {
    if let Ok(dir) = config::config_dir() {
        let _ = std::fs::create_dir_all(&dir);

        let log_file = dir.join("startup.log");
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&log_file) {
            let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
            let _ = writeln!(file, "[{}] {}", timestamp, message);
        }
    }
}

/// Initialize logging
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Resolves on Ctrl-C. If the handler cannot be installed, never resolves.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Load config, build the pool and serve until Ctrl-C
pub async fn run() -> Result<(), StartupError> {
    write_startup_log("GpuDeck starting...");

    let storage = ConfigStorage::new()?;
    let loaded = match storage.load_resolved().await {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("Failed to load {:?}: {}", storage.path(), e);
            write_startup_log(&format!("Config load failed: {}", e));
            return Err(e.into());
        }
    };

    let known_hosts_path = loaded
        .known_hosts_path
        .clone()
        .unwrap_or_else(KnownHostsStore::default_path);
    let known_hosts = Arc::new(KnownHostsStore::with_path(known_hosts_path));
    let connector = Arc::new(SshConnector::new(
        known_hosts,
        loaded.strict_host_key_checking,
    ));

    let connect_on_startup = loaded.pool.connect_on_startup;
    let registry = HostConnectionRegistry::new(loaded.hosts, connector, loaded.pool);
    if connect_on_startup {
        registry.connect_all();
    }

    let state = AppState {
        reporter: DiagnosticsReporter::new(registry.clone()),
        executor: CommandExecutor::new(registry.clone()),
    };

    let listener = TcpListener::bind(&loaded.listen).await?;
    write_startup_log(&format!("Listening on {}", loaded.listen));

    let served = bridge::serve(listener, state, shutdown_signal()).await;

    info!("Resetting all connections");
    registry.reset_all().await;
    write_startup_log("GpuDeck stopped");

    served.map_err(StartupError::from)
}
