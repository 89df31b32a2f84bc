//! SSH Connection Registry
//!
//! One long-lived, reconnecting session per configured host.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  HostConnectionRegistry                                      │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │  ConnectionEntry (per host)                             │  │
//! │  │  ├── inner: Mutex<EntryInner>   (single writer)         │  │
//! │  │  │   ├── state: ConnectionState                         │  │
//! │  │  │   ├── session: Option<LiveSession>                   │  │
//! │  │  │   ├── attempt_task / timer_task / session_tasks      │  │
//! │  │  │   └── cancel: CancellationToken                      │  │
//! │  │  └── state_tx: watch::Sender<ConnectionState>           │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//!          │
//!          │  LiveSession (Arc<dyn RemoteSession>, one channel per command)
//!          │
//!    ┌─────┴─────┬─────────────┬─────────────┐
//!    ▼           ▼             ▼             ▼
//!  GPU poll   containers    uploads     deployments
//! ```
//!
//! # State machine
//!
//! - `disconnected → connecting`: first use, startup connect or manual retry
//! - `connecting → connected`: handshake + auth within `timeoutMs`
//! - `connecting | connected → retrying`: attempt failed or live session lost
//! - `retrying → connecting`: backoff timer fired
//! - `retrying → failed`: `currentRetryAttempt` reached `maxAttempts`
//! - `* → disconnected`: manual reset
//!
//! Every transition happens with the entry lock held and is published on the
//! entry's watch channel before the lock is released, so observers see
//! transitions in order and never a half-written state.
//!
//! # Attempt idempotence
//!
//! Each attempt (and each backoff timer) carries the `attempt_id` that was
//! current when it was spawned. A result or timer whose id is no longer
//! current is discarded, so a reset or a manual retry can never be undone by
//! a late task.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::{ErrorKind, SshError};
use super::handle_owner::PingResult;
use super::retry::{RetryConfig, RetryPolicy};
use super::transport::{wait_closed, RemoteSession, SessionConnector};
use crate::config::{Host, HostRegistry};

/// Heartbeat interval (15s)
/// With HEARTBEAT_FAIL_THRESHOLD=2 a dead link is noticed within 30s
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 15;

/// Consecutive heartbeat timeouts before the session is declared lost
const DEFAULT_HEARTBEAT_FAIL_THRESHOLD: u32 = 2;

/// Connection pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPoolConfig {
    /// Keepalive probe interval (seconds)
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Consecutive keepalive timeouts that mark a session lost
    #[serde(default = "default_heartbeat_fail_threshold")]
    pub heartbeat_fail_threshold: u32,

    /// Start the first attempt for every host as soon as the pool is built
    #[serde(default = "default_true")]
    pub connect_on_startup: bool,
}

fn default_heartbeat_interval_secs() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

fn default_heartbeat_fail_threshold() -> u32 {
    DEFAULT_HEARTBEAT_FAIL_THRESHOLD
}

fn default_true() -> bool {
    true
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            heartbeat_fail_threshold: DEFAULT_HEARTBEAT_FAIL_THRESHOLD,
            connect_on_startup: true,
        }
    }
}

impl ConnectionPoolConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

/// Connection status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Retrying,
    Failed,
}

/// Per-host connection state, written only by the registry
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub status: HostStatus,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub current_retry_attempt: u32,
    /// Present only while `status == retrying`
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Pool-wide counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPoolStats {
    pub total: usize,
    pub connected: usize,
    pub connecting: usize,
    pub retrying: usize,
    pub failed: usize,
    pub disconnected: usize,
}

/// Connection registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionRegistryError {
    #[error("Unknown host: {0}")]
    NotFound(String),

    #[error("Host {host} failed: {last_error}")]
    HostFailed { host: String, last_error: String },

    #[error("Timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Cancelled by connection reset")]
    Cancelled,

    #[error("Channel error: {0}")]
    ChannelError(String),
}

/// The live session of a host, tagged so loss reports can be deduplicated
#[derive(Clone)]
pub struct LiveSession {
    pub id: u64,
    pub remote: Arc<dyn RemoteSession>,
}

impl std::fmt::Debug for LiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSession").field("id", &self.id).finish()
    }
}

struct EntryInner {
    state: ConnectionState,
    session: Option<LiveSession>,
    /// Bumped by every attempt and every reset
    attempt_id: u64,
    attempt_task: Option<JoinHandle<()>>,
    timer_task: Option<JoinHandle<()>>,
    /// Close watcher + heartbeat of the current session
    session_tasks: Vec<JoinHandle<()>>,
    /// Cancelled (and replaced) on reset; waiters and commands select on it
    cancel: CancellationToken,
    next_session_id: u64,
}

impl EntryInner {
    fn abort_tasks(&mut self) {
        if let Some(task) = self.attempt_task.take() {
            task.abort();
        }
        if let Some(task) = self.timer_task.take() {
            task.abort();
        }
        self.abort_session_tasks();
    }

    fn abort_session_tasks(&mut self) {
        for task in self.session_tasks.drain(..) {
            task.abort();
        }
    }
}

/// Connection entry for one host
pub struct ConnectionEntry {
    host: Host,
    policy: RetryPolicy,
    inner: Mutex<EntryInner>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionEntry {
    fn new(host: Host) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::default());
        Self {
            policy: RetryPolicy::new(host.retry),
            host,
            inner: Mutex::new(EntryInner {
                state: ConnectionState::default(),
                session: None,
                attempt_id: 0,
                attempt_task: None,
                timer_task: None,
                session_tasks: Vec::new(),
                cancel: CancellationToken::new(),
                next_session_id: 0,
            }),
            state_tx,
        }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn retry_config(&self) -> &RetryConfig {
        self.policy.config()
    }

    /// Consistent copy of the current state
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state.clone()
    }

    /// Observe transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Must be called with the lock held, after every mutation
    fn publish(&self, inner: &EntryInner) {
        self.state_tx.send_replace(inner.state.clone());
    }
}

/// Host connection registry (Connection Manager)
pub struct HostConnectionRegistry {
    connections: DashMap<String, Arc<ConnectionEntry>>,
    /// Host ids in configuration order
    order: Vec<String>,
    connector: Arc<dyn SessionConnector>,
    config: ConnectionPoolConfig,
}

impl HostConnectionRegistry {
    pub fn new(
        hosts: HostRegistry,
        connector: Arc<dyn SessionConnector>,
        config: ConnectionPoolConfig,
    ) -> Arc<Self> {
        let connections = DashMap::new();
        let mut order = Vec::with_capacity(hosts.len());
        for host in hosts {
            order.push(host.id.clone());
            connections.insert(host.id.clone(), Arc::new(ConnectionEntry::new(host)));
        }

        info!(
            "Connection registry created for {} hosts (heartbeat={}s, threshold={})",
            order.len(),
            config.heartbeat_interval_secs,
            config.heartbeat_fail_threshold
        );

        Arc::new(Self {
            connections,
            order,
            connector,
            config,
        })
    }

    pub fn get_connection(&self, host_id: &str) -> Result<Arc<ConnectionEntry>, ConnectionRegistryError> {
        self.connections
            .get(host_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ConnectionRegistryError::NotFound(host_id.to_string()))
    }

    pub fn get_state(&self, host_id: &str) -> Result<ConnectionState, ConnectionRegistryError> {
        Ok(self.get_connection(host_id)?.state())
    }

    /// Entries in configuration order
    pub fn entries(&self) -> Vec<Arc<ConnectionEntry>> {
        self.order
            .iter()
            .filter_map(|id| self.connections.get(id).map(|e| e.value().clone()))
            .collect()
    }

    pub fn get_stats(&self) -> ConnectionPoolStats {
        let mut stats = ConnectionPoolStats::default();
        for entry in self.entries() {
            stats.total += 1;
            match entry.state().status {
                HostStatus::Connected => stats.connected += 1,
                HostStatus::Connecting => stats.connecting += 1,
                HostStatus::Retrying => stats.retrying += 1,
                HostStatus::Failed => stats.failed += 1,
                HostStatus::Disconnected => stats.disconnected += 1,
            }
        }
        stats
    }

    /// Kick every disconnected host into its first attempt
    pub fn connect_all(self: &Arc<Self>) {
        for entry in self.entries() {
            let mut inner = entry.inner.lock();
            if inner.state.status == HostStatus::Disconnected {
                self.begin_attempt(&entry, &mut inner);
            }
        }
    }

    /// Manual "retry now"
    ///
    /// Connected and connecting hosts are left alone; a retrying host skips
    /// the rest of its backoff; a failed host gets a fresh attempt budget
    /// while keeping its failure count.
    pub fn retry_now(self: &Arc<Self>, host_id: &str) -> Result<HostStatus, ConnectionRegistryError> {
        let entry = self.get_connection(host_id)?;
        let mut inner = entry.inner.lock();

        match inner.state.status {
            HostStatus::Connected | HostStatus::Connecting => {
                debug!(
                    "Manual retry for {} ignored, status is {:?}",
                    host_id, inner.state.status
                );
            }
            HostStatus::Retrying | HostStatus::Disconnected => {
                info!("Manual retry for {}", host_id);
                self.begin_attempt(&entry, &mut inner);
            }
            HostStatus::Failed => {
                info!(
                    "Manual retry for failed host {} ({} consecutive failures)",
                    host_id, inner.state.consecutive_failures
                );
                inner.state.current_retry_attempt = 0;
                self.begin_attempt(&entry, &mut inner);
            }
        }

        Ok(inner.state.status)
    }

    /// Manual reset: cancel everything in flight and return to `disconnected`
    pub async fn reset(&self, host_id: &str) -> Result<(), ConnectionRegistryError> {
        let entry = self.get_connection(host_id)?;

        let session = {
            let mut inner = entry.inner.lock();
            inner.attempt_id += 1;
            inner.abort_tasks();
            inner.cancel.cancel();
            inner.cancel = CancellationToken::new();

            let state = &mut inner.state;
            state.status = HostStatus::Disconnected;
            state.consecutive_failures = 0;
            state.current_retry_attempt = 0;
            state.next_retry_at = None;
            state.last_error = None;
            entry.publish(&inner);

            inner.session.take()
        };

        info!("Connection state reset for {}", host_id);

        if let Some(session) = session {
            session.remote.disconnect().await;
        }
        Ok(())
    }

    /// Reset every host (shutdown)
    pub async fn reset_all(&self) {
        for host_id in &self.order {
            let _ = self.reset(host_id).await;
        }
    }

    /// Wait (until `deadline`) for a live session on `host_id`
    ///
    /// A disconnected host is kicked into `connecting`; a retrying host is
    /// waited on; a failed host fails fast. The returned token is cancelled
    /// by a reset of the host.
    pub async fn acquire_session(
        self: &Arc<Self>,
        host_id: &str,
        deadline: tokio::time::Instant,
        timeout_ms: u64,
    ) -> Result<(LiveSession, CancellationToken), ConnectionRegistryError> {
        let entry = self.get_connection(host_id)?;
        // Subscribe before the first read so no transition is missed
        let mut rx = entry.subscribe();
        let token = entry.inner.lock().cancel.clone();

        loop {
            {
                let mut inner = entry.inner.lock();
                if token.is_cancelled() {
                    return Err(ConnectionRegistryError::Cancelled);
                }

                match inner.state.status {
                    HostStatus::Connected => {
                        return match inner.session.clone() {
                            Some(session) => Ok((session, token)),
                            None => Err(ConnectionRegistryError::ConnectionLost(
                                "no live session".to_string(),
                            )),
                        };
                    }
                    HostStatus::Failed => {
                        return Err(ConnectionRegistryError::HostFailed {
                            host: host_id.to_string(),
                            last_error: inner
                                .state
                                .last_error
                                .clone()
                                .unwrap_or_else(|| "unknown error".to_string()),
                        });
                    }
                    HostStatus::Disconnected => {
                        debug!("Session requested for disconnected host {}", host_id);
                        self.begin_attempt(&entry, &mut inner);
                    }
                    HostStatus::Connecting | HostStatus::Retrying => {}
                }
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ConnectionRegistryError::Cancelled),
                changed = tokio::time::timeout_at(deadline, rx.changed()) => match changed {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => {
                        return Err(ConnectionRegistryError::ConnectionLost(
                            "connection registry dropped".to_string(),
                        ));
                    }
                    Err(_) => return Err(ConnectionRegistryError::Timeout { timeout_ms }),
                },
            }
        }
    }

    /// Report that a session died. Only the first report for the host's
    /// current session takes the `connected → retrying` edge.
    pub fn report_session_lost(self: &Arc<Self>, host_id: &str, session_id: u64, reason: &str) -> bool {
        let Ok(entry) = self.get_connection(host_id) else {
            return false;
        };

        let session = {
            let mut inner = entry.inner.lock();
            let is_current = matches!(&inner.session, Some(s) if s.id == session_id);
            if !is_current || inner.state.status != HostStatus::Connected {
                debug!(
                    "Duplicate or stale loss report for {} (session {}): {}",
                    host_id, session_id, reason
                );
                return false;
            }

            warn!("Session {} on {} lost: {}", session_id, host_id, reason);
            inner.abort_session_tasks();
            let session = inner.session.take();
            self.record_failure(&entry, &mut inner, format!("session lost: {}", reason), ErrorKind::Transport);
            session
        };

        if let Some(session) = session {
            tokio::spawn(async move {
                session.remote.disconnect().await;
            });
        }
        true
    }

    pub fn is_current_session(&self, host_id: &str, session_id: u64) -> bool {
        let Ok(entry) = self.get_connection(host_id) else {
            return false;
        };
        let inner = entry.inner.lock();
        matches!(&inner.session, Some(s) if s.id == session_id)
    }

    /// Start a connection attempt. Caller holds the entry lock and has
    /// checked that no attempt is in flight.
    fn begin_attempt(self: &Arc<Self>, entry: &Arc<ConnectionEntry>, inner: &mut EntryInner) {
        inner.attempt_id += 1;
        let attempt_id = inner.attempt_id;
        if let Some(task) = inner.timer_task.take() {
            task.abort();
        }
        if let Some(task) = inner.attempt_task.take() {
            task.abort();
        }

        let started_at = Utc::now();
        inner.state.status = HostStatus::Connecting;
        inner.state.last_attempt_at = Some(started_at);
        inner.state.next_retry_at = None;
        entry.publish(inner);

        let config = entry.retry_config();
        info!(
            "Connecting to {} ({}:{}), attempt {}/{} (attempt_id={})",
            entry.host.id,
            entry.host.address,
            entry.host.port,
            inner.state.current_retry_attempt + 1,
            config.max_attempts,
            attempt_id
        );

        let timeout = config.timeout();
        let registry = Arc::clone(self);
        let entry = Arc::clone(entry);
        inner.attempt_task = Some(tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, registry.connector.connect(&entry.host)).await {
                Ok(result) => result,
                Err(_) => Err(SshError::Timeout(format!(
                    "connect attempt exceeded {}ms",
                    timeout.as_millis()
                ))),
            };
            registry.finish_attempt(&entry, attempt_id, started_at, result);
        }));
    }

    fn finish_attempt(
        self: &Arc<Self>,
        entry: &Arc<ConnectionEntry>,
        attempt_id: u64,
        started_at: DateTime<Utc>,
        result: Result<Arc<dyn RemoteSession>, SshError>,
    ) {
        let mut inner = entry.inner.lock();

        if inner.attempt_id != attempt_id || inner.state.status != HostStatus::Connecting {
            debug!(
                "Discarding stale attempt {} for {} (current={})",
                attempt_id, entry.host.id, inner.attempt_id
            );
            drop(inner);
            if let Ok(remote) = result {
                tokio::spawn(async move {
                    remote.disconnect().await;
                });
            }
            return;
        }

        // Our own handle; the task is finishing
        inner.attempt_task = None;

        match result {
            Ok(remote) => {
                inner.next_session_id += 1;
                let session = LiveSession {
                    id: inner.next_session_id,
                    remote,
                };

                let state = &mut inner.state;
                state.status = HostStatus::Connected;
                state.consecutive_failures = 0;
                state.current_retry_attempt = 0;
                state.last_success_at = Some(started_at);
                state.next_retry_at = None;
                state.last_error = None;

                inner.session_tasks = self.spawn_session_watchers(entry, &session);
                inner.session = Some(session);
                entry.publish(&inner);

                info!("Connected to {} (attempt_id={})", entry.host.id, attempt_id);
            }
            Err(e) => {
                warn!("Connection attempt to {} failed: {}", entry.host.id, e);
                self.record_failure(entry, &mut inner, e.to_string(), e.kind());
            }
        }
    }

    /// Shared accounting for a failed attempt or a lost session
    fn record_failure(
        self: &Arc<Self>,
        entry: &Arc<ConnectionEntry>,
        inner: &mut EntryInner,
        error: String,
        kind: ErrorKind,
    ) {
        let max_attempts = entry.retry_config().max_attempts;
        let state = &mut inner.state;

        state.consecutive_failures += 1;
        state.last_error = Some(error);
        state.current_retry_attempt = if kind == ErrorKind::Authentication {
            // Rejected credentials will not start working on their own
            max_attempts
        } else {
            (state.current_retry_attempt + 1).min(max_attempts)
        };

        if state.current_retry_attempt >= max_attempts {
            state.status = HostStatus::Failed;
            state.next_retry_at = None;
            error!(
                "Host {} failed after {} attempts ({} consecutive failures): {}",
                entry.host.id,
                state.current_retry_attempt,
                state.consecutive_failures,
                state.last_error.as_deref().unwrap_or_default()
            );
            entry.publish(inner);
            return;
        }

        let attempt = state.current_retry_attempt;
        let delay = entry.policy.backoff(attempt);
        state.status = HostStatus::Retrying;
        state.next_retry_at = Some(
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
        );
        entry.publish(inner);

        warn!(
            "Host {} retrying in {}ms (attempt {}/{})",
            entry.host.id,
            delay.as_millis(),
            attempt,
            max_attempts
        );

        let attempt_id = inner.attempt_id;
        let registry = Arc::clone(self);
        let timer_entry = Arc::clone(entry);
        if let Some(task) = inner.timer_task.take() {
            task.abort();
        }
        inner.timer_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            registry.on_retry_timer(&timer_entry, attempt_id);
        }));
    }

    fn on_retry_timer(self: &Arc<Self>, entry: &Arc<ConnectionEntry>, attempt_id: u64) {
        let mut inner = entry.inner.lock();
        if inner.attempt_id != attempt_id || inner.state.status != HostStatus::Retrying {
            debug!("Stale retry timer for {} ignored", entry.host.id);
            return;
        }
        // Our own handle; detach instead of aborting ourselves
        inner.timer_task = None;
        self.begin_attempt(entry, &mut inner);
    }

    /// Close watcher + heartbeat for a freshly connected session
    fn spawn_session_watchers(
        self: &Arc<Self>,
        entry: &Arc<ConnectionEntry>,
        session: &LiveSession,
    ) -> Vec<JoinHandle<()>> {
        let host_id = entry.host.id.clone();
        let session_id = session.id;

        let close_watcher = {
            let registry = Arc::clone(self);
            let host_id = host_id.clone();
            let closed = session.remote.closed();
            tokio::spawn(async move {
                wait_closed(closed).await;
                registry.report_session_lost(&host_id, session_id, "remote closed the session");
            })
        };

        let heartbeat = {
            let registry = Arc::clone(self);
            let remote = session.remote.clone();
            let period = self.config.heartbeat_interval();
            let threshold = self.config.heartbeat_fail_threshold.max(1);
            tokio::spawn(async move {
                debug!(
                    "Heartbeat started for {} session {} (interval={}s, threshold={})",
                    host_id,
                    session_id,
                    period.as_secs(),
                    threshold
                );
                let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                let mut failures = 0u32;

                loop {
                    interval.tick().await;
                    if !registry.is_current_session(&host_id, session_id) {
                        break;
                    }

                    match remote.ping().await {
                        PingResult::Ok => {
                            failures = 0;
                        }
                        PingResult::IoError => {
                            registry.report_session_lost(&host_id, session_id, "keepalive I/O error");
                            break;
                        }
                        PingResult::Timeout => {
                            failures += 1;
                            warn!(
                                "Heartbeat timeout for {} ({}/{})",
                                host_id, failures, threshold
                            );
                            if failures >= threshold {
                                registry.report_session_lost(
                                    &host_id,
                                    session_id,
                                    &format!("{} consecutive keepalive timeouts", failures),
                                );
                                break;
                            }
                        }
                    }
                }

                debug!("Heartbeat stopped for {} session {}", host_id, session_id);
            })
        };

        vec![close_watcher, heartbeat]
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ssh::transport::mock::{ConnectOutcome, MockConnector};
    use crate::ssh::AuthMethod;

    pub(crate) fn retry_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            timeout_ms: 5000,
            jitter_factor: 0.0,
        }
    }

    pub(crate) fn test_host(id: &str, retry: RetryConfig) -> Host {
        Host {
            id: id.to_string(),
            display_name: id.to_uppercase(),
            address: format!("{}.lab", id),
            port: 22,
            username: "ops".to_string(),
            auth: AuthMethod::password("pw"),
            retry,
        }
    }

    pub(crate) fn pool_config() -> ConnectionPoolConfig {
        ConnectionPoolConfig {
            connect_on_startup: false,
            ..ConnectionPoolConfig::default()
        }
    }

    pub(crate) fn registry_with(
        connector: Arc<MockConnector>,
        retry: RetryConfig,
    ) -> Arc<HostConnectionRegistry> {
        let hosts = HostRegistry::new(vec![test_host("alpha", retry), test_host("beta", retry)]).unwrap();
        HostConnectionRegistry::new(hosts, connector, pool_config())
    }

    pub(crate) async fn wait_for_status(
        registry: &HostConnectionRegistry,
        host_id: &str,
        status: HostStatus,
    ) -> ConnectionState {
        let mut rx = registry.get_connection(host_id).unwrap().subscribe();
        let state = tokio::time::timeout(
            Duration::from_secs(3600),
            rx.wait_for(|s| s.status == status),
        )
        .await
        .expect("status not reached")
        .unwrap()
        .clone();
        state
    }

    #[test]
    fn test_connection_pool_config_default() {
        let config = ConnectionPoolConfig::default();
        assert_eq!(config.heartbeat_interval_secs, 15);
        assert_eq!(config.heartbeat_fail_threshold, 2);
        assert!(config.connect_on_startup);

        let parsed: ConnectionPoolConfig =
            serde_json::from_str(r#"{"heartbeatFailThreshold":4}"#).unwrap();
        assert_eq!(parsed.heartbeat_interval_secs, 15);
        assert_eq!(parsed.heartbeat_fail_threshold, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_disconnected_and_connects_on_retry_now() {
        let connector = MockConnector::new();
        let registry = registry_with(connector.clone(), retry_config(5));

        assert_eq!(registry.get_state("alpha").unwrap(), ConnectionState::default());
        assert_eq!(registry.retry_now("alpha").unwrap(), HostStatus::Connecting);
        assert_eq!(registry.get_state("alpha").unwrap().status, HostStatus::Connecting);

        let state = wait_for_status(&registry, "alpha", HostStatus::Connected).await;
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.current_retry_attempt, 0);
        assert!(state.last_success_at.is_some());
        assert_eq!(connector.calls(), 1);

        // beta is untouched
        assert_eq!(registry.get_state("beta").unwrap().status, HostStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_failure_resets_counters() {
        let connector = MockConnector::new();
        connector.script([ConnectOutcome::Refuse, ConnectOutcome::Refuse]);
        let registry = registry_with(connector.clone(), retry_config(5));

        registry.retry_now("alpha").unwrap();
        let retrying = wait_for_status(&registry, "alpha", HostStatus::Retrying).await;
        assert_eq!(retrying.consecutive_failures, 1);
        assert_eq!(retrying.current_retry_attempt, 1);
        assert!(retrying.last_error.as_deref().unwrap().contains("refused"));

        let state = wait_for_status(&registry, "alpha", HostStatus::Connected).await;
        assert_eq!(connector.calls(), 3);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.current_retry_attempt, 0);
        assert_eq!(state.last_error, None);
        assert_eq!(state.next_retry_at, None);
        // lastSuccessAt is the start of the winning attempt
        assert_eq!(state.last_success_at, state.last_attempt_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_after_max_attempts_and_stays_failed() {
        let connector = MockConnector::new();
        connector.script(std::iter::repeat(ConnectOutcome::Refuse).take(10));
        let registry = registry_with(connector.clone(), retry_config(5));

        registry.retry_now("alpha").unwrap();
        let state = wait_for_status(&registry, "alpha", HostStatus::Failed).await;
        assert_eq!(state.current_retry_attempt, 5);
        assert_eq!(state.consecutive_failures, 5);
        assert_eq!(state.next_retry_at, None);
        assert_eq!(connector.calls(), 5);

        // No further automatic attempts
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.calls(), 5);
        assert_eq!(registry.get_state("alpha").unwrap().status, HostStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invariants_hold_on_every_published_state() {
        let connector = MockConnector::new();
        connector.script(std::iter::repeat(ConnectOutcome::Refuse).take(4));
        let registry = registry_with(connector.clone(), retry_config(4));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut rx = registry.get_connection("alpha").unwrap().subscribe();
        let observer = {
            let seen = seen.clone();
            tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    seen.lock().push(rx.borrow_and_update().clone());
                }
            })
        };

        registry.retry_now("alpha").unwrap();
        wait_for_status(&registry, "alpha", HostStatus::Failed).await;
        tokio::task::yield_now().await;
        observer.abort();

        let seen = seen.lock();
        assert!(seen.iter().any(|s| s.status == HostStatus::Retrying));
        for state in seen.iter() {
            assert_eq!(
                state.status == HostStatus::Retrying,
                state.next_retry_at.is_some(),
                "{:?}",
                state
            );
            if matches!(state.status, HostStatus::Connecting | HostStatus::Retrying) {
                assert!(state.current_retry_attempt < 4, "{:?}", state);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedules_next_attempt() {
        let connector = MockConnector::new();
        connector.script([ConnectOutcome::Refuse, ConnectOutcome::Refuse]);
        let registry = registry_with(connector.clone(), retry_config(5));

        registry.retry_now("alpha").unwrap();
        let state = wait_for_status(&registry, "alpha", HostStatus::Retrying).await;
        let delay = state.next_retry_at.unwrap() - state.last_attempt_at.unwrap();
        assert!(delay.num_milliseconds() >= 1000);

        // Attempt 2 after 1s, attempt 3 after a further 2s
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(connector.calls(), 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(connector.calls(), 2);
        tokio::time::sleep(Duration::from_millis(1800)).await;
        assert_eq!(connector.calls(), 2);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(connector.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_rejection_exhausts_budget() {
        let connector = MockConnector::new();
        connector.script([ConnectOutcome::RejectAuth]);
        let registry = registry_with(connector.clone(), retry_config(5));

        registry.retry_now("alpha").unwrap();
        let state = wait_for_status(&registry, "alpha", HostStatus::Failed).await;
        assert_eq!(state.consecutive_failures, 1);
        assert_eq!(state.current_retry_attempt, 5);
        assert!(state.last_error.unwrap().contains("Authentication"));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_is_retried() {
        let connector = MockConnector::new();
        connector.script([ConnectOutcome::Hang]);
        let registry = registry_with(connector.clone(), retry_config(5));

        registry.retry_now("alpha").unwrap();
        let state = wait_for_status(&registry, "alpha", HostStatus::Retrying).await;
        assert!(state.last_error.unwrap().contains("Timeout"));

        wait_for_status(&registry, "alpha", HostStatus::Connected).await;
        assert_eq!(connector.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_now_skips_backoff_and_keeps_counters() {
        let connector = MockConnector::new();
        connector.script([ConnectOutcome::Refuse, ConnectOutcome::Delay(Duration::from_millis(100))]);
        let mut retry = retry_config(5);
        retry.base_delay_ms = 20_000;
        let registry = registry_with(connector.clone(), retry);

        registry.retry_now("alpha").unwrap();
        wait_for_status(&registry, "alpha", HostStatus::Retrying).await;

        assert_eq!(registry.retry_now("alpha").unwrap(), HostStatus::Connecting);
        let state = registry.get_state("alpha").unwrap();
        assert_eq!(state.next_retry_at, None);
        assert_eq!(state.consecutive_failures, 1);
        assert_eq!(state.current_retry_attempt, 1);

        wait_for_status(&registry, "alpha", HostStatus::Connected).await;
        assert_eq!(connector.calls(), 2);

        // The cancelled 20s timer never fires
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_now_on_failed_grants_fresh_budget() {
        let connector = MockConnector::new();
        connector.script([ConnectOutcome::Refuse, ConnectOutcome::Refuse]);
        let registry = registry_with(connector.clone(), retry_config(2));

        registry.retry_now("alpha").unwrap();
        wait_for_status(&registry, "alpha", HostStatus::Failed).await;

        registry.retry_now("alpha").unwrap();
        let state = registry.get_state("alpha").unwrap();
        assert_eq!(state.status, HostStatus::Connecting);
        assert_eq!(state.current_retry_attempt, 0);
        assert_eq!(state.consecutive_failures, 2);

        wait_for_status(&registry, "alpha", HostStatus::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_triggers_collapse_into_one_attempt() {
        let connector = MockConnector::new();
        connector.script([ConnectOutcome::Delay(Duration::from_secs(2))]);
        let registry = registry_with(connector.clone(), retry_config(5));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let registry = registry.clone();
            waiters.push(tokio::spawn(async move {
                registry.acquire_session("alpha", deadline, 10_000).await.map(|(s, _)| s.id)
            }));
        }
        registry.retry_now("alpha").unwrap();
        registry.retry_now("alpha").unwrap();

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap(), 1);
        }
        assert_eq!(connector.calls(), 1);
        assert_eq!(connector.max_in_flight.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_state_and_cancels_timer() {
        let connector = MockConnector::new();
        connector.script([ConnectOutcome::Refuse, ConnectOutcome::Refuse]);
        let registry = registry_with(connector.clone(), retry_config(5));

        registry.retry_now("alpha").unwrap();
        wait_for_status(&registry, "alpha", HostStatus::Retrying).await;

        registry.reset("alpha").await.unwrap();
        let state = registry.get_state("alpha").unwrap();
        assert_eq!(state.status, HostStatus::Disconnected);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.current_retry_attempt, 0);
        assert_eq!(state.next_retry_at, None);
        assert_eq!(state.last_error, None);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_cancels_in_flight_attempt_and_waiters() {
        let connector = MockConnector::new();
        connector.script([ConnectOutcome::Hang]);
        let mut retry = retry_config(5);
        retry.timeout_ms = 60_000;
        let registry = registry_with(connector.clone(), retry);

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
                registry.acquire_session("alpha", deadline, 30_000).await.map(|(s, _)| s.id)
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.get_state("alpha").unwrap().status, HostStatus::Connecting);

        registry.reset("alpha").await.unwrap();
        assert_eq!(waiter.await.unwrap(), Err(ConnectionRegistryError::Cancelled));
        assert_eq!(registry.get_state("alpha").unwrap().status, HostStatus::Disconnected);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.calls(), 1);
        assert_eq!(registry.get_state("alpha").unwrap().status, HostStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_disconnects_live_session() {
        let connector = MockConnector::new();
        let registry = registry_with(connector.clone(), retry_config(5));

        registry.retry_now("alpha").unwrap();
        wait_for_status(&registry, "alpha", HostStatus::Connected).await;
        let session = connector.last_session().unwrap();

        registry.reset("alpha").await.unwrap();
        assert!(session.is_closed());
        let state = registry.get_state("alpha").unwrap();
        assert_eq!(state.status, HostStatus::Disconnected);
        assert!(state.last_success_at.is_some());

        // Closing the old session is not a loss
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(registry.get_state("alpha").unwrap().status, HostStatus::Disconnected);
        assert_eq!(connector.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_loss_is_reported_once() {
        let connector = MockConnector::new();
        let registry = registry_with(connector.clone(), retry_config(5));

        registry.retry_now("alpha").unwrap();
        wait_for_status(&registry, "alpha", HostStatus::Connected).await;

        assert!(registry.report_session_lost("alpha", 1, "broken pipe"));
        assert!(!registry.report_session_lost("alpha", 1, "broken pipe"));

        let state = registry.get_state("alpha").unwrap();
        assert_eq!(state.status, HostStatus::Retrying);
        assert_eq!(state.consecutive_failures, 1);
        assert_eq!(state.current_retry_attempt, 1);
        assert!(state.last_error.unwrap().contains("broken pipe"));

        wait_for_status(&registry, "alpha", HostStatus::Connected).await;
        assert_eq!(connector.session_count(), 2);
        // A late report about the old session is ignored
        assert!(!registry.report_session_lost("alpha", 1, "late"));
        assert!(registry.is_current_session("alpha", 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_close_detected_while_idle() {
        let connector = MockConnector::new();
        let registry = registry_with(connector.clone(), retry_config(5));

        registry.retry_now("alpha").unwrap();
        wait_for_status(&registry, "alpha", HostStatus::Connected).await;
        connector.last_session().unwrap().drop_remote();

        let state = wait_for_status(&registry, "alpha", HostStatus::Retrying).await;
        assert!(state.last_error.unwrap().contains("remote closed"));
        wait_for_status(&registry, "alpha", HostStatus::Connected).await;
        assert_eq!(connector.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeouts_reach_threshold() {
        let connector = MockConnector::new();
        let registry = registry_with(connector.clone(), retry_config(5));

        registry.retry_now("alpha").unwrap();
        wait_for_status(&registry, "alpha", HostStatus::Connected).await;
        connector.last_session().unwrap().set_ping(PingResult::Timeout);

        // One timeout (at 15s) is tolerated
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(registry.get_state("alpha").unwrap().status, HostStatus::Connected);

        let state = wait_for_status(&registry, "alpha", HostStatus::Retrying).await;
        assert!(state.last_error.unwrap().contains("keepalive timeouts"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_io_error_is_immediate() {
        let connector = MockConnector::new();
        let registry = registry_with(connector.clone(), retry_config(5));

        registry.retry_now("alpha").unwrap();
        wait_for_status(&registry, "alpha", HostStatus::Connected).await;
        connector.last_session().unwrap().set_ping(PingResult::IoError);

        let state = wait_for_status(&registry, "alpha", HostStatus::Retrying).await;
        assert!(state.last_error.unwrap().contains("I/O"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_kicks_disconnected_host() {
        let connector = MockConnector::new();
        connector.script([ConnectOutcome::Delay(Duration::from_secs(3))]);
        let registry = registry_with(connector.clone(), retry_config(5));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        let (session, token) = registry.acquire_session("beta", deadline, 10_000).await.unwrap();
        assert_eq!(session.id, 1);
        assert!(!token.is_cancelled());
        assert_eq!(registry.get_state("beta").unwrap().status, HostStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_while_connecting() {
        let connector = MockConnector::new();
        connector.script([ConnectOutcome::Hang]);
        let mut retry = retry_config(5);
        retry.timeout_ms = 60_000;
        let registry = registry_with(connector.clone(), retry);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        let err = registry.acquire_session("alpha", deadline, 2000).await.unwrap_err();
        assert_eq!(err, ConnectionRegistryError::Timeout { timeout_ms: 2000 });
        // The attempt itself keeps going
        assert_eq!(registry.get_state("alpha").unwrap().status, HostStatus::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_fails_fast_on_failed_host() {
        let connector = MockConnector::new();
        connector.script([ConnectOutcome::Refuse]);
        let registry = registry_with(connector.clone(), retry_config(1));

        registry.retry_now("alpha").unwrap();
        wait_for_status(&registry, "alpha", HostStatus::Failed).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        let err = registry.acquire_session("alpha", deadline, 10_000).await.unwrap_err();
        assert!(matches!(err, ConnectionRegistryError::HostFailed { ref host, .. } if host == "alpha"));
        assert_eq!(connector.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_all_and_stats() {
        let connector = MockConnector::new();
        connector.script([ConnectOutcome::Succeed, ConnectOutcome::RejectAuth]);
        let registry = registry_with(connector.clone(), retry_config(3));

        registry.connect_all();
        assert_eq!(registry.get_stats().connecting, 2);
        for host_id in ["alpha", "beta"] {
            let mut rx = registry.get_connection(host_id).unwrap().subscribe();
            rx.wait_for(|s| matches!(s.status, HostStatus::Connected | HostStatus::Failed))
                .await
                .unwrap();
        }

        let stats = registry.get_stats();
        assert_eq!(
            stats,
            ConnectionPoolStats {
                total: 2,
                connected: 1,
                failed: 1,
                ..Default::default()
            }
        );

        registry.reset_all().await;
        assert_eq!(registry.get_stats().disconnected, 2);
    }

    #[tokio::test]
    async fn test_unknown_host() {
        let registry = registry_with(MockConnector::new(), retry_config(5));
        assert_eq!(
            registry.retry_now("gamma"),
            Err(ConnectionRegistryError::NotFound("gamma".to_string()))
        );
        assert!(registry.reset("gamma").await.is_err());
        assert!(!registry.report_session_lost("gamma", 1, "x"));
    }
}
