//! Connection diagnostics
//!
//! Read-only projection of the connection registry for the dashboard poll,
//! plus the two manual controls (retry now, reset). Elapsed/remaining times
//! are derived from the stored timestamps at read time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::config::HostInfo;
use crate::ssh::{
    ConnectionPoolStats, ConnectionRegistryError, ConnectionState, HostConnectionRegistry,
    HostStatus, RetryConfig,
};

/// One host as the dashboard renders it
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostDiagnostics {
    pub host: HostInfo,
    #[serde(flatten)]
    pub state: ConnectionState,
    pub retry_config: RetryConfig,
    pub time_since_last_attempt_ms: Option<i64>,
    pub time_since_last_success_ms: Option<i64>,
    /// Zero once the retry is due
    pub time_until_next_retry_ms: Option<i64>,
}

impl HostDiagnostics {
    pub fn new(
        host: HostInfo,
        state: ConnectionState,
        retry_config: RetryConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let since = |at: Option<DateTime<Utc>>| at.map(|t| (now - t).num_milliseconds().max(0));

        Self {
            time_since_last_attempt_ms: since(state.last_attempt_at),
            time_since_last_success_ms: since(state.last_success_at),
            time_until_next_retry_ms: state
                .next_retry_at
                .map(|t| (t - now).num_milliseconds().max(0)),
            host,
            state,
            retry_config,
        }
    }
}

/// Full poll response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub hosts: Vec<HostDiagnostics>,
    pub stats: ConnectionPoolStats,
}

#[derive(Clone)]
pub struct DiagnosticsReporter {
    registry: Arc<HostConnectionRegistry>,
}

impl DiagnosticsReporter {
    pub fn new(registry: Arc<HostConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// All hosts in configuration order
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let now = Utc::now();
        let mut stats = ConnectionPoolStats::default();

        let hosts: Vec<HostDiagnostics> = self
            .registry
            .entries()
            .into_iter()
            .map(|entry| {
                let state = entry.state();
                stats.total += 1;
                match state.status {
                    HostStatus::Connected => stats.connected += 1,
                    HostStatus::Connecting => stats.connecting += 1,
                    HostStatus::Retrying => stats.retrying += 1,
                    HostStatus::Failed => stats.failed += 1,
                    HostStatus::Disconnected => stats.disconnected += 1,
                }
                HostDiagnostics::new(entry.host().info(), state, *entry.retry_config(), now)
            })
            .collect();

        DiagnosticsSnapshot {
            generated_at: now,
            hosts,
            stats,
        }
    }

    pub fn host_snapshot(&self, host_id: &str) -> Result<HostDiagnostics, ConnectionRegistryError> {
        let entry = self.registry.get_connection(host_id)?;
        Ok(HostDiagnostics::new(
            entry.host().info(),
            entry.state(),
            *entry.retry_config(),
            Utc::now(),
        ))
    }

    /// Fire-and-forget; the outcome shows up in the next snapshot
    pub fn retry_now(&self, host_id: &str) -> Result<HostStatus, ConnectionRegistryError> {
        let status = self.registry.retry_now(host_id)?;
        info!("retryConnection({}) -> {:?}", host_id, status);
        Ok(status)
    }

    pub async fn reset(&self, host_id: &str) -> Result<(), ConnectionRegistryError> {
        self.registry.reset(host_id).await?;
        info!("resetConnectionState({})", host_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::ssh::connection_registry::tests::{registry_with, retry_config, test_host, wait_for_status};
    use crate::ssh::transport::mock::{ConnectOutcome, MockConnector};

    #[test]
    fn test_derived_times() {
        let now = Utc::now();
        let state = ConnectionState {
            status: HostStatus::Retrying,
            last_attempt_at: Some(now - ChronoDuration::milliseconds(1500)),
            last_success_at: Some(now - ChronoDuration::seconds(60)),
            consecutive_failures: 2,
            current_retry_attempt: 2,
            next_retry_at: Some(now + ChronoDuration::milliseconds(2500)),
            last_error: Some("refused".to_string()),
        };
        let host = test_host("alpha", retry_config(5));

        let diag = HostDiagnostics::new(host.info(), state, host.retry, now);
        assert_eq!(diag.time_since_last_attempt_ms, Some(1500));
        assert_eq!(diag.time_since_last_success_ms, Some(60_000));
        assert_eq!(diag.time_until_next_retry_ms, Some(2500));

        // An overdue retry reads as zero, never negative
        let later = now + ChronoDuration::seconds(10);
        let diag = HostDiagnostics::new(host.info(), diag.state, host.retry, later);
        assert_eq!(diag.time_until_next_retry_ms, Some(0));
    }

    #[test]
    fn test_serialized_shape() {
        let host = test_host("alpha", retry_config(5));
        let diag = HostDiagnostics::new(host.info(), ConnectionState::default(), host.retry, Utc::now());
        let json = serde_json::to_value(&diag).unwrap();

        assert_eq!(json["status"], "disconnected");
        assert_eq!(json["currentRetryAttempt"], 0);
        assert_eq!(json["retryConfig"]["maxAttempts"], 5);
        assert_eq!(json["host"]["id"], "alpha");
        assert_eq!(json["host"]["auth"], "password");
        assert!(json["nextRetryAt"].is_null());
        assert!(json["timeSinceLastAttemptMs"].is_null());
        assert!(json["host"].get("password").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_and_controls() {
        let connector = MockConnector::new();
        connector.script([ConnectOutcome::Refuse]);
        let registry = registry_with(connector.clone(), retry_config(5));
        let reporter = DiagnosticsReporter::new(registry.clone());

        let snapshot = reporter.snapshot();
        assert_eq!(snapshot.hosts.len(), 2);
        assert_eq!(snapshot.hosts[0].host.id, "alpha");
        assert_eq!(snapshot.hosts[1].host.id, "beta");
        assert_eq!(snapshot.stats.disconnected, 2);

        assert_eq!(reporter.retry_now("alpha").unwrap(), HostStatus::Connecting);
        wait_for_status(&registry, "alpha", HostStatus::Retrying).await;

        let alpha = reporter.host_snapshot("alpha").unwrap();
        assert_eq!(alpha.state.current_retry_attempt, 1);
        assert!(alpha.time_until_next_retry_ms.unwrap() <= 1000);
        assert!(alpha.time_since_last_attempt_ms.is_some());
        assert_eq!(reporter.snapshot().stats.retrying, 1);

        reporter.reset("alpha").await.unwrap();
        let alpha = reporter.host_snapshot("alpha").unwrap();
        assert_eq!(alpha.state.status, HostStatus::Disconnected);
        assert_eq!(alpha.time_until_next_retry_ms, None);
    }

    #[tokio::test]
    async fn test_unknown_host() {
        let reporter = DiagnosticsReporter::new(registry_with(MockConnector::new(), retry_config(5)));
        assert!(matches!(
            reporter.host_snapshot("gamma"),
            Err(ConnectionRegistryError::NotFound(_))
        ));
        assert!(reporter.retry_now("gamma").is_err());
        assert!(reporter.reset("gamma").await.is_err());
    }
}
