//! Control-plane readiness polling.
//!
//! The control plane counts as ready once the system namespace lists at
//! least one pod. An empty list or an API or transport error means "not yet"
//! and the prober sleeps for one interval before retrying. Errors that no
//! retry can fix, such as unreadable credentials, end the wait at once.

use crate::cancellation::CancellationToken;
use crate::cluster::{ClusterApi, SYSTEM_NAMESPACE};
use crate::errors::ReadinessError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Default pause between readiness polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Polling parameters.
///
/// With no ceilings set the prober waits indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Pause between attempts.
    pub interval: Duration,
    /// Stop after this many attempts.
    pub max_attempts: Option<u32>,
    /// Stop once this much time has elapsed.
    pub max_duration: Option<Duration>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl PollConfig {
    /// Creates an unbounded configuration with the given interval.
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
            max_duration: None,
        }
    }

    /// Caps the number of attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Caps the total wait.
    #[must_use]
    pub const fn with_max_duration(mut self, duration: Duration) -> Self {
        self.max_duration = Some(duration);
        self
    }

    fn exhausted(&self, attempts: u32, elapsed: Duration) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
            || self.max_duration.is_some_and(|max| elapsed >= max)
    }
}

/// Outcome of a successful wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessReport {
    /// Polls made, including the successful one.
    pub attempts: u32,
    /// Time from the first poll to readiness.
    pub elapsed: Duration,
}

/// Polls the cluster until the control plane answers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadinessProber {
    config: PollConfig,
}

impl ReadinessProber {
    /// Creates a prober.
    #[must_use]
    pub const fn new(config: PollConfig) -> Self {
        Self { config }
    }

    /// The polling parameters.
    #[must_use]
    pub const fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Waits for the control plane.
    ///
    /// # Errors
    ///
    /// Returns [`ReadinessError::Timeout`] when a configured ceiling is hit,
    /// [`ReadinessError::Client`] when the client itself cannot be set up,
    /// and [`ReadinessError::Cancelled`] when `cancel` fires.
    pub async fn wait_until_ready(
        &self,
        cluster: &dyn ClusterApi,
        cancel: &CancellationToken,
    ) -> Result<ReadinessReport, ReadinessError> {
        let start = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(cancelled(attempts, cancel));
            }

            attempts += 1;
            match cluster.list_pods(SYSTEM_NAMESPACE).await {
                Ok(pods) if !pods.is_empty() => {
                    let elapsed = start.elapsed();
                    debug!(attempts, pods = pods.len(), "Control plane answered");
                    return Ok(ReadinessReport { attempts, elapsed });
                }
                Ok(_) => info!(attempts, "Control plane not ready: no system pods yet"),
                Err(e) if e.is_transient() => {
                    info!(attempts, error = %e, "Control plane not ready");
                }
                Err(e) => return Err(ReadinessError::Client(e)),
            }

            let elapsed = start.elapsed();
            if self.config.exhausted(attempts, elapsed) {
                return Err(ReadinessError::Timeout { attempts, elapsed });
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.interval) => {}
                () = cancel.cancelled() => return Err(cancelled(attempts, cancel)),
            }
        }
    }
}

fn cancelled(attempts: u32, cancel: &CancellationToken) -> ReadinessError {
    ReadinessError::Cancelled {
        attempts,
        reason: cancel.reason().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{KubeClusterApi, MockClusterApi, PodSummary};
    use crate::config::CredentialCache;
    use crate::errors::{ClusterError, ConfigError};
    use std::sync::Arc;

    fn poll() -> PollConfig {
        PollConfig::new(Duration::from_secs(10))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_first_attempt() {
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_list_pods()
            .times(1)
            .returning(|_| Ok(vec![PodSummary::new("etcd-node1")]));

        let report = ReadinessProber::new(poll())
            .wait_until_ready(&cluster, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.attempts, 1);
        assert_eq!(report.elapsed, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_errors_and_empty_lists() {
        let mut cluster = MockClusterApi::new();
        let mut calls = 0;
        cluster
            .expect_list_pods()
            .withf(|ns| ns == SYSTEM_NAMESPACE)
            .times(4)
            .returning(move |_| {
                calls += 1;
                match calls {
                    1 | 2 => Err(ClusterError::Transport("connection refused".to_string())),
                    3 => Ok(Vec::new()),
                    _ => Ok(vec![PodSummary::new("kube-apiserver-node1")]),
                }
            });

        let report = ReadinessProber::new(poll())
            .wait_until_ready(&cluster, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.attempts, 4);
        assert_eq!(report.elapsed, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_are_not_retried() {
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_list_pods()
            .times(1)
            .returning(|_| Err(ClusterError::Client("invalid certificate data".to_string())));

        let err = ReadinessProber::new(poll())
            .wait_until_ready(&cluster, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ReadinessError::Client(ClusterError::Client(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_kubeconfig_fails_without_ceiling() {
        let cluster = KubeClusterApi::new(Arc::new(CredentialCache::new(
            "/nonexistent/clusterseed/admin.conf",
        )));

        let err = ReadinessProber::new(poll())
            .wait_until_ready(&cluster, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ReadinessError::Client(ClusterError::Credentials(ConfigError::ReadCredentials { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_ceiling() {
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_list_pods()
            .times(3)
            .returning(|_| Err(ClusterError::Transport("connection refused".to_string())));

        let err = ReadinessProber::new(poll().with_max_attempts(3))
            .wait_until_ready(&cluster, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ReadinessError::Timeout { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_ceiling() {
        let mut cluster = MockClusterApi::new();
        cluster.expect_list_pods().returning(|_| Ok(Vec::new()));

        let err = ReadinessProber::new(poll().with_max_duration(Duration::from_secs(25)))
            .wait_until_ready(&cluster, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            ReadinessError::Timeout { attempts, elapsed } => {
                assert_eq!(attempts, 4);
                assert!(elapsed >= Duration::from_secs(25));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_start() {
        let cluster = MockClusterApi::new();
        let cancel = CancellationToken::new();
        cancel.cancel("interrupted");

        let err = ReadinessProber::new(poll())
            .wait_until_ready(&cluster, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, ReadinessError::Cancelled { attempts: 0, ref reason } if reason == "interrupted"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_sleep() {
        let mut cluster = MockClusterApi::new();
        cluster.expect_list_pods().returning(|_| Ok(Vec::new()));
        let cluster = Arc::new(cluster);
        let cancel = Arc::new(CancellationToken::new());

        let waiter = {
            let cluster = cluster.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                ReadinessProber::new(poll())
                    .wait_until_ready(cluster.as_ref(), &cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(15)).await;
        cancel.cancel("shutdown");

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, ReadinessError::Cancelled { attempts: 2, .. }));
    }
}
