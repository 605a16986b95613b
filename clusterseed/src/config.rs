//! Bootstrap configuration and the admin credential cache.
//!
//! A [`BootstrapConfig`] is built once at startup and shared by reference.
//! The kubeconfig only exists after `kubeadm init`, so credentials are read
//! lazily through a [`CredentialCache`], at most once per run.

use crate::errors::ConfigError;
use crate::readiness::PollConfig;
use kube::config::Kubeconfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;

/// Default static cluster-init configuration consumed by `kubeadm`.
pub const DEFAULT_CLUSTER_CONFIG: &str = "/root/clusterconfig.yaml";
/// Default admin kubeconfig written by `kubeadm`.
pub const DEFAULT_KUBECONFIG: &str = "/etc/kubernetes/admin.conf";
/// Default storage override manifests.
pub const DEFAULT_ROOK_OVERRIDES: &str = "/root/rook-overrides.yaml";
/// Default policy-engine policies.
pub const DEFAULT_POLICIES: &str = "/root/default-policies.yaml";
/// Default helm repository cache directory.
pub const DEFAULT_HELM_CACHE: &str = "/tmp/.helmcache";
/// Default helm repository config file.
pub const DEFAULT_HELM_REPOSITORY_CONFIG: &str = "/tmp/.helmrepo";
/// Default readiness poll interval in seconds.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

/// Configuration for one bootstrap run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// `kubeadm init --config` input.
    pub cluster_config_path: PathBuf,
    /// Admin kubeconfig used by the API client, `kubectl`, and helm.
    pub kubeconfig_path: PathBuf,
    /// Manifests applied to the storage namespace before the operator.
    pub rook_overrides_path: PathBuf,
    /// Policy manifests applied last.
    pub default_policies_path: PathBuf,
    /// Helm repository cache directory.
    pub helm_repository_cache: PathBuf,
    /// Helm repository config file.
    pub helm_repository_config: PathBuf,
    /// Seconds between readiness polls.
    pub poll_interval_secs: u64,
    /// Give up readiness polling after this many attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_max_attempts: Option<u32>,
    /// Give up readiness polling after this many seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_timeout_secs: Option<u64>,
    /// Use this address instead of probing the default route.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_address: Option<IpAddr>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            cluster_config_path: PathBuf::from(DEFAULT_CLUSTER_CONFIG),
            kubeconfig_path: PathBuf::from(DEFAULT_KUBECONFIG),
            rook_overrides_path: PathBuf::from(DEFAULT_ROOK_OVERRIDES),
            default_policies_path: PathBuf::from(DEFAULT_POLICIES),
            helm_repository_cache: PathBuf::from(DEFAULT_HELM_CACHE),
            helm_repository_config: PathBuf::from(DEFAULT_HELM_REPOSITORY_CONFIG),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            readiness_max_attempts: None,
            readiness_timeout_secs: None,
            host_address: None,
        }
    }
}

impl BootstrapConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the admin kubeconfig path.
    #[must_use]
    pub fn with_kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig_path = path.into();
        self
    }

    /// Sets the readiness poll interval.
    #[must_use]
    pub fn with_poll_interval_secs(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs;
        self
    }

    /// Pins the host address instead of discovering it.
    #[must_use]
    pub fn with_host_address(mut self, address: IpAddr) -> Self {
        self.host_address = Some(address);
        self
    }

    /// Checks values that would make the run meaningless.
    ///
    /// # Errors
    ///
    /// Returns an error for a zero poll interval or a zero readiness ceiling.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("poll interval must be at least one second".to_string()));
        }
        if self.readiness_max_attempts == Some(0) {
            return Err(ConfigError::Invalid("readiness attempt ceiling must be positive".to_string()));
        }
        if self.readiness_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid("readiness timeout must be positive".to_string()));
        }
        Ok(())
    }

    /// Readiness polling parameters derived from this configuration.
    #[must_use]
    pub fn poll_config(&self) -> PollConfig {
        let mut poll = PollConfig::new(Duration::from_secs(self.poll_interval_secs));
        if let Some(attempts) = self.readiness_max_attempts {
            poll = poll.with_max_attempts(attempts);
        }
        if let Some(secs) = self.readiness_timeout_secs {
            poll = poll.with_max_duration(Duration::from_secs(secs));
        }
        poll
    }
}

/// Parsed admin credentials.
#[derive(Clone)]
pub struct Credentials {
    /// Parsed kubeconfig.
    pub kubeconfig: Kubeconfig,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("current_context", &self.kubeconfig.current_context)
            .finish_non_exhaustive()
    }
}

/// Reads the admin kubeconfig on first use and caches it for the run.
pub struct CredentialCache {
    path: PathBuf,
    cell: OnceCell<Credentials>,
}

impl CredentialCache {
    /// Creates an empty cache for the given kubeconfig path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cell: OnceCell::new(),
        }
    }

    /// The kubeconfig path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns whether the credentials have been loaded.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }

    /// Returns the credentials, reading the file on the first call only.
    ///
    /// A failed read leaves the cache empty so a later call can retry.
    pub async fn get(&self) -> Result<&Credentials, ConfigError> {
        self.cell.get_or_try_init(|| self.load()).await
    }

    async fn load(&self) -> Result<Credentials, ConfigError> {
        debug!(path = %self.path.display(), "Reading kubeconfig");

        let raw = tokio::fs::read(&self.path)
            .await
            .map_err(|source| ConfigError::ReadCredentials {
                path: self.path.clone(),
                source,
            })?;

        let text = std::str::from_utf8(&raw).map_err(|e| ConfigError::ParseCredentials {
            path: self.path.clone(),
            message: e.to_string(),
        })?;

        let kubeconfig = Kubeconfig::from_yaml(text).map_err(|e| ConfigError::ParseCredentials {
            path: self.path.clone(),
            message: e.to_string(),
        })?;

        Ok(Credentials { kubeconfig })
    }
}

impl fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCache")
            .field("path", &self.path)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
