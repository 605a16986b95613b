//! Chart repositories and chart releases.
//!
//! The [`ChartInstaller`] trait is the seam the pipeline installs add-ons
//! through; [`HelmChartInstaller`] drives the helm CLI with install-or-upgrade
//! semantics so re-running a stage converges on the same release.

use crate::command::{CommandRunner, CommandSpec};
use crate::config::BootstrapConfig;
use crate::errors::{ChartError, HostAddressError};
use crate::host::{HostAddress, HOST_PLACEHOLDER};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// A named chart repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryEntry {
    /// Local alias, used as the `alias/chart` prefix.
    pub name: String,
    /// Repository URL.
    pub url: String,
}

impl RepositoryEntry {
    /// Creates a repository entry.
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

/// Value overrides for a chart install.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "yaml", rename_all = "snake_case")]
pub enum ChartValues {
    /// Chart defaults only.
    #[default]
    None,
    /// A literal YAML payload.
    Static(String),
    /// A YAML payload containing [`HOST_PLACEHOLDER`].
    HostTemplated(String),
}

impl ChartValues {
    /// Whether rendering needs the discovered host address.
    #[must_use]
    pub fn needs_host(&self) -> bool {
        matches!(self, Self::HostTemplated(_))
    }

    /// Produces the final payload.
    ///
    /// # Errors
    ///
    /// Returns [`HostAddressError::NotDiscovered`] for a templated payload
    /// when no address is available.
    pub fn render(&self, host: Option<&HostAddress>) -> Result<Self, HostAddressError> {
        match self {
            Self::HostTemplated(template) => {
                let host = host.ok_or(HostAddressError::NotDiscovered)?;
                Ok(Self::Static(host.render(template)))
            }
            other => Ok(other.clone()),
        }
    }

    /// The payload text, if any.
    #[must_use]
    pub fn as_yaml(&self) -> Option<&str> {
        match self {
            Self::None => None,
            Self::Static(yaml) | Self::HostTemplated(yaml) => Some(yaml),
        }
    }
}

/// Everything needed to install or upgrade one release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartInstallSpec {
    /// Release name, unique per namespace.
    pub release_name: String,
    /// Chart reference, `repository/chart`.
    pub chart: String,
    /// Pinned chart version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Target namespace.
    pub namespace: String,
    /// Value overrides.
    #[serde(default)]
    pub values: ChartValues,
    /// Block until the release's workloads report ready.
    pub wait: bool,
    /// Block until the release's jobs complete.
    pub wait_for_jobs: bool,
    /// Upper bound on the whole operation.
    pub timeout: Duration,
}

impl ChartInstallSpec {
    /// Creates a spec that waits for workloads and jobs, with a five minute timeout.
    #[must_use]
    pub fn new(
        release_name: impl Into<String>,
        chart: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            release_name: release_name.into(),
            chart: chart.into(),
            version: None,
            namespace: namespace.into(),
            values: ChartValues::None,
            wait: true,
            wait_for_jobs: true,
            timeout: Duration::from_secs(300),
        }
    }

    /// Pins the chart version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Sets the value overrides.
    #[must_use]
    pub fn with_values(mut self, values: ChartValues) -> Self {
        self.values = values;
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The repository alias the chart reference points into, if any.
    #[must_use]
    pub fn repository(&self) -> Option<&str> {
        self.chart.split_once('/').map(|(repo, _)| repo)
    }

    /// Returns a copy whose values are fully rendered.
    ///
    /// # Errors
    ///
    /// Fails when the values need a host address that is not available.
    pub fn rendered(&self, host: Option<&HostAddress>) -> Result<Self, HostAddressError> {
        Ok(Self {
            values: self.values.render(host)?,
            ..self.clone()
        })
    }
}

/// An installed release as reported by the installer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    /// Release name.
    pub name: String,
    /// Namespace.
    pub namespace: String,
    /// Revision number, incremented by each upgrade.
    pub revision: u32,
    /// Installer-reported status, e.g. `deployed`.
    pub status: String,
}

/// Installs charts into the cluster.
#[async_trait]
pub trait ChartInstaller: Send + Sync {
    /// Registers or refreshes a repository. Idempotent.
    async fn add_or_update_repository(&self, entry: &RepositoryEntry) -> Result<(), ChartError>;

    /// Installs the release, or upgrades it if it already exists.
    ///
    /// Values must already be rendered; see [`ChartInstallSpec::rendered`].
    async fn install_or_upgrade(&self, spec: &ChartInstallSpec) -> Result<Release, ChartError>;
}

const HELM: &str = "helm";

/// [`ChartInstaller`] that shells out to `helm` from `PATH`.
pub struct HelmChartInstaller {
    runner: Arc<dyn CommandRunner>,
    config: Arc<BootstrapConfig>,
}

impl HelmChartInstaller {
    /// Creates an installer running commands through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, config: Arc<BootstrapConfig>) -> Self {
        Self { runner, config }
    }

    fn with_global_flags(&self, command: CommandSpec) -> CommandSpec {
        command
            .arg("--kubeconfig")
            .arg(self.config.kubeconfig_path.display().to_string())
            .arg("--repository-cache")
            .arg(self.config.helm_repository_cache.display().to_string())
            .arg("--repository-config")
            .arg(self.config.helm_repository_config.display().to_string())
    }

    /// Builds the `helm repo add` invocation.
    #[must_use]
    pub fn repo_add_command(&self, entry: &RepositoryEntry) -> CommandSpec {
        let command = CommandSpec::new(HELM)
            .args(["repo", "add", entry.name.as_str(), entry.url.as_str(), "--force-update"]);
        self.with_global_flags(command)
    }

    /// Builds the `helm upgrade --install` invocation.
    #[must_use]
    pub fn upgrade_command(&self, spec: &ChartInstallSpec, values_file: Option<&Path>) -> CommandSpec {
        let mut command = CommandSpec::new(HELM)
            .args(["upgrade", spec.release_name.as_str(), spec.chart.as_str(), "--install"])
            .args(["--namespace", spec.namespace.as_str()])
            .args(["--output", "json"])
            .arg("--timeout")
            .arg(format!("{}s", spec.timeout.as_secs()));

        if let Some(version) = &spec.version {
            command = command.arg("--version").arg(version);
        }
        if spec.wait {
            command = command.arg("--wait");
        }
        if spec.wait_for_jobs {
            command = command.arg("--wait-for-jobs");
        }
        if let Some(path) = values_file {
            command = command.arg("--values").arg(path.display().to_string());
        }

        self.with_global_flags(command)
    }
}

impl std::fmt::Debug for HelmChartInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelmChartInstaller")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct HelmRelease {
    name: String,
    namespace: String,
    version: u32,
    #[serde(default)]
    info: HelmReleaseInfo,
}

#[derive(Debug, Default, Deserialize)]
struct HelmReleaseInfo {
    #[serde(default)]
    status: String,
}

/// Reads the release document from helm's stdout.
///
/// Only the first JSON value counts; text before it and anything after it
/// is ignored.
fn parse_release(release: &str, stdout: &str) -> Result<Release, ChartError> {
    let to_chart_error = |source: serde_json::Error| ChartError::ReleaseOutput {
        release: release.to_string(),
        source,
    };

    let json = stdout.find('{').map_or(stdout, |start| &stdout[start..]);
    let parsed = serde_json::Deserializer::from_str(json)
        .into_iter::<HelmRelease>()
        .next()
        .unwrap_or_else(|| serde_json::from_str::<HelmRelease>(json))
        .map_err(to_chart_error)?;

    Ok(Release {
        name: parsed.name,
        namespace: parsed.namespace,
        revision: parsed.version,
        status: parsed.info.status,
    })
}

#[async_trait]
impl ChartInstaller for HelmChartInstaller {
    async fn add_or_update_repository(&self, entry: &RepositoryEntry) -> Result<(), ChartError> {
        debug!(repository = %entry.name, url = %entry.url, "Adding chart repository");
        self.runner.run(&self.repo_add_command(entry)).await?;
        Ok(())
    }

    async fn install_or_upgrade(&self, spec: &ChartInstallSpec) -> Result<Release, ChartError> {
        let values_file = match &spec.values {
            ChartValues::None => None,
            ChartValues::HostTemplated(_) => {
                return Err(ChartError::UnrenderedValues(spec.release_name.clone()));
            }
            ChartValues::Static(yaml) => {
                if yaml.contains(HOST_PLACEHOLDER) {
                    return Err(ChartError::UnrenderedValues(spec.release_name.clone()));
                }
                Some(write_values(&spec.release_name, yaml)?)
            }
        };

        let command = self.upgrade_command(spec, values_file.as_ref().map(tempfile::NamedTempFile::path));
        let output = self.runner.run(&command).await?;
        let release = parse_release(&spec.release_name, &output.stdout)?;

        info!(
            release = %release.name,
            namespace = %release.namespace,
            revision = release.revision,
            status = %release.status,
            "Release converged"
        );
        Ok(release)
    }
}

fn write_values(release: &str, yaml: &str) -> Result<tempfile::NamedTempFile, ChartError> {
    let to_chart_error = |source: std::io::Error| ChartError::Values {
        release: release.to_string(),
        source,
    };

    let mut file = tempfile::Builder::new()
        .prefix(&format!("{release}-values-"))
        .suffix(".yaml")
        .tempfile()
        .map_err(to_chart_error)?;
    file.write_all(yaml.as_bytes()).map_err(to_chart_error)?;
    file.flush().map_err(to_chart_error)?;
    Ok(file)
}
