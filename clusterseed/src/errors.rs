//! Error types for the bootstrap pipeline.
//!
//! Each collaborator has its own error enum; they roll up into
//! [`BootstrapError`], and the pipeline wraps the first failure in a
//! [`PipelineError`] naming the stage that aborted the run.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The main error type for a single bootstrap step.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// An external command failed to launch or exited non-zero.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// A call against the cluster API failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// A chart repository registration or chart install failed.
    #[error(transparent)]
    Chart(#[from] ChartError),

    /// The host address could not be discovered or was missing.
    #[error(transparent)]
    HostAddress(#[from] HostAddressError),

    /// The control plane never became ready.
    #[error(transparent)]
    Readiness(#[from] ReadinessError),

    /// Configuration or credential loading failed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The run was cancelled before the step started.
    #[error("Bootstrap cancelled: {0}")]
    Cancelled(String),
}

impl BootstrapError {
    /// Returns the captured output of a failed command, if any.
    ///
    /// Chart installs run through the command runner too, so their helm
    /// output surfaces here as well.
    #[must_use]
    pub fn command_output(&self) -> Option<&str> {
        match self {
            Self::Command(err) => err.output(),
            Self::Chart(ChartError::Command(err)) => err.output(),
            _ => None,
        }
    }
}

/// Errors from running an external process.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The process could not be started.
    #[error("Failed to launch `{command}`: {source}")]
    Launch {
        /// The rendered command line.
        command: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The process started but its output could not be collected.
    #[error("Failed to collect output of `{command}`: {source}")]
    Output {
        /// The rendered command line.
        command: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The process ran and exited unsuccessfully.
    #[error("`{command}` exited with {}", exit_status(.exit_code))]
    Failed {
        /// The rendered command line.
        command: String,
        /// Exit code, `None` when terminated by a signal.
        exit_code: Option<i32>,
        /// Combined stdout and stderr.
        output: String,
    },
}

fn exit_status(code: &Option<i32>) -> String {
    code.map_or_else(|| "no exit code (killed by signal)".to_string(), |c| format!("status {c}"))
}

impl CommandError {
    /// Returns the captured combined output, if the process ran.
    #[must_use]
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Launch { .. } | Self::Output { .. } => None,
            Self::Failed { output, .. } => Some(output),
        }
    }
}

/// Errors from the cluster API client.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Admin credentials could not be loaded.
    #[error(transparent)]
    Credentials(#[from] ConfigError),

    /// A client could not be built from the credentials.
    #[error("Failed to create kubernetes client: {0}")]
    Client(String),

    /// An API request failed.
    #[error("Failed to {operation}: {source}")]
    Api {
        /// What was being attempted, e.g. `create namespace kyverno`.
        operation: String,
        /// The kube error.
        #[source]
        source: kube::Error,
    },

    /// A transport-level failure without a kube error attached.
    #[error("Cluster transport error: {0}")]
    Transport(String),
}

impl ClusterError {
    /// Whether a retry can succeed: API and transport failures are, a
    /// missing kubeconfig or an unusable client are not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Api { .. } | Self::Transport(_))
    }
}

/// Errors from the chart installer.
#[derive(Debug, Error)]
pub enum ChartError {
    /// The helm invocation failed.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// The values payload could not be written for helm.
    #[error("Failed to stage values for release '{release}': {source}")]
    Values {
        /// The release being installed.
        release: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Helm's release description could not be parsed.
    #[error("Unreadable release output for '{release}': {source}")]
    ReleaseOutput {
        /// The release being installed.
        release: String,
        /// The JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The values still carry a host placeholder.
    #[error("Values for release '{0}' were not rendered with the host address")]
    UnrenderedValues(String),
}

/// Errors while discovering or using the host address.
#[derive(Debug, Error)]
pub enum HostAddressError {
    /// The outbound route probe failed.
    #[error("Failed to get default ip: {0}")]
    Discovery(#[source] std::io::Error),

    /// A templated payload was rendered before discovery ran.
    #[error("Host address has not been discovered yet")]
    NotDiscovered,
}

/// Errors from the readiness prober.
#[derive(Debug, Error)]
pub enum ReadinessError {
    /// A configured ceiling was reached before the control plane answered.
    #[error("Control plane not ready after {attempts} attempts ({elapsed:?})")]
    Timeout {
        /// Number of polls made.
        attempts: u32,
        /// Time spent polling.
        elapsed: Duration,
    },

    /// The client could not be set up; retrying cannot help.
    #[error("Cannot reach the control plane: {0}")]
    Client(#[source] ClusterError),

    /// The wait was cancelled.
    #[error("Readiness wait cancelled after {attempts} attempts: {reason}")]
    Cancelled {
        /// Number of polls made.
        attempts: u32,
        /// Cancellation reason.
        reason: String,
    },
}

/// Configuration and credential errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The kubeconfig file could not be read.
    #[error("Failed to read kubeconfig file {}: {source}", .path.display())]
    ReadCredentials {
        /// Path that was read.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The kubeconfig file could not be parsed.
    #[error("Failed to parse kubernetes config {}: {message}", .path.display())]
    ParseCredentials {
        /// Path that was read.
        path: PathBuf,
        /// Parser message.
        message: String,
    },

    /// A configuration value is unusable.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Error raised when a pipeline definition violates ordering rules.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }
}

/// The error that aborts a pipeline run.
#[derive(Debug, Error)]
#[error("Stage '{stage}' failed at '{step}': {source}")]
pub struct PipelineError {
    /// Name of the stage that failed.
    pub stage: String,
    /// Description of the failing step.
    pub step: String,
    /// The underlying error.
    #[source]
    pub source: BootstrapError,
}

impl PipelineError {
    /// Creates a new stage failure.
    #[must_use]
    pub fn new(stage: impl Into<String>, step: impl Into<String>, source: BootstrapError) -> Self {
        Self {
            stage: stage.into(),
            step: step.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_display() {
        let err = CommandError::Failed {
            command: "kubeadm init".to_string(),
            exit_code: Some(1),
            output: "preflight errors".to_string(),
        };

        assert_eq!(err.to_string(), "`kubeadm init` exited with status 1");
        assert_eq!(err.output(), Some("preflight errors"));
    }

    #[test]
    fn test_command_killed_display() {
        let err = CommandError::Failed {
            command: "kubeadm init".to_string(),
            exit_code: None,
            output: String::new(),
        };

        assert!(err.to_string().contains("killed by signal"));
    }

    #[test]
    fn test_launch_error_has_no_output() {
        let err = CommandError::Launch {
            command: "missing-binary".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };

        assert!(err.output().is_none());
    }

    #[test]
    fn test_command_output_through_chart_error() {
        let err = BootstrapError::from(ChartError::Command(CommandError::Failed {
            command: "helm upgrade".to_string(),
            exit_code: Some(1),
            output: "timed out waiting for the condition".to_string(),
        }));

        assert_eq!(err.command_output(), Some("timed out waiting for the condition"));
    }

    #[test]
    fn test_stage_failure_names_stage_and_cause() {
        let failure = PipelineError::new(
            "rook-ceph",
            "install chart rook/rook-ceph",
            BootstrapError::Chart(ChartError::Command(CommandError::Failed {
                command: "helm upgrade rook-ceph rook/rook-ceph --install".to_string(),
                exit_code: Some(1),
                output: "timed out waiting for the condition".to_string(),
            })),
        );

        let text = failure.to_string();
        assert!(text.starts_with("Stage 'rook-ceph' failed at 'install chart rook/rook-ceph'"));
        assert_eq!(text.matches("exited with status 1").count(), 1);
    }

    #[test]
    fn test_validation_error_stages() {
        let err = PipelineValidationError::new("bad order")
            .with_stages(vec!["cilium".to_string()]);

        assert_eq!(err.to_string(), "bad order");
        assert_eq!(err.stages, vec!["cilium".to_string()]);
    }
}
