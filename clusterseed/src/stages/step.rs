//! Steps, the actions inside a stage, and the capabilities they trade in.

use crate::charts::{ChartInstallSpec, Release, RepositoryEntry};
use crate::cluster::PREEXISTING_NAMESPACES;
use crate::command::CommandSpec;
use crate::context::BootstrapContext;
use crate::errors::BootstrapError;
use crate::host::HostAddress;
use crate::readiness::{ReadinessProber, ReadinessReport};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};

/// A precondition one step establishes and a later step relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum Capability {
    /// Kubelet and the container runtime are running.
    NodeServices,
    /// `kubeadm init` has completed.
    ControlPlaneInitialized,
    /// The API server answers.
    ControlPlane,
    /// A chart repository is registered under this alias.
    Repository(String),
    /// A namespace exists.
    Namespace(String),
    /// The host address has been discovered.
    HostAddress,
    /// A release is installed in a namespace.
    Release {
        /// Release name.
        name: String,
        /// Namespace the release lives in.
        namespace: String,
    },
    /// CRDs of an API group are installed.
    Crds(String),
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeServices => write!(f, "node services"),
            Self::ControlPlaneInitialized => write!(f, "an initialised control plane"),
            Self::ControlPlane => write!(f, "a ready control plane"),
            Self::Repository(name) => write!(f, "chart repository '{name}'"),
            Self::Namespace(name) => write!(f, "namespace '{name}'"),
            Self::HostAddress => write!(f, "the host address"),
            Self::Release { name, namespace } => write!(f, "release '{namespace}/{name}'"),
            Self::Crds(group) => write!(f, "CRDs for {group}"),
        }
    }
}

impl Capability {
    /// The release `name` in `namespace`.
    #[must_use]
    pub fn release(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self::Release {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

/// What a step does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Runs an external command.
    RunCommand(CommandSpec),
    /// Polls until the API server answers.
    AwaitControlPlane,
    /// Creates a namespace.
    CreateNamespace {
        /// Namespace name.
        name: String,
        /// Labels set at creation.
        #[serde(default)]
        labels: BTreeMap<String, String>,
    },
    /// Registers a chart repository.
    AddRepository(RepositoryEntry),
    /// Discovers the host address and stores it in the context.
    DiscoverHostAddress,
    /// Installs or upgrades a chart.
    InstallChart(ChartInstallSpec),
}

/// What a step produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing worth reporting.
    Done,
    /// The control plane became ready.
    Ready(ReadinessReport),
    /// The host address is known.
    HostAddress(HostAddress),
    /// A release converged.
    Installed(Release),
}

/// One action plus the capabilities it needs and establishes beyond those
/// implied by the action itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// The action.
    pub action: Action,
    /// Extra preconditions.
    #[serde(default)]
    pub requires: Vec<Capability>,
    /// Extra postconditions.
    #[serde(default)]
    pub provides: Vec<Capability>,
}

impl Step {
    /// Wraps an action.
    #[must_use]
    pub fn new(action: Action) -> Self {
        Self {
            action,
            requires: Vec::new(),
            provides: Vec::new(),
        }
    }

    /// A command step.
    #[must_use]
    pub fn command(spec: CommandSpec) -> Self {
        Self::new(Action::RunCommand(spec))
    }

    /// A readiness wait.
    #[must_use]
    pub fn await_control_plane() -> Self {
        Self::new(Action::AwaitControlPlane)
    }

    /// A namespace creation.
    #[must_use]
    pub fn create_namespace(name: impl Into<String>) -> Self {
        Self::new(Action::CreateNamespace {
            name: name.into(),
            labels: BTreeMap::new(),
        })
    }

    /// A namespace creation with labels.
    #[must_use]
    pub fn create_labelled_namespace<I, K, V>(name: impl Into<String>, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::new(Action::CreateNamespace {
            name: name.into(),
            labels: labels.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        })
    }

    /// A repository registration.
    #[must_use]
    pub fn add_repository(entry: RepositoryEntry) -> Self {
        Self::new(Action::AddRepository(entry))
    }

    /// A host address discovery.
    #[must_use]
    pub fn discover_host_address() -> Self {
        Self::new(Action::DiscoverHostAddress)
    }

    /// A chart install.
    #[must_use]
    pub fn install_chart(spec: ChartInstallSpec) -> Self {
        Self::new(Action::InstallChart(spec))
    }

    /// Adds a precondition.
    #[must_use]
    pub fn requires(mut self, capability: Capability) -> Self {
        self.requires.push(capability);
        self
    }

    /// Adds a postcondition.
    #[must_use]
    pub fn provides(mut self, capability: Capability) -> Self {
        self.provides.push(capability);
        self
    }

    /// Every precondition, implied and explicit.
    #[must_use]
    pub fn requirements(&self) -> Vec<Capability> {
        let mut needs = match &self.action {
            Action::RunCommand(spec) if is_cluster_command(spec) => vec![Capability::ControlPlane],
            Action::AwaitControlPlane => vec![Capability::ControlPlaneInitialized],
            Action::CreateNamespace { .. } => vec![Capability::ControlPlane],
            Action::InstallChart(spec) => {
                let mut needs = vec![Capability::ControlPlane];
                if let Some(repo) = spec.repository().filter(|r| !r.starts_with('.')) {
                    needs.push(Capability::Repository(repo.to_string()));
                }
                if !PREEXISTING_NAMESPACES.contains(&spec.namespace.as_str()) {
                    needs.push(Capability::Namespace(spec.namespace.clone()));
                }
                if spec.values.needs_host() {
                    needs.push(Capability::HostAddress);
                }
                needs
            }
            Action::RunCommand(_) | Action::AddRepository(_) | Action::DiscoverHostAddress => Vec::new(),
        };
        for extra in &self.requires {
            if !needs.contains(extra) {
                needs.push(extra.clone());
            }
        }
        needs
    }

    /// Every postcondition, implied and explicit.
    #[must_use]
    pub fn provisions(&self) -> Vec<Capability> {
        let mut gives = match &self.action {
            Action::AwaitControlPlane => vec![Capability::ControlPlane],
            Action::CreateNamespace { name, .. } => vec![Capability::Namespace(name.clone())],
            Action::AddRepository(entry) => vec![Capability::Repository(entry.name.clone())],
            Action::DiscoverHostAddress => vec![Capability::HostAddress],
            Action::InstallChart(spec) => {
                vec![Capability::release(&spec.release_name, &spec.namespace)]
            }
            Action::RunCommand(_) => Vec::new(),
        };
        for extra in &self.provides {
            if !gives.contains(extra) {
                gives.push(extra.clone());
            }
        }
        gives
    }

    /// Short human-readable label, used in logs and errors.
    #[must_use]
    pub fn describe(&self) -> String {
        match &self.action {
            Action::RunCommand(spec) => format!("run `{spec}`"),
            Action::AwaitControlPlane => "await control plane".to_string(),
            Action::CreateNamespace { name, .. } => format!("create namespace {name}"),
            Action::AddRepository(entry) => format!("add repository {}", entry.name),
            Action::DiscoverHostAddress => "discover host address".to_string(),
            Action::InstallChart(spec) => {
                format!("install chart {} as {}/{}", spec.chart, spec.namespace, spec.release_name)
            }
        }
    }

    /// Performs the action against the context's collaborators.
    ///
    /// # Errors
    ///
    /// Propagates the collaborator's error unchanged.
    pub async fn execute(&self, ctx: &BootstrapContext) -> Result<StepOutcome, BootstrapError> {
        match &self.action {
            Action::RunCommand(spec) => {
                let output = ctx.commands().run(spec).await?;
                debug!(command = %spec, output = %output.combined.trim_end(), "Command finished");
                Ok(StepOutcome::Done)
            }
            Action::AwaitControlPlane => {
                let prober = ReadinessProber::new(ctx.config().poll_config());
                let report = prober.wait_until_ready(ctx.cluster(), ctx.cancellation()).await?;
                info!(attempts = report.attempts, elapsed = ?report.elapsed, "Control plane ready");
                Ok(StepOutcome::Ready(report))
            }
            Action::CreateNamespace { name, labels } => {
                ctx.cluster().create_namespace(name, labels).await?;
                info!(namespace = %name, "Namespace created");
                Ok(StepOutcome::Done)
            }
            Action::AddRepository(entry) => {
                ctx.charts().add_or_update_repository(entry).await?;
                Ok(StepOutcome::Done)
            }
            Action::DiscoverHostAddress => {
                let address = match ctx.host_address() {
                    Some(known) => *known,
                    None => ctx.record_host_address(ctx.host_resolver().discover().await?),
                };
                info!(host_address = %address, "Host address discovered");
                Ok(StepOutcome::HostAddress(address))
            }
            Action::InstallChart(spec) => {
                let rendered = spec.rendered(ctx.host_address())?;
                let release = ctx.charts().install_or_upgrade(&rendered).await?;
                Ok(StepOutcome::Installed(release))
            }
        }
    }
}

fn is_cluster_command(spec: &CommandSpec) -> bool {
    spec.program == "kubectl" || spec.args.iter().any(|arg| arg.contains("kubectl "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::charts::ChartValues;

    #[test]
    fn test_chart_install_requirements() {
        let step = Step::install_chart(
            ChartInstallSpec::new("cilium", "cilium/cilium", "kube-system")
                .with_values(ChartValues::HostTemplated("k8sServiceHost: K8SHOST".to_string())),
        );

        assert_eq!(
            step.requirements(),
            vec![
                Capability::ControlPlane,
                Capability::Repository("cilium".to_string()),
                Capability::HostAddress,
            ]
        );
        assert_eq!(step.provisions(), vec![Capability::release("cilium", "kube-system")]);
    }

    #[test]
    fn test_install_into_new_namespace_requires_it() {
        let step = Step::install_chart(ChartInstallSpec::new("kyverno", "kyverno/kyverno", "kyverno"));

        assert!(step.requirements().contains(&Capability::Namespace("kyverno".to_string())));
        assert!(!step.requirements().contains(&Capability::HostAddress));
    }

    #[test]
    fn test_kubectl_commands_need_control_plane() {
        let apply = Step::command(CommandSpec::new("kubectl").args(["apply", "-f", "/root/default-policies.yaml"]));
        let taint = Step::command(CommandSpec::shell("kubectl taint nodes $(hostname -f) x-"));
        let systemctl = Step::command(CommandSpec::shell("systemctl enable --now kubelet crio"));

        assert_eq!(apply.requirements(), vec![Capability::ControlPlane]);
        assert_eq!(taint.requirements(), vec![Capability::ControlPlane]);
        assert!(systemctl.requirements().is_empty());
    }

    #[test]
    fn test_explicit_capabilities_merge_without_duplicates() {
        let step = Step::create_namespace("rook-ceph")
            .requires(Capability::ControlPlane)
            .provides(Capability::Namespace("rook-ceph".to_string()));

        assert_eq!(step.requirements(), vec![Capability::ControlPlane]);
        assert_eq!(step.provisions(), vec![Capability::Namespace("rook-ceph".to_string())]);
    }

    #[test]
    fn test_describe() {
        let step = Step::install_chart(ChartInstallSpec::new("rook-ceph", "rook/rook-ceph", "rook-ceph"));
        assert_eq!(step.describe(), "install chart rook/rook-ceph as rook-ceph/rook-ceph");
        assert_eq!(Step::await_control_plane().describe(), "await control plane");
    }
}
