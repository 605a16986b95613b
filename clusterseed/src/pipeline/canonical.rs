//! The single-node bootstrap, stage by stage.

use super::spec::{PipelineSpec, StageSpec};
use crate::charts::{ChartInstallSpec, ChartValues, RepositoryEntry};
use crate::cluster::SYSTEM_NAMESPACE;
use crate::command::CommandSpec;
use crate::config::BootstrapConfig;
use crate::stages::{Capability, Step};
use std::path::Path;
use std::time::Duration;

/// Name of the canonical pipeline.
pub const PIPELINE_NAME: &str = "single-node-bootstrap";

/// Network plugin values; `K8SHOST` is replaced with the host address.
pub const CILIUM_VALUES: &str = include_str!("../../values/cilium.yaml");
/// Storage operator values.
pub const ROOK_OPERATOR_VALUES: &str = include_str!("../../values/rook-op.yaml");
/// Storage cluster values.
pub const ROOK_CLUSTER_VALUES: &str = include_str!("../../values/rook-cluster.yaml");
/// GitOps dashboard values.
pub const GITOPS_VALUES: &str = include_str!("../../values/weave.yaml");

const GATEWAY_API_GROUP: &str = "gateway.networking.k8s.io";
const GATEWAY_API_BASE: &str = "https://raw.githubusercontent.com/kubernetes-sigs/gateway-api/v0.7.1/config/crd";
const GATEWAY_API_CRDS: &[&str] = &[
    "standard/gateway.networking.k8s.io_gatewayclasses.yaml",
    "standard/gateway.networking.k8s.io_gateways.yaml",
    "standard/gateway.networking.k8s.io_httproutes.yaml",
    "standard/gateway.networking.k8s.io_referencegrants.yaml",
    "experimental/gateway.networking.k8s.io_tlsroutes.yaml",
];

const PRIVILEGED_POD_SECURITY: (&str, &str) = ("pod-security.kubernetes.io/enforce", "privileged");

const fn minutes(n: u64) -> Duration {
    Duration::from_secs(n * 60)
}

/// Chart repositories the bootstrap registers.
#[must_use]
pub fn chart_repositories() -> Vec<RepositoryEntry> {
    vec![
        RepositoryEntry::new("cilium", "https://helm.cilium.io/"),
        RepositoryEntry::new("kyverno", "https://kyverno.github.io/kyverno/"),
        RepositoryEntry::new("rook", "https://charts.rook.io/release"),
        RepositoryEntry::new("gitops", "https://helm.gitops.weave.works/"),
    ]
}

fn kubectl(args: &str, kubeconfig: &Path) -> CommandSpec {
    CommandSpec::shell(format!("kubectl {args} --kubeconfig='{}'", kubeconfig.display()))
}

fn kubectl_apply(file: &Path, kubeconfig: &Path) -> CommandSpec {
    kubectl(&format!("apply -f {}", file.display()), kubeconfig)
}

/// Builds the twelve-stage bootstrap for `config`.
///
/// The result is a plain spec; [`Pipeline::new`](super::Pipeline::new)
/// validates it.
#[must_use]
pub fn bootstrap_pipeline(config: &BootstrapConfig) -> PipelineSpec {
    let kubeconfig = config.kubeconfig_path.as_path();

    let gateway_crds = GATEWAY_API_CRDS
        .iter()
        .map(|crd| format!("-f {GATEWAY_API_BASE}/{crd}"))
        .collect::<Vec<_>>()
        .join(" ");

    let stages = vec![
        StageSpec::new("node-services", "Enabling and starting kubelet and CRI-O").step(
            Step::command(CommandSpec::shell("systemctl enable --now kubelet crio"))
                .provides(Capability::NodeServices),
        ),
        StageSpec::new("control-plane-init", "Initializing Kubernetes cluster").step(
            Step::command(
                CommandSpec::new("kubeadm")
                    .arg("init")
                    .arg("--config")
                    .arg(config.cluster_config_path.display().to_string()),
            )
            .requires(Capability::NodeServices)
            .provides(Capability::ControlPlaneInitialized),
        ),
        StageSpec::new("control-plane-ready", "Waiting for the control plane")
            .step(Step::await_control_plane()),
        StageSpec::new("untaint-node", "Untainting node").step(Step::command(kubectl(
            "taint nodes $(hostname -f) node-role.kubernetes.io/control-plane=master:NoSchedule-",
            kubeconfig,
        ))),
        StageSpec::new("gateway-crds", "Creating Gateway CRDs").step(
            Step::command(kubectl(&format!("apply {gateway_crds}"), kubeconfig))
                .provides(Capability::Crds(GATEWAY_API_GROUP.to_string())),
        ),
        StageSpec::new("chart-repositories", "Adding Helm repositories")
            .with_steps(chart_repositories().into_iter().map(Step::add_repository)),
        StageSpec::new("host-address", "Discovering default IP").step(Step::discover_host_address()),
        StageSpec::new("cilium", "Deploying Cilium").step(
            Step::install_chart(
                ChartInstallSpec::new("cilium", "cilium/cilium", SYSTEM_NAMESPACE)
                    .with_version("v1.14.0")
                    .with_values(ChartValues::HostTemplated(CILIUM_VALUES.to_string()))
                    .with_timeout(minutes(7)),
            )
            .requires(Capability::Crds(GATEWAY_API_GROUP.to_string())),
        ),
        StageSpec::new("kyverno", "Deploying Kyverno")
            .step(Step::create_namespace("kyverno"))
            .step(Step::install_chart(
                ChartInstallSpec::new("kyverno", "kyverno/kyverno", "kyverno").with_timeout(minutes(4)),
            )),
        StageSpec::new("rook-ceph", "Deploying Rook Ceph")
            .step(Step::create_labelled_namespace("rook-ceph", [PRIVILEGED_POD_SECURITY]))
            .step(
                Step::command(kubectl_apply(&config.rook_overrides_path, kubeconfig))
                    .requires(Capability::Namespace("rook-ceph".to_string())),
            )
            .step(Step::install_chart(
                ChartInstallSpec::new("rook-ceph", "rook/rook-ceph", "rook-ceph")
                    .with_values(ChartValues::Static(ROOK_OPERATOR_VALUES.to_string()))
                    .with_timeout(minutes(2)),
            ))
            .step(
                Step::install_chart(
                    ChartInstallSpec::new("rook-ceph-cluster", "rook/rook-ceph-cluster", "rook-ceph")
                        .with_values(ChartValues::Static(ROOK_CLUSTER_VALUES.to_string()))
                        .with_timeout(minutes(5)),
                )
                .requires(Capability::release("rook-ceph", "rook-ceph")),
            ),
        StageSpec::new("weave-gitops", "Deploying Weave GitOps")
            .step(Step::create_namespace("weave-gitops"))
            .step(Step::install_chart(
                ChartInstallSpec::new("weave-gitops", "gitops/weave-gitops", "weave-gitops")
                    .with_values(ChartValues::Static(GITOPS_VALUES.to_string()))
                    .with_timeout(minutes(15)),
            )),
        StageSpec::new("default-policies", "Installing default policies").step(
            Step::command(kubectl_apply(&config.default_policies_path, kubeconfig))
                .requires(Capability::release("kyverno", "kyverno")),
        ),
    ];

    PipelineSpec {
        name: PIPELINE_NAME.to_string(),
        stages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostAddress, HOST_PLACEHOLDER};
    use crate::stages::Action;
    use pretty_assertions::assert_eq;

    const ORDER: [&str; 12] = [
        "node-services",
        "control-plane-init",
        "control-plane-ready",
        "untaint-node",
        "gateway-crds",
        "chart-repositories",
        "host-address",
        "cilium",
        "kyverno",
        "rook-ceph",
        "weave-gitops",
        "default-policies",
    ];

    fn installs(spec: &PipelineSpec) -> Vec<&ChartInstallSpec> {
        spec.stages
            .iter()
            .flat_map(|s| &s.steps)
            .filter_map(|step| match &step.action {
                Action::InstallChart(chart) => Some(chart),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_canonical_order_validates() {
        let spec = bootstrap_pipeline(&BootstrapConfig::default());

        assert_eq!(spec.stage_names(), ORDER.to_vec());
        spec.validate().unwrap();
    }

    #[test]
    fn test_every_install_waits() {
        let spec = bootstrap_pipeline(&BootstrapConfig::default());
        let charts = installs(&spec);

        assert_eq!(charts.len(), 5);
        assert!(charts.iter().all(|c| c.wait && c.wait_for_jobs));
    }

    #[test]
    fn test_install_parameters() {
        let spec = bootstrap_pipeline(&BootstrapConfig::default());
        let summary: Vec<(&str, &str, &str, u64)> = installs(&spec)
            .into_iter()
            .map(|c| (c.release_name.as_str(), c.chart.as_str(), c.namespace.as_str(), c.timeout.as_secs()))
            .collect();

        assert_eq!(
            summary,
            vec![
                ("cilium", "cilium/cilium", "kube-system", 420),
                ("kyverno", "kyverno/kyverno", "kyverno", 240),
                ("rook-ceph", "rook/rook-ceph", "rook-ceph", 120),
                ("rook-ceph-cluster", "rook/rook-ceph-cluster", "rook-ceph", 300),
                ("weave-gitops", "gitops/weave-gitops", "weave-gitops", 900),
            ]
        );
    }

    #[test]
    fn test_cilium_values_are_host_templated() {
        let spec = bootstrap_pipeline(&BootstrapConfig::default());
        let cilium = installs(&spec)[0].clone();

        assert_eq!(cilium.version.as_deref(), Some("v1.14.0"));
        assert!(CILIUM_VALUES.contains(HOST_PLACEHOLDER));

        let rendered = cilium.rendered(Some(&HostAddress::new("10.0.0.5".parse().unwrap()))).unwrap();
        let yaml = rendered.values.as_yaml().unwrap();
        assert!(yaml.contains("k8sServiceHost: 10.0.0.5"));
        assert!(!yaml.contains(HOST_PLACEHOLDER));
    }

    #[test]
    fn test_commands_use_configured_paths() {
        let config = BootstrapConfig {
            cluster_config_path: "/srv/cluster.yaml".into(),
            default_policies_path: "/srv/policies.yaml".into(),
            ..BootstrapConfig::default()
        }
        .with_kubeconfig("/srv/admin.conf");
        let spec = bootstrap_pipeline(&config);

        let command = |stage: &str| match &spec.get(stage).unwrap().steps[0].action {
            Action::RunCommand(command) => command.to_string(),
            other => panic!("unexpected action {other:?}"),
        };

        assert_eq!(command("control-plane-init"), "kubeadm init --config /srv/cluster.yaml");
        assert_eq!(
            command("default-policies"),
            "bash -c kubectl apply -f /srv/policies.yaml --kubeconfig='/srv/admin.conf'"
        );
        assert!(command("untaint-node").contains("node-role.kubernetes.io/control-plane=master:NoSchedule-"));
        assert_eq!(command("gateway-crds").matches(" -f https://").count(), 5);
    }

    #[test]
    fn test_rook_namespace_is_privileged() {
        let spec = bootstrap_pipeline(&BootstrapConfig::default());

        match &spec.get("rook-ceph").unwrap().steps[0].action {
            Action::CreateNamespace { name, labels } => {
                assert_eq!(name, "rook-ceph");
                assert_eq!(
                    labels.get("pod-security.kubernetes.io/enforce").map(String::as_str),
                    Some("privileged")
                );
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    fn moved(from: &str, to: usize) -> PipelineSpec {
        let mut spec = bootstrap_pipeline(&BootstrapConfig::default());
        let index = spec.stages.iter().position(|s| s.name == from).unwrap();
        let stage = spec.stages.remove(index);
        spec.stages.insert(to, stage);
        spec
    }

    #[test]
    fn test_reordering_past_a_precondition_fails() {
        let cases = [
            ("control-plane-init", 0, "control-plane-init", "node services"),
            ("untaint-node", 1, "untaint-node", "a ready control plane"),
            ("cilium", 5, "cilium", "chart repository 'cilium'"),
            ("cilium", 6, "cilium", "the host address"),
            ("gateway-crds", 7, "cilium", "CRDs for gateway.networking.k8s.io"),
            ("kyverno", 2, "kyverno", "a ready control plane"),
            ("default-policies", 8, "default-policies", "release 'kyverno/kyverno'"),
            ("weave-gitops", 5, "weave-gitops", "chart repository 'gitops'"),
        ];

        for (stage, to, consumer, missing) in cases {
            let err = moved(stage, to).validate().unwrap_err();
            assert!(
                err.message.contains(missing),
                "moving {stage} to {to}: {}",
                err.message
            );
            assert_eq!(err.stages[0], consumer);
        }
    }

    #[test]
    fn test_independent_reorderings_still_validate() {
        // Repositories and host discovery only need to precede the installs.
        assert!(moved("chart-repositories", 0).validate().is_ok());
        assert!(moved("host-address", 0).validate().is_ok());
        assert!(moved("gateway-crds", 3).validate().is_ok());
    }
}
