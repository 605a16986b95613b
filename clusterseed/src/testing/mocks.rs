//! Recording doubles for the collaborator traits.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use crate::charts::{ChartInstallSpec, ChartInstaller, ChartValues, Release, RepositoryEntry};
use crate::cluster::{ClusterApi, PodSummary, PREEXISTING_NAMESPACES, SYSTEM_NAMESPACE};
use crate::command::{CommandOutput, CommandRunner, CommandSpec};
use crate::errors::{ChartError, ClusterError, CommandError};
use crate::host::HOST_PLACEHOLDER;

/// Ordered record of every collaborator call, shared between doubles.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    /// All entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Entries starting with `prefix`.
    #[must_use]
    pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Command runner that records invocations and succeeds unless told otherwise.
///
/// Logs `command:<command line>`.
#[derive(Debug, Default)]
pub struct MockCommandRunner {
    log: CallLog,
    commands: Mutex<Vec<CommandSpec>>,
    failures: Mutex<Vec<(String, String)>>,
}

impl MockCommandRunner {
    /// Creates a runner writing to `log`.
    #[must_use]
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    /// Fails any command whose line contains `pattern`, with `output` as the
    /// captured output.
    pub fn fail_when(&self, pattern: impl Into<String>, output: impl Into<String>) {
        self.failures.lock().push((pattern.into(), output.into()));
    }

    /// Number of commands run.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.commands.lock().len()
    }

    /// Commands run, oldest first.
    #[must_use]
    pub fn commands(&self) -> Vec<CommandSpec> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl CommandRunner for MockCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let line = spec.to_string();
        self.log.record(format!("command:{line}"));
        self.commands.lock().push(spec.clone());

        let failure = self
            .failures
            .lock()
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, output)| output.clone());

        match failure {
            Some(output) => Err(CommandError::Failed {
                command: line,
                exit_code: Some(1),
                output,
            }),
            None => Ok(CommandOutput::default()),
        }
    }
}

/// Cluster API double.
///
/// Pod listings are served from a script, then fall back to a single
/// running API server pod. Namespaces behave like the real API: creating
/// one that exists fails with a conflict. Logs `pods:<ns>` and
/// `namespace:<name>`.
#[derive(Debug)]
pub struct MockClusterApi {
    log: CallLog,
    pod_script: Mutex<VecDeque<Result<Vec<PodSummary>, String>>>,
    namespaces: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    list_calls: Mutex<usize>,
}

impl MockClusterApi {
    /// Creates an API with only the built-in namespaces.
    #[must_use]
    pub fn new(log: CallLog) -> Self {
        let namespaces = PREEXISTING_NAMESPACES
            .iter()
            .map(|ns| ((*ns).to_string(), BTreeMap::new()))
            .collect();
        Self {
            log,
            pod_script: Mutex::new(VecDeque::new()),
            namespaces: Mutex::new(namespaces),
            list_calls: Mutex::new(0),
        }
    }

    /// Queues pod listing results. `Err` entries become transport errors.
    pub fn script_pods(&self, responses: impl IntoIterator<Item = Result<Vec<PodSummary>, String>>) {
        self.pod_script.lock().extend(responses);
    }

    /// Queues `n` empty listings.
    pub fn not_ready_for(&self, n: usize) {
        self.script_pods(std::iter::repeat_with(|| Ok(Vec::new())).take(n));
    }

    /// Number of pod listings served.
    #[must_use]
    pub fn list_calls(&self) -> usize {
        *self.list_calls.lock()
    }

    /// Labels of a namespace, if it exists.
    #[must_use]
    pub fn namespace(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.namespaces.lock().get(name).cloned()
    }
}

fn already_exists(name: &str) -> ClusterError {
    ClusterError::Api {
        operation: format!("create {name} namespace"),
        source: kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("namespaces \"{name}\" already exists"),
            reason: "AlreadyExists".to_string(),
            code: 409,
        }),
    }
}

#[async_trait]
impl ClusterApi for MockClusterApi {
    async fn create_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ClusterError> {
        self.log.record(format!("namespace:{name}"));

        let mut namespaces = self.namespaces.lock();
        if namespaces.contains_key(name) {
            return Err(already_exists(name));
        }
        namespaces.insert(name.to_string(), labels.clone());
        Ok(())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodSummary>, ClusterError> {
        self.log.record(format!("pods:{namespace}"));
        *self.list_calls.lock() += 1;

        match self.pod_script.lock().pop_front() {
            Some(Ok(pods)) => Ok(pods),
            Some(Err(message)) => Err(ClusterError::Transport(message)),
            None if namespace == SYSTEM_NAMESPACE => Ok(vec![PodSummary {
                name: "kube-apiserver".to_string(),
                phase: Some("Running".to_string()),
            }]),
            None => Ok(Vec::new()),
        }
    }
}

/// Chart installer double with install-or-upgrade semantics.
///
/// Each install of a (release, namespace) pair bumps its revision. Logs
/// `repo:<name>` and `install:<ns>/<release>`.
#[derive(Debug, Default)]
pub struct MockChartInstaller {
    log: CallLog,
    repositories: Mutex<Vec<RepositoryEntry>>,
    revisions: Mutex<HashMap<(String, String), u32>>,
    installs: Mutex<Vec<ChartInstallSpec>>,
    failures: Mutex<HashMap<String, String>>,
}

impl MockChartInstaller {
    /// Creates an installer writing to `log`.
    #[must_use]
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    /// Makes installs of `release` fail with `output` as helm's output.
    pub fn fail_release(&self, release: impl Into<String>, output: impl Into<String>) {
        self.failures.lock().insert(release.into(), output.into());
    }

    /// Repositories registered, in order, including repeats.
    #[must_use]
    pub fn repositories(&self) -> Vec<RepositoryEntry> {
        self.repositories.lock().clone()
    }

    /// Install requests received, in order.
    #[must_use]
    pub fn installs(&self) -> Vec<ChartInstallSpec> {
        self.installs.lock().clone()
    }

    /// Current revision of a release.
    #[must_use]
    pub fn revision(&self, release: &str, namespace: &str) -> Option<u32> {
        self.revisions
            .lock()
            .get(&(release.to_string(), namespace.to_string()))
            .copied()
    }
}

#[async_trait]
impl ChartInstaller for MockChartInstaller {
    async fn add_or_update_repository(&self, entry: &RepositoryEntry) -> Result<(), ChartError> {
        self.log.record(format!("repo:{}", entry.name));
        self.repositories.lock().push(entry.clone());
        Ok(())
    }

    async fn install_or_upgrade(&self, spec: &ChartInstallSpec) -> Result<Release, ChartError> {
        self.log
            .record(format!("install:{}/{}", spec.namespace, spec.release_name));
        self.installs.lock().push(spec.clone());

        let unrendered = match &spec.values {
            ChartValues::HostTemplated(_) => true,
            ChartValues::Static(yaml) => yaml.contains(HOST_PLACEHOLDER),
            ChartValues::None => false,
        };
        if unrendered {
            return Err(ChartError::UnrenderedValues(spec.release_name.clone()));
        }

        if let Some(output) = self.failures.lock().get(&spec.release_name) {
            return Err(ChartError::Command(CommandError::Failed {
                command: format!("helm upgrade {} {} --install", spec.release_name, spec.chart),
                exit_code: Some(1),
                output: output.clone(),
            }));
        }

        let mut revisions = self.revisions.lock();
        let revision = revisions
            .entry((spec.release_name.clone(), spec.namespace.clone()))
            .and_modify(|r| *r += 1)
            .or_insert(1);

        Ok(Release {
            name: spec.release_name.clone(),
            namespace: spec.namespace.clone(),
            revision: *revision,
            status: "deployed".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_command_runner_fails_on_pattern() {
        let log = CallLog::new();
        let runner = MockCommandRunner::new(log.clone());
        runner.fail_when("kubeadm", "preflight failed");

        assert!(runner.run(&CommandSpec::new("systemctl")).await.is_ok());
        let err = runner.run(&CommandSpec::new("kubeadm").arg("init")).await.unwrap_err();

        assert_eq!(err.output(), Some("preflight failed"));
        assert_eq!(log.entries(), vec!["command:systemctl", "command:kubeadm init"]);
    }

    #[tokio::test]
    async fn test_cluster_api_scripted_pods() {
        let api = MockClusterApi::new(CallLog::new());
        api.script_pods([Err("connection refused".to_string()), Ok(Vec::new())]);

        assert!(api.list_pods(SYSTEM_NAMESPACE).await.is_err());
        assert!(api.list_pods(SYSTEM_NAMESPACE).await.unwrap().is_empty());
        assert_eq!(api.list_pods(SYSTEM_NAMESPACE).await.unwrap().len(), 1);
        assert_eq!(api.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_cluster_api_rejects_duplicate_namespace() {
        let api = MockClusterApi::new(CallLog::new());
        let labels = BTreeMap::new();

        api.create_namespace("kyverno", &labels).await.unwrap();
        let err = api.create_namespace("kyverno", &labels).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));

        assert!(api.create_namespace("kube-system", &labels).await.is_err());
    }

    #[tokio::test]
    async fn test_chart_installer_bumps_revision() {
        let charts = MockChartInstaller::new(CallLog::new());
        let spec = ChartInstallSpec::new("kyverno", "kyverno/kyverno", "kyverno");

        assert_eq!(charts.install_or_upgrade(&spec).await.unwrap().revision, 1);
        assert_eq!(charts.install_or_upgrade(&spec).await.unwrap().revision, 2);
        assert_eq!(charts.revision("kyverno", "kyverno"), Some(2));
    }

    #[tokio::test]
    async fn test_chart_installer_scripted_failure() {
        let charts = MockChartInstaller::new(CallLog::new());
        charts.fail_release("rook-ceph", "timed out waiting for the condition");

        let spec = ChartInstallSpec::new("rook-ceph", "rook/rook-ceph", "rook-ceph");
        let err = charts.install_or_upgrade(&spec).await.unwrap_err();

        assert!(matches!(err, ChartError::Command(_)));
        assert!(charts.revision("rook-ceph", "rook-ceph").is_none());
    }
}
