//! Run context shared by every stage of one bootstrap.
//!
//! The context owns the collaborators the steps act through, the event sink,
//! the cancellation token, and the little state that crosses stage
//! boundaries: the discovered host address, written at most once.

use crate::cancellation::CancellationToken;
use crate::charts::{ChartInstaller, HelmChartInstaller};
use crate::cluster::{ClusterApi, KubeClusterApi};
use crate::command::{CommandRunner, SystemCommandRunner};
use crate::config::{BootstrapConfig, CredentialCache};
use crate::events::{EventSink, LoggingEventSink};
use crate::host::{DefaultRouteResolver, HostAddress, HostResolver, StaticHostResolver};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

/// The external systems a run talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Runs external processes.
    pub commands: Arc<dyn CommandRunner>,
    /// Talks to the API server.
    pub cluster: Arc<dyn ClusterApi>,
    /// Registers repositories and installs charts.
    pub charts: Arc<dyn ChartInstaller>,
    /// Finds the host address.
    pub host_resolver: Arc<dyn HostResolver>,
}

impl Collaborators {
    /// Wires the real implementations for `config`.
    ///
    /// A pinned `host_address` in the configuration replaces route probing.
    #[must_use]
    pub fn system(config: &Arc<BootstrapConfig>) -> Self {
        let commands: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);
        let credentials = Arc::new(CredentialCache::new(&config.kubeconfig_path));

        let host_resolver: Arc<dyn HostResolver> = match config.host_address {
            Some(ip) => Arc::new(StaticHostResolver(HostAddress::new(ip))),
            None => Arc::new(DefaultRouteResolver::default()),
        };

        Self {
            charts: Arc::new(HelmChartInstaller::new(commands.clone(), config.clone())),
            cluster: Arc::new(KubeClusterApi::new(credentials)),
            commands,
            host_resolver,
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Everything a stage needs while it runs.
pub struct BootstrapContext {
    config: Arc<BootstrapConfig>,
    collaborators: Collaborators,
    events: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
    host_address: OnceLock<HostAddress>,
    run_id: Uuid,
}

impl BootstrapContext {
    /// Creates a context that logs events and is not cancelled.
    #[must_use]
    pub fn new(config: Arc<BootstrapConfig>, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
            events: Arc::new(LoggingEventSink),
            cancel: Arc::new(CancellationToken::new()),
            host_address: OnceLock::new(),
            run_id: Uuid::new_v4(),
        }
    }

    /// Sends lifecycle events to `sink`.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Observes an externally owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// The run configuration.
    #[must_use]
    pub fn config(&self) -> &BootstrapConfig {
        &self.config
    }

    /// The command runner.
    #[must_use]
    pub fn commands(&self) -> &dyn CommandRunner {
        self.collaborators.commands.as_ref()
    }

    /// The cluster API.
    #[must_use]
    pub fn cluster(&self) -> &dyn ClusterApi {
        self.collaborators.cluster.as_ref()
    }

    /// The chart installer.
    #[must_use]
    pub fn charts(&self) -> &dyn ChartInstaller {
        self.collaborators.charts.as_ref()
    }

    /// The host resolver.
    #[must_use]
    pub fn host_resolver(&self) -> &dyn HostResolver {
        self.collaborators.host_resolver.as_ref()
    }

    /// The cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Identifier of this run, attached to events and spans.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The host address, once discovered.
    #[must_use]
    pub fn host_address(&self) -> Option<&HostAddress> {
        self.host_address.get()
    }

    /// Stores the host address. The first value sticks; the stored value is
    /// returned either way.
    pub fn record_host_address(&self, address: HostAddress) -> HostAddress {
        *self.host_address.get_or_init(|| address)
    }

    /// Forwards an event to the sink.
    pub fn emit(&self, event_type: &str, data: Value) {
        self.events.emit(event_type, Some(data));
    }
}

impl fmt::Debug for BootstrapContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapContext")
            .field("run_id", &self.run_id)
            .field("config", &self.config)
            .field("host_address", &self.host_address.get())
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}
