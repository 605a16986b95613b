//! A fully wired context over recording doubles.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use super::mocks::{CallLog, MockChartInstaller, MockClusterApi, MockCommandRunner};
use crate::cancellation::CancellationToken;
use crate::config::BootstrapConfig;
use crate::context::{BootstrapContext, Collaborators};
use crate::events::CollectingEventSink;
use crate::host::{HostAddress, StaticHostResolver};

/// Address the harness reports as the host's, as text.
pub const TEST_HOST_ADDRESS: &str = "10.0.0.5";

/// Doubles plus the shared call log, event sink, and cancellation token.
///
/// Every context built by [`TestHarness::context`] shares these, so a test
/// can drive a run and then inspect what happened.
#[derive(Debug)]
pub struct TestHarness {
    /// Configuration handed to each context.
    pub config: Arc<BootstrapConfig>,
    /// Ordered record of every collaborator call.
    pub log: CallLog,
    /// Command runner double.
    pub commands: Arc<MockCommandRunner>,
    /// Cluster API double.
    pub cluster: Arc<MockClusterApi>,
    /// Chart installer double.
    pub charts: Arc<MockChartInstaller>,
    /// Collected lifecycle events.
    pub events: Arc<CollectingEventSink>,
    /// Cancellation token shared by every context.
    pub cancel: Arc<CancellationToken>,
    /// Address returned by the host resolver.
    pub host_address: HostAddress,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    /// Creates a harness with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BootstrapConfig::default())
    }

    /// Creates a harness with a specific configuration.
    #[must_use]
    pub fn with_config(config: BootstrapConfig) -> Self {
        let log = CallLog::new();
        let host_address = HostAddress::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)));

        Self {
            config: Arc::new(config),
            commands: Arc::new(MockCommandRunner::new(log.clone())),
            cluster: Arc::new(MockClusterApi::new(log.clone())),
            charts: Arc::new(MockChartInstaller::new(log.clone())),
            events: Arc::new(CollectingEventSink::new()),
            cancel: Arc::new(CancellationToken::new()),
            host_address,
            log,
        }
    }

    /// The doubles as a collaborator set.
    #[must_use]
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            commands: self.commands.clone(),
            cluster: self.cluster.clone(),
            charts: self.charts.clone(),
            host_resolver: Arc::new(StaticHostResolver(self.host_address)),
        }
    }

    /// Builds a fresh context over the shared doubles.
    #[must_use]
    pub fn context(&self) -> BootstrapContext {
        BootstrapContext::new(self.config.clone(), self.collaborators())
            .with_event_sink(self.events.clone())
            .with_cancellation(self.cancel.clone())
    }
}
