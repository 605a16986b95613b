//! # Clusterseed
//!
//! One-shot bootstrap of a single-node Kubernetes cluster.
//!
//! A run brings up the node services, initialises the control plane, waits
//! for the API server, and then installs networking, policy, storage, and
//! GitOps add-ons. Every step is fatal on failure; nothing is rolled back.
//!
//! The work is described as a [`PipelineSpec`](pipeline::PipelineSpec) of
//! ordered stages. Each stage is a list of steps that act through three
//! collaborators:
//!
//! - **Commands**: [`CommandRunner`](command::CommandRunner) for the
//!   service manager, `kubeadm`, `kubectl`, and helm
//! - **Cluster API**: [`ClusterApi`](cluster::ClusterApi) for namespaces and
//!   the readiness poll
//! - **Charts**: [`ChartInstaller`](charts::ChartInstaller) for repositories
//!   and install-or-upgrade releases
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use clusterseed::prelude::*;
//! use std::sync::Arc;
//!
//! let config = Arc::new(BootstrapConfig::default());
//! let ctx = BootstrapContext::new(config.clone(), Collaborators::system(&config));
//!
//! let pipeline = Pipeline::new(bootstrap_pipeline(&config))?;
//! let report = pipeline.run(&ctx).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod charts;
pub mod cluster;
pub mod command;
pub mod config;
pub mod context;
pub mod errors;
pub mod events;
pub mod host;
pub mod observability;
pub mod pipeline;
pub mod readiness;
pub mod stages;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::charts::{
        ChartInstallSpec, ChartInstaller, ChartValues, HelmChartInstaller, Release,
        RepositoryEntry,
    };
    pub use crate::cluster::{ClusterApi, KubeClusterApi, PodSummary};
    pub use crate::command::{CommandOutput, CommandRunner, CommandSpec, SystemCommandRunner};
    pub use crate::config::{BootstrapConfig, CredentialCache};
    pub use crate::context::{BootstrapContext, Collaborators};
    pub use crate::errors::{
        BootstrapError, ChartError, ClusterError, CommandError, ConfigError, HostAddressError,
        PipelineError, PipelineValidationError, ReadinessError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink};
    pub use crate::host::{DefaultRouteResolver, HostAddress, HostResolver, StaticHostResolver};
    pub use crate::observability::init_tracing;
    pub use crate::pipeline::{
        bootstrap_pipeline, FailurePolicy, Pipeline, PipelineReport, PipelineSpec, StageSpec,
    };
    pub use crate::readiness::{PollConfig, ReadinessProber, ReadinessReport};
    pub use crate::stages::{Action, Capability, StageRecord, Step};
}
