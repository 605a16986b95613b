//! Pipeline definition and execution.
//!
//! This module provides:
//! - Stage and pipeline specifications with ordering validation
//! - The sequential fail-fast runner
//! - The canonical single-node bootstrap

mod canonical;
mod runner;
mod spec;

pub use canonical::{
    bootstrap_pipeline, chart_repositories, CILIUM_VALUES, GITOPS_VALUES, PIPELINE_NAME,
    ROOK_CLUSTER_VALUES, ROOK_OPERATOR_VALUES,
};
pub use runner::{Pipeline, PipelineReport};
pub use spec::{FailurePolicy, PipelineSpec, StageSpec};
