//! Pipeline lifecycle events.
//!
//! The runner emits `pipeline.started`, `stage.started`, `stage.completed`,
//! `stage.failed`, `pipeline.completed`, and `pipeline.failed` to an
//! [`EventSink`] carried by the run context.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink};

/// Event emitted before the first stage runs.
pub const PIPELINE_STARTED: &str = "pipeline.started";
/// Event emitted after the last stage succeeds.
pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
/// Event emitted when a stage aborts the run.
pub const PIPELINE_FAILED: &str = "pipeline.failed";
/// Event emitted when a stage begins.
pub const STAGE_STARTED: &str = "stage.started";
/// Event emitted when every step of a stage succeeded.
pub const STAGE_COMPLETED: &str = "stage.completed";
/// Event emitted when a step of a stage failed.
pub const STAGE_FAILED: &str = "stage.failed";
