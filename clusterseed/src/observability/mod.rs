//! Logging setup and tracing spans.

mod tracing;

pub use self::tracing::{init_tracing, pipeline_span, stage_span};
