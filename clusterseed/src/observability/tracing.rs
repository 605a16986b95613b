//! Subscriber setup and span constructors.

use tracing::{info_span, Level, Span};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

/// Installs the global subscriber.
///
/// `RUST_LOG` takes precedence over `level`. Calling this twice is harmless;
/// the second call leaves the first subscriber in place.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .try_init()
            .ok();
    }
}

/// Span wrapping a whole run.
#[must_use]
pub fn pipeline_span(run_id: Uuid, stages: usize) -> Span {
    info_span!("bootstrap", run_id = %run_id, stages)
}

/// Span wrapping one stage. `index` is 1-based.
#[must_use]
pub fn stage_span(stage: &str, index: usize, total: usize) -> Span {
    info_span!("stage", stage, position = %format!("{index}/{total}"))
}
