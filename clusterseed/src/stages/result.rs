//! Per-stage results collected by the runner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Final state of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    /// Every step succeeded.
    Completed,
    /// A step failed and the run stopped here.
    Failed,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// What happened to one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage name.
    pub name: String,
    /// Final state.
    pub status: StageStatus,
    /// Wall-clock start.
    pub started_at: DateTime<Utc>,
    /// Wall-clock end.
    pub ended_at: DateTime<Utc>,
    /// Time spent, measured on the runtime clock.
    pub duration: Duration,
    /// Steps that ran to success.
    pub steps_completed: usize,
    /// Failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageRecord {
    /// A successful stage.
    #[must_use]
    pub fn completed(
        name: impl Into<String>,
        started_at: DateTime<Utc>,
        duration: Duration,
        steps_completed: usize,
    ) -> Self {
        Self {
            name: name.into(),
            status: StageStatus::Completed,
            started_at,
            ended_at: Utc::now(),
            duration,
            steps_completed,
            error: None,
        }
    }

    /// A failed stage.
    #[must_use]
    pub fn failed(
        name: impl Into<String>,
        started_at: DateTime<Utc>,
        duration: Duration,
        steps_completed: usize,
        error: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            status: StageStatus::Failed,
            started_at,
            ended_at: Utc::now(),
            duration,
            steps_completed,
            error: Some(error.into()),
        }
    }

    /// Returns true if the stage completed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == StageStatus::Completed
    }
}
