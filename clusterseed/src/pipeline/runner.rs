//! Sequential, fail-fast pipeline execution.

use super::spec::{FailurePolicy, PipelineSpec, StageSpec};
use crate::charts::Release;
use crate::context::BootstrapContext;
use crate::errors::{BootstrapError, PipelineError, PipelineValidationError};
use crate::events::{
    PIPELINE_COMPLETED, PIPELINE_FAILED, PIPELINE_STARTED, STAGE_COMPLETED, STAGE_FAILED,
    STAGE_STARTED,
};
use crate::host::HostAddress;
use crate::observability::{pipeline_span, stage_span};
use crate::readiness::ReadinessReport;
use crate::stages::{StageRecord, StepOutcome};
use chrono::Utc;
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, Instrument};
use uuid::Uuid;

/// Result of a successful run. Nothing is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    /// Identifier of the run.
    pub run_id: Uuid,
    /// Stages in execution order.
    pub stages: Vec<StageRecord>,
    /// How the readiness wait went, if the pipeline had one.
    pub readiness: Option<ReadinessReport>,
    /// The discovered host address.
    pub host_address: Option<HostAddress>,
    /// Releases in install order.
    pub releases: Vec<Release>,
    /// Total wall time.
    pub duration: Duration,
}

impl PipelineReport {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            stages: Vec::new(),
            readiness: None,
            host_address: None,
            releases: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    /// Stage names in execution order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    fn absorb(&mut self, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Done => {}
            StepOutcome::Ready(report) => self.readiness = Some(report),
            StepOutcome::HostAddress(address) => self.host_address = Some(address),
            StepOutcome::Installed(release) => self.releases.push(release),
        }
    }
}

/// A validated pipeline, ready to run.
#[derive(Debug, Clone)]
pub struct Pipeline {
    spec: PipelineSpec,
}

impl Pipeline {
    /// Validates `spec` and wraps it.
    ///
    /// # Errors
    ///
    /// Returns the validation error; nothing runs.
    pub fn new(spec: PipelineSpec) -> Result<Self, PipelineValidationError> {
        spec.validate()?;
        Ok(Self { spec })
    }

    /// The underlying specification.
    #[must_use]
    pub fn spec(&self) -> &PipelineSpec {
        &self.spec
    }

    /// Runs every stage in order.
    ///
    /// Stops at the first failing step. The cancellation token is checked
    /// before each stage; a stage already running is allowed to finish its
    /// current step.
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineError`] naming the stage and step that failed.
    pub async fn run(&self, ctx: &BootstrapContext) -> Result<PipelineReport, PipelineError> {
        let total = self.spec.stages.len();
        let span = pipeline_span(ctx.run_id(), total);

        async move {
            let started = Instant::now();
            let mut report = PipelineReport::new(ctx.run_id());

            info!(pipeline = %self.spec.name, stages = total, "Starting bootstrap");
            ctx.emit(
                PIPELINE_STARTED,
                json!({
                    "run_id": ctx.run_id().to_string(),
                    "pipeline": self.spec.name,
                    "stages": self.spec.stage_names(),
                }),
            );

            for (index, stage) in self.spec.stages.iter().enumerate() {
                if let Err(failure) = self
                    .run_stage(stage, ctx, &mut report)
                    .instrument(stage_span(&stage.name, index + 1, total))
                    .await
                {
                    report_failure(&failure);
                    ctx.emit(
                        PIPELINE_FAILED,
                        json!({
                            "run_id": ctx.run_id().to_string(),
                            "stage": failure.stage,
                            "error": failure.to_string(),
                            "completed_stages": report.stage_names(),
                        }),
                    );
                    return Err(failure);
                }
            }

            report.duration = started.elapsed();
            ctx.emit(
                PIPELINE_COMPLETED,
                json!({
                    "run_id": ctx.run_id().to_string(),
                    "stages": report.stage_names(),
                    "duration_ms": duration_ms(report.duration),
                }),
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn run_stage(
        &self,
        stage: &StageSpec,
        ctx: &BootstrapContext,
        report: &mut PipelineReport,
    ) -> Result<(), PipelineError> {
        if ctx.cancellation().is_cancelled() {
            let reason = ctx.cancellation().reason().unwrap_or_default();
            return Err(PipelineError::new(&stage.name, "start", BootstrapError::Cancelled(reason)));
        }

        let started_at = Utc::now();
        let started = Instant::now();
        info!(stage = %stage.name, "{}", stage.description);
        ctx.emit(STAGE_STARTED, json!({"stage": stage.name, "steps": stage.steps.len()}));

        for (completed, step) in stage.steps.iter().enumerate() {
            match step.execute(ctx).await {
                Ok(outcome) => report.absorb(outcome),
                Err(source) => {
                    let failure = PipelineError::new(&stage.name, step.describe(), source);
                    let record = StageRecord::failed(
                        &stage.name,
                        started_at,
                        started.elapsed(),
                        completed,
                        failure.source.to_string(),
                    );
                    ctx.emit(
                        STAGE_FAILED,
                        json!({
                            "stage": stage.name,
                            "step": failure.step,
                            "error": failure.source.to_string(),
                            "duration_ms": duration_ms(record.duration),
                        }),
                    );
                    match stage.failure_policy {
                        FailurePolicy::Fatal => return Err(failure),
                    }
                }
            }
        }

        let record = StageRecord::completed(&stage.name, started_at, started.elapsed(), stage.steps.len());
        info!(stage = %stage.name, duration = ?record.duration, "Stage completed");
        ctx.emit(
            STAGE_COMPLETED,
            json!({"stage": stage.name, "duration_ms": duration_ms(record.duration)}),
        );
        report.stages.push(record);
        Ok(())
    }
}

fn report_failure(failure: &PipelineError) {
    if let Some(output) = failure.source.command_output() {
        error!(stage = %failure.stage, output = %output.trim_end(), "Command output");
    }
    error!(stage = %failure.stage, step = %failure.step, error = %failure.source, "Stage failed");
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandSpec;
    use crate::stages::Step;
    use crate::testing::TestHarness;

    fn two_commands() -> PipelineSpec {
        PipelineSpec::new("commands")
            .unwrap()
            .stage(StageSpec::new("first", "Running first").step(Step::command(CommandSpec::new("first-cmd"))))
            .stage(StageSpec::new("second", "Running second").step(Step::command(CommandSpec::new("second-cmd"))))
    }

    #[test]
    fn test_new_rejects_invalid_spec() {
        let spec = PipelineSpec::new("empty").unwrap();
        assert!(Pipeline::new(spec).is_err());
    }

    #[tokio::test]
    async fn test_runs_stages_in_order() {
        let harness = TestHarness::new();
        let pipeline = Pipeline::new(two_commands()).unwrap();

        let report = pipeline.run(&harness.context()).await.unwrap();

        assert_eq!(report.stage_names(), vec!["first", "second"]);
        assert_eq!(harness.log.entries(), vec!["command:first-cmd", "command:second-cmd"]);
        assert_eq!(
            harness.events.event_types(),
            vec![
                PIPELINE_STARTED,
                STAGE_STARTED,
                STAGE_COMPLETED,
                STAGE_STARTED,
                STAGE_COMPLETED,
                PIPELINE_COMPLETED,
            ]
        );
    }

    #[tokio::test]
    async fn test_first_failure_stops_the_run() {
        let harness = TestHarness::new();
        harness.commands.fail_when("first-cmd", "boom");
        let pipeline = Pipeline::new(two_commands()).unwrap();

        let err = pipeline.run(&harness.context()).await.unwrap_err();

        assert_eq!(err.stage, "first");
        assert_eq!(err.source.command_output(), Some("boom"));
        assert_eq!(harness.commands.calls(), 1);
        assert_eq!(harness.events.event_types().last().map(String::as_str), Some(PIPELINE_FAILED));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let harness = TestHarness::new();
        let ctx = harness.context();
        ctx.cancellation().cancel("interrupt");

        let err = Pipeline::new(two_commands()).unwrap().run(&ctx).await.unwrap_err();

        assert_eq!(err.stage, "first");
        assert!(matches!(err.source, BootstrapError::Cancelled(ref reason) if reason == "interrupt"));
        assert_eq!(harness.commands.calls(), 0);
    }
}
