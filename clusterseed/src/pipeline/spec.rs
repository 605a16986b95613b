//! Pipeline and stage specifications.

use crate::errors::PipelineValidationError;
use crate::stages::{Action, Capability, Step};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// How the runner treats a failing stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Abort the run. Nothing already applied is undone.
    #[default]
    Fatal,
}

/// Specification for a single stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Unique stage name.
    pub name: String,
    /// Logged when the stage starts.
    pub description: String,
    /// Steps, run in order.
    pub steps: Vec<Step>,
    /// What a failure does to the run.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl StageSpec {
    /// Creates an empty stage.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            steps: Vec::new(),
            failure_policy: FailurePolicy::Fatal,
        }
    }

    /// Appends a step.
    #[must_use]
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Appends several steps.
    #[must_use]
    pub fn with_steps(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.steps.extend(steps);
        self
    }

    /// Validates the stage on its own.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is blank or there are no steps.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.name.trim().is_empty() {
            return Err(PipelineValidationError::new("Stage name cannot be empty or whitespace-only"));
        }
        if self.steps.is_empty() {
            return Err(PipelineValidationError::new(format!("Stage '{}' has no steps", self.name))
                .with_stages(vec![self.name.clone()]));
        }
        Ok(())
    }
}

/// An ordered list of stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// The pipeline name.
    pub name: String,
    /// Stages in execution order.
    #[serde(default)]
    pub stages: Vec<StageSpec>,
}

impl PipelineSpec {
    /// Creates an empty pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty or whitespace-only.
    pub fn new(name: impl Into<String>) -> Result<Self, PipelineValidationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(PipelineValidationError::new(
                "Pipeline name cannot be empty or whitespace-only",
            ));
        }

        Ok(Self {
            name,
            stages: Vec::new(),
        })
    }

    /// Replaces the stage list.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<StageSpec>) -> Self {
        self.stages = stages;
        self
    }

    /// Appends a stage.
    #[must_use]
    pub fn stage(mut self, stage: StageSpec) -> Self {
        self.stages.push(stage);
        self
    }

    /// Stage names, in order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Returns the stage with this name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Checks that the declared order can succeed.
    ///
    /// Walks the stages in order, tracking which capabilities earlier steps
    /// established; every step's requirements must already be met.
    ///
    /// # Errors
    ///
    /// Returns the first violation: an empty pipeline, a bad stage, a
    /// duplicate stage name, a duplicate release in one namespace, or a step
    /// scheduled before one of its preconditions.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.stages.is_empty() {
            return Err(PipelineValidationError::new("Pipeline has no stages"));
        }

        let mut names = HashSet::new();
        let mut releases: HashMap<(&str, &str), &str> = HashMap::new();
        let mut available: HashSet<Capability> = HashSet::new();

        for stage in &self.stages {
            stage.validate()?;

            if !names.insert(stage.name.as_str()) {
                return Err(PipelineValidationError::new(format!(
                    "Duplicate stage name '{}'",
                    stage.name
                ))
                .with_stages(vec![stage.name.clone()]));
            }

            for step in &stage.steps {
                if let Action::InstallChart(chart) = &step.action {
                    let key = (chart.release_name.as_str(), chart.namespace.as_str());
                    if let Some(first) = releases.insert(key, stage.name.as_str()) {
                        return Err(PipelineValidationError::new(format!(
                            "Release '{}' in namespace '{}' is installed by both '{}' and '{}'",
                            chart.release_name, chart.namespace, first, stage.name
                        ))
                        .with_stages(vec![first.to_string(), stage.name.clone()]));
                    }
                }

                for need in step.requirements() {
                    if !available.contains(&need) {
                        return Err(PipelineValidationError::new(format!(
                            "Stage '{}' step '{}' requires {} but no earlier step provides it",
                            stage.name,
                            step.describe(),
                            need
                        ))
                        .with_stages(self.providers_of(&need, &stage.name)));
                    }
                }

                available.extend(step.provisions());
            }
        }

        Ok(())
    }

    fn providers_of(&self, capability: &Capability, consumer: &str) -> Vec<String> {
        let mut stages = vec![consumer.to_string()];
        stages.extend(
            self.stages
                .iter()
                .filter(|s| s.steps.iter().any(|step| step.provisions().contains(capability)))
                .map(|s| s.name.clone()),
        );
        stages
    }
}
