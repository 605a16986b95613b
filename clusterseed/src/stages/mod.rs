//! Stage building blocks.
//!
//! A stage is an ordered list of [`Step`]s. Each step names an [`Action`]
//! and the [`Capability`] values it consumes and produces, which lets a
//! pipeline be checked for ordering mistakes before anything runs.

mod result;
mod step;

pub use result::{StageRecord, StageStatus};
pub use step::{Action, Capability, Step, StepOutcome};
