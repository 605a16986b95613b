//! Test doubles for bootstrap pipelines.
//!
//! The doubles record every call into a shared [`CallLog`] so tests can
//! assert on the exact sequence of side effects a run produced.

mod fixtures;
mod mocks;

pub use fixtures::{TestHarness, TEST_HOST_ADDRESS};
pub use mocks::{CallLog, MockChartInstaller, MockClusterApi, MockCommandRunner};
