//! Sandboxed execution of untrusted programs against test cases.
//!
//! A [`Task`] bundles an environment recipe, a source tree and an ordered list
//! of test cases. [`Runner::run`] resolves the environment to an image, runs
//! the program once per case inside locked-down isolated instances and judges
//! each case's output, returning a [`RunResult`] with a per-case breakdown.
//!
//! # Architecture Overview
//!
//! - **Archive builder**: deterministic tar streams for bulk transfer into an instance
//! - **Environment provisioner**: fingerprint-keyed image cache with single-flight builds
//! - **Instance lifecycle**: create, stage, start, wait and guaranteed disposal
//! - **Execution driver**: maps cases onto instances and enforces time budgets
//! - **Result evaluator**: exact and numeric-tolerant output comparison
//!
//! The container runtime is reached only through the [`IsolationEngine`]
//! trait. [`DockerEngine`] implements it on top of bollard; tests use an
//! in-memory fake.

pub mod archive;
pub mod context;
pub mod driver;
pub mod engine;
pub mod entrypoint;
pub mod errors;
pub mod evaluator;
pub mod lifecycle;
pub mod provision;
pub mod result;
pub mod runner;
pub mod task;

pub use archive::ArchiveBuilder;
pub use context::RunContext;
pub use engine::{DockerEngine, IsolationEngine};
pub use errors::{ArchiveError, CaseError, EngineError, ProvisionError, RunnerError};
pub use evaluator::compare;
pub use provision::Provisioner;
pub use result::{CaseResult, RunResult};
pub use runner::{Runner, RunnerOptions};
pub use task::*;

#[cfg(test)]
pub mod test_utils;
