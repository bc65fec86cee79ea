//! Error types for every stage of the execution pipeline
//!
//! Errors are split by the scope they affect. `ArchiveError`, `ProvisionError`
//! and most `RunnerError` variants abort a whole task: nothing meaningful ran,
//! so the caller gets an error instead of a result. `CaseError` is scoped to a
//! single test case and lives inside the per-case breakdown of a
//! [`RunResult`](crate::result::RunResult). Disposal failures have no variant
//! at all; they are logged and swallowed so they never mask the real outcome.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Malformed file-tree input or a failure writing the archive stream.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("archive path is empty")]
    EmptyPath,
    #[error("archive path '{0}' must be relative")]
    AbsolutePath(String),
    #[error("archive path '{0}' escapes the working directory")]
    ParentTraversal(String),
    #[error("archive path '{0}' is not a normalised relative path")]
    InvalidPath(String),
    #[error("archive path '{0}' is reserved for the runner")]
    ReservedPath(String),
    #[error("I/O error while writing archive: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reported by the isolation engine capability.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Bollard (Docker client) error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("image build failed:\n{log}")]
    BuildFailed { log: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("image build for '{fingerprint}' failed:\n{log}")]
    BuildFailed { fingerprint: String, log: String },
    #[error("image '{reference}' is not available locally or from its registry")]
    ImageNotFound { reference: String },
    #[error("could not assemble build context: {0}")]
    Archive(#[from] ArchiveError),
    #[error("engine error while resolving image: {0}")]
    Engine(#[from] EngineError),
}

/// Terminal errors returned from [`Runner::run`](crate::runner::Runner::run).
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("invalid task: {0}")]
    InvalidTask(String),
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),
    #[error("provisioning failed: {0}")]
    Provision(#[from] ProvisionError),
    #[error("failed to create instance: {0}")]
    Create(#[source] EngineError),
    #[error("failed to stage files into instance {instance}: {source}")]
    Staging {
        instance: String,
        #[source]
        source: EngineError,
    },
    #[error("failed to start instance {instance}: {source}")]
    Start {
        instance: String,
        #[source]
        source: EngineError,
    },
    #[error("engine error on instance {instance}: {source}")]
    Engine {
        instance: String,
        #[source]
        source: EngineError,
    },
    #[error("run deadline exceeded during {0}")]
    Timeout(String),
    #[error("run cancelled during {0}")]
    Cancelled(String),
    #[error("instance {instance} cannot move from {from} to {to}")]
    InvalidTransition {
        instance: String,
        from: String,
        to: String,
    },
}

/// Why a single test case did not pass.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaseError {
    #[error("compile command failed")]
    Compile,
    #[error("time limit of {limit_ms} ms exceeded")]
    Timeout { limit_ms: u64 },
    #[error("program exited abnormally (exit code {exit_code:?})")]
    Runtime { exit_code: Option<i64> },
    #[error("output does not match the expected output")]
    ComparisonMismatch,
    #[error("case was not executed: {reason}")]
    NotExecuted { reason: String },
    #[error("output limit exceeded before the case finished")]
    OutputLimitExceeded,
}
