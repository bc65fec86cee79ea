//! Per-case and per-task results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::CaseError;
use crate::task::ExecutionModel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub passed: bool,
    pub actual_output: String,
    /// Kept for diagnostics only, never compared.
    pub stderr: String,
    pub error: Option<CaseError>,
    /// Wall time of the instance run that executed this case.
    pub duration_ms: u64,
}

impl CaseResult {
    pub fn pass(actual_output: String, stderr: String, duration_ms: u64) -> Self {
        Self {
            passed: true,
            actual_output,
            stderr,
            error: None,
            duration_ms,
        }
    }

    pub fn fail(error: CaseError, actual_output: String, stderr: String, duration_ms: u64) -> Self {
        Self {
            passed: false,
            actual_output,
            stderr,
            error: Some(error),
            duration_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub passed_count: usize,
    pub total: usize,
    /// One entry per test case, in task order.
    pub cases: Vec<CaseResult>,
    pub execution_model: ExecutionModel,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    pub fn from_cases(
        cases: Vec<CaseResult>,
        execution_model: ExecutionModel,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            passed_count: cases.iter().filter(|case| case.passed).count(),
            total: cases.len(),
            cases,
            execution_model,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn all_passed(&self) -> bool {
        self.passed_count == self.total
    }
}
