//! Output comparison and per-case verdicts

use crate::entrypoint::{CaseCapture, TIMEOUT_EXIT_STATUS};
use crate::errors::CaseError;
use crate::result::CaseResult;
use crate::task::{ComparisonStrategy, TestCase};

/// Judge `actual` against `expected` under `strategy`.
pub fn compare(actual: &str, expected: &str, strategy: ComparisonStrategy) -> bool {
    match strategy {
        ComparisonStrategy::Exact => trim_trailing_newlines(actual) == trim_trailing_newlines(expected),
        ComparisonStrategy::NumericTolerant { tolerance } => {
            compare_numeric(actual, expected, tolerance)
        }
    }
}

fn trim_trailing_newlines(value: &str) -> &str {
    value.trim_end_matches(['\n', '\r'])
}

fn compare_numeric(actual: &str, expected: &str, tolerance: f64) -> bool {
    let actual: Vec<&str> = actual.split_whitespace().collect();
    let expected: Vec<&str> = expected.split_whitespace().collect();
    if actual.len() != expected.len() {
        return false;
    }

    actual.iter().zip(&expected).all(|(a, e)| {
        match (a.parse::<f64>(), e.parse::<f64>()) {
            (Ok(a), Ok(e)) => within_tolerance(a, e, tolerance),
            _ => false,
        }
    })
}

fn within_tolerance(actual: f64, expected: f64, tolerance: f64) -> bool {
    if actual.is_nan() || expected.is_nan() {
        return false;
    }
    if actual == expected {
        return true;
    }
    let diff = (actual - expected).abs();
    diff <= tolerance || diff <= tolerance * actual.abs().max(expected.abs())
}

/// What the driver observed around one case.
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    pub capture: &'a CaseCapture,
    pub compile_failed: bool,
    pub compile_stderr: &'a str,
    /// The engine-level deadline expired and the instance was force-stopped.
    pub instance_timed_out: bool,
    /// Exit status of the instance, if it exited on its own.
    pub instance_status: Option<i64>,
    /// Instance output hit the capture limit, so later markers may be missing.
    pub output_truncated: bool,
    pub time_limit_ms: u64,
    pub duration_ms: u64,
}

/// Turn an observation into a verdict. Only a clean exit reaches comparison.
pub fn evaluate(case: &TestCase, observation: &Observation<'_>) -> CaseResult {
    let capture = observation.capture;
    let duration_ms = observation.duration_ms;
    let fail = |error: CaseError| {
        CaseResult::fail(
            error,
            capture.stdout.clone(),
            capture.stderr.clone(),
            duration_ms,
        )
    };

    if observation.compile_failed {
        return CaseResult::fail(
            CaseError::Compile,
            String::new(),
            observation.compile_stderr.to_string(),
            duration_ms,
        );
    }

    let timeout = CaseError::Timeout {
        limit_ms: observation.time_limit_ms,
    };
    match capture.status {
        None if observation.output_truncated => fail(CaseError::OutputLimitExceeded),
        None if !capture.started => fail(CaseError::NotExecuted {
            reason: match observation.instance_status {
                Some(status) => format!("instance exited with status {} before the case ran", status),
                None => "instance was stopped before the case ran".to_string(),
            },
        }),
        None if observation.instance_timed_out => fail(timeout),
        None => fail(CaseError::Runtime {
            exit_code: observation.instance_status,
        }),
        Some(TIMEOUT_EXIT_STATUS) => fail(timeout),
        Some(0) => {
            if compare(&capture.stdout, &case.expected_output, case.comparison) {
                CaseResult::pass(capture.stdout.clone(), capture.stderr.clone(), duration_ms)
            } else {
                fail(CaseError::ComparisonMismatch)
            }
        }
        Some(code) => fail(CaseError::Runtime {
            exit_code: Some(code),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(stdout: &str, status: Option<i64>) -> CaseCapture {
        CaseCapture {
            started: true,
            stdout: stdout.to_string(),
            stderr: String::new(),
            status,
        }
    }

    fn observe(capture: &CaseCapture) -> Observation<'_> {
        Observation {
            capture,
            compile_failed: false,
            compile_stderr: "",
            instance_timed_out: false,
            instance_status: Some(0),
            output_truncated: false,
            time_limit_ms: 2000,
            duration_ms: 15,
        }
    }

    #[test]
    fn test_exact_ignores_trailing_newlines_only() {
        assert!(compare("3\n", "3", ComparisonStrategy::Exact));
        assert!(compare("3", "3\r\n", ComparisonStrategy::Exact));
        assert!(compare("1 2\n3\n\n", "1 2\n3", ComparisonStrategy::Exact));
        assert!(!compare("1  2", "1 2", ComparisonStrategy::Exact));
        assert!(!compare(" 3", "3", ComparisonStrategy::Exact));
    }

    #[test]
    fn test_numeric_tolerance() {
        let loose = ComparisonStrategy::NumericTolerant { tolerance: 0.01 };
        assert!(compare("3.0001", "3", loose));
        assert!(compare("1.0 2.0\n", "1 2", loose));
        assert!(!compare("3.5", "3", loose));
        // Relative tolerance dominates for large magnitudes.
        let relative = ComparisonStrategy::NumericTolerant { tolerance: 1e-5 };
        assert!(compare("1000005", "1000000", relative));
        assert!(!compare("1000050", "1000000", relative));
    }

    #[test]
    fn test_numeric_fails_closed() {
        let numeric = ComparisonStrategy::numeric();
        assert!(!compare("abc", "3", numeric));
        assert!(!compare("1 2", "1 2 3", numeric));
        assert!(!compare("NaN", "NaN", numeric));
        assert!(!compare("", "3", numeric));
        assert!(compare("", "", numeric));
    }

    #[test]
    fn test_clean_exit_is_compared() {
        let case = TestCase::new("1\n2", "3");
        let ok = capture("3\n", Some(0));
        assert!(evaluate(&case, &observe(&ok)).passed);

        let wrong = capture("4\n", Some(0));
        let result = evaluate(&case, &observe(&wrong));
        assert!(!result.passed);
        assert_eq!(result.error, Some(CaseError::ComparisonMismatch));
        assert_eq!(result.actual_output, "4\n");
    }

    #[test]
    fn test_timeout_and_runtime_are_distinct() {
        let case = TestCase::new("", "3");

        let timed_out = capture("", Some(TIMEOUT_EXIT_STATUS));
        assert_eq!(
            evaluate(&case, &observe(&timed_out)).error,
            Some(CaseError::Timeout { limit_ms: 2000 })
        );

        let crashed = capture("3\n", Some(139));
        assert_eq!(
            evaluate(&case, &observe(&crashed)).error,
            Some(CaseError::Runtime { exit_code: Some(139) })
        );

        let stopped = capture("partial", None);
        let mut observation = observe(&stopped);
        observation.instance_timed_out = true;
        observation.instance_status = None;
        assert_eq!(
            evaluate(&case, &observation).error,
            Some(CaseError::Timeout { limit_ms: 2000 })
        );
    }

    #[test]
    fn test_compile_failure_and_unreached_cases() {
        let case = TestCase::new("", "3");
        let unreached = CaseCapture::default();

        let mut observation = observe(&unreached);
        observation.compile_failed = true;
        observation.compile_stderr = "main.c:1: error";
        let result = evaluate(&case, &observation);
        assert_eq!(result.error, Some(CaseError::Compile));
        assert_eq!(result.stderr, "main.c:1: error");

        let observation = Observation {
            instance_status: Some(1),
            ..observe(&unreached)
        };
        assert!(matches!(
            evaluate(&case, &observation).error,
            Some(CaseError::NotExecuted { .. })
        ));
    }

    #[test]
    fn test_truncated_output_only_affects_unfinished_cases() {
        let case = TestCase::new("", "3");

        let finished = capture("3\n", Some(0));
        let observation = Observation {
            output_truncated: true,
            ..observe(&finished)
        };
        assert!(evaluate(&case, &observation).passed);

        let flooded = capture("yyyyyyyy", None);
        let observation = Observation {
            output_truncated: true,
            instance_timed_out: true,
            instance_status: None,
            ..observe(&flooded)
        };
        assert_eq!(
            evaluate(&case, &observation).error,
            Some(CaseError::OutputLimitExceeded)
        );
    }
}
