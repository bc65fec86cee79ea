//! Drives test cases through isolated instances
//!
//! A batch is the set of cases handled by one instance: a single case in the
//! isolated model, every case in the shared model. Each batch gets its own
//! staged archive, its own instance and exactly one disposal, whatever happens
//! between creation and collection.

use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::archive::ArchiveBuilder;
use crate::context::RunContext;
use crate::engine::{ImageHandle, InstanceLogs, IsolationEngine, WaitOutcome};
use crate::entrypoint::{self, ENTRYPOINT_PATH};
use crate::errors::{CaseError, RunnerError};
use crate::evaluator::{evaluate, Observation};
use crate::lifecycle::{instance_spec, Instance};
use crate::result::CaseResult;
use crate::task::{Config, ExecutionModel, Task};

/// Slack on top of the in-instance `timeout` before the engine-level stop kicks in.
const CASE_GRACE: Duration = Duration::from_secs(1);

/// Cases assigned to one instance, with the archive staged into it.
struct Batch {
    indices: Vec<usize>,
    /// Keys the output markers of this instance's entrypoint.
    nonce: String,
    archive: Vec<u8>,
}

pub struct Driver {
    engine: Arc<dyn IsolationEngine>,
    working_dir: String,
    parallelism: usize,
}

impl Driver {
    pub fn new(engine: Arc<dyn IsolationEngine>, working_dir: &str, parallelism: usize) -> Self {
        Self {
            engine,
            working_dir: working_dir.to_string(),
            parallelism: parallelism.max(1),
        }
    }

    /// Run every test case of `task` against `image`, returning results in task order.
    pub async fn run(
        &self,
        ctx: &RunContext,
        task: &Task,
        image: &ImageHandle,
    ) -> Result<Vec<CaseResult>, RunnerError> {
        let all: Vec<usize> = (0..task.test_cases().len()).collect();
        let assignments: Vec<Vec<usize>> = match task.config().execution_model {
            ExecutionModel::Isolated => all.into_iter().map(|index| vec![index]).collect(),
            ExecutionModel::Shared => vec![all],
        };

        // Every archive is assembled before the first instance exists.
        let mut batches = assignments
            .into_iter()
            .map(|indices| {
                let nonce = Uuid::new_v4().simple().to_string();
                let archive = self.build_archive(task, &indices, &nonce)?;
                Ok(Batch {
                    indices,
                    nonce,
                    archive,
                })
            })
            .collect::<Result<Vec<_>, RunnerError>>()?;

        if batches.len() == 1 {
            if let Some(batch) = batches.pop() {
                return self.run_batch(ctx, task, image, batch).await;
            }
        }

        // Siblings share a child context so one terminal error stops the rest.
        let batch_ctx = ctx.child();
        let outcomes: Vec<Result<Vec<CaseResult>, RunnerError>> = stream::iter(batches)
            .map(|batch| {
                let batch_ctx = &batch_ctx;
                async move {
                    let outcome = self.run_batch(batch_ctx, task, image, batch).await;
                    if outcome.is_err() {
                        batch_ctx.cancel();
                    }
                    outcome
                }
            })
            .buffered(self.parallelism)
            .collect()
            .await;

        let mut results = Vec::with_capacity(task.test_cases().len());
        let mut first_error: Option<RunnerError> = None;
        for outcome in outcomes {
            let error = match outcome {
                Ok(cases) => {
                    results.extend(cases);
                    continue;
                }
                Err(e) => e,
            };
            // Cancellation of siblings is a consequence, never the root cause.
            let replace = match (&first_error, &error) {
                (None, _) => true,
                (Some(RunnerError::Cancelled(_)), RunnerError::Cancelled(_)) => false,
                (Some(RunnerError::Cancelled(_)), _) => true,
                _ => false,
            };
            if replace {
                first_error = Some(error);
            } else {
                log::debug!("Suppressing secondary error: {}", error);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }

    fn build_archive(
        &self,
        task: &Task,
        indices: &[usize],
        nonce: &str,
    ) -> Result<Vec<u8>, RunnerError> {
        let mut archive = ArchiveBuilder::new();
        archive.append_files(task.files())?;
        archive.append(
            ENTRYPOINT_PATH,
            entrypoint::render(task.config(), indices, &self.working_dir, nonce),
        )?;
        for &index in indices {
            archive.append(
                entrypoint::input_path(index),
                task.test_cases()[index].input.as_bytes(),
            )?;
        }
        Ok(archive.finish()?)
    }

    /// Engine-level deadline for an instance running `case_count` cases.
    fn wait_limit(config: &Config, case_count: usize) -> Duration {
        let per_case = Duration::from_millis(config.time_limit_ms).saturating_add(CASE_GRACE);
        let count = u32::try_from(case_count).unwrap_or(u32::MAX);
        let mut limit = per_case.checked_mul(count).unwrap_or(Duration::MAX);
        if config.compile_step().is_some() {
            limit = limit.saturating_add(Duration::from_millis(config.compile_time_limit_ms));
        }
        limit
    }

    async fn run_batch(
        &self,
        ctx: &RunContext,
        task: &Task,
        image: &ImageHandle,
        batch: Batch,
    ) -> Result<Vec<CaseResult>, RunnerError> {
        if ctx.is_expired() {
            return Ok(not_executed(&batch.indices, "run deadline exceeded"));
        }
        let spec = instance_spec(task.config(), image, &self.working_dir);
        let limit = Self::wait_limit(task.config(), batch.indices.len());

        let mut instance = Instance::create(Arc::clone(&self.engine), &spec, ctx).await?;
        log::debug!(
            "Instance {} handles case(s) {:?} with a {} ms limit",
            instance.id(),
            batch.indices,
            limit.as_millis()
        );
        let execution = self
            .execute(&mut instance, ctx, batch.archive, limit)
            .await;
        instance.dispose().await;

        match execution {
            Ok((outcome, logs, elapsed)) => Ok(self.judge(
                task,
                &batch.indices,
                &batch.nonce,
                outcome,
                &logs,
                elapsed,
            )),
            // The deadline passed before the program started.
            Err(RunnerError::Timeout(stage)) => Ok(not_executed(
                &batch.indices,
                &format!("run deadline exceeded during {}", stage),
            )),
            Err(e) => Err(e),
        }
    }

    async fn execute(
        &self,
        instance: &mut Instance,
        ctx: &RunContext,
        archive: Vec<u8>,
        limit: Duration,
    ) -> Result<(WaitOutcome, InstanceLogs, Duration), RunnerError> {
        instance.stage(ctx, &self.working_dir, archive).await?;
        let started = Instant::now();
        instance.start(ctx).await?;
        let outcome = instance.wait(ctx, limit).await?;
        let elapsed = started.elapsed();
        let logs = instance.collect_logs(ctx).await?;
        Ok((outcome, logs, elapsed))
    }

    fn judge(
        &self,
        task: &Task,
        indices: &[usize],
        nonce: &str,
        outcome: WaitOutcome,
        logs: &InstanceLogs,
        elapsed: Duration,
    ) -> Vec<CaseResult> {
        let stdout = String::from_utf8_lossy(&logs.stdout);
        let stderr = String::from_utf8_lossy(&logs.stderr);
        let parsed = entrypoint::parse_output(&stdout, &stderr, indices, nonce);
        let (instance_timed_out, instance_status) = match outcome {
            WaitOutcome::TimedOut => (true, None),
            WaitOutcome::Exited { status_code } => (false, Some(status_code)),
        };
        let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

        indices
            .iter()
            .zip(&parsed.cases)
            .map(|(&index, capture)| {
                let result = evaluate(
                    &task.test_cases()[index],
                    &Observation {
                        capture,
                        compile_failed: parsed.compile_failed,
                        compile_stderr: &parsed.compile_stderr,
                        instance_timed_out,
                        instance_status,
                        output_truncated: logs.truncated,
                        time_limit_ms: task.config().time_limit_ms,
                        duration_ms,
                    },
                );
                match &result.error {
                    None => log::debug!("Case {} passed", index),
                    Some(error) => log::debug!("Case {} failed: {}", index, error),
                }
                result
            })
            .collect()
    }
}

fn not_executed(indices: &[usize], reason: &str) -> Vec<CaseResult> {
    indices
        .iter()
        .map(|_| {
            CaseResult::fail(
                CaseError::NotExecuted {
                    reason: reason.to_string(),
                },
                String::new(),
                String::new(),
                0,
            )
        })
        .collect()
}
