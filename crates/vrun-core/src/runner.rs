//! The `run` boundary: provision, execute, judge

use chrono::Utc;
use std::sync::Arc;

use crate::context::RunContext;
use crate::driver::Driver;
use crate::engine::{ImageHandle, IsolationEngine};
use crate::errors::{EngineError, RunnerError};
use crate::provision::Provisioner;
use crate::result::RunResult;
use crate::task::Task;

/// Caller-side knobs that are not part of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerOptions {
    /// Cases run concurrently in the isolated model. Values below 1 act as 1.
    pub parallelism: usize,
    /// Absolute directory inside the instance where sources are staged.
    pub working_dir: String,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            parallelism: 1,
            working_dir: "/code".to_string(),
        }
    }
}

/// Runs tasks against an isolation engine.
///
/// A runner holds no per-task state, so one instance can serve concurrent
/// [`Runner::run`] calls. The provisioner's image cache is the only state
/// shared between them; pass the same provisioner to several runners to share
/// it further.
pub struct Runner {
    engine: Arc<dyn IsolationEngine>,
    provisioner: Arc<Provisioner>,
    options: RunnerOptions,
}

impl Runner {
    pub fn new(engine: Arc<dyn IsolationEngine>) -> Self {
        let provisioner = Arc::new(Provisioner::new(Arc::clone(&engine)));
        Self {
            engine,
            provisioner,
            options: RunnerOptions::default(),
        }
    }

    pub fn with_provisioner(mut self, provisioner: Arc<Provisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub fn with_options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn provisioner(&self) -> &Arc<Provisioner> {
        &self.provisioner
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    /// Run every test case of `task`.
    ///
    /// Returns a [`RunResult`] when the cases ran, however they fared, and an
    /// error when nothing meaningful could run. Every instance created along
    /// the way is disposed before this returns.
    pub async fn run(&self, ctx: &RunContext, task: &Task) -> Result<RunResult, RunnerError> {
        if !self.options.working_dir.starts_with('/') {
            return Err(RunnerError::InvalidTask(format!(
                "working_dir must be absolute, got '{}'",
                self.options.working_dir
            )));
        }
        let started_at = Utc::now();
        let config = task.config();
        log::info!(
            "Running task with {} test case(s) ({:?} model)",
            task.test_cases().len(),
            config.execution_model
        );

        let driver = Driver::new(
            Arc::clone(&self.engine),
            &self.options.working_dir,
            self.options.parallelism,
        );
        let image = self.provision(ctx, task).await?;
        let cases = match driver.run(ctx, task, &image).await {
            // The cached image was removed behind our back: resolve it again once.
            Err(RunnerError::Create(EngineError::NotFound(missing))) => {
                log::warn!("Image {} disappeared, resolving the environment again", missing);
                self.provisioner.invalidate(&config.environment).await;
                let image = self.provision(ctx, task).await?;
                driver.run(ctx, task, &image).await?
            }
            other => other?,
        };

        let result = RunResult::from_cases(cases, config.execution_model, started_at);
        log::info!(
            "Task finished: {}/{} test case(s) passed",
            result.passed_count,
            result.total
        );
        Ok(result)
    }

    async fn provision(&self, ctx: &RunContext, task: &Task) -> Result<ImageHandle, RunnerError> {
        ctx.guard("provisioning", async {
            self.provisioner
                .resolve(&task.config().environment)
                .await
                .map_err(RunnerError::from)
        })
        .await
    }
}
