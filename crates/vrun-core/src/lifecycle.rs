//! Isolated instance lifecycle
//!
//! An [`Instance`] moves through `Created → Staged → Running → Terminated` and
//! ends in `Disposed`. Any state can go straight to `Disposed`. Callers hold the
//! instance for the whole pipeline and call [`Instance::dispose`] once at the
//! end, whatever the outcome of the stages in between; if the owning future is
//! dropped instead (cancellation by abandonment, panic), `Drop` schedules the
//! removal on the current runtime.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::context::RunContext;
use crate::engine::{
    ImageHandle, InstanceLogs, InstanceSpec, IsolationEngine, ResourcePolicy, WaitOutcome,
};
use crate::entrypoint::ENTRYPOINT_PATH;
use crate::errors::RunnerError;
use crate::task::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Created,
    Staged,
    Running,
    Terminated,
    Disposed,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceState::Created => "created",
            InstanceState::Staged => "staged",
            InstanceState::Running => "running",
            InstanceState::Terminated => "terminated",
            InstanceState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// Resource policy derived from a task config.
pub fn resource_policy(config: &Config) -> ResourcePolicy {
    ResourcePolicy {
        memory_bytes: (config.memory_limit > 0)
            .then(|| i64::try_from(config.memory_limit).unwrap_or(i64::MAX)),
        nano_cpus: config
            .cpu_limit
            .map(|cpus| (cpus * 1_000_000_000.0).round() as i64),
        pids_limit: (config.pids_limit > 0).then_some(config.pids_limit),
        network_enabled: config.allow_network,
    }
}

/// Creation parameters for an instance that runs the generated entrypoint.
pub fn instance_spec(config: &Config, image: &ImageHandle, working_dir: &str) -> InstanceSpec {
    InstanceSpec {
        name: format!("vrun-{}", Uuid::new_v4()),
        image: image.id.clone(),
        command: vec![
            "sh".to_string(),
            format!("{}/{}", working_dir.trim_end_matches('/'), ENTRYPOINT_PATH),
        ],
        working_dir: working_dir.to_string(),
        policy: resource_policy(config),
    }
}

pub struct Instance {
    id: String,
    engine: Arc<dyn IsolationEngine>,
    state: InstanceState,
}

impl Instance {
    /// Allocate an instance from `spec`.
    ///
    /// The create request itself is not raced against cancellation: an
    /// abandoned request could still allocate an instance whose id would never
    /// reach us. Cancellation is checked on both sides of it instead, and a
    /// cancellation that lands during the request disposes the new instance.
    pub async fn create(
        engine: Arc<dyn IsolationEngine>,
        spec: &InstanceSpec,
        ctx: &RunContext,
    ) -> Result<Self, RunnerError> {
        if ctx.is_cancelled() {
            return Err(RunnerError::Cancelled("instance creation".to_string()));
        }
        let id = engine
            .create_instance(spec)
            .await
            .map_err(RunnerError::Create)?;
        log::debug!("Instance {} ({}) created from image {}", id, spec.name, spec.image);

        let instance = Self {
            id,
            engine,
            state: InstanceState::Created,
        };
        if ctx.is_cancelled() {
            instance.dispose().await;
            return Err(RunnerError::Cancelled("instance creation".to_string()));
        }
        Ok(instance)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    fn expect_state(&self, expected: InstanceState, next: InstanceState) -> Result<(), RunnerError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(RunnerError::InvalidTransition {
                instance: self.id.clone(),
                from: self.state.to_string(),
                to: next.to_string(),
            })
        }
    }

    fn set_state(&mut self, next: InstanceState) {
        log::debug!("Instance {}: {} -> {}", self.id, self.state, next);
        self.state = next;
    }

    /// Copy `archive` into the instance at `target_path` in one transfer.
    pub async fn stage(
        &mut self,
        ctx: &RunContext,
        target_path: &str,
        archive: Vec<u8>,
    ) -> Result<(), RunnerError> {
        self.expect_state(InstanceState::Created, InstanceState::Staged)?;
        let engine = Arc::clone(&self.engine);
        let id = self.id.clone();
        ctx.guard("staging", async move {
            engine
                .copy_into_instance(&id, target_path, archive)
                .await
                .map_err(|source| RunnerError::Staging {
                    instance: id.clone(),
                    source,
                })
        })
        .await?;
        self.set_state(InstanceState::Staged);
        Ok(())
    }

    pub async fn start(&mut self, ctx: &RunContext) -> Result<(), RunnerError> {
        self.expect_state(InstanceState::Staged, InstanceState::Running)?;
        let engine = Arc::clone(&self.engine);
        let id = self.id.clone();
        ctx.guard("start", async move {
            engine.start(&id).await.map_err(|source| RunnerError::Start {
                instance: id.clone(),
                source,
            })
        })
        .await?;
        self.set_state(InstanceState::Running);
        Ok(())
    }

    /// Wait for the instance to exit, force-stopping it once `limit` elapses.
    ///
    /// `limit` is clamped to the run deadline, so an expiring deadline ends in
    /// [`WaitOutcome::TimedOut`] and a stop, not an error. Only cancellation
    /// interrupts the wait.
    pub async fn wait(
        &mut self,
        ctx: &RunContext,
        limit: Duration,
    ) -> Result<WaitOutcome, RunnerError> {
        self.expect_state(InstanceState::Running, InstanceState::Terminated)?;
        let limit = ctx.clamp(limit);
        let engine = Arc::clone(&self.engine);
        let id = self.id.clone();
        let outcome = ctx
            .cancellable("wait", async move {
                engine
                    .wait_for_exit(&id, limit)
                    .await
                    .map_err(|source| RunnerError::Engine {
                        instance: id.clone(),
                        source,
                    })
            })
            .await?;

        if outcome == WaitOutcome::TimedOut {
            log::warn!(
                "Instance {} exceeded {} ms, stopping it",
                self.id,
                limit.as_millis()
            );
            if let Err(e) = self.engine.stop(&self.id).await {
                // Removal is forced, so a failed stop does not leave it running.
                log::warn!("Failed to stop instance {}: {}", self.id, e);
            }
        }
        self.set_state(InstanceState::Terminated);
        Ok(outcome)
    }

    /// Drain stdout and stderr of a terminated instance.
    pub async fn collect_logs(&self, ctx: &RunContext) -> Result<InstanceLogs, RunnerError> {
        if self.state != InstanceState::Terminated {
            return Err(RunnerError::InvalidTransition {
                instance: self.id.clone(),
                from: self.state.to_string(),
                to: "log collection".to_string(),
            });
        }
        ctx.cancellable("log collection", async {
            self.engine
                .read_logs(&self.id)
                .await
                .map_err(|source| RunnerError::Engine {
                    instance: self.id.clone(),
                    source,
                })
        })
        .await
    }

    /// Remove the instance. Failures are logged, never returned.
    ///
    /// The state only becomes `Disposed` once the engine has answered; if this
    /// future is dropped mid-removal, `Drop` still schedules one.
    pub async fn dispose(mut self) {
        match self.engine.remove(&self.id).await {
            Ok(()) => log::debug!("Instance {} disposed (was {})", self.id, self.state),
            Err(e) => log::warn!("Failed to dispose instance {}: {}", self.id, e),
        }
        self.set_state(InstanceState::Disposed);
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if self.state == InstanceState::Disposed {
            return;
        }
        let engine = Arc::clone(&self.engine);
        let id = std::mem::take(&mut self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                log::warn!("Instance {} dropped while {}, removing it in the background", id, self.state);
                handle.spawn(async move {
                    if let Err(e) = engine.remove(&id).await {
                        log::error!("Background removal of instance {} failed: {}", id, e);
                    }
                });
            }
            Err(_) => log::error!("Instance {} leaked: no runtime available to remove it", id),
        }
    }
}
