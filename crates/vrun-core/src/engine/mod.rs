//! Isolation engine capability consumed by the runner
//!
//! The runner never talks to a container runtime directly. It drives an
//! [`IsolationEngine`] handle that is constructed by the caller and passed in,
//! which keeps the pipeline testable against a fake and lets one process share
//! a single engine connection across concurrent runs.

use async_trait::async_trait;
use std::time::Duration;

use crate::errors::EngineError;

pub mod docker;

pub use docker::DockerEngine;

/// A concrete environment image known to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHandle {
    pub id: String,
    /// Creation time as a unix timestamp in seconds.
    pub created: i64,
    pub tags: Vec<String>,
}

/// Resource ceilings and security settings applied to every instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePolicy {
    /// Bytes; `None` leaves the engine default.
    pub memory_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
    pub pids_limit: Option<i64>,
    pub network_enabled: bool,
}

impl ResourcePolicy {
    /// Privilege escalation is never configurable.
    pub const NO_NEW_PRIVILEGES: &'static str = "no-new-privileges";
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self {
            memory_bytes: None,
            nano_cpus: None,
            pids_limit: None,
            network_enabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub working_dir: String,
    pub policy: ResourcePolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited { status_code: i64 },
    TimedOut,
}

/// Bytes kept per stream when reading instance output.
pub const DEFAULT_LOG_LIMIT: usize = 16 * 1024 * 1024;

/// Demultiplexed output of an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceLogs {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Output past the per-stream limit was discarded.
    pub truncated: bool,
}

impl InstanceLogs {
    pub fn push_stdout(&mut self, chunk: &[u8], limit: usize) {
        self.truncated |= append_capped(&mut self.stdout, chunk, limit);
    }

    pub fn push_stderr(&mut self, chunk: &[u8], limit: usize) {
        self.truncated |= append_capped(&mut self.stderr, chunk, limit);
    }
}

/// Append as much of `chunk` as fits under `limit`; true if anything was dropped.
fn append_capped(buffer: &mut Vec<u8>, chunk: &[u8], limit: usize) -> bool {
    let room = limit.saturating_sub(buffer.len());
    let kept = chunk.len().min(room);
    buffer.extend_from_slice(&chunk[..kept]);
    kept < chunk.len()
}

#[async_trait]
pub trait IsolationEngine: Send + Sync {
    /// All images matching a reference (name, name:tag, or pattern).
    async fn list_images(&self, reference: &str) -> Result<Vec<ImageHandle>, EngineError>;

    /// The newest image matching `reference`.
    ///
    /// Engines may return matches in any order, so the tie-break is made here
    /// and not left to the engine: last build wins.
    async fn find_image(&self, reference: &str) -> Result<Option<ImageHandle>, EngineError> {
        let images = self.list_images(reference).await?;
        Ok(images
            .into_iter()
            .max_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id))))
    }

    async fn pull_image(&self, reference: &str) -> Result<(), EngineError>;

    /// Build an image from a tar build context and tag it. Returns the build log.
    async fn build_image(&self, context: Vec<u8>, tag: &str) -> Result<String, EngineError>;

    /// Allocate an instance; returns its id.
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String, EngineError>;

    /// Extract a tar archive at `target_path` inside the instance.
    async fn copy_into_instance(
        &self,
        instance_id: &str,
        target_path: &str,
        archive: Vec<u8>,
    ) -> Result<(), EngineError>;

    async fn start(&self, instance_id: &str) -> Result<(), EngineError>;

    /// Block until the instance exits or `limit` elapses.
    async fn wait_for_exit(
        &self,
        instance_id: &str,
        limit: Duration,
    ) -> Result<WaitOutcome, EngineError>;

    /// Force the instance to stop.
    async fn stop(&self, instance_id: &str) -> Result<(), EngineError>;

    async fn read_logs(&self, instance_id: &str) -> Result<InstanceLogs, EngineError>;

    /// Remove the instance and its writable state.
    async fn remove(&self, instance_id: &str) -> Result<(), EngineError>;
}
