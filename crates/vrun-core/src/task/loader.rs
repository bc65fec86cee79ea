//! Loads task documents from YAML
//!
//! A task document carries the environment config, the source tree as a map of
//! path to text content, and the ordered test cases. The loader parses it and
//! then builds a validated [`Task`], so malformed paths surface as
//! [`ArchiveError`](crate::errors::ArchiveError) rather than deep in a run.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;

use crate::errors::RunnerError;
use crate::task::types::{Config, FileSystem, Task, TestCase};

#[derive(Debug, Deserialize)]
struct TaskDocument {
    config: Config,
    #[serde(default)]
    files: BTreeMap<String, String>,
    test_cases: Vec<TestCase>,
}

pub struct TaskLoader;

impl TaskLoader {
    /// Load a task from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Task, RunnerError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await.map_err(|e| {
            RunnerError::InvalidTask(format!(
                "Failed to read task file {}: {}",
                path.display(),
                e
            ))
        })?;
        log::debug!("Loaded task document from {}", path.display());
        Self::from_str(&content)
    }

    /// Load a task from a YAML string
    pub fn from_str(content: &str) -> Result<Task, RunnerError> {
        let document: TaskDocument = serde_yaml::from_str(content).map_err(|e| {
            RunnerError::InvalidTask(format!("Failed to parse task document: {}", e))
        })?;
        let files = FileSystem::try_from(document.files)?;
        Task::new(document.config, files, document.test_cases)
    }
}
