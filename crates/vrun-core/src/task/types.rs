//! Task model: environment recipe, source tree and test cases
//!
//! Every type here is validated when it is constructed, so the pipeline never
//! has to re-check paths or commands deep inside a run. A [`Task`] is immutable
//! once built; the runner only borrows it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::archive::validate_relative_path;
use crate::errors::{ArchiveError, RunnerError};

/// Relative tolerance used when a numeric comparison does not specify one.
pub const DEFAULT_NUMERIC_TOLERANCE: f64 = 1e-6;

/// Upper bound for the per-case and compile time limits: one day.
pub const MAX_TIME_LIMIT_MS: u64 = 24 * 60 * 60 * 1000;

fn default_numeric_tolerance() -> f64 {
    DEFAULT_NUMERIC_TOLERANCE
}

fn default_time_limit_ms() -> u64 {
    10_000
}

fn default_compile_time_limit_ms() -> u64 {
    60_000
}

fn default_pids_limit() -> i64 {
    256
}

/// Where the environment image comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentSpec {
    /// A pre-built image referenced by name and tag.
    Image(String),
    /// A complete Dockerfile, built on first use and cached by content.
    Dockerfile(String),
    /// A declarative recipe synthesised into a Dockerfile.
    Recipe(Recipe),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub base_image: String,
    /// Shell commands, each rendered as one `RUN` instruction.
    #[serde(default)]
    pub setup: Vec<String>,
    #[serde(default)]
    pub startup_command: Option<Vec<String>>,
}

/// How test cases are mapped onto isolated instances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionModel {
    /// One fresh instance per test case. No state is shared between cases.
    #[default]
    Isolated,
    /// One instance per task; cases run one after another inside it.
    /// Cheaper, but a case that corrupts the instance can poison later ones.
    Shared,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonStrategy {
    /// Byte equality, ignoring only trailing newlines.
    #[default]
    Exact,
    /// Whitespace-separated numbers compared within a relative-or-absolute tolerance.
    NumericTolerant {
        #[serde(default = "default_numeric_tolerance")]
        tolerance: f64,
    },
}

impl ComparisonStrategy {
    pub fn numeric() -> Self {
        ComparisonStrategy::NumericTolerant {
            tolerance: DEFAULT_NUMERIC_TOLERANCE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    #[serde(alias = "output")]
    pub expected_output: String,
    #[serde(default)]
    pub comparison: ComparisonStrategy,
}

impl TestCase {
    pub fn new(input: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            expected_output: expected_output.into(),
            comparison: ComparisonStrategy::Exact,
        }
    }

    pub fn with_comparison(mut self, comparison: ComparisonStrategy) -> Self {
        self.comparison = comparison;
        self
    }
}

/// Environment and commands for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub environment: EnvironmentSpec,
    /// Empty or absent means there is no compile step.
    #[serde(default)]
    pub compile_command: Option<String>,
    pub run_command: String,
    /// Memory ceiling in bytes. Zero leaves the engine default in place.
    #[serde(default)]
    pub memory_limit: u64,
    /// Fractional CPUs, e.g. `0.5`.
    #[serde(default)]
    pub cpu_limit: Option<f64>,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
    #[serde(default)]
    pub allow_network: bool,
    /// Wall-clock budget for a single test case.
    #[serde(default = "default_time_limit_ms")]
    pub time_limit_ms: u64,
    #[serde(default = "default_compile_time_limit_ms")]
    pub compile_time_limit_ms: u64,
    #[serde(default)]
    pub execution_model: ExecutionModel,
}

impl Config {
    pub fn new(environment: EnvironmentSpec, run_command: impl Into<String>) -> Self {
        Self {
            environment,
            compile_command: None,
            run_command: run_command.into(),
            memory_limit: 0,
            cpu_limit: None,
            pids_limit: default_pids_limit(),
            allow_network: false,
            time_limit_ms: default_time_limit_ms(),
            compile_time_limit_ms: default_compile_time_limit_ms(),
            execution_model: ExecutionModel::default(),
        }
    }

    pub fn with_compile_command(mut self, command: impl Into<String>) -> Self {
        self.compile_command = Some(command.into());
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = bytes;
        self
    }

    pub fn with_time_limit_ms(mut self, limit_ms: u64) -> Self {
        self.time_limit_ms = limit_ms;
        self
    }

    pub fn with_execution_model(mut self, model: ExecutionModel) -> Self {
        self.execution_model = model;
        self
    }

    /// The compile command, if one is configured and not blank.
    pub fn compile_step(&self) -> Option<&str> {
        self.compile_command
            .as_deref()
            .map(str::trim)
            .filter(|cmd| !cmd.is_empty())
    }

    pub fn validate(&self) -> Result<(), RunnerError> {
        if self.run_command.trim().is_empty() {
            return Err(RunnerError::InvalidTask(
                "run_command must not be empty".to_string(),
            ));
        }
        if self.time_limit_ms == 0 {
            return Err(RunnerError::InvalidTask(
                "time_limit_ms must be greater than zero".to_string(),
            ));
        }
        for (name, value) in [
            ("time_limit_ms", self.time_limit_ms),
            ("compile_time_limit_ms", self.compile_time_limit_ms),
        ] {
            if value > MAX_TIME_LIMIT_MS {
                return Err(RunnerError::InvalidTask(format!(
                    "{} must not exceed {} ms, got {}",
                    name, MAX_TIME_LIMIT_MS, value
                )));
            }
        }
        if let Some(cpus) = self.cpu_limit {
            if !cpus.is_finite() || cpus <= 0.0 {
                return Err(RunnerError::InvalidTask(format!(
                    "cpu_limit must be a positive number, got {}",
                    cpus
                )));
            }
        }
        match &self.environment {
            EnvironmentSpec::Image(reference) if reference.trim().is_empty() => Err(
                RunnerError::InvalidTask("environment image reference is empty".to_string()),
            ),
            EnvironmentSpec::Dockerfile(contents) if contents.trim().is_empty() => Err(
                RunnerError::InvalidTask("environment Dockerfile is empty".to_string()),
            ),
            EnvironmentSpec::Recipe(recipe) if recipe.base_image.trim().is_empty() => Err(
                RunnerError::InvalidTask("recipe base_image is empty".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

/// Source tree keyed by forward-slash relative path.
///
/// Paths are checked on insertion, so a `FileSystem` value can always be
/// archived. Entries iterate in path order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSystem {
    entries: BTreeMap<String, Vec<u8>>,
}

impl FileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        path: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) -> Result<(), ArchiveError> {
        let path = path.into();
        validate_relative_path(&path)?;
        if crate::entrypoint::is_reserved_path(&path) {
            return Err(ArchiveError::ReservedPath(path));
        }
        self.entries.insert(path, content.into());
        Ok(())
    }

    pub fn with_file(
        mut self,
        path: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) -> Result<Self, ArchiveError> {
        self.insert(path, content)?;
        Ok(self)
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.entries.get(path).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries
            .iter()
            .map(|(path, content)| (path.as_str(), content.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TryFrom<BTreeMap<String, Vec<u8>>> for FileSystem {
    type Error = ArchiveError;

    fn try_from(map: BTreeMap<String, Vec<u8>>) -> Result<Self, Self::Error> {
        let mut fs = FileSystem::new();
        for (path, content) in map {
            fs.insert(path, content)?;
        }
        Ok(fs)
    }
}

impl TryFrom<BTreeMap<String, String>> for FileSystem {
    type Error = ArchiveError;

    fn try_from(map: BTreeMap<String, String>) -> Result<Self, Self::Error> {
        let mut fs = FileSystem::new();
        for (path, content) in map {
            fs.insert(path, content.into_bytes())?;
        }
        Ok(fs)
    }
}

/// The unit of work handed to the runner.
#[derive(Debug, Clone)]
pub struct Task {
    config: Config,
    files: FileSystem,
    test_cases: Vec<TestCase>,
}

impl Task {
    pub fn new(
        config: Config,
        files: FileSystem,
        test_cases: Vec<TestCase>,
    ) -> Result<Self, RunnerError> {
        config.validate()?;
        if test_cases.is_empty() {
            return Err(RunnerError::InvalidTask(
                "a task needs at least one test case".to_string(),
            ));
        }
        for (index, case) in test_cases.iter().enumerate() {
            if let ComparisonStrategy::NumericTolerant { tolerance } = case.comparison {
                if !tolerance.is_finite() || tolerance < 0.0 {
                    return Err(RunnerError::InvalidTask(format!(
                        "test case {} has an invalid tolerance {}",
                        index, tolerance
                    )));
                }
            }
        }
        Ok(Self {
            config,
            files,
            test_cases,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn files(&self) -> &FileSystem {
        &self.files
    }

    pub fn test_cases(&self) -> &[TestCase] {
        &self.test_cases
    }
}
