// src/test_utils/fake_engine.rs
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::engine::{
    ImageHandle, InstanceLogs, InstanceSpec, IsolationEngine, WaitOutcome, DEFAULT_LOG_LIMIT,
};
use crate::errors::EngineError;

/// Extract a tar archive into a path → content map.
pub fn unpack(archive: &[u8]) -> BTreeMap<String, Vec<u8>> {
    let mut entries = BTreeMap::new();
    if archive.is_empty() {
        return entries;
    }
    let mut reader = tar::Archive::new(archive);
    for entry in reader.entries().expect("readable archive") {
        let mut entry = entry.expect("readable entry");
        let path = entry
            .path()
            .expect("entry path")
            .to_string_lossy()
            .into_owned();
        let mut content = Vec::new();
        entry.read_to_end(&mut content).expect("entry content");
        entries.insert(path, content);
    }
    entries
}

/// What a simulated program does with one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeRun {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    /// Virtual run time, checked against the instance's time limits.
    pub duration: Duration,
}

impl FakeRun {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
            duration: Duration::from_millis(5),
        }
    }

    pub fn crash(exit_code: i64, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
            duration: Duration::from_millis(5),
        }
    }

    /// Never finishes on its own.
    pub fn hang() -> Self {
        Self {
            duration: Duration::from_secs(3600),
            ..Self::ok("")
        }
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }
}

type Program = Arc<dyn Fn(&str) -> FakeRun + Send + Sync>;

#[derive(Default)]
struct FakeInstance {
    staged: BTreeMap<String, Vec<u8>>,
    started: bool,
    logs: InstanceLogs,
}

#[derive(Default)]
struct FakeState {
    images: Vec<(String, ImageHandle)>,
    registry: HashMap<String, String>,
    instances: HashMap<String, FakeInstance>,
    specs: Vec<InstanceSpec>,
    build_contexts: Vec<BTreeMap<String, Vec<u8>>>,
    create_attempts: usize,
    created: usize,
    removed: usize,
    remove_attempts: usize,
    stops: usize,
    builds: usize,
    pulls: usize,
    clock: i64,
}

/// In-memory isolation engine.
///
/// Instances execute the staged entrypoint by simulation: the case list and
/// time limit are read back from the generated script, each staged input is fed
/// to the configured program closure, and the output is framed the way the
/// real entrypoint frames it. Time is virtual, so timeouts cost nothing.
pub struct FakeEngine {
    state: Mutex<FakeState>,
    program: Program,
    compile_error: Option<String>,
    timeout_utility: bool,
    run_delay: Option<Duration>,
    build_delay: Option<Duration>,
    build_error: Option<String>,
    build_without_image: bool,
    fail_create_at: Option<usize>,
    fail_copy: bool,
    fail_start: bool,
    fail_remove: bool,
    remove_delay: Option<Duration>,
    log_limit: usize,
    require_known_images: bool,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            program: Arc::new(|_| FakeRun::ok("")),
            compile_error: None,
            timeout_utility: true,
            run_delay: None,
            build_delay: None,
            build_error: None,
            build_without_image: false,
            fail_create_at: None,
            fail_copy: false,
            fail_start: false,
            fail_remove: false,
            remove_delay: None,
            log_limit: DEFAULT_LOG_LIMIT,
            require_known_images: false,
        }
    }

    pub fn with_program<F>(mut self, program: F) -> Self
    where
        F: Fn(&str) -> FakeRun + Send + Sync + 'static,
    {
        self.program = Arc::new(program);
        self
    }

    /// The compile step fails with `log` on stderr.
    pub fn compile_fails(mut self, log: &str) -> Self {
        self.compile_error = Some(log.to_string());
        self
    }

    /// Simulate an image without the `timeout` utility, leaving only the engine deadline.
    pub fn without_timeout_utility(mut self) -> Self {
        self.timeout_utility = false;
        self
    }

    /// Real time spent inside `wait_for_exit` before the first case finishes.
    ///
    /// A delay at or beyond the wait limit behaves like a hung program: the
    /// wait lasts the whole limit and the first case never reports an exit.
    pub fn with_run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = Some(delay);
        self
    }

    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = Some(delay);
        self
    }

    pub fn fail_build(mut self, log: &str) -> Self {
        self.build_error = Some(log.to_string());
        self
    }

    /// Builds report success but never produce an image.
    pub fn build_without_image(mut self) -> Self {
        self.build_without_image = true;
        self
    }

    /// Make the `n`-th create call (zero-based) fail.
    pub fn fail_create_at(mut self, n: usize) -> Self {
        self.fail_create_at = Some(n);
        self
    }

    pub fn fail_copy(mut self) -> Self {
        self.fail_copy = true;
        self
    }

    pub fn fail_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn fail_remove(mut self) -> Self {
        self.fail_remove = true;
        self
    }

    /// Real time each `remove` call takes before the instance is gone.
    pub fn with_remove_delay(mut self, delay: Duration) -> Self {
        self.remove_delay = Some(delay);
        self
    }

    /// Bytes of stdout and of stderr `read_logs` returns.
    pub fn with_log_limit(mut self, bytes: usize) -> Self {
        self.log_limit = bytes;
        self
    }

    /// Creating an instance from an image the engine does not hold fails with `NotFound`.
    pub fn require_known_images(mut self) -> Self {
        self.require_known_images = true;
        self
    }

    /// An image the fake registry can pull.
    pub fn with_registry_image(self, reference: &str, id: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .registry
            .insert(reference.to_string(), id.to_string());
        self
    }

    pub fn add_image(&self, reference: &str, id: &str, created: i64) {
        let mut state = self.state.lock().unwrap();
        state.images.push((
            reference.to_string(),
            ImageHandle {
                id: id.to_string(),
                created,
                tags: vec![reference.to_string()],
            },
        ));
    }

    pub fn clear_images(&self) {
        self.state.lock().unwrap().images.clear();
    }

    pub fn created_count(&self) -> usize {
        self.state.lock().unwrap().created
    }

    pub fn create_attempts(&self) -> usize {
        self.state.lock().unwrap().create_attempts
    }

    pub fn removed_count(&self) -> usize {
        self.state.lock().unwrap().removed
    }

    pub fn remove_attempts(&self) -> usize {
        self.state.lock().unwrap().remove_attempts
    }

    pub fn live_instances(&self) -> usize {
        self.state.lock().unwrap().instances.len()
    }

    pub fn stop_count(&self) -> usize {
        self.state.lock().unwrap().stops
    }

    pub fn build_count(&self) -> usize {
        self.state.lock().unwrap().builds
    }

    pub fn pull_count(&self) -> usize {
        self.state.lock().unwrap().pulls
    }

    pub fn last_build_context(&self) -> Option<BTreeMap<String, Vec<u8>>> {
        self.state.lock().unwrap().build_contexts.last().cloned()
    }

    pub fn specs(&self) -> Vec<InstanceSpec> {
        self.state.lock().unwrap().specs.clone()
    }

    /// Run the staged entrypoint. `stalled` keeps the first case from finishing.
    fn simulate(
        &self,
        staged: &BTreeMap<String, Vec<u8>>,
        limit: Duration,
        stalled: bool,
    ) -> (WaitOutcome, InstanceLogs) {
        let mut logs = InstanceLogs::default();
        let script = staged
            .get(".vrun/entrypoint.sh")
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default();
        let mark = script
            .split("VRUN_MARK='")
            .nth(1)
            .and_then(|rest| rest.split('\'').next())
            .unwrap_or("@@vrun:")
            .to_string();

        if script.contains("compile-failed") {
            if let Some(error) = &self.compile_error {
                let marker = format!("\n{}compile-failed@@\n", mark);
                logs.stdout.extend_from_slice(marker.as_bytes());
                logs.stderr
                    .extend_from_slice(format!("{}\n{}", error, marker).as_bytes());
                return (WaitOutcome::Exited { status_code: 1 }, logs);
            }
        }

        let case_limit = script
            .split("VRUN_LIMIT=\"timeout ")
            .nth(1)
            .and_then(|rest| rest.split('"').next())
            .and_then(|secs| secs.parse::<f64>().ok())
            .filter(|_| self.timeout_utility)
            .map(Duration::from_secs_f64);
        let indices: Vec<usize> = script
            .lines()
            .filter_map(|line| line.strip_prefix("run_case "))
            .filter_map(|index| index.trim().parse().ok())
            .collect();
        if stalled && indices.is_empty() {
            return (WaitOutcome::TimedOut, logs);
        }

        let mut elapsed = Duration::ZERO;
        for index in indices {
            let input = staged
                .get(&format!(".vrun/tests/{}.txt", index))
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .unwrap_or_default();
            let run = (self.program)(&input);
            let begin = format!("{}begin {}@@\n", mark, index);
            logs.stdout.extend_from_slice(begin.as_bytes());
            logs.stderr.extend_from_slice(begin.as_bytes());

            let (status, spent) = match case_limit {
                Some(case_limit) if run.duration > case_limit => (124, case_limit),
                _ => (run.exit_code, run.duration),
            };
            logs.stdout.extend_from_slice(run.stdout.as_bytes());
            logs.stderr.extend_from_slice(run.stderr.as_bytes());
            if stalled || elapsed + spent > limit {
                return (WaitOutcome::TimedOut, logs);
            }
            elapsed += spent;

            let end = format!("\n{}end {} {}@@\n", mark, index, status);
            logs.stdout.extend_from_slice(end.as_bytes());
            logs.stderr.extend_from_slice(end.as_bytes());
        }
        (WaitOutcome::Exited { status_code: 0 }, logs)
    }
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IsolationEngine for FakeEngine {
    async fn list_images(&self, reference: &str) -> Result<Vec<ImageHandle>, EngineError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .images
            .iter()
            .filter(|(tag, _)| tag == reference)
            .map(|(_, handle)| handle.clone())
            .collect())
    }

    async fn pull_image(&self, reference: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.pulls += 1;
        let id = state
            .registry
            .get(reference)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(reference.to_string()))?;
        state.clock += 1;
        let created = state.clock;
        state.images.push((
            reference.to_string(),
            ImageHandle {
                id,
                created,
                tags: vec![reference.to_string()],
            },
        ));
        Ok(())
    }

    async fn build_image(&self, context: Vec<u8>, tag: &str) -> Result<String, EngineError> {
        {
            let mut state = self.state.lock().unwrap();
            state.builds += 1;
            state.build_contexts.push(unpack(&context));
        }
        if let Some(delay) = self.build_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(log) = &self.build_error {
            return Err(EngineError::BuildFailed { log: log.clone() });
        }

        let log = format!("Step 1/1 : building {}\n", tag);
        if self.build_without_image {
            return Ok(log);
        }
        let mut state = self.state.lock().unwrap();
        state.clock += 1;
        let created = state.clock;
        let id = format!("sha256:built-{}", state.builds);
        state.images.push((
            tag.to_string(),
            ImageHandle {
                id,
                created,
                tags: vec![tag.to_string()],
            },
        ));
        Ok(log)
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String, EngineError> {
        let mut state = self.state.lock().unwrap();
        let attempt = state.create_attempts;
        state.create_attempts += 1;
        if self.fail_create_at == Some(attempt) {
            return Err(EngineError::Other("no space left on device".to_string()));
        }
        if self.require_known_images
            && !state.images.iter().any(|(_, handle)| handle.id == spec.image)
        {
            return Err(EngineError::NotFound(spec.image.clone()));
        }
        state.created += 1;
        let id = format!("fake-{}", attempt);
        state.specs.push(spec.clone());
        state.instances.insert(id.clone(), FakeInstance::default());
        Ok(id)
    }

    async fn copy_into_instance(
        &self,
        instance_id: &str,
        target_path: &str,
        archive: Vec<u8>,
    ) -> Result<(), EngineError> {
        if self.fail_copy {
            return Err(EngineError::Other(format!(
                "could not extract archive to {}",
                target_path
            )));
        }
        let mut state = self.state.lock().unwrap();
        let instance = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| EngineError::NotFound(instance_id.to_string()))?;
        instance.staged.extend(unpack(&archive));
        Ok(())
    }

    async fn start(&self, instance_id: &str) -> Result<(), EngineError> {
        if self.fail_start {
            return Err(EngineError::Other("OCI runtime create failed".to_string()));
        }
        let mut state = self.state.lock().unwrap();
        let instance = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| EngineError::NotFound(instance_id.to_string()))?;
        instance.started = true;
        Ok(())
    }

    async fn wait_for_exit(
        &self,
        instance_id: &str,
        limit: Duration,
    ) -> Result<WaitOutcome, EngineError> {
        let stalled = self.run_delay.map_or(false, |delay| delay >= limit);
        if let Some(delay) = self.run_delay {
            tokio::time::sleep(delay.min(limit)).await;
        }
        let staged = {
            let state = self.state.lock().unwrap();
            let instance = state
                .instances
                .get(instance_id)
                .ok_or_else(|| EngineError::NotFound(instance_id.to_string()))?;
            if !instance.started {
                return Err(EngineError::Other(format!("{} is not running", instance_id)));
            }
            instance.staged.clone()
        };

        let (outcome, logs) = self.simulate(&staged, limit, stalled);
        let mut state = self.state.lock().unwrap();
        if let Some(instance) = state.instances.get_mut(instance_id) {
            instance.logs = logs;
        }
        Ok(outcome)
    }

    async fn stop(&self, _instance_id: &str) -> Result<(), EngineError> {
        self.state.lock().unwrap().stops += 1;
        Ok(())
    }

    async fn read_logs(&self, instance_id: &str) -> Result<InstanceLogs, EngineError> {
        let state = self.state.lock().unwrap();
        let produced = state
            .instances
            .get(instance_id)
            .map(|instance| &instance.logs)
            .ok_or_else(|| EngineError::NotFound(instance_id.to_string()))?;
        let mut logs = InstanceLogs::default();
        logs.push_stdout(&produced.stdout, self.log_limit);
        logs.push_stderr(&produced.stderr, self.log_limit);
        Ok(logs)
    }

    async fn remove(&self, instance_id: &str) -> Result<(), EngineError> {
        if let Some(delay) = self.remove_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        state.remove_attempts += 1;
        if self.fail_remove {
            return Err(EngineError::Other("device or resource busy".to_string()));
        }
        if state.instances.remove(instance_id).is_some() {
            state.removed += 1;
        }
        Ok(())
    }
}
