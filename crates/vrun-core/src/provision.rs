//! Environment provisioning with a fingerprint-keyed image cache
//!
//! Each environment request is reduced to a fingerprint. A pre-built image
//! reference is its own fingerprint; Dockerfiles and recipes are fingerprinted
//! by the SHA-256 of the rendered Dockerfile and built under a tag derived
//! from it, so the engine's image store doubles as a cache that survives
//! process restarts.
//!
//! Within a process, resolved handles are memoised per fingerprint behind a
//! [`OnceCell`]. Concurrent requests for the same fingerprint wait on the
//! first one instead of starting their own build.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

use crate::archive::ArchiveBuilder;
use crate::engine::{ImageHandle, IsolationEngine};
use crate::errors::{EngineError, ProvisionError};
use crate::task::{EnvironmentSpec, Recipe};

const BUILT_IMAGE_PREFIX: &str = "vrun-env-";
const DEFAULT_STARTUP_COMMAND: [&str; 2] = ["sleep", "infinity"];

/// Cache key and engine reference for one environment request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentTarget {
    pub fingerprint: String,
    /// Reference used to look the image up in the engine.
    pub reference: String,
    /// Dockerfile to build when the image is missing; `None` for pre-built images.
    pub dockerfile: Option<String>,
}

impl EnvironmentTarget {
    pub fn from_spec(spec: &EnvironmentSpec) -> Self {
        match spec {
            EnvironmentSpec::Image(reference) => Self {
                fingerprint: reference.trim().to_string(),
                reference: reference.trim().to_string(),
                dockerfile: None,
            },
            EnvironmentSpec::Dockerfile(contents) => Self::built(contents.clone()),
            EnvironmentSpec::Recipe(recipe) => Self::built(render_recipe(recipe)),
        }
    }

    fn built(dockerfile: String) -> Self {
        let fingerprint = format!("{:x}", Sha256::digest(dockerfile.as_bytes()));
        Self {
            reference: format!("{}{}:latest", BUILT_IMAGE_PREFIX, &fingerprint[..16]),
            fingerprint,
            dockerfile: Some(dockerfile),
        }
    }
}

/// Render a recipe as a Dockerfile.
pub fn render_recipe(recipe: &Recipe) -> String {
    let mut dockerfile = format!("FROM {}\n", recipe.base_image.trim());
    for step in recipe.setup.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        dockerfile.push_str(&format!("RUN {}\n", step));
    }

    let startup: Vec<String> = match &recipe.startup_command {
        Some(command) if !command.is_empty() => command.clone(),
        _ => DEFAULT_STARTUP_COMMAND.iter().map(|s| s.to_string()).collect(),
    };
    // Exec form; a JSON array of strings is exactly what Dockerfile expects.
    let exec_form = serde_json::to_string(&startup).unwrap_or_else(|_| "[]".to_string());
    dockerfile.push_str(&format!("CMD {}\n", exec_form));
    dockerfile
}

pub struct Provisioner {
    engine: Arc<dyn IsolationEngine>,
    resolved: Mutex<HashMap<String, Arc<OnceCell<ImageHandle>>>>,
}

impl Provisioner {
    pub fn new(engine: Arc<dyn IsolationEngine>) -> Self {
        Self {
            engine,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve an environment to a concrete image, building it at most once.
    pub async fn resolve(&self, spec: &EnvironmentSpec) -> Result<ImageHandle, ProvisionError> {
        let target = EnvironmentTarget::from_spec(spec);
        let cell = {
            let mut resolved = self.resolved.lock().await;
            Arc::clone(resolved.entry(target.fingerprint.clone()).or_default())
        };

        if let Some(handle) = cell.get() {
            log::debug!("Environment {} already resolved to {}", target.reference, handle.id);
            return Ok(handle.clone());
        }
        let handle = cell.get_or_try_init(|| self.lookup_or_build(&target)).await?;
        Ok(handle.clone())
    }

    /// Forget the memoised handle for `spec`, e.g. after the image was removed
    /// outside this process. The next resolve queries the engine again.
    pub async fn invalidate(&self, spec: &EnvironmentSpec) -> bool {
        let target = EnvironmentTarget::from_spec(spec);
        self.resolved
            .lock()
            .await
            .remove(&target.fingerprint)
            .is_some()
    }

    async fn lookup_or_build(
        &self,
        target: &EnvironmentTarget,
    ) -> Result<ImageHandle, ProvisionError> {
        if let Some(handle) = self.engine.find_image(&target.reference).await? {
            log::info!("Using cached image {} for {}", handle.id, target.reference);
            return Ok(handle);
        }

        match &target.dockerfile {
            None => self.pull(target).await,
            Some(dockerfile) => self.build(target, dockerfile).await,
        }
    }

    async fn pull(&self, target: &EnvironmentTarget) -> Result<ImageHandle, ProvisionError> {
        log::info!("Image {} not found locally, pulling", target.reference);
        match self.engine.pull_image(&target.reference).await {
            Ok(()) => {}
            Err(EngineError::NotFound(_)) => {
                return Err(ProvisionError::ImageNotFound {
                    reference: target.reference.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        }
        self.engine
            .find_image(&target.reference)
            .await?
            .ok_or_else(|| ProvisionError::ImageNotFound {
                reference: target.reference.clone(),
            })
    }

    async fn build(
        &self,
        target: &EnvironmentTarget,
        dockerfile: &str,
    ) -> Result<ImageHandle, ProvisionError> {
        log::info!(
            "Building image {} (fingerprint {})",
            target.reference,
            target.fingerprint
        );
        let mut context = ArchiveBuilder::new();
        context.append("Dockerfile", dockerfile)?;
        let context = context.finish()?;

        let build_log = match self.engine.build_image(context, &target.reference).await {
            Ok(log) => log,
            Err(EngineError::BuildFailed { log }) => {
                return Err(ProvisionError::BuildFailed {
                    fingerprint: target.fingerprint.clone(),
                    log,
                })
            }
            Err(e) => {
                return Err(ProvisionError::BuildFailed {
                    fingerprint: target.fingerprint.clone(),
                    log: e.to_string(),
                })
            }
        };

        match self.engine.find_image(&target.reference).await? {
            Some(handle) => {
                log::info!("Built image {} as {}", handle.id, target.reference);
                Ok(handle)
            }
            None => Err(ProvisionError::BuildFailed {
                fingerprint: target.fingerprint.clone(),
                log: build_log,
            }),
        }
    }
}
