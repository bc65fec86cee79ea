// src/engine/docker.rs
use async_trait::async_trait;
use bollard::container::LogOutput; // For LogOutput::StdOut, LogOutput::StdErr
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    BuildImageOptions as BollardBuildImageOptionsQuery,
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    CreateImageOptions as BollardCreateImageOptionsQuery,
    ListImagesOptions as BollardListImagesOptionsQuery,
    LogsOptions as BollardLogsOptionsQuery,
    RemoveContainerOptions as BollardRemoveContainerOptionsQuery,
    StartContainerOptions as BollardStartContainerOptionsQuery,
    StopContainerOptions as BollardStopContainerOptionsQuery,
    UploadToContainerOptions as BollardUploadToContainerOptionsQuery,
    WaitContainerOptions as BollardWaitContainerOptionsQuery,
};
use bollard::Docker;
use bytes::Bytes;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::time::Duration;

use super::{
    ImageHandle, InstanceLogs, InstanceSpec, IsolationEngine, WaitOutcome, DEFAULT_LOG_LIMIT,
};
use crate::engine::ResourcePolicy;
use crate::errors::EngineError;

/// Isolation engine backed by a Docker daemon through bollard.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
    log_limit: usize,
}

impl DockerEngine {
    /// Connect using `DOCKER_HOST` or the platform's local socket.
    pub fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::from_client(docker))
    }

    pub fn from_client(docker: Docker) -> Self {
        Self {
            docker,
            log_limit: DEFAULT_LOG_LIMIT,
        }
    }

    /// Bytes of stdout and of stderr kept per instance; the rest is drained and dropped.
    pub fn with_log_limit(mut self, bytes: usize) -> Self {
        self.log_limit = bytes;
        self
    }

    pub async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    fn host_config(policy: &ResourcePolicy) -> HostConfig {
        HostConfig {
            memory: policy.memory_bytes,
            // Same as memory so the ceiling cannot be bypassed through swap.
            memory_swap: policy.memory_bytes,
            nano_cpus: policy.nano_cpus,
            pids_limit: policy.pids_limit,
            network_mode: if policy.network_enabled {
                None
            } else {
                Some("none".to_string())
            },
            privileged: Some(false),
            security_opt: Some(vec![ResourcePolicy::NO_NEW_PRIVILEGES.to_string()]),
            cap_drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }
    }
}

fn is_status(err: &BollardError, code: u16) -> bool {
    matches!(err, BollardError::DockerResponseServerError { status_code, .. } if *status_code == code)
}

#[async_trait]
impl IsolationEngine for DockerEngine {
    async fn list_images(&self, reference: &str) -> Result<Vec<ImageHandle>, EngineError> {
        let mut filters = HashMap::new();
        filters.insert("reference".to_string(), vec![reference.to_string()]);
        let options = Some(BollardListImagesOptionsQuery {
            all: true,
            filters: Some(filters),
            ..Default::default()
        });

        let images = self.docker.list_images(options).await?;
        Ok(images
            .into_iter()
            .map(|summary| ImageHandle {
                id: summary.id,
                created: summary.created,
                tags: summary.repo_tags,
            })
            .collect())
    }

    async fn pull_image(&self, reference: &str) -> Result<(), EngineError> {
        let pull_options = Some(BollardCreateImageOptionsQuery {
            from_image: Some(reference.to_string()),
            ..Default::default()
        });

        let mut pull_stream = self.docker.create_image(pull_options, None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(_) => {}
                Err(e) if is_status(&e, 404) => {
                    return Err(EngineError::NotFound(reference.to_string()))
                }
                Err(e) => return Err(e.into()),
            }
        }
        log::info!("Pulled image {}", reference);
        Ok(())
    }

    async fn build_image(&self, context: Vec<u8>, tag: &str) -> Result<String, EngineError> {
        let options = BollardBuildImageOptionsQuery {
            dockerfile: "Dockerfile".to_string(),
            t: Some(tag.to_string()),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let mut build_stream =
            self.docker
                .build_image(options, None, Some(bollard::body_full(Bytes::from(context))));

        let mut build_log = String::new();
        while let Some(result) = build_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(line) = info.stream {
                        build_log.push_str(&line);
                    }
                }
                Err(e) => {
                    build_log.push_str(&e.to_string());
                    return Err(EngineError::BuildFailed { log: build_log });
                }
            }
        }
        Ok(build_log)
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String, EngineError> {
        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(spec.name.clone()),
            ..Default::default()
        });

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            working_dir: Some(spec.working_dir.clone()),
            network_disabled: Some(!spec.policy.network_enabled),
            host_config: Some(Self::host_config(&spec.policy)),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let container = match self.docker.create_container(options, config).await {
            Ok(container) => container,
            Err(e) if is_status(&e, 404) => return Err(EngineError::NotFound(spec.image.clone())),
            Err(e) => return Err(e.into()),
        };
        for warning in &container.warnings {
            log::warn!("Docker warning for container {}: {}", container.id, warning);
        }
        Ok(container.id)
    }

    async fn copy_into_instance(
        &self,
        instance_id: &str,
        target_path: &str,
        archive: Vec<u8>,
    ) -> Result<(), EngineError> {
        let options = Some(BollardUploadToContainerOptionsQuery {
            path: target_path.to_string(),
            ..Default::default()
        });
        self.docker
            .upload_to_container(instance_id, options, bollard::body_full(Bytes::from(archive)))
            .await?;
        Ok(())
    }

    async fn start(&self, instance_id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(instance_id, None::<BollardStartContainerOptionsQuery>)
            .await?;
        Ok(())
    }

    async fn wait_for_exit(
        &self,
        instance_id: &str,
        limit: Duration,
    ) -> Result<WaitOutcome, EngineError> {
        // wait_container returns a stream. We need to await the next item for the result.
        let mut wait_stream = self
            .docker
            .wait_container(instance_id, None::<BollardWaitContainerOptionsQuery>);

        match tokio::time::timeout(limit, wait_stream.next()).await {
            Err(_) => Ok(WaitOutcome::TimedOut),
            Ok(Some(Ok(response))) => Ok(WaitOutcome::Exited {
                status_code: response.status_code,
            }),
            // bollard reports a nonzero exit as an error carrying the code
            Ok(Some(Err(BollardError::DockerContainerWaitError { code, .. }))) => {
                Ok(WaitOutcome::Exited { status_code: code })
            }
            Ok(Some(Err(e))) => Err(EngineError::Docker(e)),
            Ok(None) => Err(EngineError::Other(format!(
                "wait stream for container {} ended unexpectedly",
                instance_id
            ))),
        }
    }

    async fn stop(&self, instance_id: &str) -> Result<(), EngineError> {
        let options = Some(BollardStopContainerOptionsQuery {
            t: Some(0),
            ..Default::default()
        });
        match self.docker.stop_container(instance_id, options).await {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 304) => Ok(()), // already stopped
            Err(e) => Err(e.into()),
        }
    }

    async fn read_logs(&self, instance_id: &str) -> Result<InstanceLogs, EngineError> {
        let mut output_stream = self.docker.logs(
            instance_id,
            Some(BollardLogsOptionsQuery {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let mut logs = InstanceLogs::default();
        while let Some(log_result) = output_stream.next().await {
            match log_result? {
                LogOutput::StdOut { message } => logs.push_stdout(&message, self.log_limit),
                LogOutput::StdErr { message } => logs.push_stderr(&message, self.log_limit),
                _ => {}
            }
        }
        if logs.truncated {
            log::warn!(
                "Output of container {} exceeded {} bytes and was truncated",
                instance_id,
                self.log_limit
            );
        }
        Ok(logs)
    }

    async fn remove(&self, instance_id: &str) -> Result<(), EngineError> {
        let options = Some(BollardRemoveContainerOptionsQuery {
            force: true,
            v: true,
            ..Default::default()
        });
        match self.docker.remove_container(instance_id, options).await {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 404) => Ok(()), // already gone
            Err(e) => Err(e.into()),
        }
    }
}
