//! Docker implementation of [`ContainerRuntime`] via the bollard client.

use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerApiError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;

use crate::runtime::{ContainerRuntime, ContainerSpec, ExecOutput, SandboxError};

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect with the local daemon defaults (unix socket / npipe).
    pub fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults().map_err(runtime_err)?;
        Ok(Self { docker })
    }
}

fn runtime_err(e: DockerApiError) -> SandboxError {
    SandboxError::Runtime(e.to_string())
}

/// Map a bollard error, treating HTTP 404 as the missing-container signal.
fn classify(name: &str, e: DockerApiError) -> SandboxError {
    if let DockerApiError::DockerResponseServerError { status_code, .. } = &e {
        if *status_code == 404 {
            return SandboxError::Missing(name.to_string());
        }
    }
    runtime_err(e)
}

/// The daemon answers 304 when a start/stop is already in the requested
/// state; that is success for our purposes.
fn ignore_not_modified(result: Result<(), DockerApiError>, name: &str) -> Result<(), SandboxError> {
    match result {
        Ok(()) => Ok(()),
        Err(DockerApiError::DockerResponseServerError { status_code: 304, .. }) => Ok(()),
        Err(e) => Err(classify(name, e)),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<(), SandboxError> {
        let binds: Vec<String> = spec.binds.iter().map(|b| b.to_bind_string()).collect();
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let config = Config::<String> {
            image: Some(spec.image.clone()),
            working_dir: Some(spec.working_dir.clone()),
            env: Some(env),
            // Keep the container alive between exec calls.
            cmd: Some(vec!["sleep".into(), "infinity".into()]),
            network_disabled: Some(spec.network_disabled),
            host_config: Some(HostConfig {
                binds: Some(binds),
                network_mode: spec.network_disabled.then(|| "none".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(runtime_err)?;

        tracing::info!(container = %spec.name, image = %spec.image, "sandbox container created");
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), SandboxError> {
        ignore_not_modified(
            self.docker
                .start_container(name, None::<StartContainerOptions<String>>)
                .await,
            name,
        )
    }

    async fn stop(&self, name: &str) -> Result<(), SandboxError> {
        ignore_not_modified(
            self.docker
                .stop_container(name, Some(StopContainerOptions { t: 5 }))
                .await,
            name,
        )
    }

    async fn remove(&self, name: &str) -> Result<(), SandboxError> {
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // Already gone is fine.
            Err(DockerApiError::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(runtime_err(e)),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool, SandboxError> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(_) => Ok(true),
            Err(DockerApiError::DockerResponseServerError { status_code: 404, .. }) => Ok(false),
            Err(e) => Err(runtime_err(e)),
        }
    }

    async fn exec(
        &self,
        name: &str,
        command: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, SandboxError> {
        let exec = self
            .docker
            .create_exec(
                name,
                CreateExecOptions::<String> {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| classify(name, e))?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| classify(name, e))?;

        let mut output = String::new();
        if let StartExecResults::Attached { output: mut stream, .. } = started {
            let drained = tokio::time::timeout(timeout, async {
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(log) => {
                            output.push_str(&String::from_utf8_lossy(&log.into_bytes()));
                        }
                        Err(e) => {
                            tracing::warn!(container = name, error = %e, "exec stream error");
                            break;
                        }
                    }
                }
            })
            .await;
            if drained.is_err() {
                return Err(SandboxError::Timeout(timeout));
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| classify(name, e))?;
        let exit_code = inspect.exit_code.unwrap_or(-1);

        Ok(ExecOutput { output, exit_code })
    }
}
