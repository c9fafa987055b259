// src/executors/docker.rs
use async_trait::async_trait;
use bollard::container::LogOutput; // For LogOutput::StdOut, LogOutput::StdErr
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    CreateImageOptions as BollardCreateImageOptionsQuery,
    InspectContainerOptions as BollardInspectContainerOptionsQuery,
    KillContainerOptions as BollardKillContainerOptionsQuery,
    LogsOptions as BollardLogsOptionsQuery,
    RemoveContainerOptions as BollardRemoveContainerOptionsQuery,
    StartContainerOptions as BollardStartContainerOptionsQuery,
    StopContainerOptions as BollardStopContainerOptionsQuery,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::time::Duration;

use super::{ContainerRuntime, ContainerSpec, ContainerState, LogChunk, LogChunkStream};
use crate::core_types::{PortMapping, StreamType};
use crate::errors::{OrchestratorError, RuntimeCallError};

/// `ContainerRuntime` backed by the local Docker daemon.
///
/// The client is cheap to clone and carries no per-execution state, so one
/// instance is shared by every execution.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, OrchestratorError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            OrchestratorError::RuntimeUnavailable(format!("Failed to connect to Docker: {}", e))
        })?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    fn container_body(spec: &ContainerSpec) -> ContainerCreateBody {
        let limits = &spec.limits;
        ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            working_dir: Some(spec.working_dir.clone()),
            env: if spec.env.is_empty() { None } else { Some(spec.env.clone()) },
            labels: Some(spec.labels.clone()),
            network_disabled: Some(spec.network_disabled),
            host_config: Some(HostConfig {
                binds: Some(spec.volumes.clone()),
                memory: Some(limits.memory_bytes),
                // Equal to memory: no swap on top of the limit
                memory_swap: Some(limits.memory_bytes),
                cpu_shares: Some(limits.cpu_shares),
                network_mode: if spec.network_disabled {
                    Some("none".to_string())
                } else {
                    None
                },
                publish_all_ports: Some(spec.publish_ports),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                ..Default::default()
            }),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeCallError> {
        log::info!("Pulling image {}", image);
        let options = Some(BollardCreateImageOptionsQuery {
            from_image: Some(image.to_string()),
            ..Default::default()
        });

        let mut pull_stream = self.docker.create_image(options, None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => log::debug!("Pulling {}: {:?}", image, info.status),
                Err(e) => {
                    log::warn!("Failed to pull image {}: {}", image, e);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

fn published_ports(ports: Option<bollard::models::PortMap>) -> Vec<PortMapping> {
    let mut mappings: Vec<PortMapping> = ports
        .unwrap_or_default()
        .into_iter()
        .flat_map(|(container_port, bindings)| {
            bindings
                .unwrap_or_default()
                .into_iter()
                .filter_map(move |binding| {
                    let host_port = binding.host_port?.parse().ok()?;
                    Some(PortMapping {
                        container_port: container_port.clone(),
                        host_port,
                    })
                })
        })
        .collect();
    mappings.sort_by(|a, b| a.container_port.cmp(&b.container_port));
    mappings.dedup();
    mappings
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeCallError> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeCallError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(()),
            Err(e) => match RuntimeCallError::from(e) {
                RuntimeCallError::NotFound(_) => self.pull_image(image).await,
                other => Err(other),
            },
        }
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeCallError> {
        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(spec.name.clone()),
            ..Default::default()
        });
        let container = self
            .docker
            .create_container(options, Self::container_body(spec))
            .await?;
        for warning in &container.warnings {
            log::warn!("Docker warning for {}: {}", spec.name, warning);
        }
        Ok(container.id)
    }

    async fn start(&self, container_id: &str) -> Result<(), RuntimeCallError> {
        self.docker
            .start_container(container_id, None::<BollardStartContainerOptionsQuery>)
            .await?;
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerState, RuntimeCallError> {
        let response = self
            .docker
            .inspect_container(container_id, None::<BollardInspectContainerOptionsQuery>)
            .await?;

        let state = response.state.unwrap_or_default();
        let running = state.running.unwrap_or(false);
        Ok(ContainerState {
            running,
            exit_code: if running { None } else { state.exit_code },
            oom_killed: state.oom_killed.unwrap_or(false),
            ports: published_ports(response.network_settings.and_then(|n| n.ports)),
        })
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), RuntimeCallError> {
        let options = Some(BollardStopContainerOptionsQuery {
            t: Some(grace.as_secs().min(i32::MAX as u64) as i32),
            ..Default::default()
        });
        self.docker.stop_container(container_id, options).await?;
        Ok(())
    }

    async fn kill(&self, container_id: &str) -> Result<(), RuntimeCallError> {
        self.docker
            .kill_container(container_id, None::<BollardKillContainerOptionsQuery>)
            .await?;
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeCallError> {
        let options = Some(BollardRemoveContainerOptionsQuery {
            force: true,
            v: true,
            ..Default::default()
        });
        self.docker.remove_container(container_id, options).await?;
        Ok(())
    }

    fn logs(&self, container_id: &str) -> LogChunkStream {
        let docker = self.docker.clone();
        let container_id = container_id.to_string();

        async_stream::stream! {
            let mut output_stream = docker.logs(
                &container_id,
                Some(BollardLogsOptionsQuery {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            );

            while let Some(log_result) = output_stream.next().await {
                match log_result {
                    Ok(log_output) => match log_output {
                        LogOutput::StdOut { message } | LogOutput::Console { message } => {
                            yield Ok(LogChunk {
                                stream: StreamType::Stdout,
                                text: String::from_utf8_lossy(&message).into_owned(),
                            });
                        }
                        LogOutput::StdErr { message } => {
                            yield Ok(LogChunk {
                                stream: StreamType::Stderr,
                                text: String::from_utf8_lossy(&message).into_owned(),
                            });
                        }
                        _ => {}
                    },
                    Err(e) => {
                        yield Err(RuntimeCallError::from(e));
                        break;
                    }
                }
            }
        }
        .boxed()
    }
}
