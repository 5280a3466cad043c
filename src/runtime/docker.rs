//! Docker Engine implementation of [`ContainerRuntime`]
//!
//! This is the only place that knows Docker's literal vocabulary: filter keys
//! (`ancestor`, `reference`, `type`), event actions (`die`, `start`, ...) and
//! state strings. Everything is translated into the controller's own types
//! before it leaves this module.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, ListImagesOptions};
use bollard::models::{BuildInfo, ContainerSummary, EventMessage, EventMessageTypeEnum, HostConfig};
use bollard::system::EventsOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::StreamExt;
use tokio::sync::mpsc;

use super::{
    BuildProgress, BuildRequest, ContainerRuntime, ContainerState, CreateRequest, EventStreams,
    ExecSession, ExecStatus, LifecycleEvent, LifecycleKind, ManagedContainer,
};
use crate::{Error, Result};

/// Request timeout in seconds. Streaming bodies (events, build output,
/// exec output) are not bound by it.
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Container runtime backed by a Docker Engine API endpoint
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to `unix://`, `tcp://` or `http://` endpoints
    pub fn connect(host: &str) -> Result<Self> {
        let docker = if host.starts_with("unix://") {
            Docker::connect_with_unix(host, REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        } else {
            return Err(Error::Runtime(format!("unsupported container host {}", host)));
        };

        tracing::debug!(host = %host, "Connected to container runtime");
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self, image: &str) -> Result<Vec<ManagedContainer>> {
        let mut filters = HashMap::new();
        filters.insert("ancestor".to_string(), vec![image.to_string()]);

        let options = ListContainersOptions::<String> {
            all: false,
            filters,
            ..Default::default()
        };

        let summaries = self.docker.list_containers(Some(options)).await?;
        Ok(summaries.into_iter().filter_map(translate_summary).collect())
    }

    async fn create_container(&self, request: &CreateRequest) -> Result<String> {
        let options = CreateContainerOptions {
            name: request.name.clone(),
            platform: None,
        };

        let config = Config {
            image: Some(request.image.clone()),
            env: Some(request.env.clone()),
            labels: Some(request.labels.clone().into_iter().collect()),
            host_config: Some(HostConfig {
                auto_remove: Some(request.auto_remove),
                binds: Some(request.binds.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self.docker.create_container(Some(options), config).await?;
        for warning in &response.warnings {
            tracing::warn!(container = %response.id, warning = %warning, "Runtime warning on create");
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        let mut filters = HashMap::new();
        filters.insert("reference".to_string(), vec![reference.to_string()]);

        let options = ListImagesOptions::<String> {
            filters,
            ..Default::default()
        };

        let images = self.docker.list_images(Some(options)).await?;
        Ok(images
            .iter()
            .any(|image| image.repo_tags.iter().any(|tag| tag == reference)))
    }

    fn build_image(
        &self,
        request: BuildRequest,
        context: Vec<u8>,
    ) -> mpsc::UnboundedReceiver<Result<BuildProgress>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let options = BuildImageOptions {
                dockerfile: request.dockerfile,
                t: request.tag,
                rm: true,
                buildargs: request.build_args,
                platform: request.platform,
                ..Default::default()
            };

            let mut stream = Box::pin(docker.build_image(options, None, Some(context.into())));
            while let Some(item) = stream.next().await {
                let progress = match item {
                    Ok(info) => match translate_build_info(info) {
                        Some(progress) => Ok(progress),
                        None => continue,
                    },
                    Err(e) => Err(Error::from(e)),
                };
                if tx.send(progress).is_err() {
                    break;
                }
            }
        });

        rx
    }

    fn subscribe(&self) -> EventStreams {
        let (event_tx, events) = mpsc::unbounded_channel();
        let (error_tx, errors) = mpsc::unbounded_channel();
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let mut filters = HashMap::new();
            filters.insert("type".to_string(), vec!["container".to_string()]);
            let options = EventsOptions::<String> {
                filters,
                ..Default::default()
            };

            let mut stream = Box::pin(docker.events(Some(options)));
            while let Some(item) = stream.next().await {
                let delivered = match item {
                    Ok(message) => match translate_event(message) {
                        Some(event) => event_tx.send(event).is_ok(),
                        None => true,
                    },
                    Err(e) => error_tx.send(Error::from(e)).is_ok(),
                };
                if !delivered {
                    break;
                }
            }
            tracing::warn!("Runtime event stream ended");
        });

        EventStreams { events, errors }
    }

    async fn exec(&self, container_id: &str, cmd: &[String]) -> Result<ExecSession> {
        let options = CreateExecOptions {
            cmd: Some(cmd.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let created = self.docker.create_exec(container_id, options).await?;

        let (tx, output) = mpsc::unbounded_channel();
        match self.docker.start_exec(&created.id, None).await? {
            StartExecResults::Attached { output: mut stream, .. } => {
                let exec_id = created.id.clone();
                tokio::spawn(async move {
                    while let Some(chunk) = stream.next().await {
                        match chunk {
                            Ok(log) => {
                                for line in log.to_string().lines() {
                                    if tx.send(line.to_string()).is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::warn!(exec = %exec_id, error = %e, "Error reading exec output");
                                return;
                            }
                        }
                    }
                });
            }
            StartExecResults::Detached => {}
        }

        Ok(ExecSession {
            exec_id: created.id,
            output,
        })
    }

    async fn exec_status(&self, exec_id: &str) -> Result<ExecStatus> {
        let inspect = self.docker.inspect_exec(exec_id).await?;
        Ok(ExecStatus {
            running: inspect.running.unwrap_or(false),
            exit_code: inspect.exit_code,
        })
    }
}

fn translate_summary(summary: ContainerSummary) -> Option<ManagedContainer> {
    let id = summary.id?;
    let name = summary
        .names
        .and_then(|names| names.into_iter().next())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();

    Some(ManagedContainer {
        id,
        name,
        image: summary.image.unwrap_or_default(),
        state: translate_state(summary.state.as_deref()),
    })
}

fn translate_state(state: Option<&str>) -> ContainerState {
    match state {
        Some("created") => ContainerState::Created,
        Some("running") | Some("restarting") | Some("paused") => ContainerState::Running,
        Some("exited") => ContainerState::Exited,
        Some("removing") | Some("dead") => ContainerState::Removed,
        _ => ContainerState::Unknown,
    }
}

fn translate_event(message: EventMessage) -> Option<LifecycleEvent> {
    if message.typ != Some(EventMessageTypeEnum::CONTAINER) {
        return None;
    }

    let kind = match message.action.as_deref()? {
        "create" => LifecycleKind::Created,
        "start" => LifecycleKind::Started,
        "die" => LifecycleKind::Exited,
        "destroy" => LifecycleKind::Destroyed,
        _ => return None,
    };

    let actor = message.actor?;
    let attributes = actor.attributes.unwrap_or_default();

    Some(LifecycleEvent {
        kind,
        container_id: actor.id?,
        image: attributes.get("image").cloned(),
        attributes,
    })
}

fn translate_build_info(info: BuildInfo) -> Option<BuildProgress> {
    if let Some(error) = info.error {
        return Some(BuildProgress::Failed(error));
    }
    if let Some(detail) = info.error_detail.and_then(|d| d.message) {
        return Some(BuildProgress::Failed(detail));
    }

    let line = info.stream.or(info.status)?;
    let line = line.trim_end();
    if line.is_empty() {
        None
    } else {
        Some(BuildProgress::Output(line.to_string()))
    }
}
