//! Container runtime client contract
//!
//! The controller never talks to a runtime API directly. Everything it needs
//! goes through [`ContainerRuntime`], expressed in the controller's own
//! vocabulary; the Docker wire format stays inside [`docker`].

pub mod docker;

use std::collections::BTreeMap;
use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{Error, Result};

pub use docker::DockerRuntime;

/// Lifecycle state of a container as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    Removed,
    Unknown,
}

impl ContainerState {
    /// Whether a container in this state fills one pool slot
    pub fn occupies_slot(&self) -> bool {
        matches!(self, ContainerState::Running)
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::Created => write!(f, "Created"),
            ContainerState::Running => write!(f, "Running"),
            ContainerState::Exited => write!(f, "Exited"),
            ContainerState::Removed => write!(f, "Removed"),
            ContainerState::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A container derived from the managed image. Enumerated on demand, never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: ContainerState,
}

/// Everything needed to create one worker container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub binds: Vec<String>,
    pub auto_remove: bool,
}

/// Image build submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub tag: String,
    pub dockerfile: String,
    pub platform: String,
    pub build_args: HashMap<String, String>,
}

/// One item of build output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildProgress {
    Output(String),
    Failed(String),
}

/// Lifecycle event kinds the controller understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleKind {
    Created,
    Started,
    Exited,
    Destroyed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub kind: LifecycleKind,
    pub container_id: String,
    pub image: Option<String>,
    pub attributes: HashMap<String, String>,
}

/// The two halves of an event subscription.
///
/// Neither half reconnects: once the transport fails the channels stay open
/// until the producer gives up, and errors are only reported.
pub struct EventStreams {
    pub events: mpsc::UnboundedReceiver<LifecycleEvent>,
    pub errors: mpsc::UnboundedReceiver<Error>,
}

/// A command started inside a container
pub struct ExecSession {
    pub exec_id: String,
    pub output: mpsc::UnboundedReceiver<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecStatus {
    pub running: bool,
    pub exit_code: Option<i64>,
}

/// Client contract for the container runtime
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Running containers derived from `image`
    async fn list_containers(&self, image: &str) -> Result<Vec<ManagedContainer>>;

    /// Create a container, returning its runtime id
    async fn create_container(&self, request: &CreateRequest) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Force-remove a container regardless of state
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Exact tag match in the local image catalog
    async fn image_exists(&self, reference: &str) -> Result<bool>;

    /// Submit a build with a tar archive as context; output arrives on the channel
    fn build_image(
        &self,
        request: BuildRequest,
        context: Vec<u8>,
    ) -> mpsc::UnboundedReceiver<Result<BuildProgress>>;

    fn subscribe(&self) -> EventStreams;

    /// Run `cmd` inside a container with output attached
    async fn exec(&self, container_id: &str, cmd: &[String]) -> Result<ExecSession>;

    async fn exec_status(&self, exec_id: &str) -> Result<ExecStatus>;
}
