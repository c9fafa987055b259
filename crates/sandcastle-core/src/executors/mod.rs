//! Container runtime access for sandboxed execution.
//!
//! `ContainerRuntime` is the thin seam over the container daemon's control
//! API: one method per call, no retries, no bookkeeping. The Docker
//! implementation lives in [`docker`]; [`lifecycle`] layers per-call
//! timeouts, bounded retries and idempotence on top of any runtime.

use crate::core_types::{PortMapping, ResourceLimits, StreamType};
use crate::errors::RuntimeCallError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::time::Duration;

pub mod docker;
pub mod lifecycle;

pub use docker::DockerRuntime;
pub use lifecycle::{ContainerLifecycle, LifecyclePolicy};

/// Everything needed to create one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Unique per execution, so a retried create can detect its own
    /// earlier attempt.
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub working_dir: String,
    /// Bind mounts in `host:container[:mode]` form.
    pub volumes: Vec<String>,
    pub env: Vec<String>,
    pub limits: ResourceLimits,
    pub network_disabled: bool,
    pub publish_ports: bool,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerState {
    pub running: bool,
    pub exit_code: Option<i64>,
    pub oom_killed: bool,
    pub ports: Vec<PortMapping>,
}

impl ContainerState {
    pub fn exited(&self) -> bool {
        !self.running
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub stream: StreamType,
    pub text: String,
}

pub type LogChunkStream = BoxStream<'static, Result<LogChunk, RuntimeCallError>>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<(), RuntimeCallError>;

    /// Make `image` available locally. Runtimes that resolve images on
    /// their own keep the default.
    async fn ensure_image(&self, _image: &str) -> Result<(), RuntimeCallError> {
        Ok(())
    }

    /// Allocate a container and return the runtime-assigned id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeCallError>;

    async fn start(&self, container_id: &str) -> Result<(), RuntimeCallError>;

    async fn inspect(&self, container_id: &str) -> Result<ContainerState, RuntimeCallError>;

    /// Graceful termination; the runtime escalates to a kill once `grace`
    /// has elapsed.
    async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), RuntimeCallError>;

    async fn kill(&self, container_id: &str) -> Result<(), RuntimeCallError>;

    /// Force-remove the container and its anonymous volumes.
    async fn remove(&self, container_id: &str) -> Result<(), RuntimeCallError>;

    /// Follow stdout/stderr from the beginning until the container exits.
    fn logs(&self, container_id: &str) -> LogChunkStream;
}
