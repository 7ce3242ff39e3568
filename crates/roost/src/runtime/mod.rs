//! Container runtime access.
//!
//! Everything the agent asks of the container engine goes through the
//! [`RuntimeApi`] trait so environments can be driven against a mock in tests.
//! [`DockerClient`] is the production implementation speaking the Docker
//! Engine API over its Unix socket.

mod docker;
mod error;
pub mod types;

pub use docker::DockerClient;
pub use error::{RuntimeError, RuntimeResult};
pub use types::{
    ContainerInspect, ContainerSpec, NetworkInspect, NetworkSpec, PlatformResources,
    RuntimeStats, WaitResponse,
};

use async_trait::async_trait;
use futures::stream::BoxStream;

/// Live statistics frames, one per engine sample (about once a second).
pub type StatsStream = BoxStream<'static, RuntimeResult<RuntimeStats>>;

/// Output lines of an attached container.
pub type LogStream = BoxStream<'static, RuntimeResult<String>>;

/// Label marking a container as managed by this agent.
pub const LABEL_SERVICE: &str = "Service";
/// Label describing the role of a managed container.
pub const LABEL_CONTAINER_TYPE: &str = "ContainerType";

/// Trait for container runtime operations.
#[async_trait]
pub trait RuntimeApi: Send + Sync {
    /// Create a container with the given name and return its id.
    async fn create_container(&self, name: &str, spec: &ContainerSpec) -> RuntimeResult<String>;
    async fn start_container(&self, id: &str) -> RuntimeResult<()>;
    /// Ask the container to stop, killing it after `timeout_secs`.
    async fn stop_container(&self, id: &str, timeout_secs: u64) -> RuntimeResult<()>;
    async fn kill_container(&self, id: &str, signal: &str) -> RuntimeResult<()>;
    /// Force-remove a container along with its anonymous volumes.
    async fn remove_container(&self, id: &str) -> RuntimeResult<()>;
    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerInspect>;
    /// Block until the container is no longer running.
    async fn wait_container(&self, id: &str) -> RuntimeResult<WaitResponse>;
    async fn stats(&self, id: &str) -> RuntimeResult<StatsStream>;
    /// Follow stdout and stderr of the container from its start.
    async fn logs(&self, id: &str) -> RuntimeResult<LogStream>;
    async fn inspect_network(&self, name: &str) -> RuntimeResult<NetworkInspect>;
    async fn create_network(&self, spec: &NetworkSpec) -> RuntimeResult<String>;
}
