//! roost - node agent for containerized game-server workloads.
//!
//! The crate is organised around [`environment::Environment`], the handle to one
//! workload's container. A [`node::Node`] owns the shared pieces (configuration,
//! the runtime client and the platform strategies) and the registry of
//! environments on this host.

pub mod config;
pub mod environment;
pub mod events;
pub mod install;
pub mod node;
pub mod platform;
pub mod runtime;
pub mod states;

pub use config::{ConfigStore, Configuration};
pub use environment::{Environment, EnvironmentError, EnvironmentSettings};
pub use events::{Event, EventBus};
pub use node::{Node, NodeError};
pub use platform::{HostKind, Platform};
pub use runtime::{DockerClient, RuntimeApi, RuntimeError};
