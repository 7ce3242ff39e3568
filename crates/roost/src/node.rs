//! Node context.
//!
//! [`Node`] owns everything shared between workloads on this host: the
//! configuration store, the runtime client, the platform strategies and the
//! registry of environments. The binary builds exactly one.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, info, warn};
use roost_files::{DiskUsage, Jail, JailError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::ConfigStore;
use crate::environment::network::{NetworkBootstrap, NetworkError};
use crate::environment::state::ProcessState;
use crate::environment::{Environment, EnvironmentError, EnvironmentSettings};
use crate::install::{InstallScript, InstallationProcess};
use crate::platform::Platform;
use crate::runtime::RuntimeApi;
use crate::states::{StateError, StateStore};

pub type NodeResult<T> = Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("unknown workload {0}")]
    UnknownWorkload(String),

    #[error("invalid workload id {0:?}")]
    InvalidId(String),

    #[error("workload definition {path} is invalid: {source}")]
    Definition {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Jail(#[from] JailError),
}

/// Workload ids double as container and directory names.
fn validate_id(id: &str) -> NodeResult<()> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(NodeError::InvalidId(id.to_string()))
    }
}

pub struct Node {
    config: Arc<ConfigStore>,
    runtime: Arc<dyn RuntimeApi>,
    platform: Platform,
    network: NetworkBootstrap,
    states: StateStore,
    environments: DashMap<String, Arc<Environment>>,
    disk_usage: DashMap<String, Arc<DiskUsage>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("platform", &self.platform)
            .field("workloads", &self.environments.len())
            .finish()
    }
}

impl Node {
    pub fn new(config: Arc<ConfigStore>, runtime: Arc<dyn RuntimeApi>, platform: Platform) -> Self {
        let states = StateStore::new(config.snapshot().system.states_file());
        let network = NetworkBootstrap::new(runtime.clone(), config.clone(), platform.clone());
        Self {
            config,
            runtime,
            platform,
            network,
            states,
            environments: DashMap::new(),
            disk_usage: DashMap::new(),
        }
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<dyn RuntimeApi> {
        &self.runtime
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn states(&self) -> &StateStore {
        &self.states
    }

    pub async fn ensure_network(&self, ctx: &CancellationToken) -> NodeResult<()> {
        self.network.ensure_network(ctx).await?;
        Ok(())
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Add a workload, or replace the settings of a known one.
    ///
    /// Creates the workload's data directory so it can be bind mounted.
    pub async fn register(
        &self,
        id: &str,
        settings: EnvironmentSettings,
    ) -> NodeResult<Arc<Environment>> {
        validate_id(id)?;
        let data = self.config.snapshot().system.workload_data(id);
        tokio::fs::create_dir_all(&data)
            .await
            .map_err(|source| NodeError::Io { path: data, source })?;

        if let Some(existing) = self.get(id) {
            existing.update_settings(settings)?;
            debug!("updated settings for {}", id);
            return Ok(existing);
        }

        let env = Environment::new(
            id,
            settings,
            self.runtime.clone(),
            self.platform.clone(),
            self.config.clone(),
        )?;
        self.environments.insert(id.to_string(), env.clone());
        info!("registered workload {}", id);
        Ok(env)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Environment>> {
        self.environments.get(id).map(|e| e.value().clone())
    }

    pub fn environment(&self, id: &str) -> NodeResult<Arc<Environment>> {
        self.get(id)
            .ok_or_else(|| NodeError::UnknownWorkload(id.to_string()))
    }

    /// Registered workload ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.environments.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Destroy a workload's container and forget it.
    pub async fn remove(&self, id: &str, ctx: &CancellationToken) -> NodeResult<()> {
        let env = self.environment(id)?;
        env.destroy(ctx).await?;
        self.environments.remove(id);
        self.disk_usage.remove(id);
        info!("removed workload {}", id);
        Ok(())
    }

    /// Register every `<id>.json` definition found on disk. Returns how many
    /// were loaded. A missing directory means no workloads.
    pub async fn load_definitions(&self) -> NodeResult<usize> {
        let dir = self.config.snapshot().system.workload_definitions();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(source) => return Err(NodeError::Io { path: dir, source }),
        };

        let io_err = |path: &PathBuf| {
            let path = path.clone();
            move |source| NodeError::Io { path, source }
        };

        let mut loaded = 0;
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&dir))? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
            else {
                continue;
            };

            let raw = tokio::fs::read(&path).await.map_err(io_err(&path))?;
            let settings: EnvironmentSettings = serde_json::from_slice(&raw)
                .map_err(|source| NodeError::Definition {
                    path: path.clone(),
                    source,
                })?;
            self.register(&id, settings).await?;
            loaded += 1;
        }
        Ok(loaded)
    }

    // ========================================================================
    // States
    // ========================================================================

    pub fn current_states(&self) -> HashMap<String, ProcessState> {
        self.environments
            .iter()
            .map(|e| (e.key().clone(), e.value().state()))
            .collect()
    }

    pub async fn persist_states(&self) -> NodeResult<()> {
        self.states.save(&self.current_states()).await?;
        Ok(())
    }

    /// Reconcile registered workloads with their containers after a restart.
    ///
    /// Running containers are attached to. A workload recorded as running whose
    /// container is gone or stopped is started again. Returns how many
    /// workloads are running afterwards.
    #[instrument(skip_all)]
    pub async fn restore(&self, ctx: &CancellationToken) -> NodeResult<usize> {
        let recorded = self.states.load().await?;
        let mut running = 0;

        for id in self.ids() {
            let Some(env) = self.get(&id) else { continue };
            match env.attach(ctx).await {
                Ok(true) => {
                    debug!("attached to running container for {}", id);
                    running += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("failed to inspect container for {}: {}", id, e);
                    continue;
                }
            }

            let was_up = matches!(
                recorded.get(&id),
                Some(ProcessState::Running | ProcessState::Starting)
            );
            if !was_up {
                continue;
            }
            info!("workload {} was running before restart, starting it", id);
            match env.start(ctx).await {
                Ok(()) => running += 1,
                Err(e) => warn!("failed to restart {}: {}", id, e),
            }
        }
        Ok(running)
    }

    // ========================================================================
    // Files and installation
    // ========================================================================

    /// Jail rooted at the workload's data directory.
    pub fn jail(&self, id: &str) -> NodeResult<Jail> {
        validate_id(id)?;
        let root = self.config.snapshot().system.workload_data(id);
        Ok(Jail::new(root)?)
    }

    /// Disk usage of the workload's data directory, cached per workload.
    pub async fn disk_usage(&self, id: &str) -> NodeResult<u64> {
        let usage = match self.disk_usage.get(id) {
            Some(usage) => usage.value().clone(),
            None => {
                let interval = self.config.snapshot().system.disk_check_interval;
                let usage = Arc::new(DiskUsage::new(
                    self.jail(id)?,
                    Duration::from_secs(interval),
                ));
                self.disk_usage
                    .entry(id.to_string())
                    .or_insert(usage)
                    .value()
                    .clone()
            }
        };
        Ok(usage.get().await?)
    }

    /// Give the configured node user ownership of the workload's files.
    #[cfg(unix)]
    pub async fn chown(&self, id: &str) -> NodeResult<()> {
        let user = self.config.snapshot().system.user;
        self.jail(id)?.chown("", user.uid, user.gid).await?;
        Ok(())
    }

    pub fn installer(&self, id: &str, script: InstallScript) -> NodeResult<InstallationProcess> {
        Ok(InstallationProcess::new(self.environment(id)?, script))
    }
}
