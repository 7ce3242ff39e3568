//! Workload environments.
//!
//! An [`Environment`] is the agent's handle to one workload's container. It
//! owns the process state machine, drives the runtime through lifecycle
//! operations and runs the background stats poller while the workload is up.

pub mod container;
pub mod mounts;
pub mod network;
pub mod resources;
pub mod state;
pub mod stats;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::ConfigStore;
use crate::events::EventBus;
use crate::platform::Platform;
use crate::runtime::{RuntimeApi, RuntimeError};

use mounts::{Allocations, Mount};
use resources::ResourceLimits;
use state::{InvalidTransition, ProcessState, StateMachine};
use stats::PollError;

pub type EnvironmentResult<T> = Result<T, EnvironmentError>;

#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("failed to {operation} container for {id}: {source}")]
    Runtime {
        operation: &'static str,
        id: String,
        #[source]
        source: RuntimeError,
    },

    #[error("invalid resource limits: {0}")]
    InvalidLimits(String),

    #[error("container for {0} is running but reports no start time")]
    MissingStartTime(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl EnvironmentError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EnvironmentError::Runtime { source, .. } if source.is_not_found())
    }
}

/// What a workload runs with. Applied on the next container create.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentSettings {
    pub image: String,
    pub env: HashMap<String, String>,
    pub limits: ResourceLimits,
    /// Custom mounts. The data mount is added automatically.
    pub mounts: Vec<Mount>,
    pub allocations: Allocations,
    pub labels: HashMap<String, String>,
}

struct PollerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// One workload's container and lifecycle state.
pub struct Environment {
    id: String,
    /// Engine id of the current container. Replaced on every create.
    container_id: RwLock<Option<String>>,
    state: StateMachine,
    settings: RwLock<EnvironmentSettings>,
    runtime: Arc<dyn RuntimeApi>,
    platform: Platform,
    config: Arc<ConfigStore>,
    events: EventBus,
    /// Serializes lifecycle operations.
    lifecycle: tokio::sync::Mutex<()>,
    poller: Mutex<Option<PollerHandle>>,
    installing: AtomicBool,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .field("platform", &self.platform)
            .finish()
    }
}

impl Environment {
    pub fn new(
        id: impl Into<String>,
        settings: EnvironmentSettings,
        runtime: Arc<dyn RuntimeApi>,
        platform: Platform,
        config: Arc<ConfigStore>,
    ) -> EnvironmentResult<Arc<Self>> {
        settings
            .limits
            .validate()
            .map_err(EnvironmentError::InvalidLimits)?;

        let events = EventBus::new();
        Ok(Arc::new(Self {
            id: id.into(),
            container_id: RwLock::new(None),
            state: StateMachine::new(ProcessState::Offline, events.clone()),
            settings: RwLock::new(settings),
            runtime,
            platform,
            config,
            events,
            lifecycle: tokio::sync::Mutex::new(()),
            poller: Mutex::new(None),
            installing: AtomicBool::new(false),
        }))
    }

    /// Workload id, also the container name.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ProcessState {
        self.state.get()
    }

    pub fn subscribe_state(&self) -> tokio::sync::watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn runtime(&self) -> &Arc<dyn RuntimeApi> {
        &self.runtime
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn settings(&self) -> EnvironmentSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the settings. They apply from the next container create.
    pub fn update_settings(&self, settings: EnvironmentSettings) -> EnvironmentResult<()> {
        settings
            .limits
            .validate()
            .map_err(EnvironmentError::InvalidLimits)?;
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
        Ok(())
    }

    pub fn container_id(&self) -> Option<String> {
        self.container_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_container_id(&self, id: Option<String>) {
        *self.container_id.write().unwrap_or_else(PoisonError::into_inner) = id;
    }

    /// Identifier to address the container with: its engine id once known,
    /// otherwise its name.
    pub fn container_ref(&self) -> String {
        self.container_id().unwrap_or_else(|| self.id.clone())
    }

    /// Whether a stats poller is currently running.
    pub fn is_polling(&self) -> bool {
        self.poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|p| !p.task.is_finished())
    }

    /// Claim the single installer slot. Returns false if it is taken.
    pub(crate) fn try_begin_install(&self) -> bool {
        self.installing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn end_install(&self) {
        self.installing.store(false, Ordering::SeqCst);
    }

    pub fn is_installing(&self) -> bool {
        self.installing.load(Ordering::SeqCst)
    }

    /// Run a runtime call, giving up when `ctx` is cancelled.
    async fn call<T>(
        &self,
        ctx: &CancellationToken,
        operation: &'static str,
        fut: impl Future<Output = Result<T, RuntimeError>>,
    ) -> EnvironmentResult<T> {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(EnvironmentError::Cancelled),
            result = fut => result.map_err(|source| EnvironmentError::Runtime {
                operation,
                id: self.id.clone(),
                source,
            }),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create the workload container from the current settings. Does not start it.
    #[instrument(skip_all, fields(workload = %self.id))]
    pub async fn create(&self, ctx: &CancellationToken) -> EnvironmentResult<String> {
        let spec = container::build_spec(
            &self.id,
            &self.settings(),
            &self.config.snapshot(),
            &self.platform,
        );
        let id = self
            .call(ctx, "create", self.runtime.create_container(&self.id, &spec))
            .await?;
        info!("created container {} for {}", id, self.id);
        self.set_container_id(Some(id.clone()));
        Ok(id)
    }

    /// Start the workload.
    ///
    /// An existing stopped container is replaced so the current limits apply.
    /// On failure or cancellation the workload is left Offline.
    #[instrument(skip_all, fields(workload = %self.id))]
    pub async fn start(self: &Arc<Self>, ctx: &CancellationToken) -> EnvironmentResult<()> {
        let _lock = self.lifecycle.lock().await;
        let guard = self.state.begin(ProcessState::Starting)?;

        match self
            .call(ctx, "inspect", self.runtime.inspect_container(&self.id))
            .await
        {
            Ok(inspect) if inspect.state.running => {
                debug!("container for {} already running, attaching", self.id);
                self.set_container_id(Some(inspect.id));
            }
            Ok(_) => {
                self.call(ctx, "remove", self.runtime.remove_container(&self.id))
                    .await?;
                self.create(ctx).await?;
                self.start_container(ctx).await?;
            }
            Err(e) if e.is_not_found() => {
                self.create(ctx).await?;
                self.start_container(ctx).await?;
            }
            Err(e) => return Err(e),
        }

        self.state.transition(ProcessState::Running)?;
        guard.commit();
        info!("workload {} is running", self.id);

        self.ensure_poller();
        Ok(())
    }

    async fn start_container(&self, ctx: &CancellationToken) -> EnvironmentResult<()> {
        let container = self.container_ref();
        self.call(ctx, "start", self.runtime.start_container(&container))
            .await
    }

    /// Gracefully stop the workload. A no-op when already Offline.
    #[instrument(skip_all, fields(workload = %self.id))]
    pub async fn stop(&self, ctx: &CancellationToken) -> EnvironmentResult<()> {
        let _lock = self.lifecycle.lock().await;
        if self.state().is_offline() {
            return Ok(());
        }

        let guard = self.state.begin(ProcessState::Stopping)?;
        let grace = self.config.snapshot().docker.stop_timeout;
        let container = self.container_ref();

        match self
            .call(ctx, "stop", self.runtime.stop_container(&container, grace))
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("container for {} already gone", self.id),
            Err(e) => return Err(e),
        }

        self.state.transition(ProcessState::Offline)?;
        guard.commit();
        self.cancel_poller();
        info!("workload {} stopped", self.id);
        Ok(())
    }

    /// Kill the workload with `signal` and mark it Offline.
    #[instrument(skip_all, fields(workload = %self.id))]
    pub async fn terminate(&self, ctx: &CancellationToken, signal: &str) -> EnvironmentResult<()> {
        let _lock = self.lifecycle.lock().await;
        if self.state().is_offline() {
            return Ok(());
        }

        let container = self.container_ref();
        match self
            .call(ctx, "kill", self.runtime.kill_container(&container, signal))
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("container for {} already gone", self.id),
            Err(e) => return Err(e),
        }

        self.state.transition(ProcessState::Offline)?;
        self.cancel_poller();
        info!("workload {} terminated with {}", self.id, signal);
        Ok(())
    }

    /// Stop polling, force-remove the container and mark the workload Offline.
    #[instrument(skip_all, fields(workload = %self.id))]
    pub async fn destroy(&self, ctx: &CancellationToken) -> EnvironmentResult<()> {
        let _lock = self.lifecycle.lock().await;
        self.cancel_poller();

        let container = self.container_ref();
        match self
            .call(ctx, "remove", self.runtime.remove_container(&container))
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        self.set_container_id(None);
        self.state.transition(ProcessState::Offline)?;
        info!("destroyed container for {}", self.id);
        Ok(())
    }

    /// Compare the recorded state with the container and record a crash when
    /// the container is gone or no longer running.
    pub async fn sync_state(&self, ctx: &CancellationToken) -> EnvironmentResult<ProcessState> {
        let _lock = self.lifecycle.lock().await;
        let current = self.state();
        if current.is_offline() {
            return Ok(current);
        }

        let running = match self
            .call(ctx, "inspect", self.runtime.inspect_container(&self.container_ref()))
            .await
        {
            Ok(inspect) => {
                if !inspect.state.running {
                    warn!(
                        "workload {} exited unexpectedly (code {}, oom killed: {})",
                        self.id, inspect.state.exit_code, inspect.state.oom_killed
                    );
                }
                inspect.state.running
            }
            Err(e) if e.is_not_found() => {
                warn!("container for {} disappeared", self.id);
                false
            }
            Err(e) => return Err(e),
        };

        if !running {
            self.state.transition(ProcessState::Offline)?;
            self.cancel_poller();
        }
        Ok(self.state())
    }

    /// Pick up a container that is already running, e.g. after an agent
    /// restart, and resume polling. Returns whether it was running.
    pub async fn attach(self: &Arc<Self>, ctx: &CancellationToken) -> EnvironmentResult<bool> {
        let _lock = self.lifecycle.lock().await;
        if !self.state().is_offline() {
            self.ensure_poller();
            return Ok(true);
        }

        let inspect = match self
            .call(ctx, "inspect", self.runtime.inspect_container(&self.id))
            .await
        {
            Ok(inspect) => inspect,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };
        if !inspect.state.running {
            return Ok(false);
        }

        self.set_container_id(Some(inspect.id));
        self.state.transition(ProcessState::Starting)?;
        self.state.transition(ProcessState::Running)?;
        self.ensure_poller();
        Ok(true)
    }

    /// Milliseconds since the container started; 0 when it is not running.
    pub async fn uptime(&self, ctx: &CancellationToken) -> EnvironmentResult<i64> {
        let inspect = match self
            .call(ctx, "inspect", self.runtime.inspect_container(&self.container_ref()))
            .await
        {
            Ok(inspect) => inspect,
            Err(e) if e.is_not_found() => return Ok(0),
            Err(e) => return Err(e),
        };
        if !inspect.state.running {
            return Ok(0);
        }

        let started = inspect
            .state
            .started_at
            .ok_or_else(|| EnvironmentError::MissingStartTime(self.id.clone()))?;
        Ok((Utc::now() - started).num_milliseconds().max(0))
    }

    // ========================================================================
    // Stats poller
    // ========================================================================

    /// Launch the stats poller unless one is already running.
    fn ensure_poller(self: &Arc<Self>) {
        let mut slot = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|p| !p.task.is_finished()) {
            debug!("stats poller for {} already active", self.id);
            return;
        }

        let token = CancellationToken::new();
        let env = Arc::clone(self);
        let child = token.clone();
        let task = tokio::spawn(async move {
            match stats::poll(&env, &child).await {
                Ok(()) => {
                    // The stream ended on its own; find out whether the
                    // container is still alive.
                    if !env.state().is_offline()
                        && let Err(e) = env.sync_state(&CancellationToken::new()).await
                    {
                        warn!("failed to sync state for {}: {}", env.id, e);
                    }
                }
                Err(PollError::Cancelled) => debug!("stats poller for {} cancelled", env.id),
                Err(e) => warn!("stats poller for {} failed: {}", env.id, e),
            }
        });

        *slot = Some(PollerHandle { token, task });
    }

    fn cancel_poller(&self) {
        let handle = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.token.cancel();
        }
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if let Some(handle) = self
            .poller
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.token.cancel();
        }
    }
}
