//! Shared fixtures for the integration tests: an in-memory container runtime
//! and a configuration rooted in a temporary directory.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;

use roost::config::{ConfigStore, Configuration, UserIds};
use roost::environment::{Environment, EnvironmentSettings};
use roost::events::Event;
use roost::platform::{HostKind, Platform};
use roost::runtime::types::{ContainerState, NetworkInspect, RuntimeStats, WaitResponse};
use roost::runtime::{
    ContainerInspect, ContainerSpec, LogStream, NetworkSpec, RuntimeApi, RuntimeError,
    RuntimeResult, StatsStream,
};

/// Runtime double that keeps containers and networks in memory and records
/// every call as `"<operation>:<name>"`.
pub struct MockRuntime {
    calls: Mutex<Vec<String>>,
    /// Container name to running flag.
    containers: Mutex<HashMap<String, bool>>,
    specs: Mutex<Vec<(String, ContainerSpec)>>,
    networks: Mutex<HashMap<String, String>>,
    network_specs: Mutex<Vec<NetworkSpec>>,
    stats_tx: Mutex<Option<mpsc::Sender<RuntimeResult<RuntimeStats>>>>,
    stats_rx: Mutex<Option<mpsc::Receiver<RuntimeResult<RuntimeStats>>>>,
    log_lines: Mutex<Vec<String>>,
    exit_code: AtomicI64,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    pub hang_start: AtomicBool,
    pub hang_wait: AtomicBool,
    pub fail_network_inspect: AtomicBool,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(64);
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            containers: Mutex::new(HashMap::new()),
            specs: Mutex::new(Vec::new()),
            networks: Mutex::new(HashMap::new()),
            network_specs: Mutex::new(Vec::new()),
            stats_tx: Mutex::new(Some(tx)),
            stats_rx: Mutex::new(Some(rx)),
            log_lines: Mutex::new(Vec::new()),
            exit_code: AtomicI64::new(0),
            fail_start: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            hang_start: AtomicBool::new(false),
            hang_wait: AtomicBool::new(false),
            fail_network_inspect: AtomicBool::new(false),
        })
    }

    fn record(&self, op: &str, name: &str) {
        self.calls.lock().unwrap().push(format!("{}:{}", op, name));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of recorded calls of `op`.
    pub fn count(&self, op: &str) -> usize {
        let prefix = format!("{}:", op);
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    pub fn has_container(&self, name: &str) -> bool {
        self.containers.lock().unwrap().contains_key(name)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.containers
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(false)
    }

    /// Simulate a container that is already present, e.g. left behind by a
    /// previous agent run.
    pub fn add_container(&self, name: &str, running: bool) {
        self.containers
            .lock()
            .unwrap()
            .insert(name.to_string(), running);
    }

    /// Make a container vanish without going through the agent.
    pub fn remove_container_silently(&self, name: &str) {
        self.containers.lock().unwrap().remove(name);
    }

    pub fn set_running(&self, name: &str, running: bool) {
        if let Some(flag) = self.containers.lock().unwrap().get_mut(name) {
            *flag = running;
        }
    }

    pub fn specs(&self) -> Vec<(String, ContainerSpec)> {
        self.specs.lock().unwrap().clone()
    }

    pub fn add_network(&self, name: &str, driver: &str) {
        self.networks
            .lock()
            .unwrap()
            .insert(name.to_string(), driver.to_string());
    }

    pub fn network_specs(&self) -> Vec<NetworkSpec> {
        self.network_specs.lock().unwrap().clone()
    }

    pub fn set_logs(&self, lines: &[&str]) {
        *self.log_lines.lock().unwrap() = lines.iter().map(|l| l.to_string()).collect();
    }

    pub fn set_exit_code(&self, code: i64) {
        self.exit_code.store(code, Ordering::SeqCst);
    }

    /// Queue a frame on the stats stream. Dropped silently once the poller
    /// has gone away.
    pub fn push_stats(&self, frame: RuntimeStats) {
        if let Some(tx) = self.stats_tx.lock().unwrap().as_ref() {
            let _ = tx.try_send(Ok(frame));
        }
    }

    pub fn push_stats_error(&self, err: RuntimeError) {
        if let Some(tx) = self.stats_tx.lock().unwrap().as_ref() {
            let _ = tx.try_send(Err(err));
        }
    }

    /// End the stats stream.
    pub fn close_stats(&self) {
        self.stats_tx.lock().unwrap().take();
    }

    /// Names are used as keys; ids are `<name>-id`.
    fn key(id: &str) -> String {
        id.strip_suffix("-id").unwrap_or(id).to_string()
    }

    fn not_found(id: &str) -> RuntimeError {
        RuntimeError::NotFound(format!("no such container: {}", id))
    }
}

#[async_trait]
impl RuntimeApi for MockRuntime {
    async fn create_container(&self, name: &str, spec: &ContainerSpec) -> RuntimeResult<String> {
        self.record("create", name);
        self.specs
            .lock()
            .unwrap()
            .push((name.to_string(), spec.clone()));
        self.containers
            .lock()
            .unwrap()
            .insert(name.to_string(), false);
        Ok(format!("{}-id", name))
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        let name = Self::key(id);
        self.record("start", &name);
        if self.hang_start.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api {
                operation: "start",
                status: 500,
                message: "cannot start container".to_string(),
            });
        }
        match self.containers.lock().unwrap().get_mut(&name) {
            Some(running) => {
                *running = true;
                Ok(())
            }
            None => Err(Self::not_found(id)),
        }
    }

    async fn stop_container(&self, id: &str, _timeout_secs: u64) -> RuntimeResult<()> {
        let name = Self::key(id);
        self.record("stop", &name);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api {
                operation: "stop",
                status: 500,
                message: "cannot stop container".to_string(),
            });
        }
        match self.containers.lock().unwrap().get_mut(&name) {
            Some(running) => {
                *running = false;
                Ok(())
            }
            None => Err(Self::not_found(id)),
        }
    }

    async fn kill_container(&self, id: &str, signal: &str) -> RuntimeResult<()> {
        let name = Self::key(id);
        self.record("kill", &format!("{}:{}", name, signal));
        match self.containers.lock().unwrap().get_mut(&name) {
            Some(running) => {
                *running = false;
                Ok(())
            }
            None => Err(Self::not_found(id)),
        }
    }

    async fn remove_container(&self, id: &str) -> RuntimeResult<()> {
        let name = Self::key(id);
        self.record("remove", &name);
        match self.containers.lock().unwrap().remove(&name) {
            Some(_) => Ok(()),
            None => Err(Self::not_found(id)),
        }
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerInspect> {
        let name = Self::key(id);
        self.record("inspect", &name);
        let running = self
            .containers
            .lock()
            .unwrap()
            .get(&name)
            .copied()
            .ok_or_else(|| Self::not_found(id))?;
        Ok(ContainerInspect {
            id: format!("{}-id", name),
            name: format!("/{}", name),
            state: ContainerState {
                status: if running { "running" } else { "exited" }.to_string(),
                running,
                exit_code: 0,
                oom_killed: false,
                started_at: running.then(|| Utc::now() - chrono::Duration::seconds(5)),
            },
        })
    }

    async fn wait_container(&self, id: &str) -> RuntimeResult<WaitResponse> {
        let name = Self::key(id);
        self.record("wait", &name);
        if self.hang_wait.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        self.set_running(&name, false);
        Ok(WaitResponse {
            status_code: self.exit_code.load(Ordering::SeqCst),
            error: None,
        })
    }

    async fn stats(&self, id: &str) -> RuntimeResult<StatsStream> {
        self.record("stats", &Self::key(id));
        let rx = self
            .stats_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| RuntimeError::Transport("stats already attached".to_string()))?;
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn logs(&self, id: &str) -> RuntimeResult<LogStream> {
        self.record("logs", &Self::key(id));
        let lines: Vec<RuntimeResult<String>> = self
            .log_lines
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .map(Ok)
            .collect();
        Ok(futures::stream::iter(lines).boxed())
    }

    async fn inspect_network(&self, name: &str) -> RuntimeResult<NetworkInspect> {
        self.record("inspect_network", name);
        if self.fail_network_inspect.load(Ordering::SeqCst) {
            return Err(RuntimeError::Transport("connection refused".to_string()));
        }
        match self.networks.lock().unwrap().get(name) {
            Some(driver) => Ok(NetworkInspect {
                name: name.to_string(),
                id: format!("{}-net", name),
                driver: driver.clone(),
                ..Default::default()
            }),
            None => Err(RuntimeError::NotFound(format!("network {}", name))),
        }
    }

    async fn create_network(&self, spec: &NetworkSpec) -> RuntimeResult<String> {
        self.record("create_network", &spec.name);
        self.network_specs.lock().unwrap().push(spec.clone());
        self.add_network(&spec.name, &spec.driver);
        Ok(format!("{}-net", spec.name))
    }
}

/// Configuration whose directories all live under `dir`.
pub fn test_config(dir: &TempDir) -> Configuration {
    let root = dir.path();
    let mut config = Configuration::default();
    config.system.root_directory = root.join("root");
    config.system.log_directory = root.join("log");
    config.system.data = root.join("volumes");
    config.system.archive_directory = root.join("archives");
    config.system.backup_directory = root.join("backups");
    config.system.tmp_directory = root.join("tmp");
    config.system.timezone = "UTC".to_string();
    config.system.user = current_user(dir);
    config
}

#[cfg(unix)]
fn current_user(dir: &TempDir) -> UserIds {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(dir.path()).unwrap();
    UserIds {
        uid: meta.uid(),
        gid: meta.gid(),
    }
}

#[cfg(not(unix))]
fn current_user(_dir: &TempDir) -> UserIds {
    UserIds::default()
}

pub fn test_store(dir: &TempDir) -> Arc<ConfigStore> {
    let path = dir.path().join("config.toml");
    Arc::new(ConfigStore::new(test_config(dir), path))
}

pub fn settings() -> EnvironmentSettings {
    let mut settings = EnvironmentSettings {
        image: "ghcr.io/roost/java:17".to_string(),
        ..Default::default()
    };
    settings.limits.memory_limit = 512;
    settings.limits.swap = -1;
    settings.limits.cpu_limit = 150;
    settings
}

pub fn environment(
    id: &str,
    runtime: &Arc<MockRuntime>,
    store: &Arc<ConfigStore>,
) -> Arc<Environment> {
    let runtime: Arc<dyn RuntimeApi> = runtime.clone();
    Environment::new(
        id,
        settings(),
        runtime,
        Platform::for_kind(HostKind::Linux),
        store.clone(),
    )
    .unwrap()
}

/// A stats frame taken one second after the previous one.
pub fn frame(memory: u64) -> RuntimeStats {
    let read = Utc::now();
    let mut stats = RuntimeStats {
        read: Some(read),
        preread: Some(read - chrono::Duration::seconds(1)),
        ..Default::default()
    };
    stats.memory_stats.usage = memory;
    stats.memory_stats.limit = 1_000_000_000;
    stats.cpu_stats.cpu_usage.total_usage = 2_000;
    stats.cpu_stats.system_cpu_usage = 20_000;
    stats.cpu_stats.online_cpus = 2;
    stats.precpu_stats.cpu_usage.total_usage = 1_000;
    stats.precpu_stats.system_cpu_usage = 10_000;
    stats.precpu_stats.online_cpus = 2;
    stats
}

/// Next event, failing the test after two seconds.
pub async fn next_event(rx: &mut broadcast::Receiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event bus closed")
}

/// Everything already published.
pub fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
