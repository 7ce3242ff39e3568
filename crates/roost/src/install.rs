//! Installer containers.
//!
//! An installation runs a script inside a throwaway container that sees the
//! workload's data directory and a scratch directory holding the script. The
//! container and the scratch directory are removed however the run ends.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::{debug, info, warn};
use roost_files::{Jail, JailError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::Configuration;
use crate::environment::Environment;
use crate::environment::container::{environment_variables, log_config, tmpfs};
use crate::environment::resources::ResourceLimits;
use crate::events::Event;
use crate::platform::HostKind;
use crate::runtime::types::{ContainerSpec, HostConfig, MountSpec};
use crate::runtime::{LABEL_CONTAINER_TYPE, LABEL_SERVICE, RuntimeError};

pub const CONTAINER_TYPE_INSTALLER: &str = "server_installer";

/// How long to keep draining output after the installer exits.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub type InstallResult<T> = Result<T, InstallError>;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("an installation is already running for {0}")]
    AlreadyInstalling(String),

    #[error("installer {operation} failed: {source}")]
    Runtime {
        operation: &'static str,
        #[source]
        source: RuntimeError,
    },

    #[error("failed to prepare {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("install script exited with code {code}{}", detail(.message))]
    ScriptFailed { code: i64, message: Option<String> },

    #[error(transparent)]
    Jail(#[from] JailError),

    #[error("installation cancelled")]
    Cancelled,
}

fn detail(message: &Option<String>) -> String {
    message
        .as_deref()
        .map(|m| format!(": {}", m))
        .unwrap_or_default()
}

fn runtime_err(operation: &'static str) -> impl FnOnce(RuntimeError) -> InstallError {
    move |source| InstallError::Runtime { operation, source }
}

/// Script to run and the image to run it in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallScript {
    pub container_image: String,
    /// Interpreter, e.g. `bash` or `powershell`.
    pub entrypoint: String,
    pub script: String,
}

/// Where things live inside the installer container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerLayout {
    pub data_target: &'static str,
    pub install_target: &'static str,
    pub script_name: &'static str,
    /// Script path passed to the entrypoint.
    pub script_path: &'static str,
    pub privileged: bool,
    pub user: Option<&'static str>,
}

impl InstallerLayout {
    pub fn for_host(kind: HostKind) -> Self {
        match kind {
            HostKind::Linux => Self {
                data_target: "/mnt/server",
                install_target: "/mnt/install",
                script_name: "install.sh",
                script_path: "/mnt/install/install.sh",
                privileged: true,
                user: None,
            },
            HostKind::Windows => Self {
                data_target: "/Roost-Server",
                install_target: "/Roost-Install",
                script_name: "install.ps1",
                script_path: "C:\\Roost-Install\\install.ps1",
                privileged: false,
                user: Some("NT Authority\\System"),
            },
        }
    }
}

/// Releases the per-workload install slot.
struct InstallSlot<'a>(&'a Environment);

impl Drop for InstallSlot<'_> {
    fn drop(&mut self) {
        self.0.end_install();
    }
}

/// One installation run for a workload.
pub struct InstallationProcess {
    env: Arc<Environment>,
    script: InstallScript,
}

impl InstallationProcess {
    pub fn new(env: Arc<Environment>, script: InstallScript) -> Self {
        Self { env, script }
    }

    fn container_name(&self) -> String {
        format!("{}_installer", self.env.id())
    }

    fn temp_dir(&self, config: &Configuration) -> PathBuf {
        config.system.tmp_directory.join(self.env.id())
    }

    /// Run the install script to completion.
    ///
    /// Only one installation per workload may run at a time. Output lines are
    /// published as [`Event::InstallOutput`].
    #[instrument(skip_all, fields(workload = %self.env.id()))]
    pub async fn run(&self, ctx: &CancellationToken) -> InstallResult<()> {
        if !self.env.try_begin_install() {
            return Err(InstallError::AlreadyInstalling(self.env.id().to_string()));
        }
        let _slot = InstallSlot(&self.env);

        let config = self.env.config().snapshot();
        let events = self.env.events();
        events.publish(Event::InstallStarted);
        info!("starting installation for {}", self.env.id());

        let result = self.execute(ctx, &config).await;
        self.cleanup(&config).await;

        let result = match result {
            Ok(()) => self.normalize_ownership(&config).await,
            Err(e) => Err(e),
        };

        events.publish(Event::InstallCompleted {
            successful: result.is_ok(),
        });
        match &result {
            Ok(()) => info!("installation for {} completed", self.env.id()),
            Err(e) => warn!("installation for {} failed: {}", self.env.id(), e),
        }
        result
    }

    async fn execute(&self, ctx: &CancellationToken, config: &Configuration) -> InstallResult<()> {
        let layout = InstallerLayout::for_host(self.env.platform().kind());
        let temp_dir = self.temp_dir(config);
        self.write_script(&temp_dir, &layout).await?;

        let runtime = self.env.runtime();
        let name = self.container_name();

        match runtime.remove_container(&name).await {
            Ok(()) => debug!("removed stale installer container {}", name),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(runtime_err("cleanup")(e)),
        }

        let spec = self.container_spec(config, &layout, &temp_dir);
        let id = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(InstallError::Cancelled),
            result = runtime.create_container(&name, &spec) => result.map_err(runtime_err("create"))?,
        };

        tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(InstallError::Cancelled),
            result = runtime.start_container(&id) => result.map_err(runtime_err("start"))?,
        }

        let output = match runtime.logs(&id).await {
            Ok(mut lines) => {
                let events = self.env.events().clone();
                Some(tokio::spawn(async move {
                    while let Some(line) = lines.next().await {
                        match line {
                            Ok(line) => events.publish(Event::InstallOutput(line)),
                            Err(e) => {
                                if !e.is_end_of_stream() {
                                    debug!("installer output stream failed: {}", e);
                                }
                                break;
                            }
                        }
                    }
                }))
            }
            Err(e) => {
                warn!("failed to attach to installer output: {}", e);
                None
            }
        };

        let waited = tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(InstallError::Cancelled),
            result = runtime.wait_container(&id) => result.map_err(runtime_err("wait")),
        };

        if let Some(mut task) = output {
            let drained = waited.is_ok()
                && tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut task)
                    .await
                    .is_ok();
            if !drained {
                task.abort();
            }
        }

        let exit = waited?;
        if exit.status_code != 0 {
            return Err(InstallError::ScriptFailed {
                code: exit.status_code,
                message: exit.error.map(|e| e.message).filter(|m| !m.is_empty()),
            });
        }
        Ok(())
    }

    async fn write_script(&self, temp_dir: &Path, layout: &InstallerLayout) -> InstallResult<()> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| InstallError::Io { path, source }
        };

        tokio::fs::create_dir_all(temp_dir)
            .await
            .map_err(io_err(temp_dir))?;

        let script_path = temp_dir.join(layout.script_name);
        let script = self.script.script.replace("\r\n", "\n");
        tokio::fs::write(&script_path, script)
            .await
            .map_err(io_err(&script_path))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o644))
                .await
                .map_err(io_err(&script_path))?;
        }
        Ok(())
    }

    pub(crate) fn container_spec(
        &self,
        config: &Configuration,
        layout: &InstallerLayout,
        temp_dir: &Path,
    ) -> ContainerSpec {
        let settings = self.env.settings();
        let limits = ResourceLimits {
            memory_limit: config.docker.installer_limits.memory,
            cpu_limit: config.docker.installer_limits.cpu,
            swap: 0,
            ..Default::default()
        };

        ContainerSpec {
            hostname: "installer".to_string(),
            user: layout.user.unwrap_or_default().to_string(),
            image: self.script.container_image.clone(),
            env: environment_variables(&settings, config),
            cmd: vec![
                self.script.entrypoint.clone(),
                layout.script_path.to_string(),
            ],
            labels: HashMap::from([
                (LABEL_SERVICE.to_string(), config.app_name.clone()),
                (
                    LABEL_CONTAINER_TYPE.to_string(),
                    CONTAINER_TYPE_INSTALLER.to_string(),
                ),
            ]),
            attach_stdin: true,
            attach_stdout: true,
            attach_stderr: true,
            open_stdin: true,
            tty: true,
            host_config: HostConfig {
                resources: self.env.platform().resources().convert(&limits),
                mounts: vec![
                    MountSpec {
                        target: layout.data_target.to_string(),
                        source: config
                            .system
                            .workload_data(self.env.id())
                            .display()
                            .to_string(),
                        kind: "bind".to_string(),
                        read_only: false,
                    },
                    MountSpec {
                        target: layout.install_target.to_string(),
                        source: temp_dir.display().to_string(),
                        kind: "bind".to_string(),
                        read_only: false,
                    },
                ],
                tmpfs: tmpfs(config.docker.tmpfs_size),
                dns: config.docker.network.dns.clone(),
                log_config: Some(log_config(false)),
                network_mode: config.docker.network.network_mode.clone(),
                privileged: layout.privileged,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Remove the installer container and scratch directory. Never fails.
    async fn cleanup(&self, config: &Configuration) {
        let name = self.container_name();
        match self.env.runtime().remove_container(&name).await {
            Ok(()) => debug!("removed installer container {}", name),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("failed to remove installer container {}: {}", name, e),
        }

        let temp_dir = self.temp_dir(config);
        match tokio::fs::remove_dir_all(&temp_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove {}: {}", temp_dir.display(), e),
        }
    }

    /// Hand the data directory back to the workload user.
    async fn normalize_ownership(&self, config: &Configuration) -> InstallResult<()> {
        let data = config.system.workload_data(self.env.id());
        if !data.exists() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            let jail = Jail::new(&data)?;
            jail.chown("", config.system.user.uid, config.system.user.gid)
                .await?;
        }
        Ok(())
    }
}
