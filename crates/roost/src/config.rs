//! Node configuration.
//!
//! The configuration is loaded once at startup and held in a [`ConfigStore`].
//! Readers take cheap snapshots; the few places that correct configuration at
//! runtime (network bootstrap, directory setup) go through [`ConfigStore::update`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use log::{debug, info};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::platform::HostKind;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/roost/config.toml";

/// Prefix for environment overrides, e.g. `ROOST__DOCKER__SOCKET`.
pub const ENV_PREFIX: &str = "ROOST";

static TIMEZONE_SANITIZER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)[^a-z_/]+").expect("Invalid timezone sanitizer pattern"));

// ============================================================================
// Configuration types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Verbose logging. When enabled from the command line it is never written
    /// back to the file.
    pub debug: bool,
    /// Value of the `Service` label on every managed container.
    pub app_name: String,
    /// Host path prefixes workloads may mount in addition to their data dir.
    pub allowed_mounts: Vec<String>,
    pub system: SystemConfiguration,
    pub docker: DockerConfiguration,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            debug: false,
            app_name: "Roost".to_string(),
            allowed_mounts: Vec::new(),
            system: SystemConfiguration::default(),
            docker: DockerConfiguration::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserIds {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfiguration {
    pub root_directory: PathBuf,
    pub log_directory: PathBuf,
    /// Parent of every workload data directory.
    pub data: PathBuf,
    pub archive_directory: PathBuf,
    pub backup_directory: PathBuf,
    /// Scratch space, e.g. for install scripts.
    pub tmp_directory: PathBuf,
    pub username: String,
    pub timezone: String,
    /// Seconds between disk usage recomputations. 0 disables checks.
    pub disk_check_interval: u64,
    pub check_permissions_on_boot: bool,
    pub user: UserIds,
}

impl Default for SystemConfiguration {
    fn default() -> Self {
        Self {
            root_directory: PathBuf::from("/var/lib/roost"),
            log_directory: PathBuf::from("/var/log/roost"),
            data: PathBuf::from("/var/lib/roost/volumes"),
            archive_directory: PathBuf::from("/var/lib/roost/archives"),
            backup_directory: PathBuf::from("/var/lib/roost/backups"),
            tmp_directory: PathBuf::from("/tmp/roost"),
            username: "roost".to_string(),
            timezone: String::new(),
            disk_check_interval: 150,
            check_permissions_on_boot: true,
            user: UserIds::default(),
        }
    }
}

impl SystemConfiguration {
    /// Data directory of one workload, which is also its jail root.
    pub fn workload_data(&self, id: &str) -> PathBuf {
        self.data.join(id)
    }

    /// File tracking workload states across restarts.
    pub fn states_file(&self) -> PathBuf {
        self.root_directory.join("states.json")
    }

    /// Directory of `<id>.json` workload definitions loaded at boot.
    pub fn workload_definitions(&self) -> PathBuf {
        self.root_directory.join("workloads")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AddressPool {
    pub subnet: String,
    pub gateway: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkInterfaces {
    pub v4: AddressPool,
    pub v6: Option<AddressPool>,
}

impl Default for NetworkInterfaces {
    fn default() -> Self {
        Self {
            v4: AddressPool {
                subnet: "172.18.0.0/16".to_string(),
                gateway: "172.18.0.1".to_string(),
            },
            v6: Some(AddressPool {
                subnet: "fdba:17c8:6c94::/64".to_string(),
                gateway: "fdba:17c8:6c94::1011".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerNetworkConfiguration {
    /// Address ports are bound to by default. Corrected by network bootstrap.
    pub interface: String,
    pub dns: Vec<String>,
    pub name: String,
    /// Whether the network spans several hosts.
    pub ispn: bool,
    pub driver: String,
    pub network_mode: String,
    pub is_internal: bool,
    pub enable_icc: bool,
    pub network_mtu: u32,
    pub interfaces: NetworkInterfaces,
}

impl Default for DockerNetworkConfiguration {
    fn default() -> Self {
        Self {
            interface: "172.18.0.1".to_string(),
            dns: vec!["1.1.1.1".to_string(), "1.0.0.1".to_string()],
            name: "roost_nw".to_string(),
            ispn: false,
            driver: "bridge".to_string(),
            network_mode: "roost_nw".to_string(),
            is_internal: false,
            enable_icc: true,
            network_mtu: 1500,
            interfaces: NetworkInterfaces::default(),
        }
    }
}

/// Limits applied to installer containers regardless of workload limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerLimits {
    /// MB.
    pub memory: i64,
    /// Percent of one core.
    pub cpu: i64,
}

impl Default for InstallerLimits {
    fn default() -> Self {
        Self {
            memory: 1024,
            cpu: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfiguration {
    pub socket: PathBuf,
    /// Size of the `/tmp` tmpfs in managed containers, MB.
    pub tmpfs_size: u32,
    /// Seconds a container gets to stop before it is killed.
    pub stop_timeout: u64,
    /// Force Linux or Windows behaviour instead of detecting it.
    pub host_kind: Option<HostKind>,
    pub network: DockerNetworkConfiguration,
    pub installer_limits: InstallerLimits,
}

impl Default for DockerConfiguration {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/var/run/docker.sock"),
            tmpfs_size: 100,
            stop_timeout: 30,
            host_kind: None,
            network: DockerNetworkConfiguration::default(),
            installer_limits: InstallerLimits::default(),
        }
    }
}

impl DockerConfiguration {
    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_timeout)
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Load configuration from `path` (optional) with `ROOST__*` overrides.
pub fn load(path: &Path) -> Result<Configuration> {
    let built = Config::builder()
        .add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()
        .with_context(|| format!("reading configuration from {}", path.display()))?;

    let config: Configuration = built
        .try_deserialize()
        .context("parsing configuration")?;
    Ok(config)
}

/// Pick the node timezone: the configured value, then `TZ`, then the contents
/// of `/etc/timezone`, then UTC. Anything but letters, `_` and `/` is stripped.
pub fn resolve_timezone(
    configured: &str,
    env_tz: Option<&str>,
    etc_timezone: Option<&str>,
) -> String {
    let raw = [Some(configured), env_tz, etc_timezone]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|tz| !tz.is_empty())
        .unwrap_or("UTC");

    let cleaned = TIMEZONE_SANITIZER.replace_all(raw, "").into_owned();
    if cleaned.is_empty() {
        "UTC".to_string()
    } else {
        cleaned
    }
}

// ============================================================================
// Store
// ============================================================================

/// Shared, lock-protected configuration.
///
/// Reads return a copy taken under the read lock, so a reader never sees a
/// half-applied update. Persisting is serialized by its own lock.
#[derive(Debug)]
pub struct ConfigStore {
    inner: RwLock<Configuration>,
    path: PathBuf,
    write_lock: Mutex<()>,
    debug_via_flag: AtomicBool,
}

impl ConfigStore {
    pub fn new(config: Configuration, path: impl Into<PathBuf>) -> Self {
        Self {
            inner: RwLock::new(config),
            path: path.into(),
            write_lock: Mutex::new(()),
            debug_via_flag: AtomicBool::new(false),
        }
    }

    /// Load from disk and wrap in a store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = load(&path)?;
        Ok(Self::new(config, path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the current configuration.
    pub fn snapshot(&self) -> Configuration {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Mutate the live configuration under the exclusive lock.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut Configuration),
    {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }

    /// Turn on debug mode for this run only.
    pub fn enable_debug_from_flag(&self) {
        self.debug_via_flag.store(true, Ordering::SeqCst);
        self.update(|c| c.debug = true);
    }

    /// Serialize the configuration to its file.
    ///
    /// Overlapping calls queue on the write lock. The file is replaced
    /// atomically so a crash mid-write leaves the previous version intact.
    pub async fn write_to_disk(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut config = self.snapshot();
        if self.debug_via_flag.load(Ordering::SeqCst) {
            config.debug = false;
        }

        let body = toml::to_string_pretty(&config).context("serializing configuration")?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let tmp = self.path.with_extension("toml.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;

        debug!("wrote configuration to {}", self.path.display());
        Ok(())
    }

    /// Create every node directory and resolve the data directory to its real
    /// location when it is a symlink.
    pub async fn configure_directories(&self) -> Result<()> {
        let system = self.snapshot().system;
        for dir in [
            &system.root_directory,
            &system.log_directory,
            &system.data,
            &system.archive_directory,
            &system.backup_directory,
            &system.tmp_directory,
        ] {
            create_private_dir(dir).await?;
        }

        let resolved = tokio::fs::canonicalize(&system.data)
            .await
            .with_context(|| format!("resolving data directory {}", system.data.display()))?;
        if resolved != system.data {
            info!(
                "data directory {} resolves to {}",
                system.data.display(),
                resolved.display()
            );
            self.update(|c| c.system.data = resolved);
        }
        Ok(())
    }

    /// Determine the timezone for containers and store it.
    pub async fn configure_timezone(&self) -> String {
        let configured = self.snapshot().system.timezone;
        let env_tz = std::env::var("TZ").ok();
        let etc = tokio::fs::read_to_string("/etc/timezone").await.ok();
        let timezone = resolve_timezone(&configured, env_tz.as_deref(), etc.as_deref());
        debug!("using timezone {}", timezone);
        self.update(|c| c.system.timezone = timezone.clone());
        timezone
    }
}

async fn create_private_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .await
            .with_context(|| format!("setting permissions on {}", dir.display()))?;
    }
    Ok(())
}
