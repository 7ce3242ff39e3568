//! Host-type specific behaviour.
//!
//! Linux and Windows container hosts differ in how limits are expressed, how
//! the node network is created and how usage is reported. Each concern has a
//! strategy trait; [`Platform`] picks one implementation of each at startup.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{Configuration, SystemConfiguration};
use crate::environment::network::{BridgeNetworkDriver, NetworkDriverStrategy, WindowsNetworkDriver};
use crate::environment::resources::{
    LinuxResourceLimits, ResourceLimitStrategy, WindowsResourceLimits,
};
use crate::environment::stats::{CgroupAccounting, UsageAccountingStrategy, WorkingSetAccounting};

/// Capabilities dropped from every managed container.
const DROPPED_CAPABILITIES: [&str; 10] = [
    "setpcap",
    "mknod",
    "audit_write",
    "net_raw",
    "dac_override",
    "fowner",
    "fsetid",
    "net_bind_service",
    "sys_chroot",
    "setfcap",
];

/// Kind of container host the agent runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKind {
    Linux,
    Windows,
}

impl HostKind {
    /// The host this binary was built for.
    pub fn detect() -> Self {
        if cfg!(windows) {
            HostKind::Windows
        } else {
            HostKind::Linux
        }
    }

    /// User the workload process runs as.
    pub fn container_user(&self, system: &SystemConfiguration) -> String {
        match self {
            HostKind::Linux => format!("{}:{}", system.user.uid, system.user.gid),
            HostKind::Windows => system.username.clone(),
        }
    }

    pub fn security_opts(&self) -> Vec<String> {
        match self {
            HostKind::Linux => vec!["no-new-privileges".to_string()],
            HostKind::Windows => Vec::new(),
        }
    }

    pub fn readonly_rootfs(&self) -> bool {
        matches!(self, HostKind::Linux)
    }

    /// Whether port bindings may carry a host IP. Windows NAT rejects them.
    pub fn supports_binding_ip(&self) -> bool {
        matches!(self, HostKind::Linux)
    }

    pub fn dropped_capabilities(&self) -> Vec<String> {
        DROPPED_CAPABILITIES.iter().map(|c| c.to_string()).collect()
    }
}

impl fmt::Display for HostKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostKind::Linux => write!(f, "linux"),
            HostKind::Windows => write!(f, "windows"),
        }
    }
}

/// The strategies in effect for this host.
#[derive(Clone)]
pub struct Platform {
    kind: HostKind,
    resources: Arc<dyn ResourceLimitStrategy>,
    network: Arc<dyn NetworkDriverStrategy>,
    accounting: Arc<dyn UsageAccountingStrategy>,
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform").field("kind", &self.kind).finish()
    }
}

impl Platform {
    pub fn for_kind(kind: HostKind) -> Self {
        match kind {
            HostKind::Linux => Self {
                kind,
                resources: Arc::new(LinuxResourceLimits),
                network: Arc::new(BridgeNetworkDriver),
                accounting: Arc::new(CgroupAccounting),
            },
            HostKind::Windows => Self {
                kind,
                resources: Arc::new(WindowsResourceLimits),
                network: Arc::new(WindowsNetworkDriver),
                accounting: Arc::new(WorkingSetAccounting),
            },
        }
    }

    /// Use the configured override, falling back to detection.
    pub fn from_config(config: &Configuration) -> Self {
        Self::for_kind(config.docker.host_kind.unwrap_or_else(HostKind::detect))
    }

    pub fn kind(&self) -> HostKind {
        self.kind
    }

    pub fn resources(&self) -> &dyn ResourceLimitStrategy {
        self.resources.as_ref()
    }

    pub fn network(&self) -> &dyn NetworkDriverStrategy {
        self.network.as_ref()
    }

    pub fn accounting(&self) -> &dyn UsageAccountingStrategy {
        self.accounting.as_ref()
    }
}
