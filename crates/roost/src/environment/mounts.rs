//! Mounts and port allocations of a workload.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::config::DockerNetworkConfiguration;
use crate::runtime::types::{EmptyObject, MountSpec, PortBinding};

/// Target of the primary data mount inside the container.
pub const DATA_MOUNT_TARGET: &str = "/Container";

const LOOPBACK: &str = "127.0.0.1";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mount {
    /// Path inside the container.
    pub target: String,
    /// Path on the host.
    pub source: String,
    pub read_only: bool,
    /// The workload's data directory. Always present.
    pub default: bool,
}

impl Mount {
    pub fn data(source: &Path) -> Self {
        Self {
            target: DATA_MOUNT_TARGET.to_string(),
            source: source.display().to_string(),
            read_only: false,
            default: true,
        }
    }

    pub fn to_spec(&self) -> MountSpec {
        MountSpec {
            target: self.target.clone(),
            source: self.source.clone(),
            kind: "bind".to_string(),
            read_only: self.read_only,
        }
    }
}

/// Whether `source` lies under one of the `allowed` prefixes.
fn is_allowed(source: &str, allowed: &[String]) -> bool {
    let source = Path::new(source);
    if !source.is_absolute() || source.components().any(|c| c == Component::ParentDir) {
        return false;
    }
    allowed
        .iter()
        .map(|prefix| Path::new(prefix.trim()))
        .any(|prefix| prefix.is_absolute() && source.starts_with(prefix))
}

/// Keep custom mounts whose source is whitelisted, dropping the rest.
pub fn filter_custom_mounts(workload: &str, mounts: &[Mount], allowed: &[String]) -> Vec<Mount> {
    mounts
        .iter()
        .filter(|m| !m.default)
        .filter(|m| {
            let ok = is_allowed(&m.source, allowed);
            if !ok {
                warn!(
                    "workload {} mount {} -> {} is not in allowed_mounts, skipping",
                    workload, m.source, m.target
                );
            }
            ok
        })
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultMapping {
    pub ip: String,
    pub port: u16,
}

/// Ports assigned to a workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Allocations {
    #[serde(rename = "default")]
    pub default_mapping: Option<DefaultMapping>,
    /// Host IP to ports bound on it.
    pub mappings: BTreeMap<String, Vec<u16>>,
}

/// Port bindings plus the matching exposed-port set.
#[derive(Debug, Clone, Default)]
pub struct PortMap {
    pub bindings: HashMap<String, Vec<PortBinding>>,
    pub exposed: HashMap<String, EmptyObject>,
}

impl Allocations {
    /// Engine port bindings, each port on both tcp and udp.
    ///
    /// Loopback bindings are moved onto the node interface, or dropped when the
    /// network spans hosts. Without `binding_ip` the host IP is left out.
    pub fn port_map(&self, network: &DockerNetworkConfiguration, binding_ip: bool) -> PortMap {
        let mut map = PortMap::default();

        for (ip, ports) in &self.mappings {
            let host_ip = if ip == LOOPBACK {
                if network.ispn {
                    continue;
                }
                network.interface.clone()
            } else {
                ip.clone()
            };

            for port in ports.iter().filter(|p| **p > 0) {
                let binding = PortBinding {
                    host_ip: binding_ip.then(|| host_ip.clone()),
                    host_port: port.to_string(),
                };
                for proto in ["tcp", "udp"] {
                    let key = format!("{}/{}", port, proto);
                    map.exposed.insert(key.clone(), EmptyObject {});
                    map.bindings.entry(key).or_default().push(binding.clone());
                }
            }
        }
        map
    }
}
