//! Node network bootstrap.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigStore, DockerNetworkConfiguration};
use crate::platform::Platform;
use crate::runtime::types::{Ipam, IpamPool};
use crate::runtime::{NetworkSpec, RuntimeApi, RuntimeError};

/// Host-side name of the bridge, distinct from the logical network name.
pub const BRIDGE_NAME: &str = "roost0";

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("failed to inspect network {name}: {source}")]
    Inspect {
        name: String,
        #[source]
        source: RuntimeError,
    },

    #[error(transparent)]
    Create(RuntimeError),

    #[error("network bootstrap cancelled")]
    Cancelled,
}

/// Builds the create request for the node network.
pub trait NetworkDriverStrategy: Send + Sync {
    fn network_spec(&self, network: &DockerNetworkConfiguration) -> NetworkSpec;
}

fn pools(network: &DockerNetworkConfiguration) -> Vec<IpamPool> {
    let mut pools = vec![IpamPool {
        subnet: network.interfaces.v4.subnet.clone(),
        gateway: network.interfaces.v4.gateway.clone(),
    }];
    if let Some(v6) = &network.interfaces.v6 {
        pools.push(IpamPool {
            subnet: v6.subnet.clone(),
            gateway: v6.gateway.clone(),
        });
    }
    pools
}

/// Linux bridge networks with dual-stack IPAM.
#[derive(Debug, Clone, Copy, Default)]
pub struct BridgeNetworkDriver;

impl NetworkDriverStrategy for BridgeNetworkDriver {
    fn network_spec(&self, network: &DockerNetworkConfiguration) -> NetworkSpec {
        let options = HashMap::from([
            ("encryption".to_string(), "false".to_string()),
            (
                "com.docker.network.bridge.default_bridge".to_string(),
                "false".to_string(),
            ),
            (
                "com.docker.network.bridge.enable_icc".to_string(),
                network.enable_icc.to_string(),
            ),
            (
                "com.docker.network.bridge.enable_ip_masquerade".to_string(),
                "true".to_string(),
            ),
            (
                "com.docker.network.bridge.host_binding_ipv4".to_string(),
                "0.0.0.0".to_string(),
            ),
            (
                "com.docker.network.bridge.name".to_string(),
                BRIDGE_NAME.to_string(),
            ),
            (
                "com.docker.network.driver.mtu".to_string(),
                network.network_mtu.to_string(),
            ),
        ]);

        NetworkSpec {
            name: network.name.clone(),
            driver: network.driver.clone(),
            check_duplicate: true,
            enable_ipv6: Some(network.interfaces.v6.is_some()),
            internal: network.is_internal,
            ipam: Ipam {
                driver: None,
                config: pools(network),
            },
            options,
        }
    }
}

/// Windows NAT networks. IPv6 cannot be toggled and IPAM needs its own driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsNetworkDriver;

impl NetworkDriverStrategy for WindowsNetworkDriver {
    fn network_spec(&self, network: &DockerNetworkConfiguration) -> NetworkSpec {
        NetworkSpec {
            name: network.name.clone(),
            driver: network.driver.clone(),
            check_duplicate: true,
            enable_ipv6: None,
            internal: network.is_internal,
            ipam: Ipam {
                driver: Some("windows".to_string()),
                config: pools(network),
            },
            options: HashMap::from([(
                "com.docker.network.windowsshim.networkname".to_string(),
                BRIDGE_NAME.to_string(),
            )]),
        }
    }
}

/// Interface address and multi-host flag implied by a driver.
///
/// `None` for the interface means "keep whatever is configured".
fn driver_semantics(driver: &str) -> (Option<&'static str>, bool) {
    match driver {
        "host" => (Some("127.0.0.1"), false),
        "overlay" | "weavemesh" => (Some(""), true),
        _ => (None, false),
    }
}

fn is_bridge_like(driver: &str) -> bool {
    !matches!(driver, "host" | "overlay" | "weavemesh")
}

/// Makes sure the node network exists and the configuration matches it.
pub struct NetworkBootstrap {
    runtime: Arc<dyn RuntimeApi>,
    config: Arc<ConfigStore>,
    platform: Platform,
    lock: Mutex<()>,
}

impl NetworkBootstrap {
    pub fn new(runtime: Arc<dyn RuntimeApi>, config: Arc<ConfigStore>, platform: Platform) -> Self {
        Self {
            runtime,
            config,
            platform,
            lock: Mutex::new(()),
        }
    }

    /// Inspect the configured network and create it if missing.
    ///
    /// Safe to call repeatedly; an existing network is never re-created.
    pub async fn ensure_network(&self, ctx: &CancellationToken) -> NetworkResult<()> {
        let _guard = self.lock.lock().await;
        let network = self.config.snapshot().docker.network;

        let inspected = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(NetworkError::Cancelled),
            result = self.runtime.inspect_network(&network.name) => result,
        };

        match inspected {
            Ok(found) => {
                debug!(
                    "network {} already exists (driver {})",
                    network.name, found.driver
                );
                self.adopt_driver(&found.driver);
                Ok(())
            }
            Err(err) if err.is_not_found() => self.create(ctx, &network).await,
            Err(source) => Err(NetworkError::Inspect {
                name: network.name,
                source,
            }),
        }
    }

    async fn create(
        &self,
        ctx: &CancellationToken,
        network: &DockerNetworkConfiguration,
    ) -> NetworkResult<()> {
        info!(
            "creating missing {} network ({}), this could take a few seconds...",
            network.name, BRIDGE_NAME
        );
        let spec = self.platform.network().network_spec(network);

        tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(NetworkError::Cancelled),
            result = self.runtime.create_network(&spec) => {
                result.map_err(NetworkError::Create)?;
            }
        }

        if is_bridge_like(&network.driver) {
            self.config.update(|c| {
                c.docker.network.interface = c.docker.network.interfaces.v4.gateway.clone();
            });
        }
        self.adopt_driver(&network.driver);
        Ok(())
    }

    fn adopt_driver(&self, driver: &str) {
        let (interface, ispn) = driver_semantics(driver);
        self.config.update(|c| {
            c.docker.network.driver = driver.to_string();
            c.docker.network.ispn = ispn;
            if let Some(interface) = interface {
                c.docker.network.interface = interface.to_string();
            }
        });
    }
}
