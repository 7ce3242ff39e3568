//! Container create request for a workload.

use std::collections::HashMap;

use crate::config::Configuration;
use crate::platform::Platform;
use crate::runtime::types::{ContainerSpec, HostConfig, LogConfig, MountSpec};
use crate::runtime::{LABEL_CONTAINER_TYPE, LABEL_SERVICE};

use super::EnvironmentSettings;
use super::mounts::{Mount, filter_custom_mounts};

pub const CONTAINER_TYPE_PROCESS: &str = "server_process";

/// `/tmp` tmpfs options for a size in MB.
pub(crate) fn tmpfs(size_mb: u32) -> HashMap<String, String> {
    HashMap::from([(
        "/tmp".to_string(),
        format!("rw,exec,nosuid,size={}M", size_mb),
    )])
}

/// Local log driver capped to a single small file.
pub(crate) fn log_config(non_blocking: bool) -> LogConfig {
    let mut config = HashMap::from([
        ("max-size".to_string(), "5m".to_string()),
        ("max-file".to_string(), "1".to_string()),
        ("compress".to_string(), "false".to_string()),
    ]);
    if non_blocking {
        config.insert("mode".to_string(), "non-blocking".to_string());
    }
    LogConfig {
        kind: "local".to_string(),
        config,
    }
}

/// Variables every workload sees, followed by its own.
pub(crate) fn environment_variables(
    settings: &EnvironmentSettings,
    config: &Configuration,
) -> Vec<String> {
    let mut env = vec![
        format!("TZ={}", config.system.timezone),
        format!("SERVER_MEMORY={}", settings.limits.memory_limit),
    ];
    if let Some(default) = &settings.allocations.default_mapping {
        env.push(format!("SERVER_IP={}", default.ip));
        env.push(format!("SERVER_PORT={}", default.port));
    }

    let mut own: Vec<_> = settings.env.iter().collect();
    own.sort();
    env.extend(own.into_iter().map(|(k, v)| format!("{}={}", k, v)));
    env
}

/// Build the create request for workload `id`.
pub fn build_spec(
    id: &str,
    settings: &EnvironmentSettings,
    config: &Configuration,
    platform: &Platform,
) -> ContainerSpec {
    let kind = platform.kind();
    let network = &config.docker.network;
    let ports = settings
        .allocations
        .port_map(network, kind.supports_binding_ip());

    let mut mounts: Vec<MountSpec> = vec![Mount::data(&config.system.workload_data(id)).to_spec()];
    mounts.extend(
        filter_custom_mounts(id, &settings.mounts, &config.allowed_mounts)
            .iter()
            .map(Mount::to_spec),
    );

    let mut labels = settings.labels.clone();
    labels.insert(LABEL_SERVICE.to_string(), config.app_name.clone());
    labels.insert(
        LABEL_CONTAINER_TYPE.to_string(),
        CONTAINER_TYPE_PROCESS.to_string(),
    );

    ContainerSpec {
        hostname: id.to_string(),
        domainname: String::new(),
        user: kind.container_user(&config.system),
        image: settings.image.clone(),
        env: environment_variables(settings, config),
        cmd: Vec::new(),
        labels,
        exposed_ports: ports.exposed,
        attach_stdin: true,
        attach_stdout: true,
        attach_stderr: true,
        open_stdin: true,
        tty: true,
        host_config: HostConfig {
            resources: platform.resources().convert(&settings.limits),
            port_bindings: ports.bindings,
            mounts,
            tmpfs: tmpfs(config.docker.tmpfs_size),
            dns: network.dns.clone(),
            log_config: Some(log_config(true)),
            security_opt: kind.security_opts(),
            readonly_rootfs: kind.readonly_rootfs(),
            cap_drop: kind.dropped_capabilities(),
            network_mode: network.network_mode.clone(),
            privileged: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::mounts::{Allocations, DefaultMapping};
    use crate::environment::resources::ResourceLimits;
    use crate::platform::HostKind;
    use std::collections::BTreeMap;

    fn settings() -> EnvironmentSettings {
        EnvironmentSettings {
            image: "ghcr.io/roost/java:17".into(),
            env: HashMap::from([("STARTUP".to_string(), "java -jar server.jar".to_string())]),
            limits: ResourceLimits {
                memory_limit: 512,
                swap: -1,
                cpu_limit: 150,
                ..Default::default()
            },
            mounts: vec![Mount {
                target: "/etc-host".into(),
                source: "/etc".into(),
                ..Default::default()
            }],
            allocations: Allocations {
                default_mapping: Some(DefaultMapping {
                    ip: "10.0.0.5".into(),
                    port: 25565,
                }),
                mappings: BTreeMap::from([("10.0.0.5".to_string(), vec![25565])]),
            },
            labels: HashMap::new(),
        }
    }

    #[test]
    fn test_linux_spec() {
        let mut config = Configuration::default();
        config.system.timezone = "UTC".into();
        let spec = build_spec(
            "w1",
            &settings(),
            &config,
            &Platform::for_kind(HostKind::Linux),
        );

        assert_eq!(spec.hostname, "w1");
        assert_eq!(spec.labels[LABEL_SERVICE], "Roost");
        assert_eq!(spec.labels[LABEL_CONTAINER_TYPE], CONTAINER_TYPE_PROCESS);
        assert!(spec.env.contains(&"TZ=UTC".to_string()));
        assert!(spec.env.contains(&"SERVER_PORT=25565".to_string()));
        assert!(spec.env.contains(&"STARTUP=java -jar server.jar".to_string()));

        // custom /etc mount is not allowed
        assert_eq!(spec.host_config.mounts.len(), 1);
        assert_eq!(spec.host_config.mounts[0].target, "/Container");
        assert_eq!(
            spec.host_config.mounts[0].source,
            "/var/lib/roost/volumes/w1"
        );

        assert!(spec.host_config.readonly_rootfs);
        assert_eq!(spec.host_config.security_opt, vec!["no-new-privileges"]);
        assert_eq!(spec.host_config.resources.cpu_quota, Some(150_000));
        assert_eq!(spec.host_config.tmpfs["/tmp"], "rw,exec,nosuid,size=100M");
        assert_eq!(spec.host_config.network_mode, "roost_nw");
        assert_eq!(
            spec.host_config.port_bindings["25565/tcp"][0].host_ip.as_deref(),
            Some("10.0.0.5")
        );
    }

    #[test]
    fn test_windows_spec() {
        let config = Configuration::default();
        let spec = build_spec(
            "w1",
            &settings(),
            &config,
            &Platform::for_kind(HostKind::Windows),
        );

        assert_eq!(spec.user, "roost");
        assert!(!spec.host_config.readonly_rootfs);
        assert!(spec.host_config.security_opt.is_empty());
        assert_eq!(spec.host_config.resources.memory_swap, None);
        assert!(spec.host_config.port_bindings["25565/udp"][0].host_ip.is_none());
    }
}
