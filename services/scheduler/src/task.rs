//! Mapping between processes and orchestrator task definitions.
//!
//! Both schedulers build containers the same way, so a process submitted
//! through either one runs identically.

use crate::backend::orchestrator::{ContainerDefinition, PortMapping, TaskDefinition, Ulimit};
use crate::types::{PortMap, Process, CONTAINER_PORT};

/// Environment variable carrying the port the container should bind.
pub const PORT_ENV: &str = "PORT";

const NPROC_ULIMIT: &str = "nproc";

/// Service (and task definition family) name for a process.
pub fn service_name(app_id: &str, process_type: &str) -> String {
    format!("{app_id}--{process_type}")
}

/// Task definition family for one-off runs of a process.
pub fn run_family(app_id: &str, process_type: &str) -> String {
    format!("{app_id}--run--{process_type}")
}

/// Recover the process type from a service name of this app.
///
/// Returns `None` for services that belong to another app.
pub fn process_type_from_service<'a>(app_id: &str, service: &'a str) -> Option<&'a str> {
    let process_type = service.strip_prefix(app_id)?.strip_prefix("--")?;
    if process_type.is_empty() || process_type.contains("--") {
        return None;
    }
    Some(process_type)
}

/// Build the container for a process.
///
/// With an `instance_port` the container publishes [`CONTAINER_PORT`] on that
/// host port and receives `PORT`; without one the legacy port maps are used.
pub fn container_definition(process: &Process, instance_port: Option<u16>) -> ContainerDefinition {
    let mut environment = process.env.clone();
    let port_mappings = match instance_port {
        Some(host_port) => {
            environment.insert(PORT_ENV.to_string(), CONTAINER_PORT.to_string());
            vec![PortMapping {
                host_port: Some(host_port),
                container_port: CONTAINER_PORT,
            }]
        }
        None => process.ports.iter().filter_map(port_mapping).collect(),
    };

    let ulimits = if process.nproc > 0 {
        vec![Ulimit {
            name: NPROC_ULIMIT.to_string(),
            soft: process.nproc,
            hard: process.nproc,
        }]
    } else {
        Vec::new()
    };

    ContainerDefinition {
        name: process.process_type.clone(),
        image: process.image.clone(),
        command: process.command.clone(),
        environment,
        cpu: process.cpu_shares,
        memory_mib: process.memory_mib(),
        port_mappings,
        docker_labels: process.labels.clone(),
        ulimits,
        essential: true,
    }
}

fn port_mapping(port: &PortMap) -> Option<PortMapping> {
    let container_port = port.container.or(port.host)?;
    Some(PortMapping {
        host_port: port.host,
        container_port,
    })
}

/// Rebuild the process shape a task definition was registered from.
pub fn process_from_task_definition(definition: &TaskDefinition) -> Option<Process> {
    let container = definition.containers.first()?;

    let nproc = container
        .ulimits
        .iter()
        .find(|u| u.name == NPROC_ULIMIT)
        .map(|u| u.soft)
        .unwrap_or(0);

    let ports = container
        .port_mappings
        .iter()
        .map(|m| PortMap {
            host: m.host_port,
            container: Some(m.container_port),
        })
        .collect();

    Some(Process {
        process_type: container.name.clone(),
        image: container.image.clone(),
        command: container.command.clone(),
        env: container.environment.clone(),
        labels: container.docker_labels.clone(),
        instances: 1,
        cpu_shares: container.cpu,
        memory_limit: container.memory_mib * 1024 * 1024,
        nproc,
        ports,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn web() -> Process {
        Process {
            process_type: "web".to_string(),
            image: "remind101/acme-inc:latest".to_string(),
            command: vec!["acme-inc".to_string(), "server".to_string()],
            env: BTreeMap::from([("USER".to_string(), "foo".to_string())]),
            labels: BTreeMap::from([("release".to_string(), "v1".to_string())]),
            instances: 1,
            cpu_shares: 256,
            memory_limit: 128 * 1024 * 1024,
            nproc: 512,
            ports: vec![PortMap {
                host: Some(8080),
                container: None,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_service_name_roundtrip() {
        let name = service_name("1234", "web");
        assert_eq!(name, "1234--web");
        assert_eq!(process_type_from_service("1234", &name), Some("web"));
    }

    #[test]
    fn test_process_type_from_foreign_service() {
        assert_eq!(process_type_from_service("1234", "5678--web"), None);
        assert_eq!(process_type_from_service("12", "1234--web"), None);
        assert_eq!(process_type_from_service("1234", "1234--run--web"), None);
        assert_eq!(process_type_from_service("1234", "1234--"), None);
    }

    #[test]
    fn test_container_with_load_balancer() {
        let container = container_definition(&web(), Some(9000));

        assert_eq!(container.name, "web");
        assert_eq!(container.environment.get("PORT"), Some(&"8080".to_string()));
        assert_eq!(container.environment.get("USER"), Some(&"foo".to_string()));
        assert_eq!(
            container.port_mappings,
            vec![PortMapping {
                host_port: Some(9000),
                container_port: 8080
            }]
        );
        assert_eq!(container.memory_mib, 128);
        assert_eq!(container.ulimits.len(), 1);
        assert_eq!(container.ulimits[0].soft, 512);
        assert_eq!(container.ulimits[0].hard, 512);
        assert!(container.essential);
    }

    #[test]
    fn test_container_without_load_balancer_uses_legacy_ports() {
        let mut process = web();
        process.nproc = 0;
        let container = container_definition(&process, None);

        assert!(!container.environment.contains_key("PORT"));
        assert_eq!(
            container.port_mappings,
            vec![PortMapping {
                host_port: Some(8080),
                container_port: 8080
            }]
        );
        assert!(container.ulimits.is_empty());
    }

    #[test]
    fn test_process_from_task_definition() {
        let container = container_definition(&web(), None);
        let definition = TaskDefinition {
            arn: "arn:td/1234--web:3".to_string(),
            family: "1234--web".to_string(),
            revision: 3,
            containers: vec![container],
        };

        let process = process_from_task_definition(&definition).unwrap();
        assert_eq!(process.process_type, "web");
        assert_eq!(process.command, web().command);
        assert_eq!(process.memory_limit, 128 * 1024 * 1024);
        assert_eq!(process.nproc, 512);
        assert_eq!(process.labels, web().labels);
        assert!(process.exposure.is_none());
    }
}
