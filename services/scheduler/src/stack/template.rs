//! Stack document compiler.
//!
//! [`Template::compile`] is a pure function of the app and its instance
//! ports. The output goes through canonical JSON rendering so two compiles
//! of the same input are byte-identical, which is what lets the backend
//! recognise an unchanged stack.

use std::collections::BTreeMap;

use dockyard_reconcile::canonical_json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::backend::elb::{LoadBalancerAttributes, Scheme, HTTPS_PORT, HTTP_PORT};
use crate::backend::orchestrator::{ContainerDefinition, PortMapping, Ulimit};
use crate::backend::stack::{
    Parameter, RESOURCE_ECS_SERVICE, RESOURCE_ECS_TASK_DEFINITION, RESOURCE_LOAD_BALANCER,
    RESOURCE_RECORD_SET,
};
use crate::config::{HostedZone, NetworkConfig};
use crate::error::{SchedulerError, SchedulerResult};
use crate::lb::creation_tags;
use crate::lb::dns::RECORD_TTL;
use crate::task;
use crate::types::{App, Process, CONTAINER_PORT, WEB_PROCESS_TYPE};

/// Service metadata key carrying the process type.
pub const PROCESS_TYPE_METADATA: &str = "ProcessType";

/// Parameter toggling the app CNAME.
pub const DNS_PARAMETER: &str = "DNS";

const DNS_CONDITION: &str = "DNSCondition";
const FORMAT_VERSION: &str = "2010-09-09";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateConfig {
    pub cluster: String,
    /// Role services assume to register with their balancer.
    pub service_role: String,
    pub zone: HostedZone,
    pub network: NetworkConfig,
}

/// Compiles apps into stack documents.
#[derive(Debug, Clone)]
pub struct Template {
    config: TemplateConfig,
}

impl Template {
    pub fn new(config: TemplateConfig) -> SchedulerResult<Self> {
        crate::config::require("cluster", &config.cluster)?;
        crate::config::require("service role", &config.service_role)?;
        config.zone.validate()?;
        config.network.validate()?;
        Ok(Self { config })
    }

    /// Render the stack document for `app`.
    ///
    /// `ports` maps each exposed process type to its instance port.
    pub fn compile(&self, app: &App, ports: &BTreeMap<String, u16>) -> SchedulerResult<String> {
        let mut parameters = Map::new();
        let mut resources = Map::new();
        let mut outputs = Map::new();

        parameters.insert(
            DNS_PARAMETER.to_string(),
            json!({
                "Type": "String",
                "Description": "When true, an app CNAME points at the web load balancer",
                "Default": "true",
                "AllowedValues": ["true", "false"],
            }),
        );

        for process in &app.processes {
            let logical = logical_id(&process.process_type);
            if logical.is_empty() {
                return Err(SchedulerError::Config(format!(
                    "process type {:?} has no alphanumeric characters",
                    process.process_type
                )));
            }
            if resources.contains_key(&format!("{logical}Service")) {
                return Err(SchedulerError::Config(format!(
                    "process type {} collides with another process as {logical}",
                    process.process_type
                )));
            }

            let port = match &process.exposure {
                Some(_) => Some(*ports.get(&process.process_type).ok_or_else(|| {
                    SchedulerError::Config(format!(
                        "no instance port for exposed process {}",
                        process.process_type
                    ))
                })?),
                None => None,
            };

            parameters.insert(
                scale_parameter(&logical),
                json!({
                    "Type": "Number",
                    "Description": format!("Desired instances of the {} process", process.process_type),
                }),
            );

            let container = serde_json::to_value(CfnContainerDefinition::from(
                &task::container_definition(process, port),
            ))?;
            resources.insert(
                format!("{logical}TaskDefinition"),
                json!({
                    "Type": RESOURCE_ECS_TASK_DEFINITION,
                    "Properties": {
                        "Family": task::service_name(&app.id, &process.process_type),
                        "ContainerDefinitions": [container],
                    },
                }),
            );

            let mut service = json!({
                "Cluster": self.config.cluster,
                "DesiredCount": {"Ref": scale_parameter(&logical)},
                "TaskDefinition": {"Ref": format!("{logical}TaskDefinition")},
            });

            if let (Some(exposure), Some(port)) = (&process.exposure, port) {
                let balancer = balancer_resource(&logical);
                resources.insert(
                    balancer.clone(),
                    self.load_balancer(app, process, exposure.external, port),
                );
                service["LoadBalancers"] = json!([{
                    "ContainerName": process.process_type,
                    "ContainerPort": CONTAINER_PORT,
                    "LoadBalancerName": {"Ref": balancer},
                }]);
                service["Role"] = json!(self.config.service_role);

                outputs.insert(
                    instance_port_output(&logical),
                    json!({"Value": port.to_string()}),
                );

                if process.process_type == WEB_PROCESS_TYPE && !app.name.is_empty() {
                    resources.insert(
                        format!("{logical}CNAME"),
                        json!({
                            "Type": RESOURCE_RECORD_SET,
                            "Condition": DNS_CONDITION,
                            "Properties": {
                                "HostedZoneId": self.config.zone.id,
                                "Name": self.config.zone.record_name(&app.name),
                                "Type": "CNAME",
                                "TTL": RECORD_TTL.to_string(),
                                "ResourceRecords": [{"Fn::GetAtt": [balancer, "DNSName"]}],
                            },
                        }),
                    );
                }
            }

            resources.insert(
                format!("{logical}Service"),
                json!({
                    "Type": RESOURCE_ECS_SERVICE,
                    "Metadata": {PROCESS_TYPE_METADATA: process.process_type},
                    "Properties": service,
                }),
            );
        }

        let document = json!({
            "AWSTemplateFormatVersion": FORMAT_VERSION,
            "Conditions": {
                DNS_CONDITION: {"Fn::Equals": [{"Ref": DNS_PARAMETER}, "true"]},
            },
            "Parameters": parameters,
            "Resources": resources,
            "Outputs": outputs,
        });

        Ok(canonical_json(&document))
    }

    fn load_balancer(&self, app: &App, process: &Process, external: bool, port: u16) -> Value {
        let attributes = LoadBalancerAttributes::default();

        let mut listeners = vec![json!({
            "LoadBalancerPort": HTTP_PORT,
            "InstancePort": port,
            "Protocol": "HTTP",
            "InstanceProtocol": "HTTP",
        })];
        if let Some(cert) = process.requested_cert() {
            listeners.push(json!({
                "LoadBalancerPort": HTTPS_PORT,
                "InstancePort": port,
                "Protocol": "HTTPS",
                "InstanceProtocol": "HTTP",
                "SSLCertificateId": cert,
            }));
        }

        let tags: Vec<Value> = creation_tags(app, process)
            .into_iter()
            .map(|(key, value)| json!({"Key": key, "Value": value}))
            .collect();

        json!({
            "Type": RESOURCE_LOAD_BALANCER,
            "Properties": {
                "Scheme": Scheme::from_external(external).as_str(),
                "SecurityGroups": [self.config.network.security_group(external)],
                "Subnets": self.config.network.subnets(external),
                "Listeners": listeners,
                "ConnectionDrainingPolicy": {
                    "Enabled": attributes.connection_draining,
                    "Timeout": attributes.connection_draining_timeout_secs,
                },
                "CrossZone": attributes.cross_zone,
                "Tags": tags,
            },
        })
    }
}

/// Resource name prefix for a process type: `web` becomes `Web`,
/// `worker-high` becomes `WorkerHigh`.
pub fn logical_id(process_type: &str) -> String {
    process_type
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

pub fn balancer_resource(logical_id: &str) -> String {
    format!("{logical_id}LoadBalancer")
}

/// Balancers declared in a stack document, keyed by resource name, with
/// whether each one is internet-facing.
pub fn balancer_schemes(body: &str) -> SchedulerResult<BTreeMap<String, bool>> {
    let document: Value = serde_json::from_str(body)?;
    let Some(resources) = document.get("Resources").and_then(Value::as_object) else {
        return Ok(BTreeMap::new());
    };
    Ok(resources
        .iter()
        .filter(|(_, r)| r.get("Type").and_then(Value::as_str) == Some(RESOURCE_LOAD_BALANCER))
        .map(|(name, r)| {
            let scheme = r.pointer("/Properties/Scheme").and_then(Value::as_str);
            (name.clone(), scheme == Some(Scheme::InternetFacing.as_str()))
        })
        .collect())
}

pub fn scale_parameter(logical_id: &str) -> String {
    format!("{logical_id}Scale")
}

pub fn instance_port_output(logical_id: &str) -> String {
    format!("{logical_id}InstancePort")
}

/// Instance ports recorded in stack outputs, keyed by logical id.
pub fn instance_ports(outputs: &BTreeMap<String, String>) -> BTreeMap<String, u16> {
    outputs
        .iter()
        .filter_map(|(key, value)| {
            let logical = key.strip_suffix("InstancePort")?;
            Some((logical.to_string(), value.parse().ok()?))
        })
        .collect()
}

/// One scale parameter per process, carrying its desired instances.
pub fn scale_parameters(app: &App) -> Vec<Parameter> {
    app.processes
        .iter()
        .map(|p| {
            Parameter::new(
                scale_parameter(&logical_id(&p.process_type)),
                p.instances.to_string(),
            )
        })
        .collect()
}

/// Container definition in stack document form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CfnContainerDefinition {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    pub cpu: u32,
    pub memory: u64,
    pub essential: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<CfnKeyValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub docker_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port_mappings: Vec<CfnPortMapping>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ulimits: Vec<CfnUlimit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CfnKeyValue {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CfnPortMapping {
    pub container_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CfnUlimit {
    pub name: String,
    pub soft_limit: u32,
    pub hard_limit: u32,
}

impl From<&ContainerDefinition> for CfnContainerDefinition {
    fn from(c: &ContainerDefinition) -> Self {
        Self {
            name: c.name.clone(),
            image: c.image.clone(),
            command: c.command.clone(),
            cpu: c.cpu,
            memory: c.memory_mib,
            essential: c.essential,
            environment: c
                .environment
                .iter()
                .map(|(name, value)| CfnKeyValue {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
            docker_labels: c.docker_labels.clone(),
            port_mappings: c
                .port_mappings
                .iter()
                .map(|m| CfnPortMapping {
                    container_port: m.container_port,
                    host_port: m.host_port,
                })
                .collect(),
            ulimits: c
                .ulimits
                .iter()
                .map(|u| CfnUlimit {
                    name: u.name.clone(),
                    soft_limit: u.soft,
                    hard_limit: u.hard,
                })
                .collect(),
        }
    }
}

impl From<CfnContainerDefinition> for ContainerDefinition {
    fn from(c: CfnContainerDefinition) -> Self {
        Self {
            name: c.name,
            image: c.image,
            command: c.command,
            environment: c
                .environment
                .into_iter()
                .map(|kv| (kv.name, kv.value))
                .collect(),
            cpu: c.cpu,
            memory_mib: c.memory,
            port_mappings: c
                .port_mappings
                .into_iter()
                .map(|m| PortMapping {
                    host_port: m.host_port,
                    container_port: m.container_port,
                })
                .collect(),
            docker_labels: c.docker_labels,
            ulimits: c
                .ulimits
                .into_iter()
                .map(|u| Ulimit {
                    name: u.name,
                    soft: u.soft_limit,
                    hard: u.hard_limit,
                })
                .collect(),
            essential: c.essential,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::types::Exposure;

    fn template() -> Template {
        Template::new(TemplateConfig {
            cluster: "cluster".to_string(),
            service_role: "ecsServiceRole".to_string(),
            zone: HostedZone {
                id: "Z123".to_string(),
                name: "dockyard.local".to_string(),
            },
            network: NetworkConfig {
                internal_security_group: "sg-internal".to_string(),
                external_security_group: "sg-external".to_string(),
                internal_subnets: vec!["subnet-a".to_string()],
                external_subnets: vec!["subnet-b".to_string()],
            },
        })
        .unwrap()
    }

    fn app() -> App {
        App {
            id: "1234".to_string(),
            name: "acme-inc".to_string(),
            processes: vec![
                Process {
                    process_type: "web".to_string(),
                    image: "remind101/acme-inc:latest".to_string(),
                    command: vec!["acme-inc".to_string(), "server".to_string()],
                    instances: 2,
                    cpu_shares: 256,
                    memory_limit: 128 * 1024 * 1024,
                    nproc: 256,
                    exposure: Some(Exposure::https(true, "arn:cert")),
                    ..Default::default()
                },
                Process {
                    process_type: "worker".to_string(),
                    image: "remind101/acme-inc:latest".to_string(),
                    command: vec!["acme-inc".to_string(), "worker".to_string()],
                    instances: 1,
                    ..Default::default()
                },
            ],
        }
    }

    fn ports() -> BTreeMap<String, u16> {
        BTreeMap::from([("web".to_string(), 9000)])
    }

    fn compiled() -> Value {
        serde_json::from_str(&template().compile(&app(), &ports()).unwrap()).unwrap()
    }

    #[rstest]
    #[case("web", "Web")]
    #[case("worker-high", "WorkerHigh")]
    #[case("a_b.c", "ABC")]
    #[case("v2", "V2")]
    fn test_logical_id(#[case] process_type: &str, #[case] expected: &str) {
        assert_eq!(logical_id(process_type), expected);
    }

    #[test]
    fn test_compile_is_deterministic() {
        let first = template().compile(&app(), &ports()).unwrap();
        let second = template().compile(&app(), &ports()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_exposed_web() {
        let doc = compiled();
        let resources = &doc["Resources"];

        let lb = &resources["WebLoadBalancer"]["Properties"];
        assert_eq!(lb["Scheme"], "internet-facing");
        assert_eq!(lb["SecurityGroups"], json!(["sg-external"]));
        assert_eq!(lb["Subnets"], json!(["subnet-b"]));
        let listeners = lb["Listeners"].as_array().unwrap();
        assert_eq!(listeners.len(), 2);
        assert_eq!(listeners[1]["LoadBalancerPort"], 443);
        assert_eq!(listeners[1]["SSLCertificateId"], "arn:cert");
        assert_eq!(listeners[0]["InstancePort"], 9000);

        let service = &resources["WebService"];
        assert_eq!(service["Metadata"]["ProcessType"], "web");
        assert_eq!(service["Properties"]["Role"], "ecsServiceRole");
        assert_eq!(service["Properties"]["DesiredCount"], json!({"Ref": "WebScale"}));

        let cname = &resources["WebCNAME"];
        assert_eq!(cname["Condition"], "DNSCondition");
        assert_eq!(cname["Properties"]["Name"], "acme-inc.dockyard.local");

        assert_eq!(doc["Outputs"]["WebInstancePort"]["Value"], "9000");
    }

    #[test]
    fn test_task_definition_container() {
        let doc = compiled();
        let definition = &doc["Resources"]["WebTaskDefinition"]["Properties"];
        assert_eq!(definition["Family"], "1234--web");

        let container: CfnContainerDefinition =
            serde_json::from_value(definition["ContainerDefinitions"][0].clone()).unwrap();
        assert_eq!(container.memory, 128);
        assert_eq!(
            container.port_mappings,
            vec![CfnPortMapping {
                container_port: 8080,
                host_port: Some(9000)
            }]
        );
        assert!(container
            .environment
            .contains(&CfnKeyValue {
                name: "PORT".to_string(),
                value: "8080".to_string()
            }));
        assert_eq!(container.ulimits[0].soft_limit, 256);
    }

    #[test]
    fn test_balancer_schemes() {
        let body = template().compile(&app(), &ports()).unwrap();
        let schemes = balancer_schemes(&body).unwrap();
        assert_eq!(schemes, BTreeMap::from([("WebLoadBalancer".to_string(), true)]));

        assert!(balancer_schemes(r#"{"Resources":{}}"#).unwrap().is_empty());
        assert!(balancer_schemes("not json").is_err());
    }

    #[test]
    fn test_unexposed_worker() {
        let doc = compiled();
        let resources = &doc["Resources"];

        assert!(resources.get("WorkerLoadBalancer").is_none());
        assert!(resources.get("WorkerCNAME").is_none());
        let service = &resources["WorkerService"]["Properties"];
        assert!(service.get("Role").is_none());
        assert!(service.get("LoadBalancers").is_none());
        assert!(doc["Parameters"].get("WorkerScale").is_some());
    }

    #[test]
    fn test_missing_port_is_config_error() {
        let result = template().compile(&app(), &BTreeMap::new());
        assert!(matches!(result, Err(SchedulerError::Config(_))));
    }

    #[test]
    fn test_colliding_process_types() {
        let mut app = app();
        app.processes[1].process_type = "web-".to_string();
        app.processes[0].exposure = None;
        let result = template().compile(&app, &BTreeMap::new());
        assert!(matches!(result, Err(SchedulerError::Config(_))));
    }

    #[test]
    fn test_instance_ports_and_scale_parameters() {
        let outputs = BTreeMap::from([
            ("WebInstancePort".to_string(), "9000".to_string()),
            ("Other".to_string(), "x".to_string()),
        ]);
        assert_eq!(
            instance_ports(&outputs),
            BTreeMap::from([("Web".to_string(), 9000)])
        );

        assert_eq!(
            scale_parameters(&app()),
            vec![Parameter::new("WebScale", "2"), Parameter::new("WorkerScale", "1")]
        );
    }

    #[test]
    fn test_container_round_trip_through_document_form() {
        let process = &app().processes[0];
        let container = task::container_definition(process, Some(9000));
        let back = ContainerDefinition::from(CfnContainerDefinition::from(&container));
        assert_eq!(back, container);
    }
}
