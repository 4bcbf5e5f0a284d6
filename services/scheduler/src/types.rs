//! Application and process shapes handed to the schedulers.
//!
//! None of these are persisted by the scheduler. The write path receives them
//! fresh from the caller; the read path rebuilds them from orchestrator state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Process type conventionally used as an application's public entry point.
pub const WEB_PROCESS_TYPE: &str = "web";

/// Port the container listens on when a load balancer is attached.
///
/// Injected into the process environment as `PORT`.
pub const CONTAINER_PORT: u16 = 8080;

/// An application as the schedulers see it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    /// Stable identifier, used as a resource name prefix.
    pub id: String,

    /// Human label, used for DNS.
    pub name: String,

    pub processes: Vec<Process>,
}

impl App {
    /// Look up a process by type.
    pub fn process(&self, process_type: &str) -> Option<&Process> {
        self.processes
            .iter()
            .find(|p| p.process_type == process_type)
    }
}

/// One scalable unit of an application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    /// Unique within an app (e.g. "web", "worker").
    pub process_type: String,

    pub image: String,

    /// Already tokenized command.
    pub command: Vec<String>,

    pub env: BTreeMap<String, String>,

    /// Opaque metadata passed through to the container.
    pub labels: BTreeMap<String, String>,

    /// Desired number of running instances.
    pub instances: u32,

    pub cpu_shares: u32,

    /// Memory limit in bytes.
    pub memory_limit: u64,

    /// Soft and hard process-count ulimit. Zero means unset.
    pub nproc: u32,

    /// `None` means internal only, no load balancer.
    pub exposure: Option<Exposure>,

    /// Name of the attached load balancer, filled in during reconciliation.
    #[serde(default)]
    pub load_balancer: Option<String>,

    /// Certificate on the attached load balancer, filled in during reconciliation.
    #[serde(default)]
    pub ssl_cert: Option<String>,

    /// Host/container port pairs (legacy, direct scheduler only).
    #[serde(default)]
    pub ports: Vec<PortMap>,
}

impl Process {
    /// Memory limit in MiB, the unit the orchestrator expects.
    pub fn memory_mib(&self) -> u64 {
        self.memory_limit / (1024 * 1024)
    }

    /// Certificate requested by this process' exposure, if any.
    pub fn requested_cert(&self) -> Option<&str> {
        match &self.exposure {
            Some(Exposure {
                protocol: ExposureType::Https { cert },
                ..
            }) => Some(cert.as_str()),
            _ => None,
        }
    }
}

/// How a process is reachable from outside the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exposure {
    /// Internet-facing when true, VPC-internal otherwise.
    pub external: bool,

    pub protocol: ExposureType,
}

impl Exposure {
    pub fn http(external: bool) -> Self {
        Self {
            external,
            protocol: ExposureType::Http,
        }
    }

    pub fn https(external: bool, cert: impl Into<String>) -> Self {
        Self {
            external,
            protocol: ExposureType::Https { cert: cert.into() },
        }
    }
}

/// Protocol of an exposure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExposureType {
    Http,
    Https { cert: String },
}

/// A host/container port pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMap {
    pub host: Option<u16>,
    pub container: Option<u16>,
}

/// A running (or recently stopped) unit of a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instance {
    /// Process shape recovered from the instance's task definition.
    pub process: Process,

    pub id: String,

    /// Lifecycle state as reported by the orchestrator.
    pub state: String,

    /// Creation time while pending, start time while running, stop time once stopped.
    pub updated_at: DateTime<Utc>,
}
