use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::db::DbConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::lb::elb::DEFAULT_CLAIM_GRACE;
use crate::stack::queue::QueueConfig;

/// Default host port range handed to load balancers.
pub const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 9000..=10000;

/// Security groups and subnets for each balancer scheme.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkConfig {
    pub internal_security_group: String,
    pub external_security_group: String,
    pub internal_subnets: Vec<String>,
    pub external_subnets: Vec<String>,
}

impl NetworkConfig {
    pub fn validate(&self) -> SchedulerResult<()> {
        require("internal security group", &self.internal_security_group)?;
        require("external security group", &self.external_security_group)?;
        if self.internal_subnets.is_empty() {
            return Err(SchedulerError::Config("internal subnets are required".into()));
        }
        if self.external_subnets.is_empty() {
            return Err(SchedulerError::Config("external subnets are required".into()));
        }
        Ok(())
    }

    pub fn security_group(&self, external: bool) -> &str {
        if external {
            &self.external_security_group
        } else {
            &self.internal_security_group
        }
    }

    pub fn subnets(&self, external: bool) -> &[String] {
        if external {
            &self.external_subnets
        } else {
            &self.internal_subnets
        }
    }
}

/// The hosted zone app records live under.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostedZone {
    pub id: String,
    /// Base domain, e.g. `dockyard.local`.
    pub name: String,
}

impl HostedZone {
    pub fn validate(&self) -> SchedulerResult<()> {
        require("hosted zone id", &self.id)?;
        require("hosted zone name", &self.name)
    }

    /// Fully qualified record name for a label, e.g. `acme-inc.dockyard.local`.
    pub fn record_name(&self, label: &str) -> String {
        format!("{}.{}", label, self.name.trim_end_matches('.'))
    }
}

/// Reject an empty required setting.
pub fn require(setting: &str, value: &str) -> SchedulerResult<()> {
    if value.trim().is_empty() {
        return Err(SchedulerError::Config(format!("{setting} is required")));
    }
    Ok(())
}

/// Which scheduler implementation serves callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SchedulerKind {
    /// Drives services and load balancers through their APIs directly.
    #[default]
    Direct,
    /// Compiles each app into a stack document.
    Stack,
}

impl FromStr for SchedulerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "direct" | "ecs" => Ok(Self::Direct),
            "stack" | "cloudformation" => Ok(Self::Stack),
            other => bail!("unknown scheduler kind: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub scheduler: SchedulerKind,
    pub cluster: String,
    pub service_role: String,
    pub zone: HostedZone,
    pub network: NetworkConfig,
    pub port_range: RangeInclusive<u16>,
    /// Claims younger than this are never reclaimed, even without a listener.
    pub port_claim_grace: Duration,
    pub stack_prefix: String,
    pub wait_for_create: bool,
    pub queue: QueueConfig,
    pub log_level: String,
    pub database: DbConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let scheduler = std::env::var("DOCKYARD_SCHEDULER")
            .unwrap_or_else(|_| "direct".to_string())
            .parse()?;

        let cluster = std::env::var("DOCKYARD_ECS_CLUSTER").unwrap_or_else(|_| "default".to_string());
        let service_role = std::env::var("DOCKYARD_ECS_SERVICE_ROLE").unwrap_or_default();

        let zone = HostedZone {
            id: std::env::var("DOCKYARD_ROUTE53_ZONE_ID").unwrap_or_default(),
            name: std::env::var("DOCKYARD_ROUTE53_ZONE_NAME")
                .unwrap_or_else(|_| "dockyard.local".to_string()),
        };

        let network = NetworkConfig {
            internal_security_group: std::env::var("DOCKYARD_ELB_SG_PRIVATE").unwrap_or_default(),
            external_security_group: std::env::var("DOCKYARD_ELB_SG_PUBLIC").unwrap_or_default(),
            internal_subnets: list_env("DOCKYARD_EC2_SUBNETS_PRIVATE"),
            external_subnets: list_env("DOCKYARD_EC2_SUBNETS_PUBLIC"),
        };

        let port_range = match std::env::var("DOCKYARD_PORT_RANGE") {
            Ok(raw) => parse_port_range(&raw)?,
            Err(_) => DEFAULT_PORT_RANGE,
        };

        let port_claim_grace = std::env::var("DOCKYARD_PORT_CLAIM_GRACE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CLAIM_GRACE);

        let stack_prefix =
            std::env::var("DOCKYARD_STACK_PREFIX").unwrap_or_else(|_| "dockyard".to_string());

        let wait_for_create = std::env::var("DOCKYARD_STACK_WAIT_CREATE")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let mut queue = QueueConfig::default();
        if let Some(ms) = std::env::var("DOCKYARD_QUEUE_POLL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            queue.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = std::env::var("DOCKYARD_QUEUE_STALE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            queue.stale_after = Duration::from_secs(secs);
        }
        if let Some(secs) = std::env::var("DOCKYARD_QUEUE_HEARTBEAT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            queue.heartbeat_interval = Duration::from_secs(secs);
        }

        let log_level = std::env::var("DOCKYARD_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let database = DbConfig::from_env();

        Ok(Self {
            scheduler,
            cluster,
            service_role,
            zone,
            network,
            port_range,
            port_claim_grace,
            stack_prefix,
            wait_for_create,
            queue,
            log_level,
            database,
        })
    }
}

fn list_env(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Parse `start-end` (inclusive).
pub fn parse_port_range(raw: &str) -> Result<RangeInclusive<u16>> {
    let (start, end) = raw
        .split_once('-')
        .with_context(|| format!("port range must look like 9000-10000, got {raw}"))?;
    let start: u16 = start.trim().parse().context("invalid port range start")?;
    let end: u16 = end.trim().parse().context("invalid port range end")?;
    if start > end {
        bail!("port range start {start} is above end {end}");
    }
    Ok(start..=end)
}
