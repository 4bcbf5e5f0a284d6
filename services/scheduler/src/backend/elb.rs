//! Load balancer API (balancers, listeners, attributes, tags).

use std::collections::BTreeMap;

use async_trait::async_trait;

use super::{BackendResult, Page};

/// Most balancer names a single tag describe accepts.
pub const MAX_DESCRIBE_TAGS: usize = 20;

/// Port of the plain HTTP listener every balancer carries.
pub const HTTP_PORT: u16 = 80;

/// Port of the optional TLS listener.
pub const HTTPS_PORT: u16 = 443;

/// Network placement of a balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Internal,
    InternetFacing,
}

impl Scheme {
    pub fn from_external(external: bool) -> Self {
        if external {
            Self::InternetFacing
        } else {
            Self::Internal
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, Self::InternetFacing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::InternetFacing => "internet-facing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerProtocol {
    Http,
    Https,
}

impl ListenerProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "HTTP",
            Self::Https => "HTTPS",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub protocol: ListenerProtocol,
    pub load_balancer_port: u16,
    pub instance_port: u16,
    pub ssl_certificate_id: Option<String>,
}

impl Listener {
    pub fn http(instance_port: u16) -> Self {
        Self {
            protocol: ListenerProtocol::Http,
            load_balancer_port: HTTP_PORT,
            instance_port,
            ssl_certificate_id: None,
        }
    }

    pub fn https(instance_port: u16, cert: impl Into<String>) -> Self {
        Self {
            protocol: ListenerProtocol::Https,
            load_balancer_port: HTTPS_PORT,
            instance_port,
            ssl_certificate_id: Some(cert.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateLoadBalancerInput {
    pub name: String,
    pub scheme: Scheme,
    pub security_groups: Vec<String>,
    pub subnets: Vec<String>,
    pub listeners: Vec<Listener>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadBalancerAttributes {
    pub connection_draining: bool,
    pub connection_draining_timeout_secs: u32,
    pub cross_zone: bool,
}

impl Default for LoadBalancerAttributes {
    fn default() -> Self {
        Self {
            connection_draining: true,
            connection_draining_timeout_secs: 300,
            cross_zone: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerDescription {
    pub name: String,
    pub dns_name: String,
    pub scheme: Scheme,
    pub listeners: Vec<Listener>,
}

impl LoadBalancerDescription {
    pub fn listener(&self, port: u16) -> Option<&Listener> {
        self.listeners
            .iter()
            .find(|l| l.load_balancer_port == port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescribeLoadBalancersInput {
    /// Restrict to these names; empty lists everything.
    pub names: Vec<String>,
    pub marker: Option<String>,
}

/// Load balancer API interface.
#[async_trait]
pub trait LoadBalancerApi: Send + Sync {
    /// Create a balancer and return its DNS name.
    async fn create_load_balancer(&self, input: CreateLoadBalancerInput) -> BackendResult<String>;

    async fn modify_load_balancer_attributes(
        &self,
        name: &str,
        attributes: LoadBalancerAttributes,
    ) -> BackendResult<()>;

    async fn create_listeners(&self, name: &str, listeners: Vec<Listener>) -> BackendResult<()>;

    async fn delete_listeners(&self, name: &str, ports: Vec<u16>) -> BackendResult<()>;

    /// Replace the certificate on an existing TLS listener.
    async fn set_listener_certificate(
        &self,
        name: &str,
        port: u16,
        certificate: &str,
    ) -> BackendResult<()>;

    async fn delete_load_balancer(&self, name: &str) -> BackendResult<()>;

    async fn describe_load_balancers(
        &self,
        input: DescribeLoadBalancersInput,
    ) -> BackendResult<Page<LoadBalancerDescription>>;

    /// Tags for up to [`MAX_DESCRIBE_TAGS`] balancers, keyed by name.
    async fn describe_tags(
        &self,
        names: &[String],
    ) -> BackendResult<BTreeMap<String, BTreeMap<String, String>>>;
}
