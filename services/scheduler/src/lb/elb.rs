//! Load balancer manager backed by the load balancer API.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::try_join_all;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::ports::PortAllocator;
use super::{CreateLoadBalancerOpts, LoadBalancer, LoadBalancerManager, UpdateLoadBalancerOpts};
use crate::backend::elb::{
    CreateLoadBalancerInput, DescribeLoadBalancersInput, Listener, LoadBalancerAttributes,
    LoadBalancerDescription, Scheme, HTTPS_PORT, HTTP_PORT, MAX_DESCRIBE_TAGS,
};
use crate::backend::{BackendError, LoadBalancerApi};
use crate::config::NetworkConfig;
use crate::error::{SchedulerError, SchedulerResult};

/// How long a port claim may go without a balancer before it is reclaimable.
pub const DEFAULT_CLAIM_GRACE: Duration = Duration::from_secs(600);

/// Creates classic balancers forwarding 80 (and optionally 443) to a claimed
/// host port.
pub struct ElbManager {
    network: NetworkConfig,
    api: Arc<dyn LoadBalancerApi>,
    ports: Arc<dyn PortAllocator>,
    claim_grace: Duration,
}

impl ElbManager {
    pub fn new(
        network: NetworkConfig,
        api: Arc<dyn LoadBalancerApi>,
        ports: Arc<dyn PortAllocator>,
    ) -> SchedulerResult<Self> {
        network.validate()?;
        Ok(Self {
            network,
            api,
            ports,
            claim_grace: DEFAULT_CLAIM_GRACE,
        })
    }

    pub fn with_claim_grace(mut self, grace: Duration) -> Self {
        self.claim_grace = grace;
        self
    }

    /// Release claimed ports that no balancer forwards to.
    ///
    /// Claims younger than the grace period are left alone, since their
    /// balancer may still be on its way.
    #[instrument(skip(self))]
    pub async fn reclaim_ports(&self) -> SchedulerResult<Vec<u16>> {
        let live: BTreeSet<u16> = self
            .describe_all()
            .await?
            .iter()
            .flat_map(|d| d.listeners.iter().map(|l| l.instance_port))
            .collect();
        let cutoff = chrono::Duration::from_std(self.claim_grace)
            .ok()
            .and_then(|grace| Utc::now().checked_sub_signed(grace))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let freed = self.ports.reclaim(&live, cutoff).await?;
        if !freed.is_empty() {
            warn!(?freed, "Reclaimed orphaned port claims");
        }
        Ok(freed)
    }

    /// Claim a port, reclaiming orphaned claims once if the pool is empty.
    async fn claim_port(&self) -> SchedulerResult<u16> {
        match self.ports.get().await {
            Err(SchedulerError::PortsExhausted) => {
                if self.reclaim_ports().await?.is_empty() {
                    return Err(SchedulerError::PortsExhausted);
                }
                self.ports.get().await
            }
            claimed => claimed,
        }
    }

    async fn provision(
        &self,
        name: &str,
        port: u16,
        opts: &CreateLoadBalancerOpts,
    ) -> SchedulerResult<String> {
        let mut listeners = vec![Listener::http(port)];
        if let Some(cert) = &opts.ssl_cert {
            listeners.push(Listener::https(port, cert.clone()));
        }

        let dns_name = self
            .api
            .create_load_balancer(CreateLoadBalancerInput {
                name: name.to_string(),
                scheme: Scheme::from_external(opts.external),
                security_groups: vec![self.network.security_group(opts.external).to_string()],
                subnets: self.network.subnets(opts.external).to_vec(),
                listeners,
                tags: opts.tags.clone(),
            })
            .await?;

        self.api
            .modify_load_balancer_attributes(name, LoadBalancerAttributes::default())
            .await?;

        Ok(dns_name)
    }

    async fn describe(&self, name: &str) -> SchedulerResult<LoadBalancerDescription> {
        let page = self
            .api
            .describe_load_balancers(DescribeLoadBalancersInput {
                names: vec![name.to_string()],
                marker: None,
            })
            .await?;
        page.items
            .into_iter()
            .find(|d| d.name == name)
            .ok_or_else(|| BackendError::LoadBalancerNotFound(name.to_string()).into())
    }

    async fn describe_all(&self) -> SchedulerResult<Vec<LoadBalancerDescription>> {
        let mut descriptions = Vec::new();
        let mut input = DescribeLoadBalancersInput::default();
        loop {
            let page = self.api.describe_load_balancers(input.clone()).await?;
            descriptions.extend(page.items);
            match page.next_token {
                Some(marker) => input.marker = Some(marker),
                None => return Ok(descriptions),
            }
        }
    }
}

#[async_trait]
impl LoadBalancerManager for ElbManager {
    #[instrument(skip_all, fields(external = opts.external))]
    async fn create_load_balancer(
        &self,
        opts: CreateLoadBalancerOpts,
    ) -> SchedulerResult<LoadBalancer> {
        let port = self.claim_port().await?;
        let name = Uuid::new_v4().simple().to_string();

        let dns_name = match self.provision(&name, port, &opts).await {
            Ok(dns_name) => dns_name,
            Err(err) => {
                if let Err(release) = self.ports.put(port).await {
                    warn!(port, error = %release, "Failed to release port after create failure");
                }
                return Err(err);
            }
        };

        Ok(LoadBalancer {
            name,
            dns_name,
            external: opts.external,
            ssl_cert: opts.ssl_cert,
            instance_port: port,
            tags: opts.tags,
        })
    }

    #[instrument(skip_all, fields(load_balancer = %opts.name))]
    async fn update_load_balancer(&self, opts: UpdateLoadBalancerOpts) -> SchedulerResult<()> {
        let description = self.describe(&opts.name).await?;
        let tls = description.listener(HTTPS_PORT);

        match (opts.ssl_cert, tls) {
            (Some(cert), Some(_)) => {
                self.api
                    .set_listener_certificate(&opts.name, HTTPS_PORT, &cert)
                    .await?;
            }
            (Some(cert), None) => {
                let instance_port = description
                    .listener(HTTP_PORT)
                    .map(|l| l.instance_port)
                    .ok_or_else(|| {
                        SchedulerError::Config(format!(
                            "load balancer {} has no HTTP listener",
                            opts.name
                        ))
                    })?;
                self.api
                    .create_listeners(&opts.name, vec![Listener::https(instance_port, cert)])
                    .await?;
            }
            (None, Some(_)) => {
                self.api
                    .delete_listeners(&opts.name, vec![HTTPS_PORT])
                    .await?;
            }
            (None, None) => debug!("No TLS listener to change"),
        }
        Ok(())
    }

    #[instrument(skip_all, fields(load_balancer = %lb.name, port = lb.instance_port))]
    async fn destroy_load_balancer(&self, lb: &LoadBalancer) -> SchedulerResult<()> {
        self.ports.put(lb.instance_port).await?;
        self.api.delete_load_balancer(&lb.name).await?;
        Ok(())
    }

    async fn load_balancers(
        &self,
        tags: &BTreeMap<String, String>,
    ) -> SchedulerResult<Vec<LoadBalancer>> {
        let descriptions = self.describe_all().await?;
        let names: Vec<String> = descriptions.iter().map(|d| d.name.clone()).collect();

        let tag_batches =
            try_join_all(names.chunks(MAX_DESCRIBE_TAGS).map(|chunk| self.api.describe_tags(chunk)))
                .await?;
        let mut all_tags: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for batch in tag_batches {
            all_tags.extend(batch);
        }

        let mut matched = Vec::new();
        for description in descriptions {
            let lb_tags = all_tags.remove(&description.name).unwrap_or_default();
            if !tags.iter().all(|(k, v)| lb_tags.get(k) == Some(v)) {
                continue;
            }
            let Some(instance_port) = description.listener(HTTP_PORT).map(|l| l.instance_port)
            else {
                warn!(load_balancer = %description.name, "Tagged load balancer has no HTTP listener");
                continue;
            };
            let ssl_cert = description
                .listener(HTTPS_PORT)
                .and_then(|l| l.ssl_certificate_id.clone());

            matched.push(LoadBalancer {
                external: description.scheme.is_external(),
                name: description.name,
                dns_name: description.dns_name,
                ssl_cert,
                instance_port,
                tags: lb_tags,
            });
        }
        Ok(matched)
    }
}
