use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{error, info};

use super::{CreateLoadBalancerOpts, LoadBalancer, LoadBalancerManager, UpdateLoadBalancerOpts};
use crate::error::SchedulerResult;

/// Emits a structured event for every mutating balancer call.
pub struct LoggedManager<M> {
    inner: M,
}

impl<M> LoggedManager<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<M: LoadBalancerManager> LoadBalancerManager for LoggedManager<M> {
    async fn create_load_balancer(
        &self,
        opts: CreateLoadBalancerOpts,
    ) -> SchedulerResult<LoadBalancer> {
        let external = opts.external;
        match self.inner.create_load_balancer(opts).await {
            Ok(lb) => {
                info!(
                    load_balancer = %lb.name,
                    dns_name = %lb.dns_name,
                    external,
                    port = lb.instance_port,
                    "load_balancer.create"
                );
                Ok(lb)
            }
            Err(err) => {
                error!(external, error = %err, "load_balancer.create failed");
                Err(err)
            }
        }
    }

    async fn update_load_balancer(&self, opts: UpdateLoadBalancerOpts) -> SchedulerResult<()> {
        let name = opts.name.clone();
        let tls = opts.ssl_cert.is_some();
        let result = self.inner.update_load_balancer(opts).await;
        match &result {
            Ok(()) => info!(load_balancer = %name, tls, "load_balancer.update"),
            Err(err) => error!(load_balancer = %name, error = %err, "load_balancer.update failed"),
        }
        result
    }

    async fn destroy_load_balancer(&self, lb: &LoadBalancer) -> SchedulerResult<()> {
        let result = self.inner.destroy_load_balancer(lb).await;
        match &result {
            Ok(()) => info!(load_balancer = %lb.name, port = lb.instance_port, "load_balancer.destroy"),
            Err(err) => {
                error!(load_balancer = %lb.name, error = %err, "load_balancer.destroy failed")
            }
        }
        result
    }

    async fn load_balancers(
        &self,
        tags: &BTreeMap<String, String>,
    ) -> SchedulerResult<Vec<LoadBalancer>> {
        self.inner.load_balancers(tags).await
    }
}
