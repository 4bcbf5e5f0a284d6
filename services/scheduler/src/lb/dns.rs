//! Keeps an app's CNAME pointed at its web balancer.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{
    CreateLoadBalancerOpts, LoadBalancer, LoadBalancerManager, UpdateLoadBalancerOpts, TAG_APP,
};
use crate::backend::dns::{Change, ChangeAction, RecordSet, RecordType};
use crate::backend::{BackendError, DnsApi};
use crate::config::HostedZone;
use crate::error::SchedulerResult;

/// TTL of app records.
pub const RECORD_TTL: u32 = 60;

/// Wraps a manager and syncs DNS for balancers tagged with an app name.
pub struct DnsSyncManager<M> {
    inner: M,
    dns: Arc<dyn DnsApi>,
    zone: HostedZone,
}

impl<M> DnsSyncManager<M> {
    pub fn new(inner: M, dns: Arc<dyn DnsApi>, zone: HostedZone) -> SchedulerResult<Self> {
        zone.validate()?;
        Ok(Self { inner, dns, zone })
    }

    fn record(&self, label: &str, dns_name: &str) -> RecordSet {
        RecordSet {
            name: self.zone.record_name(label),
            record_type: RecordType::Cname,
            ttl: RECORD_TTL,
            values: vec![dns_name.to_string()],
        }
    }
}

#[async_trait]
impl<M: LoadBalancerManager> LoadBalancerManager for DnsSyncManager<M> {
    async fn create_load_balancer(
        &self,
        opts: CreateLoadBalancerOpts,
    ) -> SchedulerResult<LoadBalancer> {
        let lb = self.inner.create_load_balancer(opts).await?;

        if let Some(label) = lb.tags.get(TAG_APP) {
            let record = self.record(label, &lb.dns_name);
            info!(record = %record.name, target = %lb.dns_name, "Upserting app record");
            self.dns
                .change_record(
                    &self.zone.id,
                    Change {
                        action: ChangeAction::Upsert,
                        record,
                    },
                )
                .await?;
        }

        Ok(lb)
    }

    async fn update_load_balancer(&self, opts: UpdateLoadBalancerOpts) -> SchedulerResult<()> {
        self.inner.update_load_balancer(opts).await
    }

    async fn destroy_load_balancer(&self, lb: &LoadBalancer) -> SchedulerResult<()> {
        if let Some(label) = lb.tags.get(TAG_APP) {
            let record = self.record(label, &lb.dns_name);
            let name = record.name.clone();
            match self
                .dns
                .change_record(
                    &self.zone.id,
                    Change {
                        action: ChangeAction::Delete,
                        record,
                    },
                )
                .await
            {
                Ok(()) => info!(record = %name, "Deleted app record"),
                Err(BackendError::RecordNotFound(_)) => {
                    debug!(record = %name, "App record already gone")
                }
                Err(err) => return Err(err.into()),
            }
        }

        self.inner.destroy_load_balancer(lb).await
    }

    async fn load_balancers(
        &self,
        tags: &BTreeMap<String, String>,
    ) -> SchedulerResult<Vec<LoadBalancer>> {
        self.inner.load_balancers(tags).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryDns;
    use crate::lb::lookup_tags;

    /// Hands back a fixed balancer and records destroys.
    #[derive(Default)]
    struct StaticManager {
        destroyed: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LoadBalancerManager for StaticManager {
        async fn create_load_balancer(
            &self,
            opts: CreateLoadBalancerOpts,
        ) -> SchedulerResult<LoadBalancer> {
            Ok(LoadBalancer {
                name: "lb-1".to_string(),
                dns_name: "lb-1.elb.example.com".to_string(),
                external: opts.external,
                ssl_cert: opts.ssl_cert,
                instance_port: 9000,
                tags: opts.tags,
            })
        }

        async fn update_load_balancer(&self, _: UpdateLoadBalancerOpts) -> SchedulerResult<()> {
            Ok(())
        }

        async fn destroy_load_balancer(&self, lb: &LoadBalancer) -> SchedulerResult<()> {
            self.destroyed.lock().unwrap().push(lb.name.clone());
            Ok(())
        }

        async fn load_balancers(
            &self,
            _: &BTreeMap<String, String>,
        ) -> SchedulerResult<Vec<LoadBalancer>> {
            Ok(vec![])
        }
    }

    fn zone() -> HostedZone {
        HostedZone {
            id: "Z123".to_string(),
            name: "dockyard.local".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_upserts_record_for_named_app() {
        let dns = Arc::new(MemoryDns::new());
        let manager = DnsSyncManager::new(StaticManager::default(), dns.clone(), zone()).unwrap();

        let mut tags = lookup_tags("1234", "web");
        tags.insert(TAG_APP.to_string(), "acme-inc".to_string());
        manager
            .create_load_balancer(CreateLoadBalancerOpts {
                external: true,
                ssl_cert: None,
                tags,
            })
            .await
            .unwrap();

        let record = dns.record("acme-inc.dockyard.local").unwrap();
        assert_eq!(record.values, vec!["lb-1.elb.example.com".to_string()]);
        assert_eq!(record.ttl, RECORD_TTL);
    }

    #[tokio::test]
    async fn test_create_without_label_skips_dns() {
        let dns = Arc::new(MemoryDns::new());
        let manager = DnsSyncManager::new(StaticManager::default(), dns.clone(), zone()).unwrap();

        manager
            .create_load_balancer(CreateLoadBalancerOpts {
                external: false,
                ssl_cert: None,
                tags: lookup_tags("1234", "web"),
            })
            .await
            .unwrap();

        assert!(dns.changes().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_tolerates_missing_record() {
        let dns = Arc::new(MemoryDns::new());
        let inner = StaticManager::default();
        let manager = DnsSyncManager::new(inner, dns.clone(), zone()).unwrap();

        let mut tags = lookup_tags("1234", "web");
        tags.insert(TAG_APP.to_string(), "acme-inc".to_string());
        let lb = LoadBalancer {
            name: "lb-1".to_string(),
            dns_name: "lb-1.elb.example.com".to_string(),
            external: true,
            ssl_cert: None,
            instance_port: 9000,
            tags,
        };

        manager.destroy_load_balancer(&lb).await.unwrap();
        assert_eq!(*manager.inner.destroyed.lock().unwrap(), vec!["lb-1".to_string()]);
    }

    #[test]
    fn test_requires_zone() {
        let result = DnsSyncManager::new(
            StaticManager::default(),
            Arc::new(MemoryDns::new()),
            HostedZone::default(),
        );
        assert!(result.is_err());
    }
}
