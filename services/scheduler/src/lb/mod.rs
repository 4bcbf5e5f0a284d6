//! Load balancer management for exposed processes.
//!
//! A [`LoadBalancerManager`] creates, rotates certificates on, destroys and
//! enumerates balancers. Implementations compose:
//!
//! - [`elb::ElbManager`] talks to the load balancer API and claims host ports
//! - [`dns::DnsSyncManager`] keeps an app CNAME in step with its balancer
//! - [`logged::LoggedManager`] traces every call
//!
//! Balancers are identified by their `AppID` and `ProcessType` tags, never by
//! name.

pub mod dns;
pub mod elb;
pub mod logged;
pub mod ports;

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::types::{App, Process, WEB_PROCESS_TYPE};

/// Tag carrying the owning app id.
pub const TAG_APP_ID: &str = "AppID";

/// Tag carrying the owning process type.
pub const TAG_PROCESS_TYPE: &str = "ProcessType";

/// Tag carrying the app name used as DNS label.
pub const TAG_APP: &str = "App";

/// A provisioned load balancer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancer {
    pub name: String,
    pub dns_name: String,
    pub external: bool,
    pub ssl_cert: Option<String>,
    /// Host port traffic is forwarded to.
    pub instance_port: u16,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateLoadBalancerOpts {
    pub external: bool,
    pub ssl_cert: Option<String>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateLoadBalancerOpts {
    pub name: String,
    /// `None` removes the TLS listener.
    pub ssl_cert: Option<String>,
}

/// Load balancer lifecycle operations.
#[async_trait]
pub trait LoadBalancerManager: Send + Sync {
    async fn create_load_balancer(
        &self,
        opts: CreateLoadBalancerOpts,
    ) -> SchedulerResult<LoadBalancer>;

    /// Rotate the certificate in place.
    async fn update_load_balancer(&self, opts: UpdateLoadBalancerOpts) -> SchedulerResult<()>;

    async fn destroy_load_balancer(&self, lb: &LoadBalancer) -> SchedulerResult<()>;

    /// All balancers carrying every one of `tags`.
    async fn load_balancers(
        &self,
        tags: &BTreeMap<String, String>,
    ) -> SchedulerResult<Vec<LoadBalancer>>;
}

/// Tags used to look a process' balancer up.
pub fn lookup_tags(app_id: &str, process_type: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (TAG_APP_ID.to_string(), app_id.to_string()),
        (TAG_PROCESS_TYPE.to_string(), process_type.to_string()),
    ])
}

/// Tags a new balancer for a process is created with.
///
/// Only the `web` process of a named app carries the DNS label tag.
pub fn creation_tags(app: &App, process: &Process) -> BTreeMap<String, String> {
    let mut tags = lookup_tags(&app.id, &process.process_type);
    if process.process_type == WEB_PROCESS_TYPE && !app.name.is_empty() {
        tags.insert(TAG_APP.to_string(), app.name.clone());
    }
    tags
}

/// What a process' balancer looks like after reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Balancer {
    /// Not exposed and nothing provisioned.
    None,
    /// The balancer serving the process.
    Attached(LoadBalancer),
    /// The process is no longer exposed but this balancer still serves it.
    /// The caller tears it down together with the service it is attached to.
    Orphaned(LoadBalancer),
}

/// Find, create or update the balancer a process needs.
///
/// - No balancer and not exposed: nothing to do.
/// - Exposed with no balancer: create one.
/// - External flag differs: [`SchedulerError::ExposureConflict`], nothing is mutated.
/// - Exposure dropped: the balancer is reported as [`Balancer::Orphaned`].
/// - Certificate differs: rotate it in place.
#[instrument(skip_all, fields(app_id = %app.id, process_type = %process.process_type))]
pub async fn reconcile_load_balancer(
    manager: &dyn LoadBalancerManager,
    app: &App,
    process: &Process,
) -> SchedulerResult<Balancer> {
    let mut found = manager
        .load_balancers(&lookup_tags(&app.id, &process.process_type))
        .await?;
    if found.len() > 1 {
        warn!(count = found.len(), "Multiple load balancers tagged for process, using the first");
    }
    let existing = if found.is_empty() {
        None
    } else {
        Some(found.swap_remove(0))
    };

    let desired_cert = process.requested_cert().map(str::to_string);

    match (&process.exposure, existing) {
        (None, None) => Ok(Balancer::None),
        (None, Some(lb)) => {
            warn!(load_balancer = %lb.name, "Process no longer exposed, balancer is orphaned");
            Ok(Balancer::Orphaned(lb))
        }
        (Some(exposure), None) => {
            let lb = manager
                .create_load_balancer(CreateLoadBalancerOpts {
                    external: exposure.external,
                    ssl_cert: desired_cert,
                    tags: creation_tags(app, process),
                })
                .await?;
            info!(load_balancer = %lb.name, port = lb.instance_port, "Created load balancer");
            Ok(Balancer::Attached(lb))
        }
        (Some(exposure), Some(lb)) if lb.external != exposure.external => {
            Err(SchedulerError::exposure_conflict(
                &app.id,
                &process.process_type,
                &lb.name,
                lb.external,
                exposure.external,
            ))
        }
        (Some(_), Some(mut lb)) => {
            if lb.ssl_cert != desired_cert {
                manager
                    .update_load_balancer(UpdateLoadBalancerOpts {
                        name: lb.name.clone(),
                        ssl_cert: desired_cert.clone(),
                    })
                    .await?;
                info!(load_balancer = %lb.name, "Rotated load balancer certificate");
                lb.ssl_cert = desired_cert;
            } else {
                debug!(load_balancer = %lb.name, "Load balancer up to date");
            }
            Ok(Balancer::Attached(lb))
        }
    }
}
