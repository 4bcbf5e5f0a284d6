//! The caller-facing scheduler interface.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backend::{DnsApi, LoadBalancerApi, Orchestrator, StackApi};
use crate::cache::TaskDefinitionCache;
use crate::config::{Config, SchedulerKind};
use crate::direct::{DirectConfig, DirectScheduler};
use crate::error::{SchedulerError, SchedulerResult};
use crate::lb::dns::DnsSyncManager;
use crate::lb::elb::ElbManager;
use crate::lb::logged::LoggedManager;
use crate::lb::ports::PortAllocator;
use crate::stack::queue::{QueueStore, StackUpdateQueue};
use crate::stack::template::TemplateConfig;
use crate::stack::{StackScheduler, StackSchedulerConfig};
use crate::types::{App, Instance, Process};

/// Streams for an interactive run.
pub struct Attach {
    pub stdin: Box<dyn AsyncRead + Send + Unpin>,
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
}

/// Operations every scheduler offers.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Converge the live processes of `app` to its description.
    async fn submit(&self, app: &App) -> SchedulerResult<()>;

    async fn scale(&self, app: &App, process_type: &str, instances: u32) -> SchedulerResult<()>;

    /// Tear down everything the app runs.
    async fn remove(&self, app: &App) -> SchedulerResult<()>;

    async fn instances(&self, app: &App) -> SchedulerResult<Vec<Instance>>;

    /// Start a one-off process. Only detached runs are handled here.
    async fn run(&self, app: &App, process: &Process, attach: Option<Attach>)
        -> SchedulerResult<()>;

    async fn stop(&self, instance_id: &str) -> SchedulerResult<()>;
}

#[async_trait]
impl Scheduler for DirectScheduler {
    async fn submit(&self, app: &App) -> SchedulerResult<()> {
        DirectScheduler::submit(self, app).await
    }

    async fn scale(&self, app: &App, process_type: &str, instances: u32) -> SchedulerResult<()> {
        DirectScheduler::scale(self, app, process_type, instances).await
    }

    async fn remove(&self, app: &App) -> SchedulerResult<()> {
        DirectScheduler::remove(self, app).await
    }

    async fn instances(&self, app: &App) -> SchedulerResult<Vec<Instance>> {
        DirectScheduler::instances(self, app).await
    }

    async fn run(
        &self,
        app: &App,
        process: &Process,
        attach: Option<Attach>,
    ) -> SchedulerResult<()> {
        if attach.is_some() {
            return Err(SchedulerError::AttachedRunUnsupported);
        }
        DirectScheduler::run(self, app, process).await
    }

    async fn stop(&self, instance_id: &str) -> SchedulerResult<()> {
        DirectScheduler::stop(self, instance_id).await
    }
}

#[async_trait]
impl Scheduler for StackScheduler {
    async fn submit(&self, app: &App) -> SchedulerResult<()> {
        StackScheduler::submit(self, app).await
    }

    async fn scale(&self, app: &App, process_type: &str, instances: u32) -> SchedulerResult<()> {
        StackScheduler::scale(self, app, process_type, instances).await
    }

    async fn remove(&self, app: &App) -> SchedulerResult<()> {
        StackScheduler::remove(self, app).await
    }

    async fn instances(&self, app: &App) -> SchedulerResult<Vec<Instance>> {
        StackScheduler::instances(self, app).await
    }

    async fn run(
        &self,
        app: &App,
        process: &Process,
        attach: Option<Attach>,
    ) -> SchedulerResult<()> {
        if attach.is_some() {
            return Err(SchedulerError::AttachedRunUnsupported);
        }
        StackScheduler::run(self, app, process).await
    }

    async fn stop(&self, instance_id: &str) -> SchedulerResult<()> {
        StackScheduler::stop(self, instance_id).await
    }
}

/// Backend handles a scheduler is assembled from.
#[derive(Clone)]
pub struct Backends {
    pub orchestrator: Arc<dyn Orchestrator>,
    pub load_balancers: Arc<dyn LoadBalancerApi>,
    pub dns: Arc<dyn DnsApi>,
    pub stacks: Arc<dyn StackApi>,
    pub ports: Arc<dyn PortAllocator>,
    pub queue: Arc<dyn QueueStore>,
    pub cache: Arc<TaskDefinitionCache>,
}

/// The configured scheduler.
pub enum AnyScheduler {
    Direct(DirectScheduler),
    Stack(StackScheduler),
}

impl AnyScheduler {
    /// Build the scheduler `config` selects.
    ///
    /// Missing settings fail here rather than on first use.
    pub fn from_config(
        config: &Config,
        backends: Backends,
        shutdown: CancellationToken,
    ) -> SchedulerResult<Self> {
        match config.scheduler {
            SchedulerKind::Direct => {
                let manager = LoggedManager::new(DnsSyncManager::new(
                    ElbManager::new(
                        config.network.clone(),
                        backends.load_balancers,
                        backends.ports,
                    )?
                    .with_claim_grace(config.port_claim_grace),
                    backends.dns,
                    config.zone.clone(),
                )?);
                let scheduler = DirectScheduler::new(
                    DirectConfig {
                        cluster: config.cluster.clone(),
                        service_role: config.service_role.clone(),
                    },
                    backends.orchestrator,
                    Arc::new(manager),
                    backends.cache,
                )?;
                info!(cluster = %config.cluster, "Using direct scheduler");
                Ok(Self::Direct(scheduler))
            }
            SchedulerKind::Stack => {
                let queue =
                    StackUpdateQueue::new(backends.queue, backends.stacks.clone(), config.queue);
                let scheduler = StackScheduler::new(
                    StackSchedulerConfig {
                        cluster: config.cluster.clone(),
                        stack_prefix: config.stack_prefix.clone(),
                        wait_for_create: config.wait_for_create,
                        template: TemplateConfig {
                            cluster: config.cluster.clone(),
                            service_role: config.service_role.clone(),
                            zone: config.zone.clone(),
                            network: config.network.clone(),
                        },
                    },
                    backends.stacks,
                    queue,
                    backends.orchestrator,
                    backends.ports,
                    backends.cache,
                )?
                .with_shutdown(shutdown);
                info!(cluster = %config.cluster, prefix = %config.stack_prefix, "Using stack scheduler");
                Ok(Self::Stack(scheduler))
            }
        }
    }

    fn inner(&self) -> &dyn Scheduler {
        match self {
            Self::Direct(s) => s,
            Self::Stack(s) => s,
        }
    }
}

#[async_trait]
impl Scheduler for AnyScheduler {
    async fn submit(&self, app: &App) -> SchedulerResult<()> {
        self.inner().submit(app).await
    }

    async fn scale(&self, app: &App, process_type: &str, instances: u32) -> SchedulerResult<()> {
        self.inner().scale(app, process_type, instances).await
    }

    async fn remove(&self, app: &App) -> SchedulerResult<()> {
        self.inner().remove(app).await
    }

    async fn instances(&self, app: &App) -> SchedulerResult<Vec<Instance>> {
        self.inner().instances(app).await
    }

    async fn run(
        &self,
        app: &App,
        process: &Process,
        attach: Option<Attach>,
    ) -> SchedulerResult<()> {
        self.inner().run(app, process, attach).await
    }

    async fn stop(&self, instance_id: &str) -> SchedulerResult<()> {
        self.inner().stop(instance_id).await
    }
}
