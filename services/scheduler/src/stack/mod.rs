//! Declarative scheduler.
//!
//! Each app compiles into one stack document named `<prefix>-<app id>`. The
//! backend reconciles the processes; this module decides between create and
//! update, owns the instance ports the document references, and routes every
//! update through the [`queue::StackUpdateQueue`].

pub mod queue;
pub mod template;

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

use dockyard_reconcile::DocumentHash;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backend::orchestrator::name_from_arn;
use crate::backend::stack::{
    CreateStackInput, Parameter, Stack, UpdateStackInput, RESOURCE_ECS_SERVICE,
};
use crate::backend::{BackendError, Orchestrator, StackApi};
use crate::cache::TaskDefinitionCache;
use crate::error::{SchedulerError, SchedulerResult};
use crate::instances::{list_instances, run_detached, ServiceRef};
use crate::lb::ports::PortAllocator;
use crate::lb::TAG_APP_ID;
use crate::types::{App, Instance, Process};

use queue::StackUpdateQueue;
use template::{
    balancer_resource, balancer_schemes, instance_ports, logical_id, scale_parameter,
    scale_parameters, Template, TemplateConfig, PROCESS_TYPE_METADATA,
};

/// Race `fut` against `cancel`. A cancelled token wins even if `fut` is ready.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = T>,
) -> SchedulerResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SchedulerError::Cancelled),
        out = fut => Ok(out),
    }
}

#[derive(Debug, Clone)]
pub struct StackSchedulerConfig {
    pub cluster: String,
    /// Prepended to the app id to name stacks.
    pub stack_prefix: String,
    /// Block `submit` until a newly created stack is complete.
    pub wait_for_create: bool,
    pub template: TemplateConfig,
}

/// Scheduler that applies one stack per app.
pub struct StackScheduler {
    cluster: String,
    stack_prefix: String,
    wait_for_create: bool,
    template: Template,
    stacks: Arc<dyn StackApi>,
    queue: StackUpdateQueue,
    orchestrator: Arc<dyn Orchestrator>,
    ports: Arc<dyn PortAllocator>,
    cache: Arc<TaskDefinitionCache>,
    shutdown: CancellationToken,
}

impl StackScheduler {
    pub fn new(
        config: StackSchedulerConfig,
        stacks: Arc<dyn StackApi>,
        queue: StackUpdateQueue,
        orchestrator: Arc<dyn Orchestrator>,
        ports: Arc<dyn PortAllocator>,
        cache: Arc<TaskDefinitionCache>,
    ) -> SchedulerResult<Self> {
        crate::config::require("stack prefix", &config.stack_prefix)?;
        Ok(Self {
            cluster: config.cluster,
            stack_prefix: config.stack_prefix,
            wait_for_create: config.wait_for_create,
            template: Template::new(config.template)?,
            stacks,
            queue,
            orchestrator,
            ports,
            cache,
            shutdown: CancellationToken::new(),
        })
    }

    /// Cancel queue polls and backend waits when `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn stack_name(&self, app: &App) -> String {
        format!("{}-{}", self.stack_prefix, app.id)
    }

    async fn describe(&self, name: &str) -> SchedulerResult<Option<Stack>> {
        match self.stacks.describe_stack(name).await {
            Ok(stack) => Ok(Some(stack)),
            Err(BackendError::StackNotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Compile and apply the app's stack.
    ///
    /// Updates go through the queue; ports are resolved from the stack as it
    /// stands once this caller's turn comes.
    #[instrument(skip_all, fields(app_id = %app.id))]
    pub async fn submit(&self, app: &App) -> SchedulerResult<()> {
        let cancel = self.shutdown.child_token();
        let name = self.stack_name(app);
        match self.describe(&name).await? {
            None => self.create(app, &name, &cancel).await,
            Some(_) => self.update(app, &name, &cancel).await,
        }
    }

    async fn create(&self, app: &App, name: &str, cancel: &CancellationToken) -> SchedulerResult<()> {
        let (ports, claimed) = self.assign_ports(app, &BTreeMap::new()).await?;
        let body = match self.template.compile(app, &ports) {
            Ok(body) => body,
            Err(err) => {
                self.release(&claimed).await;
                return Err(err);
            }
        };
        debug!(stack = %name, hash = %DocumentHash::from_canonical(&body), "Compiled stack document");

        let created = self
            .stacks
            .create_stack(CreateStackInput {
                name: name.to_string(),
                template_body: body,
                parameters: scale_parameters(app),
                tags: BTreeMap::from([(TAG_APP_ID.to_string(), app.id.clone())]),
            })
            .await;
        if let Err(err) = created {
            self.release(&claimed).await;
            return Err(err.into());
        }
        info!(stack = %name, "Created stack");

        if self.wait_for_create {
            cancellable(cancel, self.stacks.wait_until_create_complete(name)).await??;
        }
        Ok(())
    }

    async fn update(&self, app: &App, name: &str, cancel: &CancellationToken) -> SchedulerResult<()> {
        let Some(turn) = self.queue.take_turn(name, cancel).await? else {
            info!(stack = %name, "Stack submit superseded");
            return Ok(());
        };

        let current = turn.current(cancel).await?;
        self.check_exposure(app, name).await?;

        let previous = instance_ports(&current.outputs);
        let (ports, claimed) = self.assign_ports(app, &previous).await?;
        let body = match self.template.compile(app, &ports) {
            Ok(body) => body,
            Err(err) => {
                self.release(&claimed).await;
                return Err(err);
            }
        };
        debug!(stack = %name, hash = %DocumentHash::from_canonical(&body), "Compiled stack document");

        let input = UpdateStackInput {
            name: name.to_string(),
            template_body: Some(body),
            use_previous_template: false,
            parameters: scale_parameters(app),
        };
        match turn.apply(input, cancel).await {
            Ok(outcome) if outcome.is_current() => {
                let in_use: BTreeSet<u16> = ports.values().copied().collect();
                let stale: Vec<u16> = previous
                    .values()
                    .copied()
                    .filter(|port| !in_use.contains(port))
                    .collect();
                self.release(&stale).await;
                info!(stack = %name, ?outcome, "Stack submitted");
                Ok(())
            }
            Ok(outcome) => {
                self.release(&claimed).await;
                info!(stack = %name, ?outcome, "Stack submit superseded");
                Ok(())
            }
            Err(err) => {
                self.release(&claimed).await;
                Err(err)
            }
        }
    }

    /// Refuse to flip a balancer between internal and internet-facing.
    async fn check_exposure(&self, app: &App, name: &str) -> SchedulerResult<()> {
        let existing = balancer_schemes(&self.stacks.get_template(name).await?)?;
        for process in &app.processes {
            let Some(exposure) = &process.exposure else {
                continue;
            };
            let balancer = balancer_resource(&logical_id(&process.process_type));
            match existing.get(&balancer) {
                Some(&external) if external != exposure.external => {
                    return Err(SchedulerError::exposure_conflict(
                        &app.id,
                        &process.process_type,
                        &balancer,
                        external,
                        exposure.external,
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Instance ports for every exposed process, reusing `previous` by logical
    /// id. Also returns the ports claimed from the pool for this call.
    async fn assign_ports(
        &self,
        app: &App,
        previous: &BTreeMap<String, u16>,
    ) -> SchedulerResult<(BTreeMap<String, u16>, Vec<u16>)> {
        let mut ports = BTreeMap::new();
        let mut claimed = Vec::new();
        for process in app.processes.iter().filter(|p| p.exposure.is_some()) {
            let port = match previous.get(&logical_id(&process.process_type)) {
                Some(port) => *port,
                None => match self.ports.get().await {
                    Ok(port) => {
                        claimed.push(port);
                        port
                    }
                    Err(err) => {
                        self.release(&claimed).await;
                        return Err(err);
                    }
                },
            };
            ports.insert(process.process_type.clone(), port);
        }
        Ok((ports, claimed))
    }

    async fn release(&self, ports: &[u16]) {
        for port in ports {
            if let Err(err) = self.ports.put(*port).await {
                warn!(port, error = %err, "Failed to release port");
            }
        }
    }

    /// Change one process' desired instances, keeping the current document.
    #[instrument(skip_all, fields(app_id = %app.id, process_type = %process_type))]
    pub async fn scale(&self, app: &App, process_type: &str, instances: u32) -> SchedulerResult<()> {
        let cancel = self.shutdown.child_token();
        let outcome = self
            .queue
            .update_stack(
                UpdateStackInput {
                    name: self.stack_name(app),
                    template_body: None,
                    use_previous_template: true,
                    parameters: vec![Parameter::new(
                        scale_parameter(&logical_id(process_type)),
                        instances.to_string(),
                    )],
                },
                &cancel,
            )
            .await?;
        debug!(?outcome, instances, "Scaled process");
        Ok(())
    }

    /// Release the stack's ports and delete it.
    #[instrument(skip_all, fields(app_id = %app.id))]
    pub async fn remove(&self, app: &App) -> SchedulerResult<()> {
        let name = self.stack_name(app);
        let Some(stack) = self.describe(&name).await? else {
            debug!(stack = %name, "Stack already removed");
            return Ok(());
        };

        for port in instance_ports(&stack.outputs).into_values() {
            self.ports.put(port).await?;
        }

        match self.stacks.delete_stack(&name).await {
            Ok(()) | Err(BackendError::StackNotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        info!(stack = %name, "Deleted stack");
        Ok(())
    }

    /// Instances of the app's services, found through stack resource metadata.
    #[instrument(skip_all, fields(app_id = %app.id))]
    pub async fn instances(&self, app: &App) -> SchedulerResult<Vec<Instance>> {
        let resources = match self.stacks.describe_stack_resources(&self.stack_name(app)).await {
            Ok(resources) => resources,
            Err(BackendError::StackNotFound(_)) => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        let services: Vec<ServiceRef> = resources
            .iter()
            .filter(|r| r.resource_type == RESOURCE_ECS_SERVICE && !r.physical_id.is_empty())
            .filter_map(|r| {
                let process_type = r.metadata.as_ref()?.get(PROCESS_TYPE_METADATA)?.as_str()?;
                Some(ServiceRef {
                    name: name_from_arn(&r.physical_id).to_string(),
                    process_type: process_type.to_string(),
                })
            })
            .collect();

        list_instances(
            self.orchestrator.as_ref(),
            &self.cache,
            &self.cluster,
            &services,
            &app.id,
        )
        .await
    }

    pub async fn run(&self, app: &App, process: &Process) -> SchedulerResult<()> {
        run_detached(
            self.orchestrator.as_ref(),
            &self.cache,
            &self.cluster,
            app,
            process,
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn stop(&self, instance_id: &str) -> SchedulerResult<()> {
        self.orchestrator.stop_task(&self.cluster, instance_id).await?;
        Ok(())
    }
}
