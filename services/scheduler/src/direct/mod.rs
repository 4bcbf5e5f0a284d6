//! Direct scheduler.
//!
//! Reconciles each process against its service, task definition and load
//! balancer through the backend APIs. Every step is idempotent, so a failed
//! `submit` converges when retried.

use std::collections::BTreeSet;
use std::sync::Arc;

use dockyard_reconcile::removed_types;
use tracing::{debug, info, instrument};

use crate::backend::orchestrator::{
    name_from_arn, CreateServiceInput, Service, ServiceLoadBalancer, TaskDefinitionInput,
    UpdateServiceInput,
};
use crate::backend::Orchestrator;
use crate::cache::TaskDefinitionCache;
use crate::error::{SchedulerError, SchedulerResult};
use crate::instances::{list_instances, run_detached, ServiceRef};
use crate::lb::{lookup_tags, reconcile_load_balancer, Balancer, LoadBalancerManager};
use crate::task;
use crate::types::{App, Instance, Process, CONTAINER_PORT};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectConfig {
    pub cluster: String,
    /// Role attached to services that sit behind a balancer.
    pub service_role: String,
}

/// Scheduler that drives services and balancers one process at a time.
pub struct DirectScheduler {
    cluster: String,
    service_role: String,
    orchestrator: Arc<dyn Orchestrator>,
    load_balancers: Arc<dyn LoadBalancerManager>,
    cache: Arc<TaskDefinitionCache>,
}

impl DirectScheduler {
    pub fn new(
        config: DirectConfig,
        orchestrator: Arc<dyn Orchestrator>,
        load_balancers: Arc<dyn LoadBalancerManager>,
        cache: Arc<TaskDefinitionCache>,
    ) -> SchedulerResult<Self> {
        crate::config::require("cluster", &config.cluster)?;
        crate::config::require("service role", &config.service_role)?;
        Ok(Self {
            cluster: config.cluster,
            service_role: config.service_role,
            orchestrator,
            load_balancers,
            cache,
        })
    }

    /// Create or update every process, then remove the ones no longer listed.
    #[instrument(skip_all, fields(app_id = %app.id, processes = app.processes.len()))]
    pub async fn submit(&self, app: &App) -> SchedulerResult<()> {
        let live = self.live_process_types(&app.id).await?;

        for process in &app.processes {
            self.create_process(app, process).await?;
        }

        let removed = removed_types(&live, app.processes.iter().map(|p| p.process_type.clone()));
        for process_type in removed {
            self.remove_process(app, &process_type).await?;
        }
        Ok(())
    }

    /// Converge one process: balancer, task definition, then service.
    #[instrument(skip_all, fields(app_id = %app.id, process_type = %process.process_type))]
    pub async fn create_process(&self, app: &App, process: &Process) -> SchedulerResult<()> {
        let lb = match reconcile_load_balancer(self.load_balancers.as_ref(), app, process).await? {
            Balancer::Attached(lb) => Some(lb),
            Balancer::None => None,
            Balancer::Orphaned(lb) => {
                // A service keeps the balancers it was created with, so it is
                // recreated without one.
                info!(load_balancer = %lb.name, "Detaching balancer from unexposed process");
                self.remove_process(app, &process.process_type).await?;
                None
            }
        };
        let mut process = process.clone();
        process.load_balancer = lb.as_ref().map(|lb| lb.name.clone());
        process.ssl_cert = lb.as_ref().and_then(|lb| lb.ssl_cert.clone());

        let service_name = task::service_name(&app.id, &process.process_type);
        let input = TaskDefinitionInput {
            family: service_name.clone(),
            containers: vec![task::container_definition(
                &process,
                lb.as_ref().map(|lb| lb.instance_port),
            )],
        };

        let existing = self.active_service(&service_name).await?;

        let mut task_definition = None;
        if let Some(service) = &existing {
            let current = self
                .cache
                .get(self.orchestrator.as_ref(), &service.task_definition)
                .await?;
            if current.matches(&input) {
                task_definition = Some(current.arn.clone());
            }
        }
        let task_definition = match task_definition {
            Some(arn) => arn,
            None => {
                let registered = self.orchestrator.register_task_definition(input).await?;
                let registered = self.cache.insert(registered).await;
                debug!(arn = %registered.arn, "Registered task definition");
                registered.arn.clone()
            }
        };

        if let Some(service) = &existing {
            if service.task_definition == task_definition
                && service.desired_count == process.instances
            {
                debug!(service = %service_name, "Service up to date");
                return Ok(());
            }

            let updated = self
                .orchestrator
                .update_service(UpdateServiceInput {
                    cluster: self.cluster.clone(),
                    service: service_name.clone(),
                    task_definition: Some(task_definition.clone()),
                    desired_count: Some(process.instances),
                })
                .await;
            match updated {
                Ok(_) => {
                    info!(service = %service_name, instances = process.instances, "Updated service");
                    return Ok(());
                }
                Err(err) if err.is_service_gone() => {
                    debug!(service = %service_name, "Service vanished, creating it");
                }
                Err(err) => return Err(err.into()),
            }
        }

        let (load_balancers, role) = match &lb {
            Some(lb) => (
                vec![ServiceLoadBalancer {
                    load_balancer_name: lb.name.clone(),
                    container_name: process.process_type.clone(),
                    container_port: CONTAINER_PORT,
                }],
                Some(self.service_role.clone()),
            ),
            None => (Vec::new(), None),
        };

        self.orchestrator
            .create_service(CreateServiceInput {
                cluster: self.cluster.clone(),
                service_name: service_name.clone(),
                task_definition,
                desired_count: process.instances,
                load_balancers,
                role,
            })
            .await?;
        info!(service = %service_name, instances = process.instances, "Created service");
        Ok(())
    }

    /// Scale to zero, delete the service, then destroy its balancer.
    #[instrument(skip_all, fields(app_id = %app.id, process_type = %process_type))]
    pub async fn remove_process(&self, app: &App, process_type: &str) -> SchedulerResult<()> {
        let service_name = task::service_name(&app.id, process_type);

        let scaled = self
            .orchestrator
            .update_service(UpdateServiceInput {
                cluster: self.cluster.clone(),
                service: service_name.clone(),
                task_definition: None,
                desired_count: Some(0),
            })
            .await;
        match scaled {
            Ok(_) => {
                match self
                    .orchestrator
                    .delete_service(&self.cluster, &service_name)
                    .await
                {
                    Ok(()) => info!(service = %service_name, "Deleted service"),
                    Err(err) if err.is_service_gone() => {}
                    Err(err) => return Err(err.into()),
                }
            }
            Err(err) if err.is_service_gone() => {
                debug!(service = %service_name, "Service already gone");
            }
            Err(err) => return Err(err.into()),
        }

        for lb in self
            .load_balancers
            .load_balancers(&lookup_tags(&app.id, process_type))
            .await?
        {
            self.load_balancers.destroy_load_balancer(&lb).await?;
        }
        Ok(())
    }

    /// Set a process' desired instances, leaving its definition alone.
    #[instrument(skip_all, fields(app_id = %app.id, process_type = %process_type))]
    pub async fn scale(&self, app: &App, process_type: &str, instances: u32) -> SchedulerResult<()> {
        let service_name = task::service_name(&app.id, process_type);
        let result = self
            .orchestrator
            .update_service(UpdateServiceInput {
                cluster: self.cluster.clone(),
                service: service_name,
                task_definition: None,
                desired_count: Some(instances),
            })
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if err.is_service_gone() => Err(SchedulerError::ProcessNotFound {
                app_id: app.id.clone(),
                process_type: process_type.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Remove every live process of the app.
    #[instrument(skip_all, fields(app_id = %app.id))]
    pub async fn remove(&self, app: &App) -> SchedulerResult<()> {
        for process_type in self.live_process_types(&app.id).await? {
            self.remove_process(app, &process_type).await?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(app_id = %app.id))]
    pub async fn instances(&self, app: &App) -> SchedulerResult<Vec<Instance>> {
        let services: Vec<ServiceRef> = self
            .live_process_types(&app.id)
            .await?
            .into_iter()
            .map(|process_type| ServiceRef {
                name: task::service_name(&app.id, &process_type),
                process_type,
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

    async fn active_service(&self, name: &str) -> SchedulerResult<Option<Service>> {
        let services = self
            .orchestrator
            .describe_services(&self.cluster, &[name.to_string()])
            .await?;
        Ok(services
            .into_iter()
            .find(|s| s.name == name && s.is_active()))
    }

    /// Process types with a live service, recovered from service names.
    async fn live_process_types(&self, app_id: &str) -> SchedulerResult<BTreeSet<String>> {
        let mut types = BTreeSet::new();
        let mut next_token = None;
        loop {
            let page = self
                .orchestrator
                .list_services(&self.cluster, next_token)
                .await?;
            types.extend(page.items.iter().filter_map(|arn| {
                task::process_type_from_service(app_id, name_from_arn(arn)).map(str::to_string)
            }));
            match page.next_token {
                Some(token) => next_token = Some(token),
                None => return Ok(types),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryOrchestrator, OrchestratorMutation};
    use crate::lb::logged::LoggedManager;

    /// Manager for apps without exposed processes.
    struct NoBalancers;

    #[async_trait::async_trait]
    impl LoadBalancerManager for NoBalancers {
        async fn create_load_balancer(
            &self,
            _: crate::lb::CreateLoadBalancerOpts,
        ) -> SchedulerResult<crate::lb::LoadBalancer> {
            Err(SchedulerError::Config("no balancers here".to_string()))
        }

        async fn update_load_balancer(
            &self,
            _: crate::lb::UpdateLoadBalancerOpts,
        ) -> SchedulerResult<()> {
            Ok(())
        }

        async fn destroy_load_balancer(&self, _: &crate::lb::LoadBalancer) -> SchedulerResult<()> {
            Ok(())
        }

        async fn load_balancers(
            &self,
            _: &std::collections::BTreeMap<String, String>,
        ) -> SchedulerResult<Vec<crate::lb::LoadBalancer>> {
            Ok(vec![])
        }
    }

    fn scheduler(orchestrator: Arc<MemoryOrchestrator>) -> DirectScheduler {
        DirectScheduler::new(
            DirectConfig {
                cluster: "default".to_string(),
                service_role: "ecsServiceRole".to_string(),
            },
            orchestrator,
            Arc::new(LoggedManager::new(NoBalancers)),
            Arc::new(TaskDefinitionCache::new()),
        )
        .unwrap()
    }

    fn app() -> App {
        App {
            id: "1234".to_string(),
            name: "acme-inc".to_string(),
            processes: vec![Process {
                process_type: "worker".to_string(),
                image: "remind101/acme-inc:latest".to_string(),
                command: vec!["acme-inc".to_string(), "worker".to_string()],
                instances: 1,
                ..Default::default()
            }],
        }
    }

    #[test]
    fn test_requires_service_role() {
        let result = DirectScheduler::new(
            DirectConfig {
                cluster: "default".to_string(),
                service_role: String::new(),
            },
            Arc::new(MemoryOrchestrator::new()),
            Arc::new(NoBalancers),
            Arc::new(TaskDefinitionCache::new()),
        );
        assert!(matches!(result, Err(SchedulerError::Config(_))));
    }

    #[tokio::test]
    async fn test_create_then_update_image() {
        let orchestrator = Arc::new(MemoryOrchestrator::new());
        let scheduler = scheduler(orchestrator.clone());
        let mut app = app();

        scheduler.submit(&app).await.unwrap();
        assert_eq!(
            orchestrator.mutations(),
            vec![
                OrchestratorMutation::RegisterTaskDefinition("1234--worker".to_string()),
                OrchestratorMutation::CreateService("1234--worker".to_string()),
            ]
        );

        orchestrator.clear_mutations();
        app.processes[0].image = "remind101/acme-inc:v2".to_string();
        scheduler.submit(&app).await.unwrap();
        assert_eq!(
            orchestrator.mutations(),
            vec![
                OrchestratorMutation::RegisterTaskDefinition("1234--worker".to_string()),
                OrchestratorMutation::UpdateService {
                    service: "1234--worker".to_string(),
                    task_definition: true,
                    desired_count: Some(1),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_scale_missing_process() {
        let orchestrator = Arc::new(MemoryOrchestrator::new());
        let scheduler = scheduler(orchestrator);

        let result = scheduler.scale(&app(), "worker", 2).await;
        assert!(matches!(result, Err(SchedulerError::ProcessNotFound { .. })));
    }

    #[tokio::test]
    async fn test_remove_app() {
        let orchestrator = Arc::new(MemoryOrchestrator::new());
        let scheduler = scheduler(orchestrator.clone());
        scheduler.submit(&app()).await.unwrap();

        scheduler.remove(&app()).await.unwrap();

        let service = orchestrator.service("1234--worker").unwrap();
        assert!(!service.is_active());
        assert_eq!(service.desired_count, 0);
        assert!(scheduler.instances(&app()).await.unwrap().is_empty());
    }
}
