//! End-to-end behaviour of the direct scheduler against in-memory backends.

use std::collections::BTreeSet;
use std::sync::Arc;

use dockyard_scheduler::backend::dns::ChangeAction;
use dockyard_scheduler::backend::elb::{Scheme, HTTPS_PORT};
use dockyard_scheduler::backend::memory::{
    ElbMutation, MemoryDns, MemoryLoadBalancerApi, MemoryOrchestrator, OrchestratorMutation,
};
use dockyard_scheduler::cache::TaskDefinitionCache;
use dockyard_scheduler::config::{HostedZone, NetworkConfig};
use dockyard_scheduler::direct::{DirectConfig, DirectScheduler};
use dockyard_scheduler::lb::dns::DnsSyncManager;
use dockyard_scheduler::lb::elb::ElbManager;
use dockyard_scheduler::lb::logged::LoggedManager;
use dockyard_scheduler::lb::ports::MemoryPortAllocator;
use dockyard_scheduler::types::{App, Exposure, PortMap, Process};
use dockyard_scheduler::{Scheduler, SchedulerError};

struct Harness {
    orchestrator: Arc<MemoryOrchestrator>,
    elb: Arc<MemoryLoadBalancerApi>,
    dns: Arc<MemoryDns>,
    ports: Arc<MemoryPortAllocator>,
    scheduler: DirectScheduler,
}

impl Harness {
    fn new() -> Self {
        let orchestrator = Arc::new(MemoryOrchestrator::new());
        let elb = Arc::new(MemoryLoadBalancerApi::new());
        let dns = Arc::new(MemoryDns::new());
        let ports = Arc::new(MemoryPortAllocator::new(9000..=9010));

        let manager = LoggedManager::new(
            DnsSyncManager::new(
                ElbManager::new(network(), elb.clone(), ports.clone()).unwrap(),
                dns.clone(),
                HostedZone {
                    id: "Z123".to_string(),
                    name: "dockyard.local".to_string(),
                },
            )
            .unwrap(),
        );
        let scheduler = DirectScheduler::new(
            DirectConfig {
                cluster: "default".to_string(),
                service_role: "ecsServiceRole".to_string(),
            },
            orchestrator.clone(),
            Arc::new(manager),
            Arc::new(TaskDefinitionCache::new()),
        )
        .unwrap();

        Self {
            orchestrator,
            elb,
            dns,
            ports,
            scheduler,
        }
    }

    fn clear(&self) {
        self.orchestrator.clear_mutations();
        self.elb.clear_mutations();
    }
}

fn network() -> NetworkConfig {
    NetworkConfig {
        internal_security_group: "sg-internal".to_string(),
        external_security_group: "sg-external".to_string(),
        internal_subnets: vec!["subnet-a".to_string()],
        external_subnets: vec!["subnet-b".to_string()],
    }
}

fn web(exposure: Option<Exposure>, instances: u32) -> Process {
    Process {
        process_type: "web".to_string(),
        image: "remind101/acme-inc:latest".to_string(),
        command: vec!["acme-inc".to_string(), "server".to_string()],
        instances,
        memory_limit: 128 * 1024 * 1024,
        cpu_shares: 256,
        exposure,
        ..Default::default()
    }
}

fn worker(instances: u32) -> Process {
    Process {
        process_type: "worker".to_string(),
        image: "remind101/acme-inc:latest".to_string(),
        command: vec!["acme-inc".to_string(), "worker".to_string()],
        instances,
        ..Default::default()
    }
}

fn app(name: &str, processes: Vec<Process>) -> App {
    App {
        id: "1234".to_string(),
        name: name.to_string(),
        processes,
    }
}

#[tokio::test]
async fn test_new_internal_app_without_name() {
    let h = Harness::new();
    let process = Process {
        ports: vec![PortMap {
            host: Some(8080),
            container: None,
        }],
        ..web(Some(Exposure::http(false)), 1)
    };
    let app = app("", vec![process]);

    h.scheduler.submit(&app).await.unwrap();

    assert_eq!(
        h.orchestrator.mutations(),
        vec![
            OrchestratorMutation::RegisterTaskDefinition("1234--web".to_string()),
            OrchestratorMutation::CreateService("1234--web".to_string()),
        ]
    );

    let names = h.elb.names();
    assert_eq!(names.len(), 1);
    let description = h.elb.description(&names[0]).unwrap();
    assert_eq!(description.scheme, Scheme::Internal);
    assert_eq!(description.listeners.len(), 1);
    assert_eq!(description.listeners[0].instance_port, 9000);
    assert_eq!(h.ports.taken(), vec![9000]);

    let service = h.orchestrator.service("1234--web").unwrap();
    assert_eq!(service.load_balancers.len(), 1);
    assert_eq!(service.load_balancers[0].load_balancer_name, names[0]);
    assert!(h.dns.changes().is_empty());
}

#[tokio::test]
async fn test_named_web_app_gets_record() {
    let h = Harness::new();
    let app = app("acme-inc", vec![web(Some(Exposure::http(true)), 1)]);

    h.scheduler.submit(&app).await.unwrap();

    let record = h.dns.record("acme-inc.dockyard.local").unwrap();
    let names = h.elb.names();
    assert_eq!(
        record.values,
        vec![h.elb.description(&names[0]).unwrap().dns_name]
    );
    assert_eq!(h.dns.changes()[0].action, ChangeAction::Upsert);
}

#[tokio::test]
async fn test_resubmit_is_idempotent() {
    let h = Harness::new();
    let app = app(
        "acme-inc",
        vec![web(Some(Exposure::https(true, "arn:cert")), 2), worker(1)],
    );
    h.scheduler.submit(&app).await.unwrap();
    h.clear();

    h.scheduler.submit(&app).await.unwrap();

    assert!(h.orchestrator.mutations().is_empty());
    assert!(h.elb.mutations().is_empty());
    assert_eq!(h.elb.names().len(), 1);
}

#[tokio::test]
async fn test_certificate_change_updates_listener() {
    let h = Harness::new();
    let mut app = app("acme-inc", vec![web(Some(Exposure::https(true, "arn:cert-a")), 1)]);
    h.scheduler.submit(&app).await.unwrap();
    h.clear();

    app.processes[0].exposure = Some(Exposure::https(true, "arn:cert-b"));
    h.scheduler.submit(&app).await.unwrap();

    let name = h.elb.names().remove(0);
    assert_eq!(h.elb.mutations(), vec![ElbMutation::SetCertificate(name.clone())]);
    let description = h.elb.description(&name).unwrap();
    assert_eq!(
        description.listener(HTTPS_PORT).unwrap().ssl_certificate_id.as_deref(),
        Some("arn:cert-b")
    );
}

#[tokio::test]
async fn test_removed_process_is_torn_down() {
    let h = Harness::new();
    let full = app("acme-inc", vec![web(Some(Exposure::http(true)), 1), worker(1)]);
    h.scheduler.submit(&full).await.unwrap();
    assert_eq!(h.ports.taken(), vec![9000]);
    h.clear();

    let trimmed = app("acme-inc", vec![worker(1)]);
    h.scheduler.submit(&trimmed).await.unwrap();

    let mutations = h.orchestrator.mutations();
    assert!(mutations.contains(&OrchestratorMutation::UpdateService {
        service: "1234--web".to_string(),
        task_definition: false,
        desired_count: Some(0),
    }));
    assert!(mutations.contains(&OrchestratorMutation::DeleteService("1234--web".to_string())));
    assert!(!h.orchestrator.service("1234--web").unwrap().is_active());

    assert!(h.elb.names().is_empty());
    assert!(h.ports.taken().is_empty());
    assert!(h.dns.record("acme-inc.dockyard.local").is_none());
}

#[tokio::test]
async fn test_exposure_conflict_changes_nothing() {
    let h = Harness::new();
    let mut app = app("acme-inc", vec![web(Some(Exposure::http(false)), 1)]);
    h.scheduler.submit(&app).await.unwrap();
    h.clear();

    app.processes[0].exposure = Some(Exposure::http(true));
    let err = h.scheduler.submit(&app).await.unwrap_err();

    assert!(matches!(err, SchedulerError::ExposureConflict { .. }));
    assert!(h.orchestrator.mutations().is_empty());
    assert!(h.elb.mutations().is_empty());
}

#[tokio::test]
async fn test_dropped_exposure_detaches_balancer() {
    let h = Harness::new();
    h.scheduler
        .submit(&app("acme-inc", vec![web(Some(Exposure::http(true)), 1), worker(1)]))
        .await
        .unwrap();
    assert_eq!(h.elb.names().len(), 1);

    let unexposed = app("acme-inc", vec![web(None, 1), worker(2)]);
    h.scheduler.submit(&unexposed).await.unwrap();

    assert!(h.elb.names().is_empty());
    assert!(h.ports.taken().is_empty());
    assert!(h.dns.record("acme-inc.dockyard.local").is_none());

    let service = h.orchestrator.service("1234--web").unwrap();
    assert!(service.is_active());
    assert!(service.load_balancers.is_empty());
    assert_eq!(h.orchestrator.running_tasks("1234--web"), 1);
    assert_eq!(h.orchestrator.running_tasks("1234--worker"), 2);

    h.clear();
    h.scheduler.submit(&unexposed).await.unwrap();
    assert!(h.orchestrator.mutations().is_empty());
}

#[tokio::test]
async fn test_ports_are_unique_across_processes() {
    let h = Harness::new();
    let processes = ["web", "api", "admin"]
        .into_iter()
        .map(|t| Process {
            process_type: t.to_string(),
            ..web(Some(Exposure::http(false)), 1)
        })
        .collect();
    let app = app("", processes);

    h.scheduler.submit(&app).await.unwrap();

    let ports: BTreeSet<u16> = h
        .elb
        .names()
        .iter()
        .map(|name| h.elb.description(name).unwrap().listeners[0].instance_port)
        .collect();
    assert_eq!(ports.len(), 3);
    assert_eq!(h.ports.taken().len(), 3);
}

#[tokio::test]
async fn test_scale_without_churn() {
    let h = Harness::new();
    let app = app("acme-inc", vec![worker(1)]);
    h.scheduler.submit(&app).await.unwrap();
    assert_eq!(h.orchestrator.running_tasks("1234--worker"), 1);
    h.clear();

    h.scheduler.scale(&app, "worker", 0).await.unwrap();
    assert_eq!(h.orchestrator.running_tasks("1234--worker"), 0);

    h.scheduler.scale(&app, "worker", 3).await.unwrap();
    assert_eq!(h.orchestrator.running_tasks("1234--worker"), 3);

    assert_eq!(
        h.orchestrator.mutations(),
        vec![
            OrchestratorMutation::UpdateService {
                service: "1234--worker".to_string(),
                task_definition: false,
                desired_count: Some(0),
            },
            OrchestratorMutation::UpdateService {
                service: "1234--worker".to_string(),
                task_definition: false,
                desired_count: Some(3),
            },
        ]
    );
    assert_eq!(h.orchestrator.registered_task_definitions(), 1);
}

#[tokio::test]
async fn test_instances_and_runs() {
    let h = Harness::new();
    let app = app("acme-inc", vec![worker(2)]);
    h.scheduler.submit(&app).await.unwrap();

    let one_off = Process {
        process_type: "migrate".to_string(),
        instances: 1,
        ..worker(1)
    };
    Scheduler::run(&h.scheduler, &app, &one_off, None).await.unwrap();

    let instances = h.scheduler.instances(&app).await.unwrap();
    assert_eq!(instances.len(), 3);
    let workers = instances
        .iter()
        .filter(|i| i.process.process_type == "worker")
        .count();
    assert_eq!(workers, 2);

    let run = instances
        .iter()
        .find(|i| i.process.process_type == "migrate")
        .unwrap();
    h.scheduler.stop(&run.id).await.unwrap();
    assert_eq!(h.scheduler.instances(&app).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_remove_app() {
    let h = Harness::new();
    let app = app("acme-inc", vec![web(Some(Exposure::http(true)), 1), worker(1)]);
    h.scheduler.submit(&app).await.unwrap();

    h.scheduler.remove(&app).await.unwrap();

    assert!(h.elb.names().is_empty());
    assert!(h.ports.taken().is_empty());
    assert!(h.scheduler.instances(&app).await.unwrap().is_empty());

    h.scheduler.remove(&app).await.unwrap();
}
