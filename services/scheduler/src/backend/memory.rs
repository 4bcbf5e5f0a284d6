//! In-memory backends for testing and local development.
//!
//! Each fake keeps enough of the real service's rules to catch misuse: the
//! orchestrator rejects a role without balancers and deleting a scaled
//! service, the stack API refuses an update while another is in progress,
//! and so on. Mutating calls are recorded so tests can assert on exactly
//! what was sent.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::debug;

use super::dns::{Change, ChangeAction, RecordSet};
use super::elb::{
    CreateLoadBalancerInput, DescribeLoadBalancersInput, Listener, LoadBalancerAttributes,
    LoadBalancerDescription, Scheme, MAX_DESCRIBE_TAGS,
};
use super::orchestrator::{
    name_from_arn, CreateServiceInput, ListTasksInput, RunTaskInput, Service, ServiceLoadBalancer,
    Task, TaskDefinition, TaskDefinitionInput, UpdateServiceInput, MAX_DESCRIBE_SERVICES,
    MAX_DESCRIBE_TASKS, SERVICE_ACTIVE, SERVICE_INACTIVE, TASK_RUNNING, TASK_STOPPED,
};
use super::stack::{
    CreateStackInput, Parameter, Stack, StackResource, UpdateStackInput, RESOURCE_ECS_SERVICE,
    RESOURCE_ECS_TASK_DEFINITION,
};
use super::{
    BackendError, BackendResult, DnsApi, LoadBalancerApi, Orchestrator, Page, StackApi,
};
use crate::stack::template::CfnContainerDefinition;

const ARN_PREFIX: &str = "arn:aws:ecs:us-east-1:000000000000";
const DEFAULT_PAGE_SIZE: usize = 100;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn paginate<T: Clone>(
    items: &[T],
    token: Option<&str>,
    page_size: usize,
) -> BackendResult<Page<T>> {
    let start = match token {
        Some(token) => token
            .parse::<usize>()
            .map_err(|_| BackendError::api("InvalidParameterException", "invalid next token"))?,
        None => 0,
    };
    let end = start.saturating_add(page_size.max(1)).min(items.len());
    Ok(Page {
        items: items.get(start..end).map(<[T]>::to_vec).unwrap_or_default(),
        next_token: (end < items.len()).then(|| end.to_string()),
    })
}

/// A mutating orchestrator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorMutation {
    RegisterTaskDefinition(String),
    CreateService(String),
    UpdateService {
        service: String,
        /// A new task definition was supplied.
        task_definition: bool,
        desired_count: Option<u32>,
    },
    DeleteService(String),
    RunTask(String),
    StopTask(String),
}

#[derive(Debug, Clone)]
struct MemoryTask {
    task: Task,
    service: Option<String>,
}

#[derive(Debug, Default)]
struct OrchestratorState {
    task_definitions: BTreeMap<String, TaskDefinition>,
    revisions: BTreeMap<String, u32>,
    services: BTreeMap<String, Service>,
    tasks: BTreeMap<String, MemoryTask>,
    task_counter: u64,
    mutations: Vec<OrchestratorMutation>,
    task_definition_lookups: u64,
}

impl OrchestratorState {
    fn start_task(
        &mut self,
        cluster: &str,
        task_definition: &str,
        started_by: Option<String>,
        service: Option<String>,
    ) -> Task {
        self.task_counter += 1;
        let now = Utc::now();
        let task = Task {
            arn: format!("{ARN_PREFIX}:task/{cluster}/{:032x}", self.task_counter),
            task_definition_arn: task_definition.to_string(),
            last_status: TASK_RUNNING.to_string(),
            started_by,
            created_at: Some(now),
            started_at: Some(now),
            stopped_at: None,
        };
        self.tasks.insert(
            task.arn.clone(),
            MemoryTask {
                task: task.clone(),
                service,
            },
        );
        task
    }

    /// Bring a service's tasks to its desired count and definition.
    fn converge(&mut self, cluster: &str, name: &str) {
        let Some(service) = self.services.get(name).cloned() else {
            return;
        };
        let now = Utc::now();
        let mut running = 0;
        for entry in self.tasks.values_mut() {
            if entry.service.as_deref() != Some(name) || entry.task.last_status == TASK_STOPPED {
                continue;
            }
            if entry.task.task_definition_arn != service.task_definition
                || running >= service.desired_count
            {
                entry.task.last_status = TASK_STOPPED.to_string();
                entry.task.stopped_at = Some(now);
            } else {
                running += 1;
            }
        }
        while running < service.desired_count {
            self.start_task(
                cluster,
                &service.task_definition,
                Some(format!("ecs-svc/{name}")),
                Some(name.to_string()),
            );
            running += 1;
        }
    }

    fn require_task_definition(&self, arn: &str) -> BackendResult<()> {
        if self.task_definitions.contains_key(arn) {
            Ok(())
        } else {
            Err(BackendError::api(
                "ClientException",
                format!("Unable to describe task definition {arn}"),
            ))
        }
    }
}

/// Container orchestrator kept in memory.
///
/// Service tasks converge synchronously on every create, update and delete.
#[derive(Debug)]
pub struct MemoryOrchestrator {
    state: Mutex<OrchestratorState>,
    page_size: usize,
}

impl Default for MemoryOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryOrchestrator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(OrchestratorState::default()),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Page size for service and task listings.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn mutations(&self) -> Vec<OrchestratorMutation> {
        lock(&self.state).mutations.clone()
    }

    pub fn clear_mutations(&self) {
        lock(&self.state).mutations.clear();
    }

    pub fn service(&self, name: &str) -> Option<Service> {
        lock(&self.state).services.get(name).cloned()
    }

    pub fn task_definition(&self, arn: &str) -> Option<TaskDefinition> {
        lock(&self.state).task_definitions.get(arn).cloned()
    }

    /// Number of `describe_task_definition` calls served.
    pub fn task_definition_lookups(&self) -> u64 {
        lock(&self.state).task_definition_lookups
    }

    pub fn registered_task_definitions(&self) -> usize {
        lock(&self.state).task_definitions.len()
    }

    /// Tasks of a service that have not stopped.
    pub fn running_tasks(&self, service: &str) -> usize {
        lock(&self.state)
            .tasks
            .values()
            .filter(|t| t.service.as_deref() == Some(service) && t.task.last_status != TASK_STOPPED)
            .count()
    }
}

#[async_trait]
impl Orchestrator for MemoryOrchestrator {
    async fn register_task_definition(
        &self,
        input: TaskDefinitionInput,
    ) -> BackendResult<TaskDefinition> {
        let mut state = lock(&self.state);
        let revision = state.revisions.entry(input.family.clone()).or_insert(0);
        *revision += 1;
        let definition = TaskDefinition {
            arn: format!("{ARN_PREFIX}:task-definition/{}:{}", input.family, revision),
            family: input.family.clone(),
            revision: *revision,
            containers: input.containers,
        };
        state
            .task_definitions
            .insert(definition.arn.clone(), definition.clone());
        state
            .mutations
            .push(OrchestratorMutation::RegisterTaskDefinition(input.family));
        Ok(definition)
    }

    async fn describe_task_definition(&self, arn: &str) -> BackendResult<TaskDefinition> {
        let mut state = lock(&self.state);
        state.task_definition_lookups += 1;
        state.require_task_definition(arn)?;
        Ok(state.task_definitions[arn].clone())
    }

    async fn create_service(&self, input: CreateServiceInput) -> BackendResult<Service> {
        let mut state = lock(&self.state);
        if state
            .services
            .get(&input.service_name)
            .is_some_and(Service::is_active)
        {
            return Err(BackendError::api(
                "InvalidParameterException",
                "Creation of service was not idempotent.",
            ));
        }
        if input.role.is_some() && input.load_balancers.is_empty() {
            return Err(BackendError::api(
                "InvalidParameterException",
                "You cannot specify an IAM role for services that require a service linked role.",
            ));
        }
        if input.role.is_none() && !input.load_balancers.is_empty() {
            return Err(BackendError::api(
                "InvalidParameterException",
                "A role is required for services with load balancers.",
            ));
        }
        state.require_task_definition(&input.task_definition)?;

        let service = Service {
            arn: format!(
                "{ARN_PREFIX}:service/{}/{}",
                input.cluster, input.service_name
            ),
            name: input.service_name.clone(),
            status: SERVICE_ACTIVE.to_string(),
            task_definition: input.task_definition,
            desired_count: input.desired_count,
            load_balancers: input.load_balancers,
        };
        state
            .services
            .insert(service.name.clone(), service.clone());
        state
            .mutations
            .push(OrchestratorMutation::CreateService(service.name.clone()));
        state.converge(&input.cluster, &service.name);
        Ok(service)
    }

    async fn update_service(&self, input: UpdateServiceInput) -> BackendResult<Service> {
        let mut state = lock(&self.state);
        let name = name_from_arn(&input.service).to_string();
        match state.services.get(&name) {
            None => return Err(BackendError::ServiceNotFound(name)),
            Some(service) if !service.is_active() => {
                return Err(BackendError::ServiceNotActive(name))
            }
            Some(_) => {}
        }
        if let Some(arn) = &input.task_definition {
            state.require_task_definition(arn)?;
        }

        let service = {
            let Some(service) = state.services.get_mut(&name) else {
                return Err(BackendError::ServiceNotFound(name));
            };
            if let Some(arn) = &input.task_definition {
                service.task_definition = arn.clone();
            }
            if let Some(count) = input.desired_count {
                service.desired_count = count;
            }
            service.clone()
        };
        state.mutations.push(OrchestratorMutation::UpdateService {
            service: name.clone(),
            task_definition: input.task_definition.is_some(),
            desired_count: input.desired_count,
        });
        state.converge(&input.cluster, &name);
        Ok(service)
    }

    async fn delete_service(&self, cluster: &str, service: &str) -> BackendResult<()> {
        let mut state = lock(&self.state);
        let name = name_from_arn(service).to_string();
        {
            let Some(existing) = state.services.get_mut(&name) else {
                return Err(BackendError::ServiceNotFound(name));
            };
            if !existing.is_active() {
                return Err(BackendError::ServiceNotActive(name));
            }
            if existing.desired_count > 0 {
                return Err(BackendError::api(
                    "InvalidParameterException",
                    "The service cannot be stopped while it is scaled above 0.",
                ));
            }
            existing.status = SERVICE_INACTIVE.to_string();
        }
        state
            .mutations
            .push(OrchestratorMutation::DeleteService(name.clone()));
        state.converge(cluster, &name);
        Ok(())
    }

    async fn list_services(
        &self,
        _cluster: &str,
        next_token: Option<String>,
    ) -> BackendResult<Page<String>> {
        let state = lock(&self.state);
        let arns: Vec<String> = state
            .services
            .values()
            .filter(|s| s.is_active())
            .map(|s| s.arn.clone())
            .collect();
        paginate(&arns, next_token.as_deref(), self.page_size)
    }

    async fn describe_services(
        &self,
        _cluster: &str,
        services: &[String],
    ) -> BackendResult<Vec<Service>> {
        if services.len() > MAX_DESCRIBE_SERVICES {
            return Err(BackendError::api(
                "InvalidParameterException",
                format!("at most {MAX_DESCRIBE_SERVICES} services per describe"),
            ));
        }
        let state = lock(&self.state);
        Ok(services
            .iter()
            .filter_map(|s| state.services.get(name_from_arn(s)).cloned())
            .collect())
    }

    async fn list_tasks(&self, input: ListTasksInput) -> BackendResult<Page<String>> {
        let state = lock(&self.state);
        let arns: Vec<String> = state
            .tasks
            .values()
            .filter(|t| t.task.last_status != TASK_STOPPED)
            .filter(|t| {
                input
                    .service_name
                    .as_ref()
                    .is_none_or(|name| t.service.as_deref() == Some(name_from_arn(name)))
            })
            .filter(|t| {
                input
                    .started_by
                    .as_ref()
                    .is_none_or(|by| t.task.started_by.as_ref() == Some(by))
            })
            .map(|t| t.task.arn.clone())
            .collect();
        paginate(&arns, input.next_token.as_deref(), self.page_size)
    }

    async fn describe_tasks(&self, _cluster: &str, tasks: &[String]) -> BackendResult<Vec<Task>> {
        if tasks.len() > MAX_DESCRIBE_TASKS {
            return Err(BackendError::api(
                "InvalidParameterException",
                format!("at most {MAX_DESCRIBE_TASKS} tasks per describe"),
            ));
        }
        let state = lock(&self.state);
        Ok(tasks
            .iter()
            .filter_map(|arn| state.tasks.get(arn).map(|t| t.task.clone()))
            .collect())
    }

    async fn run_task(&self, input: RunTaskInput) -> BackendResult<Vec<Task>> {
        let mut state = lock(&self.state);
        state.require_task_definition(&input.task_definition)?;
        let family = state.task_definitions[&input.task_definition].family.clone();
        let tasks = (0..input.count)
            .map(|_| {
                state.start_task(
                    &input.cluster,
                    &input.task_definition,
                    input.started_by.clone(),
                    None,
                )
            })
            .collect();
        state.mutations.push(OrchestratorMutation::RunTask(family));
        Ok(tasks)
    }

    async fn stop_task(&self, _cluster: &str, task: &str) -> BackendResult<()> {
        let mut state = lock(&self.state);
        let id = name_from_arn(task).to_string();
        let Some(entry) = state
            .tasks
            .values_mut()
            .find(|t| name_from_arn(&t.task.arn) == id)
        else {
            return Err(BackendError::TaskNotFound(id));
        };
        if entry.task.last_status == TASK_STOPPED {
            return Ok(());
        }
        entry.task.last_status = TASK_STOPPED.to_string();
        entry.task.stopped_at = Some(Utc::now());
        state.mutations.push(OrchestratorMutation::StopTask(id));
        Ok(())
    }
}

/// A mutating load balancer call, by balancer name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElbMutation {
    Create(String),
    ModifyAttributes(String),
    CreateListeners(String),
    DeleteListeners(String),
    SetCertificate(String),
    Delete(String),
}

#[derive(Debug, Clone)]
struct Balancer {
    description: LoadBalancerDescription,
    tags: BTreeMap<String, String>,
    attributes: Option<LoadBalancerAttributes>,
}

#[derive(Debug, Default)]
struct ElbState {
    balancers: BTreeMap<String, Balancer>,
    mutations: Vec<ElbMutation>,
    fail_next_create: Option<BackendError>,
}

impl ElbState {
    fn balancer(&mut self, name: &str) -> BackendResult<&mut Balancer> {
        self.balancers
            .get_mut(name)
            .ok_or_else(|| BackendError::LoadBalancerNotFound(name.to_string()))
    }
}

/// Load balancer API kept in memory.
#[derive(Debug)]
pub struct MemoryLoadBalancerApi {
    state: Mutex<ElbState>,
    page_size: usize,
}

impl Default for MemoryLoadBalancerApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLoadBalancerApi {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ElbState::default()),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Make the next create fail with `err`.
    pub fn fail_next_create(&self, err: BackendError) {
        lock(&self.state).fail_next_create = Some(err);
    }

    pub fn description(&self, name: &str) -> Option<LoadBalancerDescription> {
        lock(&self.state)
            .balancers
            .get(name)
            .map(|b| b.description.clone())
    }

    pub fn attributes(&self, name: &str) -> Option<LoadBalancerAttributes> {
        lock(&self.state)
            .balancers
            .get(name)
            .and_then(|b| b.attributes)
    }

    pub fn names(&self) -> Vec<String> {
        lock(&self.state).balancers.keys().cloned().collect()
    }

    pub fn mutations(&self) -> Vec<ElbMutation> {
        lock(&self.state).mutations.clone()
    }

    pub fn clear_mutations(&self) {
        lock(&self.state).mutations.clear();
    }
}

#[async_trait]
impl LoadBalancerApi for MemoryLoadBalancerApi {
    async fn create_load_balancer(&self, input: CreateLoadBalancerInput) -> BackendResult<String> {
        let mut state = lock(&self.state);
        if let Some(err) = state.fail_next_create.take() {
            return Err(err);
        }
        if state.balancers.contains_key(&input.name) {
            return Err(BackendError::api(
                "DuplicateLoadBalancerName",
                format!("load balancer {} already exists", input.name),
            ));
        }

        let dns_name = match input.scheme {
            Scheme::Internal => format!("internal-{}-1.us-east-1.elb.amazonaws.com", input.name),
            Scheme::InternetFacing => format!("{}-1.us-east-1.elb.amazonaws.com", input.name),
        };
        state.balancers.insert(
            input.name.clone(),
            Balancer {
                description: LoadBalancerDescription {
                    name: input.name.clone(),
                    dns_name: dns_name.clone(),
                    scheme: input.scheme,
                    listeners: input.listeners,
                },
                tags: input.tags,
                attributes: None,
            },
        );
        state.mutations.push(ElbMutation::Create(input.name));
        Ok(dns_name)
    }

    async fn modify_load_balancer_attributes(
        &self,
        name: &str,
        attributes: LoadBalancerAttributes,
    ) -> BackendResult<()> {
        let mut state = lock(&self.state);
        state.balancer(name)?.attributes = Some(attributes);
        state
            .mutations
            .push(ElbMutation::ModifyAttributes(name.to_string()));
        Ok(())
    }

    async fn create_listeners(&self, name: &str, listeners: Vec<Listener>) -> BackendResult<()> {
        let mut state = lock(&self.state);
        let balancer = state.balancer(name)?;
        for listener in listeners {
            if balancer
                .description
                .listener(listener.load_balancer_port)
                .is_some()
            {
                return Err(BackendError::api(
                    "DuplicateListener",
                    format!("listener on port {} exists", listener.load_balancer_port),
                ));
            }
            balancer.description.listeners.push(listener);
        }
        state
            .mutations
            .push(ElbMutation::CreateListeners(name.to_string()));
        Ok(())
    }

    async fn delete_listeners(&self, name: &str, ports: Vec<u16>) -> BackendResult<()> {
        let mut state = lock(&self.state);
        state
            .balancer(name)?
            .description
            .listeners
            .retain(|l| !ports.contains(&l.load_balancer_port));
        state
            .mutations
            .push(ElbMutation::DeleteListeners(name.to_string()));
        Ok(())
    }

    async fn set_listener_certificate(
        &self,
        name: &str,
        port: u16,
        certificate: &str,
    ) -> BackendResult<()> {
        let mut state = lock(&self.state);
        let listener = state
            .balancer(name)?
            .description
            .listeners
            .iter_mut()
            .find(|l| l.load_balancer_port == port)
            .ok_or_else(|| {
                BackendError::api("ListenerNotFound", format!("no listener on port {port}"))
            })?;
        listener.ssl_certificate_id = Some(certificate.to_string());
        state
            .mutations
            .push(ElbMutation::SetCertificate(name.to_string()));
        Ok(())
    }

    async fn delete_load_balancer(&self, name: &str) -> BackendResult<()> {
        let mut state = lock(&self.state);
        state.balancers.remove(name);
        state.mutations.push(ElbMutation::Delete(name.to_string()));
        Ok(())
    }

    async fn describe_load_balancers(
        &self,
        input: DescribeLoadBalancersInput,
    ) -> BackendResult<Page<LoadBalancerDescription>> {
        let state = lock(&self.state);
        if !input.names.is_empty() {
            let descriptions = input
                .names
                .iter()
                .map(|name| {
                    state
                        .balancers
                        .get(name)
                        .map(|b| b.description.clone())
                        .ok_or_else(|| BackendError::LoadBalancerNotFound(name.clone()))
                })
                .collect::<BackendResult<Vec<_>>>()?;
            return Ok(Page::last(descriptions));
        }

        let all: Vec<LoadBalancerDescription> = state
            .balancers
            .values()
            .map(|b| b.description.clone())
            .collect();
        paginate(&all, input.marker.as_deref(), self.page_size)
    }

    async fn describe_tags(
        &self,
        names: &[String],
    ) -> BackendResult<BTreeMap<String, BTreeMap<String, String>>> {
        if names.len() > MAX_DESCRIBE_TAGS {
            return Err(BackendError::api(
                "ValidationError",
                format!("at most {MAX_DESCRIBE_TAGS} load balancers per tag describe"),
            ));
        }
        let state = lock(&self.state);
        Ok(names
            .iter()
            .filter_map(|name| {
                state
                    .balancers
                    .get(name)
                    .map(|b| (name.clone(), b.tags.clone()))
            })
            .collect())
    }
}

#[derive(Debug, Default)]
struct DnsState {
    records: BTreeMap<(String, String), RecordSet>,
    changes: Vec<Change>,
}

/// Hosted zones kept in memory.
#[derive(Debug, Default)]
pub struct MemoryDns {
    state: Mutex<DnsState>,
}

impl MemoryDns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record by fully qualified name, in any zone.
    pub fn record(&self, name: &str) -> Option<RecordSet> {
        lock(&self.state)
            .records
            .iter()
            .find(|((_, record_name), _)| record_name == name)
            .map(|(_, record)| record.clone())
    }

    /// Applied changes, oldest first.
    pub fn changes(&self) -> Vec<Change> {
        lock(&self.state).changes.clone()
    }
}

#[async_trait]
impl DnsApi for MemoryDns {
    async fn change_record(&self, zone_id: &str, change: Change) -> BackendResult<()> {
        let mut state = lock(&self.state);
        let key = (zone_id.to_string(), change.record.name.clone());
        match change.action {
            ChangeAction::Upsert => {
                state.records.insert(key, change.record.clone());
            }
            ChangeAction::Delete => {
                if state.records.remove(&key).is_none() {
                    return Err(BackendError::RecordNotFound(change.record.name));
                }
            }
        }
        state.changes.push(change);
        Ok(())
    }
}

/// An update the stack API accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedUpdate {
    pub stack: String,
    pub template_body: String,
    /// Resolved parameter values.
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
struct StackRecord {
    status: String,
    template_body: String,
    parameters: BTreeMap<String, String>,
    outputs: BTreeMap<String, String>,
    /// Outputs of the document in flight, visible once it completes.
    pending_outputs: Option<BTreeMap<String, String>>,
    resources: Vec<StackResource>,
}

impl StackRecord {
    fn settle(&mut self, from: &str, to: &str) {
        if self.status == from {
            self.status = to.to_string();
            if let Some(outputs) = self.pending_outputs.take() {
                self.outputs = outputs;
            }
        }
    }
}

#[derive(Debug, Default)]
struct StackState {
    stacks: BTreeMap<String, StackRecord>,
    updates: Vec<AppliedUpdate>,
}

/// Stack API kept in memory.
///
/// With an orchestrator attached, task definitions and services in the
/// document are materialized there, named `<stack>-<logical id>`.
#[derive(Debug, Default)]
pub struct MemoryStackApi {
    state: Mutex<StackState>,
    orchestrator: Option<Arc<MemoryOrchestrator>>,
    create_gate: Option<Arc<Semaphore>>,
    update_gate: Option<Arc<Semaphore>>,
}

impl MemoryStackApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_orchestrator(mut self, orchestrator: Arc<MemoryOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    /// Hold `wait_until_create_complete` until a permit is available.
    pub fn with_create_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.create_gate = Some(gate);
        self
    }

    /// Hold `wait_until_update_complete` until a permit is available.
    pub fn with_update_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.update_gate = Some(gate);
        self
    }

    /// Accepted updates, oldest first.
    pub fn updates(&self) -> Vec<AppliedUpdate> {
        lock(&self.state).updates.clone()
    }

    pub fn stack(&self, name: &str) -> Option<Stack> {
        lock(&self.state).stacks.get(name).map(|r| to_stack(name, r))
    }

    pub fn template_body(&self, name: &str) -> Option<String> {
        lock(&self.state)
            .stacks
            .get(name)
            .map(|r| r.template_body.clone())
    }

    /// Force a stack status.
    pub fn set_status(&self, name: &str, status: &str) {
        if let Some(record) = lock(&self.state).stacks.get_mut(name) {
            record.status = status.to_string();
        }
    }

    async fn materialize(
        &self,
        stack: &str,
        document: &Value,
        parameters: &BTreeMap<String, String>,
        previous: &[StackResource],
    ) -> BackendResult<Vec<StackResource>> {
        let empty = serde_json::Map::new();
        let declared = document
            .get("Resources")
            .and_then(Value::as_object)
            .unwrap_or(&empty);

        let mut resources = Vec::new();
        let mut task_definitions: BTreeMap<String, String> = BTreeMap::new();

        for (logical_id, resource) in declared {
            let resource_type = resource["Type"].as_str().unwrap_or_default();
            if resource_type != RESOURCE_ECS_TASK_DEFINITION {
                continue;
            }
            let physical_id = match &self.orchestrator {
                Some(orchestrator) => {
                    let input = task_definition_input(&resource["Properties"])?;
                    let reused = previous
                        .iter()
                        .find(|r| &r.logical_id == logical_id)
                        .and_then(|r| orchestrator.task_definition(&r.physical_id))
                        .filter(|td| td.matches(&input));
                    match reused {
                        Some(td) => td.arn,
                        None => orchestrator.register_task_definition(input).await?.arn,
                    }
                }
                None => format!("{stack}-{logical_id}"),
            };
            task_definitions.insert(logical_id.clone(), physical_id.clone());
            resources.push(stack_resource(logical_id, resource, physical_id));
        }

        for (logical_id, resource) in declared {
            let resource_type = resource["Type"].as_str().unwrap_or_default();
            if resource_type == RESOURCE_ECS_TASK_DEFINITION {
                continue;
            }
            let physical_id = match (&self.orchestrator, resource_type) {
                (Some(orchestrator), RESOURCE_ECS_SERVICE) => {
                    self.apply_service(
                        orchestrator,
                        stack,
                        logical_id,
                        &resource["Properties"],
                        parameters,
                        &task_definitions,
                    )
                    .await?
                }
                (None, RESOURCE_ECS_SERVICE) => {
                    format!("{ARN_PREFIX}:service/default/{stack}-{logical_id}")
                }
                _ => format!("{stack}-{logical_id}"),
            };
            resources.push(stack_resource(logical_id, resource, physical_id));
        }

        if let Some(orchestrator) = &self.orchestrator {
            for gone in previous.iter().filter(|r| {
                r.resource_type == RESOURCE_ECS_SERVICE && !declared.contains_key(&r.logical_id)
            }) {
                delete_service(orchestrator, &gone.physical_id).await?;
            }
        }

        Ok(resources)
    }

    async fn apply_service(
        &self,
        orchestrator: &MemoryOrchestrator,
        stack: &str,
        logical_id: &str,
        properties: &Value,
        parameters: &BTreeMap<String, String>,
        task_definitions: &BTreeMap<String, String>,
    ) -> BackendResult<String> {
        let cluster = properties["Cluster"].as_str().unwrap_or("default").to_string();
        let desired_count = resolve(&properties["DesiredCount"], parameters)
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| validation(format!("{logical_id}: DesiredCount is not a number")))?;
        let task_definition = properties["TaskDefinition"]["Ref"]
            .as_str()
            .and_then(|r| task_definitions.get(r))
            .cloned()
            .ok_or_else(|| validation(format!("{logical_id}: unresolved TaskDefinition")))?;
        let name = format!("{stack}-{logical_id}");

        if orchestrator.service(&name).is_some_and(|s| s.is_active()) {
            let service = orchestrator
                .update_service(UpdateServiceInput {
                    cluster,
                    service: name,
                    task_definition: Some(task_definition),
                    desired_count: Some(desired_count),
                })
                .await?;
            return Ok(service.arn);
        }

        let load_balancers = properties["LoadBalancers"]
            .as_array()
            .map(|lbs| {
                lbs.iter()
                    .map(|lb| ServiceLoadBalancer {
                        load_balancer_name: format!(
                            "{stack}-{}",
                            lb["LoadBalancerName"]["Ref"].as_str().unwrap_or_default()
                        ),
                        container_name: lb["ContainerName"].as_str().unwrap_or_default().to_string(),
                        container_port: lb["ContainerPort"]
                            .as_u64()
                            .and_then(|p| u16::try_from(p).ok())
                            .unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let service = orchestrator
            .create_service(CreateServiceInput {
                cluster,
                service_name: name,
                task_definition,
                desired_count,
                load_balancers,
                role: properties["Role"].as_str().map(str::to_string),
            })
            .await?;
        Ok(service.arn)
    }
}

fn validation(message: impl Into<String>) -> BackendError {
    BackendError::api("ValidationError", message)
}

fn to_stack(name: &str, record: &StackRecord) -> Stack {
    Stack {
        name: name.to_string(),
        status: record.status.clone(),
        parameters: record
            .parameters
            .iter()
            .map(|(k, v)| Parameter::new(k.clone(), v.clone()))
            .collect(),
        outputs: record.outputs.clone(),
    }
}

fn stack_resource(logical_id: &str, resource: &Value, physical_id: String) -> StackResource {
    StackResource {
        logical_id: logical_id.to_string(),
        physical_id,
        resource_type: resource["Type"].as_str().unwrap_or_default().to_string(),
        metadata: resource.get("Metadata").cloned(),
    }
}

fn task_definition_input(properties: &Value) -> BackendResult<TaskDefinitionInput> {
    let family = properties["Family"]
        .as_str()
        .ok_or_else(|| validation("task definition without Family"))?
        .to_string();
    let containers: Vec<CfnContainerDefinition> =
        serde_json::from_value(properties["ContainerDefinitions"].clone())
            .map_err(|e| validation(format!("ContainerDefinitions: {e}")))?;
    Ok(TaskDefinitionInput {
        family,
        containers: containers.into_iter().map(Into::into).collect(),
    })
}

async fn delete_service(orchestrator: &MemoryOrchestrator, arn: &str) -> BackendResult<()> {
    let scaled = orchestrator
        .update_service(UpdateServiceInput {
            cluster: "default".to_string(),
            service: arn.to_string(),
            task_definition: None,
            desired_count: Some(0),
        })
        .await;
    match scaled {
        Ok(_) => match orchestrator.delete_service("default", arn).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_service_gone() => Ok(()),
            Err(err) => Err(err),
        },
        Err(err) if err.is_service_gone() => Ok(()),
        Err(err) => Err(err),
    }
}

/// Resolve a literal or a `{"Ref": parameter}` to a string.
fn resolve(value: &Value, parameters: &BTreeMap<String, String>) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => map
            .get("Ref")
            .and_then(Value::as_str)
            .and_then(|name| parameters.get(name).cloned()),
        _ => None,
    }
}

fn parse_document(body: &str) -> BackendResult<Value> {
    serde_json::from_str(body).map_err(|e| validation(format!("Template format error: {e}")))
}

/// Every declared parameter's value after applying defaults and keep markers.
fn resolve_parameters(
    document: &Value,
    supplied: &[Parameter],
    previous: Option<&BTreeMap<String, String>>,
) -> BackendResult<BTreeMap<String, String>> {
    let empty = serde_json::Map::new();
    let declared = document
        .get("Parameters")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    if let Some(unknown) = supplied.iter().find(|p| !declared.contains_key(&p.key)) {
        return Err(validation(format!(
            "Parameters: [{}] do not exist in the template",
            unknown.key
        )));
    }

    let mut resolved = BTreeMap::new();
    for (key, declaration) in declared {
        let value = match supplied.iter().find(|p| &p.key == key) {
            Some(Parameter {
                use_previous_value: true,
                ..
            }) => previous.and_then(|p| p.get(key)).cloned(),
            Some(Parameter { value, .. }) => value.clone(),
            None => declaration
                .get("Default")
                .and_then(Value::as_str)
                .map(str::to_string),
        };
        let value = value.ok_or_else(|| validation(format!("Parameters: [{key}] must have values")))?;
        resolved.insert(key.clone(), value);
    }
    Ok(resolved)
}

fn outputs(document: &Value) -> BTreeMap<String, String> {
    document
        .get("Outputs")
        .and_then(Value::as_object)
        .map(|outputs| {
            outputs
                .iter()
                .filter_map(|(key, output)| {
                    let value = match &output["Value"] {
                        Value::String(s) => s.clone(),
                        Value::Null => return None,
                        other => other.to_string(),
                    };
                    Some((key.clone(), value))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl StackApi for MemoryStackApi {
    async fn create_stack(&self, input: CreateStackInput) -> BackendResult<()> {
        let document = parse_document(&input.template_body)?;
        let parameters = resolve_parameters(&document, &input.parameters, None)?;
        if lock(&self.state).stacks.contains_key(&input.name) {
            return Err(BackendError::api(
                "AlreadyExistsException",
                format!("Stack [{}] already exists", input.name),
            ));
        }

        let resources = self
            .materialize(&input.name, &document, &parameters, &[])
            .await?;

        debug!(stack = %input.name, "[MEMORY] Created stack");
        lock(&self.state).stacks.insert(
            input.name,
            StackRecord {
                status: "CREATE_IN_PROGRESS".to_string(),
                template_body: input.template_body,
                outputs: BTreeMap::new(),
                pending_outputs: Some(outputs(&document)),
                parameters,
                resources,
            },
        );
        Ok(())
    }

    async fn update_stack(&self, input: UpdateStackInput) -> BackendResult<()> {
        let current = lock(&self.state)
            .stacks
            .get(&input.name)
            .cloned()
            .ok_or_else(|| BackendError::StackNotFound(input.name.clone()))?;
        if current.status.ends_with("_IN_PROGRESS") {
            return Err(validation(format!(
                "Stack:{} is in {} state and can not be updated.",
                input.name, current.status
            )));
        }

        let body = if input.use_previous_template {
            current.template_body.clone()
        } else {
            input
                .template_body
                .ok_or_else(|| validation("TemplateBody or UsePreviousTemplate is required"))?
        };
        let document = parse_document(&body)?;
        let parameters = resolve_parameters(&document, &input.parameters, Some(&current.parameters))?;

        if body == current.template_body && parameters == current.parameters {
            return Err(BackendError::NoUpdatesToPerform);
        }

        let resources = self
            .materialize(&input.name, &document, &parameters, &current.resources)
            .await?;

        debug!(stack = %input.name, "[MEMORY] Updating stack");
        let mut state = lock(&self.state);
        state.updates.push(AppliedUpdate {
            stack: input.name.clone(),
            template_body: body.clone(),
            parameters: parameters.clone(),
        });
        state.stacks.insert(
            input.name,
            StackRecord {
                status: "UPDATE_IN_PROGRESS".to_string(),
                template_body: body,
                outputs: current.outputs,
                pending_outputs: Some(outputs(&document)),
                parameters,
                resources,
            },
        );
        Ok(())
    }

    async fn delete_stack(&self, name: &str) -> BackendResult<()> {
        let Some(record) = lock(&self.state).stacks.remove(name) else {
            return Ok(());
        };
        if let Some(orchestrator) = &self.orchestrator {
            for service in record
                .resources
                .iter()
                .filter(|r| r.resource_type == RESOURCE_ECS_SERVICE)
            {
                delete_service(orchestrator, &service.physical_id).await?;
            }
        }
        Ok(())
    }

    async fn describe_stack(&self, name: &str) -> BackendResult<Stack> {
        lock(&self.state)
            .stacks
            .get(name)
            .map(|r| to_stack(name, r))
            .ok_or_else(|| BackendError::StackNotFound(name.to_string()))
    }

    async fn describe_stack_resources(&self, name: &str) -> BackendResult<Vec<StackResource>> {
        lock(&self.state)
            .stacks
            .get(name)
            .map(|r| r.resources.clone())
            .ok_or_else(|| BackendError::StackNotFound(name.to_string()))
    }

    async fn get_template(&self, name: &str) -> BackendResult<String> {
        self.template_body(name)
            .ok_or_else(|| BackendError::StackNotFound(name.to_string()))
    }

    async fn wait_until_create_complete(&self, name: &str) -> BackendResult<()> {
        self.wait_on(name, "CREATE_IN_PROGRESS", "CREATE_COMPLETE", self.create_gate.as_ref())
            .await
    }

    async fn wait_until_update_complete(&self, name: &str) -> BackendResult<()> {
        self.wait_on(name, "UPDATE_IN_PROGRESS", "UPDATE_COMPLETE", self.update_gate.as_ref())
            .await
    }
}

impl MemoryStackApi {
    /// Move the stack from `from` to `to`, first taking a permit from `gate`
    /// when the stack is in `from`.
    async fn wait_on(
        &self,
        name: &str,
        from: &str,
        to: &str,
        gate: Option<&Arc<Semaphore>>,
    ) -> BackendResult<()> {
        let in_progress = lock(&self.state)
            .stacks
            .get(name)
            .map(|r| r.status == from)
            .ok_or_else(|| BackendError::StackNotFound(name.to_string()))?;

        if let (true, Some(gate)) = (in_progress, gate) {
            gate.acquire()
                .await
                .map_err(|_| BackendError::api("Closed", "stack gate closed"))?
                .forget();
        }

        if let Some(record) = lock(&self.state).stacks.get_mut(name) {
            record.settle(from, to);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::orchestrator::ContainerDefinition;

    async fn register(orchestrator: &MemoryOrchestrator) -> TaskDefinition {
        orchestrator
            .register_task_definition(TaskDefinitionInput {
                family: "1234--web".to_string(),
                containers: vec![ContainerDefinition {
                    name: "web".to_string(),
                    ..Default::default()
                }],
            })
            .await
            .unwrap()
    }

    fn create_input(task_definition: &str, desired_count: u32) -> CreateServiceInput {
        CreateServiceInput {
            cluster: "default".to_string(),
            service_name: "1234--web".to_string(),
            task_definition: task_definition.to_string(),
            desired_count,
            load_balancers: vec![],
            role: None,
        }
    }

    #[tokio::test]
    async fn test_service_tasks_converge() {
        let orchestrator = MemoryOrchestrator::new();
        let v1 = register(&orchestrator).await;
        orchestrator
            .create_service(create_input(&v1.arn, 2))
            .await
            .unwrap();
        assert_eq!(orchestrator.running_tasks("1234--web"), 2);

        let v2 = register(&orchestrator).await;
        assert_eq!(v2.revision, 2);
        orchestrator
            .update_service(UpdateServiceInput {
                cluster: "default".to_string(),
                service: "1234--web".to_string(),
                task_definition: Some(v2.arn.clone()),
                desired_count: Some(1),
            })
            .await
            .unwrap();

        let page = orchestrator
            .list_tasks(ListTasksInput {
                cluster: "default".to_string(),
                service_name: Some("1234--web".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let tasks = orchestrator.describe_tasks("default", &page.items).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_definition_arn, v2.arn);
    }

    #[tokio::test]
    async fn test_role_requires_load_balancer() {
        let orchestrator = MemoryOrchestrator::new();
        let td = register(&orchestrator).await;
        let mut input = create_input(&td.arn, 1);
        input.role = Some("ecsServiceRole".to_string());

        let err = orchestrator.create_service(input).await.unwrap_err();
        assert!(matches!(err, BackendError::Api { .. }));
    }

    #[tokio::test]
    async fn test_delete_requires_scale_down() {
        let orchestrator = MemoryOrchestrator::new();
        let td = register(&orchestrator).await;
        orchestrator.create_service(create_input(&td.arn, 1)).await.unwrap();

        assert!(orchestrator.delete_service("default", "1234--web").await.is_err());

        orchestrator
            .update_service(UpdateServiceInput {
                cluster: "default".to_string(),
                service: "1234--web".to_string(),
                task_definition: None,
                desired_count: Some(0),
            })
            .await
            .unwrap();
        orchestrator.delete_service("default", "1234--web").await.unwrap();

        let err = orchestrator.delete_service("default", "1234--web").await.unwrap_err();
        assert_eq!(err, BackendError::ServiceNotActive("1234--web".to_string()));
    }

    #[tokio::test]
    async fn test_list_services_paginates() {
        let orchestrator = MemoryOrchestrator::new().with_page_size(1);
        let td = register(&orchestrator).await;
        for name in ["1234--web", "1234--worker"] {
            let mut input = create_input(&td.arn, 0);
            input.service_name = name.to_string();
            orchestrator.create_service(input).await.unwrap();
        }

        let first = orchestrator.list_services("default", None).await.unwrap();
        assert_eq!(first.items.len(), 1);
        let second = orchestrator
            .list_services("default", first.next_token)
            .await
            .unwrap();
        assert_eq!(second.items.len(), 1);
        assert!(second.next_token.is_none());
    }

    #[tokio::test]
    async fn test_stop_task_is_idempotent() {
        let orchestrator = MemoryOrchestrator::new();
        let td = register(&orchestrator).await;
        let tasks = orchestrator
            .run_task(RunTaskInput {
                cluster: "default".to_string(),
                task_definition: td.arn,
                count: 1,
                started_by: Some("1234".to_string()),
            })
            .await
            .unwrap();
        let id = name_from_arn(&tasks[0].arn).to_string();

        orchestrator.stop_task("default", &id).await.unwrap();
        orchestrator.stop_task("default", &id).await.unwrap();

        let stops = orchestrator
            .mutations()
            .into_iter()
            .filter(|m| matches!(m, OrchestratorMutation::StopTask(_)))
            .count();
        assert_eq!(stops, 1);
    }

    #[tokio::test]
    async fn test_stack_no_updates() {
        let stacks = MemoryStackApi::new();
        let body = r#"{"Parameters":{"WebScale":{"Type":"Number"}},"Resources":{}}"#;
        stacks
            .create_stack(CreateStackInput {
                name: "dockyard-1234".to_string(),
                template_body: body.to_string(),
                parameters: vec![Parameter::new("WebScale", "1")],
                tags: BTreeMap::new(),
            })
            .await
            .unwrap();
        stacks.wait_until_create_complete("dockyard-1234").await.unwrap();

        let err = stacks
            .update_stack(UpdateStackInput {
                name: "dockyard-1234".to_string(),
                template_body: None,
                use_previous_template: true,
                parameters: vec![Parameter::keep("WebScale")],
            })
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::NoUpdatesToPerform);
    }

    #[tokio::test]
    async fn test_stack_outputs_follow_completion() {
        let stacks = MemoryStackApi::new();
        let body = |port: &str| {
            format!(r#"{{"Resources":{{}},"Outputs":{{"WebInstancePort":{{"Value":"{port}"}}}}}}"#)
        };
        stacks
            .create_stack(CreateStackInput {
                name: "dockyard-1234".to_string(),
                template_body: body("9000"),
                parameters: vec![],
                tags: BTreeMap::new(),
            })
            .await
            .unwrap();
        let creating = stacks.describe_stack("dockyard-1234").await.unwrap();
        assert!(creating.outputs.is_empty());

        stacks.wait_until_create_complete("dockyard-1234").await.unwrap();
        stacks
            .update_stack(UpdateStackInput {
                name: "dockyard-1234".to_string(),
                template_body: Some(body("9001")),
                use_previous_template: false,
                parameters: vec![],
            })
            .await
            .unwrap();
        let updating = stacks.describe_stack("dockyard-1234").await.unwrap();
        assert_eq!(updating.status, "UPDATE_IN_PROGRESS");
        assert_eq!(updating.outputs["WebInstancePort"], "9000");
        assert_eq!(stacks.get_template("dockyard-1234").await.unwrap(), body("9001"));

        stacks.wait_until_update_complete("dockyard-1234").await.unwrap();
        let updated = stacks.describe_stack("dockyard-1234").await.unwrap();
        assert_eq!(updated.status, "UPDATE_COMPLETE");
        assert_eq!(updated.outputs["WebInstancePort"], "9001");
    }

    #[tokio::test]
    async fn test_stack_requires_parameters() {
        let stacks = MemoryStackApi::new();
        let body = r#"{"Parameters":{"WebScale":{"Type":"Number"}},"Resources":{}}"#;
        let err = stacks
            .create_stack(CreateStackInput {
                name: "dockyard-1234".to_string(),
                template_body: body.to_string(),
                parameters: vec![],
                tags: BTreeMap::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Api { .. }));
    }

    #[tokio::test]
    async fn test_dns_delete_missing_record() {
        let dns = MemoryDns::new();
        let err = dns
            .change_record(
                "Z123",
                Change {
                    action: ChangeAction::Delete,
                    record: RecordSet {
                        name: "acme-inc.dockyard.local".to_string(),
                        record_type: crate::backend::dns::RecordType::Cname,
                        ttl: 60,
                        values: vec![],
                    },
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::RecordNotFound(_)));
        assert!(dns.changes().is_empty());
    }
}
