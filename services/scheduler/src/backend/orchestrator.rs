//! Container orchestration API (task definitions, services, tasks).

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{BackendResult, Page};

/// Most task ARNs a single describe call accepts.
pub const MAX_DESCRIBE_TASKS: usize = 100;

/// Most services a single describe call accepts.
pub const MAX_DESCRIBE_SERVICES: usize = 10;

/// Service is running and accepting updates.
pub const SERVICE_ACTIVE: &str = "ACTIVE";

/// Service was deleted.
pub const SERVICE_INACTIVE: &str = "INACTIVE";

pub const TASK_PENDING: &str = "PENDING";
pub const TASK_RUNNING: &str = "RUNNING";
pub const TASK_STOPPED: &str = "STOPPED";

/// A container port published on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: Option<u16>,
    pub container_port: u16,
}

/// A resource limit applied inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ulimit {
    pub name: String,
    pub soft: u32,
    pub hard: u32,
}

/// One container of a task definition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerDefinition {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub cpu: u32,
    pub memory_mib: u64,
    pub port_mappings: Vec<PortMapping>,
    pub docker_labels: BTreeMap<String, String>,
    pub ulimits: Vec<Ulimit>,
    pub essential: bool,
}

/// Input for registering a task definition revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDefinitionInput {
    pub family: String,
    pub containers: Vec<ContainerDefinition>,
}

/// A registered, immutable task definition revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDefinition {
    pub arn: String,
    pub family: String,
    pub revision: u32,
    pub containers: Vec<ContainerDefinition>,
}

impl TaskDefinition {
    /// True when registering `input` would produce an identical revision.
    pub fn matches(&self, input: &TaskDefinitionInput) -> bool {
        self.family == input.family && self.containers == input.containers
    }
}

/// A load balancer attached to a service at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLoadBalancer {
    pub load_balancer_name: String,
    pub container_name: String,
    pub container_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateServiceInput {
    pub cluster: String,
    pub service_name: String,
    pub task_definition: String,
    pub desired_count: u32,
    pub load_balancers: Vec<ServiceLoadBalancer>,
    /// Required when load balancers are attached, rejected otherwise.
    pub role: Option<String>,
}

/// Partial update of a service; `None` fields are left unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateServiceInput {
    pub cluster: String,
    pub service: String,
    pub task_definition: Option<String>,
    pub desired_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub arn: String,
    pub name: String,
    pub status: String,
    pub task_definition: String,
    pub desired_count: u32,
    pub load_balancers: Vec<ServiceLoadBalancer>,
}

impl Service {
    pub fn is_active(&self) -> bool {
        self.status == SERVICE_ACTIVE
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListTasksInput {
    pub cluster: String,
    pub service_name: Option<String>,
    pub started_by: Option<String>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub arn: String,
    pub task_definition_arn: String,
    pub last_status: String,
    pub started_by: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunTaskInput {
    pub cluster: String,
    pub task_definition: String,
    pub count: u32,
    pub started_by: Option<String>,
}

/// Container orchestration interface.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn register_task_definition(
        &self,
        input: TaskDefinitionInput,
    ) -> BackendResult<TaskDefinition>;

    async fn describe_task_definition(&self, arn: &str) -> BackendResult<TaskDefinition>;

    async fn create_service(&self, input: CreateServiceInput) -> BackendResult<Service>;

    async fn update_service(&self, input: UpdateServiceInput) -> BackendResult<Service>;

    async fn delete_service(&self, cluster: &str, service: &str) -> BackendResult<()>;

    /// List service ARNs in a cluster.
    async fn list_services(
        &self,
        cluster: &str,
        next_token: Option<String>,
    ) -> BackendResult<Page<String>>;

    /// Describe up to [`MAX_DESCRIBE_SERVICES`] services by name or ARN.
    ///
    /// Services that never existed are omitted from the result.
    async fn describe_services(
        &self,
        cluster: &str,
        services: &[String],
    ) -> BackendResult<Vec<Service>>;

    /// List ARNs of tasks that have not stopped.
    async fn list_tasks(&self, input: ListTasksInput) -> BackendResult<Page<String>>;

    /// Describe up to [`MAX_DESCRIBE_TASKS`] tasks.
    async fn describe_tasks(&self, cluster: &str, tasks: &[String]) -> BackendResult<Vec<Task>>;

    async fn run_task(&self, input: RunTaskInput) -> BackendResult<Vec<Task>>;

    /// Stop a task. Stopping an already stopped task succeeds.
    async fn stop_task(&self, cluster: &str, task: &str) -> BackendResult<()>;
}

/// Extract the trailing name segment of an ARN.
pub fn name_from_arn(arn: &str) -> &str {
    arn.rsplit('/').next().unwrap_or(arn)
}
