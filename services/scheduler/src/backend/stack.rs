//! Stack orchestration API: declarative documents applied as a unit.

use std::collections::BTreeMap;

use async_trait::async_trait;

use super::BackendResult;

pub const RESOURCE_ECS_SERVICE: &str = "AWS::ECS::Service";
pub const RESOURCE_ECS_TASK_DEFINITION: &str = "AWS::ECS::TaskDefinition";
pub const RESOURCE_LOAD_BALANCER: &str = "AWS::ElasticLoadBalancing::LoadBalancer";
pub const RESOURCE_RECORD_SET: &str = "AWS::Route53::RecordSet";

/// A stack parameter as sent on create/update or read back on describe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub key: String,
    pub value: Option<String>,
    /// Keep whatever value the stack currently has.
    pub use_previous_value: bool,
}

impl Parameter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            use_previous_value: false,
        }
    }

    pub fn keep(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
            use_previous_value: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateStackInput {
    pub name: String,
    pub template_body: String,
    pub parameters: Vec<Parameter>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateStackInput {
    pub name: String,
    /// Ignored when `use_previous_template` is set.
    pub template_body: Option<String>,
    pub use_previous_template: bool,
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stack {
    pub name: String,
    pub status: String,
    pub parameters: Vec<Parameter>,
    pub outputs: BTreeMap<String, String>,
}

impl Stack {
    /// True while a create, update or rollback has not settled.
    pub fn is_in_progress(&self) -> bool {
        self.status.ends_with("_IN_PROGRESS")
    }

    pub fn is_create_in_progress(&self) -> bool {
        self.status == "CREATE_IN_PROGRESS"
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StackResource {
    pub logical_id: String,
    pub physical_id: String,
    pub resource_type: String,
    /// Arbitrary metadata attached to the resource in the document.
    pub metadata: Option<serde_json::Value>,
}

/// Stack orchestration interface.
#[async_trait]
pub trait StackApi: Send + Sync {
    async fn create_stack(&self, input: CreateStackInput) -> BackendResult<()>;

    /// Fails with [`super::BackendError::NoUpdatesToPerform`] when nothing changed.
    async fn update_stack(&self, input: UpdateStackInput) -> BackendResult<()>;

    async fn delete_stack(&self, name: &str) -> BackendResult<()>;

    /// Fails with [`super::BackendError::StackNotFound`] when absent.
    async fn describe_stack(&self, name: &str) -> BackendResult<Stack>;

    async fn describe_stack_resources(&self, name: &str) -> BackendResult<Vec<StackResource>>;

    /// The document the stack was last created or updated with.
    async fn get_template(&self, name: &str) -> BackendResult<String>;

    /// Block until the stack leaves `CREATE_IN_PROGRESS`.
    async fn wait_until_create_complete(&self, name: &str) -> BackendResult<()>;

    /// Block until the stack leaves `UPDATE_IN_PROGRESS`.
    async fn wait_until_update_complete(&self, name: &str) -> BackendResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_progress() {
        let mut stack = Stack {
            name: "dockyard-1234".to_string(),
            status: "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS".to_string(),
            parameters: vec![],
            outputs: BTreeMap::new(),
        };
        assert!(stack.is_in_progress());
        assert!(!stack.is_create_in_progress());

        stack.status = "UPDATE_COMPLETE".to_string();
        assert!(!stack.is_in_progress());
    }
}
