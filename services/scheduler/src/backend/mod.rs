//! Boundaries to the cloud APIs the scheduler drives.
//!
//! Each collaborator is a trait so the schedulers never depend on a concrete
//! SDK:
//! - [`Orchestrator`]: task definitions, services and tasks
//! - [`LoadBalancerApi`]: balancers, listeners and tags
//! - [`DnsApi`]: alias records under a hosted zone
//! - [`StackApi`]: declarative stacks and their completion waits
//!
//! In-memory implementations for tests and local development live in
//! [`memory`].

pub mod dns;
pub mod elb;
pub mod memory;
pub mod orchestrator;
pub mod stack;

pub use dns::DnsApi;
pub use elb::LoadBalancerApi;
pub use orchestrator::Orchestrator;
pub use stack::StackApi;

use thiserror::Error;

/// Result type for backend calls.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors reported by the cloud APIs.
///
/// Only the variants the scheduler reacts to are broken out; everything else
/// arrives as [`BackendError::Api`] and is propagated unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("service not active: {0}")]
    ServiceNotActive(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("load balancer not found: {0}")]
    LoadBalancerNotFound(String),

    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("stack not found: {0}")]
    StackNotFound(String),

    /// The stack update carried no changes.
    #[error("no updates are to be performed")]
    NoUpdatesToPerform,

    #[error("{code}: {message}")]
    Api { code: String, message: String },
}

impl BackendError {
    pub fn api(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            code: code.into(),
            message: message.into(),
        }
    }

    /// True for "service not found" and "service not active".
    ///
    /// These are benign during teardown and speculative updates.
    pub fn is_service_gone(&self) -> bool {
        matches!(self, Self::ServiceNotFound(_) | Self::ServiceNotActive(_))
    }
}

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_token: None,
        }
    }
}
