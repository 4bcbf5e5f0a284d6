//! Scheduler error types.

use thiserror::Error;

use crate::backend::BackendError;
use crate::db::DbError;

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors that can occur while reconciling an application.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Unrecovered error from an orchestration, load balancer, DNS or stack API.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The existing load balancer disagrees with the desired exposure.
    ///
    /// Flipping a balancer between internal and external changes its DNS
    /// surface, so it is never done automatically.
    #[error(
        "process {process_type} of app {app_id} is {desired} but load balancer {load_balancer} is {existing}; remove the process to recreate its load balancer"
    )]
    ExposureConflict {
        app_id: String,
        process_type: String,
        load_balancer: String,
        existing: &'static str,
        desired: &'static str,
    },

    /// The host port pool has no free ports left.
    #[error("no free ports left in the pool")]
    PortsExhausted,

    /// A required setting is missing or malformed.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] DbError),

    /// The stack document could not be rendered.
    #[error("template error: {0}")]
    Template(#[from] serde_json::Error),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Attached (interactive) runs are handled by an external runner.
    #[error("attached runs are not supported by this scheduler")]
    AttachedRunUnsupported,

    #[error("process {process_type} not found in app {app_id}")]
    ProcessNotFound {
        app_id: String,
        process_type: String,
    },
}

impl SchedulerError {
    /// Build an exposure conflict from the two external flags.
    pub fn exposure_conflict(
        app_id: &str,
        process_type: &str,
        load_balancer: &str,
        existing_external: bool,
        desired_external: bool,
    ) -> Self {
        Self::ExposureConflict {
            app_id: app_id.to_string(),
            process_type: process_type.to_string(),
            load_balancer: load_balancer.to_string(),
            existing: scheme_label(existing_external),
            desired: scheme_label(desired_external),
        }
    }
}

fn scheme_label(external: bool) -> &'static str {
    if external {
        "external"
    } else {
        "internal"
    }
}
