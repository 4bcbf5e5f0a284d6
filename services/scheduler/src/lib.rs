//! Scheduling and provisioning core.
//!
//! Reconciles an [`types::App`] against a container orchestration backend.
//! Two interchangeable implementations of [`scheduler::Scheduler`] exist:
//!
//! - [`direct::DirectScheduler`] drives services, task definitions and load
//!   balancers call by call
//! - [`stack::StackScheduler`] compiles the app into one stack document and
//!   serializes updates through [`stack::queue::StackUpdateQueue`]
//!
//! Backends are reached through the traits in [`backend`]; in-memory versions
//! live in [`backend::memory`].

pub mod backend;
pub mod cache;
pub mod config;
pub mod db;
pub mod direct;
pub mod error;
pub mod instances;
pub mod lb;
pub mod scheduler;
pub mod stack;
pub mod task;
pub mod types;

pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{AnyScheduler, Attach, Backends, Scheduler};
