//! Worker system — task execution with leases and retries.
//!
//! Core components:
//! - `handler` — `TaskHandler` capability, `TaskContext`, handler registry
//! - `retry` — eligibility and capped exponential backoff
//! - `coordinator` — executor pool, heartbeats, lease reaper

pub mod coordinator;
pub mod handler;
pub mod retry;

pub use coordinator::{CoordinatorDeps, TypeLimit, WorkerCoordinator};
pub use handler::{HandlerRegistry, HealthCheckHandler, TaskContext, TaskHandler};
pub use retry::RetryPolicy;
