//! taskq — asynchronous task orchestration and queueing engine.

pub mod api;
pub mod config;
pub mod error;
pub mod fanout;
pub mod queue;
pub mod store;
pub mod tasks;
pub mod worker;
