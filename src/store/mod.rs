//! Persistence layer — the durable task record store.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{TaskCount, TaskStore};
