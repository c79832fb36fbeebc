//! API surface — request validation and the HTTP router.

pub mod routes;
pub mod service;
pub mod types;

pub use routes::router;
pub use service::TaskService;
