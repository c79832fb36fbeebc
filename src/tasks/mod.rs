//! Task entity and lifecycle rules.

pub mod model;
pub mod state;

pub use model::{
    ListOptions, Payload, SortField, SortOrder, Task, TaskFilter, TaskPriority, TaskStatus,
    TaskType, now,
};
