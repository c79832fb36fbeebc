//! Queue store — priority tiers, delayed set and worker leases.

pub mod backend;
pub mod manager;
pub mod memory;
pub mod redis;

pub use backend::{PushOutcome, QueueBackend};
pub use manager::{Enqueued, Lease, Leased, QueueInfo, QueueManager, TierInfo, WorkerHeartbeat};
pub use memory::MemoryBackend;
pub use redis::RedisBackend;
