//! `QueueBackend` trait — atomic key-value primitives the queue manager is built on.
//!
//! Every method is a single atomic step on the shared store. Multi-step
//! operations (capacity-checked push, pop-and-lease, delayed promotion,
//! compare-and-delete) are one call here so no application-level lock is
//! needed around queue mutation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueueError;

/// Result of a capacity-checked, de-duplicating push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Appended at this 1-based position.
    Added(u64),
    /// Already present at this 1-based position; nothing changed.
    Present(u64),
    /// List is at capacity; nothing changed.
    Full,
}

#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Round-trip used by health checks.
    async fn ping(&self) -> Result<(), QueueError>;

    /// Append `member` to the tail of `list` unless it is already there or the
    /// list holds `max_len` entries.
    async fn push_unique(
        &self,
        list: &str,
        member: &str,
        max_len: u64,
    ) -> Result<PushOutcome, QueueError>;

    /// Pop the head of the first non-empty list (in the order given) and record
    /// `member -> lease_value` in `lease_hash`, atomically.
    /// Returns the index of the list that yielded and the member.
    async fn pop_and_lease(
        &self,
        lists: &[String],
        lease_hash: &str,
        lease_value: i64,
    ) -> Result<Option<(usize, String)>, QueueError>;

    /// Remove every occurrence of `member`. Returns whether anything was removed.
    async fn remove(&self, list: &str, member: &str) -> Result<bool, QueueError>;

    /// All members, head first.
    async fn range(&self, list: &str) -> Result<Vec<String>, QueueError>;

    async fn len(&self, list: &str) -> Result<u64, QueueError>;

    /// Add or rescore a sorted-set member.
    async fn schedule(&self, zset: &str, member: &str, score: i64) -> Result<(), QueueError>;

    async fn unschedule(&self, zset: &str, member: &str) -> Result<bool, QueueError>;

    /// Sorted-set members in score order.
    async fn scheduled(&self, zset: &str) -> Result<Vec<(String, i64)>, QueueError>;

    /// Move every member with `score <= max_score` onto the tail of its list.
    ///
    /// Members have the form `{tier}|{id}`; the target list is
    /// `{list_prefix}{tier}` and receives `{id}`. A member whose list already
    /// holds `max_len` entries stays in the set. Returns the moved members.
    async fn promote_due(
        &self,
        zset: &str,
        max_score: i64,
        list_prefix: &str,
        max_len: u64,
    ) -> Result<Vec<String>, QueueError>;

    /// All `field -> value` pairs of a lease hash.
    async fn lease_entries(&self, hash: &str) -> Result<Vec<(String, i64)>, QueueError>;

    /// Delete one lease field. Only the caller that gets `true` owns the release.
    async fn release(&self, hash: &str, field: &str) -> Result<bool, QueueError>;

    /// Keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, QueueError>;

    /// Replace a hash and (re)arm its TTL.
    async fn put_hash(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<(), QueueError>;

    /// Empty map when the key is missing or expired.
    async fn get_hash(&self, key: &str) -> Result<HashMap<String, String>, QueueError>;

    /// Set `key = value` with a TTL only if the key is absent.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, QueueError>;

    /// Delete `key` only if it still holds `value`.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, QueueError>;
}
