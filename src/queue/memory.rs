//! In-process `QueueBackend` for single-node deployments and tests.
//!
//! One mutex guards the whole keyspace, so every trait method is atomic the
//! same way a Lua script is on Redis. Empty containers are dropped, matching
//! Redis key semantics.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::backend::{PushOutcome, QueueBackend};
use crate::error::QueueError;

#[derive(Default)]
struct Keyspace {
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, HashMap<String, i64>>,
    hashes: HashMap<String, (HashMap<String, String>, Option<Instant>)>,
    strings: HashMap<String, (String, Instant)>,
}

impl Keyspace {
    fn evict_expired(&mut self) {
        let now = Instant::now();
        self.hashes
            .retain(|_, (_, expires)| expires.is_none_or(|at| at > now));
        self.strings.retain(|_, (_, expires)| *expires > now);
    }

    fn push_tail(&mut self, list: &str, member: &str, max_len: u64) -> PushOutcome {
        let entries = self.lists.entry(list.to_string()).or_default();
        if let Some(idx) = entries.iter().position(|m| m == member) {
            return PushOutcome::Present(idx as u64 + 1);
        }
        if entries.len() as u64 >= max_len {
            if entries.is_empty() {
                self.lists.remove(list);
            }
            return PushOutcome::Full;
        }
        entries.push_back(member.to_string());
        PushOutcome::Added(entries.len() as u64)
    }
}

/// Keyspace held in process memory.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Keyspace>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn push_unique(
        &self,
        list: &str,
        member: &str,
        max_len: u64,
    ) -> Result<PushOutcome, QueueError> {
        Ok(self.inner.lock().await.push_tail(list, member, max_len))
    }

    async fn pop_and_lease(
        &self,
        lists: &[String],
        lease_hash: &str,
        lease_value: i64,
    ) -> Result<Option<(usize, String)>, QueueError> {
        let mut ks = self.inner.lock().await;
        for (idx, list) in lists.iter().enumerate() {
            let Some(entries) = ks.lists.get_mut(list) else {
                continue;
            };
            let Some(member) = entries.pop_front() else {
                continue;
            };
            if entries.is_empty() {
                ks.lists.remove(list);
            }
            ks.hashes
                .entry(lease_hash.to_string())
                .or_insert_with(|| (HashMap::new(), None))
                .0
                .insert(member.clone(), lease_value.to_string());
            return Ok(Some((idx, member)));
        }
        Ok(None)
    }

    async fn remove(&self, list: &str, member: &str) -> Result<bool, QueueError> {
        let mut ks = self.inner.lock().await;
        let Some(entries) = ks.lists.get_mut(list) else {
            return Ok(false);
        };
        let before = entries.len();
        entries.retain(|m| m != member);
        let removed = entries.len() != before;
        if entries.is_empty() {
            ks.lists.remove(list);
        }
        Ok(removed)
    }

    async fn range(&self, list: &str) -> Result<Vec<String>, QueueError> {
        let ks = self.inner.lock().await;
        Ok(ks
            .lists
            .get(list)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn len(&self, list: &str) -> Result<u64, QueueError> {
        let ks = self.inner.lock().await;
        Ok(ks.lists.get(list).map_or(0, |entries| entries.len() as u64))
    }

    async fn schedule(&self, zset: &str, member: &str, score: i64) -> Result<(), QueueError> {
        let mut ks = self.inner.lock().await;
        ks.zsets
            .entry(zset.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn unschedule(&self, zset: &str, member: &str) -> Result<bool, QueueError> {
        let mut ks = self.inner.lock().await;
        let Some(set) = ks.zsets.get_mut(zset) else {
            return Ok(false);
        };
        let removed = set.remove(member).is_some();
        if set.is_empty() {
            ks.zsets.remove(zset);
        }
        Ok(removed)
    }

    async fn scheduled(&self, zset: &str) -> Result<Vec<(String, i64)>, QueueError> {
        let ks = self.inner.lock().await;
        let mut members: Vec<(String, i64)> = ks
            .zsets
            .get(zset)
            .map(|set| set.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(members)
    }

    async fn promote_due(
        &self,
        zset: &str,
        max_score: i64,
        list_prefix: &str,
        max_len: u64,
    ) -> Result<Vec<String>, QueueError> {
        let mut ks = self.inner.lock().await;
        let Some(set) = ks.zsets.get(zset) else {
            return Ok(Vec::new());
        };

        let mut due: Vec<(String, i64)> = set
            .iter()
            .filter(|(_, score)| **score <= max_score)
            .map(|(m, s)| (m.clone(), *s))
            .collect();
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let mut moved = Vec::with_capacity(due.len());
        for (member, _) in due {
            let pushed = match member.split_once('|') {
                Some((tier, id)) => {
                    let list = format!("{list_prefix}{tier}");
                    if ks.push_tail(&list, id, max_len) == PushOutcome::Full {
                        continue;
                    }
                    true
                }
                None => false,
            };
            if let Some(set) = ks.zsets.get_mut(zset) {
                set.remove(&member);
            }
            if pushed {
                moved.push(member);
            }
        }
        if ks.zsets.get(zset).is_some_and(|set| set.is_empty()) {
            ks.zsets.remove(zset);
        }
        Ok(moved)
    }

    async fn lease_entries(&self, hash: &str) -> Result<Vec<(String, i64)>, QueueError> {
        let ks = self.inner.lock().await;
        Ok(ks
            .hashes
            .get(hash)
            .map(|(fields, _)| {
                fields
                    .iter()
                    .filter_map(|(k, v)| v.parse().ok().map(|v| (k.clone(), v)))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn release(&self, hash: &str, field: &str) -> Result<bool, QueueError> {
        let mut ks = self.inner.lock().await;
        let Some((fields, _)) = ks.hashes.get_mut(hash) else {
            return Ok(false);
        };
        let removed = fields.remove(field).is_some();
        if fields.is_empty() {
            ks.hashes.remove(hash);
        }
        Ok(removed)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, QueueError> {
        let mut ks = self.inner.lock().await;
        ks.evict_expired();
        let mut keys: Vec<String> = ks
            .lists
            .keys()
            .chain(ks.zsets.keys())
            .chain(ks.hashes.keys())
            .chain(ks.strings.keys())
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn put_hash(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<(), QueueError> {
        let mut ks = self.inner.lock().await;
        let map = fields.iter().cloned().collect();
        ks.hashes
            .insert(key.to_string(), (map, Some(Instant::now() + ttl)));
        Ok(())
    }

    async fn get_hash(&self, key: &str) -> Result<HashMap<String, String>, QueueError> {
        let mut ks = self.inner.lock().await;
        ks.evict_expired();
        Ok(ks
            .hashes
            .get(key)
            .map(|(fields, _)| fields.clone())
            .unwrap_or_default())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, QueueError> {
        let mut ks = self.inner.lock().await;
        ks.evict_expired();
        if ks.strings.contains_key(key) {
            return Ok(false);
        }
        ks.strings
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, QueueError> {
        let mut ks = self.inner.lock().await;
        ks.evict_expired();
        match ks.strings.get(key) {
            Some((held, _)) if held == value => {
                ks.strings.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
