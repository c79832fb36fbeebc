//! Redis `QueueBackend` shared by every node of a deployment.
//!
//! Single-command primitives map straight to Redis commands. Every multi-step
//! primitive is a Lua script (`redis::Script`) so it runs atomically on the
//! server in one round-trip.
//!
//! # Key usage
//!
//! | Primitive | Redis type | Commands |
//! |-----------|------------|----------|
//! | priority tiers | List | `LPOS`, `RPUSH`, `LPOP`, `LREM`, `LRANGE` |
//! | delayed set | Sorted Set | `ZADD`, `ZREM`, `ZRANGEBYSCORE` |
//! | leases | Hash (no TTL) | `HSET`, `HDEL`, `HGETALL` |
//! | worker heartbeats | Hash (TTL) | `HSET`, `PEXPIRE` |
//! | admin locks | String (TTL) | `SET NX PX`, compare-and-`DEL` |

use std::collections::HashMap;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use super::backend::{PushOutcome, QueueBackend};
use crate::error::QueueError;

// ---------------------------------------------------------------------------
// Lua script constants
// ---------------------------------------------------------------------------

/// Capacity-checked, de-duplicating tail push.
///
/// KEYS[1] = list. ARGV[1] = member, ARGV[2] = max length.
/// Returns: {0, new_len} added, {1, position} already present, {2, len} full.
const LUA_PUSH_UNIQUE: &str = r#"
local pos = redis.call('LPOS', KEYS[1], ARGV[1])
if pos then
    return {1, pos + 1}
end
local len = redis.call('LLEN', KEYS[1])
if len >= tonumber(ARGV[2]) then
    return {2, len}
end
return {0, redis.call('RPUSH', KEYS[1], ARGV[1])}
"#;

/// Pop from the first non-empty list and record the lease.
///
/// KEYS[1..n-1] = lists in priority order, KEYS[n] = lease hash.
/// ARGV[1] = lease value (expiry epoch millis).
/// Returns: {list_index, member} or nil.
const LUA_POP_AND_LEASE: &str = r#"
local lease = KEYS[#KEYS]
for i = 1, #KEYS - 1 do
    local member = redis.call('LPOP', KEYS[i])
    if member then
        redis.call('HSET', lease, member, ARGV[1])
        return {i - 1, member}
    end
end
return false
"#;

/// Move due members of the delayed set onto their tier lists.
///
/// KEYS[1] = delayed sorted set. ARGV[1] = max score (epoch millis),
/// ARGV[2] = list key prefix, ARGV[3] = max list length.
/// Members are `{tier}|{id}`; members of a full list stay parked.
/// Returns: the moved members.
const LUA_PROMOTE_DUE: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 500)
local moved = {}
for _, member in ipairs(due) do
    local sep = string.find(member, '|', 1, true)
    if not sep then
        redis.call('ZREM', KEYS[1], member)
    else
        local list = ARGV[2] .. string.sub(member, 1, sep - 1)
        local id = string.sub(member, sep + 1)
        if redis.call('LPOS', list, id) then
            redis.call('ZREM', KEYS[1], member)
            table.insert(moved, member)
        elseif redis.call('LLEN', list) < tonumber(ARGV[3]) then
            redis.call('RPUSH', list, id)
            redis.call('ZREM', KEYS[1], member)
            table.insert(moved, member)
        end
    end
end
return moved
"#;

/// Compare-and-delete for lock release.
///
/// KEYS[1] = lock key. ARGV[1] = expected holder token.
/// Returns: 1 if deleted, 0 otherwise.
const LUA_DELETE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

// ---------------------------------------------------------------------------
// RedisBackend
// ---------------------------------------------------------------------------

/// Redis-backed queue store.
///
/// Holds a [`MultiplexedConnection`]; clones share one TCP connection, so each
/// method clones it for concurrent use.
#[derive(Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
}

impl RedisBackend {
    /// Connect to Redis. The URL may embed credentials and is never logged.
    pub async fn new(url: &SecretString) -> Result<Self, QueueError> {
        let client = ::redis::Client::open(url.expose_secret())
            .map_err(|e| QueueError::Backend(format!("failed to create Redis client: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Backend(format!("failed to connect to Redis: {e}")))?;
        info!("Connected to Redis queue store");
        Ok(Self { conn })
    }
}

fn map_redis_error(err: ::redis::RedisError, key: &str) -> QueueError {
    QueueError::Backend(format!("Redis error for key {key}: {err}"))
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn ping(&self) -> Result<(), QueueError> {
        let _: String = ::redis::cmd("PING")
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, "PING"))?;
        Ok(())
    }

    async fn push_unique(
        &self,
        list: &str,
        member: &str,
        max_len: u64,
    ) -> Result<PushOutcome, QueueError> {
        let (code, value): (i64, i64) = Script::new(LUA_PUSH_UNIQUE)
            .key(list)
            .arg(member)
            .arg(max_len)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, list))?;

        let value = value.max(0) as u64;
        match code {
            0 => Ok(PushOutcome::Added(value)),
            1 => Ok(PushOutcome::Present(value)),
            2 => Ok(PushOutcome::Full),
            other => Err(QueueError::Malformed(format!(
                "unexpected push result {other} for {list}"
            ))),
        }
    }

    async fn pop_and_lease(
        &self,
        lists: &[String],
        lease_hash: &str,
        lease_value: i64,
    ) -> Result<Option<(usize, String)>, QueueError> {
        let script = Script::new(LUA_POP_AND_LEASE);
        let mut invocation = script.prepare_invoke();
        for list in lists {
            invocation.key(list);
        }
        invocation.key(lease_hash).arg(lease_value);

        let popped: Option<(i64, String)> = invocation
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, lease_hash))?;
        Ok(popped.map(|(idx, member)| (idx.max(0) as usize, member)))
    }

    async fn remove(&self, list: &str, member: &str) -> Result<bool, QueueError> {
        let removed: i64 = self
            .conn
            .clone()
            .lrem(list, 0, member)
            .await
            .map_err(|e| map_redis_error(e, list))?;
        Ok(removed > 0)
    }

    async fn range(&self, list: &str) -> Result<Vec<String>, QueueError> {
        self.conn
            .clone()
            .lrange(list, 0, -1)
            .await
            .map_err(|e| map_redis_error(e, list))
    }

    async fn len(&self, list: &str) -> Result<u64, QueueError> {
        self.conn
            .clone()
            .llen(list)
            .await
            .map_err(|e| map_redis_error(e, list))
    }

    async fn schedule(&self, zset: &str, member: &str, score: i64) -> Result<(), QueueError> {
        let _: i64 = self
            .conn
            .clone()
            .zadd(zset, member, score)
            .await
            .map_err(|e| map_redis_error(e, zset))?;
        Ok(())
    }

    async fn unschedule(&self, zset: &str, member: &str) -> Result<bool, QueueError> {
        let removed: i64 = self
            .conn
            .clone()
            .zrem(zset, member)
            .await
            .map_err(|e| map_redis_error(e, zset))?;
        Ok(removed > 0)
    }

    async fn scheduled(&self, zset: &str) -> Result<Vec<(String, i64)>, QueueError> {
        let members: Vec<(String, f64)> = self
            .conn
            .clone()
            .zrange_withscores(zset, 0, -1)
            .await
            .map_err(|e| map_redis_error(e, zset))?;
        Ok(members
            .into_iter()
            .map(|(member, score)| (member, score as i64))
            .collect())
    }

    async fn promote_due(
        &self,
        zset: &str,
        max_score: i64,
        list_prefix: &str,
        max_len: u64,
    ) -> Result<Vec<String>, QueueError> {
        Script::new(LUA_PROMOTE_DUE)
            .key(zset)
            .arg(max_score)
            .arg(list_prefix)
            .arg(max_len)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, zset))
    }

    async fn lease_entries(&self, hash: &str) -> Result<Vec<(String, i64)>, QueueError> {
        let fields: HashMap<String, String> = self
            .conn
            .clone()
            .hgetall(hash)
            .await
            .map_err(|e| map_redis_error(e, hash))?;
        Ok(fields
            .into_iter()
            .filter_map(|(field, value)| value.parse().ok().map(|v| (field, v)))
            .collect())
    }

    async fn release(&self, hash: &str, field: &str) -> Result<bool, QueueError> {
        let removed: i64 = self
            .conn
            .clone()
            .hdel(hash, field)
            .await
            .map_err(|e| map_redis_error(e, hash))?;
        Ok(removed > 0)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, QueueError> {
        let pattern = format!("{prefix}*");
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
                .map_err(|e| map_redis_error(e, &pattern))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn put_hash(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<(), QueueError> {
        let mut pipe = ::redis::pipe();
        pipe.atomic()
            .del(key)
            .ignore()
            .hset_multiple(key, fields)
            .ignore()
            .pexpire(key, ttl_millis(ttl))
            .ignore();
        pipe.query_async::<()>(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))
    }

    async fn get_hash(&self, key: &str) -> Result<HashMap<String, String>, QueueError> {
        self.conn
            .clone()
            .hgetall(key)
            .await
            .map_err(|e| map_redis_error(e, key))
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, QueueError> {
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, QueueError> {
        let deleted: i64 = Script::new(LUA_DELETE_IF_EQUALS)
            .key(key)
            .arg(value)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_is_at_least_one_millisecond() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(15)), 15_000);
    }
}
