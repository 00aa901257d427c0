//! A thin client abstraction over the shared Redis instance.
//!
//! Everything the broker persists (job envelopes, queue lists, device
//! leases, cached command output, monitoring counters) goes through this
//! trait, so the whole pipeline can be exercised in tests against the
//! in-memory [`MemoryKv`] implementation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::time::timeout;

// Commands other than blocking pops are expected to return well under this.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum KvError {
    #[error("key not found")]
    NotFound,
    #[error("redis command timed out")]
    Timeout,
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type KvResult<T> = Result<T, KvError>;

/// The subset of Redis the broker relies on.
///
/// Scores and TTLs are plain numbers; values are UTF-8 strings (the broker
/// stores JSON documents).
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn get(&self, k: String) -> KvResult<String>;
    async fn set(&self, k: String, v: String) -> KvResult<()>;
    async fn setex(&self, k: String, v: String, seconds: u64) -> KvResult<()>;
    /// SET NX EX: returns true if the key was set, false if it already existed.
    async fn set_nx_ex(&self, k: String, v: String, seconds: u64) -> KvResult<bool>;
    async fn del(&self, k: String) -> KvResult<()>;
    async fn expire(&self, k: String, seconds: u64) -> KvResult<()>;
    async fn mget(&self, keys: Vec<String>) -> KvResult<Vec<Option<String>>>;

    async fn lpush(&self, k: String, v: String) -> KvResult<()>;
    /// LPUSH followed by LTRIM, for capped streams of recent records.
    async fn lpush_capped(&self, k: String, v: String, max_len: usize) -> KvResult<()>;
    async fn lrange(&self, k: String, start: isize, stop: isize) -> KvResult<Vec<String>>;
    /// Blocking right-pop with a timeout in seconds. `None` on timeout.
    async fn brpop(&self, k: String, timeout_s: u64) -> KvResult<Option<String>>;

    async fn sadd(&self, k: String, member: String) -> KvResult<()>;
    async fn srem(&self, k: String, member: String) -> KvResult<()>;
    async fn smembers(&self, k: String) -> KvResult<Vec<String>>;

    async fn zadd(&self, k: String, member: String, score: f64) -> KvResult<()>;
    async fn zrangebyscore(&self, k: String, min: String, max: String) -> KvResult<Vec<String>>;
    async fn zrem(&self, k: String, member: String) -> KvResult<()>;

    async fn hincrby(&self, k: String, field: String, by: i64) -> KvResult<()>;
    async fn hgetall(&self, k: String) -> KvResult<HashMap<String, String>>;

    async fn keys(&self, pattern: String) -> KvResult<Vec<String>>;
}

pub struct RedisKv {
    client: redis::Client,
}

impl RedisKv {
    pub fn new(addr: String) -> KvResult<RedisKv> {
        let client = redis::Client::open(addr)?;

        Ok(RedisKv { client })
    }

    async fn connection(&self) -> KvResult<redis::aio::Connection> {
        let conn = timeout(COMMAND_TIMEOUT, self.client.get_async_connection())
            .await
            .map_err(|_| KvError::Timeout)??;
        Ok(conn)
    }
}

#[async_trait]
impl KvClient for RedisKv {
    async fn get(&self, k: String) -> KvResult<String> {
        let mut conn = self.connection().await?;
        let value: Option<String> = timeout(COMMAND_TIMEOUT, conn.get(k))
            .await
            .map_err(|_| KvError::Timeout)??;
        value.ok_or(KvError::NotFound)
    }

    async fn set(&self, k: String, v: String) -> KvResult<()> {
        let mut conn = self.connection().await?;
        timeout(COMMAND_TIMEOUT, conn.set::<_, _, ()>(k, v))
            .await
            .map_err(|_| KvError::Timeout)??;
        Ok(())
    }

    async fn setex(&self, k: String, v: String, seconds: u64) -> KvResult<()> {
        let mut conn = self.connection().await?;
        timeout(
            COMMAND_TIMEOUT,
            conn.set_ex::<_, _, ()>(k, v, seconds as usize),
        )
        .await
        .map_err(|_| KvError::Timeout)??;
        Ok(())
    }

    async fn set_nx_ex(&self, k: String, v: String, seconds: u64) -> KvResult<bool> {
        let mut conn = self.connection().await?;
        let result: Option<String> = timeout(
            COMMAND_TIMEOUT,
            redis::cmd("SET")
                .arg(&k)
                .arg(&v)
                .arg("EX")
                .arg(seconds as usize)
                .arg("NX")
                .query_async(&mut conn),
        )
        .await
        .map_err(|_| KvError::Timeout)??;
        Ok(result.is_some())
    }

    async fn del(&self, k: String) -> KvResult<()> {
        let mut conn = self.connection().await?;
        timeout(COMMAND_TIMEOUT, conn.del::<_, ()>(k))
            .await
            .map_err(|_| KvError::Timeout)??;
        Ok(())
    }

    async fn expire(&self, k: String, seconds: u64) -> KvResult<()> {
        let mut conn = self.connection().await?;
        timeout(COMMAND_TIMEOUT, conn.expire::<_, ()>(k, seconds as usize))
            .await
            .map_err(|_| KvError::Timeout)??;
        Ok(())
    }

    async fn mget(&self, keys: Vec<String>) -> KvResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(vec![]);
        }
        let mut conn = self.connection().await?;
        // Pipelined GETs keep per-key Option semantics for any key count.
        let mut pipe = redis::pipe();
        for k in &keys {
            pipe.cmd("GET").arg(k);
        }
        let values: Vec<Option<String>> = timeout(COMMAND_TIMEOUT, pipe.query_async(&mut conn))
            .await
            .map_err(|_| KvError::Timeout)??;
        Ok(values)
    }

    async fn lpush(&self, k: String, v: String) -> KvResult<()> {
        let mut conn = self.connection().await?;
        timeout(COMMAND_TIMEOUT, conn.lpush::<_, _, ()>(k, v))
            .await
            .map_err(|_| KvError::Timeout)??;
        Ok(())
    }

    async fn lpush_capped(&self, k: String, v: String, max_len: usize) -> KvResult<()> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.cmd("LPUSH").arg(&k).arg(&v).ignore();
        pipe.cmd("LTRIM")
            .arg(&k)
            .arg(0)
            .arg(max_len as isize - 1)
            .ignore();
        timeout(COMMAND_TIMEOUT, pipe.query_async::<_, ()>(&mut conn))
            .await
            .map_err(|_| KvError::Timeout)??;
        Ok(())
    }

    async fn lrange(&self, k: String, start: isize, stop: isize) -> KvResult<Vec<String>> {
        let mut conn = self.connection().await?;
        let values = timeout(COMMAND_TIMEOUT, conn.lrange(k, start, stop))
            .await
            .map_err(|_| KvError::Timeout)??;
        Ok(values)
    }

    async fn brpop(&self, k: String, timeout_s: u64) -> KvResult<Option<String>> {
        let mut conn = self.connection().await?;
        // BRPOP returns (key, value); allow one extra second before declaring
        // the client-side timeout so the server-side one fires first.
        let popped: Option<(String, String)> = timeout(
            Duration::from_secs(timeout_s + 1),
            conn.brpop(k, timeout_s as f64),
        )
        .await
        .map_err(|_| KvError::Timeout)??;
        Ok(popped.map(|(_, v)| v))
    }

    async fn sadd(&self, k: String, member: String) -> KvResult<()> {
        let mut conn = self.connection().await?;
        timeout(COMMAND_TIMEOUT, conn.sadd::<_, _, ()>(k, member))
            .await
            .map_err(|_| KvError::Timeout)??;
        Ok(())
    }

    async fn srem(&self, k: String, member: String) -> KvResult<()> {
        let mut conn = self.connection().await?;
        timeout(COMMAND_TIMEOUT, conn.srem::<_, _, ()>(k, member))
            .await
            .map_err(|_| KvError::Timeout)??;
        Ok(())
    }

    async fn smembers(&self, k: String) -> KvResult<Vec<String>> {
        let mut conn = self.connection().await?;
        let members = timeout(COMMAND_TIMEOUT, conn.smembers(k))
            .await
            .map_err(|_| KvError::Timeout)??;
        Ok(members)
    }

    async fn zadd(&self, k: String, member: String, score: f64) -> KvResult<()> {
        let mut conn = self.connection().await?;
        timeout(COMMAND_TIMEOUT, conn.zadd::<_, _, _, ()>(k, member, score))
            .await
            .map_err(|_| KvError::Timeout)??;
        Ok(())
    }

    async fn zrangebyscore(&self, k: String, min: String, max: String) -> KvResult<Vec<String>> {
        let mut conn = self.connection().await?;
        let members = timeout(COMMAND_TIMEOUT, conn.zrangebyscore(k, min, max))
            .await
            .map_err(|_| KvError::Timeout)??;
        Ok(members)
    }

    async fn zrem(&self, k: String, member: String) -> KvResult<()> {
        let mut conn = self.connection().await?;
        timeout(COMMAND_TIMEOUT, conn.zrem::<_, _, ()>(k, member))
            .await
            .map_err(|_| KvError::Timeout)??;
        Ok(())
    }

    async fn hincrby(&self, k: String, field: String, by: i64) -> KvResult<()> {
        let mut conn = self.connection().await?;
        timeout(COMMAND_TIMEOUT, conn.hincr::<_, _, _, ()>(k, field, by))
            .await
            .map_err(|_| KvError::Timeout)??;
        Ok(())
    }

    async fn hgetall(&self, k: String) -> KvResult<HashMap<String, String>> {
        let mut conn = self.connection().await?;
        let fields = timeout(COMMAND_TIMEOUT, conn.hgetall(k))
            .await
            .map_err(|_| KvError::Timeout)??;
        Ok(fields)
    }

    async fn keys(&self, pattern: String) -> KvResult<Vec<String>> {
        let mut conn = self.connection().await?;
        let found = timeout(COMMAND_TIMEOUT, conn.keys(pattern))
            .await
            .map_err(|_| KvError::Timeout)??;
        Ok(found)
    }
}

/// In-memory stand-in for Redis, for tests and local development.
///
/// Behaves like the real thing for the commands above, including TTL expiry
/// (checked lazily) and glob-style `keys` patterns limited to a trailing `*`.
#[derive(Default)]
pub struct MemoryKv {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    strings: HashMap<String, (String, Option<Instant>)>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, HashSet<String>>,
    zsets: HashMap<String, Vec<(String, f64)>>,
    hashes: HashMap<String, HashMap<String, i64>>,
}

impl MemoryState {
    fn live_string(&mut self, k: &str) -> Option<String> {
        let expired = matches!(
            self.strings.get(k),
            Some((_, Some(expiry))) if *expiry <= Instant::now()
        );
        if expired {
            self.strings.remove(k);
            return None;
        }
        self.strings.get(k).map(|(v, _)| v.clone())
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvClient for MemoryKv {
    async fn get(&self, k: String) -> KvResult<String> {
        let mut state = self.state.lock().unwrap();
        state.live_string(&k).ok_or(KvError::NotFound)
    }

    async fn set(&self, k: String, v: String) -> KvResult<()> {
        let mut state = self.state.lock().unwrap();
        state.strings.insert(k, (v, None));
        Ok(())
    }

    async fn setex(&self, k: String, v: String, seconds: u64) -> KvResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .strings
            .insert(k, (v, Some(Instant::now() + Duration::from_secs(seconds))));
        Ok(())
    }

    async fn set_nx_ex(&self, k: String, v: String, seconds: u64) -> KvResult<bool> {
        let mut state = self.state.lock().unwrap();
        if state.live_string(&k).is_some() {
            return Ok(false);
        }
        state
            .strings
            .insert(k, (v, Some(Instant::now() + Duration::from_secs(seconds))));
        Ok(true)
    }

    async fn del(&self, k: String) -> KvResult<()> {
        let mut state = self.state.lock().unwrap();
        state.strings.remove(&k);
        state.lists.remove(&k);
        state.sets.remove(&k);
        state.zsets.remove(&k);
        state.hashes.remove(&k);
        Ok(())
    }

    async fn expire(&self, k: String, seconds: u64) -> KvResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some((_, expiry)) = state.strings.get_mut(&k) {
            *expiry = Some(Instant::now() + Duration::from_secs(seconds));
        }
        Ok(())
    }

    async fn mget(&self, keys: Vec<String>) -> KvResult<Vec<Option<String>>> {
        let mut state = self.state.lock().unwrap();
        Ok(keys.iter().map(|k| state.live_string(k)).collect())
    }

    async fn lpush(&self, k: String, v: String) -> KvResult<()> {
        let mut state = self.state.lock().unwrap();
        state.lists.entry(k).or_default().push_front(v);
        Ok(())
    }

    async fn lpush_capped(&self, k: String, v: String, max_len: usize) -> KvResult<()> {
        let mut state = self.state.lock().unwrap();
        let list = state.lists.entry(k).or_default();
        list.push_front(v);
        list.truncate(max_len);
        Ok(())
    }

    async fn lrange(&self, k: String, start: isize, stop: isize) -> KvResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        let Some(list) = state.lists.get(&k) else {
            return Ok(vec![]);
        };
        let len = list.len() as isize;
        let clamp = |i: isize| -> usize {
            let i = if i < 0 { len + i } else { i };
            i.clamp(0, len) as usize
        };
        let (start, stop) = (clamp(start), clamp(stop));
        Ok(list
            .iter()
            .skip(start)
            .take(stop.saturating_sub(start) + 1)
            .cloned()
            .collect())
    }

    async fn brpop(&self, k: String, timeout_s: u64) -> KvResult<Option<String>> {
        let deadline = Instant::now() + Duration::from_secs(timeout_s);
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(list) = state.lists.get_mut(&k) {
                    if let Some(v) = list.pop_back() {
                        return Ok(Some(v));
                    }
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn sadd(&self, k: String, member: String) -> KvResult<()> {
        let mut state = self.state.lock().unwrap();
        state.sets.entry(k).or_default().insert(member);
        Ok(())
    }

    async fn srem(&self, k: String, member: String) -> KvResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(set) = state.sets.get_mut(&k) {
            set.remove(&member);
        }
        Ok(())
    }

    async fn smembers(&self, k: String) -> KvResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .sets
            .get(&k)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn zadd(&self, k: String, member: String, score: f64) -> KvResult<()> {
        let mut state = self.state.lock().unwrap();
        let zset = state.zsets.entry(k).or_default();
        zset.retain(|(m, _)| m != &member);
        zset.push((member, score));
        zset.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(())
    }

    async fn zrangebyscore(&self, k: String, min: String, max: String) -> KvResult<Vec<String>> {
        let min: f64 = match min.as_str() {
            "-inf" => f64::NEG_INFINITY,
            s => s.parse().unwrap_or(f64::NEG_INFINITY),
        };
        let max: f64 = match max.as_str() {
            "+inf" | "inf" => f64::INFINITY,
            s => s.parse().unwrap_or(f64::INFINITY),
        };
        let state = self.state.lock().unwrap();
        Ok(state
            .zsets
            .get(&k)
            .map(|zset| {
                zset.iter()
                    .filter(|(_, score)| *score >= min && *score <= max)
                    .map(|(m, _)| m.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn zrem(&self, k: String, member: String) -> KvResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(zset) = state.zsets.get_mut(&k) {
            zset.retain(|(m, _)| m != &member);
        }
        Ok(())
    }

    async fn hincrby(&self, k: String, field: String, by: i64) -> KvResult<()> {
        let mut state = self.state.lock().unwrap();
        *state.hashes.entry(k).or_default().entry(field).or_insert(0) += by;
        Ok(())
    }

    async fn hgetall(&self, k: String) -> KvResult<HashMap<String, String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .hashes
            .get(&k)
            .map(|h| h.iter().map(|(f, v)| (f.clone(), v.to_string())).collect())
            .unwrap_or_default())
    }

    async fn keys(&self, pattern: String) -> KvResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        let matches = |k: &str| match pattern.strip_suffix('*') {
            Some(prefix) => k.starts_with(prefix),
            None => k == pattern,
        };
        let mut found: Vec<String> = state
            .strings
            .keys()
            .filter(|k| matches(k))
            .cloned()
            .collect();
        found.sort();
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_kv_set_nx_ex_respects_existing_keys() {
        let kv = MemoryKv::new();
        assert!(kv
            .set_nx_ex("lock".to_string(), "a".to_string(), 30)
            .await
            .unwrap());
        assert!(!kv
            .set_nx_ex("lock".to_string(), "b".to_string(), 30)
            .await
            .unwrap());
        assert_eq!(kv.get("lock".to_string()).await.unwrap(), "a");

        kv.del("lock".to_string()).await.unwrap();
        assert!(kv
            .set_nx_ex("lock".to_string(), "b".to_string(), 30)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn memory_kv_lists_pop_in_fifo_order() {
        let kv = MemoryKv::new();
        kv.lpush("q".to_string(), "one".to_string()).await.unwrap();
        kv.lpush("q".to_string(), "two".to_string()).await.unwrap();

        assert_eq!(
            kv.brpop("q".to_string(), 0).await.unwrap(),
            Some("one".to_string())
        );
        assert_eq!(
            kv.brpop("q".to_string(), 0).await.unwrap(),
            Some("two".to_string())
        );
        assert_eq!(kv.brpop("q".to_string(), 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_kv_zset_range_by_score() {
        let kv = MemoryKv::new();
        kv.zadd("sched".to_string(), "late".to_string(), 100.0)
            .await
            .unwrap();
        kv.zadd("sched".to_string(), "due".to_string(), 10.0)
            .await
            .unwrap();

        let due = kv
            .zrangebyscore("sched".to_string(), "-inf".to_string(), "50".to_string())
            .await
            .unwrap();
        assert_eq!(due, vec!["due".to_string()]);
    }

    #[tokio::test]
    async fn memory_kv_capped_list_truncates() {
        let kv = MemoryKv::new();
        for i in 0..5 {
            kv.lpush_capped("recent".to_string(), i.to_string(), 3)
                .await
                .unwrap();
        }
        let entries = kv.lrange("recent".to_string(), 0, -1).await.unwrap();
        assert_eq!(entries, vec!["4", "3", "2"]);
    }
}
