use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use thiserror::Error;

/* ============================= ERRORS ============================= */

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for KvError {
    fn from(e: redis::RedisError) -> Self {
        KvError::Backend(e.to_string())
    }
}

pub type KvResult<T> = Result<T, KvError>;

/* ============================= BATCH OPS ============================= */

/// One write operation in an atomic batch.
///
/// Batches execute as a single pipeline on the Redis backend and under a
/// single lock on the memory backend, so multi-op sequences (record +
/// index + cache) cannot interleave with other writers.
#[derive(Debug, Clone)]
pub enum KvOp {
    Set { key: String, value: String, ttl: Option<u64> },
    Del { key: String },
    HSetAll { key: String, fields: Vec<(String, String)> },
    HSet { key: String, field: String, value: String },
    HIncr { key: String, field: String, by: i64 },
    HIncrFloat { key: String, field: String, by: f64 },
    IncrExpire { key: String, ttl: u64 },
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
    Expire { key: String, ttl: u64 },
}

/* ============================= TRAIT ============================= */

/// Adapter over the shared key-value store.
///
/// The service assumes at-most-one-writer-per-key within the process and
/// relies on the store for cross-process atomicity of counter increments.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> KvResult<Option<String>>;
    async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, String>>;
    async fn smembers(&self, key: &str) -> KvResult<Vec<String>>;
    async fn exists(&self, key: &str) -> KvResult<bool>;
    async fn scan_prefix(&self, prefix: &str) -> KvResult<Vec<String>>;
    async fn exec(&self, ops: Vec<KvOp>) -> KvResult<()>;
    async fn ping(&self) -> KvResult<()>;

    // ── single-op conveniences ──

    async fn set_ex(&self, key: &str, value: &str, ttl: u64) -> KvResult<()> {
        self.exec(vec![KvOp::Set {
            key: key.to_string(),
            value: value.to_string(),
            ttl: Some(ttl),
        }])
        .await
    }

    async fn del(&self, key: &str) -> KvResult<()> {
        self.exec(vec![KvOp::Del { key: key.to_string() }]).await
    }

    async fn incr_expire(&self, key: &str, ttl: u64) -> KvResult<()> {
        self.exec(vec![KvOp::IncrExpire { key: key.to_string(), ttl }])
            .await
    }
}

/* ============================= REDIS BACKEND ============================= */

/// Production backend over a multiplexed Redis connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> KvResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn smembers(&self, key: &str) -> KvResult<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn scan_prefix(&self, prefix: &str) -> KvResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut iter = conn.scan_match::<_, String>(pattern).await?;
        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn exec(&self, ops: Vec<KvOp>) -> KvResult<()> {
        let mut pipe = redis::pipe();
        for op in ops {
            match op {
                KvOp::Set { key, value, ttl } => {
                    match ttl {
                        Some(ttl) => pipe.set_ex(key, value, ttl),
                        None => pipe.set(key, value),
                    };
                }
                KvOp::Del { key } => {
                    pipe.del(key);
                }
                KvOp::HSetAll { key, fields } => {
                    pipe.hset_multiple(key, &fields);
                }
                KvOp::HSet { key, field, value } => {
                    pipe.hset(key, field, value);
                }
                KvOp::HIncr { key, field, by } => {
                    pipe.hincr(key, field, by);
                }
                KvOp::HIncrFloat { key, field, by } => {
                    pipe.cmd("HINCRBYFLOAT").arg(key).arg(field).arg(by);
                }
                KvOp::IncrExpire { key, ttl } => {
                    pipe.incr(&key, 1).expire(&key, ttl as i64);
                }
                KvOp::SAdd { key, member } => {
                    pipe.sadd(key, member);
                }
                KvOp::SRem { key, member } => {
                    pipe.srem(key, member);
                }
                KvOp::Expire { key, ttl } => {
                    pipe.expire(key, ttl as i64);
                }
            }
        }
        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn ping(&self) -> KvResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}

/* ============================= MEMORY BACKEND ============================= */

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|t| Instant::now() >= t)
    }
}

/// In-process backend used by tests and as the degraded-mode fallback
/// when no Redis endpoint is reachable. Honours TTLs lazily on read.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        // A poisoned lock means a panic mid-write; propagating the panic
        // is the only sound option for test infrastructure.
        self.entries.lock().expect("memory store lock poisoned")
    }

    fn live<'a>(
        map: &'a mut HashMap<String, Entry>,
        key: &str,
    ) -> Option<&'a mut Entry> {
        if map.get(key).is_some_and(|e| e.expired()) {
            map.remove(key);
        }
        map.get_mut(key)
    }

    fn apply(map: &mut HashMap<String, Entry>, op: KvOp) {
        match op {
            KvOp::Set { key, value, ttl } => {
                map.insert(
                    key,
                    Entry {
                        value: Value::Str(value),
                        expires_at: ttl.map(|t| Instant::now() + Duration::from_secs(t)),
                    },
                );
            }
            KvOp::Del { key } => {
                map.remove(&key);
            }
            KvOp::HSetAll { key, fields } => {
                let entry = Self::hash_entry(map, key);
                if let Value::Hash(h) = &mut entry.value {
                    h.extend(fields);
                }
            }
            KvOp::HSet { key, field, value } => {
                let entry = Self::hash_entry(map, key);
                if let Value::Hash(h) = &mut entry.value {
                    h.insert(field, value);
                }
            }
            KvOp::HIncr { key, field, by } => {
                let entry = Self::hash_entry(map, key);
                if let Value::Hash(h) = &mut entry.value {
                    let current: i64 = h.get(&field).and_then(|v| v.parse().ok()).unwrap_or(0);
                    h.insert(field, (current + by).to_string());
                }
            }
            KvOp::HIncrFloat { key, field, by } => {
                let entry = Self::hash_entry(map, key);
                if let Value::Hash(h) = &mut entry.value {
                    let current: f64 = h.get(&field).and_then(|v| v.parse().ok()).unwrap_or(0.0);
                    h.insert(field, format!("{}", current + by));
                }
            }
            KvOp::IncrExpire { key, ttl } => {
                let expires_at = Some(Instant::now() + Duration::from_secs(ttl));
                match Self::live(map, &key) {
                    Some(entry) => {
                        if let Value::Str(s) = &mut entry.value {
                            let n: i64 = s.parse().unwrap_or(0);
                            *s = (n + 1).to_string();
                        }
                        entry.expires_at = expires_at;
                    }
                    None => {
                        map.insert(
                            key,
                            Entry { value: Value::Str("1".to_string()), expires_at },
                        );
                    }
                }
            }
            KvOp::SAdd { key, member } => {
                let entry = map.entry(key).or_insert_with(|| Entry {
                    value: Value::Set(HashSet::new()),
                    expires_at: None,
                });
                if let Value::Set(s) = &mut entry.value {
                    s.insert(member);
                }
            }
            KvOp::SRem { key, member } => {
                if let Some(entry) = Self::live(map, &key)
                    && let Value::Set(s) = &mut entry.value
                {
                    s.remove(&member);
                }
            }
            KvOp::Expire { key, ttl } => {
                if let Some(entry) = Self::live(map, &key) {
                    entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl));
                }
            }
        }
    }

    fn hash_entry(map: &mut HashMap<String, Entry>, key: String) -> &mut Entry {
        if map.get(&key).is_some_and(|e| e.expired()) {
            map.remove(&key);
        }
        map.entry(key).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        })
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut map = self.lock();
        Ok(Self::live(&mut map, key).and_then(|e| match &e.value {
            Value::Str(s) => Some(s.clone()),
            _ => None,
        }))
    }

    async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, String>> {
        let mut map = self.lock();
        Ok(Self::live(&mut map, key)
            .and_then(|e| match &e.value {
                Value::Hash(h) => Some(h.clone()),
                _ => None,
            })
            .unwrap_or_default())
    }

    async fn smembers(&self, key: &str) -> KvResult<Vec<String>> {
        let mut map = self.lock();
        Ok(Self::live(&mut map, key)
            .and_then(|e| match &e.value {
                Value::Set(s) => Some(s.iter().cloned().collect()),
                _ => None,
            })
            .unwrap_or_default())
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        let mut map = self.lock();
        Ok(Self::live(&mut map, key).is_some())
    }

    async fn scan_prefix(&self, prefix: &str) -> KvResult<Vec<String>> {
        let mut map = self.lock();
        map.retain(|_, e| !e.expired());
        Ok(map.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }

    async fn exec(&self, ops: Vec<KvOp>) -> KvResult<()> {
        let mut map = self.lock();
        for op in ops {
            Self::apply(&mut map, op);
        }
        Ok(())
    }

    async fn ping(&self) -> KvResult<()> {
        Ok(())
    }
}

/* ============================= TESTS ============================= */
