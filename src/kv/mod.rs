//! Hot state: share counters, interval sets, leases, caches and pub/sub.
//!
//! Everything in here may be lost between rollups; durable facts live in
//! the ledger.

pub mod memory;
pub mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::PoolResult;

pub use self::memory::MemoryKv;
pub use self::redis_store::RedisKv;

/// Write operations that can be batched into one atomic pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum KvOp {
    Set { key: String, value: String },
    Del { key: String },
    IncrBy { key: String, by: i64 },
    LPush { key: String, value: String },
    LTrim { key: String, start: isize, stop: isize },
    ZIncrBy { key: String, member: String, by: f64 },
    SAdd { key: String, member: String },
    Expire { key: String, ttl: Duration },
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> PoolResult<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> PoolResult<()>;
    /// `SET key value NX PX ttl`; true when the key was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> PoolResult<bool>;
    async fn del(&self, key: &str) -> PoolResult<()>;
    /// Deletes `key` only while it still holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> PoolResult<bool>;
    /// `GETDEL`
    async fn take(&self, key: &str) -> PoolResult<Option<String>>;
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> PoolResult<Vec<String>>;
    async fn zrange_with_scores(&self, key: &str) -> PoolResult<Vec<(String, f64)>>;
    /// True when the member was not yet in the set.
    async fn sadd(&self, key: &str, member: &str) -> PoolResult<bool>;
    async fn smembers(&self, key: &str) -> PoolResult<Vec<String>>;
    async fn srem(&self, key: &str, member: &str) -> PoolResult<()>;
    async fn hget(&self, key: &str, field: &str) -> PoolResult<Option<String>>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> PoolResult<()>;
    async fn exec(&self, ops: Vec<KvOp>) -> PoolResult<()>;
    async fn publish(&self, channel: &str, message: &str) -> PoolResult<()>;
    async fn subscribe(&self, channel: &str) -> PoolResult<mpsc::Receiver<String>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareKind {
    Accepted,
    Rejected,
    Invalid,
}

impl ShareKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShareKind::Accepted => "acc",
            ShareKind::Rejected => "rej",
            ShareKind::Invalid => "inv",
        }
    }

    pub fn all() -> [ShareKind; 3] {
        [ShareKind::Accepted, ShareKind::Rejected, ShareKind::Invalid]
    }
}

/// Key layout. Every key is prefixed with the environment name.
#[derive(Clone, Debug)]
pub struct Keys {
    env: String,
}

impl Keys {
    pub fn new(env: impl Into<String>) -> Self {
        Keys { env: env.into() }
    }

    pub fn env(&self) -> &str {
        &self.env
    }

    pub fn lease(&self, name: &str) -> String {
        format!("{}:cron:{}", self.env, name)
    }

    /// Pub/sub channel the stratum collaborator publishes shares on.
    pub fn shares(&self) -> String {
        format!("{}:pool:shares", self.env)
    }

    pub fn pplns_window(&self, chain: &str) -> String {
        format!("{}:pool:pplns:{}", self.env, chain)
    }

    pub fn round_counter(&self, chain: &str, kind: ShareKind) -> String {
        format!("{}:pool:round:{}:pplns:{}", self.env, chain, kind.as_str())
    }

    pub fn solo_round_counter(&self, chain: &str, miner_id: i64, kind: ShareKind) -> String {
        format!("{}:pool:round:{}:solo:{}:{}", self.env, chain, miner_id, kind.as_str())
    }

    pub fn interval(&self, chain: &str, kind: ShareKind, bucket: i64) -> String {
        format!("{}:pool:intv:{}:{}:{}", self.env, chain, kind.as_str(), bucket)
    }

    pub fn interval_registry(&self, chain: &str) -> String {
        format!("{}:pool:intv:{}:index", self.env, chain)
    }

    pub fn share_unique(&self, chain: &str, height: u64) -> String {
        format!("{}:pool:uniq:{}:{}", self.env, chain, height)
    }

    pub fn miners(&self, chain: &str) -> String {
        format!("{}:pool:miners:{}", self.env, chain)
    }

    pub fn workers(&self, miner_id: i64) -> String {
        format!("{}:pool:workers:{}", self.env, miner_id)
    }

    pub fn rates(&self, chain: &str) -> String {
        format!("{}:pool:rates:{}", self.env, chain)
    }

    pub fn stream(&self, miner_id: i64) -> String {
        format!("{}:pool:stream:{}", self.env, miner_id)
    }

    pub fn stream_index(&self) -> String {
        format!("{}:pool:stream:index", self.env)
    }

    pub fn rollup_last(&self, pipeline: &str, chain: &str) -> String {
        format!("{}:chrt:last:{}:{}", self.env, pipeline, chain)
    }

    pub fn cache(&self, name: &str) -> String {
        format!("{}:chrt:cache:{}", self.env, name)
    }
}

pub async fn cache_json<T: Serialize + ?Sized>(
    kv: &dyn KvStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> PoolResult<()> {
    let raw = serde_json::to_string(value)?;
    kv.set(key, &raw, Some(ttl)).await
}

pub async fn cached_json<T: DeserializeOwned>(kv: &dyn KvStore, key: &str) -> PoolResult<Option<T>> {
    match kv.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_prefixed_by_env() {
        let keys = Keys::new("prod");
        assert_eq!(keys.lease("blkunlock"), "prod:cron:blkunlock");
        assert_eq!(keys.pplns_window("ETC"), "prod:pool:pplns:ETC");
        assert_eq!(
            keys.interval("KAS", ShareKind::Rejected, 1_700_000_100),
            "prod:pool:intv:KAS:rej:1700000100"
        );
        assert_eq!(keys.rollup_last("shares", "ETC"), "prod:chrt:last:shares:ETC");
        assert_eq!(keys.cache("top:ETC"), "prod:chrt:cache:top:ETC");
    }

    #[tokio::test]
    async fn cache_json_round_trips_through_store() {
        let kv = MemoryKv::new();
        cache_json(&kv, "k", &vec![1u32, 2, 3], Duration::from_secs(60))
            .await
            .unwrap();
        let back: Option<Vec<u32>> = cached_json(&kv, "k").await.unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));
        let missing: Option<Vec<u32>> = cached_json(&kv, "nope").await.unwrap();
        assert!(missing.is_none());
    }
}
