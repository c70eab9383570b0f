use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::error::PoolResult;
use crate::kv::{KvOp, KvStore};

const SUBSCRIPTION_BUFFER: usize = 1024;

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Writes go to the primary, plain reads to the replica.
pub struct RedisKv {
    client: Client,
    write: ConnectionManager,
    read: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(write_url: &str, read_url: &str) -> PoolResult<Self> {
        let client = Client::open(write_url)?;
        let write = ConnectionManager::new(client.clone()).await?;
        let read = if read_url == write_url {
            write.clone()
        } else {
            ConnectionManager::new(Client::open(read_url)?).await?
        };
        info!(target: "server_log", "connected to kv store at {}", write_url);
        Ok(RedisKv {
            client,
            write,
            read,
        })
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> PoolResult<Option<String>> {
        let mut conn = self.read.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> PoolResult<()> {
        let mut conn = self.write.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> PoolResult<bool> {
        let mut conn = self.write.clone();
        let res: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(res.is_some())
    }

    async fn del(&self, key: &str) -> PoolResult<()> {
        let mut conn = self.write.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> PoolResult<bool> {
        let mut conn = self.write.clone();
        let deleted: i64 = Script::new(COMPARE_AND_DELETE)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn take(&self, key: &str) -> PoolResult<Option<String>> {
        let mut conn = self.write.clone();
        let value: Option<String> = redis::cmd("GETDEL").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> PoolResult<Vec<String>> {
        let mut conn = self.read.clone();
        let values: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn zrange_with_scores(&self, key: &str) -> PoolResult<Vec<(String, f64)>> {
        let mut conn = self.read.clone();
        let values: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn sadd(&self, key: &str, member: &str) -> PoolResult<bool> {
        let mut conn = self.write.clone();
        let added: i64 = redis::cmd("SADD").arg(key).arg(member).query_async(&mut conn).await?;
        Ok(added == 1)
    }

    async fn smembers(&self, key: &str) -> PoolResult<Vec<String>> {
        let mut conn = self.read.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
        Ok(members)
    }

    async fn srem(&self, key: &str, member: &str) -> PoolResult<()> {
        let mut conn = self.write.clone();
        let _: i64 = redis::cmd("SREM").arg(key).arg(member).query_async(&mut conn).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> PoolResult<Option<String>> {
        let mut conn = self.read.clone();
        let value: Option<String> = redis::cmd("HGET").arg(key).arg(field).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> PoolResult<()> {
        let mut conn = self.write.clone();
        let _: i64 = redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn exec(&self, ops: Vec<KvOp>) -> PoolResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                KvOp::Set { key, value } => {
                    pipe.cmd("SET").arg(key).arg(value).ignore();
                }
                KvOp::Del { key } => {
                    pipe.cmd("DEL").arg(key).ignore();
                }
                KvOp::IncrBy { key, by } => {
                    pipe.cmd("INCRBY").arg(key).arg(by).ignore();
                }
                KvOp::LPush { key, value } => {
                    pipe.cmd("LPUSH").arg(key).arg(value).ignore();
                }
                KvOp::LTrim { key, start, stop } => {
                    pipe.cmd("LTRIM").arg(key).arg(start).arg(stop).ignore();
                }
                KvOp::ZIncrBy { key, member, by } => {
                    pipe.cmd("ZINCRBY").arg(key).arg(by).arg(member).ignore();
                }
                KvOp::SAdd { key, member } => {
                    pipe.cmd("SADD").arg(key).arg(member).ignore();
                }
                KvOp::Expire { key, ttl } => {
                    pipe.cmd("PEXPIRE").arg(key).arg(ttl.as_millis() as u64).ignore();
                }
            }
        }
        let mut conn = self.write.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> PoolResult<()> {
        let mut conn = self.write.clone();
        let _: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> PoolResult<mpsc::Receiver<String>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!(target: "server_log", "bad payload on {}: {:?}", channel, e);
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}
