use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{PoolError, PoolResult};
use crate::kv::{KvOp, KvStore};

const SUBSCRIPTION_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    Set(BTreeSet<String>),
    ZSet(BTreeMap<String, f64>),
    Hash(HashMap<String, String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    subscribers: HashMap<String, Vec<mpsc::Sender<String>>>,
}

impl State {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.expires_at.map_or(false, |at| at <= Instant::now()),
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get_mut(key)
    }

    fn entry_or(&mut self, key: &str, init: Value) -> &mut Entry {
        // drops an expired entry first
        let _ = self.live(key);
        self.entries.entry(key.to_string()).or_insert(Entry {
            value: init,
            expires_at: None,
        })
    }

    fn apply(&mut self, op: KvOp) -> PoolResult<()> {
        match op {
            KvOp::Set { key, value } => {
                self.entries.insert(
                    key,
                    Entry {
                        value: Value::Str(value),
                        expires_at: None,
                    },
                );
            }
            KvOp::Del { key } => {
                self.entries.remove(&key);
            }
            KvOp::IncrBy { key, by } => {
                let entry = self.entry_or(&key, Value::Str("0".into()));
                match &mut entry.value {
                    Value::Str(raw) => {
                        let current: i64 = raw
                            .parse()
                            .map_err(|_| PoolError::invalid(format!("{} is not an integer", key)))?;
                        *raw = (current + by).to_string();
                    }
                    _ => return Err(wrong_type(&key)),
                }
            }
            KvOp::LPush { key, value } => match &mut self.entry_or(&key, Value::List(VecDeque::new())).value {
                Value::List(list) => list.push_front(value),
                _ => return Err(wrong_type(&key)),
            },
            KvOp::LTrim { key, start, stop } => {
                if let Some(entry) = self.live(&key) {
                    match &mut entry.value {
                        Value::List(list) => {
                            let (from, to) = bounds(list.len(), start, stop);
                            let kept: VecDeque<String> = if from > to {
                                VecDeque::new()
                            } else {
                                list.iter().skip(from).take(to - from + 1).cloned().collect()
                            };
                            *list = kept;
                        }
                        _ => return Err(wrong_type(&key)),
                    }
                }
            }
            KvOp::ZIncrBy { key, member, by } => {
                match &mut self.entry_or(&key, Value::ZSet(BTreeMap::new())).value {
                    Value::ZSet(zset) => *zset.entry(member).or_insert(0.0) += by,
                    _ => return Err(wrong_type(&key)),
                }
            }
            KvOp::SAdd { key, member } => match &mut self.entry_or(&key, Value::Set(BTreeSet::new())).value {
                Value::Set(set) => {
                    set.insert(member);
                }
                _ => return Err(wrong_type(&key)),
            },
            KvOp::Expire { key, ttl } => {
                if let Some(entry) = self.live(&key) {
                    entry.expires_at = Some(Instant::now() + ttl);
                }
            }
        }
        Ok(())
    }
}

fn wrong_type(key: &str) -> PoolError {
    PoolError::invalid(format!("wrong type for {}", key))
}

/// Redis-style inclusive range with negative indices counted from the end.
fn bounds(len: usize, start: isize, stop: isize) -> (usize, usize) {
    let len = len as isize;
    let norm = |i: isize| if i < 0 { (len + i).max(0) } else { i };
    let from = norm(start);
    let to = norm(stop).min(len - 1);
    if len == 0 || from > to {
        return (1, 0);
    }
    (from as usize, to as usize)
}

/// In-process `KvStore` used by tests and single-node development runs.
#[derive(Default)]
pub struct MemoryKv {
    state: Mutex<State>,
}

impl MemoryKv {
    pub fn new() -> Self {
        MemoryKv::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> PoolResult<T>) -> PoolResult<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| PoolError::transient("memory kv poisoned"))?;
        f(&mut state)
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> PoolResult<Option<String>> {
        self.with(|s| match s.live(key) {
            Some(Entry {
                value: Value::Str(v), ..
            }) => Ok(Some(v.clone())),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> PoolResult<()> {
        self.with(|s| {
            s.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: ttl.map(|ttl| Instant::now() + ttl),
                },
            );
            Ok(())
        })
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> PoolResult<bool> {
        self.with(|s| {
            if s.live(key).is_some() {
                return Ok(false);
            }
            s.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            Ok(true)
        })
    }

    async fn del(&self, key: &str) -> PoolResult<()> {
        self.with(|s| {
            s.entries.remove(key);
            Ok(())
        })
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> PoolResult<bool> {
        self.with(|s| {
            let matches = matches!(
                s.live(key),
                Some(Entry { value: Value::Str(v), .. }) if v.as_str() == expected
            );
            if matches {
                s.entries.remove(key);
            }
            Ok(matches)
        })
    }

    async fn take(&self, key: &str) -> PoolResult<Option<String>> {
        self.with(|s| match s.live(key).map(|e| e.value.clone()) {
            Some(Value::Str(v)) => {
                s.entries.remove(key);
                Ok(Some(v))
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        })
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> PoolResult<Vec<String>> {
        self.with(|s| match s.live(key) {
            Some(Entry {
                value: Value::List(list), ..
            }) => {
                let (from, to) = bounds(list.len(), start, stop);
                if from > to {
                    return Ok(Vec::new());
                }
                Ok(list.iter().skip(from).take(to - from + 1).cloned().collect())
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        })
    }

    async fn zrange_with_scores(&self, key: &str) -> PoolResult<Vec<(String, f64)>> {
        self.with(|s| match s.live(key) {
            Some(Entry {
                value: Value::ZSet(zset), ..
            }) => {
                let mut members: Vec<(String, f64)> =
                    zset.iter().map(|(m, v)| (m.clone(), *v)).collect();
                members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                Ok(members)
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        })
    }

    async fn sadd(&self, key: &str, member: &str) -> PoolResult<bool> {
        self.with(|s| match &mut s.entry_or(key, Value::Set(BTreeSet::new())).value {
            Value::Set(set) => Ok(set.insert(member.to_string())),
            _ => Err(wrong_type(key)),
        })
    }

    async fn smembers(&self, key: &str) -> PoolResult<Vec<String>> {
        self.with(|s| match s.live(key) {
            Some(Entry {
                value: Value::Set(set), ..
            }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        })
    }

    async fn srem(&self, key: &str, member: &str) -> PoolResult<()> {
        self.with(|s| {
            if let Some(Entry {
                value: Value::Set(set), ..
            }) = s.live(key)
            {
                set.remove(member);
            }
            Ok(())
        })
    }

    async fn hget(&self, key: &str, field: &str) -> PoolResult<Option<String>> {
        self.with(|s| match s.live(key) {
            Some(Entry {
                value: Value::Hash(hash), ..
            }) => Ok(hash.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> PoolResult<()> {
        self.with(|s| match &mut s.entry_or(key, Value::Hash(HashMap::new())).value {
            Value::Hash(hash) => {
                hash.insert(field.to_string(), value.to_string());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        })
    }

    async fn exec(&self, ops: Vec<KvOp>) -> PoolResult<()> {
        self.with(|s| {
            for op in ops {
                s.apply(op)?;
            }
            Ok(())
        })
    }

    async fn publish(&self, channel: &str, message: &str) -> PoolResult<()> {
        self.with(|s| {
            if let Some(subs) = s.subscribers.get_mut(channel) {
                subs.retain(|tx| !tx.is_closed());
                for tx in subs.iter() {
                    let _ = tx.try_send(message.to_string());
                }
            }
            Ok(())
        })
    }

    async fn subscribe(&self, channel: &str) -> PoolResult<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.with(|s| {
            s.subscribers.entry(channel.to_string()).or_default().push(tx);
            Ok(())
        })?;
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn window_push_and_trim() {
        let kv = MemoryKv::new();
        for i in 0..5 {
            kv.exec(vec![
                KvOp::LPush {
                    key: "w".into(),
                    value: format!("{}", i),
                },
                KvOp::LTrim {
                    key: "w".into(),
                    start: 0,
                    stop: 2,
                },
            ])
            .await
            .unwrap();
        }
        assert_eq!(kv.lrange("w", 0, -1).await.unwrap(), vec!["4", "3", "2"]);
    }

    #[tokio::test]
    async fn counters_and_take() {
        let kv = MemoryKv::new();
        kv.exec(vec![
            KvOp::IncrBy { key: "c".into(), by: 3 },
            KvOp::IncrBy { key: "c".into(), by: 4 },
        ])
        .await
        .unwrap();
        assert_eq!(kv.take("c").await.unwrap().as_deref(), Some("7"));
        assert_eq!(kv.take("c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sadd_reports_duplicates() {
        let kv = MemoryKv::new();
        assert!(kv.sadd("s", "a").await.unwrap());
        assert!(!kv.sadd("s", "a").await.unwrap());
        kv.srem("s", "a").await.unwrap();
        assert!(kv.smembers("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn zincr_accumulates() {
        let kv = MemoryKv::new();
        kv.exec(vec![
            KvOp::ZIncrBy { key: "z".into(), member: "1:1".into(), by: 2.0 },
            KvOp::ZIncrBy { key: "z".into(), member: "1:1".into(), by: 3.0 },
            KvOp::ZIncrBy { key: "z".into(), member: "2:5".into(), by: 1.0 },
        ])
        .await
        .unwrap();
        assert_eq!(
            kv.zrange_with_scores("z").await.unwrap(),
            vec![("2:5".to_string(), 1.0), ("1:1".to_string(), 5.0)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn set_nx_respects_ttl() {
        let kv = MemoryKv::new();
        assert!(kv.set_nx("l", "a", Duration::from_secs(5)).await.unwrap());
        assert!(!kv.set_nx("l", "b", Duration::from_secs(5)).await.unwrap());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(kv.set_nx("l", "b", Duration::from_secs(5)).await.unwrap());
        assert!(!kv.compare_and_delete("l", "a").await.unwrap());
        assert!(kv.compare_and_delete("l", "b").await.unwrap());
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let kv = MemoryKv::new();
        let mut rx = kv.subscribe("chan").await.unwrap();
        kv.publish("chan", "hello").await.unwrap();
        kv.publish("other", "ignored").await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));
        assert!(rx.try_recv().is_err());
    }
}
