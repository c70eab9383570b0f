//! Live per-miner event streams.
//!
//! Writers publish miner events on `{env}:pool:stream:{miner_id}`, but only
//! for miners somebody is watching. Watching is announced by the fanout: each
//! open miner stream publishes `ack:{miner_id}` on the stream index every few
//! seconds, and writers keep the last ack per miner in an [`AckIndex`].

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::Router;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::PoolResult;
use crate::kv::{Keys, KvStore, ShareKind};

pub const ACK_INTERVAL: Duration = Duration::from_secs(3);
pub const ACK_TIMEOUT: Duration = Duration::from_secs(15);
pub const ACK_GC_INTERVAL: Duration = Duration::from_secs(60);
const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Connect { worker: String },
    Disconnect { worker: String },
    Error { worker: String, message: String },
    Share { worker: String, status: ShareKind, height: u64 },
    Retarget { worker: String, difficulty: f64 },
}

fn ack_message(miner_id: i64) -> String {
    format!("ack:{}", miner_id)
}

pub fn parse_ack(message: &str) -> Option<i64> {
    message.strip_prefix("ack:")?.parse().ok()
}

struct MinerStream {
    subscribers: HashMap<u64, mpsc::Sender<String>>,
    cancel: CancellationToken,
}

pub struct Subscription {
    pub miner_id: i64,
    pub id: u64,
    pub events: mpsc::Receiver<String>,
}

/// Fans miner events out to every HTTP subscriber of that miner.
pub struct StreamFanout {
    kv: Arc<dyn KvStore>,
    keys: Keys,
    streams: RwLock<HashMap<i64, MinerStream>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl StreamFanout {
    pub fn new(kv: Arc<dyn KvStore>, keys: Keys, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(StreamFanout {
            kv,
            keys,
            streams: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown,
        })
    }

    pub async fn subscribe(self: &Arc<Self>, miner_id: i64) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, events) = mpsc::channel(SUBSCRIBER_BUFFER);

        let mut streams = self.streams.write().await;
        let stream = streams.entry(miner_id).or_insert_with(|| {
            let cancel = self.shutdown.child_token();
            tokio::spawn(run_stream(self.clone(), miner_id, cancel.clone()));
            info!(target: "server_log", "stream {}: opened", miner_id);
            MinerStream {
                subscribers: HashMap::new(),
                cancel,
            }
        });
        stream.subscribers.insert(id, sender);
        Subscription { miner_id, id, events }
    }

    /// Removes one subscription; the miner's stream closes with its last one.
    pub async fn unsubscribe(&self, miner_id: i64, id: u64) {
        let mut streams = self.streams.write().await;
        let empty = match streams.get_mut(&miner_id) {
            Some(stream) => {
                stream.subscribers.remove(&id);
                stream.subscribers.is_empty()
            }
            None => return,
        };
        if empty {
            if let Some(stream) = streams.remove(&miner_id) {
                stream.cancel.cancel();
            }
            info!(target: "server_log", "stream {}: closed", miner_id);
        }
    }

    /// Hands `message` to every subscriber of the miner without waiting; a
    /// subscriber with a full buffer misses it. Returns the deliveries.
    pub async fn broadcast(&self, miner_id: i64, message: &str) -> usize {
        let streams = self.streams.read().await;
        let stream = match streams.get(&miner_id) {
            Some(stream) => stream,
            None => return 0,
        };
        let mut delivered = 0;
        for (id, sender) in stream.subscribers.iter() {
            match sender.try_send(message.to_string()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(target: "server_log", "stream {}: subscriber {} is behind, event dropped", miner_id, id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    pub async fn subscriber_count(&self, miner_id: i64) -> usize {
        self.streams
            .read()
            .await
            .get(&miner_id)
            .map_or(0, |stream| stream.subscribers.len())
    }

    pub async fn close_all(&self) {
        let mut streams = self.streams.write().await;
        for (_, stream) in streams.drain() {
            stream.cancel.cancel();
        }
    }
}

/// Relays the miner's KV channel to its subscribers and keeps the ack
/// heartbeat going until the stream is closed.
async fn run_stream(fanout: Arc<StreamFanout>, miner_id: i64, cancel: CancellationToken) {
    let channel = fanout.keys.stream(miner_id);
    let mut events = match fanout.kv.subscribe(&channel).await {
        Ok(events) => events,
        Err(e) => {
            warn!(target: "server_log", "stream {}: failed to subscribe to {}: {:?}", miner_id, channel, e);
            return;
        }
    };
    let index = fanout.keys.stream_index();
    let mut heartbeat = tokio::time::interval(ACK_INTERVAL);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = heartbeat.tick() => {
                if let Err(e) = fanout.kv.publish(&index, &ack_message(miner_id)).await {
                    warn!(target: "server_log", "stream {}: ack failed: {:?}", miner_id, e);
                }
            }
            message = events.recv() => match message {
                Some(message) => {
                    fanout.broadcast(miner_id, &message).await;
                }
                None => break,
            },
        }
    }
}

/// Last ack per watched miner, kept on the writer side.
#[derive(Default)]
pub struct AckIndex {
    acks: RwLock<HashMap<i64, Instant>>,
}

impl AckIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ack(&self, miner_id: i64) {
        self.acks.write().await.insert(miner_id, Instant::now());
    }

    pub async fn is_watched(&self, miner_id: i64) -> bool {
        self.acks
            .read()
            .await
            .get(&miner_id)
            .map_or(false, |at| at.elapsed() <= ACK_TIMEOUT)
    }

    /// Forgets miners whose last ack is older than the timeout.
    pub async fn gc(&self) -> usize {
        let mut acks = self.acks.write().await;
        let before = acks.len();
        acks.retain(|_, at| at.elapsed() <= ACK_TIMEOUT);
        before - acks.len()
    }
}

/// Feeds the ack index from the stream index channel.
pub async fn ack_index_system(kv: Arc<dyn KvStore>, keys: Keys, index: Arc<AckIndex>, cancel: CancellationToken) {
    let channel = keys.stream_index();
    let mut acks = match kv.subscribe(&channel).await {
        Ok(acks) => acks,
        Err(e) => {
            warn!(target: "server_log", "failed to subscribe to {}: {:?}", channel, e);
            return;
        }
    };
    let mut gc = tokio::time::interval(ACK_GC_INTERVAL);
    gc.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = gc.tick() => {
                let dropped = index.gc().await;
                if dropped > 0 {
                    debug!(target: "server_log", "ack index: forgot {} miners", dropped);
                }
            }
            message = acks.recv() => match message {
                Some(message) => match parse_ack(&message) {
                    Some(miner_id) => index.ack(miner_id).await,
                    None => debug!(target: "server_log", "ack index: ignoring {}", message),
                },
                None => break,
            },
        }
    }
}

/// Publishes miner events, skipping miners nobody watches.
#[derive(Clone)]
pub struct StreamWriter {
    kv: Arc<dyn KvStore>,
    keys: Keys,
    index: Arc<AckIndex>,
}

impl StreamWriter {
    pub fn new(kv: Arc<dyn KvStore>, keys: Keys, index: Arc<AckIndex>) -> Self {
        StreamWriter { kv, keys, index }
    }

    /// True when the event was published.
    pub async fn emit(&self, miner_id: i64, event: &StreamEvent) -> PoolResult<bool> {
        if !self.index.is_watched(miner_id).await {
            return Ok(false);
        }
        let message = serde_json::to_string(event)?;
        self.kv.publish(&self.keys.stream(miner_id), &message).await?;
        Ok(true)
    }
}

/// Unsubscribes when the HTTP client goes away and the body stream is
/// dropped.
struct SubscriptionGuard {
    fanout: Arc<StreamFanout>,
    miner_id: i64,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let fanout = self.fanout.clone();
        let (miner_id, id) = (self.miner_id, self.id);
        tokio::spawn(async move { fanout.unsubscribe(miner_id, id).await });
    }
}

async fn stream_handler(
    Path(miner_id): Path<i64>,
    State(fanout): State<Arc<StreamFanout>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = fanout.subscribe(miner_id).await;
    let guard = SubscriptionGuard {
        fanout: fanout.clone(),
        miner_id,
        id: subscription.id,
    };
    let events = stream::unfold((subscription.events, guard), |(mut events, guard)| async move {
        let message = events.recv().await?;
        Some((Ok(Event::default().data(message)), (events, guard)))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

pub fn router(fanout: Arc<StreamFanout>) -> Router {
    Router::new()
        .route("/miner/:miner_id/stream", get(stream_handler))
        .with_state(fanout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn setup() -> (Arc<MemoryKv>, Keys, Arc<StreamFanout>) {
        let kv = Arc::new(MemoryKv::new());
        let keys = Keys::new("test");
        let fanout = StreamFanout::new(kv.clone(), keys.clone(), CancellationToken::new());
        (kv, keys, fanout)
    }

    #[test]
    fn acks_and_events_parse() {
        assert_eq!(parse_ack("ack:42"), Some(42));
        assert_eq!(parse_ack("ack:x"), None);
        assert_eq!(parse_ack("hello"), None);

        let event = StreamEvent::Share {
            worker: "rig1".to_string(),
            status: ShareKind::Accepted,
            height: 7,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"share","worker":"rig1","status":"accepted","height":7}"#);
    }

    #[tokio::test]
    async fn subscriptions_get_unique_ids_and_close_the_stream() {
        let (_, _, fanout) = setup();
        let a = fanout.subscribe(7).await;
        let b = fanout.subscribe(7).await;
        assert_ne!(a.id, b.id);
        assert_eq!(fanout.subscriber_count(7).await, 2);

        assert_eq!(fanout.broadcast(7, "hi").await, 2);
        assert_eq!(fanout.broadcast(8, "nobody").await, 0);

        fanout.unsubscribe(7, a.id).await;
        assert_eq!(fanout.subscriber_count(7).await, 1);
        fanout.unsubscribe(7, b.id).await;
        assert_eq!(fanout.subscriber_count(7).await, 0);
        assert!(fanout.streams.read().await.is_empty());
    }

    #[tokio::test]
    async fn slow_subscriber_misses_events_without_blocking() {
        let (_, _, fanout) = setup();
        let mut slow = fanout.subscribe(7).await;
        for i in 0..SUBSCRIBER_BUFFER + 5 {
            fanout.broadcast(7, &i.to_string()).await;
        }
        let mut received = 0;
        while slow.events.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_BUFFER);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_index_expires_and_collects() {
        let index = AckIndex::new();
        index.ack(1).await;
        assert!(index.is_watched(1).await);
        assert!(!index.is_watched(2).await);

        tokio::time::advance(ACK_TIMEOUT + Duration::from_secs(1)).await;
        assert!(!index.is_watched(1).await);
        assert_eq!(index.gc().await, 1);
        assert_eq!(index.gc().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn events_reach_subscribers_once_the_writer_sees_acks() {
        let (kv, keys, fanout) = setup();
        let index = Arc::new(AckIndex::new());
        let cancel = CancellationToken::new();
        tokio::spawn(ack_index_system(kv.clone(), keys.clone(), index.clone(), cancel.clone()));
        tokio::task::yield_now().await;

        let writer = StreamWriter::new(kv.clone(), keys.clone(), index.clone());
        let event = StreamEvent::Retarget {
            worker: "rig1".to_string(),
            difficulty: 2.5,
        };
        assert!(!writer.emit(5, &event).await.unwrap());

        let mut subscription = fanout.subscribe(5).await;
        // first heartbeat fires right away
        for _ in 0..10 {
            if index.is_watched(5).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(index.is_watched(5).await);

        assert!(writer.emit(5, &event).await.unwrap());
        let message = subscription.events.recv().await.unwrap();
        let received: StreamEvent = serde_json::from_str(&message).unwrap();
        assert_eq!(received, event);

        fanout.unsubscribe(5, subscription.id).await;
        cancel.cancel();
    }
}
