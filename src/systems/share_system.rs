//! Share aggregation: turns the stratum share feed into KV counters and
//! pending rounds.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::amount::Amount;
use crate::app_database::AppDatabase;
use crate::chains::Chain;
use crate::context::PoolContext;
use crate::error::{PoolError, PoolResult};
use crate::kv::{Keys, KvOp, KvStore, ShareKind};
use crate::models::InsertRound;
use crate::notifier::Notifier;
use crate::stream::{ack_index_system, AckIndex, StreamEvent, StreamWriter};

pub const INTERVAL_SECS: i64 = 15 * 60;
const INTERVAL_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const UNIQUE_TTL: Duration = Duration::from_secs(30 * 60);
const ROUND_QUEUE: usize = 64;

/// A block found by the share, as reported by the stratum layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolvedBlock {
    pub hash: String,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub value: Option<Amount>,
    pub difficulty: f64,
    #[serde(default)]
    pub epoch_height: Option<u64>,
}

/// One validated share published on `{env}:pool:shares`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareSubmission {
    /// Chain the share was mined on.
    pub chain_id: String,
    /// Chain the miner's address belongs to, i.e. where it is paid.
    pub payout_chain_id: String,
    pub address: String,
    pub worker: String,
    pub status: ShareKind,
    #[serde(default)]
    pub solo: bool,
    #[serde(default)]
    pub hash: Option<String>,
    pub height: u64,
    /// unix seconds
    pub timestamp: i64,
    #[serde(default)]
    pub block: Option<SolvedBlock>,
}

/// Per-chain knobs the aggregator needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ShareParams {
    pub chain_id: String,
    pub window: usize,
    pub share_difficulty: f64,
}

impl ShareParams {
    pub fn for_chain(chain: &Chain) -> Self {
        ShareParams {
            chain_id: chain.id().to_string(),
            window: chain.config.pplns_window,
            share_difficulty: chain.config.share_difficulty,
        }
    }
}

/// A share whose miner and worker are already resolved to ledger ids.
#[derive(Debug, Clone, PartialEq)]
pub struct ShareEvent {
    pub miner_id: i64,
    pub worker_id: i64,
    pub status: ShareKind,
    pub solo: bool,
    pub hash: Option<String>,
    pub height: u64,
    pub timestamp: i64,
}

/// A solved round on its way to the ledger.
#[derive(Debug, Clone)]
pub struct SolvedRound {
    pub round: InsertRound,
    pub shares: Vec<(i64, i64)>,
}

pub fn interval_bucket(timestamp: i64) -> i64 {
    timestamp - timestamp.rem_euclid(INTERVAL_SECS)
}

pub fn luck(block_difficulty: f64, share_difficulty: f64, accepted: i64) -> f64 {
    if accepted <= 0 || share_difficulty <= 0.0 {
        return 0.0;
    }
    100.0 * block_difficulty / (share_difficulty * accepted as f64)
}

/// Counts window entries (`"{miner_id}:{worker_id}"`) per miner.
pub fn window_counts(entries: &[String]) -> Vec<(i64, i64)> {
    let mut counts: BTreeMap<i64, i64> = BTreeMap::new();
    for entry in entries {
        let miner = entry.split(':').next().and_then(|m| m.parse::<i64>().ok());
        match miner {
            Some(miner_id) => *counts.entry(miner_id).or_insert(0) += 1,
            None => warn!(target: "share_log", "bad pplns window entry {}", entry),
        }
    }
    counts.into_iter().collect()
}

fn unix_to_naive(timestamp: i64) -> NaiveDateTime {
    DateTime::from_timestamp(timestamp, 0)
        .unwrap_or_else(Utc::now)
        .naive_utc()
}

pub struct ShareAggregator {
    kv: Arc<dyn KvStore>,
    keys: Keys,
}

impl ShareAggregator {
    pub fn new(kv: Arc<dyn KvStore>, keys: Keys) -> Self {
        ShareAggregator { kv, keys }
    }

    /// Records one share. Returns false for an accepted share whose hash was
    /// already seen at that height; it is counted as rejected instead.
    pub async fn record(&self, params: &ShareParams, share: &ShareEvent) -> PoolResult<bool> {
        let chain = params.chain_id.as_str();
        let mut status = share.status;
        let mut unique = true;

        if status == ShareKind::Accepted {
            if let Some(hash) = &share.hash {
                let key = self.keys.share_unique(chain, share.height);
                unique = self.kv.sadd(&key, hash).await?;
                self.kv
                    .exec(vec![KvOp::Expire {
                        key,
                        ttl: UNIQUE_TTL,
                    }])
                    .await?;
                if !unique {
                    status = ShareKind::Rejected;
                }
            }
        }

        let member = format!("{}:{}", share.miner_id, share.worker_id);
        let bucket = interval_bucket(share.timestamp);
        let interval = self.keys.interval(chain, status, bucket);
        let counter = if share.solo {
            self.keys.solo_round_counter(chain, share.miner_id, status)
        } else {
            self.keys.round_counter(chain, status)
        };

        let mut ops = Vec::with_capacity(7);
        if status == ShareKind::Accepted && !share.solo {
            let window = self.keys.pplns_window(chain);
            ops.push(KvOp::LPush {
                key: window.clone(),
                value: member.clone(),
            });
            ops.push(KvOp::LTrim {
                key: window,
                start: 0,
                stop: params.window as isize - 1,
            });
        }
        ops.push(KvOp::IncrBy { key: counter, by: 1 });
        ops.push(KvOp::ZIncrBy {
            key: interval.clone(),
            member,
            by: 1.0,
        });
        ops.push(KvOp::Expire {
            key: interval,
            ttl: INTERVAL_TTL,
        });
        ops.push(KvOp::SAdd {
            key: self.keys.interval_registry(chain),
            member: bucket.to_string(),
        });
        self.kv.exec(ops).await?;
        Ok(unique)
    }

    async fn take_counter(&self, key: String) -> PoolResult<i64> {
        match self.kv.take(&key).await? {
            Some(raw) => raw
                .parse()
                .map_err(|_| PoolError::invalid(format!("{} holds {}", key, raw))),
            None => Ok(0),
        }
    }

    /// Freezes the current window (or the solo solver) into a pending round
    /// and rotates the round counters to zero.
    pub async fn solve(&self, params: &ShareParams, share: &ShareEvent, block: &SolvedBlock) -> PoolResult<SolvedRound> {
        let chain = params.chain_id.as_str();
        let mut counts = [0i64; 3];
        for (i, kind) in ShareKind::all().into_iter().enumerate() {
            let key = if share.solo {
                self.keys.solo_round_counter(chain, share.miner_id, kind)
            } else {
                self.keys.round_counter(chain, kind)
            };
            counts[i] = self.take_counter(key).await?;
        }
        let [accepted, rejected, invalid] = counts;

        let shares = if share.solo {
            vec![(share.miner_id, accepted.max(1))]
        } else {
            let window = self
                .kv
                .lrange(&self.keys.pplns_window(chain), 0, params.window as isize - 1)
                .await?;
            window_counts(&window)
        };

        Ok(SolvedRound {
            round: InsertRound {
                chain_id: chain.to_string(),
                miner_id: Some(share.miner_id),
                solo: share.solo,
                height: share.height,
                hash: block.hash.clone(),
                nonce: block.nonce.clone(),
                value: block.value.clone(),
                difficulty: block.difficulty,
                accepted_shares: accepted,
                rejected_shares: rejected,
                invalid_shares: invalid,
                luck: luck(block.difficulty, params.share_difficulty, accepted),
                epoch_height: block.epoch_height,
                created_at: unix_to_naive(share.timestamp),
            },
            shares,
        })
    }
}

/// Miner and worker ids, cached in KV hashes in front of the ledger.
async fn resolve_ids(
    kv: &dyn KvStore,
    keys: &Keys,
    db: &AppDatabase,
    submission: &ShareSubmission,
) -> PoolResult<(i64, i64)> {
    let miners = keys.miners(&submission.payout_chain_id);
    let miner_id = match kv.hget(&miners, &submission.address).await? {
        Some(raw) => raw
            .parse()
            .map_err(|_| PoolError::invalid(format!("{} holds {}", miners, raw)))?,
        None => {
            let id = db
                .get_or_insert_miner(submission.payout_chain_id.clone(), submission.address.clone())
                .await?;
            kv.hset(&miners, &submission.address, &id.to_string()).await?;
            id
        }
    };

    let workers = keys.workers(miner_id);
    let worker_id = match kv.hget(&workers, &submission.worker).await? {
        Some(raw) => raw
            .parse()
            .map_err(|_| PoolError::invalid(format!("{} holds {}", workers, raw)))?,
        None => {
            let id = db
                .get_or_insert_worker(miner_id, submission.worker.clone())
                .await?;
            kv.hset(&workers, &submission.worker, &id.to_string()).await?;
            id
        }
    };
    Ok((miner_id, worker_id))
}

/// Writes solved rounds in the order they were found.
pub async fn round_writer(db: Arc<AppDatabase>, notifier: Notifier, mut rounds: mpsc::Receiver<SolvedRound>) {
    while let Some(solved) = rounds.recv().await {
        let chain_id = solved.round.chain_id.clone();
        let height = solved.round.height;
        match db.insert_round_with_shares(solved.round, solved.shares).await {
            Ok(round_id) => {
                info!(target: "share_log", "{}: round {} at height {} stored", chain_id, round_id, height);
                notifier.info(format!("{} block found at height {}", chain_id, height));
            }
            Err(e) => {
                error!(target: "share_log", "{}: failed to store round at height {}: {:?}", chain_id, height, e);
                notifier.alert(format!("{}: round at height {} not stored: {}", chain_id, height, e));
            }
        }
    }
}

async fn handle_submission(
    ctx: &PoolContext,
    aggregator: &ShareAggregator,
    rounds: &mpsc::Sender<SolvedRound>,
    stream: &StreamWriter,
    submission: ShareSubmission,
) -> PoolResult<()> {
    let chain = ctx.chains.get(&submission.chain_id)?;
    if !chain.config.mineable {
        return Err(PoolError::invalid(format!("{} is not mineable", chain.id())));
    }
    let params = ShareParams::for_chain(chain);
    let (miner_id, worker_id) = resolve_ids(ctx.kv.as_ref(), &ctx.keys, &ctx.db, &submission).await?;
    let event = ShareEvent {
        miner_id,
        worker_id,
        status: submission.status,
        solo: submission.solo,
        hash: submission.hash.clone(),
        height: submission.height,
        timestamp: submission.timestamp,
    };

    let unique = aggregator.record(&params, &event).await?;
    let live = StreamEvent::Share {
        worker: submission.worker.clone(),
        status: if unique { event.status } else { ShareKind::Rejected },
        height: event.height,
    };
    if let Err(e) = stream.emit(miner_id, &live).await {
        warn!(target: "share_log", "{}: stream event for miner {} lost: {:?}", chain.id(), miner_id, e);
    }
    if let Some(block) = submission.block.as_ref().filter(|_| unique && event.status == ShareKind::Accepted) {
        let solved = aggregator.solve(&params, &event, block).await?;
        info!(
            target: "share_log",
            "{}: block {} at {} by miner {} ({} accepted, luck {:.2})",
            chain.id(),
            block.hash,
            event.height,
            miner_id,
            solved.round.accepted_shares,
            solved.round.luck
        );
        rounds
            .send(solved)
            .await
            .map_err(|_| PoolError::transient("round writer is gone"))?;
    }
    Ok(())
}

pub async fn share_system(ctx: Arc<PoolContext>, cancel: CancellationToken) {
    let channel = ctx.keys.shares();
    let mut feed = match ctx.kv.subscribe(&channel).await {
        Ok(feed) => feed,
        Err(e) => {
            error!(target: "share_log", "failed to subscribe to {}: {:?}", channel, e);
            ctx.notifier.alert(format!("share feed unavailable: {}", e));
            return;
        }
    };
    info!(target: "share_log", "aggregating shares from {}", channel);

    let (round_sender, round_receiver) = mpsc::channel(ROUND_QUEUE);
    let writer = tokio::spawn(round_writer(ctx.db.clone(), ctx.notifier.clone(), round_receiver));
    let aggregator = ShareAggregator::new(ctx.kv.clone(), ctx.keys.clone());
    let acks = Arc::new(AckIndex::new());
    tokio::spawn(ack_index_system(ctx.kv.clone(), ctx.keys.clone(), acks.clone(), cancel.clone()));
    let stream = StreamWriter::new(ctx.kv.clone(), ctx.keys.clone(), acks);

    loop {
        let raw = tokio::select! {
            _ = cancel.cancelled() => break,
            raw = feed.recv() => match raw {
                Some(raw) => raw,
                None => {
                    error!(target: "share_log", "share feed closed");
                    break;
                }
            },
        };
        let submission: ShareSubmission = match serde_json::from_str(&raw) {
            Ok(submission) => submission,
            Err(e) => {
                warn!(target: "share_log", "dropping malformed share: {:?}", e);
                continue;
            }
        };
        let chain_id = submission.chain_id.clone();
        let address = submission.address.clone();
        if let Err(e) = handle_submission(&ctx, &aggregator, &round_sender, &stream, submission).await {
            // KV or ledger down: the share is lost from accounting.
            error!(target: "share_log", "{}: dropped share from {}: {:?}", chain_id, address, e);
        }
    }

    drop(round_sender);
    if let Err(e) = writer.await {
        error!(target: "share_log", "round writer failed: {:?}", e);
    }
    info!(target: "share_log", "share aggregation stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn params(window: usize) -> ShareParams {
        ShareParams {
            chain_id: "ETC".to_string(),
            window,
            share_difficulty: 4.0,
        }
    }

    fn share(miner_id: i64, worker_id: i64, status: ShareKind, hash: &str) -> ShareEvent {
        ShareEvent {
            miner_id,
            worker_id,
            status,
            solo: false,
            hash: Some(hash.to_string()),
            height: 100,
            timestamp: 1_700_000_123,
        }
    }

    fn setup() -> (Arc<MemoryKv>, Keys, ShareAggregator) {
        let kv = Arc::new(MemoryKv::new());
        let keys = Keys::new("test");
        let aggregator = ShareAggregator::new(kv.clone(), keys.clone());
        (kv, keys, aggregator)
    }

    #[test]
    fn buckets_are_quarter_hours() {
        assert_eq!(interval_bucket(1_700_000_123), 1_699_999_200);
        assert_eq!(interval_bucket(1_699_999_200), 1_699_999_200);
        assert_eq!(luck(100.0, 4.0, 50), 50.0);
        assert_eq!(luck(100.0, 4.0, 0), 0.0);
    }

    #[tokio::test]
    async fn window_is_trimmed_and_counters_grow() {
        let (kv, keys, aggregator) = setup();
        let p = params(3);
        for (i, miner) in [1, 2, 1, 3].iter().enumerate() {
            let unique = aggregator
                .record(&p, &share(*miner, 10, ShareKind::Accepted, &format!("h{}", i)))
                .await
                .unwrap();
            assert!(unique);
        }
        aggregator
            .record(&p, &share(2, 20, ShareKind::Invalid, "bad"))
            .await
            .unwrap();

        let window = kv.lrange(&keys.pplns_window("ETC"), 0, -1).await.unwrap();
        assert_eq!(window, vec!["3:10", "1:10", "2:10"]);
        assert_eq!(
            kv.get(&keys.round_counter("ETC", ShareKind::Accepted)).await.unwrap(),
            Some("4".to_string())
        );
        assert_eq!(
            kv.get(&keys.round_counter("ETC", ShareKind::Invalid)).await.unwrap(),
            Some("1".to_string())
        );

        let bucket = interval_bucket(1_700_000_123);
        let scores = kv
            .zrange_with_scores(&keys.interval("ETC", ShareKind::Accepted, bucket))
            .await
            .unwrap();
        assert!(scores.contains(&("1:10".to_string(), 2.0)));
        assert_eq!(
            kv.smembers(&keys.interval_registry("ETC")).await.unwrap(),
            vec![bucket.to_string()]
        );
    }

    #[tokio::test]
    async fn duplicate_hash_counts_as_rejected() {
        let (kv, keys, aggregator) = setup();
        let p = params(10);
        assert!(aggregator.record(&p, &share(1, 1, ShareKind::Accepted, "same")).await.unwrap());
        assert!(!aggregator.record(&p, &share(1, 1, ShareKind::Accepted, "same")).await.unwrap());

        assert_eq!(kv.lrange(&keys.pplns_window("ETC"), 0, -1).await.unwrap().len(), 1);
        assert_eq!(
            kv.get(&keys.round_counter("ETC", ShareKind::Rejected)).await.unwrap(),
            Some("1".to_string())
        );
    }

    #[tokio::test]
    async fn solving_freezes_window_and_rotates_counters() {
        let (kv, keys, aggregator) = setup();
        let p = params(10);
        for (i, miner) in [7, 7, 7, 8].iter().enumerate() {
            aggregator
                .record(&p, &share(*miner, 1, ShareKind::Accepted, &format!("s{}", i)))
                .await
                .unwrap();
        }
        let block = SolvedBlock {
            hash: "0xblock".to_string(),
            nonce: Some("0x1".to_string()),
            value: Some(Amount::from(2_000i64)),
            difficulty: 16.0,
            epoch_height: None,
        };
        let solved = aggregator
            .solve(&p, &share(8, 1, ShareKind::Accepted, "s3"), &block)
            .await
            .unwrap();

        assert_eq!(solved.shares, vec![(7, 3), (8, 1)]);
        assert_eq!(solved.round.accepted_shares, 4);
        assert_eq!(solved.round.luck, 100.0);
        assert_eq!(solved.round.miner_id, Some(8));
        assert!(kv
            .get(&keys.round_counter("ETC", ShareKind::Accepted))
            .await
            .unwrap()
            .is_none());
        // the window keeps rolling across rounds
        assert_eq!(kv.lrange(&keys.pplns_window("ETC"), 0, -1).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn solo_round_belongs_to_the_solver() {
        let (kv, keys, aggregator) = setup();
        let p = params(10);
        let mut solo = share(9, 1, ShareKind::Accepted, "solo");
        solo.solo = true;
        aggregator.record(&p, &solo).await.unwrap();
        aggregator
            .record(&p, &share(1, 1, ShareKind::Accepted, "pplns"))
            .await
            .unwrap();

        let block = SolvedBlock {
            hash: "0xsolo".to_string(),
            nonce: None,
            value: None,
            difficulty: 4.0,
            epoch_height: None,
        };
        let solved = aggregator.solve(&p, &solo, &block).await.unwrap();
        assert_eq!(solved.shares, vec![(9, 1)]);
        assert!(solved.round.solo);
        assert_eq!(
            kv.get(&keys.round_counter("ETC", ShareKind::Accepted)).await.unwrap(),
            Some("1".to_string())
        );
    }

    #[test]
    fn submissions_parse_from_json() {
        let raw = r#"{"chain_id":"ETC","payout_chain_id":"BTC","address":"bc1q","worker":"rig1",
            "status":"accepted","hash":"0xabc","height":5,"timestamp":1700000000,
            "block":{"hash":"0xabc","difficulty":12.5}}"#;
        let submission: ShareSubmission = serde_json::from_str(raw).unwrap();
        assert_eq!(submission.status, ShareKind::Accepted);
        assert!(!submission.solo);
        assert_eq!(submission.block.unwrap().difficulty, 12.5);
        assert_eq!(window_counts(&["4:1".to_string(), "x".to_string(), "4:2".to_string()]), vec![(4, 2)]);
    }
}
