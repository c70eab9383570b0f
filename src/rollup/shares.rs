use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use tracing::warn;

use super::derived::{average, hashrate, mean};
use super::{to_naive, ChainChart, Period, Pipeline};
use crate::chains::Chain;
use crate::context::PoolContext;
use crate::error::PoolResult;
use crate::kv::{cache_json, KvOp, ShareKind};
use crate::models::ShareChartRow;

pub const TOP_MINERS: usize = 100;
const CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// Pool, miner and worker share charts from the interval sets the share
/// aggregator keeps per quarter hour.
pub struct SharePipeline;

#[derive(Default)]
struct Counts {
    accepted: f64,
    rejected: f64,
    invalid: f64,
}

impl Counts {
    fn add(&mut self, kind: ShareKind, n: f64) {
        match kind {
            ShareKind::Accepted => self.accepted += n,
            ShareKind::Rejected => self.rejected += n,
            ShareKind::Invalid => self.invalid += n,
        }
    }
}

fn parse_member(member: &str) -> Option<(i64, i64)> {
    let (miner, worker) = member.split_once(':')?;
    Some((miner.parse().ok()?, worker.parse().ok()?))
}

/// Sum-form rows for one interval: one per worker, one per miner
/// (`worker_id = 0`) and the pool row (`0, 0`). Each row counts once.
pub fn sum_shares(
    chart: &ChainChart,
    period: Period,
    start: NaiveDateTime,
    end: NaiveDateTime,
    members: &[(ShareKind, Vec<(String, f64)>)],
) -> Vec<ShareChartRow> {
    let mut workers: BTreeMap<(i64, i64), Counts> = BTreeMap::new();
    for (kind, entries) in members {
        for (member, score) in entries {
            match parse_member(member) {
                Some(ids) => workers.entry(ids).or_default().add(*kind, *score),
                None => warn!(target: "cron_log", "shares {}: bad interval member {}", chart.chain_id, member),
            }
        }
    }
    if workers.is_empty() {
        return Vec::new();
    }

    let seconds = period.seconds() as f64;
    let row = |miner_id: i64, worker_id: i64, miners: f64, worker_count: f64, counts: &Counts| ShareChartRow {
        chain_id: chart.chain_id.clone(),
        period: period.minutes(),
        miner_id,
        worker_id,
        start_time: start,
        end_time: end,
        miners,
        workers: worker_count,
        accepted_shares: counts.accepted,
        rejected_shares: counts.rejected,
        invalid_shares: counts.invalid,
        hashrate: hashrate(counts.accepted, chart.adjusted_share_difficulty, seconds),
        count: 1,
        pending: true,
        ..Default::default()
    };

    let mut miners: BTreeMap<i64, (f64, Counts)> = BTreeMap::new();
    let mut pool = Counts::default();
    let mut rows = Vec::with_capacity(workers.len() * 2 + 1);
    for ((miner_id, worker_id), counts) in workers.iter() {
        rows.push(row(*miner_id, *worker_id, 1.0, 1.0, counts));
        let miner = miners.entry(*miner_id).or_default();
        miner.0 += 1.0;
        miner.1.accepted += counts.accepted;
        miner.1.rejected += counts.rejected;
        miner.1.invalid += counts.invalid;
        pool.accepted += counts.accepted;
        pool.rejected += counts.rejected;
        pool.invalid += counts.invalid;
    }
    for (miner_id, (worker_count, counts)) in miners.iter() {
        rows.push(row(*miner_id, 0, 1.0, *worker_count, counts));
    }
    rows.push(row(0, 0, miners.len() as f64, workers.len() as f64, &pool));
    rows
}

pub fn finalize_shares(row: &ShareChartRow) -> ShareChartRow {
    ShareChartRow {
        miners: mean(row.miners, row.count),
        workers: mean(row.workers, row.count),
        accepted_shares: mean(row.accepted_shares, row.count),
        rejected_shares: mean(row.rejected_shares, row.count),
        invalid_shares: mean(row.invalid_shares, row.count),
        hashrate: mean(row.hashrate, row.count),
        pending: false,
        ..row.clone()
    }
}

/// Miners (not workers, not the pool row) by hashrate, highest first.
pub fn top_miners(rows: &[ShareChartRow], limit: usize) -> Vec<ShareChartRow> {
    let mut miners: Vec<ShareChartRow> = rows
        .iter()
        .filter(|r| r.miner_id != 0 && r.worker_id == 0)
        .cloned()
        .collect();
    miners.sort_by(|a, b| b.hashrate.total_cmp(&a.hashrate));
    miners.truncate(limit);
    miners
}

#[async_trait]
impl Pipeline for SharePipeline {
    type Row = ShareChartRow;

    fn name(&self) -> &'static str {
        "shares"
    }

    fn base(&self) -> Period {
        Period::FifteenMinutes
    }

    fn rollups(&self) -> &'static [Period] {
        &[Period::FourHours, Period::Day]
    }

    fn delay(&self) -> chrono::Duration {
        chrono::Duration::minutes(1)
    }

    async fn seed_time(&self, ctx: &PoolContext, chain: &Arc<Chain>) -> PoolResult<Option<NaiveDateTime>> {
        let buckets = ctx
            .kv
            .smembers(&ctx.keys.interval_registry(chain.id()))
            .await?;
        Ok(buckets
            .iter()
            .filter_map(|b| b.parse::<i64>().ok())
            .min()
            .and_then(to_naive))
    }

    async fn rollup(
        &self,
        ctx: &PoolContext,
        chart: &ChainChart,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> PoolResult<Vec<ShareChartRow>> {
        let bucket = start.and_utc().timestamp();
        let mut members = Vec::with_capacity(3);
        for kind in ShareKind::all() {
            let key = ctx.keys.interval(&chart.chain_id, kind, bucket);
            members.push((kind, ctx.kv.zrange_with_scores(&key).await?));
        }
        Ok(sum_shares(chart, self.base(), start, end, &members))
    }

    /// Drops the consumed interval sets and refreshes the dashboard caches.
    async fn after_step(
        &self,
        ctx: &PoolContext,
        chart: &ChainChart,
        start: NaiveDateTime,
        rows: &[ShareChartRow],
    ) -> PoolResult<()> {
        let bucket = start.and_utc().timestamp();
        let ops = ShareKind::all()
            .into_iter()
            .map(|kind| KvOp::Del {
                key: ctx.keys.interval(&chart.chain_id, kind, bucket),
            })
            .collect();
        ctx.kv.exec(ops).await?;
        ctx.kv
            .srem(&ctx.keys.interval_registry(&chart.chain_id), &bucket.to_string())
            .await?;

        if rows.is_empty() {
            return Ok(());
        }
        let top = top_miners(rows, TOP_MINERS);
        cache_json(
            ctx.kv.as_ref(),
            &ctx.keys.cache(&format!("top:{}", chart.chain_id)),
            &top,
            CACHE_TTL,
        )
        .await?;
        if let Some(pool) = rows.iter().find(|r| r.miner_id == 0 && r.worker_id == 0) {
            cache_json(
                ctx.kv.as_ref(),
                &ctx.keys.cache(&format!("shares:{}", chart.chain_id)),
                pool,
                CACHE_TTL,
            )
            .await?;
        }
        Ok(())
    }

    fn end_time(&self, row: &ShareChartRow) -> NaiveDateTime {
        row.end_time
    }

    fn with_period(&self, row: &ShareChartRow, period: Period, start: NaiveDateTime, end: NaiveDateTime) -> ShareChartRow {
        ShareChartRow {
            period: period.minutes(),
            start_time: start,
            end_time: end,
            pending: true,
            ..row.clone()
        }
    }

    fn finalize(&self, _chart: &ChainChart, row: &ShareChartRow) -> ShareChartRow {
        finalize_shares(row)
    }

    fn apply_averages(&self, row: &mut ShareChartRow, window: &[ShareChartRow]) {
        row.avg_hashrate = average(
            window
                .iter()
                .filter(|r| r.miner_id == row.miner_id && r.worker_id == row.worker_id)
                .map(|r| r.hashrate),
        );
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::kv::{cached_json, Keys, KvStore, MemoryKv};

    fn chart() -> ChainChart {
        ChainChart {
            chain_id: "RVN".to_string(),
            units: 8,
            share_difficulty: 1.0,
            adjusted_share_difficulty: 9.0,
            market_rate: 1.0,
            mining: None,
        }
    }

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn members() -> Vec<(ShareKind, Vec<(String, f64)>)> {
        vec![
            (
                ShareKind::Accepted,
                vec![
                    ("1:10".to_string(), 100.0),
                    ("1:11".to_string(), 200.0),
                    ("2:20".to_string(), 50.0),
                    ("garbage".to_string(), 5.0),
                ],
            ),
            (ShareKind::Rejected, vec![("2:20".to_string(), 3.0)]),
            (ShareKind::Invalid, vec![]),
        ]
    }

    fn find(rows: &[ShareChartRow], miner_id: i64, worker_id: i64) -> &ShareChartRow {
        rows.iter()
            .find(|r| r.miner_id == miner_id && r.worker_id == worker_id)
            .unwrap()
    }

    #[test]
    fn rows_for_workers_miners_and_pool() {
        let rows = sum_shares(&chart(), Period::FifteenMinutes, at(10, 0), at(10, 15), &members());
        // three workers, two miners, one pool row
        assert_eq!(rows.len(), 6);

        let worker = find(&rows, 1, 11);
        assert_eq!(worker.accepted_shares, 200.0);
        // 200 shares * 9 / 900s
        assert_eq!(worker.hashrate, 2.0);

        let miner = find(&rows, 1, 0);
        assert_eq!(miner.workers, 2.0);
        assert_eq!(miner.accepted_shares, 300.0);
        assert_eq!(miner.hashrate, 3.0);

        let pool = find(&rows, 0, 0);
        assert_eq!(pool.miners, 2.0);
        assert_eq!(pool.workers, 3.0);
        assert_eq!(pool.accepted_shares, 350.0);
        assert_eq!(pool.rejected_shares, 3.0);
        assert!(rows.iter().all(|r| r.count == 1 && r.pending));

        assert!(sum_shares(&chart(), Period::FifteenMinutes, at(10, 0), at(10, 15), &[]).is_empty());
    }

    #[test]
    fn rollup_rows_average_per_interval() {
        let row = ShareChartRow {
            period: 240,
            accepted_shares: 300.0,
            hashrate: 6.0,
            miners: 4.0,
            count: 2,
            pending: true,
            ..Default::default()
        };
        let done = finalize_shares(&row);
        assert_eq!(done.accepted_shares, 150.0);
        assert_eq!(done.hashrate, 3.0);
        assert_eq!(done.miners, 2.0);
        assert!(!done.pending);
    }

    #[test]
    fn top_miners_sorted_and_capped() {
        let rows = sum_shares(&chart(), Period::FifteenMinutes, at(10, 0), at(10, 15), &members());
        let top = top_miners(&rows, 1);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].miner_id, 1);
        assert_eq!(top_miners(&rows, TOP_MINERS).len(), 2);
    }

    #[test]
    fn averages_only_see_the_same_series() {
        let mut row = ShareChartRow {
            miner_id: 1,
            ..Default::default()
        };
        let window = vec![
            ShareChartRow {
                miner_id: 1,
                hashrate: 2.0,
                ..Default::default()
            },
            ShareChartRow {
                miner_id: 1,
                hashrate: 4.0,
                ..Default::default()
            },
            ShareChartRow {
                miner_id: 2,
                hashrate: 100.0,
                ..Default::default()
            },
        ];
        SharePipeline.apply_averages(&mut row, &window);
        assert_eq!(row.avg_hashrate, 3.0);
    }

    #[tokio::test]
    async fn cache_round_trip_for_top_miners() {
        let kv = MemoryKv::new();
        let keys = Keys::new("test");
        let rows = sum_shares(&chart(), Period::FifteenMinutes, at(10, 0), at(10, 15), &members());
        let key = keys.cache("top:RVN");
        cache_json(&kv, &key, &top_miners(&rows, TOP_MINERS), CACHE_TTL)
            .await
            .unwrap();
        let raw = kv.get(&key).await.unwrap().unwrap();
        assert!(raw.contains("\"miner_id\":1"));
        let cached: Option<serde_json::Value> = cached_json(&kv, &key).await.unwrap();
        assert_eq!(cached.unwrap().as_array().unwrap().len(), 2);
    }
}
