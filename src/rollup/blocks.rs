use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use tracing::info;

use super::derived::{average, mean, profitability, uncle_rate};
use super::{to_naive, ChainChart, Period, Pipeline};
use crate::chains::{Chain, RawBlock};
use crate::context::PoolContext;
use crate::error::PoolResult;
use crate::models::{BlockChartRow, RawBlockRow};

/// Blocks fetched from a node per chain per tick.
const MAX_INDEX_BLOCKS: u64 = 500;
const RAW_BLOCK_RETENTION_DAYS: i64 = 2;

/// Network charts from the chain's own blocks: reward, difficulty, block
/// time, network hashrate, uncle rate and profitability.
pub struct BlockPipeline;

pub fn raw_block_row(chart: &ChainChart, block: &RawBlock) -> RawBlockRow {
    RawBlockRow {
        chain_id: chart.chain_id.clone(),
        height: block.height,
        value: chart.coins(block.value.to_f64()),
        difficulty: block.difficulty,
        uncle_count: block.uncle_count,
        created_at: to_naive(block.timestamp).unwrap_or_default(),
    }
}

/// Sum-form row for the blocks of one base period. `None` without blocks.
pub fn sum_blocks(
    chain_id: &str,
    period: Period,
    start: NaiveDateTime,
    end: NaiveDateTime,
    blocks: &[RawBlockRow],
) -> Option<BlockChartRow> {
    if blocks.is_empty() {
        return None;
    }
    let count = blocks.len() as i64;
    Some(BlockChartRow {
        chain_id: chain_id.to_string(),
        period: period.minutes(),
        start_time: start,
        end_time: end,
        value: blocks.iter().map(|b| b.value).sum(),
        difficulty: blocks.iter().map(|b| b.difficulty).sum(),
        // mean block time is period / count, times count
        block_time: period.seconds() as f64,
        count,
        uncle_count: blocks.iter().map(|b| b.uncle_count).sum(),
        pending: true,
        ..Default::default()
    })
}

pub fn finalize_blocks(chart: &ChainChart, row: &BlockChartRow) -> BlockChartRow {
    let value = mean(row.value, row.count);
    let difficulty = mean(row.difficulty, row.count);
    let block_time = mean(row.block_time, row.count);
    let hashrate = chart.network_hashrate(block_time, difficulty);
    BlockChartRow {
        value,
        difficulty,
        block_time,
        hashrate,
        uncle_rate: uncle_rate(row.uncle_count, row.count),
        profitability: profitability(chart.market_rate, value, block_time, hashrate),
        pending: false,
        ..row.clone()
    }
}

#[async_trait]
impl Pipeline for BlockPipeline {
    type Row = BlockChartRow;

    fn name(&self) -> &'static str {
        "blocks"
    }

    fn base(&self) -> Period {
        Period::FifteenMinutes
    }

    fn rollups(&self) -> &'static [Period] {
        &[Period::FourHours, Period::Day]
    }

    fn delay(&self) -> chrono::Duration {
        chrono::Duration::minutes(5)
    }

    async fn seed_time(&self, ctx: &PoolContext, chain: &Arc<Chain>) -> PoolResult<Option<NaiveDateTime>> {
        ctx.chart_db.get_first_block_time(chain.id().to_string()).await
    }

    /// Indexes new blocks from the node into `raw_blocks`.
    async fn prepare(&self, ctx: &PoolContext, chain: &Arc<Chain>) -> PoolResult<()> {
        let node = chain.mining_node()?;
        let status = node.get_status().await?;
        if status.syncing {
            return Ok(());
        }

        let from = match ctx.chart_db.get_max_block_height(chain.id().to_string()).await? {
            Some(height) => height + 1,
            None => {
                let per_day = (86_400.0 / chain.config.block_time_secs.max(1.0)) as u64;
                status.height.saturating_sub(per_day)
            }
        };
        let to = status.height.min(from + MAX_INDEX_BLOCKS - 1);
        if from > to {
            return Ok(());
        }

        let chart = ChainChart::load(ctx, chain).await?;
        let rows: Vec<RawBlockRow> = node
            .get_blocks(from, to)
            .await?
            .iter()
            .map(|block| raw_block_row(&chart, block))
            .collect();
        let indexed = ctx.chart_db.replace_rows(rows).await?;
        info!(target: "cron_log", "blocks {}: indexed {} blocks {}..={}", chain.id(), indexed, from, to);

        let cutoff = Utc::now().naive_utc() - chrono::Duration::days(RAW_BLOCK_RETENTION_DAYS);
        ctx.chart_db
            .delete_raw_blocks_before(chain.id().to_string(), cutoff)
            .await?;
        Ok(())
    }

    async fn rollup(
        &self,
        ctx: &PoolContext,
        chart: &ChainChart,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> PoolResult<Vec<BlockChartRow>> {
        let blocks = ctx
            .chart_db
            .get_raw_blocks_between(chart.chain_id.clone(), start, end)
            .await?;
        Ok(sum_blocks(&chart.chain_id, self.base(), start, end, &blocks)
            .into_iter()
            .collect())
    }

    fn end_time(&self, row: &BlockChartRow) -> NaiveDateTime {
        row.end_time
    }

    fn with_period(&self, row: &BlockChartRow, period: Period, start: NaiveDateTime, end: NaiveDateTime) -> BlockChartRow {
        BlockChartRow {
            period: period.minutes(),
            start_time: start,
            end_time: end,
            pending: true,
            ..row.clone()
        }
    }

    fn finalize(&self, chart: &ChainChart, row: &BlockChartRow) -> BlockChartRow {
        finalize_blocks(chart, row)
    }

    fn apply_averages(&self, row: &mut BlockChartRow, window: &[BlockChartRow]) {
        row.avg_profitability = average(window.iter().map(|r| r.profitability));
        row.avg_difficulty = average(window.iter().map(|r| r.difficulty));
        row.avg_block_time = average(window.iter().map(|r| r.block_time));
        row.avg_hashrate = average(window.iter().map(|r| r.hashrate));
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn chart() -> ChainChart {
        ChainChart {
            chain_id: "ETC".to_string(),
            units: 18,
            share_difficulty: 4.0,
            adjusted_share_difficulty: 4.0,
            market_rate: 2.0,
            mining: None,
        }
    }

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn block(height: u64, value: f64, difficulty: f64, uncles: i64) -> RawBlockRow {
        RawBlockRow {
            chain_id: "ETC".to_string(),
            height,
            value,
            difficulty,
            uncle_count: uncles,
            created_at: at(10, 1),
        }
    }

    #[test]
    fn base_row_means_and_derived() {
        let blocks = vec![block(1, 2.0, 900.0, 1), block(2, 4.0, 1_500.0, 0), block(3, 3.0, 1_200.0, 0)];
        let sums = sum_blocks("ETC", Period::FifteenMinutes, at(10, 0), at(10, 15), &blocks).unwrap();
        assert!(sums.pending);
        assert_eq!(sums.count, 3);

        let row = finalize_blocks(&chart(), &sums);
        assert_eq!(row.value, 3.0);
        assert_eq!(row.difficulty, 1_200.0);
        assert_eq!(row.block_time, 300.0);
        assert_eq!(row.hashrate, 4.0);
        assert_eq!(row.uncle_rate, 0.25);
        // 2.0 * (3.0 / 300) / 4
        assert_eq!(row.profitability, 0.005);
        assert!(!row.pending);

        assert!(sum_blocks("ETC", Period::FifteenMinutes, at(10, 0), at(10, 15), &[]).is_none());
    }

    #[test]
    fn accumulated_rows_give_weighted_means() {
        let first = sum_blocks(
            "ETC",
            Period::FifteenMinutes,
            at(10, 0),
            at(10, 15),
            &[block(1, 2.0, 1_000.0, 0)],
        )
        .unwrap();
        let second = sum_blocks(
            "ETC",
            Period::FifteenMinutes,
            at(10, 15),
            at(10, 30),
            &[block(2, 4.0, 2_000.0, 0), block(3, 6.0, 3_000.0, 0), block(4, 8.0, 4_000.0, 0)],
        )
        .unwrap();

        // what the additive upsert leaves in the 4h row
        let merged = BlockChartRow {
            value: first.value + second.value,
            difficulty: first.difficulty + second.difficulty,
            block_time: first.block_time + second.block_time,
            count: first.count + second.count,
            ..BlockPipeline.with_period(&first, Period::FourHours, at(8, 0), at(12, 0))
        };
        let row = finalize_blocks(&chart(), &merged);
        assert_eq!(row.period, 240);
        assert_eq!(row.value, 5.0);
        assert_eq!(row.difficulty, 2_500.0);
        // two quarter hours, four blocks
        assert_eq!(row.block_time, 450.0);
    }

    #[test]
    fn averages_cover_the_window() {
        let mut row = BlockChartRow {
            hashrate: 1.0,
            ..Default::default()
        };
        let window = vec![
            BlockChartRow {
                hashrate: 2.0,
                difficulty: 10.0,
                ..Default::default()
            },
            BlockChartRow {
                hashrate: 4.0,
                difficulty: 30.0,
                ..Default::default()
            },
        ];
        BlockPipeline.apply_averages(&mut row, &window);
        assert_eq!(row.avg_hashrate, 3.0);
        assert_eq!(row.avg_difficulty, 20.0);
    }
}
