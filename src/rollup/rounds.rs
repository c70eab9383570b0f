use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;

use super::derived::{average, luck, mean, uncle_rate};
use super::{ChainChart, Period, Pipeline};
use crate::chains::Chain;
use crate::context::PoolContext;
use crate::error::PoolResult;
use crate::models::{Round, RoundChartRow};

/// Pool round charts: reward, difficulty, effort and luck of the rounds the
/// pool found.
pub struct RoundPipeline;

/// Sum-form row for the unlocked rounds of one base period.
pub fn sum_rounds(
    chart: &ChainChart,
    period: Period,
    start: NaiveDateTime,
    end: NaiveDateTime,
    rounds: &[Round],
) -> Option<RoundChartRow> {
    if rounds.is_empty() {
        return None;
    }
    let mut row = RoundChartRow {
        chain_id: chart.chain_id.clone(),
        period: period.minutes(),
        start_time: start,
        end_time: end,
        pending: true,
        ..Default::default()
    };
    for round in rounds {
        row.count += 1;
        if round.orphan {
            row.orphan_count += 1;
        }
        if round.uncle {
            row.uncle_count += 1;
        }
        if !round.orphan {
            row.value += chart.coins(round.value.as_ref().map(|v| v.to_f64()).unwrap_or(0.0));
        }
        row.difficulty += round.difficulty;
        row.accepted_shares += round.accepted_shares as f64;
    }
    Some(row)
}

pub fn finalize_rounds(chart: &ChainChart, row: &RoundChartRow) -> RoundChartRow {
    let difficulty = mean(row.difficulty, row.count);
    let accepted_shares = mean(row.accepted_shares, row.count);
    RoundChartRow {
        value: mean(row.value, row.count),
        difficulty,
        accepted_shares,
        luck: luck(difficulty, chart.share_difficulty, accepted_shares),
        uncle_rate: uncle_rate(row.uncle_count, row.count - row.uncle_count),
        pending: false,
        ..row.clone()
    }
}

#[async_trait]
impl Pipeline for RoundPipeline {
    type Row = RoundChartRow;

    fn name(&self) -> &'static str {
        "rounds"
    }

    fn base(&self) -> Period {
        Period::Hour
    }

    fn rollups(&self) -> &'static [Period] {
        &[Period::FourHours, Period::Day]
    }

    fn delay(&self) -> chrono::Duration {
        chrono::Duration::minutes(5)
    }

    async fn seed_time(&self, ctx: &PoolContext, chain: &Arc<Chain>) -> PoolResult<Option<NaiveDateTime>> {
        ctx.read_db.get_first_round_time(chain.id().to_string()).await
    }

    async fn rollup(
        &self,
        ctx: &PoolContext,
        chart: &ChainChart,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> PoolResult<Vec<RoundChartRow>> {
        let rounds = ctx
            .read_db
            .get_rounds_between(chart.chain_id.clone(), start, end)
            .await?;
        Ok(sum_rounds(chart, self.base(), start, end, &rounds)
            .into_iter()
            .collect())
    }

    fn end_time(&self, row: &RoundChartRow) -> NaiveDateTime {
        row.end_time
    }

    fn with_period(&self, row: &RoundChartRow, period: Period, start: NaiveDateTime, end: NaiveDateTime) -> RoundChartRow {
        RoundChartRow {
            period: period.minutes(),
            start_time: start,
            end_time: end,
            pending: true,
            ..row.clone()
        }
    }

    fn finalize(&self, chart: &ChainChart, row: &RoundChartRow) -> RoundChartRow {
        finalize_rounds(chart, row)
    }

    fn apply_averages(&self, row: &mut RoundChartRow, window: &[RoundChartRow]) {
        row.avg_luck = average(window.iter().map(|r| r.luck));
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::amount::Amount;

    fn chart() -> ChainChart {
        ChainChart {
            chain_id: "KAS".to_string(),
            units: 8,
            share_difficulty: 2.0,
            adjusted_share_difficulty: 2.0,
            market_rate: 1.0,
            mining: None,
        }
    }

    fn at(h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn round(id: i64, value: i64, difficulty: f64, accepted: i64, uncle: bool, orphan: bool) -> Round {
        Round {
            id,
            chain_id: "KAS".to_string(),
            miner_id: Some(1),
            solo: false,
            height: id as u64,
            hash: format!("h{}", id),
            nonce: None,
            value: Some(Amount::from(value)),
            difficulty,
            accepted_shares: accepted,
            rejected_shares: 0,
            invalid_shares: 0,
            luck: 0.0,
            pending: false,
            uncle,
            orphan,
            mature: false,
            spent: false,
            coinbase_txid: None,
            epoch_height: None,
            uncle_height: None,
            created_at: at(10),
        }
    }

    #[test]
    fn luck_comes_from_summed_effort() {
        let rounds = vec![
            round(1, 100_000_000, 100.0, 100, false, false),
            round(2, 300_000_000, 300.0, 50, true, false),
            round(3, 500_000_000, 200.0, 150, false, true),
        ];
        let sums = sum_rounds(&chart(), Period::Hour, at(10), at(11), &rounds).unwrap();
        assert_eq!(sums.count, 3);
        assert_eq!(sums.uncle_count, 1);
        assert_eq!(sums.orphan_count, 1);
        // orphans earn nothing
        assert_eq!(sums.value, 4.0);

        let row = finalize_rounds(&chart(), &sums);
        assert_eq!(row.difficulty, 200.0);
        assert_eq!(row.accepted_shares, 100.0);
        assert_eq!(row.luck, 100.0);
        assert_eq!(row.uncle_rate, 1.0 / 3.0);
        assert!(sum_rounds(&chart(), Period::Hour, at(10), at(11), &[]).is_none());
    }
}
