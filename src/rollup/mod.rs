//! Time-series rollups for the dashboards.
//!
//! Every pipeline turns raw source data into one row per base period,
//! accumulates that row into the longer rollup periods and finalizes them.
//! Rows are produced in "sum form": mean columns hold `mean * count` so
//! accumulation is a plain addition, and finalizing divides by `count`.

pub mod blocks;
pub mod derived;
pub mod periods;
pub mod rounds;
pub mod shares;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::chains::{Chain, MiningNode};
use crate::chart_database::ChartRow;
use crate::context::PoolContext;
use crate::error::PoolResult;
use crate::systems::report_chain_error;

pub use periods::{end_times, Period};

/// End-times processed per chain per tick.
pub const MAX_STEPS: usize = 25;

/// What finalizing a row needs to know about its chain.
#[derive(Clone)]
pub struct ChainChart {
    pub chain_id: String,
    pub units: u32,
    pub share_difficulty: f64,
    pub adjusted_share_difficulty: f64,
    pub market_rate: f64,
    pub mining: Option<Arc<dyn MiningNode>>,
}

impl ChainChart {
    pub async fn load(ctx: &PoolContext, chain: &Chain) -> PoolResult<Self> {
        // without a cached market rate, profitability is in native coins
        let market_rate = ctx
            .kv
            .get(&ctx.keys.rates(chain.id()))
            .await?
            .and_then(|raw| raw.parse::<f64>().ok())
            .unwrap_or(1.0);
        Ok(ChainChart {
            chain_id: chain.id().to_string(),
            units: chain.config.units,
            share_difficulty: chain.config.share_difficulty,
            adjusted_share_difficulty: chain.adjusted_share_difficulty(),
            market_rate,
            mining: chain.mining.clone(),
        })
    }

    pub fn network_hashrate(&self, block_time: f64, difficulty: f64) -> f64 {
        match &self.mining {
            Some(node) => node.calculate_hashrate(block_time, difficulty),
            None if block_time > 0.0 => difficulty / block_time,
            None => 0.0,
        }
    }

    /// Converts smallest units to whole coins for charting.
    pub fn coins(&self, units: f64) -> f64 {
        units / 10f64.powi(self.units as i32)
    }
}

pub fn to_naive(timestamp: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp(timestamp, 0).map(|dt| dt.naive_utc())
}

#[async_trait]
pub trait Pipeline: Send + Sync {
    type Row: ChartRow + Sync;

    fn name(&self) -> &'static str;
    fn base(&self) -> Period;
    fn rollups(&self) -> &'static [Period];
    /// How far behind now the last end-time stays, so late data lands.
    fn delay(&self) -> chrono::Duration;

    /// Earliest source time, used when nothing was rolled up yet.
    async fn seed_time(&self, ctx: &PoolContext, chain: &Arc<Chain>) -> PoolResult<Option<NaiveDateTime>>;

    /// Per-chain work before the end-times are walked.
    async fn prepare(&self, _ctx: &PoolContext, _chain: &Arc<Chain>) -> PoolResult<()> {
        Ok(())
    }

    /// Sum-form rows of the base period for `[start, end)`, `pending=true`.
    async fn rollup(
        &self,
        ctx: &PoolContext,
        chart: &ChainChart,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> PoolResult<Vec<Self::Row>>;

    /// Per-chain work after one end-time was fully written.
    async fn after_step(
        &self,
        _ctx: &PoolContext,
        _chart: &ChainChart,
        _start: NaiveDateTime,
        _rows: &[Self::Row],
    ) -> PoolResult<()> {
        Ok(())
    }

    fn end_time(&self, row: &Self::Row) -> NaiveDateTime;
    /// Moves a sum-form row into another period's row.
    fn with_period(&self, row: &Self::Row, period: Period, start: NaiveDateTime, end: NaiveDateTime) -> Self::Row;
    /// Sum form to means plus derived columns, `pending=false`.
    fn finalize(&self, chart: &ChainChart, row: &Self::Row) -> Self::Row;
    /// Fills the `avg_*` columns from `window`, which holds every row of
    /// the same period in the average window.
    fn apply_averages(&self, row: &mut Self::Row, window: &[Self::Row]);
}

pub async fn run_pipeline<P: Pipeline>(ctx: Arc<PoolContext>, pipeline: &P, run_id: Uuid) -> PoolResult<()> {
    for chain in ctx.chains.mineable() {
        if let Err(e) = run_chain(&ctx, pipeline, chain, run_id).await {
            report_chain_error(&ctx, run_id, pipeline.name(), chain.id(), &e);
        }
    }
    Ok(())
}

async fn last_time<P: Pipeline>(ctx: &PoolContext, pipeline: &P, chain: &Arc<Chain>) -> PoolResult<Option<NaiveDateTime>> {
    let key = ctx.keys.rollup_last(pipeline.name(), chain.id());
    if let Some(time) = ctx
        .kv
        .get(&key)
        .await?
        .and_then(|raw| raw.parse::<i64>().ok())
        .and_then(to_naive)
    {
        return Ok(Some(time));
    }
    if let Some(time) = ctx
        .chart_db
        .get_max_end_time::<P::Row>(chain.id().to_string(), pipeline.base().minutes())
        .await?
    {
        return Ok(Some(time));
    }
    // the first end-time then covers the earliest source row
    Ok(pipeline
        .seed_time(ctx, chain)
        .await?
        .map(|time| pipeline.base().floor(time)))
}

async fn run_chain<P: Pipeline>(ctx: &PoolContext, pipeline: &P, chain: &Arc<Chain>, run_id: Uuid) -> PoolResult<()> {
    pipeline.prepare(ctx, chain).await?;
    let last = match last_time(ctx, pipeline, chain).await? {
        Some(last) => last,
        None => return Ok(()),
    };
    let now = Utc::now().naive_utc();
    let ends = end_times(pipeline.base(), last, now - pipeline.delay(), MAX_STEPS);
    if ends.is_empty() {
        return Ok(());
    }

    let chart = ChainChart::load(ctx, chain).await?;
    let key = ctx.keys.rollup_last(pipeline.name(), chain.id());
    for end in ends.iter() {
        let start = *end - pipeline.base().duration();
        let rows = step(ctx, pipeline, &chart, start, *end).await?;
        truncate(ctx, pipeline, chain, now).await?;
        ctx.kv
            .set(&key, &end.and_utc().timestamp().to_string(), None)
            .await?;
        pipeline.after_step(ctx, &chart, start, &rows).await?;
    }
    info!(
        target: "cron_log",
        "[{}] {} {}: rolled up {} period(s) to {}",
        run_id,
        pipeline.name(),
        chain.id(),
        ends.len(),
        ends[ends.len() - 1]
    );
    Ok(())
}

/// Rolls up one base period and folds it into every rollup period. Returns
/// the finalized base rows.
async fn step<P: Pipeline>(
    ctx: &PoolContext,
    pipeline: &P,
    chart: &ChainChart,
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> PoolResult<Vec<P::Row>> {
    let sums = pipeline.rollup(ctx, chart, start, end).await?;
    if sums.is_empty() {
        return Ok(Vec::new());
    }

    let base: Vec<P::Row> = sums.iter().map(|row| pipeline.finalize(chart, row)).collect();
    ctx.chart_db.replace_rows(base.clone()).await?;
    let base = average_pass(ctx, pipeline, chart, pipeline.base(), base).await?;

    for period in pipeline.rollups() {
        let (period_start, period_end) = period.containing(start);
        let partial: Vec<P::Row> = sums
            .iter()
            .map(|row| pipeline.with_period(row, *period, period_start, period_end))
            .collect();
        ctx.chart_db.accumulate_rows(partial).await?;
    }

    for period in pipeline.rollups() {
        let (_, period_end) = period.containing(start);
        let pending: Vec<P::Row> = ctx
            .chart_db
            .get_pending_rows(chart.chain_id.clone(), period.minutes(), period_end)
            .await?;
        let finalized: Vec<P::Row> = pending.iter().map(|row| pipeline.finalize(chart, row)).collect();
        ctx.chart_db.replace_rows(finalized.clone()).await?;
        average_pass(ctx, pipeline, chart, *period, finalized).await?;
    }
    Ok(base)
}

/// Second finalize pass: re-reads the average window, which now includes
/// the rows just written, and stores the averages.
async fn average_pass<P: Pipeline>(
    ctx: &PoolContext,
    pipeline: &P,
    chart: &ChainChart,
    period: Period,
    mut rows: Vec<P::Row>,
) -> PoolResult<Vec<P::Row>> {
    let latest = match rows.iter().map(|r| pipeline.end_time(r)).max() {
        Some(latest) => latest,
        None => return Ok(rows),
    };
    let window: Vec<P::Row> = ctx
        .chart_db
        .get_rows(
            chart.chain_id.clone(),
            period.minutes(),
            latest - period.average_window(),
            latest,
        )
        .await?;
    for row in rows.iter_mut() {
        pipeline.apply_averages(row, &window);
    }
    ctx.chart_db.replace_rows(rows.clone()).await?;
    Ok(rows)
}

async fn truncate<P: Pipeline>(ctx: &PoolContext, pipeline: &P, chain: &Arc<Chain>, now: NaiveDateTime) -> PoolResult<()> {
    let periods: Vec<Period> = std::iter::once(pipeline.base())
        .chain(pipeline.rollups().iter().copied())
        .collect();
    for period in periods {
        ctx.chart_db
            .delete_rows_before::<P::Row>(chain.id().to_string(), period.minutes(), now - period.retention())
            .await?;
    }
    Ok(())
}
