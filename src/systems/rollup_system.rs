use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::context::PoolContext;
use crate::cron::{run_cron, BLOCK_ROLLUP, ROUND_ROLLUP, SHARE_ROLLUP};
use crate::error::PoolResult;
use crate::rollup::blocks::BlockPipeline;
use crate::rollup::rounds::RoundPipeline;
use crate::rollup::run_pipeline;
use crate::rollup::shares::SharePipeline;

pub async fn block_rollup_system(ctx: Arc<PoolContext>, cancel: CancellationToken) {
    run_cron(ctx, BLOCK_ROLLUP, cancel, block_rollup_tick).await
}

pub async fn round_rollup_system(ctx: Arc<PoolContext>, cancel: CancellationToken) {
    run_cron(ctx, ROUND_ROLLUP, cancel, round_rollup_tick).await
}

pub async fn share_rollup_system(ctx: Arc<PoolContext>, cancel: CancellationToken) {
    run_cron(ctx, SHARE_ROLLUP, cancel, share_rollup_tick).await
}

pub async fn block_rollup_tick(ctx: Arc<PoolContext>, run_id: Uuid) -> PoolResult<()> {
    run_pipeline(ctx, &BlockPipeline, run_id).await
}

pub async fn round_rollup_tick(ctx: Arc<PoolContext>, run_id: Uuid) -> PoolResult<()> {
    run_pipeline(ctx, &RoundPipeline, run_id).await
}

pub async fn share_rollup_tick(ctx: Arc<PoolContext>, run_id: Uuid) -> PoolResult<()> {
    run_pipeline(ctx, &SharePipeline, run_id).await
}
