use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::context::PoolContext;
use crate::cron::{run_cron, EXCHANGE_BATCH};
use crate::error::PoolResult;
use crate::exchange::batcher::Batcher;

pub async fn batch_system(ctx: Arc<PoolContext>, cancel: CancellationToken) {
    if ctx.exchange.is_none() {
        info!(target: "exchange_log", "no exchange configured, batching disabled");
        return;
    }
    run_cron(ctx, EXCHANGE_BATCH, cancel, batch_tick).await
}

pub async fn batch_tick(ctx: Arc<PoolContext>, _run_id: Uuid) -> PoolResult<()> {
    let exchange = match ctx.exchange.clone() {
        Some(exchange) => exchange,
        None => return Ok(()),
    };
    Batcher::new(ctx, exchange).run().await
}
