use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chains::{Chain, RoundUnlock};
use crate::context::PoolContext;
use crate::cron::{run_cron, ROUND_UNLOCK};
use crate::error::PoolResult;
use crate::models::Round;

use super::report_chain_error;

pub async fn unlock_system(ctx: Arc<PoolContext>, cancel: CancellationToken) {
    run_cron(ctx, ROUND_UNLOCK, cancel, unlock_tick).await
}

pub async fn unlock_tick(ctx: Arc<PoolContext>, run_id: Uuid) -> PoolResult<()> {
    for chain in ctx.chains.mineable() {
        if let Err(e) = unlock_chain(&ctx, chain, run_id).await {
            report_chain_error(&ctx, run_id, "unlock", chain.id(), &e);
        }
    }
    Ok(())
}

/// Heights below which pending rounds are unlocked and immature rounds
/// matured. `None` while the chain is too young for either.
pub fn unlock_bounds(height: u64, immature_depth: u64, mature_depth: u64) -> (Option<u64>, Option<u64>) {
    (height.checked_sub(immature_depth), height.checked_sub(mature_depth))
}

async fn unlock_chain(ctx: &PoolContext, chain: &Arc<Chain>, run_id: Uuid) -> PoolResult<()> {
    let node = chain.mining_node()?;
    let status = node.get_status().await?;
    if status.syncing {
        warn!(target: "cron_log", "[{}] unlock {}: node is syncing, skipping", run_id, chain.id());
        return Ok(());
    }

    let (unlock_below, mature_below) =
        unlock_bounds(status.height, node.immature_depth(), node.mature_depth());

    let mut unlocks: Vec<(i64, RoundUnlock)> = Vec::new();
    if let Some(below) = unlock_below {
        for round in ctx.db.get_pending_rounds(chain.id().to_string(), below).await? {
            match node.unlock_round(&round).await {
                Ok(unlock) => unlocks.push((round.id, unlock)),
                Err(e) => {
                    warn!(
                        target: "cron_log",
                        "[{}] unlock {}: round {} at {} failed: {:?}",
                        run_id,
                        chain.id(),
                        round.id,
                        round.height,
                        e
                    );
                }
            }
        }
    }

    let matured: Vec<Round> = match mature_below {
        Some(below) => ctx.db.get_immature_rounds(chain.id().to_string(), below).await?,
        None => Vec::new(),
    };

    if unlocks.is_empty() && matured.is_empty() {
        return Ok(());
    }

    let instant = Instant::now();
    let (unlocked, matured) = ctx
        .db
        .unlock_rounds(chain.id().to_string(), unlocks, matured)
        .await?;
    info!(
        target: "cron_log",
        "[{}] unlock {}: {} unlocked, {} matured at height {} in {}ms",
        run_id,
        chain.id(),
        unlocked,
        matured,
        status.height,
        instant.elapsed().as_millis()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_follow_node_depths() {
        assert_eq!(unlock_bounds(1_000, 10, 100), (Some(990), Some(900)));
        assert_eq!(unlock_bounds(50, 10, 100), (Some(40), None));
        assert_eq!(unlock_bounds(5, 10, 100), (None, None));
    }
}
