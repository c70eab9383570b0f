use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::bank::{broadcast_outgoing_txs, confirm_outgoing_txs, obtain_bank_lease};
use crate::chains::Chain;
use crate::context::PoolContext;
use crate::cron::{run_cron, BANK};
use crate::error::PoolResult;

use super::report_chain_error;

pub async fn bank_system(ctx: Arc<PoolContext>, cancel: CancellationToken) {
    run_cron(ctx, BANK, cancel, bank_tick).await
}

pub async fn bank_tick(ctx: Arc<PoolContext>, run_id: Uuid) -> PoolResult<()> {
    for chain in ctx.chains.payable() {
        let lease = match obtain_bank_lease(&ctx, chain.id()).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                info!(target: "bank_log", "[{}] {}: bank lease held elsewhere", run_id, chain.id());
                continue;
            }
            Err(e) => {
                report_chain_error(&ctx, run_id, "bank", chain.id(), &e);
                continue;
            }
        };
        if let Err(e) = settle_chain(&ctx, chain, run_id).await {
            report_chain_error(&ctx, run_id, "bank", chain.id(), &e);
        }
        ctx.locker.release(lease).await;
    }
    Ok(())
}

async fn settle_chain(ctx: &PoolContext, chain: &Arc<Chain>, run_id: Uuid) -> PoolResult<()> {
    let sent = broadcast_outgoing_txs(ctx, chain).await?;
    let confirmed = confirm_outgoing_txs(ctx, chain).await?;
    if !sent.is_empty() || confirmed > 0 {
        info!(
            target: "bank_log",
            "[{}] {}: {} broadcast, {} confirmed",
            run_id,
            chain.id(),
            sent.len(),
            confirmed
        );
    }
    Ok(())
}
