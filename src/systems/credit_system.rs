use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::chains::Chain;
use crate::context::PoolContext;
use crate::credit::plan_round_credit;
use crate::cron::{run_cron, ROUND_CREDIT};
use crate::error::PoolResult;

use super::report_chain_error;

pub async fn credit_system(ctx: Arc<PoolContext>, cancel: CancellationToken) {
    run_cron(ctx, ROUND_CREDIT, cancel, credit_tick).await
}

pub async fn credit_tick(ctx: Arc<PoolContext>, run_id: Uuid) -> PoolResult<()> {
    for chain in ctx.chains.mineable() {
        if let Err(e) = credit_chain(&ctx, chain, run_id).await {
            report_chain_error(&ctx, run_id, "credit", chain.id(), &e);
        }
    }
    Ok(())
}

/// Credits every unlocked, uncredited round of the chain, one DB
/// transaction per round. A round that fails stops the chain for this
/// tick so later rounds are not credited ahead of it.
async fn credit_chain(ctx: &PoolContext, chain: &Arc<Chain>, run_id: Uuid) -> PoolResult<()> {
    let rounds = ctx.db.get_creditable_rounds(chain.id().to_string()).await?;
    for round in rounds {
        let round_id = round.id;
        let inputs = ctx.db.get_round_credit_inputs(round).await?;
        let plan = plan_round_credit(
            &inputs.round,
            &inputs.shares,
            &inputs.out_chains,
            &inputs.recipients,
            ctx.pool_fee_percent,
        )?;
        let credited = plan.credited();
        let receivers = plan.entries.len();
        let retained = plan.retained_fees.clone();
        ctx.db.credit_round(plan).await?;
        info!(
            target: "cron_log",
            "[{}] credit {}: round {} credited {} to {} receivers, {} retained",
            run_id,
            chain.id(),
            round_id,
            credited,
            receivers,
            retained
        );
    }
    Ok(())
}
