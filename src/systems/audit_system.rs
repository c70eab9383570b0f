use std::fmt;
use std::sync::Arc;

use num_bigint::BigInt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::app_database::audit::AuditSnapshot;
use crate::chains::Chain;
use crate::context::PoolContext;
use crate::cron::{run_cron, AUDIT};
use crate::error::PoolResult;

use super::report_chain_error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditMismatch {
    /// The node's balance, after the configured adjustment, disagrees with
    /// what the ledger says the wallet holds.
    Wallet { reported: BigInt, expected: BigInt },
    /// What the pool holds disagrees with what it owes plus what it kept.
    Ledger { held: BigInt, owed: BigInt },
}

impl fmt::Display for AuditMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditMismatch::Wallet { reported, expected } => write!(
                f,
                "wallet {} != ledger {} (diff {})",
                reported,
                expected,
                reported - expected
            ),
            AuditMismatch::Ledger { held, owed } => {
                write!(f, "held {} != owed {} (diff {})", held, owed, held - owed)
            }
        }
    }
}

pub async fn audit_system(ctx: Arc<PoolContext>, cancel: CancellationToken) {
    run_cron(ctx, AUDIT, cancel, audit_tick).await
}

pub async fn audit_tick(ctx: Arc<PoolContext>, run_id: Uuid) -> PoolResult<()> {
    for chain in ctx.chains.payable() {
        if let Err(e) = audit_chain(&ctx, chain, run_id).await {
            report_chain_error(&ctx, run_id, "audit", chain.id(), &e);
        }
    }
    Ok(())
}

/// Compares both sides of the wallet and ledger identities for one chain.
pub fn reconcile(
    snapshot: &AuditSnapshot,
    balance: &BigInt,
    adjustment: &BigInt,
    include_immature: bool,
) -> Vec<AuditMismatch> {
    let mut mismatches = Vec::new();

    let reported = balance - adjustment;
    let mut expected = snapshot.unspent_utxos.clone();
    if include_immature {
        expected += &snapshot.immature_rounds;
        expected += &snapshot.unconfirmed_txs;
    }
    if reported != expected {
        mismatches.push(AuditMismatch::Wallet { reported, expected });
    }

    let held = &snapshot.unspent_utxos + &snapshot.immature_rounds;
    let owed = &snapshot.pending_inputs
        + &snapshot.unpaid_outputs
        + &snapshot.uncredited_rounds
        + &snapshot.fee_balances
        + &snapshot.retained_fees;
    if held != owed {
        mismatches.push(AuditMismatch::Ledger { held, owed });
    }
    mismatches
}

async fn audit_chain(ctx: &PoolContext, chain: &Arc<Chain>, run_id: Uuid) -> PoolResult<()> {
    let node = chain.payout_node()?;
    let snapshot = ctx.db.get_audit_snapshot(chain.id().to_string()).await?;
    if snapshot.outstanding_txs > 0 {
        info!(target: "cron_log", "[{}] audit {}: outstanding tx, skipping", run_id, chain.id());
        return Ok(());
    }
    let balance = node.get_balance().await?;

    let mismatches = reconcile(
        &snapshot,
        &balance.0,
        &chain.config.wallet_balance_adjustment.0,
        chain.config.include_immature_in_wallet,
    );
    if mismatches.is_empty() {
        info!(target: "cron_log", "[{}] audit {}: balanced at {}", run_id, chain.id(), balance);
        return Ok(());
    }
    for mismatch in mismatches.iter() {
        error!(target: "cron_log", "[{}] audit {}: {}", run_id, chain.id(), mismatch);
        ctx.notifier.alert(format!("audit {}: {}", chain.id(), mismatch));
    }
    Ok(())
}
