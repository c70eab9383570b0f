use std::sync::Arc;

use num_bigint::BigInt;
use num_traits::Signed;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::amount::Amount;
use crate::app_database::payouts::{insert_payout, NewPayout};
use crate::bank::{obtain_bank_lease, prepare_outgoing_txs};
use crate::chains::{Chain, TxOutput};
use crate::context::PoolContext;
use crate::cron::{run_cron, PAYOUTS};
use crate::error::{PoolError, PoolResult};
use crate::models::{PayoutCandidate, TransactionType};

use super::report_chain_error;

/// One miner's unpaid mature balance on a chain, due for payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutRequest {
    pub miner_id: i64,
    pub address: String,
    pub owed: BigInt,
}

pub async fn payout_system(ctx: Arc<PoolContext>, cancel: CancellationToken) {
    run_cron(ctx, PAYOUTS, cancel, payout_tick).await
}

pub async fn payout_tick(ctx: Arc<PoolContext>, run_id: Uuid) -> PoolResult<()> {
    for chain in ctx.chains.payable() {
        if let Err(e) = pay_chain(&ctx, chain, run_id).await {
            report_chain_error(&ctx, run_id, "payout", chain.id(), &e);
        }
    }
    Ok(())
}

/// Keeps the miners whose balance reached their own threshold, or the
/// chain minimum when they set none.
pub fn select_payouts(candidates: &[PayoutCandidate], min_payout: &BigInt) -> Vec<PayoutRequest> {
    candidates
        .iter()
        .filter_map(|c| {
            let owed = c.value.as_ref()?.0.clone();
            let threshold = c.threshold.as_ref().map(|t| &t.0).unwrap_or(min_payout);
            (owed.is_positive() && &owed >= threshold).then(|| PayoutRequest {
                miner_id: c.miner_id,
                address: c.address.clone(),
                owed,
            })
        })
        .collect()
}

/// Splits the requests into transactions of at most `per_tx` outputs. Every
/// output pays its share of the fee.
pub fn payout_groups(requests: &[PayoutRequest], per_tx: usize) -> Vec<Vec<TxOutput>> {
    requests
        .chunks(per_tx.max(1))
        .map(|chunk| {
            chunk
                .iter()
                .map(|r| TxOutput::splitting_fee(r.address.clone(), Amount::from(&r.owed)))
                .collect()
        })
        .collect()
}

async fn pay_chain(ctx: &PoolContext, chain: &Arc<Chain>, run_id: Uuid) -> PoolResult<()> {
    let candidates = ctx.db.get_payout_candidates(chain.id().to_string()).await?;
    let requests = select_payouts(&candidates, &chain.config.min_payout.0);
    if requests.is_empty() {
        return Ok(());
    }

    let lease = match obtain_bank_lease(ctx, chain.id()).await? {
        Some(lease) => lease,
        None => {
            info!(target: "cron_log", "[{}] payout {}: bank lease held elsewhere", run_id, chain.id());
            return Ok(());
        }
    };
    let result = prepare_payouts(ctx, chain, run_id, requests).await;
    ctx.locker.release(lease).await;
    result
}

async fn prepare_payouts(
    ctx: &PoolContext,
    chain: &Arc<Chain>,
    run_id: Uuid,
    requests: Vec<PayoutRequest>,
) -> PoolResult<()> {
    let mut per_tx = chain.config.max_outputs_per_tx.max(1);
    loop {
        let groups = payout_groups(&requests, per_tx);
        let chunks: Vec<Vec<PayoutRequest>> = requests.chunks(per_tx).map(|c| c.to_vec()).collect();
        let chain_id = chain.id().to_string();

        let prepared = prepare_outgoing_txs(ctx, chain, TransactionType::Payout, groups, move |conn, txs| {
            let mut count = 0;
            for ((tx_id, tx), chunk) in txs.iter().zip(chunks.iter()) {
                for (index, request) in chunk.iter().enumerate() {
                    let value = tx.output_value(index).ok_or_else(|| {
                        PoolError::invalid(format!("tx {} has no output {}", tx.txid, index))
                    })?;
                    insert_payout(
                        conn,
                        &NewPayout {
                            chain_id: chain_id.clone(),
                            miner_id: request.miner_id,
                            address: request.address.clone(),
                            transaction_id: *tx_id,
                            txid: tx.txid.clone(),
                            owed: request.owed.clone(),
                            value: value.clone(),
                        },
                    )?;
                    count += 1;
                }
            }
            Ok(count)
        })
        .await;

        match prepared {
            Ok((txs, Some(count))) => {
                info!(
                    target: "cron_log",
                    "[{}] payout {}: {} payouts in {} tx(s)",
                    run_id,
                    chain.id(),
                    count,
                    txs.len()
                );
                return Ok(());
            }
            Ok((_, None)) => {
                info!(target: "cron_log", "[{}] payout {}: outstanding tx, waiting", run_id, chain.id());
                return Ok(());
            }
            Err(PoolError::TxTooBig) if per_tx > 1 => {
                per_tx /= 2;
                warn!(
                    target: "cron_log",
                    "[{}] payout {}: tx too big, retrying with {} outputs per tx",
                    run_id,
                    chain.id(),
                    per_tx
                );
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(miner_id: i64, value: i64, threshold: Option<i64>) -> PayoutCandidate {
        PayoutCandidate {
            miner_id,
            address: format!("addr{}", miner_id),
            threshold: threshold.map(Amount::from),
            value: Some(Amount::from(value)),
            pool_fees: Some(Amount::zero()),
            exchange_fees: Some(Amount::zero()),
        }
    }

    #[test]
    fn exactly_threshold_is_paid() {
        let min = BigInt::from(100);
        let selected = select_payouts(
            &[
                candidate(1, 100, None),
                candidate(2, 99, None),
                candidate(3, 50, Some(50)),
                candidate(4, 150, Some(200)),
            ],
            &min,
        );
        let ids: Vec<i64> = selected.iter().map(|r| r.miner_id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(selected[0].owed, BigInt::from(100));
    }

    #[test]
    fn empty_and_zero_balances_are_skipped() {
        let min = BigInt::from(0);
        assert!(select_payouts(&[], &min).is_empty());

        let mut missing = candidate(5, 0, None);
        missing.value = None;
        assert!(select_payouts(&[candidate(6, 0, None), missing], &min).is_empty());
    }

    #[test]
    fn groups_respect_output_limit() {
        let requests: Vec<PayoutRequest> = (1..=5)
            .map(|id| PayoutRequest {
                miner_id: id,
                address: format!("addr{}", id),
                owed: BigInt::from(id * 10),
            })
            .collect();

        let groups = payout_groups(&requests, 2);
        assert_eq!(groups.iter().map(|g| g.len()).collect::<Vec<_>>(), vec![2, 2, 1]);
        assert!(groups.iter().flatten().all(|o| o.split_fee));
        assert_eq!(groups[2][0].address, "addr5");
        assert_eq!(groups[2][0].value, Amount::from(50i64));

        assert_eq!(payout_groups(&requests, 0).len(), 5);
    }
}
