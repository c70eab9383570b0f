use std::sync::Arc;

use diesel::MysqlConnection;
use num_bigint::BigInt;
use num_traits::{Signed, Zero};
use tracing::{info, warn};

use super::plan::{plan_outgoing_txs, PreparedTx, SpendableUtxo};
use crate::amount::{require, Amount};
use crate::app_database::balances::{
    add_balance_sum, get_random_output_covering, insert_balance_output, subtract_from_output,
    NewBalanceOutput,
};
use crate::app_database::bank::persist_prepared_txs;
use crate::chains::{AccountingType, Chain, PayoutNode, TxOutput};
use crate::context::PoolContext;
use crate::error::{PoolError, PoolResult};
use crate::models::TransactionType;

/// `ceil(n / count)`, at least 1.
pub fn merge_group_size(utxo_count: usize, count: usize) -> usize {
    if count == 0 {
        return utxo_count.max(1);
    }
    ((utxo_count + count - 1) / count).max(1)
}

async fn plan_merge(
    node: &dyn PayoutNode,
    unspent_tx_count: i64,
    utxos: &[SpendableUtxo],
    group_size: usize,
) -> PoolResult<Vec<PreparedTx>> {
    let mut prepared = Vec::new();
    for group in utxos.chunks(group_size) {
        if group.len() < 2 {
            continue;
        }
        let total: BigInt = group.iter().map(|u| &u.value).sum();
        let outputs = vec![vec![TxOutput::splitting_fee(node.address(), Amount(total))]];
        let mut txs = plan_outgoing_txs(
            node,
            TransactionType::Merge,
            unspent_tx_count,
            group.to_vec(),
            &outputs,
            false,
        )
        .await?;
        prepared.append(&mut txs);
    }
    Ok(prepared)
}

/// Charges a merge fee to a random mature output and leaves a spent,
/// zero-value output behind pointing at the merge transaction.
fn charge_merge_fee(conn: &mut MysqlConnection, chain_id: &str, tx_id: i64, fee: &BigInt) -> PoolResult<()> {
    if !fee.is_positive() {
        return Ok(());
    }
    let output = get_random_output_covering(conn, chain_id, fee)?.ok_or_else(|| PoolError::Overspend {
        have: BigInt::zero(),
        want: fee.clone(),
    })?;
    require(&output.value, "balance output value")?;

    subtract_from_output(conn, output.id, fee)?;
    insert_balance_output(
        conn,
        &NewBalanceOutput {
            chain_id: chain_id.to_string(),
            miner_id: output.miner_id,
            value: BigInt::zero(),
            tx_fees: fee.clone(),
            mature: true,
            spent: true,
            out_merge_transaction_id: Some(tx_id),
            ..Default::default()
        },
    )?;
    add_balance_sum(conn, output.miner_id, chain_id, &BigInt::zero(), &-fee)?;
    Ok(())
}

/// Consolidates the chain's UTXO set into `count` transactions paying the
/// pool itself. Groups shrink by half while the codec reports them too
/// large. The caller holds the bank lease.
pub async fn merge_utxos(ctx: &PoolContext, chain: &Arc<Chain>, count: usize) -> PoolResult<Vec<i64>> {
    let node = chain.payout_node()?;
    if node.accounting_type() != AccountingType::Utxo {
        return Err(PoolError::invalid(format!("{}: not a utxo chain", chain.id())));
    }

    let (unspent, rows) = ctx.db.get_bank_state(chain.id().to_string()).await?;
    if unspent > 0 {
        info!(target: "bank_log", "{}: outstanding transaction, skipping merge", chain.id());
        return Ok(Vec::new());
    }
    let utxos = rows
        .iter()
        .map(SpendableUtxo::from_row)
        .collect::<PoolResult<Vec<_>>>()?;
    if utxos.len() < 2 {
        return Ok(Vec::new());
    }

    let mut group_size = merge_group_size(utxos.len(), count);
    let planned = loop {
        match plan_merge(node.as_ref(), unspent, &utxos, group_size).await {
            Ok(planned) => break planned,
            Err(PoolError::TxTooBig) if group_size / 2 >= 2 => {
                group_size /= 2;
                warn!(target: "bank_log", "{}: merge too big, retrying with groups of {}", chain.id(), group_size);
            }
            Err(e) => return Err(e),
        }
    };
    if planned.is_empty() {
        return Ok(Vec::new());
    }

    let chain_id = chain.id().to_string();
    let ids = ctx
        .db
        .transaction(move |conn| {
            let ids = persist_prepared_txs(conn, &chain_id, &planned)?;
            for (id, tx) in ids.iter().zip(planned.iter()) {
                charge_merge_fee(conn, &chain_id, *id, &tx.fee)?;
            }
            Ok(ids)
        })
        .await?;

    info!(
        target: "bank_log",
        "{}: prepared {} merge tx(s) over {} utxos in groups of {}",
        chain.id(),
        ids.len(),
        utxos.len(),
        group_size
    );
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::plan::UtxoSource;
    use crate::chains::testing::FakeNode;

    fn utxos(n: i64) -> Vec<SpendableUtxo> {
        (1..=n)
            .map(|id| SpendableUtxo {
                source: UtxoSource::Stored(id),
                txid: format!("cb-{}", id),
                index: 0,
                value: BigInt::from(10),
            })
            .collect()
    }

    #[test]
    fn group_size_is_ceiling() {
        assert_eq!(merge_group_size(10, 3), 4);
        assert_eq!(merge_group_size(9, 3), 3);
        assert_eq!(merge_group_size(1, 5), 1);
        assert_eq!(merge_group_size(7, 0), 7);
    }

    #[tokio::test]
    async fn merge_pays_the_pool_and_charges_the_fee() {
        let node = FakeNode::new("KAS", AccountingType::Utxo).with_fee(3);
        let txs = plan_merge(&node, 0, &utxos(4), 2).await.unwrap();

        assert_eq!(txs.len(), 2);
        for tx in txs.iter() {
            assert_eq!(tx.inputs.len(), 2);
            assert_eq!(tx.value, BigInt::from(17));
            assert_eq!(tx.fee, BigInt::from(3));
            assert!(tx.remainder.is_zero());
            assert_eq!(tx.self_outputs.len(), 1);
            assert_eq!(tx.self_outputs[0].value, BigInt::from(17));
        }
    }

    #[tokio::test]
    async fn trailing_single_utxo_is_left_alone() {
        let node = FakeNode::new("KAS", AccountingType::Utxo);
        let txs = plan_merge(&node, 0, &utxos(5), 2).await.unwrap();
        assert_eq!(txs.len(), 2);
    }

    #[tokio::test]
    async fn oversized_groups_fail_until_halved() {
        let node = FakeNode::new("KAS", AccountingType::Utxo).with_max_inputs(2);
        assert!(matches!(
            plan_merge(&node, 0, &utxos(8), 4).await.unwrap_err(),
            PoolError::TxTooBig
        ));
        assert_eq!(plan_merge(&node, 0, &utxos(8), 2).await.unwrap().len(), 4);
    }
}
