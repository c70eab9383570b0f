use diesel::sql_types::{BigInt, Numeric, VarChar};
use diesel::{MysqlConnection, RunQueryDsl};
use num_bigint::BigInt as Big;
use num_traits::Zero;

use super::balances::{add_balance_sum, get_unpaid_outputs};
use super::{expect_rows, id_list, last_insert_id, AppDatabase};
use crate::amount::{require, Amount};
use crate::error::{PoolError, PoolResult};
use crate::models;

/// A payout row as bound to its transaction.
#[derive(Debug, Clone)]
pub struct NewPayout {
    pub chain_id: String,
    pub miner_id: i64,
    pub address: String,
    pub transaction_id: i64,
    pub txid: String,
    /// What the miner's outputs added up to when the payout was planned.
    pub owed: Big,
    /// What actually leaves the wallet, after the miner's share of the fee.
    pub value: Big,
}

/// Writes one payout and moves the miner's unpaid outputs under it. Fails
/// with `Transient` when the outputs changed since `owed` was read, so the
/// whole preparation rolls back and is retried next tick.
pub fn insert_payout(conn: &mut MysqlConnection, payout: &NewPayout) -> PoolResult<i64> {
    let outputs = get_unpaid_outputs(conn, &payout.chain_id, payout.miner_id)?;
    let mut owed = Big::zero();
    let mut pool_fees = Big::zero();
    let mut exchange_fees = Big::zero();
    for output in outputs.iter() {
        owed += require(&output.value, "balance output value")?;
        pool_fees += output.pool_fees.as_ref().map(|v| v.0.clone()).unwrap_or_default();
        exchange_fees += output.exchange_fees.as_ref().map(|v| v.0.clone()).unwrap_or_default();
    }
    if owed != payout.owed {
        return Err(PoolError::transient(format!(
            "miner {} balance on {} moved from {} to {}",
            payout.miner_id, payout.chain_id, payout.owed, owed
        )));
    }
    let tx_fees = &owed - &payout.value;

    diesel::sql_query(
        "INSERT INTO payouts (chain_id, miner_id, address, transaction_id, txid, value, fee_balance, \
         pool_fees, exchange_fees, tx_fees, pending, confirmed, failed) \
         VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?, 1, 0, 0)",
    )
    .bind::<VarChar, _>(&payout.chain_id)
    .bind::<BigInt, _>(payout.miner_id)
    .bind::<VarChar, _>(&payout.address)
    .bind::<BigInt, _>(payout.transaction_id)
    .bind::<VarChar, _>(&payout.txid)
    .bind::<Numeric, _>(Amount::from(&payout.value))
    .bind::<Numeric, _>(Amount::from(&pool_fees))
    .bind::<Numeric, _>(Amount::from(&exchange_fees))
    .bind::<Numeric, _>(Amount::from(&tx_fees))
    .execute(conn)?;
    let payout_id = last_insert_id(conn)?;

    let ids: Vec<i64> = outputs.iter().map(|o| o.id).collect();
    let affected = diesel::sql_query(format!(
        "UPDATE balance_outputs SET out_payout_id = ?, spent = 1 WHERE id IN ({}) AND spent = 0",
        id_list(&ids)
    ))
    .bind::<BigInt, _>(payout_id)
    .execute(conn)?;
    expect_rows(affected, ids.len(), "payout output binding")?;

    add_balance_sum(conn, payout.miner_id, &payout.chain_id, &Big::zero(), &-owed)?;
    Ok(payout_id)
}

impl AppDatabase {
    /// Per-miner sums of mature unpaid outputs on one chain, with the
    /// miner's own threshold when set.
    pub async fn get_payout_candidates(&self, chain_id: String) -> PoolResult<Vec<models::PayoutCandidate>> {
        self.interact(move |conn| {
            Ok(diesel::sql_query(
                "SELECT o.miner_id, m.address, m.threshold, SUM(o.value) AS value, \
                 SUM(o.pool_fees) AS pool_fees, SUM(o.exchange_fees) AS exchange_fees \
                 FROM balance_outputs o JOIN miners m ON m.id = o.miner_id \
                 WHERE o.chain_id = ? AND o.mature = 1 AND o.spent = 0 AND o.out_payout_id IS NULL \
                 GROUP BY o.miner_id, m.address, m.threshold ORDER BY o.miner_id",
            )
            .bind::<VarChar, _>(chain_id)
            .load(conn)?)
        })
        .await
    }
}
