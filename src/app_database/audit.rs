use diesel::sql_types::VarChar;
use diesel::{MysqlConnection, QueryResult, RunQueryDsl};
use num_bigint::BigInt as Big;

use super::bank::count_unspent_transactions;
use super::AppDatabase;
use crate::amount::Amount;
use crate::error::PoolResult;
use crate::models;

/// Ledger totals for one chain, read in one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditSnapshot {
    pub outstanding_txs: i64,
    pub unspent_utxos: Big,
    /// Unlocked, not orphaned, not yet mature.
    pub immature_rounds: Big,
    /// Unlocked, not orphaned, not yet credited.
    pub uncredited_rounds: Big,
    /// Broadcast but not confirmed.
    pub unconfirmed_txs: Big,
    /// Cross-chain credits whose value is still in this chain's wallet.
    pub pending_inputs: Big,
    pub unpaid_outputs: Big,
    /// Fee refunds on account chains, kept by the pool.
    pub fee_balances: Big,
    /// Pool fees withheld from credited rounds with no recipient to take them.
    pub retained_fees: Big,
}

fn sum(conn: &mut MysqlConnection, query: &str, chain_id: &str) -> QueryResult<Big> {
    let row: models::AmountSum = diesel::sql_query(query)
        .bind::<VarChar, _>(chain_id)
        .get_result(conn)?;
    Ok(row.value.map(Amount::into_inner).unwrap_or_default())
}

fn sum_two(conn: &mut MysqlConnection, query: &str, chain_id: &str) -> QueryResult<Big> {
    let row: models::AmountSum = diesel::sql_query(query)
        .bind::<VarChar, _>(chain_id)
        .bind::<VarChar, _>(chain_id)
        .get_result(conn)?;
    Ok(row.value.map(Amount::into_inner).unwrap_or_default())
}

pub fn read_snapshot(conn: &mut MysqlConnection, chain_id: &str) -> QueryResult<AuditSnapshot> {
    Ok(AuditSnapshot {
        outstanding_txs: count_unspent_transactions(conn, chain_id)?,
        unspent_utxos: sum(
            conn,
            "SELECT SUM(value) AS value FROM utxos WHERE chain_id = ? AND active = 1 AND spent = 0",
            chain_id,
        )?,
        immature_rounds: sum(
            conn,
            "SELECT SUM(value) AS value FROM rounds WHERE chain_id = ? AND pending = 0 AND orphan = 0 \
             AND mature = 0",
            chain_id,
        )?,
        uncredited_rounds: sum(
            conn,
            "SELECT SUM(value) AS value FROM rounds WHERE chain_id = ? AND pending = 0 AND orphan = 0 \
             AND spent = 0",
            chain_id,
        )?,
        unconfirmed_txs: sum(
            conn,
            "SELECT SUM(value) AS value FROM transactions WHERE chain_id = ? AND spent = 1 \
             AND confirmed = 0 AND failed = 0",
            chain_id,
        )?,
        pending_inputs: sum_two(
            conn,
            "SELECT SUM(i.value) AS value FROM balance_inputs i WHERE i.chain_id = ? AND i.pending = 1 \
             AND i.balance_output_id IS NULL AND (i.batch_id IS NULL OR NOT EXISTS \
             (SELECT 1 FROM exchange_deposits d WHERE d.batch_id = i.batch_id AND d.chain_id = ?))",
            chain_id,
        )?,
        unpaid_outputs: sum(
            conn,
            "SELECT SUM(value) AS value FROM balance_outputs WHERE chain_id = ? AND spent = 0",
            chain_id,
        )?,
        fee_balances: sum(
            conn,
            "SELECT SUM(fee_balance) AS value FROM transactions WHERE chain_id = ? AND confirmed = 1",
            chain_id,
        )?,
        retained_fees: sum_two(
            conn,
            "SELECT (SELECT COALESCE(SUM(value), 0) FROM rounds WHERE chain_id = ? AND spent = 1) - \
             (SELECT COALESCE(SUM(value), 0) FROM balance_inputs WHERE chain_id = ?) AS value",
            chain_id,
        )?,
    })
}

impl AppDatabase {
    pub async fn get_audit_snapshot(&self, chain_id: String) -> PoolResult<AuditSnapshot> {
        self.transaction(move |conn| Ok(read_snapshot(conn, &chain_id)?))
            .await
    }
}
