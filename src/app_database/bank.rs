use std::collections::HashMap;

use diesel::sql_types::{BigInt, Bool, Integer, Nullable, Numeric, Text, Unsigned, VarChar};
use diesel::{MysqlConnection, QueryResult, RunQueryDsl};
use num_bigint::BigInt as Big;
use num_traits::Signed;

use super::{expect_rows, last_insert_id, AppDatabase};
use crate::amount::Amount;
use crate::bank::{PreparedTx, UtxoSource};
use crate::error::{PoolError, PoolResult};
use crate::models;

const UTXO_COLUMNS: &str = "id, chain_id, transaction_id, txid, idx, value, active, spent";

const TX_COLUMNS: &str = "id, chain_id, tx_type, txid, tx_hex, height, value, fee, fee_balance, \
     remainder, remainder_idx, spent, confirmed, failed";

pub fn insert_utxo(
    conn: &mut MysqlConnection,
    chain_id: &str,
    txid: &str,
    idx: u32,
    value: &Big,
    active: bool,
    transaction_id: Option<i64>,
) -> QueryResult<i64> {
    diesel::sql_query(
        "INSERT INTO utxos (chain_id, transaction_id, txid, idx, value, active, spent) \
         VALUES (?, ?, ?, ?, ?, ?, 0)",
    )
    .bind::<VarChar, _>(chain_id)
    .bind::<Nullable<BigInt>, _>(transaction_id)
    .bind::<VarChar, _>(txid)
    .bind::<Unsigned<Integer>, _>(idx)
    .bind::<Numeric, _>(Amount::from(value))
    .bind::<Bool, _>(active)
    .execute(conn)?;
    last_insert_id(conn)
}

pub fn count_unspent_transactions(conn: &mut MysqlConnection, chain_id: &str) -> QueryResult<i64> {
    let row: models::Count = diesel::sql_query(
        "SELECT COUNT(*) AS count FROM transactions WHERE chain_id = ? AND spent = 0 AND failed = 0 \
         FOR UPDATE",
    )
    .bind::<VarChar, _>(chain_id)
    .get_result(conn)?;
    Ok(row.count)
}

/// Active, unspent, unbound UTXOs in insertion order.
pub fn get_spendable_utxos(conn: &mut MysqlConnection, chain_id: &str) -> QueryResult<Vec<models::Utxo>> {
    diesel::sql_query(format!(
        "SELECT {} FROM utxos WHERE chain_id = ? AND active = 1 AND spent = 0 \
         AND transaction_id IS NULL ORDER BY id",
        UTXO_COLUMNS
    ))
    .bind::<VarChar, _>(chain_id)
    .load(conn)
}

pub fn get_input_utxos(conn: &mut MysqlConnection, transaction_id: i64) -> QueryResult<Vec<models::Utxo>> {
    diesel::sql_query(format!(
        "SELECT {} FROM utxos WHERE transaction_id = ? ORDER BY id FOR UPDATE",
        UTXO_COLUMNS
    ))
    .bind::<BigInt, _>(transaction_id)
    .load(conn)
}

fn bind_utxo(conn: &mut MysqlConnection, utxo_id: i64, transaction_id: i64) -> PoolResult<()> {
    let affected = diesel::sql_query(
        "UPDATE utxos SET transaction_id = ? WHERE id = ? AND transaction_id IS NULL AND spent = 0",
    )
    .bind::<BigInt, _>(transaction_id)
    .bind::<BigInt, _>(utxo_id)
    .execute(conn)?;
    expect_rows(affected, 1, "utxo binding")
}

/// Writes prepared transactions, binds their inputs and inserts the
/// inactive UTXOs for outputs paying back to the pool. Returns the new
/// transaction ids in order.
pub fn persist_prepared_txs(
    conn: &mut MysqlConnection,
    chain_id: &str,
    txs: &[PreparedTx],
) -> PoolResult<Vec<i64>> {
    if count_unspent_transactions(conn, chain_id)? > 0 {
        return Err(PoolError::Duplicate(format!(
            "{} already has an outstanding transaction",
            chain_id
        )));
    }

    let mut virtual_ids: HashMap<(String, u32), i64> = HashMap::new();
    let mut ids = Vec::with_capacity(txs.len());
    for tx in txs.iter() {
        if tx.remainder.is_negative() {
            return Err(PoolError::Overspend {
                have: tx.input_sum(),
                want: &tx.value + &tx.fee,
            });
        }

        diesel::sql_query(
            "INSERT INTO transactions (chain_id, tx_type, txid, tx_hex, value, fee, fee_balance, \
             remainder, remainder_idx, spent, confirmed, failed) VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, 0, 0, 0)",
        )
        .bind::<VarChar, _>(chain_id)
        .bind::<VarChar, _>(tx.tx_type.as_str())
        .bind::<VarChar, _>(&tx.txid)
        .bind::<Text, _>(&tx.hex)
        .bind::<Numeric, _>(Amount::from(&tx.value))
        .bind::<Numeric, _>(Amount::from(&tx.fee))
        .bind::<Numeric, _>(Amount::from(&tx.remainder))
        .bind::<Nullable<Unsigned<Integer>>, _>(tx.remainder_idx)
        .execute(conn)?;
        let tx_id = last_insert_id(conn)?;

        for input in tx.inputs.iter() {
            let utxo_id = match input.source {
                UtxoSource::Stored(id) => id,
                UtxoSource::Virtual => *virtual_ids
                    .get(&(input.txid.clone(), input.index))
                    .ok_or_else(|| {
                        PoolError::invalid(format!("unknown virtual utxo {}:{}", input.txid, input.index))
                    })?,
            };
            bind_utxo(conn, utxo_id, tx_id)?;
        }

        for output in tx.self_outputs.iter() {
            let id = insert_utxo(conn, chain_id, &output.txid, output.index, &output.value, false, None)?;
            virtual_ids.insert((output.txid.clone(), output.index), id);
        }
        ids.push(tx_id);
    }
    Ok(ids)
}

pub fn get_transaction(conn: &mut MysqlConnection, id: i64) -> QueryResult<models::Transaction> {
    diesel::sql_query(format!("SELECT {} FROM transactions WHERE id = ? FOR UPDATE", TX_COLUMNS))
        .bind::<BigInt, _>(id)
        .get_result(conn)
}

pub fn sum_unregistered_deposits(conn: &mut MysqlConnection, chain_id: &str, txid: &str) -> PoolResult<Big> {
    let row: models::AmountSum = diesel::sql_query(
        "SELECT SUM(value) AS value FROM exchange_deposits WHERE chain_id = ? AND deposit_txid = ? \
         AND registered = 0",
    )
    .bind::<VarChar, _>(chain_id)
    .bind::<VarChar, _>(txid)
    .get_result(conn)?;
    Ok(row.value.map(Amount::into_inner).unwrap_or_default())
}

pub fn sum_payout_outputs(conn: &mut MysqlConnection, transaction_id: i64) -> PoolResult<Big> {
    let row: models::AmountSum = diesel::sql_query(
        "SELECT SUM(o.value) AS value FROM balance_outputs o JOIN payouts p ON o.out_payout_id = p.id \
         WHERE p.transaction_id = ?",
    )
    .bind::<BigInt, _>(transaction_id)
    .get_result(conn)?;
    Ok(row.value.map(Amount::into_inner).unwrap_or_default())
}

/// Records a successful broadcast: inputs spent, outputs paying the pool
/// active, transaction spent. The network txid replaces the preliminary one
/// everywhere it was copied.
pub fn mark_broadcast(
    conn: &mut MysqlConnection,
    tx: &models::Transaction,
    network_txid: &str,
) -> PoolResult<()> {
    if network_txid != tx.txid {
        diesel::sql_query("UPDATE transactions SET txid = ? WHERE id = ?")
            .bind::<VarChar, _>(network_txid)
            .bind::<BigInt, _>(tx.id)
            .execute(conn)?;
        diesel::sql_query("UPDATE utxos SET txid = ? WHERE chain_id = ? AND txid = ?")
            .bind::<VarChar, _>(network_txid)
            .bind::<VarChar, _>(&tx.chain_id)
            .bind::<VarChar, _>(&tx.txid)
            .execute(conn)?;
        diesel::sql_query("UPDATE payouts SET txid = ? WHERE transaction_id = ?")
            .bind::<VarChar, _>(network_txid)
            .bind::<BigInt, _>(tx.id)
            .execute(conn)?;
        diesel::sql_query("UPDATE exchange_deposits SET deposit_txid = ? WHERE transaction_id = ?")
            .bind::<VarChar, _>(network_txid)
            .bind::<BigInt, _>(tx.id)
            .execute(conn)?;
    }

    diesel::sql_query("UPDATE utxos SET spent = 1 WHERE transaction_id = ?")
        .bind::<BigInt, _>(tx.id)
        .execute(conn)?;
    diesel::sql_query("UPDATE utxos SET active = 1 WHERE chain_id = ? AND txid = ? AND spent = 0")
        .bind::<VarChar, _>(&tx.chain_id)
        .bind::<VarChar, _>(network_txid)
        .execute(conn)?;
    let affected = diesel::sql_query("UPDATE transactions SET spent = 1 WHERE id = ? AND spent = 0")
        .bind::<BigInt, _>(tx.id)
        .execute(conn)?;
    expect_rows(affected, 1, "transaction broadcast")
}

/// Records confirmation. A positive `fee_balance` (fee reserved but not
/// charged on account chains) becomes an active UTXO.
pub fn mark_confirmed(
    conn: &mut MysqlConnection,
    tx: &models::Transaction,
    height: Option<u64>,
    fee_balance: &Big,
) -> PoolResult<()> {
    let affected = diesel::sql_query(
        "UPDATE transactions SET confirmed = 1, height = ?, fee_balance = ? WHERE id = ? AND confirmed = 0",
    )
    .bind::<Nullable<Unsigned<BigInt>>, _>(height)
    .bind::<Numeric, _>(Amount::from(fee_balance))
    .bind::<BigInt, _>(tx.id)
    .execute(conn)?;
    expect_rows(affected, 1, "transaction confirmation")?;

    if fee_balance.is_positive() {
        let idx = tx.remainder_idx.map_or(1, |i| i + 1);
        insert_utxo(conn, &tx.chain_id, &tx.txid, idx, fee_balance, true, None)?;
    }

    diesel::sql_query(
        "UPDATE payouts SET pending = 0, confirmed = 1 WHERE transaction_id = ? AND confirmed = 0",
    )
    .bind::<BigInt, _>(tx.id)
    .execute(conn)?;
    Ok(())
}

impl AppDatabase {
    pub async fn get_unspent_transactions(&self, chain_id: String) -> PoolResult<Vec<models::Transaction>> {
        self.interact(move |conn| {
            Ok(diesel::sql_query(format!(
                "SELECT {} FROM transactions WHERE chain_id = ? AND spent = 0 AND failed = 0 ORDER BY id",
                TX_COLUMNS
            ))
            .bind::<VarChar, _>(chain_id)
            .load(conn)?)
        })
        .await
    }

    pub async fn get_unconfirmed_transactions(&self, chain_id: String) -> PoolResult<Vec<models::Transaction>> {
        self.interact(move |conn| {
            Ok(diesel::sql_query(format!(
                "SELECT {} FROM transactions WHERE chain_id = ? AND spent = 1 AND confirmed = 0 \
                 AND failed = 0 ORDER BY id",
                TX_COLUMNS
            ))
            .bind::<VarChar, _>(chain_id)
            .load(conn)?)
        })
        .await
    }

    /// Snapshot the planner works from: how many transactions are
    /// outstanding and what can be spent.
    pub async fn get_bank_state(&self, chain_id: String) -> PoolResult<(i64, Vec<models::Utxo>)> {
        self.transaction(move |conn| {
            let unspent = count_unspent_transactions(conn, &chain_id)?;
            let utxos = get_spendable_utxos(conn, &chain_id)?;
            Ok((unspent, utxos))
        })
        .await
    }
}
