use diesel::sql_types::{BigInt, Bool, Nullable, Numeric, VarChar};
use diesel::{MysqlConnection, QueryResult, RunQueryDsl};
use num_bigint::BigInt as Big;

use super::{expect_rows, id_list, last_insert_id};
use crate::amount::Amount;
use crate::error::PoolResult;
use crate::models;

const INPUT_COLUMNS: &str = "id, round_id, chain_id, miner_id, out_chain_id, value, pool_fees, \
     mature, pending, batch_id, balance_output_id";

const OUTPUT_COLUMNS: &str = "id, chain_id, miner_id, value, pool_fees, exchange_fees, tx_fees, \
     mature, spent, in_batch_id, in_deposit_id, in_payout_id, out_payout_id, out_merge_transaction_id";

#[derive(Debug, Clone, Default)]
pub struct NewBalanceOutput {
    pub chain_id: String,
    pub miner_id: i64,
    pub value: Big,
    pub pool_fees: Big,
    pub exchange_fees: Big,
    pub tx_fees: Big,
    pub mature: bool,
    pub spent: bool,
    pub in_batch_id: Option<i64>,
    pub out_merge_transaction_id: Option<i64>,
}

pub fn insert_balance_output(conn: &mut MysqlConnection, output: &NewBalanceOutput) -> QueryResult<i64> {
    diesel::sql_query(
        "INSERT INTO balance_outputs (chain_id, miner_id, value, pool_fees, exchange_fees, tx_fees, \
         mature, spent, in_batch_id, out_merge_transaction_id) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind::<VarChar, _>(&output.chain_id)
    .bind::<BigInt, _>(output.miner_id)
    .bind::<Numeric, _>(Amount::from(&output.value))
    .bind::<Numeric, _>(Amount::from(&output.pool_fees))
    .bind::<Numeric, _>(Amount::from(&output.exchange_fees))
    .bind::<Numeric, _>(Amount::from(&output.tx_fees))
    .bind::<Bool, _>(output.mature)
    .bind::<Bool, _>(output.spent)
    .bind::<Nullable<BigInt>, _>(output.in_batch_id)
    .bind::<Nullable<BigInt>, _>(output.out_merge_transaction_id)
    .execute(conn)?;
    last_insert_id(conn)
}

#[derive(Debug, Clone)]
pub struct NewBalanceInput {
    pub round_id: i64,
    pub chain_id: String,
    pub miner_id: i64,
    pub out_chain_id: String,
    pub value: Big,
    pub pool_fees: Big,
    pub mature: bool,
    pub pending: bool,
    pub balance_output_id: Option<i64>,
}

pub fn insert_balance_input(conn: &mut MysqlConnection, input: &NewBalanceInput) -> QueryResult<i64> {
    diesel::sql_query(
        "INSERT INTO balance_inputs (round_id, chain_id, miner_id, out_chain_id, value, pool_fees, \
         mature, pending, balance_output_id) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind::<BigInt, _>(input.round_id)
    .bind::<VarChar, _>(&input.chain_id)
    .bind::<BigInt, _>(input.miner_id)
    .bind::<VarChar, _>(&input.out_chain_id)
    .bind::<Numeric, _>(Amount::from(&input.value))
    .bind::<Numeric, _>(Amount::from(&input.pool_fees))
    .bind::<Bool, _>(input.mature)
    .bind::<Bool, _>(input.pending)
    .bind::<Nullable<BigInt>, _>(input.balance_output_id)
    .execute(conn)?;
    last_insert_id(conn)
}

pub fn link_input_to_output(conn: &mut MysqlConnection, input_id: i64, output_id: i64) -> PoolResult<()> {
    let affected = diesel::sql_query(
        "UPDATE balance_inputs SET balance_output_id = ? WHERE id = ? AND balance_output_id IS NULL",
    )
    .bind::<BigInt, _>(output_id)
    .bind::<BigInt, _>(input_id)
    .execute(conn)?;
    expect_rows(affected, 1, "balance input link")
}

/// Additive upsert on the running totals. Negative deltas subtract.
pub fn add_balance_sum(
    conn: &mut MysqlConnection,
    miner_id: i64,
    chain_id: &str,
    immature_delta: &Big,
    mature_delta: &Big,
) -> QueryResult<usize> {
    diesel::sql_query(
        "INSERT INTO balance_sums (miner_id, chain_id, immature_value, mature_value) VALUES (?, ?, ?, ?) \
         ON DUPLICATE KEY UPDATE immature_value = immature_value + VALUES(immature_value), \
         mature_value = mature_value + VALUES(mature_value)",
    )
    .bind::<BigInt, _>(miner_id)
    .bind::<VarChar, _>(chain_id)
    .bind::<Numeric, _>(Amount::from(immature_delta))
    .bind::<Numeric, _>(Amount::from(mature_delta))
    .execute(conn)
}

pub fn get_inputs_for_round(conn: &mut MysqlConnection, round_id: i64) -> QueryResult<Vec<models::BalanceInput>> {
    diesel::sql_query(format!(
        "SELECT {} FROM balance_inputs WHERE round_id = ? ORDER BY id",
        INPUT_COLUMNS
    ))
    .bind::<BigInt, _>(round_id)
    .load(conn)
}

/// Flips a round's credits to mature and moves their value from the
/// immature to the mature running total.
pub fn mature_round_balances(conn: &mut MysqlConnection, round_id: i64) -> PoolResult<()> {
    let inputs = get_inputs_for_round(conn, round_id)?;
    let immature: Vec<&models::BalanceInput> = inputs.iter().filter(|i| !i.mature).collect();
    if immature.is_empty() {
        return Ok(());
    }

    diesel::sql_query("UPDATE balance_inputs SET mature = 1 WHERE round_id = ?")
        .bind::<BigInt, _>(round_id)
        .execute(conn)?;

    let output_ids: Vec<i64> = immature.iter().filter_map(|i| i.balance_output_id).collect();
    if !output_ids.is_empty() {
        diesel::sql_query(format!(
            "UPDATE balance_outputs SET mature = 1 WHERE id IN ({})",
            id_list(&output_ids)
        ))
        .execute(conn)?;
    }

    for input in immature {
        let value = crate::amount::require(&input.value, "balance input value")?;
        add_balance_sum(conn, input.miner_id, &input.chain_id, &-value, value)?;
    }
    Ok(())
}

/// Mature, unspent, unbound outputs of one miner on one chain.
pub fn get_unpaid_outputs(
    conn: &mut MysqlConnection,
    chain_id: &str,
    miner_id: i64,
) -> QueryResult<Vec<models::BalanceOutput>> {
    diesel::sql_query(format!(
        "SELECT {} FROM balance_outputs WHERE chain_id = ? AND miner_id = ? AND mature = 1 \
         AND spent = 0 AND out_payout_id IS NULL ORDER BY id FOR UPDATE",
        OUTPUT_COLUMNS
    ))
    .bind::<VarChar, _>(chain_id)
    .bind::<BigInt, _>(miner_id)
    .load(conn)
}

/// A random mature unpaid output that can absorb `fee`.
pub fn get_random_output_covering(
    conn: &mut MysqlConnection,
    chain_id: &str,
    fee: &Big,
) -> QueryResult<Option<models::BalanceOutput>> {
    let mut rows: Vec<models::BalanceOutput> = diesel::sql_query(format!(
        "SELECT {} FROM balance_outputs WHERE chain_id = ? AND mature = 1 AND spent = 0 \
         AND out_payout_id IS NULL AND value >= ? ORDER BY RAND() LIMIT 1 FOR UPDATE",
        OUTPUT_COLUMNS
    ))
    .bind::<VarChar, _>(chain_id)
    .bind::<Numeric, _>(Amount::from(fee))
    .load(conn)?;
    Ok(rows.pop())
}

pub fn subtract_from_output(conn: &mut MysqlConnection, output_id: i64, fee: &Big) -> PoolResult<()> {
    let affected = diesel::sql_query(
        "UPDATE balance_outputs SET value = value - ?, tx_fees = tx_fees + ? \
         WHERE id = ? AND spent = 0 AND value >= ?",
    )
    .bind::<Numeric, _>(Amount::from(fee))
    .bind::<Numeric, _>(Amount::from(fee))
    .bind::<BigInt, _>(output_id)
    .bind::<Numeric, _>(Amount::from(fee))
    .execute(conn)?;
    expect_rows(affected, 1, "balance output fee charge")
}

pub fn get_batch_inputs(
    conn: &mut MysqlConnection,
    batch_id: i64,
    chain_id: &str,
    out_chain_id: &str,
) -> QueryResult<Vec<models::BalanceInput>> {
    diesel::sql_query(format!(
        "SELECT {} FROM balance_inputs WHERE batch_id = ? AND chain_id = ? AND out_chain_id = ? \
         ORDER BY id FOR UPDATE",
        INPUT_COLUMNS
    ))
    .bind::<BigInt, _>(batch_id)
    .bind::<VarChar, _>(chain_id)
    .bind::<VarChar, _>(out_chain_id)
    .load(conn)
}
