use chrono::NaiveDateTime;
use diesel::sql_types::{BigInt, Bool, Datetime, Double, Nullable, Numeric, Unsigned, VarChar};
use diesel::{MysqlConnection, QueryResult, RunQueryDsl};
use num_traits::Zero;
use tracing::info;

use super::balances::{
    add_balance_sum, insert_balance_input, insert_balance_output, link_input_to_output,
    mature_round_balances, NewBalanceInput, NewBalanceOutput,
};
use super::bank::insert_utxo;
use super::miners::{get_miners_by_ids, get_recipients};
use super::{expect_rows, last_insert_id, AppDatabase};
use crate::amount::require;
use crate::chains::{RoundUnlock, UnlockStatus};
use crate::credit::{CreditPlan, Recipient};
use crate::error::{PoolError, PoolResult};
use crate::models;

pub(crate) const ROUND_COLUMNS: &str = "id, chain_id, miner_id, solo, height, hash, nonce, value, \
     difficulty, accepted_shares, rejected_shares, invalid_shares, luck, pending, uncle, orphan, \
     mature, spent, coinbase_txid, epoch_height, uncle_height, created_at";

/// What the crediter needs to plan one round.
pub struct RoundCreditInputs {
    pub round: models::Round,
    pub shares: Vec<models::Share>,
    pub out_chains: std::collections::HashMap<i64, String>,
    pub recipients: Vec<Recipient>,
}

impl AppDatabase {
    /// Persists a solved round and its frozen share snapshot.
    pub async fn insert_round_with_shares(
        &self,
        round: models::InsertRound,
        shares: Vec<(i64, i64)>,
    ) -> PoolResult<i64> {
        self.transaction(move |conn| {
            diesel::sql_query(
                "INSERT INTO rounds (chain_id, miner_id, solo, height, hash, nonce, value, difficulty, \
                 accepted_shares, rejected_shares, invalid_shares, luck, pending, epoch_height, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
            )
            .bind::<VarChar, _>(&round.chain_id)
            .bind::<Nullable<BigInt>, _>(round.miner_id)
            .bind::<Bool, _>(round.solo)
            .bind::<Unsigned<BigInt>, _>(round.height)
            .bind::<VarChar, _>(&round.hash)
            .bind::<Nullable<VarChar>, _>(&round.nonce)
            .bind::<Nullable<Numeric>, _>(&round.value)
            .bind::<Double, _>(round.difficulty)
            .bind::<BigInt, _>(round.accepted_shares)
            .bind::<BigInt, _>(round.rejected_shares)
            .bind::<BigInt, _>(round.invalid_shares)
            .bind::<Double, _>(round.luck)
            .bind::<Nullable<Unsigned<BigInt>>, _>(round.epoch_height)
            .bind::<Datetime, _>(round.created_at)
            .execute(conn)?;
            let round_id = last_insert_id(conn)?;

            if !shares.is_empty() {
                let values = shares
                    .iter()
                    .map(|(miner_id, count)| format!("({}, {}, {})", round_id, miner_id, count))
                    .collect::<Vec<_>>()
                    .join(", ");
                diesel::sql_query(format!(
                    "INSERT INTO shares (round_id, miner_id, count) VALUES {}",
                    values
                ))
                .execute(conn)?;
            }
            Ok(round_id)
        })
        .await
    }

    pub async fn get_pending_rounds(&self, chain_id: String, below_height: u64) -> PoolResult<Vec<models::Round>> {
        self.interact(move |conn| {
            Ok(diesel::sql_query(format!(
                "SELECT {} FROM rounds WHERE chain_id = ? AND pending = 1 AND height < ? ORDER BY id",
                ROUND_COLUMNS
            ))
            .bind::<VarChar, _>(chain_id)
            .bind::<Unsigned<BigInt>, _>(below_height)
            .load(conn)?)
        })
        .await
    }

    pub async fn get_immature_rounds(&self, chain_id: String, below_height: u64) -> PoolResult<Vec<models::Round>> {
        self.interact(move |conn| {
            Ok(diesel::sql_query(format!(
                "SELECT {} FROM rounds WHERE chain_id = ? AND pending = 0 AND orphan = 0 AND mature = 0 \
                 AND height < ? ORDER BY id",
                ROUND_COLUMNS
            ))
            .bind::<VarChar, _>(chain_id)
            .bind::<Unsigned<BigInt>, _>(below_height)
            .load(conn)?)
        })
        .await
    }

    /// Applies node unlock results and matures rounds in one transaction,
    /// inserting the coinbase UTXO of every matured round.
    pub async fn unlock_rounds(
        &self,
        chain_id: String,
        unlocks: Vec<(i64, RoundUnlock)>,
        matured: Vec<models::Round>,
    ) -> PoolResult<(usize, usize)> {
        self.transaction(move |conn| {
            for (round_id, unlock) in unlocks.iter() {
                apply_unlock(conn, *round_id, unlock)?;
            }

            for round in matured.iter() {
                let affected = diesel::sql_query(
                    "UPDATE rounds SET mature = 1 WHERE id = ? AND mature = 0 AND pending = 0 AND orphan = 0",
                )
                .bind::<BigInt, _>(round.id)
                .execute(conn)?;
                expect_rows(affected, 1, "round maturity")?;

                let value = require(&round.value, "round value")?;
                let txid = round.coinbase_txid.clone().unwrap_or_else(|| round.hash.clone());
                insert_utxo(conn, &chain_id, &txid, 0, value, true, None)?;
                mature_round_balances(conn, round.id)?;
            }
            Ok((unlocks.len(), matured.len()))
        })
        .await
    }

    pub async fn get_creditable_rounds(&self, chain_id: String) -> PoolResult<Vec<models::Round>> {
        self.interact(move |conn| {
            Ok(diesel::sql_query(format!(
                "SELECT {} FROM rounds WHERE chain_id = ? AND pending = 0 AND orphan = 0 AND spent = 0 \
                 ORDER BY id",
                ROUND_COLUMNS
            ))
            .bind::<VarChar, _>(chain_id)
            .load(conn)?)
        })
        .await
    }

    pub async fn get_round_credit_inputs(&self, round: models::Round) -> PoolResult<RoundCreditInputs> {
        self.interact(move |conn| {
            let shares: Vec<models::Share> =
                diesel::sql_query("SELECT round_id, miner_id, count FROM shares WHERE round_id = ?")
                    .bind::<BigInt, _>(round.id)
                    .load(conn)?;
            let recipients = get_recipients(conn)?;

            let mut ids: Vec<i64> = shares.iter().map(|s| s.miner_id).collect();
            ids.extend(recipients.iter().map(|r| r.id));
            ids.sort_unstable();
            ids.dedup();
            let out_chains = get_miners_by_ids(conn, &ids)?
                .into_iter()
                .map(|m| (m.id, m.chain_id))
                .collect();

            Ok(RoundCreditInputs {
                round,
                shares,
                out_chains,
                recipients: recipients
                    .into_iter()
                    .filter_map(|m| {
                        m.recipient_fee_percent.map(|p| Recipient {
                            miner_id: m.id,
                            fee_percent: p,
                        })
                    })
                    .collect(),
            })
        })
        .await
    }

    /// Writes a credit plan: inputs, same-chain outputs, running totals and
    /// the round's spent flag, all or nothing.
    pub async fn credit_round(&self, plan: CreditPlan) -> PoolResult<()> {
        self.transaction(move |conn| {
            let round: models::Round = diesel::sql_query(format!(
                "SELECT {} FROM rounds WHERE id = ? FOR UPDATE",
                ROUND_COLUMNS
            ))
            .bind::<BigInt, _>(plan.round_id)
            .get_result(conn)?;
            if round.spent {
                return Err(PoolError::Duplicate(format!("round {} already credited", round.id)));
            }
            if round.mature != plan.mature {
                return Err(PoolError::invalid(format!("round {} changed maturity", round.id)));
            }

            let mut credited = num_bigint::BigInt::zero();
            for entry in plan.entries.iter() {
                let output_id = if entry.pending {
                    None
                } else {
                    Some(insert_balance_output(
                        conn,
                        &NewBalanceOutput {
                            chain_id: entry.out_chain_id.clone(),
                            miner_id: entry.miner_id,
                            value: entry.value.clone(),
                            pool_fees: entry.pool_fees.clone(),
                            mature: plan.mature,
                            ..Default::default()
                        },
                    )?)
                };

                let input_id = insert_balance_input(
                    conn,
                    &NewBalanceInput {
                        round_id: plan.round_id,
                        chain_id: plan.chain_id.clone(),
                        miner_id: entry.miner_id,
                        out_chain_id: entry.out_chain_id.clone(),
                        value: entry.value.clone(),
                        pool_fees: entry.pool_fees.clone(),
                        mature: plan.mature,
                        pending: entry.pending,
                        balance_output_id: None,
                    },
                )?;
                if let Some(output_id) = output_id {
                    link_input_to_output(conn, input_id, output_id)?;
                }

                let zero = num_bigint::BigInt::zero();
                let (immature, mature) = if plan.mature {
                    (&zero, &entry.value)
                } else {
                    (&entry.value, &zero)
                };
                add_balance_sum(conn, entry.miner_id, &plan.chain_id, immature, mature)?;
                credited += &entry.value;
            }

            let total = credited + &plan.retained_fees;
            if &total != require(&round.value, "round value")? {
                return Err(PoolError::invalid(format!(
                    "round {} credit mismatch at write",
                    round.id
                )));
            }

            let affected = diesel::sql_query("UPDATE rounds SET spent = 1 WHERE id = ? AND spent = 0")
                .bind::<BigInt, _>(plan.round_id)
                .execute(conn)?;
            expect_rows(affected, 1, "round spent")?;
            info!(target: "cron_log", "credited round {} to {} receivers", plan.round_id, plan.entries.len());
            Ok(())
        })
        .await
    }

    pub async fn get_rounds_between(
        &self,
        chain_id: String,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> PoolResult<Vec<models::Round>> {
        self.interact(move |conn| {
            Ok(diesel::sql_query(format!(
                "SELECT {} FROM rounds WHERE chain_id = ? AND created_at >= ? AND created_at < ? \
                 AND pending = 0",
                ROUND_COLUMNS
            ))
            .bind::<VarChar, _>(chain_id)
            .bind::<Datetime, _>(start)
            .bind::<Datetime, _>(end)
            .load(conn)?)
        })
        .await
    }

    pub async fn get_first_round_time(&self, chain_id: String) -> PoolResult<Option<NaiveDateTime>> {
        self.interact(move |conn| {
            let row: models::MaxTime =
                diesel::sql_query("SELECT MIN(created_at) AS value FROM rounds WHERE chain_id = ?")
                    .bind::<VarChar, _>(chain_id)
                    .get_result(conn)?;
            Ok(row.value)
        })
        .await
    }
}

fn apply_unlock(conn: &mut MysqlConnection, round_id: i64, unlock: &RoundUnlock) -> QueryResult<usize> {
    let (orphan, uncle, uncle_height) = match unlock.status {
        UnlockStatus::Orphan => (true, false, None),
        UnlockStatus::Uncle { uncle_height } => (false, true, Some(uncle_height)),
        UnlockStatus::Canonical => (false, false, None),
    };
    let created_at = unlock
        .created_at
        .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
        .map(|dt| dt.naive_utc());

    diesel::sql_query(
        "UPDATE rounds SET pending = 0, orphan = ?, uncle = ?, uncle_height = ?, \
         value = COALESCE(?, value), coinbase_txid = COALESCE(?, coinbase_txid), \
         hash = COALESCE(?, hash), height = COALESCE(?, height), created_at = COALESCE(?, created_at) \
         WHERE id = ? AND pending = 1",
    )
    .bind::<Bool, _>(orphan)
    .bind::<Bool, _>(uncle)
    .bind::<Nullable<Unsigned<BigInt>>, _>(uncle_height)
    .bind::<Nullable<Numeric>, _>(unlock.value.as_ref())
    .bind::<Nullable<VarChar>, _>(unlock.coinbase_txid.as_deref())
    .bind::<Nullable<VarChar>, _>(unlock.hash.as_deref())
    .bind::<Nullable<Unsigned<BigInt>>, _>(unlock.height)
    .bind::<Nullable<Datetime>, _>(created_at)
    .bind::<BigInt, _>(round_id)
    .execute(conn)
}
