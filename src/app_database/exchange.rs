use chrono::NaiveDateTime;
use diesel::sql_types::{BigInt, Bool, Double, Integer, Nullable, Numeric, VarChar};
use diesel::{MysqlConnection, QueryResult, RunQueryDsl};
use num_bigint::BigInt as Big;
use num_traits::Zero;
use tracing::info;

use super::balances::{add_balance_sum, get_batch_inputs, insert_balance_output, link_input_to_output, NewBalanceOutput};
use super::bank::insert_utxo;
use super::{expect_rows, last_insert_id, AppDatabase};
use crate::amount::{require, Amount};
use crate::error::{PoolError, PoolResult};
use crate::exchange::trades::{CreditShare, LegFill, PathSeed};
use crate::exchange::{BatchStatus, TradeLeg};
use crate::models;

const BATCH_COLUMNS: &str = "id, exchange_id, status, created_at, completed_at";

const INPUT_COLUMNS: &str = "id, batch_id, in_chain_id, out_chain_id, value";

const DEPOSIT_COLUMNS: &str = "id, batch_id, chain_id, transaction_id, deposit_txid, \
     exchange_deposit_id, value, fees, registered, confirmed, transferred";

const TRADE_COLUMNS: &str = "id, batch_id, path_id, stage_id, step_id, exchange_trade_id, \
     initial_chain_id, from_chain_id, to_chain_id, market, direction, value, proceeds, trade_fees, \
     cumulative_deposit_fees, cumulative_trade_fees, order_price, fill_price, cumulative_fill_price, \
     slippage, initiated, filled, open, transferred, created_at";

const WITHDRAWAL_COLUMNS: &str = "id, batch_id, chain_id, exchange_withdrawal_id, txid, value, \
     deposit_fees, trade_fees, withdrawal_fees, cumulative_fees, confirmed, spent";

/// Moves a batch forward only from the status it was read in.
pub fn advance_batch(
    conn: &mut MysqlConnection,
    batch_id: i64,
    from: BatchStatus,
    to: BatchStatus,
) -> PoolResult<()> {
    if to <= from {
        return Err(PoolError::invalid(format!(
            "batch {}: refusing to move from {} to {}",
            batch_id, from, to
        )));
    }
    let affected = if to == BatchStatus::Complete {
        diesel::sql_query(
            "UPDATE exchange_batches SET status = ?, completed_at = NOW() WHERE id = ? AND status = ?",
        )
        .bind::<Integer, _>(to.as_i32())
        .bind::<BigInt, _>(batch_id)
        .bind::<Integer, _>(from.as_i32())
        .execute(conn)?
    } else {
        diesel::sql_query("UPDATE exchange_batches SET status = ? WHERE id = ? AND status = ?")
            .bind::<Integer, _>(to.as_i32())
            .bind::<BigInt, _>(batch_id)
            .bind::<Integer, _>(from.as_i32())
            .execute(conn)?
    };
    if affected != 1 {
        return Err(PoolError::Duplicate(format!(
            "batch {} no longer at {}",
            batch_id, from
        )));
    }
    Ok(())
}

pub fn insert_deposit(
    conn: &mut MysqlConnection,
    batch_id: i64,
    chain_id: &str,
    transaction_id: i64,
    deposit_txid: &str,
    value: &Big,
) -> QueryResult<i64> {
    diesel::sql_query(
        "INSERT INTO exchange_deposits (batch_id, chain_id, transaction_id, deposit_txid, value, fees, \
         registered, confirmed, transferred) VALUES (?, ?, ?, ?, ?, 0, 0, 0, 0)",
    )
    .bind::<BigInt, _>(batch_id)
    .bind::<VarChar, _>(chain_id)
    .bind::<BigInt, _>(transaction_id)
    .bind::<VarChar, _>(deposit_txid)
    .bind::<Numeric, _>(Amount::from(value))
    .execute(conn)?;
    last_insert_id(conn)
}

/// One row per hop of a path, first hop carrying the path's value.
#[derive(Debug, Clone)]
pub struct NewPath {
    pub seed: PathSeed,
    pub legs: Vec<TradeLeg>,
}

pub struct TradeFillUpdate {
    pub trade_id: i64,
    pub fill: LegFill,
    /// Next hop on the same path, seeded with this hop's proceeds. A hop
    /// without one is final and still owes its transfer to the main account.
    pub next: Option<i64>,
}

/// A withdrawal written before the exchange is asked for it.
#[derive(Debug, Clone)]
pub struct NewWithdrawal {
    pub batch_id: i64,
    pub chain_id: String,
    pub value: Big,
    pub deposit_fees: Big,
    pub trade_fees: Big,
}

impl AppDatabase {
    pub async fn get_active_batches(&self) -> PoolResult<Vec<models::ExchangeBatch>> {
        self.interact(|conn| {
            Ok(diesel::sql_query(format!(
                "SELECT {} FROM exchange_batches WHERE status < ? ORDER BY id",
                BATCH_COLUMNS
            ))
            .bind::<Integer, _>(BatchStatus::Complete.as_i32())
            .load(conn)?)
        })
        .await
    }

    /// Mature cross-chain credits not yet in a batch, summed per route.
    pub async fn get_pending_input_sums(&self) -> PoolResult<Vec<models::PendingBalanceSum>> {
        self.interact(|conn| {
            Ok(diesel::sql_query(
                "SELECT chain_id, out_chain_id, SUM(value) AS value FROM balance_inputs \
                 WHERE pending = 1 AND mature = 1 AND batch_id IS NULL \
                 GROUP BY chain_id, out_chain_id ORDER BY chain_id, out_chain_id",
            )
            .load(conn)?)
        })
        .await
    }

    /// Opens a batch over the given routes and binds their pending credits
    /// to it. Each exchange input carries exactly what was bound.
    pub async fn create_batch(&self, exchange_id: String, routes: Vec<(String, String)>) -> PoolResult<i64> {
        self.transaction(move |conn| {
            let active: models::Count = diesel::sql_query(
                "SELECT COUNT(*) AS count FROM exchange_batches WHERE status < ? FOR UPDATE",
            )
            .bind::<Integer, _>(BatchStatus::Complete.as_i32())
            .get_result(conn)?;
            if active.count > 0 {
                return Err(PoolError::Duplicate("a batch is already active".into()));
            }

            diesel::sql_query("INSERT INTO exchange_batches (exchange_id, status) VALUES (?, ?)")
                .bind::<VarChar, _>(&exchange_id)
                .bind::<Integer, _>(BatchStatus::Inactive.as_i32())
                .execute(conn)?;
            let batch_id = last_insert_id(conn)?;

            for (in_chain, out_chain) in routes.iter() {
                diesel::sql_query(
                    "UPDATE balance_inputs SET batch_id = ? WHERE chain_id = ? AND out_chain_id = ? \
                     AND pending = 1 AND mature = 1 AND batch_id IS NULL",
                )
                .bind::<BigInt, _>(batch_id)
                .bind::<VarChar, _>(in_chain)
                .bind::<VarChar, _>(out_chain)
                .execute(conn)?;

                let sum: models::AmountSum = diesel::sql_query(
                    "SELECT SUM(value) AS value FROM balance_inputs WHERE batch_id = ? AND chain_id = ? \
                     AND out_chain_id = ?",
                )
                .bind::<BigInt, _>(batch_id)
                .bind::<VarChar, _>(in_chain)
                .bind::<VarChar, _>(out_chain)
                .get_result(conn)?;
                let value = sum.value.unwrap_or_default();
                if value.is_zero() {
                    continue;
                }

                diesel::sql_query(
                    "INSERT INTO exchange_inputs (batch_id, in_chain_id, out_chain_id, value) VALUES (?, ?, ?, ?)",
                )
                .bind::<BigInt, _>(batch_id)
                .bind::<VarChar, _>(in_chain)
                .bind::<VarChar, _>(out_chain)
                .bind::<Numeric, _>(value)
                .execute(conn)?;
            }
            Ok(batch_id)
        })
        .await
    }

    pub async fn get_exchange_inputs(&self, batch_id: i64) -> PoolResult<Vec<models::ExchangeInput>> {
        self.interact(move |conn| {
            Ok(diesel::sql_query(format!(
                "SELECT {} FROM exchange_inputs WHERE batch_id = ? ORDER BY in_chain_id, out_chain_id",
                INPUT_COLUMNS
            ))
            .bind::<BigInt, _>(batch_id)
            .load(conn)?)
        })
        .await
    }

    pub async fn advance_batch_status(&self, batch_id: i64, from: BatchStatus, to: BatchStatus) -> PoolResult<()> {
        self.transaction(move |conn| advance_batch(conn, batch_id, from, to))
            .await?;
        info!(target: "exchange_log", "batch {}: {} -> {}", batch_id, from, to);
        Ok(())
    }

    pub async fn get_deposits(&self, batch_id: i64) -> PoolResult<Vec<models::ExchangeDeposit>> {
        self.interact(move |conn| {
            Ok(diesel::sql_query(format!(
                "SELECT {} FROM exchange_deposits WHERE batch_id = ? ORDER BY id",
                DEPOSIT_COLUMNS
            ))
            .bind::<BigInt, _>(batch_id)
            .load(conn)?)
        })
        .await
    }

    pub async fn register_deposit(&self, deposit_id: i64, exchange_deposit_id: String) -> PoolResult<()> {
        self.interact(move |conn| {
            let affected = diesel::sql_query(
                "UPDATE exchange_deposits SET exchange_deposit_id = ?, registered = 1 \
                 WHERE id = ? AND registered = 0",
            )
            .bind::<VarChar, _>(exchange_deposit_id)
            .bind::<BigInt, _>(deposit_id)
            .execute(conn)?;
            expect_rows(affected, 1, "deposit registration")
        })
        .await
    }

    pub async fn confirm_deposit(&self, deposit_id: i64, fees: Big) -> PoolResult<()> {
        self.interact(move |conn| {
            let affected = diesel::sql_query(
                "UPDATE exchange_deposits SET fees = ?, confirmed = 1 WHERE id = ? AND confirmed = 0",
            )
            .bind::<Numeric, _>(Amount::from(fees))
            .bind::<BigInt, _>(deposit_id)
            .execute(conn)?;
            expect_rows(affected, 1, "deposit confirmation")
        })
        .await
    }

    pub async fn mark_deposit_transferred(&self, deposit_id: i64) -> PoolResult<()> {
        self.interact(move |conn| {
            let affected = diesel::sql_query(
                "UPDATE exchange_deposits SET transferred = 1 WHERE id = ? AND confirmed = 1 AND transferred = 0",
            )
            .bind::<BigInt, _>(deposit_id)
            .execute(conn)?;
            expect_rows(affected, 1, "deposit transfer")
        })
        .await
    }

    /// Writes every path's hops and moves the batch to `TRADES_INACTIVE`.
    pub async fn insert_trade_paths(&self, batch_id: i64, paths: Vec<NewPath>) -> PoolResult<()> {
        self.transaction(move |conn| {
            for (path_idx, path) in paths.iter().enumerate() {
                for (leg_idx, leg) in path.legs.iter().enumerate() {
                    let first = leg_idx == 0;
                    diesel::sql_query(
                        "INSERT INTO exchange_trades (batch_id, path_id, stage_id, step_id, initial_chain_id, \
                         from_chain_id, to_chain_id, market, direction, value, cumulative_deposit_fees, \
                         cumulative_trade_fees, order_price, initiated, filled, open, transferred) \
                         VALUES (?, ?, ?, 1, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, 0, 0)",
                    )
                    .bind::<BigInt, _>(batch_id)
                    .bind::<Integer, _>(path_idx as i32 + 1)
                    .bind::<Integer, _>(leg_idx as i32 + 1)
                    .bind::<VarChar, _>(&path.seed.in_chain_id)
                    .bind::<VarChar, _>(&leg.from_chain)
                    .bind::<VarChar, _>(&leg.to_chain)
                    .bind::<VarChar, _>(&leg.market)
                    .bind::<VarChar, _>(leg.direction.as_str())
                    .bind::<Nullable<Numeric>, _>(first.then(|| Amount::from(&path.seed.value)))
                    .bind::<Nullable<Numeric>, _>(first.then(|| Amount::from(&path.seed.deposit_fees)))
                    .bind::<Nullable<Numeric>, _>(first.then(Amount::zero))
                    .bind::<Double, _>(leg.price)
                    .execute(conn)?;
                }
            }
            advance_batch(conn, batch_id, BatchStatus::DepositsComplete, BatchStatus::TradesInactive)
        })
        .await
    }

    pub async fn get_trades(&self, batch_id: i64) -> PoolResult<Vec<models::ExchangeTrade>> {
        self.interact(move |conn| {
            Ok(diesel::sql_query(format!(
                "SELECT {} FROM exchange_trades WHERE batch_id = ? ORDER BY path_id, stage_id, step_id",
                TRADE_COLUMNS
            ))
            .bind::<BigInt, _>(batch_id)
            .load(conn)?)
        })
        .await
    }

    pub async fn mark_trade_initiated(&self, trade_id: i64, exchange_trade_id: String) -> PoolResult<()> {
        self.interact(move |conn| {
            let affected = diesel::sql_query(
                "UPDATE exchange_trades SET exchange_trade_id = ?, initiated = 1, open = 1 \
                 WHERE id = ? AND initiated = 0",
            )
            .bind::<VarChar, _>(exchange_trade_id)
            .bind::<BigInt, _>(trade_id)
            .execute(conn)?;
            expect_rows(affected, 1, "trade initiation")
        })
        .await
    }

    /// Records a filled hop and hands its proceeds, fees and price to the
    /// next hop of the path.
    pub async fn record_trade_fill(&self, update: TradeFillUpdate) -> PoolResult<()> {
        self.transaction(move |conn| {
            let fill = &update.fill;
            let affected = diesel::sql_query(
                "UPDATE exchange_trades SET proceeds = ?, trade_fees = ?, fill_price = ?, slippage = ?, \
                 cumulative_deposit_fees = ?, cumulative_trade_fees = ?, cumulative_fill_price = ?, \
                 open = 0, filled = 1, transferred = ? WHERE id = ? AND filled = 0",
            )
            .bind::<Numeric, _>(Amount::from(&fill.proceeds))
            .bind::<Numeric, _>(Amount::from(&fill.trade_fees))
            .bind::<Double, _>(fill.fill_price)
            .bind::<Nullable<Double>, _>(fill.slippage)
            .bind::<Numeric, _>(Amount::from(&fill.cumulative_deposit_fees))
            .bind::<Numeric, _>(Amount::from(&fill.cumulative_trade_fees))
            .bind::<Double, _>(fill.cumulative_fill_price)
            .bind::<Bool, _>(update.next.is_some())
            .bind::<BigInt, _>(update.trade_id)
            .execute(conn)?;
            expect_rows(affected, 1, "trade fill")?;

            if let Some(next_id) = update.next {
                let affected = diesel::sql_query(
                    "UPDATE exchange_trades SET value = ?, cumulative_deposit_fees = ?, \
                     cumulative_trade_fees = ?, cumulative_fill_price = ? WHERE id = ? AND initiated = 0",
                )
                .bind::<Numeric, _>(Amount::from(&fill.proceeds))
                .bind::<Numeric, _>(Amount::from(&fill.cumulative_deposit_fees))
                .bind::<Numeric, _>(Amount::from(&fill.cumulative_trade_fees))
                .bind::<Double, _>(fill.cumulative_fill_price)
                .bind::<BigInt, _>(next_id)
                .execute(conn)?;
                expect_rows(affected, 1, "next trade seed")?;
            }
            Ok(())
        })
        .await
    }

    pub async fn mark_trade_transferred(&self, trade_id: i64) -> PoolResult<()> {
        self.interact(move |conn| {
            let affected = diesel::sql_query(
                "UPDATE exchange_trades SET transferred = 1 WHERE id = ? AND filled = 1 AND transferred = 0",
            )
            .bind::<BigInt, _>(trade_id)
            .execute(conn)?;
            expect_rows(affected, 1, "trade transfer")
        })
        .await
    }

    pub async fn get_withdrawals(&self, batch_id: i64) -> PoolResult<Vec<models::ExchangeWithdrawal>> {
        self.interact(move |conn| {
            Ok(diesel::sql_query(format!(
                "SELECT {} FROM exchange_withdrawals WHERE batch_id = ? ORDER BY id",
                WITHDRAWAL_COLUMNS
            ))
            .bind::<BigInt, _>(batch_id)
            .load(conn)?)
        })
        .await
    }

    /// One row per `(batch, chain)`; the unique key turns a second insert
    /// into an error.
    pub async fn insert_withdrawal(&self, withdrawal: NewWithdrawal) -> PoolResult<i64> {
        self.interact(move |conn| {
            diesel::sql_query(
                "INSERT INTO exchange_withdrawals (batch_id, chain_id, value, deposit_fees, trade_fees, \
                 confirmed, spent) VALUES (?, ?, ?, ?, ?, 0, 0)",
            )
            .bind::<BigInt, _>(withdrawal.batch_id)
            .bind::<VarChar, _>(&withdrawal.chain_id)
            .bind::<Numeric, _>(Amount::from(&withdrawal.value))
            .bind::<Numeric, _>(Amount::from(&withdrawal.deposit_fees))
            .bind::<Numeric, _>(Amount::from(&withdrawal.trade_fees))
            .execute(conn)?;
            Ok(last_insert_id(conn)?)
        })
        .await
    }

    pub async fn set_withdrawal_exchange_id(&self, withdrawal_id: i64, exchange_withdrawal_id: String) -> PoolResult<()> {
        self.interact(move |conn| {
            let affected = diesel::sql_query(
                "UPDATE exchange_withdrawals SET exchange_withdrawal_id = ? \
                 WHERE id = ? AND exchange_withdrawal_id IS NULL",
            )
            .bind::<VarChar, _>(exchange_withdrawal_id)
            .bind::<BigInt, _>(withdrawal_id)
            .execute(conn)?;
            expect_rows(affected, 1, "withdrawal registration")
        })
        .await
    }

    pub async fn confirm_withdrawal(&self, withdrawal_id: i64, txid: String, withdrawal_fees: Big) -> PoolResult<()> {
        self.transaction(move |conn| {
            let row: models::ExchangeWithdrawal = diesel::sql_query(format!(
                "SELECT {} FROM exchange_withdrawals WHERE id = ? FOR UPDATE",
                WITHDRAWAL_COLUMNS
            ))
            .bind::<BigInt, _>(withdrawal_id)
            .get_result(conn)?;
            if row.confirmed {
                return Err(PoolError::Duplicate(format!("withdrawal {} already confirmed", row.id)));
            }
            let cumulative = row.deposit_fees.map(Amount::into_inner).unwrap_or_default()
                + row.trade_fees.map(Amount::into_inner).unwrap_or_default()
                + &withdrawal_fees;

            diesel::sql_query(
                "UPDATE exchange_withdrawals SET txid = ?, withdrawal_fees = ?, cumulative_fees = ?, \
                 confirmed = 1 WHERE id = ?",
            )
            .bind::<VarChar, _>(&txid)
            .bind::<Numeric, _>(Amount::from(&withdrawal_fees))
            .bind::<Numeric, _>(Amount::from(cumulative))
            .bind::<BigInt, _>(withdrawal_id)
            .execute(conn)?;
            Ok(())
        })
        .await
    }

    pub async fn get_batch_inputs_for_route(
        &self,
        batch_id: i64,
        in_chain_id: String,
        out_chain_id: String,
    ) -> PoolResult<Vec<models::BalanceInput>> {
        self.interact(move |conn| Ok(get_batch_inputs(conn, batch_id, &in_chain_id, &out_chain_id)?))
            .await
    }

    /// Settles one withdrawal: the coins it brought in become UTXOs, and
    /// every contributing credit gets its output in the withdrawn currency.
    pub async fn credit_withdrawal(
        &self,
        batch_id: i64,
        withdrawal_id: i64,
        chain_id: String,
        utxos: Vec<(String, u32, Big)>,
        shares: Vec<CreditShare>,
    ) -> PoolResult<()> {
        self.transaction(move |conn| {
            let affected = diesel::sql_query(
                "UPDATE exchange_withdrawals SET spent = 1 WHERE id = ? AND confirmed = 1 AND spent = 0",
            )
            .bind::<BigInt, _>(withdrawal_id)
            .execute(conn)?;
            if affected != 1 {
                return Err(PoolError::Duplicate(format!("withdrawal {} already credited", withdrawal_id)));
            }

            for (txid, idx, value) in utxos.iter() {
                insert_utxo(conn, &chain_id, txid, *idx, value, true, None)?;
            }

            for share in shares.iter() {
                let output_id = insert_balance_output(
                    conn,
                    &NewBalanceOutput {
                        chain_id: chain_id.clone(),
                        miner_id: share.miner_id,
                        value: share.value.clone(),
                        exchange_fees: share.exchange_fees.clone(),
                        mature: true,
                        in_batch_id: Some(batch_id),
                        ..Default::default()
                    },
                )?;
                link_input_to_output(conn, share.balance_input_id, output_id)?;
                add_balance_sum(conn, share.miner_id, &share.in_chain_id, &Big::zero(), &-&share.input_value)?;
                add_balance_sum(conn, share.miner_id, &chain_id, &Big::zero(), &share.value)?;
            }
            Ok(())
        })
        .await
    }

    pub async fn complete_batch(&self, batch_id: i64) -> PoolResult<()> {
        self.transaction(move |conn| {
            let open: models::Count = diesel::sql_query(
                "SELECT COUNT(*) AS count FROM exchange_withdrawals WHERE batch_id = ? AND spent = 0",
            )
            .bind::<BigInt, _>(batch_id)
            .get_result(conn)?;
            if open.count > 0 {
                return Err(PoolError::invalid(format!(
                    "batch {} has {} uncredited withdrawal(s)",
                    batch_id, open.count
                )));
            }
            advance_batch(conn, batch_id, BatchStatus::WithdrawalsComplete, BatchStatus::Complete)
        })
        .await?;
        info!(target: "exchange_log", "batch {}: complete", batch_id);
        Ok(())
    }
}

/// Trades open longer than `max_age` as of `now`.
pub fn stale_trades(trades: &[models::ExchangeTrade], now: NaiveDateTime, max_age: chrono::Duration) -> Vec<&models::ExchangeTrade> {
    trades
        .iter()
        .filter(|t| t.open && now - t.created_at > max_age)
        .collect()
}

pub fn require_trade_value(trade: &models::ExchangeTrade) -> PoolResult<&Big> {
    require(&trade.value, "trade value")
}
