//! Drives exchange batches one transition per tick.
//!
//! Every step reads the batch's rows, makes whatever exchange or node calls
//! it needs, and commits its result through the [`BatchStore`]. A step that
//! cannot finish leaves the batch where it was; the next tick picks it up
//! from the rows it already wrote. Calls that move funds go out only after
//! the row they belong to exists, under a client id derived from that row,
//! so a rerun looks the earlier attempt up before trying again.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use num_bigint::BigInt;
use num_traits::{Signed, Zero};
use tracing::{error, info, warn};

use super::trades::{apply_fill, plan_path_seeds, plan_withdrawal_credit, weighted_fill_price, PathResult, TradeDirection};
use super::store::{BatchStore, LedgerBatchStore};
use super::{client_id, BatchStatus, Exchange, TradeLeg};
use crate::amount::{decimal_to_units, require, split_proportionally, units_to_decimal, Amount};
use crate::app_database::exchange::{require_trade_value, stale_trades, NewPath, NewWithdrawal, TradeFillUpdate};
use crate::chains::{AccountingType, ChainRegistry, TxOutput};
use crate::context::PoolContext;
use crate::error::{PoolError, PoolResult};
use crate::models;
use crate::notifier::Notifier;

/// Open trades older than this are reported every tick. They are never
/// cancelled automatically.
pub const STALE_TRADE_ALERT_AFTER: chrono::Duration = chrono::Duration::hours(24);

const MAX_DEPOSIT_PARTS: usize = 10;
const MAX_PATH_LEGS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    InitiateDeposits,
    RegisterDeposits,
    ConfirmDeposits,
    InitiateTrades,
    InitiateTradeStage(i32),
    ConfirmTradeStage(i32),
    InitiateWithdrawals,
    ConfirmWithdrawals,
    CreditWithdrawals,
    Done,
}

/// The work that moves a batch out of `status`.
pub fn next_step(status: BatchStatus) -> Step {
    match status {
        BatchStatus::Inactive => Step::InitiateDeposits,
        BatchStatus::DepositsActive => Step::RegisterDeposits,
        BatchStatus::DepositsRegistered => Step::ConfirmDeposits,
        BatchStatus::DepositsComplete => Step::InitiateTrades,
        BatchStatus::TradesInactive => Step::InitiateTradeStage(1),
        BatchStatus::TradesActiveStageOne => Step::ConfirmTradeStage(1),
        BatchStatus::TradesCompleteStageOne => Step::InitiateTradeStage(2),
        BatchStatus::TradesActiveStageTwo => Step::ConfirmTradeStage(2),
        BatchStatus::TradesCompleteStageTwo => Step::InitiateWithdrawals,
        BatchStatus::WithdrawalsActive => Step::ConfirmWithdrawals,
        BatchStatus::WithdrawalsComplete => Step::CreditWithdrawals,
        BatchStatus::Complete => Step::Done,
    }
}

/// Status a batch reaches once `step` completes.
pub fn step_target(step: Step) -> PoolResult<BatchStatus> {
    Ok(match step {
        Step::InitiateDeposits => BatchStatus::DepositsActive,
        Step::RegisterDeposits => BatchStatus::DepositsRegistered,
        Step::ConfirmDeposits => BatchStatus::DepositsComplete,
        Step::InitiateTrades => BatchStatus::TradesInactive,
        Step::InitiateTradeStage(stage) => BatchStatus::stage_active(stage)?,
        Step::ConfirmTradeStage(stage) => BatchStatus::stage_complete(stage)?,
        Step::InitiateWithdrawals => BatchStatus::WithdrawalsActive,
        Step::ConfirmWithdrawals => BatchStatus::WithdrawalsComplete,
        Step::CreditWithdrawals | Step::Done => BatchStatus::Complete,
    })
}

/// Checks a route returned by the exchange router.
pub fn validate_path(legs: &[TradeLeg], from_chain: &str, to_chain: &str) -> PoolResult<()> {
    if legs.is_empty() || legs.len() > MAX_PATH_LEGS {
        return Err(PoolError::invalid(format!(
            "{} -> {}: route has {} legs",
            from_chain,
            to_chain,
            legs.len()
        )));
    }
    let mut current = from_chain;
    for leg in legs.iter() {
        if leg.from_chain != current {
            return Err(PoolError::invalid(format!(
                "{} -> {}: leg {} starts at {} not {}",
                from_chain, to_chain, leg.market, leg.from_chain, current
            )));
        }
        current = &leg.to_chain;
    }
    if current != to_chain {
        return Err(PoolError::invalid(format!(
            "{} -> {}: route ends at {}",
            from_chain, to_chain, current
        )));
    }
    Ok(())
}

/// Last hop of every path, keyed by path id.
pub fn final_legs(trades: &[models::ExchangeTrade]) -> BTreeMap<i32, &models::ExchangeTrade> {
    let mut finals: BTreeMap<i32, &models::ExchangeTrade> = BTreeMap::new();
    for trade in trades.iter() {
        match finals.get(&trade.path_id) {
            Some(current) if current.stage_id >= trade.stage_id => {}
            _ => {
                finals.insert(trade.path_id, trade);
            }
        }
    }
    finals
}

/// `total` cut into `parts` near-equal outputs to `address`.
pub fn deposit_groups(address: &str, total: &BigInt, parts: usize) -> PoolResult<Vec<Vec<TxOutput>>> {
    let weights: Vec<(usize, BigInt)> = (0..parts).map(|i| (i, BigInt::from(1))).collect();
    Ok(split_proportionally(total, &weights)?
        .into_iter()
        .filter(|(_, v)| v.is_positive())
        .map(|(_, v)| vec![TxOutput::splitting_fee(address, Amount(v))])
        .collect())
}

fn exchange_input_totals(inputs: &[models::ExchangeInput]) -> PoolResult<BTreeMap<String, BigInt>> {
    let mut totals: BTreeMap<String, BigInt> = BTreeMap::new();
    for input in inputs.iter() {
        *totals.entry(input.in_chain_id.clone()).or_insert_with(BigInt::zero) +=
            require(&input.value, "exchange input value")?;
    }
    Ok(totals)
}

pub struct Batcher {
    store: Arc<dyn BatchStore>,
    exchange: Arc<dyn Exchange>,
    chains: Arc<ChainRegistry>,
    notifier: Notifier,
}

impl Batcher {
    pub fn new(ctx: Arc<PoolContext>, exchange: Arc<dyn Exchange>) -> Self {
        Batcher {
            store: Arc::new(LedgerBatchStore::new(ctx.clone())),
            exchange,
            chains: ctx.chains.clone(),
            notifier: ctx.notifier.clone(),
        }
    }

    pub fn with_store(
        store: Arc<dyn BatchStore>,
        exchange: Arc<dyn Exchange>,
        chains: Arc<ChainRegistry>,
        notifier: Notifier,
    ) -> Self {
        Batcher {
            store,
            exchange,
            chains,
            notifier,
        }
    }

    /// One tick: open a batch when none is active, otherwise try to move
    /// every active batch forward by one status.
    pub async fn run(&self) -> PoolResult<()> {
        let active = self.store.active_batches().await?;
        if active.is_empty() {
            if let Some(batch_id) = self.check_for_new_batch().await? {
                self.notifier.info(format!("exchange batch {} opened", batch_id));
            }
            return Ok(());
        }

        for batch in active {
            let status = BatchStatus::from_i32(batch.status)?;
            match self.advance(&batch, status).await {
                Ok(Some(next)) => {
                    info!(target: "exchange_log", "batch {}: {} -> {}", batch.id, status, next);
                    self.notifier.info(format!("exchange batch {}: {}", batch.id, next));
                }
                Ok(None) => {}
                Err(e) if e.is_duplicate() => {
                    info!(target: "exchange_log", "batch {}: {:?}", batch.id, e);
                }
                Err(e) => {
                    error!(target: "exchange_log", "batch {} at {}: {:?}", batch.id, status, e);
                    if e.is_business_rule() {
                        self.notifier
                            .alert(format!("exchange batch {} at {}: {}", batch.id, status, e));
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn check_for_new_batch(&self) -> PoolResult<Option<i64>> {
        let sums = self.store.pending_input_sums().await?;
        let mut per_chain: BTreeMap<String, BigInt> = BTreeMap::new();
        for sum in sums.iter() {
            *per_chain.entry(sum.chain_id.clone()).or_insert_with(BigInt::zero) +=
                sum.value.as_ref().map(|v| v.0.clone()).unwrap_or_default();
        }

        let mut ready = Vec::new();
        for (chain_id, total) in per_chain.iter() {
            let chain = self.chains.get(chain_id)?;
            let threshold = &chain.config.exchange_threshold.0;
            if total.is_positive() && total >= threshold {
                ready.push(chain_id.clone());
            } else {
                info!(target: "exchange_log", "{}: {} pending below threshold {}", chain_id, total, threshold);
            }
        }
        if ready.is_empty() {
            return Ok(None);
        }

        let routes: Vec<(String, String)> = sums
            .into_iter()
            .filter(|s| ready.contains(&s.chain_id))
            .map(|s| (s.chain_id, s.out_chain_id))
            .collect();
        let batch_id = self
            .store
            .create_batch(self.exchange.id().to_string(), routes.clone())
            .await?;
        info!(target: "exchange_log", "batch {}: opened over {:?}", batch_id, routes);
        Ok(Some(batch_id))
    }

    /// Runs the step for `status`. Returns the new status when the batch
    /// moved.
    async fn advance(&self, batch: &models::ExchangeBatch, status: BatchStatus) -> PoolResult<Option<BatchStatus>> {
        let step = next_step(status);
        let done = match step {
            Step::InitiateDeposits => self.initiate_deposits(batch.id).await?,
            Step::RegisterDeposits => self.register_deposits(batch.id).await?,
            Step::ConfirmDeposits => self.confirm_deposits(batch.id).await?,
            Step::InitiateTrades => {
                // writes its rows and the status change together
                self.initiate_trades(batch.id).await?;
                return Ok(Some(BatchStatus::TradesInactive));
            }
            Step::InitiateTradeStage(stage) => match self.initiate_trade_stage(batch.id, stage).await? {
                StageStart::Started => true,
                StageStart::Empty => {
                    self.store
                        .advance_status(batch.id, status, BatchStatus::TradesCompleteStageTwo)
                        .await?;
                    return Ok(Some(BatchStatus::TradesCompleteStageTwo));
                }
            },
            Step::ConfirmTradeStage(stage) => self.confirm_trade_stage(batch.id, stage).await?,
            Step::InitiateWithdrawals => self.initiate_withdrawals(batch.id).await?,
            Step::ConfirmWithdrawals => self.confirm_withdrawals(batch.id).await?,
            Step::CreditWithdrawals => {
                if self.credit_withdrawals(batch.id).await? {
                    self.store.complete_batch(batch.id).await?;
                    return Ok(Some(BatchStatus::Complete));
                }
                false
            }
            Step::Done => false,
        };

        if !done {
            return Ok(None);
        }
        let target = step_target(step)?;
        self.store.advance_status(batch.id, status, target).await?;
        Ok(Some(target))
    }

    async fn initiate_deposits(&self, batch_id: i64) -> PoolResult<bool> {
        let inputs = self.store.exchange_inputs(batch_id).await?;
        let totals = exchange_input_totals(&inputs)?;
        let deposits = self.store.deposits(batch_id).await?;

        let mut complete = true;
        for (chain_id, total) in totals.iter() {
            if deposits.iter().any(|d| &d.chain_id == chain_id) {
                continue;
            }
            if !self.initiate_chain_deposit(batch_id, chain_id, total).await? {
                complete = false;
            }
        }
        Ok(complete)
    }

    async fn initiate_chain_deposit(&self, batch_id: i64, chain_id: &str, total: &BigInt) -> PoolResult<bool> {
        let chain = self.chains.get(chain_id)?.clone();
        let wallet = self.exchange.get_wallet_status(chain_id).await?;
        if !wallet.deposits_enabled {
            warn!(target: "exchange_log", "batch {}: {} deposits disabled on exchange", batch_id, chain_id);
            return Ok(false);
        }
        let address = self.exchange.get_deposit_address(chain_id).await?;

        let lease = match self.store.obtain_bank_lease(chain_id).await? {
            Some(lease) => lease,
            None => return Ok(false),
        };

        let mut result = Ok(false);
        for parts in 1..=MAX_DEPOSIT_PARTS {
            let groups = match deposit_groups(&address, total, parts) {
                Ok(groups) => groups,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            };
            match self.store.prepare_deposits(batch_id, &chain, groups).await {
                Ok(Some(count)) => {
                    info!(
                        target: "exchange_log",
                        "batch {}: prepared {} deposit(s) of {} {} to {}",
                        batch_id,
                        count,
                        total,
                        chain_id,
                        address
                    );
                    result = Ok(true);
                    break;
                }
                Ok(None) => {
                    info!(target: "exchange_log", "batch {}: {} has an outstanding tx", batch_id, chain_id);
                    break;
                }
                Err(PoolError::TxTooBig) if parts < MAX_DEPOSIT_PARTS => {
                    warn!(target: "exchange_log", "batch {}: {} deposit too big in {} part(s)", batch_id, chain_id, parts);
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        self.store.release_bank_lease(lease).await;
        result
    }

    async fn register_deposits(&self, batch_id: i64) -> PoolResult<bool> {
        let deposits = self.store.deposits(batch_id).await?;
        let mut complete = true;
        for deposit in deposits.iter().filter(|d| !d.registered) {
            let txid = match &deposit.deposit_txid {
                Some(txid) => txid,
                None => {
                    complete = false;
                    continue;
                }
            };
            match self.exchange.get_deposit_by_txid(&deposit.chain_id, txid).await? {
                Some(found) => {
                    self.store.register_deposit(deposit.id, found.id.clone()).await?;
                    info!(target: "exchange_log", "batch {}: deposit {} registered as {}", batch_id, txid, found.id);
                }
                None => complete = false,
            }
        }
        Ok(complete)
    }

    /// Records what the exchange credited for each deposit, then moves the
    /// credited value to the trade account. The confirmation is written
    /// before the transfer is made.
    async fn confirm_deposits(&self, batch_id: i64) -> PoolResult<bool> {
        let deposits = self.store.deposits(batch_id).await?;
        let mut complete = true;
        for deposit in deposits.iter().filter(|d| !d.confirmed) {
            let exchange_id = deposit
                .exchange_deposit_id
                .as_ref()
                .ok_or_else(|| PoolError::invalid(format!("deposit {} has no exchange id", deposit.id)))?;
            let info = match self.exchange.get_deposit_by_id(&deposit.chain_id, exchange_id).await? {
                Some(info) if info.completed => info,
                _ => {
                    complete = false;
                    continue;
                }
            };

            let units = self.chains.units(&deposit.chain_id)?;
            let sent = require(&deposit.value, "deposit value")?;
            let credited = decimal_to_units(&info.value, units);
            let fees = sent - &credited;
            if fees.is_negative() {
                warn!(target: "exchange_log", "batch {}: deposit {} credited {} over {}", batch_id, deposit.id, credited, sent);
            }
            self.store.confirm_deposit(deposit.id, fees.clone()).await?;
            info!(
                target: "exchange_log",
                "batch {}: deposit {} confirmed, credited {} fees {}",
                batch_id,
                deposit.id,
                credited,
                fees
            );
        }

        let deposits = self.store.deposits(batch_id).await?;
        for deposit in deposits.iter().filter(|d| d.confirmed && !d.transferred) {
            self.transfer_deposit(batch_id, deposit).await?;
        }
        Ok(complete)
    }

    async fn transfer_deposit(&self, batch_id: i64, deposit: &models::ExchangeDeposit) -> PoolResult<()> {
        let client_id = client_id::deposit_transfer(self.exchange.id(), deposit.id);
        if self.exchange.find_transfer(&deposit.chain_id, &client_id).await? {
            info!(target: "exchange_log", "batch {}: transfer {} already made", batch_id, client_id);
        } else {
            let sent = require(&deposit.value, "deposit value")?;
            let fees = deposit.fees.as_ref().map(|f| f.0.clone()).unwrap_or_default();
            let units = self.chains.units(&deposit.chain_id)?;
            let amount = units_to_decimal(&(sent - fees), units);
            self.exchange
                .transfer_to_trade_account(&deposit.chain_id, &amount, &client_id)
                .await?;
            info!(
                target: "exchange_log",
                "batch {}: moved {} {} to the trade account as {}",
                batch_id,
                amount,
                deposit.chain_id,
                client_id
            );
        }
        self.store.mark_deposit_transferred(deposit.id).await
    }

    async fn initiate_trades(&self, batch_id: i64) -> PoolResult<()> {
        let inputs = self.store.exchange_inputs(batch_id).await?;
        let deposits = self.store.deposits(batch_id).await?;

        let mut credited: BTreeMap<String, BigInt> = BTreeMap::new();
        for deposit in deposits.iter() {
            let value = require(&deposit.value, "deposit value")?;
            let fees = deposit.fees.as_ref().map(|f| f.0.clone()).unwrap_or_default();
            *credited.entry(deposit.chain_id.clone()).or_insert_with(BigInt::zero) += value - fees;
        }

        let mut by_chain: BTreeMap<String, Vec<models::ExchangeInput>> = BTreeMap::new();
        for input in inputs {
            by_chain.entry(input.in_chain_id.clone()).or_default().push(input);
        }

        let mut paths = Vec::new();
        for (chain_id, chain_inputs) in by_chain.iter() {
            let net = credited
                .get(chain_id)
                .ok_or_else(|| PoolError::invalid(format!("batch {}: no deposit for {}", batch_id, chain_id)))?;
            for seed in plan_path_seeds(chain_inputs, net)? {
                let legs = self
                    .exchange
                    .generate_trade_path(&seed.in_chain_id, &seed.out_chain_id)
                    .await?;
                validate_path(&legs, &seed.in_chain_id, &seed.out_chain_id)?;
                paths.push(NewPath { seed, legs });
            }
        }

        self.store.insert_trade_paths(batch_id, paths).await
    }

    async fn initiate_trade_stage(&self, batch_id: i64, stage: i32) -> PoolResult<StageStart> {
        let trades = self.store.trades(batch_id).await?;
        let staged: Vec<&models::ExchangeTrade> = trades.iter().filter(|t| t.stage_id == stage).collect();
        if staged.is_empty() {
            if stage == 1 {
                return Err(PoolError::invalid(format!("batch {} has no trades", batch_id)));
            }
            return Ok(StageStart::Empty);
        }

        for trade in staged.iter().filter(|t| !t.initiated) {
            let client_id = client_id::trade(self.exchange.id(), trade.id);
            let direction: TradeDirection = trade.direction.parse()?;
            let exchange_trade_id = match self.exchange.find_trade(&trade.market, &client_id).await? {
                Some(found) => {
                    info!(target: "exchange_log", "batch {}: order {} already placed as {}", batch_id, client_id, found);
                    found
                }
                None => {
                    let value = require_trade_value(trade)?;
                    let units = self.chains.units(&trade.from_chain_id)?;
                    let quantity = units_to_decimal(value, units);
                    let placed = self
                        .exchange
                        .create_trade(&trade.market, direction, &quantity, &client_id)
                        .await?;
                    info!(
                        target: "exchange_log",
                        "batch {}: {} {} {} on {} as {}",
                        batch_id,
                        direction,
                        quantity,
                        trade.from_chain_id,
                        trade.market,
                        placed
                    );
                    placed
                }
            };
            self.store.mark_trade_initiated(trade.id, exchange_trade_id).await?;
        }
        Ok(StageStart::Started)
    }

    /// Records fills for the stage, then moves the proceeds of every filled
    /// final hop back to the main account.
    async fn confirm_trade_stage(&self, batch_id: i64, stage: i32) -> PoolResult<bool> {
        let trades = self.store.trades(batch_id).await?;

        for trade in stale_trades(&trades, Utc::now().naive_utc(), STALE_TRADE_ALERT_AFTER) {
            error!(
                target: "exchange_log",
                "batch {}: trade {} on {} open since {}",
                batch_id,
                trade.id,
                trade.market,
                trade.created_at
            );
            self.notifier.alert(format!(
                "exchange batch {}: trade {} on {} open since {}",
                batch_id, trade.id, trade.market, trade.created_at
            ));
        }

        let mut complete = true;
        for trade in trades.iter().filter(|t| t.stage_id == stage && !t.filled) {
            let exchange_trade_id = match &trade.exchange_trade_id {
                Some(id) if trade.open => id,
                _ => {
                    complete = false;
                    continue;
                }
            };
            let info = match self.exchange.get_trade(&trade.market, exchange_trade_id).await? {
                Some(info) if info.completed => info,
                _ => {
                    complete = false;
                    continue;
                }
            };

            let from_units = self.chains.units(&trade.from_chain_id)?;
            let to_units = self.chains.units(&trade.to_chain_id)?;
            let fill = apply_fill(trade, &info, from_units, to_units)?;
            let next = trades
                .iter()
                .find(|t| t.path_id == trade.path_id && t.stage_id == stage + 1)
                .map(|t| t.id);

            info!(
                target: "exchange_log",
                "batch {}: trade {} filled at {} for {} {} (slippage {:?})",
                batch_id,
                trade.id,
                fill.fill_price,
                fill.proceeds,
                trade.to_chain_id,
                fill.slippage
            );
            self.store
                .record_trade_fill(TradeFillUpdate {
                    trade_id: trade.id,
                    fill,
                    next,
                })
                .await?;
        }

        let trades = self.store.trades(batch_id).await?;
        for trade in trades
            .iter()
            .filter(|t| t.stage_id == stage && t.filled && !t.transferred)
        {
            self.transfer_proceeds(batch_id, trade).await?;
        }
        Ok(complete)
    }

    async fn transfer_proceeds(&self, batch_id: i64, trade: &models::ExchangeTrade) -> PoolResult<()> {
        let client_id = client_id::trade_transfer(self.exchange.id(), trade.id);
        if self.exchange.find_transfer(&trade.to_chain_id, &client_id).await? {
            info!(target: "exchange_log", "batch {}: transfer {} already made", batch_id, client_id);
        } else {
            let proceeds = require(&trade.proceeds, "trade proceeds")?;
            let units = self.chains.units(&trade.to_chain_id)?;
            let amount = units_to_decimal(proceeds, units);
            self.exchange
                .transfer_to_main_account(&trade.to_chain_id, &amount, &client_id)
                .await?;
            info!(
                target: "exchange_log",
                "batch {}: moved {} {} to the main account as {}",
                batch_id,
                amount,
                trade.to_chain_id,
                client_id
            );
        }
        self.store.mark_trade_transferred(trade.id).await
    }

    /// Writes one withdrawal row per target chain, then asks the exchange
    /// for each row it has not accepted yet.
    async fn initiate_withdrawals(&self, batch_id: i64) -> PoolResult<bool> {
        let trades = self.store.trades(batch_id).await?;
        let existing = self.store.withdrawals(batch_id).await?;

        let mut per_chain: BTreeMap<String, (BigInt, BigInt, BigInt)> = BTreeMap::new();
        for trade in final_legs(&trades).values() {
            let path = PathResult::from_final_leg(trade)?;
            let entry = per_chain
                .entry(trade.to_chain_id.clone())
                .or_insert_with(|| (BigInt::zero(), BigInt::zero(), BigInt::zero()));
            entry.0 += path.proceeds;
            entry.1 += path.deposit_fees;
            entry.2 += path.trade_fees;
        }

        for (chain_id, (value, deposit_fees, trade_fees)) in per_chain {
            if existing.iter().any(|w| w.chain_id == chain_id) {
                continue;
            }
            self.store
                .insert_withdrawal(NewWithdrawal {
                    batch_id,
                    chain_id,
                    value,
                    deposit_fees,
                    trade_fees,
                })
                .await?;
        }

        let withdrawals = self.store.withdrawals(batch_id).await?;
        let mut complete = true;
        for withdrawal in withdrawals.iter().filter(|w| w.exchange_withdrawal_id.is_none()) {
            if !self.request_withdrawal(batch_id, withdrawal).await? {
                complete = false;
            }
        }
        Ok(complete)
    }

    async fn request_withdrawal(&self, batch_id: i64, withdrawal: &models::ExchangeWithdrawal) -> PoolResult<bool> {
        let chain_id = &withdrawal.chain_id;
        let client_id = client_id::withdrawal(self.exchange.id(), withdrawal.id);
        let exchange_withdrawal_id = match self.exchange.find_withdrawal(chain_id, &client_id).await? {
            Some(found) => {
                info!(target: "exchange_log", "batch {}: withdrawal {} already requested as {}", batch_id, client_id, found);
                found
            }
            None => {
                let wallet = self.exchange.get_wallet_status(chain_id).await?;
                if !wallet.withdrawals_enabled {
                    warn!(target: "exchange_log", "batch {}: {} withdrawals disabled on exchange", batch_id, chain_id);
                    return Ok(false);
                }
                let chain = self.chains.get(chain_id)?;
                let address = chain.payout_node()?.address().to_string();
                let value = require(&withdrawal.value, "withdrawal value")?;
                let amount = units_to_decimal(value, chain.config.units);
                let requested = self
                    .exchange
                    .create_withdrawal(chain_id, &address, &amount, &client_id)
                    .await?;
                info!(
                    target: "exchange_log",
                    "batch {}: withdrawing {} {} to {} as {}",
                    batch_id,
                    amount,
                    chain_id,
                    address,
                    requested
                );
                requested
            }
        };
        self.store
            .set_withdrawal_exchange_id(withdrawal.id, exchange_withdrawal_id)
            .await?;
        Ok(true)
    }

    async fn confirm_withdrawals(&self, batch_id: i64) -> PoolResult<bool> {
        let withdrawals = self.store.withdrawals(batch_id).await?;
        let mut complete = true;
        for withdrawal in withdrawals.iter().filter(|w| !w.confirmed) {
            let exchange_withdrawal_id = match &withdrawal.exchange_withdrawal_id {
                Some(id) => id,
                None => {
                    complete = false;
                    continue;
                }
            };
            let info = match self
                .exchange
                .get_withdrawal(&withdrawal.chain_id, exchange_withdrawal_id)
                .await?
            {
                Some(info) if info.completed => info,
                _ => {
                    complete = false;
                    continue;
                }
            };
            let txid = match info.txid {
                Some(txid) => txid,
                None => {
                    complete = false;
                    continue;
                }
            };
            let units = self.chains.units(&withdrawal.chain_id)?;
            let fees = decimal_to_units(&info.fees, units);
            self.store
                .confirm_withdrawal(withdrawal.id, txid.clone(), fees.clone())
                .await?;
            info!(
                target: "exchange_log",
                "batch {}: withdrawal {} confirmed in {} (fees {})",
                batch_id,
                withdrawal.id,
                txid,
                fees
            );
        }
        Ok(complete)
    }

    /// Returns true once every withdrawal of the batch is credited.
    async fn credit_withdrawals(&self, batch_id: i64) -> PoolResult<bool> {
        let withdrawals = self.store.withdrawals(batch_id).await?;
        let trades = self.store.trades(batch_id).await?;
        let finals = final_legs(&trades);

        let mut complete = true;
        for withdrawal in withdrawals.iter().filter(|w| !w.spent) {
            if !self.credit_withdrawal(batch_id, withdrawal, &finals).await? {
                complete = false;
            }
        }
        Ok(complete)
    }

    /// Credits nothing until the withdrawal tx is confirmed on the pool's
    /// own node.
    async fn credit_withdrawal(
        &self,
        batch_id: i64,
        withdrawal: &models::ExchangeWithdrawal,
        finals: &BTreeMap<i32, &models::ExchangeTrade>,
    ) -> PoolResult<bool> {
        let chain = self.chains.get(&withdrawal.chain_id)?;
        let node = chain.payout_node()?;
        let txid = withdrawal
            .txid
            .clone()
            .ok_or_else(|| PoolError::invalid(format!("withdrawal {} has no txid", withdrawal.id)))?;
        let value = require(&withdrawal.value, "withdrawal value")?;
        let fees = withdrawal
            .withdrawal_fees
            .as_ref()
            .map(|f| f.0.clone())
            .unwrap_or_default();
        let net = value - &fees;

        let info = match node.get_tx(&txid).await? {
            Some(info) if info.confirmed => info,
            _ => {
                info!(target: "exchange_log", "batch {}: withdrawal {} tx {} not confirmed yet", batch_id, withdrawal.id, txid);
                return Ok(false);
            }
        };
        let utxos = match node.accounting_type() {
            AccountingType::Account => vec![(txid.clone(), 0, net.clone())],
            AccountingType::Utxo => {
                let outputs: Vec<(String, u32, BigInt)> = info
                    .outputs
                    .iter()
                    .filter(|o| o.address == node.address())
                    .map(|o| (txid.clone(), o.index, o.value.0.clone()))
                    .collect();
                if outputs.is_empty() {
                    return Err(PoolError::invalid(format!(
                        "withdrawal {} tx {} pays nothing to {}",
                        withdrawal.id,
                        txid,
                        node.address()
                    )));
                }
                outputs
            }
        };

        let paths: Vec<PathResult> = finals
            .values()
            .filter(|t| t.to_chain_id == withdrawal.chain_id)
            .map(|t| PathResult::from_final_leg(t))
            .collect::<PoolResult<_>>()?;
        let mut inputs = BTreeMap::new();
        for path in paths.iter() {
            let rows = self
                .store
                .batch_inputs_for_route(batch_id, path.in_chain_id.clone(), withdrawal.chain_id.clone())
                .await?;
            inputs.insert(path.in_chain_id.clone(), rows);
        }

        let shares = plan_withdrawal_credit(value, &fees, &paths, &inputs)?;
        info!(
            target: "exchange_log",
            "batch {}: crediting {} {} to {} input(s), weighted price {}",
            batch_id,
            net,
            withdrawal.chain_id,
            shares.len(),
            weighted_fill_price(&paths)
        );
        self.store
            .credit_withdrawal(batch_id, withdrawal.id, withdrawal.chain_id.clone(), utxos, shares)
            .await?;
        Ok(true)
    }
}

enum StageStart {
    Started,
    /// Stage has no trades: every path finished in the previous stage.
    Empty,
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bigdecimal::BigDecimal;
    use chrono::NaiveDateTime;

    use super::*;
    use crate::chains::testing::{fake_chain, FakeNode};
    use crate::chains::{TxInfo, TxInfoOutput};
    use crate::exchange::store::testing::MemoryBatchStore;
    use crate::exchange::trades::PathSeed;
    use crate::exchange::{DepositInfo, TradeInfo, WalletStatus, WithdrawalInfo};

    const DEPOSIT_CREDIT: i64 = 27;

    /// Credits every deposit with [`DEPOSIT_CREDIT`], routes through one
    /// sell leg at 2 and fills at the quote minus a flat fee of 1. Orders,
    /// transfers and withdrawals are kept with their client ids.
    #[derive(Default)]
    struct FakeExchange {
        /// `(chain, amount, client_id)` in both directions.
        transfers: Mutex<Vec<(String, BigDecimal, String)>>,
        /// `(market, quantity, client_id)`; the exchange id is `trade-{n}`.
        trades: Mutex<Vec<(String, BigDecimal, String)>>,
        /// `(chain, address, amount, client_id)`; the exchange id is `wd-{n}`.
        withdrawals: Mutex<Vec<(String, String, BigDecimal, String)>>,
    }

    fn position(id: &str, prefix: &str) -> Option<usize> {
        id.strip_prefix(prefix)?.parse::<usize>().ok()?.checked_sub(1)
    }

    #[async_trait]
    impl Exchange for FakeExchange {
        fn id(&self) -> &str {
            "fake"
        }

        async fn get_deposit_address(&self, chain: &str) -> PoolResult<String> {
            Ok(format!("{}-deposit", chain))
        }

        async fn get_wallet_status(&self, _chain: &str) -> PoolResult<WalletStatus> {
            Ok(WalletStatus {
                deposits_enabled: true,
                withdrawals_enabled: true,
            })
        }

        async fn get_deposit_by_txid(&self, _chain: &str, txid: &str) -> PoolResult<Option<DepositInfo>> {
            Ok(Some(DepositInfo {
                id: format!("dep-{}", txid),
                completed: true,
                value: BigDecimal::from(DEPOSIT_CREDIT),
            }))
        }

        async fn get_deposit_by_id(&self, _chain: &str, id: &str) -> PoolResult<Option<DepositInfo>> {
            Ok(Some(DepositInfo {
                id: id.to_string(),
                completed: true,
                value: BigDecimal::from(DEPOSIT_CREDIT),
            }))
        }

        async fn transfer_to_trade_account(&self, chain: &str, amount: &BigDecimal, client_id: &str) -> PoolResult<()> {
            self.transfers
                .lock()
                .unwrap()
                .push((chain.to_string(), amount.clone(), client_id.to_string()));
            Ok(())
        }

        async fn transfer_to_main_account(&self, chain: &str, amount: &BigDecimal, client_id: &str) -> PoolResult<()> {
            self.transfers
                .lock()
                .unwrap()
                .push((chain.to_string(), amount.clone(), client_id.to_string()));
            Ok(())
        }

        async fn find_transfer(&self, _chain: &str, client_id: &str) -> PoolResult<bool> {
            Ok(self.transfers.lock().unwrap().iter().any(|(_, _, c)| c == client_id))
        }

        async fn generate_trade_path(&self, from_chain: &str, to_chain: &str) -> PoolResult<Vec<TradeLeg>> {
            Ok(vec![TradeLeg {
                market: format!("{}-{}", from_chain, to_chain),
                direction: TradeDirection::Sell,
                from_chain: from_chain.to_string(),
                to_chain: to_chain.to_string(),
                price: 2.0,
            }])
        }

        async fn create_trade(
            &self,
            market: &str,
            _direction: TradeDirection,
            quantity: &BigDecimal,
            client_id: &str,
        ) -> PoolResult<String> {
            let mut trades = self.trades.lock().unwrap();
            trades.push((market.to_string(), quantity.clone(), client_id.to_string()));
            Ok(format!("trade-{}", trades.len()))
        }

        async fn find_trade(&self, _market: &str, client_id: &str) -> PoolResult<Option<String>> {
            let trades = self.trades.lock().unwrap();
            Ok(trades
                .iter()
                .position(|(_, _, c)| c == client_id)
                .map(|i| format!("trade-{}", i + 1)))
        }

        async fn get_trade(&self, _market: &str, id: &str) -> PoolResult<Option<TradeInfo>> {
            let trades = self.trades.lock().unwrap();
            Ok(position(id, "trade-").and_then(|i| trades.get(i)).map(|(_, quantity, _)| TradeInfo {
                completed: true,
                proceeds: quantity.clone() * BigDecimal::from(2) - BigDecimal::from(1),
                fees: BigDecimal::from(1),
                fill_price: 2.0,
            }))
        }

        async fn create_withdrawal(
            &self,
            chain: &str,
            address: &str,
            amount: &BigDecimal,
            client_id: &str,
        ) -> PoolResult<String> {
            let mut withdrawals = self.withdrawals.lock().unwrap();
            withdrawals.push((
                chain.to_string(),
                address.to_string(),
                amount.clone(),
                client_id.to_string(),
            ));
            Ok(format!("wd-{}", withdrawals.len()))
        }

        async fn find_withdrawal(&self, _chain: &str, client_id: &str) -> PoolResult<Option<String>> {
            let withdrawals = self.withdrawals.lock().unwrap();
            Ok(withdrawals
                .iter()
                .position(|(_, _, _, c)| c == client_id)
                .map(|i| format!("wd-{}", i + 1)))
        }

        async fn get_withdrawal(&self, chain: &str, id: &str) -> PoolResult<Option<WithdrawalInfo>> {
            let withdrawals = self.withdrawals.lock().unwrap();
            Ok(position(id, "wd-").and_then(|i| withdrawals.get(i).map(|w| (i, w))).map(|(i, (_, _, amount, _))| {
                WithdrawalInfo {
                    completed: true,
                    txid: Some(format!("{}-withdrawal-{}", chain.to_lowercase(), i + 1)),
                    value: amount.clone(),
                    fees: BigDecimal::from(1),
                }
            }))
        }
    }

    fn leg_row(path_id: i32, stage_id: i32, to_chain: &str, seed: &PathSeed, leg: &TradeLeg) -> models::ExchangeTrade {
        models::ExchangeTrade {
            id: (path_id * 10 + stage_id) as i64,
            batch_id: 1,
            path_id,
            stage_id,
            step_id: 1,
            exchange_trade_id: Some(format!("trade-{}", path_id)),
            initial_chain_id: seed.in_chain_id.clone(),
            from_chain_id: leg.from_chain.clone(),
            to_chain_id: to_chain.to_string(),
            market: leg.market.clone(),
            direction: leg.direction.as_str().to_string(),
            value: Some(Amount(seed.value.clone())),
            proceeds: None,
            trade_fees: None,
            cumulative_deposit_fees: Some(Amount(seed.deposit_fees.clone())),
            cumulative_trade_fees: Some(Amount::zero()),
            order_price: Some(leg.price),
            fill_price: None,
            cumulative_fill_price: None,
            slippage: None,
            initiated: true,
            filled: false,
            open: true,
            transferred: false,
            created_at: NaiveDateTime::default(),
        }
    }

    fn balance_input(id: i64, miner_id: i64, out_chain: &str, value: i64) -> models::BalanceInput {
        models::BalanceInput {
            id,
            round_id: 1,
            chain_id: "ETC".into(),
            miner_id,
            out_chain_id: out_chain.into(),
            value: Some(Amount::from(value)),
            pool_fees: Some(Amount::zero()),
            mature: true,
            pending: true,
            batch_id: None,
            balance_output_id: None,
        }
    }

    struct Harness {
        store: Arc<MemoryBatchStore>,
        exchange: Arc<FakeExchange>,
        btc: Arc<FakeNode>,
        eth: Arc<FakeNode>,
        batcher: Batcher,
    }

    /// Miner 1 owes ETC -> BTC 10 and miner 2 owes ETC -> ETH 20. ETC and
    /// BTC are UTXO chains, ETH is an account chain.
    fn harness(store: MemoryBatchStore) -> Harness {
        let etc = Arc::new(FakeNode::new("ETC", AccountingType::Utxo));
        let btc = Arc::new(FakeNode::new("BTC", AccountingType::Utxo));
        let eth = Arc::new(FakeNode::new("ETH", AccountingType::Account));
        let chains = Arc::new(ChainRegistry::new(vec![
            fake_chain("ETC", etc),
            fake_chain("BTC", btc.clone()),
            fake_chain("ETH", eth.clone()),
        ]));
        let store = Arc::new(store);
        let exchange = Arc::new(FakeExchange::default());
        let batcher = Batcher::with_store(store.clone(), exchange.clone(), chains, Notifier::disabled());
        Harness {
            store,
            exchange,
            btc,
            eth,
            batcher,
        }
    }

    fn two_route_store() -> MemoryBatchStore {
        MemoryBatchStore::new(vec![balance_input(1, 1, "BTC", 10), balance_input(2, 2, "ETH", 20)])
    }

    fn batch(h: &Harness) -> models::ExchangeBatch {
        h.store.ledger.lock().unwrap().batches[0].clone()
    }

    async fn tick(h: &Harness) -> BatchStatus {
        h.batcher.run().await.unwrap();
        h.store.status(batch(h).id)
    }

    /// Ticks until the batch reaches `target`.
    async fn walk_to(h: &Harness, target: BatchStatus) {
        h.batcher.run().await.unwrap();
        for _ in 0..BatchStatus::ALL.len() {
            if tick(h).await == target {
                return;
            }
        }
        panic!("batch stuck at {}", h.store.status(batch(h).id));
    }

    fn pays(address: &str, value: i64, confirmed: bool) -> TxInfo {
        TxInfo {
            confirmed,
            height: confirmed.then_some(1_000),
            fee: None,
            outputs: vec![TxInfoOutput {
                index: 0,
                address: address.to_string(),
                value: Amount::from(value),
            }],
        }
    }

    #[test]
    fn steps_walk_every_status_in_order() {
        let mut status = BatchStatus::Inactive;
        let mut visited = vec![status];
        while next_step(status) != Step::Done {
            let target = step_target(next_step(status)).unwrap();
            assert!(target > status);
            status = target;
            visited.push(status);
        }
        assert_eq!(visited, BatchStatus::ALL.to_vec());
    }

    #[test]
    fn route_validation() {
        let leg = |from: &str, to: &str| TradeLeg {
            market: format!("{}-{}", from, to),
            direction: TradeDirection::Sell,
            from_chain: from.into(),
            to_chain: to.into(),
            price: 1.0,
        };
        assert!(validate_path(&[leg("ETC", "BTC")], "ETC", "BTC").is_ok());
        assert!(validate_path(&[leg("KAS", "USDT"), leg("USDT", "BTC")], "KAS", "BTC").is_ok());
        assert!(validate_path(&[], "ETC", "BTC").is_err());
        assert!(validate_path(&[leg("ETC", "BTC"), leg("BTC", "ETH"), leg("ETH", "LTC")], "ETC", "LTC").is_err());
        assert!(validate_path(&[leg("ETC", "USDT"), leg("BTC", "ETH")], "ETC", "ETH").is_err());
        assert!(validate_path(&[leg("ETC", "BTC")], "ETC", "ETH").is_err());
    }

    #[test]
    fn deposits_split_into_equal_parts() {
        let groups = deposit_groups("etc-deposit", &BigInt::from(31), 3).unwrap();
        let values: Vec<BigInt> = groups.iter().map(|g| g[0].value.0.clone()).collect();
        assert_eq!(values, vec![BigInt::from(11), BigInt::from(10), BigInt::from(10)]);
        assert!(groups.iter().all(|g| g[0].split_fee && g[0].address == "etc-deposit"));
    }

    #[test]
    fn final_legs_pick_the_last_stage() {
        let seed = PathSeed {
            in_chain_id: "KAS".into(),
            out_chain_id: "BTC".into(),
            value: BigInt::from(1),
            deposit_fees: BigInt::zero(),
        };
        let leg = TradeLeg {
            market: "KAS-USDT".into(),
            direction: TradeDirection::Sell,
            from_chain: "KAS".into(),
            to_chain: "USDT".into(),
            price: 1.0,
        };
        let trades = vec![
            leg_row(1, 1, "USDT", &seed, &leg),
            leg_row(1, 2, "BTC", &seed, &leg),
            leg_row(2, 1, "ETH", &seed, &leg),
        ];
        let finals = final_legs(&trades);
        assert_eq!(finals.len(), 2);
        assert_eq!(finals[&1].stage_id, 2);
        assert_eq!(finals[&2].to_chain_id, "ETH");
    }

    #[tokio::test]
    async fn batch_walks_to_complete_across_failed_writes() {
        let h = harness(two_route_store());

        h.batcher.run().await.unwrap();
        let batch_id = batch(&h).id;
        assert_eq!(h.store.status(batch_id), BatchStatus::Inactive);
        assert_eq!(h.store.ledger.lock().unwrap().inputs.len(), 2);

        assert_eq!(tick(&h).await, BatchStatus::DepositsActive);
        {
            let ledger = h.store.ledger.lock().unwrap();
            assert_eq!(ledger.deposits.len(), 1);
            assert_eq!(ledger.deposits[0].value, Some(Amount::from(30i64)));
        }
        assert_eq!(tick(&h).await, BatchStatus::DepositsRegistered);

        // the transfer goes out, recording it does not
        h.store.fail_next("mark_deposit_transferred");
        assert_eq!(tick(&h).await, BatchStatus::DepositsRegistered);
        {
            let ledger = h.store.ledger.lock().unwrap();
            assert!(ledger.deposits[0].confirmed);
            assert!(!ledger.deposits[0].transferred);
            assert_eq!(ledger.deposits[0].fees, Some(Amount::from(3i64)));
        }
        assert_eq!(tick(&h).await, BatchStatus::DepositsComplete);
        assert_eq!(h.exchange.transfers.lock().unwrap().len(), 1);
        assert_eq!(h.exchange.transfers.lock().unwrap()[0].1, BigDecimal::from(DEPOSIT_CREDIT));

        assert_eq!(tick(&h).await, BatchStatus::TradesInactive);
        {
            let ledger = h.store.ledger.lock().unwrap();
            let seeds: Vec<(Option<Amount>, Option<Amount>)> = ledger
                .trades
                .iter()
                .map(|t| (t.value.clone(), t.cumulative_deposit_fees.clone()))
                .collect();
            assert_eq!(
                seeds,
                vec![
                    (Some(Amount::from(9i64)), Some(Amount::from(1i64))),
                    (Some(Amount::from(18i64)), Some(Amount::from(2i64))),
                ]
            );
        }

        h.store.fail_next("mark_trade_initiated");
        assert_eq!(tick(&h).await, BatchStatus::TradesInactive);
        assert_eq!(h.exchange.trades.lock().unwrap().len(), 1);
        assert_eq!(tick(&h).await, BatchStatus::TradesActiveStageOne);
        assert_eq!(h.exchange.trades.lock().unwrap().len(), 2);

        assert_eq!(tick(&h).await, BatchStatus::TradesCompleteStageOne);
        {
            let transfers = h.exchange.transfers.lock().unwrap();
            let to_main: Vec<(String, BigDecimal)> = transfers[1..].iter().map(|(c, a, _)| (c.clone(), a.clone())).collect();
            assert_eq!(
                to_main,
                vec![
                    ("BTC".to_string(), BigDecimal::from(17)),
                    ("ETH".to_string(), BigDecimal::from(35)),
                ]
            );
        }

        // single-hop paths leave stage two empty
        assert_eq!(tick(&h).await, BatchStatus::TradesCompleteStageTwo);

        h.store.fail_next("set_withdrawal_exchange_id");
        assert_eq!(tick(&h).await, BatchStatus::TradesCompleteStageTwo);
        assert_eq!(h.exchange.withdrawals.lock().unwrap().len(), 1);
        assert_eq!(h.store.ledger.lock().unwrap().withdrawals.len(), 2);
        assert_eq!(tick(&h).await, BatchStatus::WithdrawalsActive);
        {
            let withdrawals = h.exchange.withdrawals.lock().unwrap();
            let requested: Vec<(String, String, BigDecimal)> = withdrawals
                .iter()
                .map(|(c, a, v, _)| (c.clone(), a.clone(), v.clone()))
                .collect();
            assert_eq!(
                requested,
                vec![
                    ("BTC".to_string(), "btc-pool".to_string(), BigDecimal::from(17)),
                    ("ETH".to_string(), "eth-pool".to_string(), BigDecimal::from(35)),
                ]
            );
        }

        assert_eq!(tick(&h).await, BatchStatus::WithdrawalsComplete);
        let (btc_txid, eth_txid) = {
            let ledger = h.store.ledger.lock().unwrap();
            (
                ledger.withdrawals[0].txid.clone().unwrap(),
                ledger.withdrawals[1].txid.clone().unwrap(),
            )
        };
        h.btc
            .txs
            .lock()
            .unwrap()
            .insert(btc_txid.clone(), pays("btc-pool", 16, false));
        h.eth
            .txs
            .lock()
            .unwrap()
            .insert(eth_txid.clone(), pays("eth-pool", 34, true));

        // BTC is still unconfirmed on the node, only ETH settles
        assert_eq!(tick(&h).await, BatchStatus::WithdrawalsComplete);
        {
            let ledger = h.store.ledger.lock().unwrap();
            assert_eq!(ledger.credits.len(), 1);
            let (_, utxos, shares) = &ledger.credits[0];
            assert_eq!(utxos, &vec![(eth_txid.clone(), 0, BigInt::from(34))]);
            assert_eq!(shares.len(), 1);
            assert_eq!(shares[0].balance_input_id, 2);
            assert_eq!(shares[0].miner_id, 2);
            assert_eq!(shares[0].value, BigInt::from(34));
            assert_eq!(shares[0].exchange_fees, BigInt::from(6));
            assert_eq!(shares[0].input_value, BigInt::from(20));
        }

        h.btc.txs.lock().unwrap().get_mut(&btc_txid).unwrap().confirmed = true;
        assert_eq!(tick(&h).await, BatchStatus::Complete);
        let ledger = h.store.ledger.lock().unwrap();
        assert_eq!(ledger.credits.len(), 2);
        let (_, utxos, shares) = &ledger.credits[1];
        assert_eq!(utxos, &vec![(btc_txid.clone(), 0, BigInt::from(16))]);
        assert_eq!(shares[0].balance_input_id, 1);
        assert_eq!(shares[0].value, BigInt::from(16));
        assert_eq!(shares[0].exchange_fees, BigInt::from(4));
        assert!(ledger.balance_inputs.iter().all(|i| i.balance_output_id.is_some()));
        assert!(ledger.batches[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn replayed_steps_repeat_no_exchange_action() {
        let h = harness(two_route_store());
        walk_to(&h, BatchStatus::WithdrawalsComplete).await;
        for (txid, node, address) in {
            let ledger = h.store.ledger.lock().unwrap();
            vec![
                (ledger.withdrawals[0].txid.clone().unwrap(), h.btc.clone(), "btc-pool"),
                (ledger.withdrawals[1].txid.clone().unwrap(), h.eth.clone(), "eth-pool"),
            ]
        } {
            node.txs.lock().unwrap().insert(txid.clone(), pays(address, 1, true));
        }
        assert_eq!(tick(&h).await, BatchStatus::Complete);

        let counts = |h: &Harness| {
            let ledger = h.store.ledger.lock().unwrap();
            (
                h.exchange.transfers.lock().unwrap().len(),
                h.exchange.trades.lock().unwrap().len(),
                h.exchange.withdrawals.lock().unwrap().len(),
                ledger.deposits.len(),
                ledger.trades.len(),
                ledger.withdrawals.len(),
                ledger.credits.len(),
            )
        };
        let before = counts(&h);
        assert_eq!(before, (3, 2, 2, 1, 2, 2, 2));

        // a tick that read the batch before each transition ran its step again
        let stale = batch(&h);
        for status in BatchStatus::ALL.iter().filter(|s| **s != BatchStatus::Complete) {
            let err = h.batcher.advance(&stale, *status).await.unwrap_err();
            assert!(err.is_duplicate(), "{}: {:?}", status, err);
            assert_eq!(counts(&h), before, "{}", status);
        }
        assert_eq!(h.batcher.advance(&stale, BatchStatus::Complete).await.unwrap(), None);
        assert_eq!(h.store.status(stale.id), BatchStatus::Complete);
    }

    #[tokio::test]
    async fn uncredited_until_the_withdrawal_tx_confirms() {
        let h = harness(two_route_store());
        walk_to(&h, BatchStatus::WithdrawalsComplete).await;
        let txids: Vec<String> = h
            .store
            .ledger
            .lock()
            .unwrap()
            .withdrawals
            .iter()
            .map(|w| w.txid.clone().unwrap())
            .collect();
        h.btc
            .txs
            .lock()
            .unwrap()
            .insert(txids[0].clone(), pays("btc-pool", 16, false));
        h.eth
            .txs
            .lock()
            .unwrap()
            .insert(txids[1].clone(), pays("eth-pool", 34, false));

        for _ in 0..3 {
            assert_eq!(tick(&h).await, BatchStatus::WithdrawalsComplete);
        }
        let ledger = h.store.ledger.lock().unwrap();
        assert!(ledger.credits.is_empty());
        assert!(ledger.withdrawals.iter().all(|w| w.confirmed && !w.spent));
    }

    #[tokio::test]
    async fn oversized_deposit_is_split() {
        let h = harness(two_route_store().with_max_deposit_output(20));
        walk_to(&h, BatchStatus::DepositsActive).await;
        let ledger = h.store.ledger.lock().unwrap();
        let values: Vec<Option<Amount>> = ledger.deposits.iter().map(|d| d.value.clone()).collect();
        assert_eq!(values, vec![Some(Amount::from(15i64)), Some(Amount::from(15i64))]);
    }
}
