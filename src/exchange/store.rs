//! Ledger access for the batcher.
//!
//! [`BatchStore`] is every read and guarded write the batcher makes. The
//! production store is the ledger database; each write keeps the guard of
//! the SQL it runs (status checks, `... = 0` flags) so a repeated call fails
//! instead of applying twice.

use std::sync::Arc;

use async_trait::async_trait;
use num_bigint::BigInt;

use crate::app_database::exchange::{insert_deposit, NewPath, NewWithdrawal, TradeFillUpdate};
use crate::bank::{obtain_bank_lease, prepare_outgoing_txs};
use crate::chains::{Chain, TxOutput};
use crate::context::PoolContext;
use crate::error::PoolResult;
use crate::exchange::trades::CreditShare;
use crate::exchange::BatchStatus;
use crate::locker::Lease;
use crate::models::{self, TransactionType};

#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn active_batches(&self) -> PoolResult<Vec<models::ExchangeBatch>>;
    async fn pending_input_sums(&self) -> PoolResult<Vec<models::PendingBalanceSum>>;
    async fn create_batch(&self, exchange_id: String, routes: Vec<(String, String)>) -> PoolResult<i64>;
    async fn exchange_inputs(&self, batch_id: i64) -> PoolResult<Vec<models::ExchangeInput>>;
    /// `Duplicate` when the batch is no longer at `from`.
    async fn advance_status(&self, batch_id: i64, from: BatchStatus, to: BatchStatus) -> PoolResult<()>;

    async fn obtain_bank_lease(&self, chain_id: &str) -> PoolResult<Option<Lease>>;
    async fn release_bank_lease(&self, lease: Lease);
    /// Plans one deposit transaction per group and writes a deposit row for
    /// each. `None` while the chain has an outstanding transaction.
    async fn prepare_deposits(
        &self,
        batch_id: i64,
        chain: &Arc<Chain>,
        groups: Vec<Vec<TxOutput>>,
    ) -> PoolResult<Option<usize>>;
    async fn deposits(&self, batch_id: i64) -> PoolResult<Vec<models::ExchangeDeposit>>;
    async fn register_deposit(&self, deposit_id: i64, exchange_deposit_id: String) -> PoolResult<()>;
    async fn confirm_deposit(&self, deposit_id: i64, fees: BigInt) -> PoolResult<()>;
    async fn mark_deposit_transferred(&self, deposit_id: i64) -> PoolResult<()>;

    /// Writes the hops and moves the batch to `TRADES_INACTIVE` together.
    async fn insert_trade_paths(&self, batch_id: i64, paths: Vec<NewPath>) -> PoolResult<()>;
    async fn trades(&self, batch_id: i64) -> PoolResult<Vec<models::ExchangeTrade>>;
    async fn mark_trade_initiated(&self, trade_id: i64, exchange_trade_id: String) -> PoolResult<()>;
    async fn record_trade_fill(&self, update: TradeFillUpdate) -> PoolResult<()>;
    async fn mark_trade_transferred(&self, trade_id: i64) -> PoolResult<()>;

    async fn withdrawals(&self, batch_id: i64) -> PoolResult<Vec<models::ExchangeWithdrawal>>;
    async fn insert_withdrawal(&self, withdrawal: NewWithdrawal) -> PoolResult<i64>;
    async fn set_withdrawal_exchange_id(&self, withdrawal_id: i64, exchange_withdrawal_id: String) -> PoolResult<()>;
    async fn confirm_withdrawal(&self, withdrawal_id: i64, txid: String, fees: BigInt) -> PoolResult<()>;

    async fn batch_inputs_for_route(
        &self,
        batch_id: i64,
        in_chain_id: String,
        out_chain_id: String,
    ) -> PoolResult<Vec<models::BalanceInput>>;
    async fn credit_withdrawal(
        &self,
        batch_id: i64,
        withdrawal_id: i64,
        chain_id: String,
        utxos: Vec<(String, u32, BigInt)>,
        shares: Vec<CreditShare>,
    ) -> PoolResult<()>;
    async fn complete_batch(&self, batch_id: i64) -> PoolResult<()>;
}

/// The ledger database, with deposits prepared through the bank.
pub struct LedgerBatchStore {
    ctx: Arc<PoolContext>,
}

impl LedgerBatchStore {
    pub fn new(ctx: Arc<PoolContext>) -> Self {
        LedgerBatchStore { ctx }
    }
}

#[async_trait]
impl BatchStore for LedgerBatchStore {
    async fn active_batches(&self) -> PoolResult<Vec<models::ExchangeBatch>> {
        self.ctx.db.get_active_batches().await
    }

    async fn pending_input_sums(&self) -> PoolResult<Vec<models::PendingBalanceSum>> {
        self.ctx.db.get_pending_input_sums().await
    }

    async fn create_batch(&self, exchange_id: String, routes: Vec<(String, String)>) -> PoolResult<i64> {
        self.ctx.db.create_batch(exchange_id, routes).await
    }

    async fn exchange_inputs(&self, batch_id: i64) -> PoolResult<Vec<models::ExchangeInput>> {
        self.ctx.db.get_exchange_inputs(batch_id).await
    }

    async fn advance_status(&self, batch_id: i64, from: BatchStatus, to: BatchStatus) -> PoolResult<()> {
        self.ctx.db.advance_batch_status(batch_id, from, to).await
    }

    async fn obtain_bank_lease(&self, chain_id: &str) -> PoolResult<Option<Lease>> {
        obtain_bank_lease(&self.ctx, chain_id).await
    }

    async fn release_bank_lease(&self, lease: Lease) {
        self.ctx.locker.release(lease).await
    }

    async fn prepare_deposits(
        &self,
        batch_id: i64,
        chain: &Arc<Chain>,
        groups: Vec<Vec<TxOutput>>,
    ) -> PoolResult<Option<usize>> {
        let chain_id = chain.id().to_string();
        let (_, count) = prepare_outgoing_txs(&self.ctx, chain, TransactionType::Deposit, groups, move |conn, txs| {
            for (tx_id, tx) in txs.iter() {
                insert_deposit(conn, batch_id, &chain_id, *tx_id, &tx.txid, &tx.value)?;
            }
            Ok(txs.len())
        })
        .await?;
        Ok(count)
    }

    async fn deposits(&self, batch_id: i64) -> PoolResult<Vec<models::ExchangeDeposit>> {
        self.ctx.db.get_deposits(batch_id).await
    }

    async fn register_deposit(&self, deposit_id: i64, exchange_deposit_id: String) -> PoolResult<()> {
        self.ctx.db.register_deposit(deposit_id, exchange_deposit_id).await
    }

    async fn confirm_deposit(&self, deposit_id: i64, fees: BigInt) -> PoolResult<()> {
        self.ctx.db.confirm_deposit(deposit_id, fees).await
    }

    async fn mark_deposit_transferred(&self, deposit_id: i64) -> PoolResult<()> {
        self.ctx.db.mark_deposit_transferred(deposit_id).await
    }

    async fn insert_trade_paths(&self, batch_id: i64, paths: Vec<NewPath>) -> PoolResult<()> {
        self.ctx.db.insert_trade_paths(batch_id, paths).await
    }

    async fn trades(&self, batch_id: i64) -> PoolResult<Vec<models::ExchangeTrade>> {
        self.ctx.db.get_trades(batch_id).await
    }

    async fn mark_trade_initiated(&self, trade_id: i64, exchange_trade_id: String) -> PoolResult<()> {
        self.ctx.db.mark_trade_initiated(trade_id, exchange_trade_id).await
    }

    async fn record_trade_fill(&self, update: TradeFillUpdate) -> PoolResult<()> {
        self.ctx.db.record_trade_fill(update).await
    }

    async fn mark_trade_transferred(&self, trade_id: i64) -> PoolResult<()> {
        self.ctx.db.mark_trade_transferred(trade_id).await
    }

    async fn withdrawals(&self, batch_id: i64) -> PoolResult<Vec<models::ExchangeWithdrawal>> {
        self.ctx.db.get_withdrawals(batch_id).await
    }

    async fn insert_withdrawal(&self, withdrawal: NewWithdrawal) -> PoolResult<i64> {
        self.ctx.db.insert_withdrawal(withdrawal).await
    }

    async fn set_withdrawal_exchange_id(&self, withdrawal_id: i64, exchange_withdrawal_id: String) -> PoolResult<()> {
        self.ctx
            .db
            .set_withdrawal_exchange_id(withdrawal_id, exchange_withdrawal_id)
            .await
    }

    async fn confirm_withdrawal(&self, withdrawal_id: i64, txid: String, fees: BigInt) -> PoolResult<()> {
        self.ctx.db.confirm_withdrawal(withdrawal_id, txid, fees).await
    }

    async fn batch_inputs_for_route(
        &self,
        batch_id: i64,
        in_chain_id: String,
        out_chain_id: String,
    ) -> PoolResult<Vec<models::BalanceInput>> {
        self.ctx
            .db
            .get_batch_inputs_for_route(batch_id, in_chain_id, out_chain_id)
            .await
    }

    async fn credit_withdrawal(
        &self,
        batch_id: i64,
        withdrawal_id: i64,
        chain_id: String,
        utxos: Vec<(String, u32, BigInt)>,
        shares: Vec<CreditShare>,
    ) -> PoolResult<()> {
        self.ctx
            .db
            .credit_withdrawal(batch_id, withdrawal_id, chain_id, utxos, shares)
            .await
    }

    async fn complete_batch(&self, batch_id: i64) -> PoolResult<()> {
        self.ctx.db.complete_batch(batch_id).await
    }
}
