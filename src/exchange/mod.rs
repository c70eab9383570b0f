//! The exchange the pool converts cross-chain rewards through.
//!
//! Exchange outcomes are observed, never controlled: every call here may
//! fail transiently, and the batcher treats each reply as the latest view of
//! an order or transfer it started earlier.

pub mod batch;
pub mod batcher;
pub mod gateway;
pub mod store;
pub mod trades;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};

pub use batch::BatchStatus;
pub use gateway::ExchangeGateway;
pub use trades::TradeDirection;

use crate::error::PoolResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct WalletStatus {
    pub deposits_enabled: bool,
    pub withdrawals_enabled: bool,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct DepositInfo {
    pub id: String,
    pub completed: bool,
    /// Whole coins credited by the exchange.
    pub value: BigDecimal,
}

/// One hop of a conversion route.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TradeLeg {
    pub market: String,
    pub direction: TradeDirection,
    pub from_chain: String,
    pub to_chain: String,
    /// Quote used to estimate the order; the fill price is recorded later.
    pub price: f64,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct TradeInfo {
    pub completed: bool,
    /// Whole coins of the leg's target currency, after fees.
    pub proceeds: BigDecimal,
    pub fees: BigDecimal,
    pub fill_price: f64,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct WithdrawalInfo {
    pub completed: bool,
    #[serde(default)]
    pub txid: Option<String>,
    pub value: BigDecimal,
    pub fees: BigDecimal,
}

/// Every call that moves funds carries a `client_id` the pool derives from
/// the ledger row it wrote first. The exchange treats a repeated id as the
/// same request, and the `find_*` lookups tell a rerun whether an earlier
/// attempt already went through.
#[async_trait]
pub trait Exchange: Send + Sync {
    fn id(&self) -> &str;

    async fn get_deposit_address(&self, chain: &str) -> PoolResult<String>;
    async fn get_wallet_status(&self, chain: &str) -> PoolResult<WalletStatus>;
    async fn get_deposit_by_txid(&self, chain: &str, txid: &str) -> PoolResult<Option<DepositInfo>>;
    async fn get_deposit_by_id(&self, chain: &str, id: &str) -> PoolResult<Option<DepositInfo>>;
    async fn transfer_to_trade_account(&self, chain: &str, amount: &BigDecimal, client_id: &str) -> PoolResult<()>;
    async fn transfer_to_main_account(&self, chain: &str, amount: &BigDecimal, client_id: &str) -> PoolResult<()>;
    /// Whether a transfer in either direction was made under `client_id`.
    async fn find_transfer(&self, chain: &str, client_id: &str) -> PoolResult<bool>;
    async fn generate_trade_path(&self, from_chain: &str, to_chain: &str) -> PoolResult<Vec<TradeLeg>>;
    /// `quantity` is in whole coins of the currency being spent.
    async fn create_trade(
        &self,
        market: &str,
        direction: TradeDirection,
        quantity: &BigDecimal,
        client_id: &str,
    ) -> PoolResult<String>;
    /// Exchange id of the order placed under `client_id`, if any.
    async fn find_trade(&self, market: &str, client_id: &str) -> PoolResult<Option<String>>;
    async fn get_trade(&self, market: &str, id: &str) -> PoolResult<Option<TradeInfo>>;
    async fn create_withdrawal(
        &self,
        chain: &str,
        address: &str,
        amount: &BigDecimal,
        client_id: &str,
    ) -> PoolResult<String>;
    /// Exchange id of the withdrawal requested under `client_id`, if any.
    async fn find_withdrawal(&self, chain: &str, client_id: &str) -> PoolResult<Option<String>>;
    async fn get_withdrawal(&self, chain: &str, id: &str) -> PoolResult<Option<WithdrawalInfo>>;
}

/// Client ids for the fund-moving calls, keyed by ledger row.
pub mod client_id {
    pub fn deposit_transfer(exchange_id: &str, deposit_id: i64) -> String {
        format!("{}-dx-{}", exchange_id, deposit_id)
    }

    pub fn trade(exchange_id: &str, trade_id: i64) -> String {
        format!("{}-t-{}", exchange_id, trade_id)
    }

    pub fn trade_transfer(exchange_id: &str, trade_id: i64) -> String {
        format!("{}-tx-{}", exchange_id, trade_id)
    }

    pub fn withdrawal(exchange_id: &str, withdrawal_id: i64) -> String {
        format!("{}-w-{}", exchange_id, withdrawal_id)
    }
}
