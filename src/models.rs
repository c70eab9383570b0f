use chrono::NaiveDateTime;
use diesel::sql_types::{
    BigInt, Bool, Datetime, Double, Integer, Nullable, Numeric, Text, Unsigned, VarChar,
};
use diesel::QueryableByName;
use serde::{Deserialize, Serialize};

use crate::amount::Amount;

#[derive(Debug, Clone, Serialize, Deserialize, QueryableByName)]
pub struct Miner {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
    #[diesel(sql_type = VarChar)]
    pub chain_id: String,
    #[diesel(sql_type = VarChar)]
    pub address: String,
    #[diesel(sql_type = Nullable<VarChar>)]
    pub email: Option<String>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub threshold: Option<Amount>,
    #[diesel(sql_type = Nullable<Double>)]
    pub recipient_fee_percent: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, QueryableByName)]
pub struct Worker {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
    #[diesel(sql_type = BigInt)]
    pub miner_id: i64,
    #[diesel(sql_type = VarChar)]
    pub name: String,
    #[diesel(sql_type = Bool)]
    pub active: bool,
    #[diesel(sql_type = Bool)]
    pub notified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, QueryableByName)]
pub struct Round {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
    #[diesel(sql_type = VarChar)]
    pub chain_id: String,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub miner_id: Option<i64>,
    #[diesel(sql_type = Bool)]
    pub solo: bool,
    #[diesel(sql_type = Unsigned<BigInt>)]
    pub height: u64,
    #[diesel(sql_type = VarChar)]
    pub hash: String,
    #[diesel(sql_type = Nullable<VarChar>)]
    pub nonce: Option<String>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub value: Option<Amount>,
    #[diesel(sql_type = Double)]
    pub difficulty: f64,
    #[diesel(sql_type = BigInt)]
    pub accepted_shares: i64,
    #[diesel(sql_type = BigInt)]
    pub rejected_shares: i64,
    #[diesel(sql_type = BigInt)]
    pub invalid_shares: i64,
    #[diesel(sql_type = Double)]
    pub luck: f64,
    #[diesel(sql_type = Bool)]
    pub pending: bool,
    #[diesel(sql_type = Bool)]
    pub uncle: bool,
    #[diesel(sql_type = Bool)]
    pub orphan: bool,
    #[diesel(sql_type = Bool)]
    pub mature: bool,
    #[diesel(sql_type = Bool)]
    pub spent: bool,
    #[diesel(sql_type = Nullable<VarChar>)]
    pub coinbase_txid: Option<String>,
    #[diesel(sql_type = Nullable<Unsigned<BigInt>>)]
    pub epoch_height: Option<u64>,
    #[diesel(sql_type = Nullable<Unsigned<BigInt>>)]
    pub uncle_height: Option<u64>,
    #[diesel(sql_type = Datetime)]
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct InsertRound {
    pub chain_id: String,
    pub miner_id: Option<i64>,
    pub solo: bool,
    pub height: u64,
    pub hash: String,
    pub nonce: Option<String>,
    pub value: Option<Amount>,
    pub difficulty: f64,
    pub accepted_shares: i64,
    pub rejected_shares: i64,
    pub invalid_shares: i64,
    pub luck: f64,
    pub epoch_height: Option<u64>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, QueryableByName)]
pub struct Share {
    #[diesel(sql_type = BigInt)]
    pub round_id: i64,
    #[diesel(sql_type = BigInt)]
    pub miner_id: i64,
    #[diesel(sql_type = BigInt)]
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, QueryableByName)]
pub struct BalanceInput {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
    #[diesel(sql_type = BigInt)]
    pub round_id: i64,
    #[diesel(sql_type = VarChar)]
    pub chain_id: String,
    #[diesel(sql_type = BigInt)]
    pub miner_id: i64,
    #[diesel(sql_type = VarChar)]
    pub out_chain_id: String,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub value: Option<Amount>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub pool_fees: Option<Amount>,
    #[diesel(sql_type = Bool)]
    pub mature: bool,
    #[diesel(sql_type = Bool)]
    pub pending: bool,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub batch_id: Option<i64>,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub balance_output_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, QueryableByName)]
pub struct BalanceOutput {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
    #[diesel(sql_type = VarChar)]
    pub chain_id: String,
    #[diesel(sql_type = BigInt)]
    pub miner_id: i64,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub value: Option<Amount>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub pool_fees: Option<Amount>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub exchange_fees: Option<Amount>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub tx_fees: Option<Amount>,
    #[diesel(sql_type = Bool)]
    pub mature: bool,
    #[diesel(sql_type = Bool)]
    pub spent: bool,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub in_batch_id: Option<i64>,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub in_deposit_id: Option<i64>,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub in_payout_id: Option<i64>,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub out_payout_id: Option<i64>,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub out_merge_transaction_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, QueryableByName)]
pub struct BalanceSum {
    #[diesel(sql_type = BigInt)]
    pub miner_id: i64,
    #[diesel(sql_type = VarChar)]
    pub chain_id: String,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub immature_value: Option<Amount>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub mature_value: Option<Amount>,
}

#[derive(Debug, Clone, Serialize, Deserialize, QueryableByName)]
pub struct Utxo {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
    #[diesel(sql_type = VarChar)]
    pub chain_id: String,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub transaction_id: Option<i64>,
    #[diesel(sql_type = VarChar)]
    pub txid: String,
    #[diesel(sql_type = Unsigned<Integer>)]
    pub idx: u32,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub value: Option<Amount>,
    #[diesel(sql_type = Bool)]
    pub active: bool,
    #[diesel(sql_type = Bool)]
    pub spent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    Deposit,
    Merge,
    Payout,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Merge => "merge",
            TransactionType::Payout => "payout",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "deposit" => Some(TransactionType::Deposit),
            "merge" => Some(TransactionType::Merge),
            "payout" => Some(TransactionType::Payout),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, QueryableByName)]
pub struct Transaction {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
    #[diesel(sql_type = VarChar)]
    pub chain_id: String,
    #[diesel(sql_type = VarChar)]
    pub tx_type: String,
    #[diesel(sql_type = VarChar)]
    pub txid: String,
    #[diesel(sql_type = Text)]
    pub tx_hex: String,
    #[diesel(sql_type = Nullable<Unsigned<BigInt>>)]
    pub height: Option<u64>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub value: Option<Amount>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub fee: Option<Amount>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub fee_balance: Option<Amount>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub remainder: Option<Amount>,
    #[diesel(sql_type = Nullable<Unsigned<Integer>>)]
    pub remainder_idx: Option<u32>,
    #[diesel(sql_type = Bool)]
    pub spent: bool,
    #[diesel(sql_type = Bool)]
    pub confirmed: bool,
    #[diesel(sql_type = Bool)]
    pub failed: bool,
}

impl Transaction {
    pub fn kind(&self) -> Option<TransactionType> {
        TransactionType::parse(&self.tx_type)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, QueryableByName)]
pub struct ExchangeBatch {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
    #[diesel(sql_type = VarChar)]
    pub exchange_id: String,
    #[diesel(sql_type = Integer)]
    pub status: i32,
    #[diesel(sql_type = Datetime)]
    pub created_at: NaiveDateTime,
    #[diesel(sql_type = Nullable<Datetime>)]
    pub completed_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, QueryableByName)]
pub struct ExchangeInput {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
    #[diesel(sql_type = BigInt)]
    pub batch_id: i64,
    #[diesel(sql_type = VarChar)]
    pub in_chain_id: String,
    #[diesel(sql_type = VarChar)]
    pub out_chain_id: String,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub value: Option<Amount>,
}

#[derive(Debug, Clone, Serialize, Deserialize, QueryableByName)]
pub struct ExchangeDeposit {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
    #[diesel(sql_type = BigInt)]
    pub batch_id: i64,
    #[diesel(sql_type = VarChar)]
    pub chain_id: String,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub transaction_id: Option<i64>,
    #[diesel(sql_type = Nullable<VarChar>)]
    pub deposit_txid: Option<String>,
    #[diesel(sql_type = Nullable<VarChar>)]
    pub exchange_deposit_id: Option<String>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub value: Option<Amount>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub fees: Option<Amount>,
    #[diesel(sql_type = Bool)]
    pub registered: bool,
    #[diesel(sql_type = Bool)]
    pub confirmed: bool,
    /// Credited value moved to the trade account.
    #[diesel(sql_type = Bool)]
    pub transferred: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, QueryableByName)]
pub struct ExchangeTrade {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
    #[diesel(sql_type = BigInt)]
    pub batch_id: i64,
    #[diesel(sql_type = Integer)]
    pub path_id: i32,
    #[diesel(sql_type = Integer)]
    pub stage_id: i32,
    #[diesel(sql_type = Integer)]
    pub step_id: i32,
    #[diesel(sql_type = Nullable<VarChar>)]
    pub exchange_trade_id: Option<String>,
    #[diesel(sql_type = VarChar)]
    pub initial_chain_id: String,
    #[diesel(sql_type = VarChar)]
    pub from_chain_id: String,
    #[diesel(sql_type = VarChar)]
    pub to_chain_id: String,
    #[diesel(sql_type = VarChar)]
    pub market: String,
    #[diesel(sql_type = VarChar)]
    pub direction: String,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub value: Option<Amount>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub proceeds: Option<Amount>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub trade_fees: Option<Amount>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub cumulative_deposit_fees: Option<Amount>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub cumulative_trade_fees: Option<Amount>,
    #[diesel(sql_type = Nullable<Double>)]
    pub order_price: Option<f64>,
    #[diesel(sql_type = Nullable<Double>)]
    pub fill_price: Option<f64>,
    #[diesel(sql_type = Nullable<Double>)]
    pub cumulative_fill_price: Option<f64>,
    #[diesel(sql_type = Nullable<Double>)]
    pub slippage: Option<f64>,
    #[diesel(sql_type = Bool)]
    pub initiated: bool,
    #[diesel(sql_type = Bool)]
    pub filled: bool,
    #[diesel(sql_type = Bool)]
    pub open: bool,
    /// Final hops only: proceeds moved back to the main account.
    #[diesel(sql_type = Bool)]
    pub transferred: bool,
    #[diesel(sql_type = Datetime)]
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, QueryableByName)]
pub struct ExchangeWithdrawal {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
    #[diesel(sql_type = BigInt)]
    pub batch_id: i64,
    #[diesel(sql_type = VarChar)]
    pub chain_id: String,
    /// Unset until the exchange accepted the withdrawal.
    #[diesel(sql_type = Nullable<VarChar>)]
    pub exchange_withdrawal_id: Option<String>,
    #[diesel(sql_type = Nullable<VarChar>)]
    pub txid: Option<String>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub value: Option<Amount>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub deposit_fees: Option<Amount>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub trade_fees: Option<Amount>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub withdrawal_fees: Option<Amount>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub cumulative_fees: Option<Amount>,
    #[diesel(sql_type = Bool)]
    pub confirmed: bool,
    #[diesel(sql_type = Bool)]
    pub spent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, QueryableByName)]
pub struct Payout {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
    #[diesel(sql_type = VarChar)]
    pub chain_id: String,
    #[diesel(sql_type = BigInt)]
    pub miner_id: i64,
    #[diesel(sql_type = VarChar)]
    pub address: String,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub transaction_id: Option<i64>,
    #[diesel(sql_type = Nullable<VarChar>)]
    pub txid: Option<String>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub value: Option<Amount>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub fee_balance: Option<Amount>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub pool_fees: Option<Amount>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub exchange_fees: Option<Amount>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub tx_fees: Option<Amount>,
    #[diesel(sql_type = Bool)]
    pub pending: bool,
    #[diesel(sql_type = Bool)]
    pub confirmed: bool,
    #[diesel(sql_type = Bool)]
    pub failed: bool,
}

/// Sum of a miner's mature unpaid outputs on one chain.
#[derive(Debug, Clone, QueryableByName)]
pub struct PayoutCandidate {
    #[diesel(sql_type = BigInt)]
    pub miner_id: i64,
    #[diesel(sql_type = VarChar)]
    pub address: String,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub threshold: Option<Amount>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub value: Option<Amount>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub pool_fees: Option<Amount>,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub exchange_fees: Option<Amount>,
}

#[derive(Debug, Clone, QueryableByName)]
pub struct PendingBalanceSum {
    #[diesel(sql_type = VarChar)]
    pub chain_id: String,
    #[diesel(sql_type = VarChar)]
    pub out_chain_id: String,
    #[diesel(sql_type = Nullable<Numeric>)]
    pub value: Option<Amount>,
}

#[derive(Debug, QueryableByName)]
pub struct AmountSum {
    #[diesel(sql_type = Nullable<Numeric>)]
    pub value: Option<Amount>,
}

#[derive(Debug, QueryableByName)]
pub struct Count {
    #[diesel(sql_type = BigInt)]
    pub count: i64,
}

#[derive(Debug, QueryableByName)]
pub struct LastInsertId {
    #[diesel(sql_type = Unsigned<BigInt>)]
    pub id: u64,
}

#[derive(Debug, QueryableByName)]
pub struct MaxTime {
    #[diesel(sql_type = Nullable<Datetime>)]
    pub value: Option<NaiveDateTime>,
}

/* chart rows */

#[derive(Debug, Clone, Default, Serialize, Deserialize, QueryableByName)]
pub struct RawBlockRow {
    #[diesel(sql_type = VarChar)]
    pub chain_id: String,
    #[diesel(sql_type = Unsigned<BigInt>)]
    pub height: u64,
    #[diesel(sql_type = Double)]
    pub value: f64,
    #[diesel(sql_type = Double)]
    pub difficulty: f64,
    #[diesel(sql_type = BigInt)]
    pub uncle_count: i64,
    #[diesel(sql_type = Datetime)]
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, QueryableByName)]
pub struct BlockChartRow {
    #[diesel(sql_type = VarChar)]
    pub chain_id: String,
    #[diesel(sql_type = Integer)]
    pub period: i32,
    #[diesel(sql_type = Datetime)]
    pub start_time: NaiveDateTime,
    #[diesel(sql_type = Datetime)]
    pub end_time: NaiveDateTime,
    #[diesel(sql_type = Double)]
    pub value: f64,
    #[diesel(sql_type = Double)]
    pub difficulty: f64,
    #[diesel(sql_type = Double)]
    pub block_time: f64,
    #[diesel(sql_type = Double)]
    pub hashrate: f64,
    #[diesel(sql_type = Double)]
    pub uncle_rate: f64,
    #[diesel(sql_type = Double)]
    pub profitability: f64,
    #[diesel(sql_type = Double)]
    pub avg_profitability: f64,
    #[diesel(sql_type = Double)]
    pub avg_difficulty: f64,
    #[diesel(sql_type = Double)]
    pub avg_block_time: f64,
    #[diesel(sql_type = Double)]
    pub avg_hashrate: f64,
    #[diesel(sql_type = BigInt)]
    pub count: i64,
    #[diesel(sql_type = BigInt)]
    pub uncle_count: i64,
    #[diesel(sql_type = Bool)]
    pub pending: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, QueryableByName)]
pub struct RoundChartRow {
    #[diesel(sql_type = VarChar)]
    pub chain_id: String,
    #[diesel(sql_type = Integer)]
    pub period: i32,
    #[diesel(sql_type = Datetime)]
    pub start_time: NaiveDateTime,
    #[diesel(sql_type = Datetime)]
    pub end_time: NaiveDateTime,
    #[diesel(sql_type = Double)]
    pub value: f64,
    #[diesel(sql_type = Double)]
    pub difficulty: f64,
    #[diesel(sql_type = Double)]
    pub accepted_shares: f64,
    #[diesel(sql_type = Double)]
    pub luck: f64,
    #[diesel(sql_type = Double)]
    pub avg_luck: f64,
    #[diesel(sql_type = Double)]
    pub uncle_rate: f64,
    #[diesel(sql_type = BigInt)]
    pub count: i64,
    #[diesel(sql_type = BigInt)]
    pub uncle_count: i64,
    #[diesel(sql_type = BigInt)]
    pub orphan_count: i64,
    #[diesel(sql_type = Bool)]
    pub pending: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, QueryableByName)]
pub struct ShareChartRow {
    #[diesel(sql_type = VarChar)]
    pub chain_id: String,
    #[diesel(sql_type = Integer)]
    pub period: i32,
    #[diesel(sql_type = BigInt)]
    pub miner_id: i64,
    #[diesel(sql_type = BigInt)]
    pub worker_id: i64,
    #[diesel(sql_type = Datetime)]
    pub start_time: NaiveDateTime,
    #[diesel(sql_type = Datetime)]
    pub end_time: NaiveDateTime,
    #[diesel(sql_type = Double)]
    pub miners: f64,
    #[diesel(sql_type = Double)]
    pub workers: f64,
    #[diesel(sql_type = Double)]
    pub accepted_shares: f64,
    #[diesel(sql_type = Double)]
    pub rejected_shares: f64,
    #[diesel(sql_type = Double)]
    pub invalid_shares: f64,
    #[diesel(sql_type = Double)]
    pub hashrate: f64,
    #[diesel(sql_type = Double)]
    pub avg_hashrate: f64,
    #[diesel(sql_type = BigInt)]
    pub count: i64,
    #[diesel(sql_type = Bool)]
    pub pending: bool,
}
