//! Per-chain capabilities consumed by the core.
//!
//! The core never talks to a chain directly: it goes through a
//! [`PayoutNode`] (wallet side) and a [`MiningNode`] (block side). The only
//! place the accounting style is branched on is the bank.

pub mod rpc_node;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::config::ChainConfig;
use crate::error::{PoolError, PoolResult};
use crate::models::Round;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountingType {
    Account,
    Utxo,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct NodeStatus {
    pub height: u64,
    pub syncing: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RawBlock {
    pub height: u64,
    pub hash: String,
    pub value: Amount,
    pub difficulty: f64,
    #[serde(default)]
    pub uncle_count: i64,
    #[serde(default)]
    pub tx_fees: Amount,
    /// unix seconds
    pub timestamp: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TxInput {
    pub txid: String,
    pub index: u32,
    pub value: Amount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_balance: Option<Amount>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: String,
    pub value: Amount,
    /// The transaction fee is deducted from outputs carrying this flag.
    #[serde(default)]
    pub split_fee: bool,
}

impl TxOutput {
    pub fn new(address: impl Into<String>, value: Amount) -> Self {
        TxOutput {
            address: address.into(),
            value,
            split_fee: false,
        }
    }

    pub fn splitting_fee(address: impl Into<String>, value: Amount) -> Self {
        TxOutput {
            address: address.into(),
            value,
            split_fee: true,
        }
    }
}

/// A signed transaction as produced by the chain codec. `outputs` hold the
/// final values after the fee was deducted.
#[derive(Clone, Debug, Deserialize)]
pub struct CreatedTx {
    pub txid: String,
    pub hex: String,
    pub fee: Amount,
    pub outputs: Vec<TxOutput>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TxInfoOutput {
    pub index: u32,
    pub address: String,
    pub value: Amount,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TxInfo {
    pub confirmed: bool,
    #[serde(default)]
    pub height: Option<u64>,
    /// Fee actually charged; account chains refund the difference.
    #[serde(default)]
    pub fee: Option<Amount>,
    #[serde(default)]
    pub outputs: Vec<TxInfoOutput>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum UnlockStatus {
    Orphan,
    Uncle { uncle_height: u64 },
    Canonical,
}

/// The node's canonical view of a pending round.
#[derive(Clone, Debug, Deserialize)]
pub struct RoundUnlock {
    pub status: UnlockStatus,
    #[serde(default)]
    pub value: Option<Amount>,
    #[serde(default)]
    pub coinbase_txid: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub height: Option<u64>,
    /// unix seconds
    #[serde(default)]
    pub created_at: Option<i64>,
}

#[async_trait]
pub trait PayoutNode: Send + Sync {
    fn chain(&self) -> &str;
    fn address(&self) -> &str;
    fn accounting_type(&self) -> AccountingType;
    fn should_merge_utxos(&self) -> bool;
    fn units(&self) -> u32;

    async fn get_status(&self) -> PoolResult<NodeStatus>;
    async fn get_balance(&self) -> PoolResult<Amount>;
    async fn get_tx(&self, txid: &str) -> PoolResult<Option<TxInfo>>;
    /// Fails with [`PoolError::TxTooBig`] when the inputs/outputs do not fit
    /// a single transaction.
    async fn create_tx(&self, inputs: &[TxInput], outputs: &[TxOutput]) -> PoolResult<CreatedTx>;
    async fn broadcast_tx(&self, tx_hex: &str) -> PoolResult<String>;
}

#[async_trait]
pub trait MiningNode: Send + Sync {
    fn chain(&self) -> &str;
    fn immature_depth(&self) -> u64;
    fn mature_depth(&self) -> u64;
    fn share_difficulty(&self, factor: f64) -> f64;
    fn calculate_hashrate(&self, block_time: f64, difficulty: f64) -> f64;

    async fn get_status(&self) -> PoolResult<NodeStatus>;
    async fn get_blocks(&self, from: u64, to: u64) -> PoolResult<Vec<RawBlock>>;
    async fn unlock_round(&self, round: &Round) -> PoolResult<RoundUnlock>;
}

pub struct Chain {
    pub config: ChainConfig,
    pub mining: Option<Arc<dyn MiningNode>>,
    pub payout: Option<Arc<dyn PayoutNode>>,
}

impl Chain {
    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn mining_node(&self) -> PoolResult<&Arc<dyn MiningNode>> {
        self.mining
            .as_ref()
            .ok_or_else(|| PoolError::NotFound(format!("{}: no mining node", self.config.id)))
    }

    pub fn payout_node(&self) -> PoolResult<&Arc<dyn PayoutNode>> {
        self.payout
            .as_ref()
            .ok_or_else(|| PoolError::NotFound(format!("{}: no payout node", self.config.id)))
    }

    pub fn adjusted_share_difficulty(&self) -> f64 {
        match &self.mining {
            Some(node) => node.share_difficulty(self.config.hashrate_factor),
            None => self.config.share_difficulty * self.config.hashrate_factor,
        }
    }
}

#[derive(Default)]
pub struct ChainRegistry {
    chains: BTreeMap<String, Arc<Chain>>,
}

impl ChainRegistry {
    pub fn new(chains: Vec<Chain>) -> Self {
        ChainRegistry {
            chains: chains
                .into_iter()
                .map(|c| (c.config.id.clone(), Arc::new(c)))
                .collect(),
        }
    }

    pub fn get(&self, id: &str) -> PoolResult<&Arc<Chain>> {
        self.chains
            .get(id)
            .ok_or_else(|| PoolError::NotFound(format!("chain {}", id)))
    }

    pub fn units(&self, id: &str) -> PoolResult<u32> {
        Ok(self.get(id)?.config.units)
    }

    pub fn mineable(&self) -> impl Iterator<Item = &Arc<Chain>> {
        self.chains.values().filter(|c| c.config.mineable)
    }

    pub fn payable(&self) -> impl Iterator<Item = &Arc<Chain>> {
        self.chains.values().filter(|c| c.config.payable)
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<Chain>> {
        self.chains.values()
    }
}
