//! Node adapter speaking to a per-chain gateway over JSON-RPC.
//!
//! Chain codecs (address formats, signing, proof-of-work verification) live
//! behind the gateway; this side only moves values and hex around.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::amount::Amount;
use crate::chains::{
    AccountingType, CreatedTx, MiningNode, NodeStatus, PayoutNode, RawBlock, RoundUnlock, TxInfo,
    TxInput, TxOutput,
};
use crate::config::ChainConfig;
use crate::error::PoolResult;
use crate::models::Round;
use crate::rpc::{Auth, JsonRpcClient};

pub struct RpcNode {
    chain: String,
    address: String,
    accounting: AccountingType,
    units: u32,
    immature_depth: u64,
    mature_depth: u64,
    share_difficulty: f64,
    merge_utxos: bool,
    client: JsonRpcClient,
}

impl RpcNode {
    pub fn new(config: &ChainConfig) -> PoolResult<Self> {
        let auth = match (&config.node_user, &config.node_pass) {
            (Some(user), Some(pass)) => Some(Auth::new(user.clone(), pass.clone())),
            _ => None,
        };
        let client = JsonRpcClient::new(
            config.node_urls.clone(),
            auth,
            Duration::from_secs(config.node_timeout_secs),
        )?;

        Ok(RpcNode {
            chain: config.id.clone(),
            address: config.pool_address.clone(),
            accounting: config.accounting,
            units: config.units,
            immature_depth: config.immature_depth,
            mature_depth: config.mature_depth,
            share_difficulty: config.share_difficulty,
            merge_utxos: config.merge_utxos,
            client,
        })
    }
}

#[async_trait]
impl PayoutNode for RpcNode {
    fn chain(&self) -> &str {
        &self.chain
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn accounting_type(&self) -> AccountingType {
        self.accounting
    }

    fn should_merge_utxos(&self) -> bool {
        self.merge_utxos && self.accounting == AccountingType::Utxo
    }

    fn units(&self) -> u32 {
        self.units
    }

    async fn get_status(&self) -> PoolResult<NodeStatus> {
        self.client.call("pool_getStatus", json!([])).await
    }

    async fn get_balance(&self) -> PoolResult<Amount> {
        self.client.call("pool_getBalance", json!([self.address])).await
    }

    async fn get_tx(&self, txid: &str) -> PoolResult<Option<TxInfo>> {
        self.client.call_optional("pool_getTx", json!([txid])).await
    }

    async fn create_tx(&self, inputs: &[TxInput], outputs: &[TxOutput]) -> PoolResult<CreatedTx> {
        self.client
            .call("pool_createTx", json!([inputs, outputs]))
            .await
    }

    async fn broadcast_tx(&self, tx_hex: &str) -> PoolResult<String> {
        self.client.call("pool_broadcastTx", json!([tx_hex])).await
    }
}

#[async_trait]
impl MiningNode for RpcNode {
    fn chain(&self) -> &str {
        &self.chain
    }

    fn immature_depth(&self) -> u64 {
        self.immature_depth
    }

    fn mature_depth(&self) -> u64 {
        self.mature_depth
    }

    fn share_difficulty(&self, factor: f64) -> f64 {
        self.share_difficulty * factor
    }

    fn calculate_hashrate(&self, block_time: f64, difficulty: f64) -> f64 {
        if block_time <= 0.0 {
            return 0.0;
        }
        difficulty / block_time
    }

    async fn get_status(&self) -> PoolResult<NodeStatus> {
        self.client.call("pool_getStatus", json!([])).await
    }

    async fn get_blocks(&self, from: u64, to: u64) -> PoolResult<Vec<RawBlock>> {
        self.client.call("pool_getBlocks", json!([from, to])).await
    }

    async fn unlock_round(&self, round: &Round) -> PoolResult<RoundUnlock> {
        self.client
            .call(
                "pool_unlockRound",
                json!([{
                    "height": round.height,
                    "hash": round.hash,
                    "nonce": round.nonce,
                    "epoch_height": round.epoch_height,
                }]),
            )
            .await
    }
}
