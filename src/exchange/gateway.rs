//! [`Exchange`] over the exchange gateway's JSON-RPC interface.
//!
//! Amounts go out as decimal strings in whole coins. Client ids ride along
//! as the last parameter of every call that moves funds.

use std::time::Duration;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use serde::Deserialize;
use serde_json::json;

use super::{DepositInfo, Exchange, TradeDirection, TradeInfo, TradeLeg, WalletStatus, WithdrawalInfo};
use crate::config::ExchangeConfig;
use crate::error::PoolResult;
use crate::rpc::{Auth, JsonRpcClient};

const GATEWAY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ExchangeGateway {
    id: String,
    client: JsonRpcClient,
}

#[derive(Deserialize)]
struct Created {
    id: String,
}

#[derive(Deserialize)]
struct Found {
    found: bool,
}

impl ExchangeGateway {
    pub fn new(config: &ExchangeConfig) -> PoolResult<Self> {
        let auth = match (&config.api_key, &config.api_secret) {
            (Some(key), Some(secret)) => Some(Auth::new(key.clone(), secret.clone())),
            _ => None,
        };
        Ok(ExchangeGateway {
            id: config.id.clone(),
            client: JsonRpcClient::new(vec![config.url.clone()], auth, GATEWAY_TIMEOUT)?,
        })
    }
}

#[async_trait]
impl Exchange for ExchangeGateway {
    fn id(&self) -> &str {
        &self.id
    }

    async fn get_deposit_address(&self, chain: &str) -> PoolResult<String> {
        self.client
            .call("exchange_getDepositAddress", json!([chain]))
            .await
    }

    async fn get_wallet_status(&self, chain: &str) -> PoolResult<WalletStatus> {
        self.client.call("exchange_getWalletStatus", json!([chain])).await
    }

    async fn get_deposit_by_txid(&self, chain: &str, txid: &str) -> PoolResult<Option<DepositInfo>> {
        self.client
            .call_optional("exchange_getDepositByTxid", json!([chain, txid]))
            .await
    }

    async fn get_deposit_by_id(&self, chain: &str, id: &str) -> PoolResult<Option<DepositInfo>> {
        self.client
            .call_optional("exchange_getDepositById", json!([chain, id]))
            .await
    }

    async fn transfer_to_trade_account(&self, chain: &str, amount: &BigDecimal, client_id: &str) -> PoolResult<()> {
        let _: serde_json::Value = self
            .client
            .call("exchange_transferToTrade", json!([chain, amount.to_string(), client_id]))
            .await?;
        Ok(())
    }

    async fn transfer_to_main_account(&self, chain: &str, amount: &BigDecimal, client_id: &str) -> PoolResult<()> {
        let _: serde_json::Value = self
            .client
            .call("exchange_transferToMain", json!([chain, amount.to_string(), client_id]))
            .await?;
        Ok(())
    }

    async fn find_transfer(&self, chain: &str, client_id: &str) -> PoolResult<bool> {
        let found: Option<Found> = self
            .client
            .call_optional("exchange_findTransfer", json!([chain, client_id]))
            .await?;
        Ok(found.map(|f| f.found).unwrap_or(false))
    }

    async fn generate_trade_path(&self, from_chain: &str, to_chain: &str) -> PoolResult<Vec<TradeLeg>> {
        self.client
            .call("exchange_generateTradePath", json!([from_chain, to_chain]))
            .await
    }

    async fn create_trade(
        &self,
        market: &str,
        direction: TradeDirection,
        quantity: &BigDecimal,
        client_id: &str,
    ) -> PoolResult<String> {
        let created: Created = self
            .client
            .call(
                "exchange_createTrade",
                json!([market, direction.as_str(), quantity.to_string(), client_id]),
            )
            .await?;
        Ok(created.id)
    }

    async fn find_trade(&self, market: &str, client_id: &str) -> PoolResult<Option<String>> {
        let found: Option<Created> = self
            .client
            .call_optional("exchange_findTrade", json!([market, client_id]))
            .await?;
        Ok(found.map(|c| c.id))
    }

    async fn get_trade(&self, market: &str, id: &str) -> PoolResult<Option<TradeInfo>> {
        self.client
            .call_optional("exchange_getTrade", json!([market, id]))
            .await
    }

    async fn create_withdrawal(
        &self,
        chain: &str,
        address: &str,
        amount: &BigDecimal,
        client_id: &str,
    ) -> PoolResult<String> {
        let created: Created = self
            .client
            .call(
                "exchange_createWithdrawal",
                json!([chain, address, amount.to_string(), client_id]),
            )
            .await?;
        Ok(created.id)
    }

    async fn find_withdrawal(&self, chain: &str, client_id: &str) -> PoolResult<Option<String>> {
        let found: Option<Created> = self
            .client
            .call_optional("exchange_findWithdrawal", json!([chain, client_id]))
            .await?;
        Ok(found.map(|c| c.id))
    }

    async fn get_withdrawal(&self, chain: &str, id: &str) -> PoolResult<Option<WithdrawalInfo>> {
        self.client
            .call_optional("exchange_getWithdrawal", json!([chain, id]))
            .await
    }
}
