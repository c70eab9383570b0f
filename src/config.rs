use std::{collections::HashMap, path::Path};

use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::chains::AccountingType;
use crate::error::{PoolError, PoolResult};

const DEFAULT_MAX_OUTPUTS_PER_TX: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub id: String,
    #[serde(default)]
    pub mineable: bool,
    #[serde(default)]
    pub switchable: bool,
    #[serde(default)]
    pub payable: bool,
    pub accounting: AccountingType,
    pub node_urls: Vec<String>,
    #[serde(default)]
    pub node_user: Option<String>,
    #[serde(default)]
    pub node_pass: Option<String>,
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,
    pub units: u32,
    pub share_difficulty: f64,
    #[serde(default = "default_factor")]
    pub hashrate_factor: f64,
    pub immature_depth: u64,
    pub mature_depth: u64,
    #[serde(default = "default_window")]
    pub pplns_window: usize,
    pub block_time_secs: f64,
    pub pool_address: String,
    #[serde(default)]
    pub min_payout: Amount,
    #[serde(default)]
    pub exchange_threshold: Amount,
    #[serde(default)]
    pub include_immature_in_wallet: bool,
    #[serde(default)]
    pub wallet_balance_adjustment: Amount,
    #[serde(default)]
    pub allow_remainder_output: bool,
    #[serde(default)]
    pub merge_utxos: bool,
    #[serde(default = "default_max_outputs")]
    pub max_outputs_per_tx: usize,
}

fn default_node_timeout() -> u64 {
    10
}

fn default_factor() -> f64 {
    1.0
}

fn default_window() -> usize {
    100_000
}

fn default_max_outputs() -> usize {
    DEFAULT_MAX_OUTPUTS_PER_TX
}

impl ChainConfig {
    pub fn load_all(path: &Path) -> PoolResult<Vec<ChainConfig>> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PoolError::invalid(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse_all(&raw)
    }

    pub fn parse_all(raw: &str) -> PoolResult<Vec<ChainConfig>> {
        let chains: Vec<ChainConfig> = serde_json::from_str(raw)?;
        let mut seen = HashMap::new();
        for chain in chains.iter() {
            if chain.node_urls.is_empty() {
                return Err(PoolError::invalid(format!("{}: no node urls", chain.id)));
            }
            if chain.mature_depth < chain.immature_depth {
                return Err(PoolError::invalid(format!(
                    "{}: mature depth below immature depth",
                    chain.id
                )));
            }
            if seen.insert(chain.id.clone(), ()).is_some() {
                return Err(PoolError::invalid(format!("{}: configured twice", chain.id)));
            }
        }
        Ok(chains)
    }
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub key: String,
    pub chat_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub id: String,
    pub url: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

pub struct Config {
    pub environment: String,
    pub database_url: String,
    pub database_read_url: String,
    pub chart_database_url: String,
    pub redis_url: String,
    pub redis_read_url: String,
    pub telegram: TelegramConfig,
    pub exchange: Option<ExchangeConfig>,
    pub pool_fee_percent: f64,
}

fn env(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{} must be set.", name))
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Reads the process configuration from the environment. Missing
    /// required variables are fatal.
    pub fn from_env(pool_fee_percent: f64) -> Config {
        let environment = env("ENVIRONMENT");
        let db_user = env("DB_USER");
        let db_pass = env("DB_PASS");
        let db_port = env_or("DB_PORT", "3306");
        let db_name = env("DB_NAME");
        let chart_db_name = env_or("CHART_DB_NAME", &format!("{}_chart", db_name));
        let db_write_host = env("DB_WRITE_HOST");
        let db_read_host = env_or("DB_READ_HOST", &db_write_host);

        let redis_port = env_or("REDIS_PORT", "6379");
        let redis_write_host = env("REDIS_WRITE_HOST");
        let redis_read_host = env_or("REDIS_READ_HOST", &redis_write_host);

        let mysql_url = |host: &str, name: &str| {
            format!("mysql://{}:{}@{}:{}/{}", db_user, db_pass, host, db_port, name)
        };

        let telegram = TelegramConfig {
            enabled: env_or("TELEGRAM_ENABLED", "false") == "true",
            key: env_or("TELEGRAM_KEY", ""),
            chat_ids: env_or("TELEGRAM_CHAT_IDS", "")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        };

        let exchange = std::env::var("EXCHANGE_URL").ok().map(|url| ExchangeConfig {
            id: env_or("EXCHANGE_ID", "gateway"),
            url,
            api_key: std::env::var("EXCHANGE_API_KEY").ok(),
            api_secret: std::env::var("EXCHANGE_API_SECRET").ok(),
        });

        Config {
            database_url: mysql_url(&db_write_host, &db_name),
            database_read_url: mysql_url(&db_read_host, &db_name),
            chart_database_url: mysql_url(&db_write_host, &chart_db_name),
            redis_url: format!("redis://{}:{}", redis_write_host, redis_port),
            redis_read_url: format!("redis://{}:{}", redis_read_host, redis_port),
            environment,
            telegram,
            exchange,
            pool_fee_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAINS: &str = r#"[
        {
            "id": "ETC",
            "mineable": true,
            "payable": true,
            "accounting": "account",
            "node_urls": ["http://etc-node:8545"],
            "units": 18,
            "share_difficulty": 4294967296.0,
            "immature_depth": 8,
            "mature_depth": 240,
            "block_time_secs": 13.0,
            "pool_address": "0xpool",
            "min_payout": "100000000000000000",
            "wallet_balance_adjustment": "0"
        },
        {
            "id": "KAS",
            "mineable": true,
            "payable": true,
            "accounting": "utxo",
            "node_urls": ["http://kas-node:16110"],
            "units": 8,
            "share_difficulty": 1.0,
            "immature_depth": 10,
            "mature_depth": 100,
            "block_time_secs": 1.0,
            "pool_address": "kaspa:pool",
            "allow_remainder_output": true,
            "wallet_balance_adjustment": 1500
        }
    ]"#;

    #[test]
    fn parses_chain_configs() {
        let chains = ChainConfig::parse_all(CHAINS).unwrap();
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[0].accounting, AccountingType::Account);
        assert_eq!(chains[0].pplns_window, 100_000);
        assert_eq!(chains[0].max_outputs_per_tx, DEFAULT_MAX_OUTPUTS_PER_TX);
        assert_eq!(chains[1].accounting, AccountingType::Utxo);
        assert_eq!(chains[1].wallet_balance_adjustment, Amount::from(1500u64));
        assert!(chains[1].allow_remainder_output);
        assert!(!chains[0].allow_remainder_output);
    }

    #[test]
    fn rejects_inverted_depths() {
        let raw = CHAINS.replace("\"mature_depth\": 240", "\"mature_depth\": 2");
        assert!(ChainConfig::parse_all(&raw).is_err());
    }

    #[test]
    fn rejects_duplicate_chain_ids() {
        let raw = CHAINS.replace("\"id\": \"KAS\"", "\"id\": \"ETC\"");
        assert!(ChainConfig::parse_all(&raw).is_err());
    }
}
