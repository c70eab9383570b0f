use std::time::Duration;

use base64::Engine;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{PoolError, PoolResult};

/// Error code the node gateways use for a transaction that does not fit.
pub const TX_TOO_BIG_CODE: i32 = -32010;
pub const NOT_FOUND_CODE: i32 = -32004;
pub const DUPLICATE_CODE: i32 = -32009;

#[derive(Clone, Debug)]
pub struct Auth {
    username: String,
    password: String,
}

impl Auth {
    pub fn new(username: String, password: String) -> Auth {
        Auth { username, password }
    }

    fn header(&self) -> String {
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", self.username, self.password))
        )
    }
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: serde_json::Value,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResult<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

impl From<JsonRpcError> for PoolError {
    fn from(e: JsonRpcError) -> Self {
        match e.code {
            TX_TOO_BIG_CODE => PoolError::TxTooBig,
            NOT_FOUND_CODE => PoolError::NotFound(e.message),
            DUPLICATE_CODE => PoolError::Duplicate(e.message),
            _ => PoolError::Transient(format!("rpc {}: {}", e.code, e.message)),
        }
    }
}

/// JSON-RPC 2.0 over HTTP with a list of fallback urls. Each call starts at
/// a random url; transport failures move on to the next one and an error
/// object from the server is final.
#[derive(Clone)]
pub struct JsonRpcClient {
    client: reqwest::Client,
    urls: Vec<String>,
    auth: Option<Auth>,
}

impl JsonRpcClient {
    pub fn new(urls: Vec<String>, auth: Option<Auth>, timeout: Duration) -> PoolResult<Self> {
        if urls.is_empty() {
            return Err(PoolError::invalid("no rpc urls"));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(JsonRpcClient { client, urls, auth })
    }

    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> PoolResult<T> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: 1,
        };

        let mut last_err = PoolError::transient("no rpc urls");
        let first = rand::thread_rng().gen_range(0..self.urls.len());
        for url in self.urls.iter().cycle().skip(first).take(self.urls.len()) {
            let mut req = self.client.post(url).json(&request);
            if let Some(auth) = &self.auth {
                req = req.header(reqwest::header::AUTHORIZATION, auth.header());
            }

            let resp = match req.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(target: "server_log", "rpc {} on {} failed: {}", method, url, e);
                    last_err = e.into();
                    continue;
                }
            };

            let status = resp.status();
            let body: JsonRpcResult<T> = match resp.json().await {
                Ok(body) => body,
                Err(e) => {
                    if status.is_server_error() {
                        last_err = PoolError::transient(format!("rpc {} on {}: {}", method, url, status));
                        continue;
                    }
                    return Err(e.into());
                }
            };

            if let Some(err) = body.error {
                return Err(err.into());
            }
            return body
                .result
                .ok_or_else(|| PoolError::NotFound(format!("rpc {}: empty result", method)));
        }
        Err(last_err)
    }

    /// Like [`call`](Self::call) but a null result is `None` instead of an
    /// error.
    pub async fn call_optional<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> PoolResult<Option<T>> {
        match self.call::<T>(method, params).await {
            Ok(v) => Ok(Some(v)),
            Err(PoolError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_error_codes() {
        let too_big = JsonRpcError {
            code: TX_TOO_BIG_CODE,
            message: "too many inputs".into(),
        };
        assert!(matches!(PoolError::from(too_big), PoolError::TxTooBig));

        let dup = JsonRpcError {
            code: DUPLICATE_CODE,
            message: "already in mempool".into(),
        };
        assert!(PoolError::from(dup).is_duplicate());

        let other = JsonRpcError {
            code: -1,
            message: "boom".into(),
        };
        assert!(matches!(PoolError::from(other), PoolError::Transient(_)));
    }

    #[test]
    fn basic_auth_header() {
        let auth = Auth::new("user".into(), "pass".into());
        assert_eq!(auth.header(), "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn refuses_empty_url_list() {
        assert!(JsonRpcClient::new(vec![], None, Duration::from_secs(1)).is_err());
    }
}
