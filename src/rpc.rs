use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::RPC_TIMEOUT_SECS;
use crate::error::RpcError;

/// Thin JSON-RPC client over a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    url: String,
}

impl RpcClient {
    pub fn new(url: impl Into<String>) -> Result<Self, RpcError> {
        Self::with_timeout(url, Duration::from_secs(RPC_TIMEOUT_SECS))
    }

    /// `timeout` bounds each request end to end, so a stalled node surfaces as
    /// a transport error instead of hanging the caller.
    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    /// Builds a client and proves the node answers before handing it out.
    pub async fn connect(url: impl Into<String>) -> Result<Self, RpcError> {
        let client = Self::new(url)?;
        info!(endpoint = %client.url, "Starting RPC client");

        let version = client.call("web3_clientVersion", json!([])).await?;
        let chain_id = client.quantity("eth_chainId", json!([])).await?;
        info!(
            endpoint = %client.url,
            client_version = %version.as_str().unwrap_or("unknown"),
            chain_id,
            "Connected to Ethereum node"
        );

        Ok(client)
    }

    pub async fn call(&self, method: &'static str, params: Value) -> Result<Value, RpcError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        debug!(method, "rpc call");
        let resp: Value = self
            .http
            .post(&self.url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(err) = resp.get("error") {
            return Err(RpcError::Remote(err.to_string()));
        }

        resp.get("result").cloned().ok_or(RpcError::MissingResult)
    }

    /// Calls a method whose result is a hex quantity.
    pub async fn quantity(&self, method: &'static str, params: Value) -> Result<u64, RpcError> {
        let value = self.call(method, params).await?;
        let hex = value.as_str().ok_or_else(|| RpcError::UnexpectedResult {
            method,
            detail: format!("expected a hex string, got {value}"),
        })?;
        hex_to_u64(hex)
    }

    pub async fn block_number(&self) -> Result<u64, RpcError> {
        self.quantity("eth_blockNumber", json!([])).await
    }

    /// `eth_getLogs` over `[from, to]` for one or more contract addresses.
    pub async fn logs(&self, addresses: &[String], from: u64, to: u64) -> Result<Vec<Value>, RpcError> {
        let value = self
            .call(
                "eth_getLogs",
                json!([{
                    "fromBlock": format!("0x{from:x}"),
                    "toBlock": format!("0x{to:x}"),
                    "address": addresses,
                }]),
            )
            .await?;

        match value {
            Value::Array(logs) => Ok(logs),
            other => Err(RpcError::UnexpectedResult {
                method: "eth_getLogs",
                detail: format!("expected an array, got {other}"),
            }),
        }
    }
}

// Example: 0x10 -> 16
pub fn hex_to_u64(s: &str) -> Result<u64, RpcError> {
    let trimmed = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(trimmed, 16).map_err(|_| RpcError::InvalidQuantity(s.to_string()))
}
