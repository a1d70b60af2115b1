//! Minimal JSON-RPC client for the watcher and the balance monitor.
//!
//! Only the four methods the pipeline consumes: eth_blockNumber, eth_getLogs,
//! eth_getBalance and eth_call for ERC-20 balanceOf.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use num_bigint::BigUint;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const RPC_TIMEOUT_SECS: u64 = 20;

/// One raw log entry as returned by eth_getLogs.
#[derive(Debug, Clone, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    #[serde(rename = "transactionHash")]
    pub transaction_hash: String,
    #[serde(rename = "logIndex")]
    pub log_index: String,
}

impl RawLog {
    pub fn block_number_u64(&self) -> Option<u64> {
        parse_hex_u64(&self.block_number)
    }

    pub fn log_index_u64(&self) -> Option<u64> {
        parse_hex_u64(&self.log_index)
    }
}

pub fn parse_hex_u64(raw: &str) -> Option<u64> {
    let trimmed = raw.trim().trim_start_matches("0x");
    if trimmed.is_empty() {
        return None;
    }
    u64::from_str_radix(trimmed, 16).ok()
}

/// Chain access behind a trait so the watcher loop is testable with a fake.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn block_number(&self) -> Result<u64>;

    async fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        addresses: &[String],
        topic0: &str,
    ) -> Result<Vec<RawLog>>;

    /// Native balance in whole coins (POL on Polygon).
    async fn native_balance(&self, address: &str) -> Result<f64>;

    /// Raw ERC-20 balanceOf in token base units.
    async fn erc20_balance(&self, token_address: &str, wallet_address: &str) -> Result<BigUint>;
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
}

pub struct HttpRpc {
    client: Client,
    rpc_url: String,
}

impl HttpRpc {
    pub fn new(rpc_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(RPC_TIMEOUT_SECS))
            .build()
            .context("build rpc http client")?;
        Ok(Self { client, rpc_url })
    }

    async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let resp = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("rpc {method} send"))?;
        if !resp.status().is_success() {
            bail!("rpc {method} http status {}", resp.status());
        }
        let rpc: RpcResponse = resp
            .json()
            .await
            .with_context(|| format!("rpc {method} decode"))?;
        if let Some(error) = rpc.error {
            bail!("rpc {method} error: {error}");
        }
        rpc.result
            .ok_or_else(|| anyhow!("rpc {method} returned no result"))
    }
}

#[async_trait]
impl ChainRpc for HttpRpc {
    async fn block_number(&self) -> Result<u64> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        let raw = result
            .as_str()
            .ok_or_else(|| anyhow!("eth_blockNumber returned non-string"))?;
        parse_hex_u64(raw).ok_or_else(|| anyhow!("eth_blockNumber bad hex: {raw}"))
    }

    async fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        addresses: &[String],
        topic0: &str,
    ) -> Result<Vec<RawLog>> {
        let result = self
            .call(
                "eth_getLogs",
                json!([{
                    "fromBlock": format!("0x{from_block:x}"),
                    "toBlock": format!("0x{to_block:x}"),
                    "address": addresses,
                    "topics": [topic0],
                }]),
            )
            .await?;
        let logs: Vec<RawLog> =
            serde_json::from_value(result).context("eth_getLogs decode entries")?;
        Ok(logs)
    }

    async fn native_balance(&self, address: &str) -> Result<f64> {
        let result = self
            .call("eth_getBalance", json!([address, "latest"]))
            .await?;
        let raw = result
            .as_str()
            .ok_or_else(|| anyhow!("eth_getBalance returned non-string"))?;
        let wei = BigUint::parse_bytes(raw.trim_start_matches("0x").as_bytes(), 16)
            .unwrap_or_else(|| BigUint::from(0u32));
        // f64 is fine here: balances feed a monitoring threshold, not an order.
        Ok(biguint_to_f64(&wei) / 1e18)
    }

    async fn erc20_balance(&self, token_address: &str, wallet_address: &str) -> Result<BigUint> {
        let wallet = wallet_address
            .trim()
            .trim_start_matches("0x")
            .to_ascii_lowercase();
        if wallet.len() != 40 {
            bail!("bad wallet address for balanceOf: {wallet_address}");
        }
        // balanceOf(address) selector 0x70a08231, argument left-padded to 32 bytes.
        let data = format!("0x70a08231{wallet:0>64}");
        let result = self
            .call("eth_call", json!([{ "to": token_address, "data": data }, "latest"]))
            .await?;
        let raw = result
            .as_str()
            .ok_or_else(|| anyhow!("eth_call returned non-string"))?;
        Ok(
            BigUint::parse_bytes(raw.trim().trim_start_matches("0x").as_bytes(), 16)
                .unwrap_or_else(|| BigUint::from(0u32)),
        )
    }
}

pub fn biguint_to_f64(value: &BigUint) -> f64 {
    value.to_str_radix(10).parse::<f64>().unwrap_or(0.0)
}

/// Providers phrase over-wide getLogs rejections differently; match the
/// common shapes so the watcher can rewind instead of stalling.
pub fn is_range_too_large_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("block range")
        || lower.contains("range too large")
        || lower.contains("query returned more than")
        || lower.contains("too many results")
        || lower.contains("log limit")
}
