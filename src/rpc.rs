//! JSON-RPC client for Ethereum nodes
//!
//! Provides a typed interface to Ethereum JSON-RPC endpoints.
//! Handles hex string parsing and maps provider refusals onto [`ChainError`].

use crate::chain::{ChainClient, ChainError};
use crate::types::{parse_hex_u256, parse_hex_u64, BlockHeader, Log};
use alloy_primitives::{Address, U256};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

/// Provider messages that mean "narrow the block range".
const TOO_LARGE_MARKERS: &[&str] = &[
    "more than 10000 results",
    "query returned more than",
    "response size exceeded",
    "too many results",
];

/// JSON-RPC client for Ethereum nodes.
pub struct RpcClient {
    client: reqwest::Client,
    url: String,
}

impl RpcClient {
    /// Create a new RPC client. Every request is bounded by `timeout`.
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, url })
    }

    /// Make a JSON-RPC call.
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params
        });

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", method))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read RPC response")?;
        let json: Value = serde_json::from_str(&body)
            .with_context(|| format!("Failed to parse RPC response (HTTP {})", status))?;

        // Check for RPC error
        if let Some(error) = json.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(classify_rpc_error(code, message).into());
        }

        // Extract result
        json.get("result")
            .cloned()
            .context("RPC response missing 'result' field")
    }

    /// Get the current head block number.
    pub async fn get_block_number(&self) -> Result<u64> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        let number = result
            .as_str()
            .context("Block number response is not a string")?;
        parse_hex_u64(number).context("Failed to parse block number")
    }

    /// Get all logs emitted by `contract` between two blocks (inclusive).
    pub async fn get_logs(&self, contract: Address, from_block: u64, to_block: u64) -> Result<Vec<Log>> {
        let params = json!([{
            "address": format!("0x{:x}", contract),
            "fromBlock": block_tag(from_block),
            "toBlock": block_tag(to_block),
        }]);
        let result = self.call("eth_getLogs", params).await?;
        serde_json::from_value(result).context("Failed to deserialize logs")
    }

    /// Get the balance of an address at a specific block.
    pub async fn get_balance(&self, address: Address, block: u64) -> Result<U256> {
        let addr_str = format!("0x{:x}", address);
        let params = json!([addr_str, block_tag(block)]);
        let result = self.call("eth_getBalance", params).await?;

        let balance_str = result
            .as_str()
            .context("Balance response is not a string")?;

        tracing::debug!("RPC get_balance({:?}, {}) returned raw: {}", address, block, balance_str);
        parse_hex_u256(balance_str).context("Failed to decode balance hex")
    }

    /// Get a block header (without transactions).
    pub async fn get_block_header(&self, block: u64) -> Result<BlockHeader> {
        let params = json!([block_tag(block), false]);
        let result = self.call("eth_getBlockByNumber", params).await?;
        if result.is_null() {
            anyhow::bail!("Block {} not found", block);
        }
        serde_json::from_value(result).context("Failed to deserialize block header")
    }
}

#[async_trait]
impl ChainClient for RpcClient {
    async fn head_block_number(&self) -> Result<u64> {
        self.get_block_number().await
    }

    async fn get_events(&self, contract: Address, from_block: u64, to_block: u64) -> Result<Vec<Log>> {
        self.get_logs(contract, from_block, to_block).await
    }

    async fn get_balance(&self, address: Address, block: u64) -> Result<U256> {
        RpcClient::get_balance(self, address, block).await
    }

    async fn get_block_timestamp(&self, block: u64) -> Result<u64> {
        let header = self.get_block_header(block).await?;
        header
            .timestamp
            .checked_mul(1000)
            .with_context(|| format!("Timestamp overflow for block {}", block))
    }
}

/// Hex block tag as expected by JSON-RPC (`0x` + lowercase hex, no padding).
fn block_tag(block: u64) -> String {
    format!("0x{:x}", block)
}

fn classify_rpc_error(code: i64, message: String) -> ChainError {
    let lower = message.to_lowercase();
    if TOO_LARGE_MARKERS.iter().any(|marker| lower.contains(marker)) {
        ChainError::ResultSetTooLarge(message)
    } else {
        ChainError::Rpc { code, message }
    }
}
