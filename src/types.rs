//! Ethereum JSON-RPC types
//!
//! Type definitions for event logs and block headers returned from
//! Ethereum JSON-RPC endpoints, plus the hex helpers used to decode them.

use alloy_primitives::{Address, B256, U256};
use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};

/// Log entry returned by `eth_getLogs`.
#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    /// Address of the contract that emitted the log
    #[serde(rename = "address", deserialize_with = "deserialize_hex_address")]
    pub address: Address,

    /// Indexed topics (topic0 = event signature, topics[1..] = indexed params)
    #[serde(rename = "topics", default, deserialize_with = "deserialize_hex_topics")]
    pub topics: Vec<B256>,

    /// Block the log was mined in (hex string in JSON)
    #[serde(rename = "blockNumber", deserialize_with = "deserialize_hex_u64")]
    pub block_number: u64,

    /// Hash of the emitting transaction (hex string in JSON)
    #[serde(rename = "transactionHash", deserialize_with = "deserialize_hex_b256")]
    pub transaction_hash: B256,

    /// Position of the log inside its block (hex string in JSON)
    #[serde(rename = "logIndex", deserialize_with = "deserialize_hex_u64")]
    pub log_index: u64,

    /// Set by the node when the log was dropped by a reorganization
    #[serde(rename = "removed", default)]
    pub removed: bool,
}

/// Block header subset returned by `eth_getBlockByNumber(.., false)`.
///
/// Only the timestamp is kept; other fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockHeader {
    /// Block timestamp in Unix epoch seconds (hex string in JSON)
    #[serde(rename = "timestamp", deserialize_with = "deserialize_hex_u64")]
    pub timestamp: u64,
}

// Hex parsing helpers

/// Pad an odd-length hex string with a leading zero.
/// This handles cases where RPC returns hex strings without leading zeros.
pub(crate) fn pad_hex_string(s: &str) -> String {
    if s.is_empty() {
        return s.to_string();
    }
    if s.len() % 2 == 1 {
        format!("0{}", s)
    } else {
        s.to_string()
    }
}

/// Parse a quantity such as `"0x1b4"` into a u64.
pub fn parse_hex_u64(s: &str) -> Result<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        anyhow::bail!("Hex quantity is empty");
    }
    u64::from_str_radix(s, 16).with_context(|| format!("Invalid hex quantity: {}", s))
}

/// Parse a quantity such as `"0xde0b6b3a7640000"` into a U256.
///
/// An empty quantity (`"0x"`) is read as zero.
pub fn parse_hex_u256(s: &str) -> Result<U256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Ok(U256::ZERO);
    }
    let s = pad_hex_string(s);
    let bytes = hex::decode(&s).with_context(|| format!("Invalid hex U256: {}", s))?;
    if bytes.len() > 32 {
        anyhow::bail!("U256 value too large (max 32 bytes), got {} bytes", bytes.len());
    }
    Ok(U256::from_be_slice(&bytes))
}

fn parse_hex_b256(s: &str) -> Result<B256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let s = pad_hex_string(s);
    let bytes = hex::decode(&s).with_context(|| format!("Invalid hex hash: {}", s))?;
    if bytes.len() != 32 {
        anyhow::bail!("Expected 32 bytes for hash, got {}", bytes.len());
    }
    Ok(B256::from_slice(&bytes))
}

/// Deserialize a hex string to u64.
fn deserialize_hex_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_hex_u64(&s).map_err(serde::de::Error::custom)
}

/// Deserialize a hex string to B256.
fn deserialize_hex_b256<'de, D>(deserializer: D) -> Result<B256, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_hex_b256(&s).map_err(serde::de::Error::custom)
}

/// Deserialize a list of hex topics to B256 values.
fn deserialize_hex_topics<'de, D>(deserializer: D) -> Result<Vec<B256>, D::Error>
where
    D: Deserializer<'de>,
{
    let topics = Vec::<String>::deserialize(deserializer)?;
    topics
        .iter()
        .map(|t| parse_hex_b256(t).map_err(serde::de::Error::custom))
        .collect()
}

/// Deserialize a hex string to Address.
fn deserialize_hex_address<'de, D>(deserializer: D) -> Result<Address, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let s = s.strip_prefix("0x").unwrap_or(&s);
    let s = pad_hex_string(s);
    let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
    if bytes.len() != 20 {
        return Err(serde::de::Error::custom(format!(
            "Expected 20 bytes for address, got {}",
            bytes.len()
        )));
    }
    Ok(Address::from_slice(&bytes))
}
