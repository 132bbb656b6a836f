//! Record types for the transfer index
//!
//! These structs represent the data stored in the index store.
//! They use postcard for binary serialization, which is compact and deterministic.

use alloy_primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One NFT `Transfer` event, as persisted in the transfer log.
///
/// Row identity is `(tx_hash, log_index)`; `transfer_id` is assigned on insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Auto-incremented row id (0 until inserted)
    pub transfer_id: u64,
    pub token_id: U256,
    pub from: Address,
    pub to: Address,
    pub tx_hash: B256,
    /// Position of the event inside its block
    pub log_index: u64,
    pub block_number: u64,
    /// Block timestamp in milliseconds since the Unix epoch
    pub block_timestamp: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        token_id: U256,
        from: Address,
        to: Address,
        tx_hash: B256,
        log_index: u64,
        block_number: u64,
        block_timestamp: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            transfer_id: 0,
            token_id,
            from,
            to,
            tx_hash,
            log_index,
            block_number,
            block_timestamp,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-contract crawl cursor (the `latestBlock` row).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub contract_address: Address,
    /// Next block the crawler has not processed yet
    pub next_block: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(contract_address: Address, next_block: u64) -> Self {
        let now = Utc::now();
        Self {
            contract_address,
            next_block,
            created_at: now,
            updated_at: now,
        }
    }

    /// Highest block fully indexed, if any.
    pub fn latest_indexed_block(&self) -> Option<u64> {
        self.next_block.checked_sub(1)
    }
}

/// Entry of the block timestamp index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampEntry {
    pub block_number: u64,
    pub timestamp_ms: u64,
}

/// Owner address (checksummed hex) to ether-denominated balance.
pub type OwnerBalances = BTreeMap<String, String>;

/// Result of the balance lookup for one historical block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletEthBalance {
    pub block_number: u64,
    pub owners: OwnerBalances,
}

/// Encode a U256 value as a fixed 32-byte big-endian byte array.
///
/// Keeps token ids sortable inside store keys.
pub fn encode_u256(value: U256) -> [u8; 32] {
    value.to_be_bytes::<32>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    #[test]
    fn test_u256_encoding_is_ordered() {
        assert!(encode_u256(U256::from(2u64)) < encode_u256(U256::from(256u64)));
        assert_eq!(encode_u256(U256::ZERO), [0u8; 32]);
    }

    #[test]
    fn test_transfer_record_postcard_roundtrip() {
        let record = TransferRecord::new(
            U256::from(7u64),
            Address::ZERO,
            address!("70997970c51812dc3a010c7d01b50e0d17dc79c8"),
            B256::repeat_byte(0xab),
            3,
            120,
            1_600_000_000_000,
        );
        let bytes = postcard::to_allocvec(&record).unwrap();
        let decoded: TransferRecord = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_latest_indexed_block() {
        let contract = address!("5af0d9827e0c53e4799bb226655a1de152a425a5");
        assert_eq!(Checkpoint::new(contract, 0).latest_indexed_block(), None);
        assert_eq!(Checkpoint::new(contract, 101).latest_indexed_block(), Some(100));
    }

    #[test]
    fn test_wallet_eth_balance_json_shape() {
        let mut owners = OwnerBalances::new();
        owners.insert("0xabc".to_string(), "1.5".to_string());
        let result = WalletEthBalance {
            block_number: 42,
            owners,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["blockNumber"], 42);
        assert_eq!(json["owners"]["0xabc"], "1.5");
    }
}
