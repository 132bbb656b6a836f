//! Key encoding and decoding utilities
//!
//! Store keys use a single-byte prefix followed by big-endian binary data,
//! so RocksDB's lexicographic order matches numeric order. The balance cache
//! is the exception: it uses the textual `balance:<block>` key.

use crate::records::encode_u256;
use alloy_primitives::{Address, B256, U256};
use anyhow::Result;

/// Meta id holding the next transfer row id.
pub const META_NEXT_TRANSFER_ID: u8 = 0x01;

/// Encode a transfer key.
///
/// Format: byte 'T' (0x54) + token_id (32 bytes) + block_number (8 bytes) + log_index (8 bytes)
/// Total length: 49 bytes
///
/// Keys for one token are contiguous and ordered by (block, log_index).
pub fn encode_transfer_key(token_id: U256, block: u64, log_index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(49);
    key.push(b'T');
    key.extend_from_slice(&encode_u256(token_id));
    key.extend_from_slice(&block.to_be_bytes());
    key.extend_from_slice(&log_index.to_be_bytes());
    key
}

/// Encode a transfer identity key.
///
/// Format: byte 'X' (0x58) + tx_hash (32 bytes) + log_index (8 bytes)
/// Total length: 41 bytes
pub fn encode_transfer_id_key(tx_hash: B256, log_index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(41);
    key.push(b'X');
    key.extend_from_slice(tx_hash.as_slice());
    key.extend_from_slice(&log_index.to_be_bytes());
    key
}

/// Encode a checkpoint key.
///
/// Format: byte 'L' (0x4C) + contract address (20 bytes)
/// Total length: 21 bytes
pub fn encode_checkpoint_key(contract: Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(21);
    key.push(b'L');
    key.extend_from_slice(contract.as_slice());
    key
}

/// Encode a block timestamp index key.
///
/// Format: byte 'Z' (0x5A) + timestamp_ms (8 bytes) + block_number (8 bytes)
/// Total length: 17 bytes
///
/// Ordered by timestamp first, so the index behaves like a sorted set
/// scored by timestamp.
pub fn encode_timestamp_key(timestamp_ms: u64, block: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.push(b'Z');
    key.extend_from_slice(&timestamp_ms.to_be_bytes());
    key.extend_from_slice(&block.to_be_bytes());
    key
}

/// Decode a block timestamp index key into (timestamp_ms, block_number).
pub fn decode_timestamp_key(key: &[u8]) -> Result<(u64, u64)> {
    if key.len() != 17 || key[0] != b'Z' {
        anyhow::bail!("Invalid timestamp key (len {})", key.len());
    }
    let timestamp_ms = u64::from_be_bytes(key[1..9].try_into()?);
    let block = u64::from_be_bytes(key[9..17].try_into()?);
    Ok((timestamp_ms, block))
}

/// Encode a balance cache key: `balance:<block_number>`.
pub fn encode_balance_cache_key(block: u64) -> Vec<u8> {
    format!("balance:{}", block).into_bytes()
}

/// Encode a meta key.
///
/// Format: byte 'M' (0x4D) + meta_id (1 byte)
/// Total length: 2 bytes
pub fn encode_meta_key(meta_id: u8) -> Vec<u8> {
    vec![b'M', meta_id]
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    #[test]
    fn test_transfer_key_layout() {
        let key = encode_transfer_key(U256::from(42u64), 1_000, 7);
        assert_eq!(key.len(), 49);
        assert_eq!(key[0], b'T');
        assert_eq!(&key[1..33], &encode_u256(U256::from(42u64))[..]);
        assert_eq!(&key[33..41], &1_000u64.to_be_bytes()[..]);
        assert_eq!(&key[41..49], &7u64.to_be_bytes()[..]);
    }

    #[test]
    fn test_transfer_keys_group_by_token() {
        // A later block of a smaller token sorts before any block of a bigger token
        let a = encode_transfer_key(U256::from(1u64), 900, 0);
        let b = encode_transfer_key(U256::from(2u64), 10, 0);
        let c = encode_transfer_key(U256::from(2u64), 10, 1);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_transfer_id_key_encoding() {
        let hash = B256::repeat_byte(0x11);
        let key = encode_transfer_id_key(hash, 5);
        assert_eq!(key.len(), 41);
        assert_eq!(key[0], b'X');
        assert_eq!(&key[1..33], hash.as_slice());
    }

    #[test]
    fn test_checkpoint_key_encoding() {
        let contract = address!("5af0d9827e0c53e4799bb226655a1de152a425a5");
        let key = encode_checkpoint_key(contract);
        assert_eq!(key.len(), 21);
        assert_eq!(key[0], b'L');
        assert_eq!(&key[1..], contract.as_slice());
    }

    #[test]
    fn test_timestamp_key_orders_by_timestamp() {
        let early = encode_timestamp_key(1_000, 500);
        let late = encode_timestamp_key(2_000, 10);
        assert!(early < late);
        assert_eq!(decode_timestamp_key(&late).unwrap(), (2_000, 10));
    }

    #[test]
    fn test_balance_cache_key() {
        assert_eq!(encode_balance_cache_key(18_000_000), b"balance:18000000".to_vec());
    }

    #[test]
    fn test_meta_key_encoding() {
        let key = encode_meta_key(META_NEXT_TRANSFER_ID);
        assert_eq!(key, vec![b'M', 0x01]);
    }
}
