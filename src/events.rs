//! ERC-721 Transfer event decoding
//!
//! Picks the `Transfer(from, to, tokenId)` logs out of a contract's raw log
//! stream. Other events (Approval, ApprovalForAll, ...) are ignored, and
//! logs the node marked as removed are dropped.

use crate::types::Log;
use alloy_primitives::{Address, B256, U256};
use anyhow::Result;
use tracing::warn;

/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: B256 = B256::new([
    0xdd, 0xf2, 0x52, 0xad, 0x1b, 0xe2, 0xc8, 0x9b, 0x69, 0xc2, 0xb0, 0x68, 0xfc, 0x37, 0x8d,
    0xaa, 0x95, 0x2b, 0xa7, 0xf1, 0x63, 0xc4, 0xa1, 0x16, 0x28, 0xf5, 0x5a, 0x4d, 0xf5, 0x23,
    0xb3, 0xef,
]);

/// Decoded NFT transfer, before its block timestamp is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub token_id: U256,
    pub from: Address,
    pub to: Address,
    pub tx_hash: B256,
    pub log_index: u64,
    pub block_number: u64,
}

/// Decode a single log.
///
/// Returns `Ok(None)` for logs that are not a Transfer. ERC-721 indexes all
/// three parameters, so a Transfer must carry exactly four topics; the
/// three-topic ERC-20 form is rejected.
pub fn decode_transfer(log: &Log) -> Result<Option<TransferEvent>> {
    if log.topics.first() != Some(&TRANSFER_TOPIC) {
        return Ok(None);
    }
    if log.topics.len() != 4 {
        anyhow::bail!(
            "Transfer log has {} topics, expected 4 (tx {:?})",
            log.topics.len(),
            log.transaction_hash
        );
    }
    Ok(Some(TransferEvent {
        from: address_from_topic(&log.topics[1]),
        to: address_from_topic(&log.topics[2]),
        token_id: U256::from_be_slice(log.topics[3].as_slice()),
        tx_hash: log.transaction_hash,
        log_index: log.log_index,
        block_number: log.block_number,
    }))
}

/// Transfers emitted by `contract`, in log order.
pub fn transfer_events(logs: &[Log], contract: Address) -> Vec<TransferEvent> {
    let mut events = Vec::new();
    for log in logs {
        if log.removed || log.address != contract {
            continue;
        }
        match decode_transfer(log) {
            Ok(Some(event)) => events.push(event),
            Ok(None) => {}
            Err(e) => warn!("Skipping malformed Transfer log: {:#}", e),
        }
    }
    events
}

/// An indexed address topic is the address left-padded to 32 bytes.
fn address_from_topic(topic: &B256) -> Address {
    Address::from_slice(&topic[12..])
}


#[cfg(test)]
mod tests {
    use super::fixtures::transfer_log;
    use super::*;
    use alloy_primitives::address;

    fn contract() -> Address {
        address!("5af0d9827e0c53e4799bb226655a1de152a425a5")
    }

    #[test]
    fn test_transfer_topic() {
        assert_eq!(
            format!("{:x}", TRANSFER_TOPIC),
            "ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn test_decode_mint() {
        let to = address!("70997970c51812dc3a010c7d01b50e0d17dc79c8");
        let log = transfer_log(contract(), Address::ZERO, to, 77, 1_000, 4);

        let event = decode_transfer(&log).unwrap().unwrap();
        assert_eq!(event.from, Address::ZERO);
        assert_eq!(event.to, to);
        assert_eq!(event.token_id, U256::from(77u64));
        assert_eq!(event.block_number, 1_000);
        assert_eq!(event.log_index, 4);
    }

    #[test]
    fn test_other_events_ignored() {
        let mut log = transfer_log(contract(), Address::ZERO, Address::ZERO, 1, 1, 0);
        log.topics[0] = B256::repeat_byte(0x8c); // Approval-like signature
        assert!(decode_transfer(&log).unwrap().is_none());
    }

    #[test]
    fn test_erc20_shape_rejected() {
        let mut log = transfer_log(contract(), Address::ZERO, Address::ZERO, 1, 1, 0);
        log.topics.truncate(3);
        assert!(decode_transfer(&log).is_err());
    }

    #[test]
    fn test_transfer_events_filters_removed_and_foreign_logs() {
        let to = address!("70997970c51812dc3a010c7d01b50e0d17dc79c8");
        let foreign = address!("dac17f958d2ee523a2206206994597c13d831ec7");

        let kept = transfer_log(contract(), Address::ZERO, to, 1, 10, 0);
        let mut removed = transfer_log(contract(), Address::ZERO, to, 2, 10, 1);
        removed.removed = true;
        let other_contract = transfer_log(foreign, Address::ZERO, to, 3, 10, 2);
        let mut malformed = transfer_log(contract(), Address::ZERO, to, 4, 10, 3);
        malformed.topics.truncate(3);

        let events = transfer_events(&[kept, removed, other_contract, malformed], contract());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token_id, U256::from(1u64));
    }
}
