//! Chain access seam
//!
//! Every engine talks to the chain through [`ChainClient`]. A single
//! long-lived implementation is built at startup and shared via `Arc`.

use crate::types::Log;
use alloy_primitives::{Address, U256};
use anyhow::Result;
use async_trait::async_trait;

/// Chain-level failures callers need to branch on.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// The provider refused a log query because the result set is too large.
    #[error("result set too large: {0}")]
    ResultSetTooLarge(String),
    /// The node answered with a JSON-RPC error object.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
}

/// Read access to the chain.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current head block number.
    async fn head_block_number(&self) -> Result<u64>;

    /// All logs emitted by `contract` in the inclusive range `[from_block, to_block]`.
    ///
    /// Fails with [`ChainError::ResultSetTooLarge`] when the provider caps the range.
    async fn get_events(&self, contract: Address, from_block: u64, to_block: u64)
        -> Result<Vec<Log>>;

    /// Balance of `address` in wei as of `block`.
    async fn get_balance(&self, address: Address, block: u64) -> Result<U256>;

    /// Timestamp of `block` in milliseconds since the Unix epoch.
    async fn get_block_timestamp(&self, block: u64) -> Result<u64>;
}

/// Whether `err` (or anything it wraps) is a result-set-too-large refusal.
pub fn is_result_set_too_large(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<ChainError>(),
            Some(ChainError::ResultSetTooLarge(_))
        )
    })
}

/// Whether `err` never reached the node (connection, timeout, unreadable body).
///
/// Anything the node answered carries a [`ChainError`] somewhere in its chain.
pub fn is_transport_error(err: &anyhow::Error) -> bool {
    !err.chain().any(|cause| cause.downcast_ref::<ChainError>().is_some())
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted in-memory chain used by the engine tests.

    use super::*;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::Mutex;

    /// Failure injected into the next `get_events` call.
    #[derive(Debug, Clone, Copy)]
    pub enum EventFailure {
        TooLarge,
        Transient,
    }

    pub const GENESIS_TIMESTAMP_MS: u64 = 1_600_000_000_000;

    #[derive(Default)]
    pub struct MockChain {
        pub head: Mutex<u64>,
        pub head_script: Mutex<VecDeque<u64>>,
        pub logs: Mutex<Vec<Log>>,
        pub event_failures: Mutex<VecDeque<EventFailure>>,
        /// Refuse any range wider than this many blocks.
        pub max_event_range: Mutex<Option<u64>>,
        pub event_calls: Mutex<Vec<(u64, u64)>>,
        pub timestamp_calls: Mutex<Vec<u64>>,
        pub failing_timestamps: Mutex<HashSet<u64>>,
        pub balances: Mutex<HashMap<Address, U256>>,
        /// Remaining node-side errors per address before its balance is served.
        pub balance_failures: Mutex<HashMap<Address, u32>>,
        /// Remaining connection failures per address.
        pub transport_failures: Mutex<HashMap<Address, u32>>,
        pub balance_calls: Mutex<Vec<Address>>,
    }

    impl MockChain {
        pub fn with_head(head: u64) -> Self {
            let chain = Self::default();
            *chain.head.lock().unwrap() = head;
            chain
        }

        pub fn block_timestamp(block: u64) -> u64 {
            GENESIS_TIMESTAMP_MS + block * 12_000
        }

        pub fn set_balance(&self, address: Address, wei: U256) {
            self.balances.lock().unwrap().insert(address, wei);
        }

        pub fn fail_balance(&self, address: Address, times: u32) {
            self.balance_failures.lock().unwrap().insert(address, times);
        }

        pub fn fail_balance_transport(&self, address: Address, times: u32) {
            self.transport_failures.lock().unwrap().insert(address, times);
        }

        pub fn balance_call_count(&self) -> usize {
            self.balance_calls.lock().unwrap().len()
        }
    }

    fn take_failure(failures: &Mutex<HashMap<Address, u32>>, address: Address) -> bool {
        let mut failures = failures.lock().unwrap();
        match failures.get_mut(&address) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    #[async_trait]
    impl ChainClient for MockChain {
        async fn head_block_number(&self) -> Result<u64> {
            if let Some(head) = self.head_script.lock().unwrap().pop_front() {
                return Ok(head);
            }
            Ok(*self.head.lock().unwrap())
        }

        async fn get_events(
            &self,
            contract: Address,
            from_block: u64,
            to_block: u64,
        ) -> Result<Vec<Log>> {
            self.event_calls.lock().unwrap().push((from_block, to_block));
            match self.event_failures.lock().unwrap().pop_front() {
                Some(EventFailure::TooLarge) => {
                    return Err(ChainError::ResultSetTooLarge(
                        "query returned more than 10000 results".to_string(),
                    )
                    .into())
                }
                Some(EventFailure::Transient) => anyhow::bail!("connection reset by peer"),
                None => {}
            }
            if let Some(max) = *self.max_event_range.lock().unwrap() {
                if to_block - from_block > max {
                    return Err(ChainError::ResultSetTooLarge(
                        "query returned more than 10000 results".to_string(),
                    )
                    .into());
                }
            }
            Ok(self
                .logs
                .lock()
                .unwrap()
                .iter()
                .filter(|log| {
                    log.address == contract
                        && log.block_number >= from_block
                        && log.block_number <= to_block
                })
                .cloned()
                .collect())
        }

        async fn get_balance(&self, address: Address, _block: u64) -> Result<U256> {
            self.balance_calls.lock().unwrap().push(address);
            if take_failure(&self.transport_failures, address) {
                anyhow::bail!("connection reset by peer");
            }
            if take_failure(&self.balance_failures, address) {
                return Err(ChainError::Rpc {
                    code: -32005,
                    message: "rate limited".to_string(),
                }
                .into());
            }
            Ok(self
                .balances
                .lock()
                .unwrap()
                .get(&address)
                .copied()
                .unwrap_or(U256::ZERO))
        }

        async fn get_block_timestamp(&self, block: u64) -> Result<u64> {
            self.timestamp_calls.lock().unwrap().push(block);
            if self.failing_timestamps.lock().unwrap().contains(&block) {
                anyhow::bail!("block {} unavailable", block);
            }
            Ok(Self::block_timestamp(block))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_set_too_large_detected_through_context() {
        let err = anyhow::Error::from(ChainError::ResultSetTooLarge(
            "more than 10000 results".to_string(),
        ))
        .context("Failed to fetch logs");
        assert!(is_result_set_too_large(&err));
    }

    #[test]
    fn test_other_errors_are_not_too_large() {
        let rpc: anyhow::Error = ChainError::Rpc {
            code: -32000,
            message: "header not found".to_string(),
        }
        .into();
        assert!(!is_result_set_too_large(&rpc));
        assert!(!is_result_set_too_large(&anyhow::anyhow!("timeout")));
    }

    #[test]
    fn test_transport_errors_have_no_node_answer() {
        assert!(is_transport_error(&anyhow::anyhow!("operation timed out")));

        let answered = anyhow::Error::from(ChainError::Rpc {
            code: -32000,
            message: "missing trie node".to_string(),
        })
        .context("Failed to get balance");
        assert!(!is_transport_error(&answered));
    }
}
