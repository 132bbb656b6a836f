//! Rate-limited historical balance fetching
//!
//! Addresses are split into chunks, and chunks into batches. The requests of
//! one batch run concurrently; batches and chunks are separated by fixed
//! pauses so a public endpoint is not flooded.

use crate::chain::{is_transport_error, ChainClient};
use crate::clock::Sleeper;
use crate::config::BalanceConfig;
use alloy_primitives::{Address, U256};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const WEI_PER_ETHER: u64 = 1_000_000_000_000_000_000;

/// Balance lookup result for one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceOutcome {
    /// False when every attempt for this address failed
    pub resolved: bool,
    /// Ether-denominated decimal; `"0"` placeholder when unresolved
    pub ether: String,
}

impl BalanceOutcome {
    fn resolved(wei: U256) -> Self {
        Self {
            resolved: true,
            ether: wei_to_ether(wei),
        }
    }

    fn unresolved() -> Self {
        Self {
            resolved: false,
            ether: "0".to_string(),
        }
    }
}

pub type BalanceResults = HashMap<Address, BalanceOutcome>;

/// Outcome of one `fetch_balances` pass.
#[derive(Debug, Default)]
pub struct FetchReport {
    pub results: BalanceResults,
    /// Batches that never got through to the node, even after all retries
    pub failed_batches: usize,
}

impl FetchReport {
    pub fn unresolved(&self) -> Vec<Address> {
        let mut missing: Vec<Address> = self
            .results
            .iter()
            .filter(|(_, outcome)| !outcome.resolved)
            .map(|(address, _)| *address)
            .collect();
        missing.sort();
        missing
    }
}

/// Split `addresses` into chunks of at most `chunk_size`, each split into
/// batches of at most `batch_size`. Sizes below one are treated as one.
pub fn partition(
    addresses: &[Address],
    chunk_size: usize,
    batch_size: usize,
) -> Vec<Vec<Vec<Address>>> {
    let chunk_size = chunk_size.max(1);
    let batch_size = batch_size.max(1);
    addresses
        .chunks(chunk_size)
        .map(|chunk| chunk.chunks(batch_size).map(|batch| batch.to_vec()).collect())
        .collect()
}

/// Backoff before retry number `retry` (1-based) of a failed batch.
pub fn batch_backoff(retry: u32, cap: Duration) -> Duration {
    let millis = 1000u64.saturating_mul(1u64 << retry.min(32));
    Duration::from_millis(millis).min(cap)
}

/// Format a wei amount as an ether decimal string without trailing zeros.
pub fn wei_to_ether(wei: U256) -> String {
    let unit = U256::from(WEI_PER_ETHER);
    let whole = wei / unit;
    let fraction = (wei % unit).to::<u64>();
    if fraction == 0 {
        return whole.to_string();
    }
    let digits = format!("{:018}", fraction);
    format!("{}.{}", whole, digits.trim_end_matches('0'))
}

/// Fetches balances of many addresses at one block.
pub struct BalanceFetcher {
    chain: Arc<dyn ChainClient>,
    sleeper: Arc<dyn Sleeper>,
    config: BalanceConfig,
}

impl BalanceFetcher {
    pub fn new(chain: Arc<dyn ChainClient>, sleeper: Arc<dyn Sleeper>, config: BalanceConfig) -> Self {
        Self {
            chain,
            sleeper,
            config,
        }
    }

    pub fn config(&self) -> &BalanceConfig {
        &self.config
    }

    /// Fetch the balance of every address as of `block`.
    ///
    /// Per-address failures never abort the pass: they come back as
    /// unresolved outcomes. Duplicate addresses are fetched once.
    pub async fn fetch_balances(&self, addresses: &[Address], block: u64) -> FetchReport {
        let mut seen = HashSet::with_capacity(addresses.len());
        let unique: Vec<Address> = addresses
            .iter()
            .copied()
            .filter(|address| seen.insert(*address))
            .collect();

        let chunks = partition(&unique, self.config.max_owners_per_chunk, self.config.batch_size);
        info!(
            "Fetching {} balances at block {} in {} chunks",
            unique.len(),
            block,
            chunks.len()
        );

        let mut report = FetchReport::default();
        for (chunk_index, chunk) in chunks.iter().enumerate() {
            for (batch_index, batch) in chunk.iter().enumerate() {
                debug!(
                    "Chunk {}/{} batch {}/{} ({} addresses)",
                    chunk_index + 1,
                    chunks.len(),
                    batch_index + 1,
                    chunk.len(),
                    batch.len()
                );
                if !self.fetch_batch(batch, block, &mut report.results).await {
                    report.failed_batches += 1;
                }
                if batch_index + 1 < chunk.len() {
                    self.sleeper.sleep(self.config.batch_pause).await;
                }
            }
            if chunk_index + 1 < chunks.len() {
                self.sleeper.sleep(self.config.chunk_pause).await;
            }
        }
        report
    }

    /// Run one batch.
    ///
    /// Errors the node answered stay with their address. Only a batch in
    /// which every request failed in transport (no node answer at all) is
    /// retried as a whole; returns false if that never recovered.
    async fn fetch_batch(&self, batch: &[Address], block: u64, results: &mut BalanceResults) -> bool {
        let mut retry = 0u32;
        loop {
            let responses = join_all(batch.iter().map(|&address| {
                let chain = Arc::clone(&self.chain);
                async move { (address, chain.get_balance(address, block).await) }
            }))
            .await;

            let unreachable = !responses.is_empty()
                && responses
                    .iter()
                    .all(|(_, response)| matches!(response, Err(e) if is_transport_error(e)));
            if !unreachable || retry >= self.config.batch_retries {
                for (address, response) in responses {
                    let outcome = match response {
                        Ok(wei) => BalanceOutcome::resolved(wei),
                        Err(e) => {
                            warn!("Failed to get balance for {:?}: {:#}", address, e);
                            BalanceOutcome::unresolved()
                        }
                    };
                    results.insert(address, outcome);
                }
                if unreachable {
                    warn!(
                        "Batch of {} addresses unreachable after {} attempts",
                        batch.len(),
                        retry + 1
                    );
                }
                return !unreachable;
            }

            retry += 1;
            let delay = batch_backoff(retry, self.config.batch_backoff_cap);
            warn!(
                "Batch of {} addresses unreachable (attempt {}/{}), retrying in {:?}",
                batch.len(),
                retry,
                self.config.batch_retries + 1,
                delay
            );
            self.sleeper.sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChain;
    use crate::clock::RecordingSleeper;

    fn addresses(count: usize) -> Vec<Address> {
        (1..=count)
            .map(|i| {
                let mut bytes = [0u8; 20];
                bytes[12..].copy_from_slice(&(i as u64).to_be_bytes());
                Address::from(bytes)
            })
            .collect()
    }

    fn fetcher(chain: Arc<MockChain>, sleeper: Arc<RecordingSleeper>) -> BalanceFetcher {
        BalanceFetcher::new(chain, sleeper, BalanceConfig::default())
    }

    #[test]
    fn test_partition_sizes() {
        let chunks = partition(&addresses(1200), 500, 100);
        let chunk_sizes: Vec<usize> = chunks.iter().map(|c| c.iter().map(Vec::len).sum()).collect();
        let batch_counts: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(chunk_sizes, vec![500, 500, 200]);
        assert_eq!(batch_counts, vec![5, 5, 2]);
    }

    #[test]
    fn test_partition_clamps_zero_sizes() {
        let chunks = partition(&addresses(2), 0, 0);
        assert_eq!(chunks.len(), 2);
        assert!(partition(&[], 500, 100).is_empty());
    }

    #[test]
    fn test_wei_to_ether() {
        assert_eq!(wei_to_ether(U256::ZERO), "0");
        assert_eq!(wei_to_ether(U256::from(1u64)), "0.000000000000000001");
        assert_eq!(wei_to_ether(U256::from(1_500_000_000_000_000_000u64)), "1.5");
        assert_eq!(wei_to_ether(U256::from(WEI_PER_ETHER) * U256::from(42u64)), "42");
    }

    #[test]
    fn test_batch_backoff() {
        let cap = Duration::from_secs(5);
        assert_eq!(batch_backoff(1, cap), Duration::from_secs(2));
        assert_eq!(batch_backoff(2, cap), Duration::from_secs(4));
        assert_eq!(batch_backoff(3, cap), Duration::from_secs(5));
        assert_eq!(batch_backoff(40, cap), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_pauses_between_batches_and_chunks() {
        let chain = Arc::new(MockChain::default());
        let sleeper = Arc::new(RecordingSleeper::default());
        let report = fetcher(chain.clone(), sleeper.clone())
            .fetch_balances(&addresses(1200), 100)
            .await;

        assert_eq!(report.results.len(), 1200);
        assert_eq!(chain.balance_call_count(), 1200);
        let slept = sleeper.slept();
        let batch_pauses = slept.iter().filter(|d| **d == Duration::from_millis(100)).count();
        let chunk_pauses = slept.iter().filter(|d| **d == Duration::from_millis(500)).count();
        assert_eq!(batch_pauses, 4 + 4 + 1);
        assert_eq!(chunk_pauses, 2);
    }

    #[tokio::test]
    async fn test_failure_is_isolated_per_address() {
        let chain = Arc::new(MockChain::default());
        let owners = addresses(3);
        chain.set_balance(owners[0], U256::from(2_000_000_000_000_000_000u64));
        chain.fail_balance(owners[1], u32::MAX);

        let report = fetcher(chain.clone(), Arc::new(RecordingSleeper::default()))
            .fetch_balances(&owners, 100)
            .await;

        assert_eq!(report.results[&owners[0]], BalanceOutcome::resolved(U256::from(2_000_000_000_000_000_000u64)));
        assert_eq!(report.results[&owners[0]].ether, "2");
        assert_eq!(report.results[&owners[1]], BalanceOutcome::unresolved());
        // Genuine zero balance is resolved, unlike a failure
        assert!(report.results[&owners[2]].resolved);
        assert_eq!(report.results[&owners[2]].ether, "0");
        assert_eq!(report.unresolved(), vec![owners[1]]);
        assert_eq!(report.failed_batches, 0);
    }

    #[tokio::test]
    async fn test_unreachable_batch_is_retried_with_backoff() {
        let chain = Arc::new(MockChain::default());
        let sleeper = Arc::new(RecordingSleeper::default());
        let owners = addresses(2);
        chain.fail_balance_transport(owners[0], 2);
        chain.fail_balance_transport(owners[1], 2);

        let report = fetcher(chain.clone(), sleeper.clone())
            .fetch_balances(&owners, 100)
            .await;

        assert!(report.unresolved().is_empty());
        assert_eq!(chain.balance_call_count(), 6);
        assert_eq!(sleeper.slept(), vec![Duration::from_secs(2), Duration::from_secs(4)]);
    }

    #[tokio::test]
    async fn test_batch_marked_unresolved_after_retries() {
        let chain = Arc::new(MockChain::default());
        let sleeper = Arc::new(RecordingSleeper::default());
        let owners = addresses(2);
        chain.fail_balance_transport(owners[0], u32::MAX);
        chain.fail_balance_transport(owners[1], u32::MAX);

        let report = fetcher(chain.clone(), sleeper.clone())
            .fetch_balances(&owners, 100)
            .await;

        assert_eq!(report.unresolved(), owners);
        assert_eq!(report.failed_batches, 1);
        // One initial attempt plus three retries
        assert_eq!(chain.balance_call_count(), 8);
        assert_eq!(
            sleeper.slept(),
            vec![Duration::from_secs(2), Duration::from_secs(4), Duration::from_secs(5)]
        );
    }

    #[tokio::test]
    async fn test_node_errors_are_not_retried_in_batch() {
        let chain = Arc::new(MockChain::default());
        let sleeper = Arc::new(RecordingSleeper::default());
        let owner = addresses(1)[0];
        chain.fail_balance(owner, u32::MAX);

        let report = fetcher(chain.clone(), sleeper.clone())
            .fetch_balances(&[owner], 100)
            .await;

        assert_eq!(report.unresolved(), vec![owner]);
        assert_eq!(report.failed_batches, 0);
        assert_eq!(chain.balance_call_count(), 1);
        assert!(sleeper.slept().is_empty());
    }

    #[tokio::test]
    async fn test_duplicates_fetched_once() {
        let chain = Arc::new(MockChain::default());
        let owners = addresses(2);
        let input = vec![owners[0], owners[1], owners[0]];

        let report = fetcher(chain.clone(), Arc::new(RecordingSleeper::default()))
            .fetch_balances(&input, 100)
            .await;

        assert_eq!(report.results.len(), 2);
        assert_eq!(chain.balance_call_count(), 2);
    }
}
