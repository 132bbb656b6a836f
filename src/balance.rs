//! Historical owner balance lookup
//!
//! Resolves a timestamp to the nearest indexed block, reconstructs the NFT
//! owners as of that block, fetches their ether balances and caches complete
//! snapshots of sufficiently old blocks.

use crate::chain::ChainClient;
use crate::clock::Sleeper;
use crate::config::BalanceConfig;
use crate::fetcher::{BalanceFetcher, BalanceResults};
use crate::ownership::owners_at;
use crate::records::{OwnerBalances, WalletEthBalance};
use crate::store::{BalanceCache, CheckpointStore, RocksIndexStore, TimestampIndex, TransferStore};
use alloy_primitives::Address;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum BalanceError {
    #[error("no indexed block at or before timestamp {0}")]
    NoIndexedBlock(u64),
    #[error("failed to get balance for {} wallets after {attempts} retry attempts", .missing.len())]
    UnresolvedWallets { missing: Vec<Address>, attempts: u32 },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Store handles used by the balance lookup.
#[derive(Clone)]
pub struct BalanceStores {
    pub transfers: Arc<dyn TransferStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub timestamps: Arc<dyn TimestampIndex>,
    pub cache: Arc<dyn BalanceCache>,
}

impl BalanceStores {
    /// Serve every store from one RocksDB database.
    pub fn from_rocks(store: Arc<RocksIndexStore>) -> Self {
        Self {
            transfers: store.clone(),
            checkpoints: store.clone(),
            timestamps: store.clone(),
            cache: store,
        }
    }
}

/// Wait before the next missing-wallet round.
///
/// `attempt` is the 1-based round that just finished; `errored` is set when
/// the round hit batch-level failures rather than isolated misses.
pub fn missing_wallet_backoff(attempt: u32, errored: bool) -> Duration {
    let (base, cap) = if errored { (3000u64, 60_000u64) } else { (2000u64, 30_000u64) };
    let factor = 1u64 << attempt.saturating_sub(1).min(32);
    Duration::from_millis(base.saturating_mul(factor).min(cap))
}

/// Whether a snapshot of `block` may be cached.
///
/// Only complete snapshots of blocks more than `margin` blocks behind the
/// latest indexed block are kept.
pub fn snapshot_is_cacheable(latest_indexed: Option<u64>, block: u64, margin: u64, complete: bool) -> bool {
    match latest_indexed {
        Some(head) => complete && head.saturating_sub(block) > margin,
        None => false,
    }
}

pub struct WalletEthBalanceService {
    contract: Address,
    stores: BalanceStores,
    fetcher: BalanceFetcher,
    sleeper: Arc<dyn Sleeper>,
}

impl WalletEthBalanceService {
    pub fn new(
        contract: Address,
        stores: BalanceStores,
        chain: Arc<dyn ChainClient>,
        sleeper: Arc<dyn Sleeper>,
        config: BalanceConfig,
    ) -> Self {
        Self {
            contract,
            stores,
            fetcher: BalanceFetcher::new(chain, Arc::clone(&sleeper), config),
            sleeper,
        }
    }

    /// Ether balances of every NFT owner as of the latest indexed block at
    /// or before `timestamp_ms`.
    ///
    /// Returns a cached snapshot unless `force_refresh` is set. Either every
    /// owner is resolved or an error is returned.
    pub async fn get_wallet_eth_balance(
        &self,
        timestamp_ms: u64,
        force_refresh: bool,
    ) -> Result<WalletEthBalance, BalanceError> {
        let block = self
            .stores
            .timestamps
            .nearest_block_at_or_before(timestamp_ms)?
            .ok_or(BalanceError::NoIndexedBlock(timestamp_ms))?;

        if !force_refresh {
            match self.stores.cache.get_balances(block) {
                Ok(Some(owners)) => {
                    debug!("Serving balances for block {} from cache", block);
                    return Ok(WalletEthBalance {
                        block_number: block,
                        owners,
                    });
                }
                Ok(None) => {}
                Err(e) => warn!("Balance cache read failed for block {}: {:#}", block, e),
            }
        }

        // Transfers mined in `block` itself are part of the state at `block`
        let owners = owners_at(self.stores.transfers.as_ref(), block.saturating_add(1))?;
        info!("Found {} owners at block {}", owners.len(), block);

        let mut report = self.fetcher.fetch_balances(&owners, block).await;
        let missing = report.unresolved();
        if !missing.is_empty() {
            warn!("Missing {} wallets, retrying", missing.len());
            let recovered = self.retry_missing_wallets(missing, block).await?;
            report.results.extend(recovered);
        }

        let complete = report.results.values().all(|outcome| outcome.resolved);
        let balances: OwnerBalances = report
            .results
            .into_iter()
            .map(|(address, outcome)| (address.to_checksum(None), outcome.ether))
            .collect();

        self.save_snapshot(block, &balances, complete);

        Ok(WalletEthBalance {
            block_number: block,
            owners: balances,
        })
    }

    /// Re-fetch unresolved wallets for a bounded number of rounds.
    ///
    /// Returns the recovered outcomes, or `UnresolvedWallets` naming the
    /// addresses that never resolved.
    async fn retry_missing_wallets(
        &self,
        missing: Vec<Address>,
        block: u64,
    ) -> Result<BalanceResults, BalanceError> {
        let rounds = self.fetcher.config().missing_wallet_rounds;
        let mut pending = missing;
        let mut recovered = BalanceResults::new();

        for attempt in 1..=rounds {
            if pending.is_empty() {
                break;
            }
            info!("Retry attempt {}/{} for {} wallets", attempt, rounds, pending.len());

            let report = self.fetcher.fetch_balances(&pending, block).await;
            let errored = report.failed_batches > 0;
            for (address, outcome) in report.results {
                if outcome.resolved {
                    recovered.insert(address, outcome);
                }
            }
            pending.retain(|address| !recovered.contains_key(address));

            if !pending.is_empty() && attempt < rounds {
                let delay = missing_wallet_backoff(attempt, errored);
                info!("Still missing {} wallets, waiting {:?}", pending.len(), delay);
                self.sleeper.sleep(delay).await;
            }
        }

        if !pending.is_empty() {
            return Err(BalanceError::UnresolvedWallets {
                missing: pending,
                attempts: rounds,
            });
        }
        Ok(recovered)
    }

    fn save_snapshot(&self, block: u64, balances: &OwnerBalances, complete: bool) {
        let latest = match self.stores.checkpoints.get_checkpoint(self.contract) {
            Ok(checkpoint) => checkpoint.and_then(|c| c.latest_indexed_block()),
            Err(e) => {
                warn!("Failed to read checkpoint, not caching block {}: {:#}", block, e);
                return;
            }
        };
        let margin = self.fetcher.config().save_block_number;
        if !snapshot_is_cacheable(latest, block, margin, complete) {
            debug!("Block {} not cacheable (latest indexed {:?})", block, latest);
            return;
        }
        match self.stores.cache.put_balances(block, balances) {
            Ok(()) => info!("Saved balances to cache for block {}", block),
            Err(e) => warn!("Balance cache write failed for block {}: {:#}", block, e),
        }
    }
}
