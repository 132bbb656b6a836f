//! Historical owner reconstruction
//!
//! Replays the transfer log to find who held each token just before a cutoff
//! block. A token's holder is the `to` of its latest transfer (by block, then
//! log index) mined strictly before the cutoff.

use crate::records::TransferRecord;
use crate::store::TransferStore;
use alloy_primitives::{Address, U256};
use anyhow::Result;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy)]
struct Holding {
    block_number: u64,
    log_index: u64,
    owner: Address,
}

/// Streaming accumulator of the latest qualifying transfer per token.
#[derive(Debug)]
pub struct OwnerTracker {
    cutoff: u64,
    holdings: HashMap<U256, Holding>,
}

impl OwnerTracker {
    pub fn new(cutoff: u64) -> Self {
        Self {
            cutoff,
            holdings: HashMap::new(),
        }
    }

    /// Feed one transfer. Records at or after the cutoff are ignored; order
    /// of arrival does not matter.
    pub fn observe(&mut self, record: &TransferRecord) {
        if record.block_number >= self.cutoff {
            return;
        }
        let candidate = Holding {
            block_number: record.block_number,
            log_index: record.log_index,
            owner: record.to,
        };
        self.holdings
            .entry(record.token_id)
            .and_modify(|current| {
                if (candidate.block_number, candidate.log_index)
                    > (current.block_number, current.log_index)
                {
                    *current = candidate;
                }
            })
            .or_insert(candidate);
    }

    /// Distinct holders, sorted. A burned token reports the zero address.
    pub fn owners(&self) -> Vec<Address> {
        let owners: BTreeSet<Address> = self.holdings.values().map(|holding| holding.owner).collect();
        owners.into_iter().collect()
    }

    /// Number of tokens with a qualifying transfer.
    pub fn token_count(&self) -> usize {
        self.holdings.len()
    }
}

/// Owners as of `cutoff` over an in-memory slice of transfers.
pub fn current_owners(records: &[TransferRecord], cutoff: u64) -> Vec<Address> {
    let mut tracker = OwnerTracker::new(cutoff);
    for record in records {
        tracker.observe(record);
    }
    tracker.owners()
}

/// Owners as of `cutoff`, streaming the whole transfer log.
pub fn owners_at(store: &dyn TransferStore, cutoff: u64) -> Result<Vec<Address>> {
    let mut tracker = OwnerTracker::new(cutoff);
    store.for_each_transfer(&mut |record| {
        tracker.observe(&record);
        Ok(())
    })?;
    tracing::debug!(
        "Reconstructed owners of {} tokens before block {}",
        tracker.token_count(),
        cutoff
    );
    Ok(tracker.owners())
}
