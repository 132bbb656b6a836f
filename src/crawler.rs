//! Transfer crawler loop
//!
//! Walks the chain in bounded windows behind a confirmation margin, stores
//! the NFT transfers of each window and advances the contract checkpoint in
//! the same atomic write.

use crate::chain::{is_result_set_too_large, ChainClient};
use crate::clock::Sleeper;
use crate::config::CrawlerConfig;
use crate::events::transfer_events;
use crate::records::{TimestampEntry, TransferRecord};
use crate::store::{CheckpointStore, RocksIndexStore};
use crate::types::Log;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Inclusive block range processed by one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub from_block: u64,
    pub to_block: u64,
}

impl Window {
    pub fn width(&self) -> u64 {
        self.to_block - self.from_block
    }
}

/// Plan the window starting at `from_block`.
///
/// Returns `None` while the confirmed head (`head - block_delay`) is still
/// behind `from_block`.
pub fn plan_window(from_block: u64, head: u64, block_delay: u64, block_crawl: u64) -> Option<Window> {
    let confirmed = head.checked_sub(block_delay)?;
    if confirmed < from_block {
        return None;
    }
    let to_block = from_block.saturating_add(block_crawl).min(confirmed);
    Some(Window {
        from_block,
        to_block,
    })
}

/// Halve the window width, keeping its start. `None` once the width would
/// drop below `min_range`.
pub fn shrink_window(window: Window, min_range: u64) -> Option<Window> {
    let width = window.width() / 2;
    if width < min_range {
        return None;
    }
    Some(Window {
        from_block: window.from_block,
        to_block: window.from_block + width,
    })
}

/// Summary of one successful cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub window: Window,
    pub events_seen: usize,
    pub transfers_stored: usize,
}

/// Sequential crawler for one NFT contract.
pub struct Crawler {
    chain: Arc<dyn ChainClient>,
    store: Arc<RocksIndexStore>,
    sleeper: Arc<dyn Sleeper>,
    config: CrawlerConfig,
}

impl Crawler {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        store: Arc<RocksIndexStore>,
        sleeper: Arc<dyn Sleeper>,
        config: CrawlerConfig,
    ) -> Self {
        Self {
            chain,
            store,
            sleeper,
            config,
        }
    }

    /// Run the crawl loop forever.
    ///
    /// A failed cycle is logged and retried after the cooldown; only a
    /// failure to create the initial checkpoint is returned.
    pub async fn run(&self) -> Result<()> {
        let checkpoint = self
            .store
            .init_checkpoint(self.config.contract, self.config.start_block)
            .context("Failed to initialize checkpoint")?;
        info!(
            "Starting crawler for {:?} at block {}",
            self.config.contract, checkpoint.next_block
        );

        loop {
            match self.run_cycle().await {
                Ok(report) => {
                    info!(
                        "Indexed blocks {} to {}: {} logs, {} transfers",
                        report.window.from_block,
                        report.window.to_block,
                        report.events_seen,
                        report.transfers_stored
                    );
                    self.sleeper.sleep(self.config.block_sleep).await;
                }
                Err(e) => {
                    error!("Crawl cycle failed: {:#}", e);
                    self.sleeper.sleep(self.config.failure_cooldown).await;
                }
            }
        }
    }

    /// Plan, fetch and persist one window.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let window = self.next_window().await?;
        let (window, logs) = self.fetch_events_with_retry(window).await?;
        self.persist_and_advance(window, &logs).await
    }

    /// Wait until the confirmed head reaches the checkpoint, then plan the window.
    async fn next_window(&self) -> Result<Window> {
        let checkpoint = self
            .store
            .init_checkpoint(self.config.contract, self.config.start_block)?;
        let from_block = checkpoint.next_block;

        loop {
            let head = self
                .chain
                .head_block_number()
                .await
                .context("Failed to get head block number")?;
            if let Some(window) =
                plan_window(from_block, head, self.config.block_delay, self.config.block_crawl)
            {
                return Ok(window);
            }
            debug!("Waiting for block {} (head {})", from_block, head);
            self.sleeper.sleep(self.config.block_sleep).await;
        }
    }

    /// Fetch the logs of `window`, shrinking it while the provider reports
    /// the result set as too large.
    ///
    /// Returns the window that was actually fetched.
    async fn fetch_events_with_retry(&self, window: Window) -> Result<(Window, Vec<Log>)> {
        let mut window = window;
        let mut attempt = 1u32;
        loop {
            match self
                .chain
                .get_events(self.config.contract, window.from_block, window.to_block)
                .await
            {
                Ok(logs) => return Ok((window, logs)),
                Err(e) if is_result_set_too_large(&e) => {
                    match shrink_window(window, self.config.min_block_range) {
                        Some(smaller) => {
                            warn!(
                                "Too many results for blocks {} to {}, shrinking to {}",
                                window.from_block, window.to_block, smaller.to_block
                            );
                            window = smaller;
                        }
                        None => {
                            return Err(e.context(format!(
                                "Blocks {} to {} still too large at minimum range {}",
                                window.from_block, window.to_block, self.config.min_block_range
                            )))
                        }
                    }
                }
                Err(e) => {
                    if attempt >= self.config.max_fetch_attempts {
                        return Err(e.context(format!(
                            "Failed to fetch events for blocks {} to {} after {} attempts",
                            window.from_block, window.to_block, attempt
                        )));
                    }
                    let delay = self.config.retry_backoff * attempt;
                    warn!(
                        "Fetching events failed (attempt {}/{}): {:#}; retrying in {:?}",
                        attempt, self.config.max_fetch_attempts, e, delay
                    );
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Store the window's transfers and move the checkpoint past it.
    ///
    /// Block timestamps are resolved first so nothing is awaited while the
    /// write is open; any failure leaves the store untouched.
    async fn persist_and_advance(&self, window: Window, logs: &[Log]) -> Result<CycleReport> {
        let events = transfer_events(logs, self.config.contract);

        let mut timestamps: BTreeMap<u64, u64> = BTreeMap::new();
        for event in &events {
            if timestamps.contains_key(&event.block_number) {
                continue;
            }
            let timestamp_ms = self
                .chain
                .get_block_timestamp(event.block_number)
                .await
                .with_context(|| format!("Failed to get timestamp of block {}", event.block_number))?;
            timestamps.insert(event.block_number, timestamp_ms);
        }

        let mut records = Vec::with_capacity(events.len());
        for event in events {
            let block_timestamp = *timestamps
                .get(&event.block_number)
                .with_context(|| format!("Missing timestamp for block {}", event.block_number))?;
            records.push(TransferRecord::new(
                event.token_id,
                event.from,
                event.to,
                event.tx_hash,
                event.log_index,
                event.block_number,
                block_timestamp,
            ));
        }
        let entries: Vec<TimestampEntry> = timestamps
            .iter()
            .map(|(&block_number, &timestamp_ms)| TimestampEntry {
                block_number,
                timestamp_ms,
            })
            .collect();

        let mut txn = self.store.begin()?;
        let stored = txn
            .insert_transfers(records)
            .context("Failed to stage transfers")?
            .len();
        txn.advance_checkpoint(self.config.contract, window.to_block + 1)?;
        txn.append_block_timestamps(&entries)?;
        txn.commit()?;

        Ok(CycleReport {
            window,
            events_seen: logs.len(),
            transfers_stored: stored,
        })
    }
}
