//! Configuration for the crawler and the balance engine
//!
//! Values come from command-line flags with environment variable fallbacks
//! (`RPC_URL`, `NFT_CONTRACT`, `BLOCK_DELAY`, ...). The defaults below are
//! the tuned production values.

use crate::types::pad_hex_string;
use alloy_primitives::Address;
use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

/// Confirmation margin kept behind the chain head.
pub const BLOCK_DELAY: u64 = 2;
/// Maximum window width per crawl cycle.
pub const BLOCK_CRAWL: u64 = 5000;
/// Pause between head polls and between successful cycles, in ms.
pub const BLOCK_SLEEP_MS: u64 = 1000;
/// Window width below which a too-large result set is fatal for the cycle.
pub const MIN_BLOCK_RANGE: u64 = 10;
/// Minimum block age (behind the latest indexed block) before balances are cached.
pub const SAVE_BLOCK_NUMBER: u64 = 20;
pub const MAX_OWNERS_PER_CHUNK: usize = 500;
pub const BATCH_SIZE: usize = 100;

/// Crawler engine settings.
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// NFT contract whose Transfer events are indexed
    pub contract: Address,
    /// First block to crawl when no checkpoint exists
    pub start_block: u64,
    pub block_delay: u64,
    pub block_crawl: u64,
    pub block_sleep: Duration,
    pub min_block_range: u64,
    /// Attempts per window for errors other than "result set too large"
    pub max_fetch_attempts: u32,
    /// Linear backoff unit between fetch attempts
    pub retry_backoff: Duration,
    /// Pause after a failed cycle
    pub failure_cooldown: Duration,
}

impl CrawlerConfig {
    pub fn new(contract: Address) -> Self {
        Self {
            contract,
            start_block: 0,
            block_delay: BLOCK_DELAY,
            block_crawl: BLOCK_CRAWL,
            block_sleep: Duration::from_millis(BLOCK_SLEEP_MS),
            min_block_range: MIN_BLOCK_RANGE,
            max_fetch_attempts: 3,
            retry_backoff: Duration::from_secs(2),
            failure_cooldown: Duration::from_secs(5),
        }
    }
}

/// Balance fetch engine and coordinator settings.
#[derive(Debug, Clone)]
pub struct BalanceConfig {
    pub max_owners_per_chunk: usize,
    pub batch_size: usize,
    pub batch_pause: Duration,
    pub chunk_pause: Duration,
    /// Retries of a batch whose every request failed
    pub batch_retries: u32,
    pub batch_backoff_cap: Duration,
    /// Rounds of the missing-wallet retry loop
    pub missing_wallet_rounds: u32,
    pub save_block_number: u64,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            max_owners_per_chunk: MAX_OWNERS_PER_CHUNK,
            batch_size: BATCH_SIZE,
            batch_pause: Duration::from_millis(100),
            chunk_pause: Duration::from_millis(500),
            batch_retries: 3,
            batch_backoff_cap: Duration::from_secs(5),
            missing_wallet_rounds: 5,
            save_block_number: SAVE_BLOCK_NUMBER,
        }
    }
}

/// Connection settings shared by every binary.
#[derive(Debug, Clone, Args)]
pub struct ChainArgs {
    /// RPC endpoint used for crawling (e.g., https://eth.llamarpc.com)
    #[arg(long, env = "RPC_URL", default_value = "http://127.0.0.1:8545")]
    pub rpc_url: String,

    /// Separate RPC endpoint for balance queries (defaults to --rpc-url)
    #[arg(long, env = "RPC_URL_GET_BALANCE")]
    pub rpc_url_get_balance: Option<String>,

    /// NFT contract address (hex, with or without 0x prefix)
    #[arg(long, env = "NFT_CONTRACT")]
    pub nft_contract: String,

    /// Path to RocksDB database directory
    #[arg(short, long, env = "DB_PATH", default_value = "./index_db")]
    pub db_path: PathBuf,

    /// Timeout applied to every RPC request, in seconds
    #[arg(long, env = "RPC_TIMEOUT_SECS", default_value_t = 30)]
    pub rpc_timeout_secs: u64,
}

impl ChainArgs {
    pub fn contract(&self) -> Result<Address> {
        parse_address(&self.nft_contract).context("Invalid NFT_CONTRACT")
    }

    pub fn balance_rpc_url(&self) -> &str {
        self.rpc_url_get_balance.as_deref().unwrap_or(&self.rpc_url)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}

/// Crawl pacing settings.
#[derive(Debug, Clone, Args)]
pub struct CrawlArgs {
    /// Block to start from when the contract has no checkpoint yet
    #[arg(long, env = "START_BLOCK", default_value_t = 0)]
    pub start_block: u64,

    /// Confirmation margin behind the chain head
    #[arg(long, env = "BLOCK_DELAY", default_value_t = BLOCK_DELAY)]
    pub block_delay: u64,

    /// Maximum blocks per crawl window
    #[arg(long, env = "BLOCK_CRAWL", default_value_t = BLOCK_CRAWL)]
    pub block_crawl: u64,

    /// Sleep between polls and cycles, in milliseconds
    #[arg(long, env = "BLOCK_SLEEP", default_value_t = BLOCK_SLEEP_MS)]
    pub block_sleep: u64,

    /// Smallest window the crawler shrinks to before giving up on a cycle
    #[arg(long, env = "MIN_BLOCK_RANGE", default_value_t = MIN_BLOCK_RANGE)]
    pub min_block_range: u64,
}

impl CrawlArgs {
    pub fn into_config(self, contract: Address) -> CrawlerConfig {
        CrawlerConfig {
            start_block: self.start_block,
            block_delay: self.block_delay,
            block_crawl: self.block_crawl,
            block_sleep: Duration::from_millis(self.block_sleep),
            min_block_range: self.min_block_range,
            ..CrawlerConfig::new(contract)
        }
    }
}

/// Parse an address from a hex string.
///
/// Accepts addresses with or without 0x prefix.
pub fn parse_address(s: &str) -> Result<Address> {
    let s = s.trim();
    let s = s.strip_prefix("0x").unwrap_or(s);
    let s = pad_hex_string(s);
    let bytes = hex::decode(&s)
        .with_context(|| format!("Invalid hex address: {}", s))?;

    if bytes.len() != 20 {
        anyhow::bail!("Address must be 20 bytes (40 hex chars), got {} bytes", bytes.len());
    }

    Ok(Address::from_slice(&bytes))
}
