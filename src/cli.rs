//! CLI implementation for balancectl
//!
//! Operator interface over the transfer index and the balance lookup.
//! All commands output pretty JSON.

use crate::balance::{BalanceStores, WalletEthBalanceService};
use crate::clock::TokioSleeper;
use crate::config::{BalanceConfig, ChainArgs, SAVE_BLOCK_NUMBER};
use crate::ownership::owners_at;
use crate::rpc::RpcClient;
use crate::store::{CheckpointStore, RocksIndexStore, TimestampIndex, TransferStore};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::sync::Arc;

/// NFT owner balance CLI tool
#[derive(Parser)]
#[command(name = "balancectl")]
#[command(about = "Query NFT owners and their historical ETH balances")]
pub struct Cli {
    #[command(flatten)]
    chain: ChainArgs,

    /// Minimum age in blocks before a balance snapshot is cached
    #[arg(long, env = "SAVE_BLOCK_NUMBER", default_value_t = SAVE_BLOCK_NUMBER)]
    save_block_number: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// ETH balances of all NFT owners at the block nearest to a timestamp
    Balance {
        /// Unix timestamp in milliseconds
        #[arg(long)]
        timestamp: u64,
        /// Ignore any cached snapshot
        #[arg(long)]
        force_refresh: bool,
    },
    /// NFT owners as of the end of a block
    Owners {
        /// Block number
        #[arg(long)]
        block: u64,
    },
    /// Latest indexed block at or before a timestamp
    NearestBlock {
        /// Unix timestamp in milliseconds
        #[arg(long)]
        timestamp: u64,
    },
    /// Crawl checkpoint of the configured contract
    Checkpoint,
    /// Index statistics
    Stats,
}

/// Run the CLI command and print JSON output.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let result = execute(cli).await?;

    // Pretty print JSON
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn execute(cli: Cli) -> Result<Value> {
    let contract = cli.chain.contract()?;
    let store = Arc::new(
        RocksIndexStore::open(&cli.chain.db_path)
            .with_context(|| format!("Failed to open database at {:?}", cli.chain.db_path))?,
    );

    let result = match cli.command {
        Commands::Balance {
            timestamp,
            force_refresh,
        } => {
            let rpc = RpcClient::new(cli.chain.balance_rpc_url().to_string(), cli.chain.rpc_timeout())?;
            let config = BalanceConfig {
                save_block_number: cli.save_block_number,
                ..BalanceConfig::default()
            };
            let service = WalletEthBalanceService::new(
                contract,
                BalanceStores::from_rocks(store),
                Arc::new(rpc),
                Arc::new(TokioSleeper),
                config,
            );
            let balance = service.get_wallet_eth_balance(timestamp, force_refresh).await?;
            serde_json::to_value(&balance)?
        }
        Commands::Owners { block } => {
            let owners = owners_at(store.as_ref(), block.saturating_add(1))?;
            let owners: Vec<String> = owners.iter().map(|owner| owner.to_checksum(None)).collect();
            json!({
                "block": block,
                "count": owners.len(),
                "owners": owners,
            })
        }
        Commands::NearestBlock { timestamp } => json!({
            "timestamp": timestamp,
            "block": store.nearest_block_at_or_before(timestamp)?,
        }),
        Commands::Checkpoint => match store.get_checkpoint(contract)? {
            Some(checkpoint) => json!({
                "contract": format!("0x{:x}", contract),
                "next_block": checkpoint.next_block,
                "latest_indexed_block": checkpoint.latest_indexed_block(),
                "updated_at": checkpoint.updated_at.to_rfc3339(),
            }),
            None => json!({
                "contract": format!("0x{:x}", contract),
                "next_block": null
            }),
        },
        Commands::Stats => json!({
            "contract": format!("0x{:x}", contract),
            "transfers": store.transfer_count()?,
        }),
    };
    Ok(result)
}
