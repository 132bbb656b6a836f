//! NFT transfer crawler binary
//!
//! Indexes the Transfer events of one NFT contract into the local store,
//! together with the timestamps of the blocks that carried them.

use anyhow::{Context, Result};
use clap::Parser;
use owner_balances::clock::TokioSleeper;
use owner_balances::config::{ChainArgs, CrawlArgs};
use owner_balances::crawler::Crawler;
use owner_balances::rpc::RpcClient;
use owner_balances::store::RocksIndexStore;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// NFT transfer crawler
#[derive(Parser)]
#[command(name = "crawler")]
#[command(about = "Index NFT Transfer events and block timestamps")]
struct Args {
    #[command(flatten)]
    chain: ChainArgs,

    #[command(flatten)]
    crawl: CrawlArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let contract = args.chain.contract()?;

    info!("Starting NFT transfer crawler");
    info!("RPC URL: {}", args.chain.rpc_url);
    info!("Contract: {:?}", contract);
    info!("Database: {:?}", args.chain.db_path);

    let rpc = RpcClient::new(args.chain.rpc_url.clone(), args.chain.rpc_timeout())?;

    let store = RocksIndexStore::open(&args.chain.db_path)
        .with_context(|| format!("Failed to open database at {:?}", args.chain.db_path))?;

    let crawler = Crawler::new(
        Arc::new(rpc),
        Arc::new(store),
        Arc::new(TokioSleeper),
        args.crawl.into_config(contract),
    );

    // Handle Ctrl+C gracefully
    tokio::select! {
        result = crawler.run() => {
            result.context("Crawler error")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    info!("Crawler stopped");
    Ok(())
}
