//! NFT owner balances - transfer index and historical balance lookup
//!
//! The crawler indexes an NFT contract's Transfer events and block
//! timestamps into RocksDB. The balance service reconstructs the owners at
//! a historical block and fetches their ETH balances, caching complete
//! snapshots of settled blocks.

pub mod keys;
pub mod records;
pub mod store;
pub mod cli;

// Chain access
pub mod chain;
pub mod clock;
pub mod config;
pub mod rpc;
pub mod types;

// Engines
pub mod balance;
pub mod crawler;
pub mod events;
pub mod fetcher;
pub mod ownership;

// Re-export the main types for convenience
pub use balance::{BalanceError, BalanceStores, WalletEthBalanceService};
pub use records::{Checkpoint, OwnerBalances, TimestampEntry, TransferRecord, WalletEthBalance};
pub use store::{
    BalanceCache, CheckpointStore, IndexTransaction, RocksIndexStore, TimestampIndex,
    TransferStore,
};
