//! Store traits and RocksDB implementation
//!
//! Provides the persistence primitives of the indexer: the transfer log,
//! per-contract checkpoints, the block timestamp index and the balance cache.
//! Uses RocksDB with column families for efficient organization.
//!
//! Crawl writes go through [`IndexTransaction`], a `WriteBatch` that is
//! applied atomically on commit and discarded on every other path.

use crate::keys::{
    decode_timestamp_key, encode_balance_cache_key, encode_checkpoint_key,
    encode_meta_key, encode_timestamp_key, encode_transfer_id_key, encode_transfer_key,
    META_NEXT_TRANSFER_ID,
};
use crate::records::{Checkpoint, OwnerBalances, TimestampEntry, TransferRecord};
use alloy_primitives::{Address, B256};
use anyhow::{Context, Result};
use chrono::Utc;
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

const CF_TRANSFERS: &str = "transfers";
const CF_TRANSFER_IDS: &str = "transfer_ids";
const CF_CHECKPOINTS: &str = "checkpoints";
const CF_BLOCK_TIMESTAMP: &str = "block_timestamp";
const CF_BALANCE_CACHE: &str = "balance_cache";
const CF_META: &str = "meta";

/// Read access to the append-only transfer log.
pub trait TransferStore: Send + Sync {
    /// Visit every transfer, grouped by token id and ordered by (block, log index).
    fn for_each_transfer(&self, visit: &mut dyn FnMut(TransferRecord) -> Result<()>) -> Result<()>;

    /// Look up one transfer by its identity.
    fn get_transfer(&self, tx_hash: B256, log_index: u64) -> Result<Option<TransferRecord>>;

    /// Number of stored transfers.
    fn transfer_count(&self) -> Result<u64>;
}

/// Per-contract crawl cursor.
pub trait CheckpointStore: Send + Sync {
    fn get_checkpoint(&self, contract: Address) -> Result<Option<Checkpoint>>;

    /// Return the checkpoint for `contract`, creating and persisting it at
    /// `start_block` when none exists yet.
    fn init_checkpoint(&self, contract: Address, start_block: u64) -> Result<Checkpoint>;
}

/// Block number lookup by timestamp.
pub trait TimestampIndex: Send + Sync {
    /// Largest indexed block whose timestamp is at or before `timestamp_ms`.
    fn nearest_block_at_or_before(&self, timestamp_ms: u64) -> Result<Option<u64>>;
}

/// Balance snapshots keyed by block number.
pub trait BalanceCache: Send + Sync {
    fn get_balances(&self, block: u64) -> Result<Option<OwnerBalances>>;

    /// Store a snapshot. Snapshots are immutable: an existing key is left as is.
    fn put_balances(&self, block: u64, owners: &OwnerBalances) -> Result<()>;
}

/// RocksDB-backed implementation of every store trait.
///
/// Column families:
/// - transfers: transfer records keyed by (token, block, log index)
/// - transfer_ids: (tx hash, log index) -> transfer key
/// - checkpoints: per-contract cursor
/// - block_timestamp: sorted (timestamp, block) index
/// - balance_cache: `balance:<block>` -> JSON snapshot
/// - meta: counters
pub struct RocksIndexStore {
    db: DB,
}

impl RocksIndexStore {
    /// Open or create a RocksDB database at the given path.
    ///
    /// Creates all required column families if they don't exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let column_families = vec![
            ColumnFamilyDescriptor::new(CF_TRANSFERS, Options::default()),
            ColumnFamilyDescriptor::new(CF_TRANSFER_IDS, Options::default()),
            ColumnFamilyDescriptor::new(CF_CHECKPOINTS, Options::default()),
            ColumnFamilyDescriptor::new(CF_BLOCK_TIMESTAMP, Options::default()),
            ColumnFamilyDescriptor::new(CF_BALANCE_CACHE, Options::default()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, column_families)
            .context("Failed to open RocksDB database")?;

        Ok(Self { db })
    }

    /// Get a column family handle by name.
    fn get_cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .with_context(|| format!("Column family '{}' not found", name))
    }

    /// Start an atomic crawl write.
    pub fn begin(&self) -> Result<IndexTransaction<'_>> {
        let next_transfer_id = self.next_transfer_id()?;
        Ok(IndexTransaction {
            store: self,
            batch: WriteBatch::default(),
            next_transfer_id,
            identities: HashSet::new(),
            committed: false,
        })
    }

    fn next_transfer_id(&self) -> Result<u64> {
        let cf = self.get_cf(CF_META)?;
        let key = encode_meta_key(META_NEXT_TRANSFER_ID);
        match self.db.get_cf(cf, &key).context("Failed to get transfer id counter")? {
            Some(bytes) => {
                if bytes.len() != 8 {
                    anyhow::bail!("Transfer id counter must be 8 bytes (u64), got {}", bytes.len());
                }
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Ok(u64::from_be_bytes(buf))
            }
            None => Ok(1),
        }
    }

    fn transfer_exists(&self, tx_hash: B256, log_index: u64) -> Result<bool> {
        let cf = self.get_cf(CF_TRANSFER_IDS)?;
        let key = encode_transfer_id_key(tx_hash, log_index);
        Ok(self
            .db
            .get_pinned_cf(cf, &key)
            .context("Failed to check transfer identity")?
            .is_some())
    }
}

impl TransferStore for RocksIndexStore {
    fn for_each_transfer(&self, visit: &mut dyn FnMut(TransferRecord) -> Result<()>) -> Result<()> {
        let cf = self.get_cf(CF_TRANSFERS)?;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item.context("Failed to read iterator")?;
            let record: TransferRecord =
                postcard::from_bytes(&value).context("Failed to deserialize transfer record")?;
            visit(record)?;
        }
        Ok(())
    }

    fn get_transfer(&self, tx_hash: B256, log_index: u64) -> Result<Option<TransferRecord>> {
        let ids = self.get_cf(CF_TRANSFER_IDS)?;
        let transfer_key = match self
            .db
            .get_cf(ids, encode_transfer_id_key(tx_hash, log_index))
            .context("Failed to get transfer identity")?
        {
            Some(key) => key,
            None => return Ok(None),
        };
        let cf = self.get_cf(CF_TRANSFERS)?;
        match self.db.get_cf(cf, &transfer_key).context("Failed to get transfer")? {
            Some(bytes) => {
                let record = postcard::from_bytes(&bytes)
                    .context("Failed to deserialize transfer record")?;
                Ok(Some(record))
            }
            None => anyhow::bail!(
                "Transfer index points at a missing row for tx {:?} log {}",
                tx_hash,
                log_index
            ),
        }
    }

    fn transfer_count(&self) -> Result<u64> {
        let cf = self.get_cf(CF_TRANSFER_IDS)?;
        let mut count = 0u64;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item.context("Failed to read iterator")?;
            count += 1;
        }
        Ok(count)
    }
}

impl CheckpointStore for RocksIndexStore {
    fn get_checkpoint(&self, contract: Address) -> Result<Option<Checkpoint>> {
        let cf = self.get_cf(CF_CHECKPOINTS)?;
        let key = encode_checkpoint_key(contract);
        match self.db.get_cf(cf, &key).context("Failed to get checkpoint")? {
            Some(bytes) => {
                let checkpoint = postcard::from_bytes(&bytes)
                    .context("Failed to deserialize checkpoint")?;
                Ok(Some(checkpoint))
            }
            None => Ok(None),
        }
    }

    fn init_checkpoint(&self, contract: Address, start_block: u64) -> Result<Checkpoint> {
        if let Some(checkpoint) = self.get_checkpoint(contract)? {
            return Ok(checkpoint);
        }
        let checkpoint = Checkpoint::new(contract, start_block);
        let cf = self.get_cf(CF_CHECKPOINTS)?;
        let value = postcard::to_allocvec(&checkpoint).context("Failed to serialize checkpoint")?;
        self.db
            .put_cf(cf, encode_checkpoint_key(contract), &value)
            .context("Failed to put checkpoint")?;
        tracing::info!("Created checkpoint for {:?} at block {}", contract, start_block);
        Ok(checkpoint)
    }
}

impl TimestampIndex for RocksIndexStore {
    fn nearest_block_at_or_before(&self, timestamp_ms: u64) -> Result<Option<u64>> {
        let cf = self.get_cf(CF_BLOCK_TIMESTAMP)?;

        // Highest possible key for this score; seek backwards from there
        let search_key = encode_timestamp_key(timestamp_ms, u64::MAX);
        let mut iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&search_key, Direction::Reverse));

        match iter.next() {
            Some(item) => {
                let (key, _) = item.context("Failed to read iterator")?;
                let (_, block) =
                    decode_timestamp_key(&key).context("Failed to decode timestamp key")?;
                Ok(Some(block))
            }
            None => Ok(None),
        }
    }
}

impl BalanceCache for RocksIndexStore {
    fn get_balances(&self, block: u64) -> Result<Option<OwnerBalances>> {
        let cf = self.get_cf(CF_BALANCE_CACHE)?;
        match self
            .db
            .get_cf(cf, encode_balance_cache_key(block))
            .context("Failed to get cached balances")?
        {
            Some(bytes) => {
                let owners = serde_json::from_slice(&bytes)
                    .context("Failed to deserialize cached balances")?;
                Ok(Some(owners))
            }
            None => Ok(None),
        }
    }

    fn put_balances(&self, block: u64, owners: &OwnerBalances) -> Result<()> {
        let cf = self.get_cf(CF_BALANCE_CACHE)?;
        let key = encode_balance_cache_key(block);
        if self
            .db
            .get_pinned_cf(cf, &key)
            .context("Failed to check cached balances")?
            .is_some()
        {
            debug!("Balances for block {} already cached", block);
            return Ok(());
        }
        let value = serde_json::to_vec(owners).context("Failed to serialize balances")?;
        self.db
            .put_cf(cf, &key, &value)
            .context("Failed to put cached balances")?;
        Ok(())
    }
}

/// Atomic unit of one crawl cycle.
///
/// Nothing is visible until [`IndexTransaction::commit`]; dropping the
/// transaction (or calling [`IndexTransaction::rollback`]) discards every
/// staged write.
pub struct IndexTransaction<'a> {
    store: &'a RocksIndexStore,
    batch: WriteBatch,
    next_transfer_id: u64,
    identities: HashSet<(B256, u64)>,
    committed: bool,
}

impl<'a> IndexTransaction<'a> {
    /// Stage transfer rows, assigning their ids.
    ///
    /// Fails if a row with the same (tx hash, log index) is already stored
    /// or staged.
    pub fn insert_transfers(&mut self, records: Vec<TransferRecord>) -> Result<Vec<u64>> {
        let store = self.store;
        let transfers = store.get_cf(CF_TRANSFERS)?;
        let ids = store.get_cf(CF_TRANSFER_IDS)?;
        let now = Utc::now();

        let mut assigned = Vec::with_capacity(records.len());
        for mut record in records {
            let identity = (record.tx_hash, record.log_index);
            if !self.identities.insert(identity)
                || store.transfer_exists(record.tx_hash, record.log_index)?
            {
                anyhow::bail!(
                    "Transfer {:?} (log {}) is already indexed",
                    record.tx_hash,
                    record.log_index
                );
            }

            record.transfer_id = self.next_transfer_id;
            record.created_at = now;
            record.updated_at = now;
            self.next_transfer_id += 1;

            let key = encode_transfer_key(record.token_id, record.block_number, record.log_index);
            let value =
                postcard::to_allocvec(&record).context("Failed to serialize transfer record")?;
            self.batch.put_cf(transfers, &key, &value);
            self.batch.put_cf(
                ids,
                encode_transfer_id_key(record.tx_hash, record.log_index),
                &key,
            );
            assigned.push(record.transfer_id);
        }

        let meta = store.get_cf(CF_META)?;
        self.batch.put_cf(
            meta,
            encode_meta_key(META_NEXT_TRANSFER_ID),
            self.next_transfer_id.to_be_bytes(),
        );
        Ok(assigned)
    }

    /// Stage the checkpoint move to `next_block`.
    ///
    /// The cursor never moves backwards.
    pub fn advance_checkpoint(&mut self, contract: Address, next_block: u64) -> Result<()> {
        let checkpoint = match self.store.get_checkpoint(contract)? {
            Some(mut existing) => {
                if next_block < existing.next_block {
                    anyhow::bail!(
                        "Checkpoint for {:?} cannot move back from {} to {}",
                        contract,
                        existing.next_block,
                        next_block
                    );
                }
                existing.next_block = next_block;
                existing.updated_at = Utc::now();
                existing
            }
            None => Checkpoint::new(contract, next_block),
        };
        let store = self.store;
        let cf = store.get_cf(CF_CHECKPOINTS)?;
        let value = postcard::to_allocvec(&checkpoint).context("Failed to serialize checkpoint")?;
        self.batch.put_cf(cf, encode_checkpoint_key(contract), &value);
        Ok(())
    }

    /// Stage block timestamp index entries.
    pub fn append_block_timestamps(&mut self, entries: &[TimestampEntry]) -> Result<()> {
        let store = self.store;
        let cf = store.get_cf(CF_BLOCK_TIMESTAMP)?;
        for entry in entries {
            self.batch.put_cf(
                cf,
                encode_timestamp_key(entry.timestamp_ms, entry.block_number),
                b"",
            );
        }
        Ok(())
    }

    /// Apply every staged write atomically.
    pub fn commit(mut self) -> Result<()> {
        let batch = std::mem::take(&mut self.batch);
        self.store
            .db
            .write(batch)
            .context("Failed to commit index transaction")?;
        self.committed = true;
        Ok(())
    }

    /// Discard every staged write.
    pub fn rollback(self) {
        // Drop does the work
    }
}

impl Drop for IndexTransaction<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.batch.is_empty() {
            debug!("Discarding {} staged writes", self.batch.len());
        }
    }
}
