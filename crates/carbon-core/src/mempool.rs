//! In-memory pool of unconfirmed transactions.
//!
//! Stores transactions that passed full validation against the current best
//! tip, indexed three ways:
//! - txid → entry (lookup, removal)
//! - spent [`UtxoKey`] → txid (conflict detection)
//! - `(fee_rate, txid)` ordered set (block template selection, eviction)
//!
//! The pool is size-bounded: when full, the lowest fee-per-byte entries are
//! evicted to make room, and a newcomer paying no more than the eviction
//! threshold is rejected outright. Entries also expire after a configured
//! horizon, driven by a caller-supplied clock.
//!
//! Validation is the caller's job (the chain manager runs stateless +
//! stateful checks before inserting); the pool itself only enforces
//! duplicates, conflicts, and capacity.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::constants::{MEMPOOL_EXPIRY_SECS, MEMPOOL_MAX_BYTES};
use crate::error::MempoolError;
use crate::types::{Block, Hash256, Transaction, UtxoKey};

/// Fee rate precision: fees are compared in milli-units per byte.
const FEE_RATE_PRECISION: u128 = 1_000;

fn compute_fee_rate(fee: u64, size: usize) -> u64 {
    if size == 0 {
        return u64::MAX;
    }
    let rate = (fee as u128) * FEE_RATE_PRECISION / (size as u128);
    rate.min(u64::MAX as u128) as u64
}

/// A pooled transaction with precomputed metadata.
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub txid: Hash256,
    /// Fee in base units.
    pub fee: u64,
    /// Canonical serialized size in bytes.
    pub size: usize,
    /// Unix seconds at admission, for expiry.
    pub entry_time: i64,
    fee_rate: u64,
}

impl MempoolEntry {
    /// Fee rate in milli-units per byte.
    pub fn fee_rate(&self) -> u64 {
        self.fee_rate
    }
}

/// Aggregate counters for the `mempool_info` query.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MempoolInfo {
    pub tx_count: usize,
    pub total_bytes: usize,
    pub total_fees: u64,
}

/// Fee-priority pool of pending transactions.
pub struct Mempool {
    entries: HashMap<Hash256, MempoolEntry>,
    by_outpoint: HashMap<UtxoKey, Hash256>,
    /// Ascending `(fee_rate, txid)`: first = cheapest (eviction candidate),
    /// iterate in reverse for block templates.
    by_fee_rate: BTreeSet<(u64, Hash256)>,
    max_bytes: usize,
    expiry_secs: i64,
    total_bytes: usize,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new(MEMPOOL_MAX_BYTES, MEMPOOL_EXPIRY_SECS)
    }
}

impl Mempool {
    pub fn new(max_bytes: usize, expiry_secs: i64) -> Self {
        Self {
            entries: HashMap::new(),
            by_outpoint: HashMap::new(),
            by_fee_rate: BTreeSet::new(),
            max_bytes,
            expiry_secs,
            total_bytes: 0,
        }
    }

    /// Admit a validated transaction.
    ///
    /// `fee` comes from stateful validation; `now` is Unix seconds. When the
    /// pool is over capacity, cheaper entries are evicted until the newcomer
    /// fits; a newcomer at or below the eviction threshold is rejected with
    /// [`MempoolError::MempoolFull`].
    pub fn insert(&mut self, tx: Transaction, fee: u64, now: i64) -> Result<Hash256, MempoolError> {
        let txid = tx.txid();
        if self.entries.contains_key(&txid) {
            return Err(MempoolError::AlreadyExists(txid.to_string()));
        }

        for input in &tx.inputs {
            if let Some(existing) = self.by_outpoint.get(&input.previous_output) {
                return Err(MempoolError::TransactionConflict {
                    existing_txid: existing.to_string(),
                    utxo_key: input.previous_output.to_string(),
                });
            }
        }

        let size = tx.size();
        let fee_rate = compute_fee_rate(fee, size);

        // Evict the cheapest entries until the newcomer fits.
        while self.total_bytes + size > self.max_bytes && !self.entries.is_empty() {
            let &(lowest_rate, lowest_txid) = self
                .by_fee_rate
                .iter()
                .next()
                .expect("non-empty pool has a cheapest entry");
            if lowest_rate >= fee_rate {
                return Err(MempoolError::MempoolFull);
            }
            self.remove_entry(lowest_txid);
        }
        if self.total_bytes + size > self.max_bytes {
            return Err(MempoolError::MempoolFull);
        }

        for input in &tx.inputs {
            self.by_outpoint.insert(input.previous_output, txid);
        }
        self.by_fee_rate.insert((fee_rate, txid));
        self.total_bytes += size;
        self.entries.insert(
            txid,
            MempoolEntry {
                tx,
                txid,
                fee,
                size,
                entry_time: now,
                fee_rate,
            },
        );
        Ok(txid)
    }

    /// Remove a transaction by txid, returning it if present.
    pub fn remove(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        self.remove_entry(*txid)
    }

    fn remove_entry(&mut self, txid: Hash256) -> Option<MempoolEntry> {
        let entry = self.entries.remove(&txid)?;
        for input in &entry.tx.inputs {
            self.by_outpoint.remove(&input.previous_output);
        }
        self.by_fee_rate.remove(&(entry.fee_rate, txid));
        self.total_bytes -= entry.size;
        Some(entry)
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    /// Whether any input of `tx` is already spent by a pooled transaction.
    pub fn has_conflict(&self, tx: &Transaction) -> bool {
        tx.inputs
            .iter()
            .any(|input| self.by_outpoint.contains_key(&input.previous_output))
    }

    /// Select transactions for a block template: descending fee rate,
    /// greedily filling `max_block_bytes`.
    pub fn select_transactions(&self, max_block_bytes: usize) -> Vec<&MempoolEntry> {
        let mut selected = Vec::new();
        let mut remaining = max_block_bytes;
        for (_, txid) in self.by_fee_rate.iter().rev() {
            if remaining == 0 {
                break;
            }
            if let Some(entry) = self.entries.get(txid) {
                if entry.size <= remaining {
                    remaining -= entry.size;
                    selected.push(entry);
                }
            }
        }
        selected
    }

    /// Drop everything a newly connected block made redundant: the included
    /// transactions themselves, plus any pooled transaction now conflicting
    /// with the block's spent outpoints.
    pub fn remove_confirmed_block(&mut self, block: &Block) {
        let mut spent: HashSet<UtxoKey> = HashSet::new();
        for tx in &block.transactions {
            self.remove_entry(tx.txid());
            for input in &tx.inputs {
                spent.insert(input.previous_output);
            }
        }

        let conflicting: Vec<Hash256> = spent
            .iter()
            .filter_map(|key| self.by_outpoint.get(key).copied())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        for txid in conflicting {
            self.remove_entry(txid);
        }
    }

    /// Evict entries older than the expiry horizon. Returns evicted txids.
    pub fn evict_expired(&mut self, now: i64) -> Vec<Hash256> {
        let horizon = now - self.expiry_secs;
        let expired: Vec<Hash256> = self
            .entries
            .values()
            .filter(|entry| entry.entry_time < horizon)
            .map(|entry| entry.txid)
            .collect();
        for txid in &expired {
            self.remove_entry(*txid);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn info(&self) -> MempoolInfo {
        MempoolInfo {
            tx_count: self.entries.len(),
            total_bytes: self.total_bytes,
            total_fees: self.entries.values().map(|e| e.fee).sum(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.entries.values()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.entries.keys().copied().collect()
    }
}
