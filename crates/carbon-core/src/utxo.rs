//! In-memory unspent-output set.
//!
//! Entries live in a contiguous arena and are addressed by compact slot
//! handles; the primary index maps [`UtxoKey`] → handle and the secondary
//! index maps recipient address → handle set. This keeps per-output
//! allocation churn low at high throughput and makes the two indexes cheap
//! to keep coherent: every mutation updates both or neither.
//!
//! [`snapshot`](UtxoSet::snapshot) / [`restore`](UtxoSet::restore) provide the
//! logical copy used to protect reorg attempts.
//!
//! Not thread-safe on its own; the chain manager wraps the set in the single
//! writer lock that also guards the certificate registry and the tip.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::error::UtxoError;
use crate::types::{CoinState, UtxoEntry, UtxoKey};

/// Per-address balance summary.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Balance {
    /// Sum of all unspent output amounts at the address.
    pub total: u64,
    /// Portion carried by `Certified` outputs.
    pub certified: u64,
    /// Portion carried by `Compensated` (burn) outputs.
    pub compensated: u64,
}

#[derive(Clone, Debug)]
struct Slot {
    key: UtxoKey,
    entry: UtxoEntry,
}

/// Point-in-time copy of a [`UtxoSet`], consumed by [`UtxoSet::restore`].
#[derive(Clone)]
pub struct UtxoSnapshot {
    arena: Vec<Option<Slot>>,
    free: Vec<u32>,
    index: HashMap<UtxoKey, u32>,
    by_address: HashMap<Address, BTreeSet<u32>>,
}

/// The unspent transaction output set with an address secondary index.
#[derive(Clone, Default)]
pub struct UtxoSet {
    arena: Vec<Option<Slot>>,
    free: Vec<u32>,
    index: HashMap<UtxoKey, u32>,
    by_address: HashMap<Address, BTreeSet<u32>>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new unspent output.
    pub fn add(&mut self, key: UtxoKey, entry: UtxoEntry) -> Result<(), UtxoError> {
        if self.index.contains_key(&key) {
            return Err(UtxoError::UtxoExists(key.to_string()));
        }

        let address = entry.output.address;
        let handle = match self.free.pop() {
            Some(handle) => {
                self.arena[handle as usize] = Some(Slot { key, entry });
                handle
            }
            None => {
                self.arena.push(Some(Slot { key, entry }));
                (self.arena.len() - 1) as u32
            }
        };

        self.index.insert(key, handle);
        self.by_address.entry(address).or_default().insert(handle);
        Ok(())
    }

    /// Look up an unspent output.
    pub fn get(&self, key: &UtxoKey) -> Option<&UtxoEntry> {
        let handle = *self.index.get(key)?;
        self.arena[handle as usize].as_ref().map(|slot| &slot.entry)
    }

    pub fn contains(&self, key: &UtxoKey) -> bool {
        self.index.contains_key(key)
    }

    /// Remove and return an unspent output.
    pub fn remove(&mut self, key: &UtxoKey) -> Result<UtxoEntry, UtxoError> {
        let handle = self
            .index
            .remove(key)
            .ok_or_else(|| UtxoError::UtxoNotFound(key.to_string()))?;

        let slot = self.arena[handle as usize]
            .take()
            .expect("index handle points at an occupied slot");
        self.free.push(handle);

        if let Some(handles) = self.by_address.get_mut(&slot.entry.output.address) {
            handles.remove(&handle);
            if handles.is_empty() {
                self.by_address.remove(&slot.entry.output.address);
            }
        }
        Ok(slot.entry)
    }

    /// Balance summary for an address, computed from the secondary index.
    pub fn balance(&self, address: &Address) -> Balance {
        let mut balance = Balance::default();
        let Some(handles) = self.by_address.get(address) else {
            return balance;
        };
        for handle in handles {
            let slot = self.arena[*handle as usize]
                .as_ref()
                .expect("address index handle points at an occupied slot");
            balance.total += slot.entry.output.amount;
            match slot.entry.output.coin_state {
                CoinState::Plain => {}
                CoinState::Certified => balance.certified += slot.entry.output.amount,
                CoinState::Compensated => balance.compensated += slot.entry.output.amount,
            }
        }
        balance
    }

    /// All unspent outputs held by an address, ordered by arena handle.
    pub fn list_by_address(&self, address: &Address) -> Vec<(UtxoKey, UtxoEntry)> {
        let Some(handles) = self.by_address.get(address) else {
            return Vec::new();
        };
        handles
            .iter()
            .map(|handle| {
                let slot = self.arena[*handle as usize]
                    .as_ref()
                    .expect("address index handle points at an occupied slot");
                (slot.key, slot.entry.clone())
            })
            .collect()
    }

    /// Iterate over every unspent output.
    pub fn iter(&self) -> impl Iterator<Item = (&UtxoKey, &UtxoEntry)> {
        self.arena
            .iter()
            .filter_map(|slot| slot.as_ref().map(|s| (&s.key, &s.entry)))
    }

    /// Number of unspent outputs.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Take a logical copy of the whole set.
    pub fn snapshot(&self) -> UtxoSnapshot {
        UtxoSnapshot {
            arena: self.arena.clone(),
            free: self.free.clone(),
            index: self.index.clone(),
            by_address: self.by_address.clone(),
        }
    }

    /// Revert the set to a previously taken snapshot.
    pub fn restore(&mut self, snapshot: UtxoSnapshot) {
        self.arena = snapshot.arena;
        self.free = snapshot.free;
        self.index = snapshot.index;
        self.by_address = snapshot.by_address;
    }

    /// Debug check: the secondary index agrees with the primary mapping.
    #[cfg(test)]
    fn indexes_coherent(&self) -> bool {
        let secondary: usize = self.by_address.values().map(|s| s.len()).sum();
        if secondary != self.index.len() {
            return false;
        }
        self.index.iter().all(|(key, handle)| {
            self.arena[*handle as usize]
                .as_ref()
                .is_some_and(|slot| slot.key == *key)
        })
    }
}
