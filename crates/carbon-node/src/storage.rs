//! Persistent block storage behind a key-value interface.
//!
//! The consensus core consumes a plain key-value store with atomic batches;
//! [`MemoryKv`] backs tests and [`RocksKv`] production nodes. Keyspaces:
//!
//! | prefix    | value                                   |
//! |-----------|------------------------------------------|
//! | `block/`  | canonical block bytes, keyed by hash     |
//! | `tx/`     | containing block hash, keyed by txid     |
//! | `utxo/`   | canonical entry bytes, keyed by outpoint |
//! | `cert/`   | canonical certificate record             |
//! | `meta/tip`| best tip `(height, hash)`                |
//!
//! Storage failures are fatal by policy: they abort startup or halt further
//! block acceptance rather than limp along with a torn view.

use std::collections::BTreeMap;
use std::path::Path;

use parking_lot::RwLock;

use carbon_core::codec::{Decodable, Encodable, Reader};
use carbon_core::error::{CodecError, StorageError};
use carbon_core::types::{Block, CertificateId, Hash256, UtxoKey};

/// Buffered mutations applied atomically by [`KvStore::write_batch`].
#[derive(Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key, value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete(key));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// The key-value interface the node consumes.
pub trait KvStore: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;
    fn delete(&self, key: &[u8]) -> Result<(), StorageError>;
    /// All `(key, value)` pairs under a prefix, in key order.
    fn iterate(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;
    /// Apply a batch atomically: all mutations or none.
    fn write_batch(&self, batch: WriteBatch) -> Result<(), StorageError>;
}

/// Key construction for the fixed keyspaces.
pub mod keys {
    use super::*;

    pub const TIP: &[u8] = b"meta/tip";
    pub const BLOCK_PREFIX: &[u8] = b"block/";
    pub const TX_PREFIX: &[u8] = b"tx/";
    pub const UTXO_PREFIX: &[u8] = b"utxo/";
    pub const CERT_PREFIX: &[u8] = b"cert/";

    pub fn block(hash: &Hash256) -> Vec<u8> {
        [BLOCK_PREFIX, hash.as_bytes().as_slice()].concat()
    }

    pub fn tx(txid: &Hash256) -> Vec<u8> {
        [TX_PREFIX, txid.as_bytes().as_slice()].concat()
    }

    pub fn utxo(key: &UtxoKey) -> Vec<u8> {
        let mut out = UTXO_PREFIX.to_vec();
        out.extend_from_slice(key.txid.as_bytes());
        out.extend_from_slice(&key.index.to_be_bytes());
        out
    }

    pub fn cert(id: &CertificateId) -> Vec<u8> {
        [CERT_PREFIX, id.as_str().as_bytes()].concat()
    }
}

/// In-memory store for tests. No persistence, no crash safety.
#[derive(Default)]
pub struct MemoryKv {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        self.data.write().remove(key);
        Ok(())
    }

    fn iterate(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        Ok(self
            .data
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut data = self.data.write();
        for op in batch.ops {
            match op {
                BatchOp::Put(key, value) => {
                    data.insert(key, value);
                }
                BatchOp::Delete(key) => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// RocksDB-backed store for production nodes.
pub struct RocksKv {
    db: rocksdb::DB,
}

impl RocksKv {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let mut options = rocksdb::Options::default();
        options.create_if_missing(true);
        let db = rocksdb::DB::open(&options, path)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(Self { db })
    }
}

impl KvStore for RocksKv {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.db
            .put(key, value)
            .map_err(|e| StorageError::Io(e.to_string()))
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.db
            .get(key)
            .map_err(|e| StorageError::Io(e.to_string()))
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        self.db
            .delete(key)
            .map_err(|e| StorageError::Io(e.to_string()))
    }

    fn iterate(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let mut out = Vec::new();
        let iter = self.db.prefix_iterator(prefix);
        for item in iter {
            let (key, value) = item.map_err(|e| StorageError::Io(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut rocks_batch = rocksdb::WriteBatch::default();
        for op in batch.ops {
            match op {
                BatchOp::Put(key, value) => rocks_batch.put(key, value),
                BatchOp::Delete(key) => rocks_batch.delete(key),
            }
        }
        self.db
            .write(rocks_batch)
            .map_err(|e| StorageError::Io(e.to_string()))
    }
}

// ----------------------------------------------------------------------
// Chain persistence helpers
// ----------------------------------------------------------------------

/// Encoded best-tip pointer.
fn encode_tip(height: u64, hash: &Hash256) -> Vec<u8> {
    let mut out = Vec::with_capacity(40);
    out.extend_from_slice(&height.to_be_bytes());
    out.extend_from_slice(hash.as_bytes());
    out
}

fn decode_tip(bytes: &[u8]) -> Result<(u64, Hash256), CodecError> {
    let mut reader = Reader::new(bytes);
    let height = reader.read_u64()?;
    let hash = Hash256::decode_from(&mut reader)?;
    Ok((height, hash))
}

/// Persist a newly accepted block and advance the stored tip.
pub fn persist_block(
    store: &dyn KvStore,
    block: &Block,
    tip_height: u64,
    tip_hash: &Hash256,
) -> Result<(), StorageError> {
    let mut batch = WriteBatch::new();
    let block_hash = block.header.hash();
    batch.put(keys::block(&block_hash), block.encoded());
    for tx in &block.transactions {
        batch.put(keys::tx(&tx.txid()), block_hash.as_bytes().to_vec());
    }
    batch.put(keys::TIP.to_vec(), encode_tip(tip_height, tip_hash));
    store.write_batch(batch)
}

/// Read the stored tip, if a chain has been persisted.
pub fn load_tip(store: &dyn KvStore) -> Result<Option<(u64, Hash256)>, StorageError> {
    match store.get(keys::TIP)? {
        None => Ok(None),
        Some(bytes) => decode_tip(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Corrupt(format!("tip pointer: {e}"))),
    }
}

/// Load the best chain above genesis, oldest first, by walking the stored
/// tip's ancestry. Used on startup to rebuild in-memory state by replay.
pub fn load_best_chain(store: &dyn KvStore) -> Result<Vec<Block>, StorageError> {
    let Some((_, tip_hash)) = load_tip(store)? else {
        return Ok(Vec::new());
    };

    let genesis_hash = carbon_core::genesis::genesis_hash();
    let mut blocks = Vec::new();
    let mut cursor = tip_hash;
    while cursor != genesis_hash {
        let bytes = store
            .get(&keys::block(&cursor))?
            .ok_or_else(|| StorageError::MissingKey(format!("block/{cursor}")))?;
        let block = Block::decode_all(&bytes)
            .map_err(|e| StorageError::Corrupt(format!("block/{cursor}: {e}")))?;
        cursor = block.header.prev_hash;
        blocks.push(block);
    }
    blocks.reverse();
    Ok(blocks)
}
