//! Chain state management: best-chain tracking, block application and
//! rollback, reorganization, mempool admission, and the query surface.
//!
//! A [`ChainManager`] owns the block index (including side branches), the
//! authoritative UTXO set, the certificate registry, and the mempool, all
//! behind one `RwLock` so readers always observe a consistent
//! (tip, UTXO, registry) triple. Block application takes the write lock for
//! its full duration; no two blocks are ever applied concurrently.
//!
//! The best chain is the branch with the greatest cumulative work
//! (Σ 2^difficulty over its headers), ties broken first-seen. A block
//! extending a side branch is structurally checked and stored; when its
//! branch overtakes the tip, the manager rolls back to the fork point and
//! applies the new branch, restoring the original state if any block in the
//! new branch fails full validation.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use carbon_core::address::{Address, Network};
use carbon_core::block_validation::{self, BlockContext};
use carbon_core::certificate::{CertificateFilter, CertificateRegistry};
use carbon_core::constants::{MAX_BLOCK_SIZE, TIMESTAMP_MEDIAN_WINDOW};
use carbon_core::difficulty;
use carbon_core::error::{ChainError, ChainStateError, MempoolError};
use carbon_core::genesis;
use carbon_core::mempool::{Mempool, MempoolInfo};
use carbon_core::merkle;
use carbon_core::subsidy;
use carbon_core::types::{
    Block, BlockHeader, CertificateId, CertificateRecord, CoinState, Hash256, Transaction, TxKind,
    TxOutput, UtxoEntry, UtxoKey,
};
use carbon_core::utxo::{Balance, UtxoSet};
use carbon_core::validation;

/// How a processed block changed the chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Extended the best chain.
    Connected,
    /// Stored on a side branch; the best chain is unchanged.
    SideChain,
    /// Triggered a reorganization onto the block's branch.
    Reorged { disconnected: u64, connected: u64 },
}

/// Supply accounting derived from the UTXO set.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SupplyInfo {
    /// Sum of every unspent output, burn outputs included.
    pub total: u64,
    /// Value retired onto the burn sink (out of circulation, kept for audit).
    pub burned: u64,
}

impl SupplyInfo {
    pub fn circulating(&self) -> u64 {
        self.total - self.burned
    }
}

struct StoredBlock {
    block: Block,
    /// Cumulative work from genesis through this block.
    total_work: u128,
}

/// Everything guarded by the chain lock.
struct ChainInner {
    /// Every known block, side branches included.
    blocks: HashMap<Hash256, StoredBlock>,
    /// Blocks (and therefore branches) proven invalid.
    invalid: HashSet<Hash256>,
    /// Best-chain hash per height; index = height.
    best_chain: Vec<Hash256>,
    /// txid → containing block hash, best chain only.
    tx_index: HashMap<Hash256, Hash256>,
    /// Spent entries per connected block, for rollback.
    undo: HashMap<Hash256, Vec<(UtxoKey, UtxoEntry)>>,
    utxos: UtxoSet,
    registry: CertificateRegistry,
    mempool: Mempool,
}

impl ChainInner {
    fn tip_hash(&self) -> Hash256 {
        *self.best_chain.last().expect("genesis is always connected")
    }

    fn tip_height(&self) -> u64 {
        (self.best_chain.len() - 1) as u64
    }

    fn tip_work(&self) -> u128 {
        self.blocks[&self.tip_hash()].total_work
    }

    fn header(&self, hash: &Hash256) -> Option<&BlockHeader> {
        self.blocks.get(hash).map(|stored| &stored.block.header)
    }

    /// Walk back from `from` to the header at `height` on that branch.
    fn branch_header_at(&self, from: Hash256, height: u64) -> Option<&BlockHeader> {
        let mut cursor = self.header(&from)?;
        if height > cursor.height {
            return None;
        }
        while cursor.height > height {
            cursor = self.header(&cursor.prev_hash)?;
        }
        Some(cursor)
    }

    /// Median of the last ≤11 timestamps of the branch ending at `parent`.
    fn median_time_past(&self, parent: Hash256) -> i64 {
        let mut timestamps = Vec::with_capacity(TIMESTAMP_MEDIAN_WINDOW);
        let mut cursor = self.header(&parent);
        while let Some(header) = cursor {
            timestamps.push(header.timestamp);
            if timestamps.len() == TIMESTAMP_MEDIAN_WINDOW || header.height == 0 {
                break;
            }
            cursor = self.header(&header.prev_hash);
        }
        block_validation::median_time_past(&timestamps)
    }

    /// Expected difficulty for the child of `parent`.
    fn expected_difficulty(&self, parent: &BlockHeader, parent_hash: Hash256) -> u32 {
        difficulty::expected_difficulty(parent.height + 1, parent.difficulty, |height| {
            self.branch_header_at(parent_hash, height).map(|h| h.timestamp)
        })
    }

    /// Full validation context for a block extending `parent`.
    fn context_for(&self, parent: &BlockHeader, parent_hash: Hash256, now: i64) -> BlockContext {
        BlockContext {
            height: parent.height + 1,
            prev_hash: parent_hash,
            median_time_past: self.median_time_past(parent_hash),
            expected_difficulty: self.expected_difficulty(parent, parent_hash),
            current_time: now,
            subsidy: subsidy::block_subsidy(parent.height + 1),
        }
    }

    /// Apply a fully validated block's effects. Mutations are ordered so the
    /// undo record is complete before anything becomes visible.
    fn apply_block(&mut self, block: &Block) -> Result<(), ChainError> {
        let block_hash = block.header.hash();
        let mut spent = Vec::new();

        for tx in &block.transactions {
            for input in &tx.inputs {
                let entry = self.utxos.remove(&input.previous_output)?;
                spent.push((input.previous_output, entry));
            }
            let txid = tx.txid();
            for (index, output) in tx.outputs.iter().enumerate() {
                self.utxos.add(
                    UtxoKey::new(txid, index as u32),
                    UtxoEntry {
                        output: output.clone(),
                        height: block.header.height,
                        is_coinbase: tx.is_coinbase(),
                    },
                )?;
            }
            block_validation::stage_certificate_effects(tx, &mut self.registry)
                .map_err(ChainError::Transaction)?;
            self.tx_index.insert(txid, block_hash);
        }

        self.undo.insert(block_hash, spent);
        self.best_chain.push(block_hash);
        self.mempool.remove_confirmed_block(block);
        Ok(())
    }

    /// Disconnect the tip block, returning its non-coinbase transactions for
    /// possible mempool re-admission.
    fn rollback_tip(&mut self) -> Result<Vec<Transaction>, ChainError> {
        if self.best_chain.len() == 1 {
            return Err(ChainStateError::EmptyChain.into());
        }
        let tip_hash = self.tip_hash();
        let block = self.blocks[&tip_hash].block.clone();

        // Certificate counters decrement in reverse transaction order so an
        // issue never unwinds before its same-block assignments.
        for tx in block.transactions.iter().rev() {
            let txid = tx.txid();
            for (index, _) in tx.outputs.iter().enumerate() {
                self.utxos.remove(&UtxoKey::new(txid, index as u32))?;
            }
            match &tx.kind {
                TxKind::Coinbase | TxKind::Transfer => {}
                TxKind::CertificateIssue(payload) => {
                    self.registry.revert_issue(&payload.certificate_id)?;
                }
                TxKind::CertificateAssign => {
                    let (id, amount) = block_validation::assign_delta(tx);
                    self.registry.revert_assign(id, amount)?;
                }
                TxKind::Compensation => {
                    let (id, amount) = block_validation::compensation_delta(tx);
                    self.registry.revert_compensate(id, amount)?;
                }
            }
            self.tx_index.remove(&txid);
        }

        let spent = self
            .undo
            .remove(&tip_hash)
            .ok_or_else(|| ChainStateError::BlockNotFound(tip_hash.to_string()))?;
        for (key, entry) in spent {
            self.utxos.add(key, entry)?;
        }

        self.best_chain.pop();
        Ok(block
            .transactions
            .into_iter()
            .filter(|tx| !tx.is_coinbase())
            .collect())
    }

    /// Hashes from the new branch tip down to (excluding) the fork point.
    fn branch_to(&self, tip: Hash256) -> Result<Vec<Hash256>, ChainError> {
        let on_best: HashSet<Hash256> = self.best_chain.iter().copied().collect();
        let mut path = Vec::new();
        let mut cursor = tip;
        while !on_best.contains(&cursor) {
            path.push(cursor);
            cursor = self
                .header(&cursor)
                .ok_or_else(|| ChainStateError::BlockNotFound(cursor.to_string()))?
                .prev_hash;
        }
        path.reverse();
        Ok(path)
    }
}

/// The chain manager: consensus state plus the query surface.
///
/// Construct one per node (or per test); there is no process-global chain.
pub struct ChainManager {
    inner: RwLock<ChainInner>,
    network: Network,
    clock: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl ChainManager {
    /// Create a manager with the genesis block connected, using wall-clock
    /// time.
    pub fn new(network: Network) -> Self {
        Self::with_clock(network, || chrono::Utc::now().timestamp())
    }

    /// Create a manager with an injected clock (tests, simulations).
    pub fn with_clock(network: Network, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        let genesis_block = genesis::genesis_block().clone();
        let genesis_hash = genesis::genesis_hash();

        let mut inner = ChainInner {
            blocks: HashMap::new(),
            invalid: HashSet::new(),
            best_chain: Vec::new(),
            tx_index: HashMap::new(),
            undo: HashMap::new(),
            utxos: UtxoSet::new(),
            registry: CertificateRegistry::new(),
            mempool: Mempool::default(),
        };
        inner.blocks.insert(
            genesis_hash,
            StoredBlock {
                block: genesis_block.clone(),
                total_work: genesis_block.header.work(),
            },
        );
        inner
            .apply_block(&genesis_block)
            .expect("genesis applies onto an empty state");

        Self {
            inner: RwLock::new(inner),
            network,
            clock: Box::new(clock),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    // ------------------------------------------------------------------
    // Block processing
    // ------------------------------------------------------------------

    /// Validate and incorporate a block received from mining or the network.
    pub fn process_block(&self, block: &Block) -> Result<BlockOutcome, ChainError> {
        let mut inner = self.inner.write();
        let block_hash = block.header.hash();

        if inner.blocks.contains_key(&block_hash) {
            return Err(ChainStateError::DuplicateBlock(block_hash.to_string()).into());
        }
        if inner.invalid.contains(&block.header.prev_hash) {
            return Err(ChainStateError::InvalidBranch(block_hash.to_string()).into());
        }
        let parent_hash = block.header.prev_hash;
        let Some(parent) = inner.blocks.get(&parent_hash) else {
            return Err(ChainStateError::UnknownParent(parent_hash.to_string()).into());
        };
        let parent_header = parent.block.header.clone();
        let total_work = parent.total_work.saturating_add(block.header.work());
        let now = (self.clock)();

        let context = inner.context_for(&parent_header, parent_hash, now);

        if parent_hash == inner.tip_hash() {
            // Extends the best chain: full validation against live state.
            let validated = block_validation::validate_block(
                block,
                &context,
                |key| inner.utxos.get(key).cloned(),
                &inner.registry,
            );
            if let Err(err) = validated {
                inner.invalid.insert(block_hash);
                return Err(err.into());
            }

            inner.blocks.insert(block_hash, StoredBlock { block: block.clone(), total_work });
            inner.apply_block(block)?;
            info!(height = block.header.height, hash = %block_hash, "block connected");
            return Ok(BlockOutcome::Connected);
        }

        // Side branch: header-level checks only; stateful validation happens
        // if and when the branch becomes best.
        if let Err(err) = Self::check_side_block(block, &context) {
            inner.invalid.insert(block_hash);
            return Err(err);
        }
        inner.blocks.insert(block_hash, StoredBlock { block: block.clone(), total_work });

        if total_work > inner.tip_work() {
            let outcome = Self::reorg_to(&mut inner, block_hash, now)?;
            return Ok(outcome);
        }

        debug!(height = block.header.height, hash = %block_hash, "side-chain block stored");
        Ok(BlockOutcome::SideChain)
    }

    /// Header and structure checks applied to side-branch blocks.
    fn check_side_block(block: &Block, context: &BlockContext) -> Result<(), ChainError> {
        block_validation::validate_block_structure(block).map_err(ChainError::Block)?;
        if block.header.height != context.height {
            return Err(carbon_core::error::BlockError::HeightMismatch {
                expected: context.height,
                got: block.header.height,
            }
            .into());
        }
        if block.header.difficulty != context.expected_difficulty {
            return Err(carbon_core::error::BlockError::InvalidDifficulty {
                got: block.header.difficulty,
                expected: context.expected_difficulty,
            }
            .into());
        }
        if block.header.timestamp <= context.median_time_past {
            return Err(carbon_core::error::BlockError::TimestampNotAfterMedian {
                got: block.header.timestamp,
                median: context.median_time_past,
            }
            .into());
        }
        Ok(())
    }

    /// Switch the best chain to the branch ending at `new_tip`.
    ///
    /// The pre-reorg state is snapshotted; if any block of the new branch
    /// fails validation the snapshot is restored, the offender is marked
    /// invalid, and `ReorgAborted` is returned.
    fn reorg_to(
        inner: &mut ChainInner,
        new_tip: Hash256,
        now: i64,
    ) -> Result<BlockOutcome, ChainError> {
        let new_branch = inner.branch_to(new_tip)?;
        let fork_parent = inner
            .header(&new_branch[0])
            .expect("branch blocks are stored")
            .prev_hash;
        let fork_height = inner
            .header(&fork_parent)
            .expect("fork point is stored")
            .height;

        info!(
            fork_height,
            new_tip = %new_tip,
            blocks_in = new_branch.len(),
            "reorganizing to heavier branch",
        );

        // Snapshot everything the reorg can touch.
        let utxo_snapshot = inner.utxos.snapshot();
        let registry_snapshot = inner.registry.snapshot();
        let best_chain_snapshot = inner.best_chain.clone();
        let tx_index_snapshot = inner.tx_index.clone();
        let undo_snapshot: HashMap<Hash256, Vec<(UtxoKey, UtxoEntry)>> = inner.undo.clone();

        // Roll back to the fork point, collecting displaced transactions.
        let mut displaced: Vec<Transaction> = Vec::new();
        let mut disconnected = 0u64;
        while inner.tip_height() > fork_height {
            displaced.extend(inner.rollback_tip()?);
            disconnected += 1;
        }

        // Apply the new branch with full validation.
        let mut connected = 0u64;
        for hash in &new_branch {
            let block = inner.blocks[hash].block.clone();
            let parent_hash = block.header.prev_hash;
            let parent_header = inner
                .header(&parent_hash)
                .expect("new-branch parents are stored")
                .clone();
            let context = inner.context_for(&parent_header, parent_hash, now);

            let validated = block_validation::validate_block(
                &block,
                &context,
                |key| inner.utxos.get(key).cloned(),
                &inner.registry,
            );
            if let Err(source) = validated {
                warn!(hash = %hash, error = %source, "reorg aborted: restoring original tip");
                inner.utxos.restore(utxo_snapshot);
                inner.registry.restore(registry_snapshot);
                inner.best_chain = best_chain_snapshot;
                inner.tx_index = tx_index_snapshot;
                inner.undo = undo_snapshot;
                inner.invalid.insert(*hash);
                return Err(ChainStateError::ReorgAborted {
                    hash: hash.to_string(),
                    source: Box::new(source),
                }
                .into());
            }
            inner.apply_block(&block)?;
            connected += 1;
        }

        // Re-admit displaced transactions the new branch neither confirmed
        // nor invalidated.
        let tip_height = inner.tip_height();
        for tx in displaced {
            let txid = tx.txid();
            if inner.tx_index.contains_key(&txid) || inner.mempool.has_conflict(&tx) {
                continue;
            }
            let verdict = validation::validate_transaction(
                &tx,
                |key| inner.utxos.get(key).cloned(),
                &inner.registry,
                tip_height + 1,
            );
            match verdict {
                Ok(validated) => {
                    let _ = inner.mempool.insert(tx, validated.fee, now);
                }
                Err(_) => debug!(txid = %txid, "displaced transaction not re-admitted"),
            }
        }

        Ok(BlockOutcome::Reorged { disconnected, connected })
    }

    // ------------------------------------------------------------------
    // Mempool
    // ------------------------------------------------------------------

    /// Validate a transaction against the current tip and admit it.
    ///
    /// Inputs already claimed by a pooled transaction are reported as
    /// [`MempoolError::TransactionConflict`] by the insert step.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<Hash256, MempoolError> {
        let mut inner = self.inner.write();
        let now = (self.clock)();

        let next_height = inner.tip_height() + 1;
        let validated = validation::validate_transaction(
            &tx,
            |key| inner.utxos.get(key).cloned(),
            &inner.registry,
            next_height,
        )?;

        inner.mempool.insert(tx, validated.fee, now)
    }

    /// Evict mempool entries past the expiry horizon.
    pub fn evict_expired_transactions(&self) -> Vec<Hash256> {
        let now = (self.clock)();
        self.inner.write().mempool.evict_expired(now)
    }

    pub fn mempool_info(&self) -> MempoolInfo {
        self.inner.read().mempool.info()
    }

    pub fn mempool_contains(&self, txid: &Hash256) -> bool {
        self.inner.read().mempool.contains(txid)
    }

    pub fn mempool_txids(&self) -> Vec<Hash256> {
        self.inner.read().mempool.txids()
    }

    // ------------------------------------------------------------------
    // Block template
    // ------------------------------------------------------------------

    /// Assemble an unmined block paying `miner` the subsidy plus fees of the
    /// selected mempool transactions.
    ///
    /// Candidates that no longer validate against the tip (stale entries,
    /// intra-template conflicts) are skipped, not fatal.
    pub fn build_block_template(&self, miner: &Address) -> Block {
        let inner = self.inner.read();
        let now = (self.clock)();

        let tip_hash = inner.tip_hash();
        let parent = inner.header(&tip_hash).expect("tip is stored").clone();
        let height = parent.height + 1;
        let context = inner.context_for(&parent, tip_hash, now);

        // Leave room for the header and coinbase.
        let budget = MAX_BLOCK_SIZE - 4096;
        let candidates: Vec<Transaction> = inner
            .mempool
            .select_transactions(budget)
            .into_iter()
            .map(|entry| entry.tx.clone())
            .collect();

        let mut spent: HashSet<UtxoKey> = HashSet::new();
        let mut created: HashMap<UtxoKey, UtxoEntry> = HashMap::new();
        let mut scratch = inner.registry.clone();
        let mut included: Vec<Transaction> = Vec::new();
        let mut total_fees: u64 = 0;

        for tx in candidates {
            if tx.inputs.iter().any(|input| spent.contains(&input.previous_output)) {
                continue;
            }
            let validated = validation::validate_transaction(
                &tx,
                |key| {
                    if spent.contains(key) {
                        return None;
                    }
                    created.get(key).cloned().or_else(|| inner.utxos.get(key).cloned())
                },
                &scratch,
                height,
            );
            let Ok(validated) = validated else { continue };
            if block_validation::stage_certificate_effects(&tx, &mut scratch).is_err() {
                continue;
            }

            for input in &tx.inputs {
                spent.insert(input.previous_output);
            }
            let txid = tx.txid();
            for (index, output) in tx.outputs.iter().enumerate() {
                created.insert(
                    UtxoKey::new(txid, index as u32),
                    UtxoEntry {
                        output: output.clone(),
                        height,
                        is_coinbase: false,
                    },
                );
            }
            total_fees += validated.fee;
            included.push(tx);
        }

        // The height marker keeps coinbase txids unique across blocks that
        // would otherwise be identical.
        let coinbase = Transaction {
            kind: TxKind::Coinbase,
            inputs: vec![],
            outputs: vec![TxOutput {
                metadata: Some(format!("height:{height}")),
                ..TxOutput::plain(context.subsidy + total_fees, *miner)
            }],
            timestamp: now,
        };

        let mut transactions = Vec::with_capacity(1 + included.len());
        transactions.push(coinbase);
        transactions.extend(included);
        let txids: Vec<Hash256> = transactions.iter().map(|tx| tx.txid()).collect();

        Block {
            header: BlockHeader {
                height,
                prev_hash: tip_hash,
                merkle_root: merkle::merkle_root(&txids),
                timestamp: now.max(context.median_time_past + 1),
                difficulty: context.expected_difficulty,
                nonce: 0,
            },
            transactions,
        }
    }

    // ------------------------------------------------------------------
    // Query surface
    // ------------------------------------------------------------------

    /// Current best tip as `(height, hash)`.
    pub fn tip(&self) -> (u64, Hash256) {
        let inner = self.inner.read();
        (inner.tip_height(), inner.tip_hash())
    }

    /// Cumulative work of the best chain.
    pub fn tip_work(&self) -> u128 {
        self.inner.read().tip_work()
    }

    pub fn get_block_by_hash(&self, hash: &Hash256) -> Option<Block> {
        self.inner.read().blocks.get(hash).map(|stored| stored.block.clone())
    }

    pub fn get_block_by_height(&self, height: u64) -> Option<Block> {
        let inner = self.inner.read();
        let hash = inner.best_chain.get(height as usize)?;
        Some(inner.blocks[hash].block.clone())
    }

    pub fn get_header_by_height(&self, height: u64) -> Option<BlockHeader> {
        let inner = self.inner.read();
        let hash = inner.best_chain.get(height as usize)?;
        Some(inner.blocks[hash].block.header.clone())
    }

    /// Look up a transaction on the best chain or in the mempool. Returns the
    /// containing block hash for confirmed transactions.
    pub fn get_transaction(&self, txid: &Hash256) -> Option<(Transaction, Option<Hash256>)> {
        let inner = self.inner.read();
        if let Some(block_hash) = inner.tx_index.get(txid) {
            let block = &inner.blocks[block_hash].block;
            let tx = block
                .transactions
                .iter()
                .find(|tx| tx.txid() == *txid)
                .expect("indexed transaction is in its block")
                .clone();
            return Some((tx, Some(*block_hash)));
        }
        inner
            .mempool
            .get(txid)
            .map(|entry| (entry.tx.clone(), None))
    }

    pub fn get_balance(&self, address: &Address) -> Balance {
        self.inner.read().utxos.balance(address)
    }

    pub fn list_utxos(&self, address: &Address) -> Vec<(UtxoKey, UtxoEntry)> {
        self.inner.read().utxos.list_by_address(address)
    }

    pub fn get_utxo(&self, key: &UtxoKey) -> Option<UtxoEntry> {
        self.inner.read().utxos.get(key).cloned()
    }

    /// Every unspent output. Used by the node's state-mirror flush.
    pub fn all_utxos(&self) -> Vec<(UtxoKey, UtxoEntry)> {
        self.inner
            .read()
            .utxos
            .iter()
            .map(|(key, entry)| (*key, entry.clone()))
            .collect()
    }

    pub fn utxo_count(&self) -> usize {
        self.inner.read().utxos.len()
    }

    pub fn get_certificate(&self, id: &CertificateId) -> Option<CertificateRecord> {
        self.inner.read().registry.get(id).cloned()
    }

    pub fn list_certificates(&self, filter: &CertificateFilter) -> Vec<CertificateRecord> {
        self.inner.read().registry.list(filter)
    }

    /// Supply accounting per the audit rule: burn outputs stay on chain but
    /// leave circulation.
    pub fn supply_info(&self) -> SupplyInfo {
        let inner = self.inner.read();
        let mut info = SupplyInfo::default();
        for (_, entry) in inner.utxos.iter() {
            info.total += entry.output.amount;
            if entry.output.coin_state == CoinState::Compensated {
                info.burned += entry.output.amount;
            }
        }
        info
    }

    // ------------------------------------------------------------------
    // Sync support
    // ------------------------------------------------------------------

    /// Exponentially sparse locator from the tip back to genesis.
    pub fn block_locator(&self) -> Vec<Hash256> {
        let inner = self.inner.read();
        let tip_height = inner.tip_height();
        let mut locator = Vec::new();
        let mut step = 1u64;
        let mut height = tip_height as i64;
        while height > 0 {
            locator.push(inner.best_chain[height as usize]);
            if locator.len() >= 10 {
                step *= 2;
            }
            height -= step as i64;
        }
        locator.push(inner.best_chain[0]);
        locator
    }

    /// Headers after the first locator match, up to `max`.
    pub fn headers_after(&self, locator: &[Hash256], stop: &Hash256, max: usize) -> Vec<BlockHeader> {
        let inner = self.inner.read();
        let positions: HashMap<Hash256, u64> = inner
            .best_chain
            .iter()
            .enumerate()
            .map(|(height, hash)| (*hash, height as u64))
            .collect();

        // The first locator hash found on our best chain is the fork point;
        // fall back to genesis when nothing matches.
        let start = locator
            .iter()
            .find_map(|hash| positions.get(hash).copied())
            .unwrap_or(0);

        let mut headers = Vec::new();
        for height in (start + 1)..=(inner.tip_height()) {
            let hash = inner.best_chain[height as usize];
            headers.push(inner.blocks[&hash].block.header.clone());
            if hash == *stop || headers.len() >= max {
                break;
            }
        }
        headers
    }

    /// Whether a block hash is known (best chain or side branch).
    pub fn has_block(&self, hash: &Hash256) -> bool {
        self.inner.read().blocks.contains_key(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carbon_core::constants::{COIN, INITIAL_SUBSIDY, MAX_FUTURE_DRIFT};
    use carbon_core::crypto::{self, KeyPair};
    use carbon_core::types::TxInput;

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    const T0: i64 = genesis::GENESIS_TIMESTAMP;

    fn keypair(seed: u8) -> KeyPair {
        KeyPair::from_secret_bytes([seed.max(1); 32]).unwrap()
    }

    fn addr_of(kp: &KeyPair) -> Address {
        kp.address(Network::Regtest)
    }

    /// A chain whose clock sits far enough ahead that test timestamps are
    /// never "too far in the future".
    fn test_chain() -> ChainManager {
        ChainManager::with_clock(Network::Regtest, || T0 + 1_000_000)
    }

    /// Mine the template for the next block: nonce search at difficulty 1 is
    /// a handful of scrypt calls.
    fn mine_next(chain: &ChainManager, miner: &Address) -> Block {
        let mut block = chain.build_block_template(miner);
        while !block.header.meets_difficulty() {
            block.header.nonce += 1;
        }
        block
    }

    fn mine_and_connect(chain: &ChainManager, miner: &Address) -> Block {
        let block = mine_next(chain, miner);
        assert_eq!(chain.process_block(&block).unwrap(), BlockOutcome::Connected);
        block
    }

    /// Signed transfer of `amount` from a single UTXO, remainder to change.
    fn transfer(
        kp: &KeyPair,
        from: UtxoKey,
        from_amount: u64,
        amount: u64,
        to: Address,
        change: Address,
    ) -> Transaction {
        let mut outputs = vec![TxOutput::plain(amount, to)];
        if from_amount > amount {
            outputs.push(TxOutput::plain(from_amount - amount, change));
        }
        let mut tx = Transaction {
            kind: TxKind::Transfer,
            inputs: vec![TxInput::unsigned(from)],
            outputs,
            timestamp: T0 + 500,
        };
        crypto::sign_transaction_input(&mut tx, 0, kp).unwrap();
        tx
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    #[test]
    fn new_chain_sits_at_genesis() {
        let chain = test_chain();
        let (height, hash) = chain.tip();
        assert_eq!(height, 0);
        assert_eq!(hash, genesis::genesis_hash());
        assert_eq!(chain.utxo_count(), 1);
        assert_eq!(chain.supply_info().total, INITIAL_SUBSIDY);
    }

    #[test]
    fn independent_instances() {
        let a = test_chain();
        let b = test_chain();
        let miner = addr_of(&keypair(1));
        mine_and_connect(&a, &miner);
        assert_eq!(a.tip().0, 1);
        assert_eq!(b.tip().0, 0);
    }

    // ------------------------------------------------------------------
    // Mining and balances
    // ------------------------------------------------------------------

    #[test]
    fn mine_three_blocks_accumulates_subsidy() {
        let chain = test_chain();
        let miner = addr_of(&keypair(1));
        for _ in 0..3 {
            mine_and_connect(&chain, &miner);
        }
        assert_eq!(chain.tip().0, 3);
        assert_eq!(chain.get_balance(&miner).total, 150 * COIN);
    }

    // ------------------------------------------------------------------
    // Block processing edge cases
    // ------------------------------------------------------------------

    #[test]
    fn duplicate_block_rejected() {
        let chain = test_chain();
        let block = mine_and_connect(&chain, &addr_of(&keypair(1)));
        assert!(matches!(
            chain.process_block(&block),
            Err(ChainError::ChainState(ChainStateError::DuplicateBlock(_))),
        ));
    }

    #[test]
    fn unknown_parent_rejected() {
        let chain = test_chain();
        let mut block = mine_next(&chain, &addr_of(&keypair(1)));
        block.header.prev_hash = Hash256([0x99; 32]);
        assert!(matches!(
            chain.process_block(&block),
            Err(ChainError::ChainState(ChainStateError::UnknownParent(_))),
        ));
    }

    #[test]
    fn invalid_block_marks_branch() {
        let chain = test_chain();
        let miner = addr_of(&keypair(1));
        // Claim one unit above subsidy.
        let mut block = chain.build_block_template(&miner);
        block.transactions[0].outputs[0].amount += 1;
        let txids: Vec<Hash256> = block.transactions.iter().map(|tx| tx.txid()).collect();
        block.header.merkle_root = merkle::merkle_root(&txids);
        while !block.header.meets_difficulty() {
            block.header.nonce += 1;
        }
        let bad_hash = block.header.hash();
        assert!(chain.process_block(&block).is_err());

        // A child of the invalid block is refused outright.
        let child = Block {
            header: BlockHeader {
                height: 2,
                prev_hash: bad_hash,
                merkle_root: Hash256::ZERO,
                timestamp: T0 + 700,
                difficulty: 1,
                nonce: 0,
            },
            transactions: vec![],
        };
        assert!(matches!(
            chain.process_block(&child),
            Err(ChainError::ChainState(ChainStateError::InvalidBranch(_))),
        ));
    }

    #[test]
    fn future_timestamp_rejected() {
        let chain = test_chain();
        let miner = addr_of(&keypair(1));
        let mut block = chain.build_block_template(&miner);
        block.header.timestamp = T0 + 1_000_000 + MAX_FUTURE_DRIFT + 1;
        while !block.header.meets_difficulty() {
            block.header.nonce += 1;
        }
        assert!(matches!(
            chain.process_block(&block),
            Err(ChainError::Block(carbon_core::error::BlockError::TimestampTooFar(_))),
        ));
    }

    // ------------------------------------------------------------------
    // Transfers through the mempool
    // ------------------------------------------------------------------

    #[test]
    fn transfer_via_mempool_and_block() {
        let chain = test_chain();
        let alice = keypair(1);
        let bob = keypair(2);

        // Mine one block to Alice, then enough blocks elsewhere to mature it.
        let block1 = mine_and_connect(&chain, &addr_of(&alice));
        let coinbase_txid = block1.transactions[0].txid();
        let sink = addr_of(&keypair(99));
        for _ in 0..carbon_core::constants::COINBASE_MATURITY {
            mine_and_connect(&chain, &sink);
        }

        let tx = transfer(
            &alice,
            UtxoKey::new(coinbase_txid, 0),
            50 * COIN,
            40 * COIN,
            addr_of(&bob),
            addr_of(&alice),
        );
        chain.submit_transaction(tx).unwrap();
        assert_eq!(chain.mempool_info().tx_count, 1);

        mine_and_connect(&chain, &sink);
        assert_eq!(chain.mempool_info().tx_count, 0);
        assert_eq!(chain.get_balance(&addr_of(&bob)).total, 40 * COIN);
        assert_eq!(chain.get_balance(&addr_of(&alice)).total, 10 * COIN);
    }

    #[test]
    fn double_spend_submission_conflicts() {
        let chain = test_chain();
        let alice = keypair(1);
        let block1 = mine_and_connect(&chain, &addr_of(&alice));
        let coinbase_txid = block1.transactions[0].txid();
        let sink = addr_of(&keypair(99));
        for _ in 0..carbon_core::constants::COINBASE_MATURITY {
            mine_and_connect(&chain, &sink);
        }

        let first = transfer(
            &alice,
            UtxoKey::new(coinbase_txid, 0),
            50 * COIN,
            10 * COIN,
            addr_of(&keypair(2)),
            addr_of(&alice),
        );
        let second = transfer(
            &alice,
            UtxoKey::new(coinbase_txid, 0),
            50 * COIN,
            20 * COIN,
            addr_of(&keypair(3)),
            addr_of(&alice),
        );
        chain.submit_transaction(first).unwrap();
        assert!(matches!(
            chain.submit_transaction(second),
            Err(MempoolError::TransactionConflict { .. }),
        ));
    }

    // ------------------------------------------------------------------
    // Reorg
    // ------------------------------------------------------------------

    /// Build and mine a coinbase-only block on an arbitrary parent, with a
    /// marker to keep its coinbase txid unique.
    fn mine_side_block(
        parent_hash: Hash256,
        height: u64,
        timestamp: i64,
        miner: Address,
        marker: &str,
    ) -> Block {
        let coinbase = Transaction {
            kind: TxKind::Coinbase,
            inputs: vec![],
            outputs: vec![TxOutput {
                metadata: Some(marker.to_string()),
                ..TxOutput::plain(50 * COIN, miner)
            }],
            timestamp,
        };
        let txids = vec![coinbase.txid()];
        let mut block = Block {
            header: BlockHeader {
                height,
                prev_hash: parent_hash,
                merkle_root: merkle::merkle_root(&txids),
                timestamp,
                difficulty: 1,
                nonce: 0,
            },
            transactions: vec![coinbase],
        };
        while !block.header.meets_difficulty() {
            block.header.nonce += 1;
        }
        block
    }

    #[test]
    fn heavier_side_branch_triggers_reorg() {
        let chain = test_chain();
        let miner_x = addr_of(&keypair(1));
        let miner_y = addr_of(&keypair(2));

        // Best chain: genesis → X1.
        let x1 = mine_and_connect(&chain, &miner_x);
        assert_eq!(chain.get_balance(&miner_x).total, 50 * COIN);

        // Competing branch from genesis: Y1, then Y2 to take the lead.
        let y1 = mine_side_block(
            genesis::genesis_hash(),
            1,
            x1.header.timestamp + 30,
            miner_y,
            "branch-y:1",
        );
        assert_eq!(chain.process_block(&y1).unwrap(), BlockOutcome::SideChain);
        // X1 still the tip: equal work ties break first-seen.
        assert_eq!(chain.tip().0, 1);
        assert_eq!(chain.get_balance(&miner_y).total, 0);

        let y2 = mine_side_block(
            y1.header.hash(),
            2,
            y1.header.timestamp + 30,
            miner_y,
            "branch-y:2",
        );
        let outcome = chain.process_block(&y2).unwrap();
        assert_eq!(outcome, BlockOutcome::Reorged { disconnected: 1, connected: 2 });
        assert_eq!(chain.tip().0, 2);
        // Branch Y's coinbases are live; X1's is rolled out.
        assert_eq!(chain.get_balance(&miner_y).total, 100 * COIN);
        assert_eq!(chain.get_balance(&miner_x).total, 0);
    }

    // ------------------------------------------------------------------
    // Locator / headers_after
    // ------------------------------------------------------------------

    #[test]
    fn locator_is_sparse_and_ends_at_genesis() {
        let chain = test_chain();
        let miner = addr_of(&keypair(1));
        for _ in 0..30 {
            mine_and_connect(&chain, &miner);
        }
        let locator = chain.block_locator();
        assert_eq!(locator[0], chain.tip().1);
        assert_eq!(*locator.last().unwrap(), genesis::genesis_hash());
        assert!(locator.len() < 30);
    }

    #[test]
    fn headers_after_fork_point() {
        let chain = test_chain();
        let miner = addr_of(&keypair(1));
        let mut hashes = vec![genesis::genesis_hash()];
        for _ in 0..5 {
            hashes.push(mine_and_connect(&chain, &miner).header.hash());
        }

        // A peer that only knows up to height 2 gets headers 3..=5.
        let headers = chain.headers_after(&[hashes[2]], &Hash256::ZERO, 2000);
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[0].height, 3);
        assert_eq!(headers[2].height, 5);

        // An unknown locator starts from genesis.
        let headers = chain.headers_after(&[Hash256([0x13; 32])], &Hash256::ZERO, 2000);
        assert_eq!(headers.len(), 5);
        assert_eq!(headers[0].height, 1);
    }

    // ------------------------------------------------------------------
    // Supply accounting
    // ------------------------------------------------------------------

    #[test]
    fn supply_equals_cumulative_subsidy() {
        let chain = test_chain();
        let miner = addr_of(&keypair(1));
        for _ in 0..4 {
            mine_and_connect(&chain, &miner);
        }
        let supply = chain.supply_info();
        assert_eq!(supply.total, subsidy::cumulative_subsidy(4));
        assert_eq!(supply.burned, 0);
    }
}
