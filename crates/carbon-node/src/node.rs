//! Full-node assembly.
//!
//! A [`Node`] owns the chain manager, the persistent store, and (once
//! started) the P2P service. On startup it replays the persisted best chain
//! through consensus validation to rebuild the in-memory UTXO set and
//! certificate registry; a store that cannot be replayed is fatal.

use std::sync::Arc;

use tracing::info;

use carbon_consensus::chain::{BlockOutcome, ChainManager, SupplyInfo};
use carbon_consensus::miner::{self, CancelFlag};
use carbon_core::address::Address;
use carbon_core::certificate::CertificateFilter;
use carbon_core::error::{ChainError, MempoolError, StorageError};
use carbon_core::mempool::MempoolInfo;
use carbon_core::types::{
    Block, CertificateId, CertificateRecord, Hash256, Transaction, UtxoEntry, UtxoKey,
};
use carbon_core::utxo::Balance;
use carbon_network::service::{NetworkService, PeerInfo};

use crate::config::NodeConfig;
use crate::storage::{self, KvStore, MemoryKv, RocksKv};

/// A running CarbonChain node.
pub struct Node {
    config: NodeConfig,
    chain: Arc<ChainManager>,
    store: Arc<dyn KvStore>,
    network: Option<NetworkService>,
    mining_cancel: Arc<CancelFlag>,
}

impl Node {
    /// Open the store, replay the persisted chain, and stand the node up
    /// (without networking; see [`start_network`](Self::start_network)).
    pub fn open(config: NodeConfig) -> Result<Self, ChainError> {
        let store: Arc<dyn KvStore> = match &config.data_dir {
            Some(dir) => Arc::new(RocksKv::open(dir)?),
            None => Arc::new(MemoryKv::new()),
        };

        let chain = Arc::new(ChainManager::new(config.network));

        let persisted = storage::load_best_chain(store.as_ref())?;
        let replayed = persisted.len();
        for block in &persisted {
            chain
                .process_block(block)
                .map_err(|e| StorageError::Corrupt(format!("persisted block failed replay: {e}")))?;
        }
        if replayed > 0 {
            info!(blocks = replayed, height = chain.tip().0, "chain state rebuilt from store");
        }

        Ok(Self {
            config,
            chain,
            store,
            network: None,
            mining_cancel: Arc::new(CancelFlag::new()),
        })
    }

    /// Bind the P2P listener and dial the configured peers.
    pub async fn start_network(&mut self) -> Result<(), ChainError> {
        let service = NetworkService::spawn(
            self.config.network,
            self.config.listen_addr,
            Arc::clone(&self.chain),
        )
        .await
        .map_err(|e| StorageError::Io(e.to_string()))?;

        for addr in &self.config.connect {
            service.connect(*addr).await?;
        }
        self.network = Some(service);
        Ok(())
    }

    pub fn chain(&self) -> &Arc<ChainManager> {
        &self.chain
    }

    pub fn network(&self) -> Option<&NetworkService> {
        self.network.as_ref()
    }

    // ------------------------------------------------------------------
    // Block intake and mining
    // ------------------------------------------------------------------

    /// Validate, connect, persist, and (if networking is up) announce a
    /// block.
    pub async fn process_block(&self, block: &Block) -> Result<BlockOutcome, ChainError> {
        let outcome = self.chain.process_block(block)?;

        // A new best tip obsoletes any running mining job.
        self.mining_cancel.cancel();

        let (tip_height, tip_hash) = self.chain.tip();
        storage::persist_block(self.store.as_ref(), block, tip_height, &tip_hash)?;

        if let Some(network) = &self.network {
            network.broadcast_block(block.header.hash()).await;
        }
        Ok(outcome)
    }

    /// Build a template, mine it with the configured worker count, and
    /// connect the result. Returns `None` if the job was cancelled by a
    /// competing block.
    pub async fn mine_block(&self, miner: &Address) -> Result<Option<Block>, ChainError> {
        self.mining_cancel.reset();
        let template = self.chain.build_block_template(miner);
        let cancel = Arc::clone(&self.mining_cancel);
        let workers = self.config.miner_threads;

        let header = tokio::task::spawn_blocking({
            let template = template.header.clone();
            move || miner::mine_header(&template, workers, &cancel)
        })
        .await
        .map_err(|e| StorageError::Io(e.to_string()))?;

        let Some(header) = header else {
            return Ok(None);
        };
        let block = Block {
            header,
            transactions: template.transactions,
        };
        self.process_block(&block).await?;
        Ok(Some(block))
    }

    /// Stop any in-flight mining job.
    pub fn stop_mining(&self) {
        self.mining_cancel.cancel();
    }

    /// Stop mining and close every peer connection.
    pub async fn shutdown(&self) {
        self.stop_mining();
        if let Some(network) = &self.network {
            network.shutdown().await;
        }
    }

    // ------------------------------------------------------------------
    // Query surface
    // ------------------------------------------------------------------

    pub fn get_tip(&self) -> (u64, Hash256) {
        self.chain.tip()
    }

    pub fn get_block_by_hash(&self, hash: &Hash256) -> Option<Block> {
        self.chain.get_block_by_hash(hash)
    }

    pub fn get_block_by_height(&self, height: u64) -> Option<Block> {
        self.chain.get_block_by_height(height)
    }

    pub fn get_transaction(&self, txid: &Hash256) -> Option<(Transaction, Option<Hash256>)> {
        self.chain.get_transaction(txid)
    }

    pub fn get_balance(&self, address: &Address) -> Balance {
        self.chain.get_balance(address)
    }

    pub fn list_utxos(&self, address: &Address) -> Vec<(UtxoKey, UtxoEntry)> {
        self.chain.list_utxos(address)
    }

    /// Admit a transaction and announce it to peers.
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<Hash256, MempoolError> {
        let txid = self.chain.submit_transaction(tx)?;
        if let Some(network) = &self.network {
            network.broadcast_transaction(txid).await;
        }
        Ok(txid)
    }

    pub fn get_certificate(&self, id: &CertificateId) -> Option<CertificateRecord> {
        self.chain.get_certificate(id)
    }

    pub fn list_certificates(&self, filter: &CertificateFilter) -> Vec<CertificateRecord> {
        self.chain.list_certificates(filter)
    }

    pub fn mempool_info(&self) -> MempoolInfo {
        self.chain.mempool_info()
    }

    pub fn supply_info(&self) -> SupplyInfo {
        self.chain.supply_info()
    }

    pub async fn peer_info(&self) -> Vec<PeerInfo> {
        match &self.network {
            Some(network) => network.peer_info().await,
            None => Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // State mirror
    // ------------------------------------------------------------------

    /// Rewrite the `utxo/` and `cert/` keyspaces from the live sets.
    ///
    /// These keyspaces are a query-only mirror for external tools; consensus
    /// state is rebuilt by replaying blocks, so the mirror is refreshed
    /// wholesale rather than maintained through every reorg.
    pub fn flush_state_mirror(&self) -> Result<(), StorageError> {
        use carbon_core::codec::Encodable;
        use crate::storage::{keys, WriteBatch};

        let mut batch = WriteBatch::new();
        for (key, _) in self.store.iterate(keys::UTXO_PREFIX)? {
            batch.delete(key);
        }
        for (key, _) in self.store.iterate(keys::CERT_PREFIX)? {
            batch.delete(key);
        }
        for (utxo_key, entry) in self.chain.all_utxos() {
            batch.put(keys::utxo(&utxo_key), entry.output.encoded());
        }
        for record in self.chain.list_certificates(&CertificateFilter::default()) {
            batch.put(keys::cert(&record.id), record.encoded());
        }
        self.store.write_batch(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carbon_core::address::Network;
    use carbon_core::crypto::KeyPair;

    fn test_config(dir: Option<std::path::PathBuf>) -> NodeConfig {
        NodeConfig {
            network: Network::Regtest,
            data_dir: dir,
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            connect: vec![],
            miner_threads: 1,
        }
    }

    fn miner_address() -> Address {
        KeyPair::from_secret_bytes([3; 32])
            .unwrap()
            .address(Network::Regtest)
    }

    #[tokio::test]
    async fn mine_and_query() {
        let node = Node::open(test_config(None)).unwrap();
        let miner = miner_address();

        let block = node.mine_block(&miner).await.unwrap().unwrap();
        assert_eq!(node.get_tip().0, 1);
        assert_eq!(node.get_block_by_height(1).unwrap(), block);
        assert!(node.get_balance(&miner).total > 0);

        let coinbase_txid = block.transactions[0].txid();
        let (tx, containing) = node.get_transaction(&coinbase_txid).unwrap();
        assert!(tx.is_coinbase());
        assert_eq!(containing, Some(block.header.hash()));
    }

    #[tokio::test]
    async fn chain_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let miner = miner_address();

        let tip_before = {
            let node = Node::open(test_config(Some(dir.path().to_path_buf()))).unwrap();
            for _ in 0..3 {
                node.mine_block(&miner).await.unwrap().unwrap();
            }
            node.flush_state_mirror().unwrap();
            node.get_tip()
        };

        let node = Node::open(test_config(Some(dir.path().to_path_buf()))).unwrap();
        assert_eq!(node.get_tip(), tip_before);
        assert_eq!(node.get_balance(&miner).total, 150 * carbon_core::constants::COIN);
    }

    #[tokio::test]
    async fn state_mirror_holds_utxos() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::open(test_config(Some(dir.path().to_path_buf()))).unwrap();
        node.mine_block(&miner_address()).await.unwrap().unwrap();
        node.flush_state_mirror().unwrap();

        let entries = node.store.iterate(storage::keys::UTXO_PREFIX).unwrap();
        // Genesis coinbase + mined coinbase.
        assert_eq!(entries.len(), 2);
    }
}
