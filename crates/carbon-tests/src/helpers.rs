//! Builders shared by the E2E scenario tests.

use carbon_consensus::chain::{BlockOutcome, ChainManager};
use carbon_core::address::{Address, Network};
use carbon_core::crypto::{self, KeyPair};
use carbon_core::genesis;
use carbon_core::merkle;
use carbon_core::types::{
    Block, BlockHeader, CertificateId, CertificatePayload, Hash256, Transaction, TxInput, TxKind,
    TxOutput, UtxoKey,
};

/// Deterministic keypair from a seed byte.
pub fn keypair(seed: u8) -> KeyPair {
    KeyPair::from_secret_bytes([seed.max(1); 32]).unwrap()
}

pub fn address(kp: &KeyPair) -> Address {
    kp.address(Network::Regtest)
}

/// A chain manager whose clock sits comfortably ahead of every timestamp the
/// tests produce.
pub fn test_chain() -> ChainManager {
    ChainManager::with_clock(Network::Regtest, || genesis::GENESIS_TIMESTAMP + 1_000_000)
}

/// Mine the next block of the best chain to `miner`.
pub fn mine_next(chain: &ChainManager, miner: &Address) -> Block {
    let mut block = chain.build_block_template(miner);
    while !block.header.meets_difficulty() {
        block.header.nonce += 1;
    }
    block
}

/// Mine and connect, asserting the block extends the best chain.
pub fn mine_and_connect(chain: &ChainManager, miner: &Address) -> Block {
    let block = mine_next(chain, miner);
    assert_eq!(chain.process_block(&block).unwrap(), BlockOutcome::Connected);
    block
}

/// Build and mine a coinbase-only block on an arbitrary parent. Used for
/// constructing competing branches.
pub fn mine_branch_block(
    parent: &BlockHeader,
    miner: &Address,
    marker: &str,
) -> Block {
    let timestamp = parent.timestamp + 60;
    let coinbase = Transaction {
        kind: TxKind::Coinbase,
        inputs: vec![],
        outputs: vec![TxOutput {
            metadata: Some(marker.to_string()),
            ..TxOutput::plain(carbon_core::subsidy::block_subsidy(parent.height + 1), *miner)
        }],
        timestamp,
    };
    let txids = vec![coinbase.txid()];
    let mut block = Block {
        header: BlockHeader {
            height: parent.height + 1,
            prev_hash: parent.hash(),
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

/// Signed transaction of the given kind spending single-owner inputs.
pub fn signed_tx(
    kp: &KeyPair,
    kind: TxKind,
    inputs: Vec<UtxoKey>,
    outputs: Vec<TxOutput>,
    timestamp: i64,
) -> Transaction {
    let mut tx = Transaction {
        kind,
        inputs: inputs.into_iter().map(TxInput::unsigned).collect(),
        outputs,
        timestamp,
    };
    for i in 0..tx.inputs.len() {
        crypto::sign_transaction_input(&mut tx, i, kp).unwrap();
    }
    tx
}

/// Transfer `amount` out of one UTXO with the remainder as change.
pub fn transfer(
    kp: &KeyPair,
    from: UtxoKey,
    from_amount: u64,
    amount: u64,
    to: Address,
    timestamp: i64,
) -> Transaction {
    let mut outputs = vec![TxOutput::plain(amount, to)];
    if from_amount > amount {
        outputs.push(TxOutput::plain(from_amount - amount, address(kp)));
    }
    signed_tx(kp, TxKind::Transfer, vec![from], outputs, timestamp)
}

/// A complete issue payload for certificate `id`.
pub fn certificate_payload(id: &str, total: u64) -> CertificatePayload {
    CertificatePayload {
        certificate_id: CertificateId::new(id),
        project_id: "reforestation-alpha".into(),
        vintage_year: 2025,
        total_amount: total,
        cert_type: "removal".into(),
        standard: "VCS".into(),
        issuer: "registry-one".into(),
    }
}

/// The key of a transaction's first output.
pub fn first_output(tx: &Transaction) -> UtxoKey {
    UtxoKey::new(tx.txid(), 0)
}

/// The genesis hash, re-exported for locator construction in tests.
pub fn genesis_hash() -> Hash256 {
    genesis::genesis_hash()
}
