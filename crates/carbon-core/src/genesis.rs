//! The genesis block.
//!
//! Height 0, all-zero previous hash, nonce 0; no proof of work is required.
//! Every node accepts exactly this block and nothing else at height 0, so the
//! construction must be bit-exact across implementations. The single coinbase
//! output carries the launch banner and pays the initial subsidy to a
//! deterministically derived address nobody holds a key for.

use std::sync::LazyLock;

use crate::address::{Address, Network};
use crate::constants::{INITIAL_SUBSIDY, MIN_DIFFICULTY};
use crate::crypto;
use crate::merkle;
use crate::types::{Block, BlockHeader, Hash256, Transaction, TxKind, TxOutput};

/// Genesis timestamp: January 1, 2026 00:00:00 UTC.
pub const GENESIS_TIMESTAMP: i64 = 1_767_225_600;

/// Banner embedded in the genesis coinbase output.
pub const GENESIS_BANNER: &str = "CarbonChain genesis 2026: every tonne accounted for.";

struct GenesisData {
    block: Block,
    hash: Hash256,
}

static GENESIS: LazyLock<GenesisData> = LazyLock::new(build_genesis);

fn build_genesis() -> GenesisData {
    let coinbase = Transaction {
        kind: TxKind::Coinbase,
        inputs: vec![],
        outputs: vec![TxOutput {
            metadata: Some(GENESIS_BANNER.to_string()),
            ..TxOutput::plain(INITIAL_SUBSIDY, genesis_address())
        }],
        timestamp: GENESIS_TIMESTAMP,
    };
    let merkle_root = merkle::merkle_root(&[coinbase.txid()]);

    let block = Block {
        header: BlockHeader {
            height: 0,
            prev_hash: Hash256::ZERO,
            merkle_root,
            timestamp: GENESIS_TIMESTAMP,
            difficulty: MIN_DIFFICULTY,
            nonce: 0,
        },
        transactions: vec![coinbase],
    };
    let hash = block.header.hash();
    GenesisData { block, hash }
}

/// The genesis coinbase recipient, derived from the banner. No key exists
/// for it; the genesis subsidy is out of circulation by construction.
pub fn genesis_address() -> Address {
    Address::from_parts(
        Network::Mainnet.address_version(),
        crypto::hash160(GENESIS_BANNER.as_bytes()),
    )
}

/// The genesis block (height 0).
pub fn genesis_block() -> &'static Block {
    &GENESIS.block
}

/// The genesis block hash.
pub fn genesis_hash() -> Hash256 {
    GENESIS.hash
}

/// Whether a block is the genesis block.
pub fn is_genesis(block: &Block) -> bool {
    block.header.hash() == GENESIS.hash
}
