//! Core protocol types: transactions, blocks, UTXO keys, certificates.
//!
//! All monetary values are in base units (1 coin = 10^8 units).
//! Hashing and wire transport go through the canonical encoders in
//! [`codec`](crate::codec), never through serde.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::address::Address;
use crate::codec::Encodable;
use crate::crypto;

/// A 32-byte hash value.
///
/// Used for transaction IDs, block header hashes, merkle roots, and the
/// scrypt PoW digest.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes). Used as the genesis previous-hash.
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Number of leading zero bits, interpreting the hash as a big-endian
    /// 256-bit integer. This is what the difficulty check counts.
    pub fn leading_zero_bits(&self) -> u32 {
        let mut bits = 0u32;
        for byte in &self.0 {
            if *byte == 0 {
                bits += 8;
            } else {
                bits += byte.leading_zeros();
                break;
            }
        }
        bits
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Reference to a specific output of a previous transaction.
///
/// The `(txid, index)` pair uniquely identifies a UTXO.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UtxoKey {
    pub txid: Hash256,
    pub index: u32,
}

impl UtxoKey {
    pub fn new(txid: Hash256, index: u32) -> Self {
        Self { txid, index }
    }
}

impl fmt::Display for UtxoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// Lifecycle state of the value carried by an output.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum CoinState {
    /// Ordinary spendable value.
    #[default]
    Plain,
    /// Value backed by an assigned carbon certificate; carries its id.
    Certified,
    /// Retired value sitting on the burn address; unspendable.
    Compensated,
}

/// Identifier of a carbon-offset certificate, chosen by the issuer.
/// Globally unique across the chain.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CertificateId(String);

impl CertificateId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CertificateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Full certificate description carried by a `CertificateIssue` transaction.
///
/// `project_id`, `vintage_year`, `total_amount` and `cert_type` are required;
/// `standard` and `issuer` may be empty.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CertificatePayload {
    pub certificate_id: CertificateId,
    pub project_id: String,
    pub vintage_year: u16,
    pub total_amount: u64,
    pub cert_type: String,
    pub standard: String,
    pub issuer: String,
}

/// Transaction kind tag. The certificate payload rides only on the variant
/// that introduces it; assign/compensation reference certificates through
/// their outputs' `certificate_id` fields.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum TxKind {
    /// Block reward transaction. No inputs.
    Coinbase,
    /// Ordinary value transfer.
    Transfer,
    /// Registers a new certificate in the on-chain registry.
    CertificateIssue(CertificatePayload),
    /// Converts plain value into certified value under an existing certificate.
    CertificateAssign,
    /// Retires certified value to the burn address.
    Compensation,
}

impl TxKind {
    /// Short name used in errors and logs.
    pub fn name(&self) -> &'static str {
        match self {
            TxKind::Coinbase => "coinbase",
            TxKind::Transfer => "transfer",
            TxKind::CertificateIssue(_) => "certificate-issue",
            TxKind::CertificateAssign => "certificate-assign",
            TxKind::Compensation => "compensation",
        }
    }
}

/// A transaction input, spending a previous output.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TxInput {
    /// The UTXO being spent.
    pub previous_output: UtxoKey,
    /// DER-encoded ECDSA signature over the transaction sighash.
    /// Empty until signed.
    pub signature: Vec<u8>,
    /// SEC1-encoded secp256k1 public key. Must hash to the spent output's
    /// address. Empty until signed.
    pub public_key: Vec<u8>,
}

impl TxInput {
    pub fn unsigned(previous_output: UtxoKey) -> Self {
        Self {
            previous_output,
            signature: Vec::new(),
            public_key: Vec::new(),
        }
    }
}

/// A transaction output, creating a new UTXO.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TxOutput {
    /// Value in base units.
    pub amount: u64,
    /// Recipient address.
    pub address: Address,
    /// Plain, certified, or compensated.
    pub coin_state: CoinState,
    /// Certificate backing this output. Required for `Certified` and
    /// `Compensated` states, absent for `Plain`.
    pub certificate_id: Option<CertificateId>,
    /// Free-form metadata (project notes, retirement statements).
    pub metadata: Option<String>,
}

impl TxOutput {
    /// A plain value output.
    pub fn plain(amount: u64, address: Address) -> Self {
        Self {
            amount,
            address,
            coin_state: CoinState::Plain,
            certificate_id: None,
            metadata: None,
        }
    }

    /// A certified output carrying value under `certificate_id`.
    pub fn certified(amount: u64, address: Address, certificate_id: CertificateId) -> Self {
        Self {
            amount,
            address,
            coin_state: CoinState::Certified,
            certificate_id: Some(certificate_id),
            metadata: None,
        }
    }

    /// A burn output retiring value under `certificate_id`.
    pub fn compensated(amount: u64, address: Address, certificate_id: CertificateId) -> Self {
        Self {
            amount,
            address,
            coin_state: CoinState::Compensated,
            certificate_id: Some(certificate_id),
            metadata: None,
        }
    }
}

/// A transaction: kind tag, inputs, outputs, creation timestamp.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub kind: TxKind,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    /// Unix seconds at creation. Part of the txid preimage so identical
    /// payments at different times stay distinct.
    pub timestamp: i64,
}

impl Transaction {
    /// Compute the transaction ID: double SHA-256 of the canonical encoding
    /// of the fully-signed transaction.
    pub fn txid(&self) -> Hash256 {
        crypto::sha256d(&self.encoded())
    }

    /// Compute the signing hash: double SHA-256 of the canonical encoding
    /// with every input's signature and public key emptied.
    ///
    /// Excluding the witness data avoids circularity and lets inputs be
    /// signed independently in any order.
    pub fn sighash(&self) -> Hash256 {
        let mut stripped = self.clone();
        for input in &mut stripped.inputs {
            input.signature.clear();
            input.public_key.clear();
        }
        crypto::sha256d(&stripped.encoded())
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(self.kind, TxKind::Coinbase)
    }

    /// Sum of all output amounts. Returns None on overflow.
    pub fn total_output_amount(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.amount))
    }

    /// Serialized size in bytes under the canonical encoding.
    pub fn size(&self) -> usize {
        self.encoded().len()
    }
}

/// Block header containing the proof-of-work puzzle.
///
/// The identity hash is double SHA-256 over the canonical encoding; the PoW
/// check runs scrypt over the same bytes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// Height of this block; genesis is 0.
    pub height: u64,
    /// Hash of the previous block header. All zeros for genesis.
    pub prev_hash: Hash256,
    /// Merkle root of the block's transaction ids.
    pub merkle_root: Hash256,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    /// Required leading zero bits in the PoW hash.
    pub difficulty: u32,
    /// Proof-of-work nonce.
    pub nonce: u64,
}

impl BlockHeader {
    /// Cheap identity hash (double SHA-256). Used for linkage and indexing.
    pub fn hash(&self) -> Hash256 {
        crypto::sha256d(&self.encoded())
    }

    /// Memory-hard PoW hash (scrypt). Used only for the difficulty check.
    pub fn pow_hash(&self) -> Hash256 {
        crypto::pow_hash(&self.encoded())
    }

    /// Whether the PoW hash satisfies this header's declared difficulty:
    /// `pow_hash < 2^(256 - difficulty)`.
    pub fn meets_difficulty(&self) -> bool {
        self.pow_hash().leading_zero_bits() >= self.difficulty
    }

    /// Work contributed by this header under the cumulative-work rule.
    pub fn work(&self) -> u128 {
        if self.difficulty >= 128 {
            u128::MAX
        } else {
            1u128 << self.difficulty
        }
    }
}

/// A complete block: header plus transactions.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    /// Ordered transactions. The first must be coinbase.
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }

    /// Serialized size in bytes under the canonical encoding.
    pub fn size(&self) -> usize {
        self.encoded().len()
    }
}

/// A UTXO as tracked by the unspent-output set: the output itself plus the
/// provenance needed for maturity checks.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UtxoEntry {
    /// The unspent output.
    pub output: TxOutput,
    /// Height of the block that created this output.
    pub height: u64,
    /// Whether the creating transaction was a coinbase.
    pub is_coinbase: bool,
}

impl UtxoEntry {
    /// Whether this UTXO can be spent at `current_height`.
    ///
    /// Coinbase outputs need [`COINBASE_MATURITY`](crate::constants::COINBASE_MATURITY)
    /// confirmations; everything else is immediately spendable.
    pub fn is_mature(&self, current_height: u64) -> bool {
        if !self.is_coinbase {
            return true;
        }
        current_height.saturating_sub(self.height) >= crate::constants::COINBASE_MATURITY
    }
}

/// Registry entry for an issued certificate.
///
/// `assigned_amount` and `compensated_amount` move monotonically with
/// `CertificateAssign` and `Compensation` transactions on the best chain
/// (and symmetrically backwards on rollback).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CertificateRecord {
    pub id: CertificateId,
    pub project_id: String,
    pub vintage_year: u16,
    pub total_amount: u64,
    pub assigned_amount: u64,
    pub compensated_amount: u64,
    pub cert_type: String,
    pub standard: String,
    pub issuer: String,
    /// Timestamp of the issuing transaction.
    pub issued_at: i64,
}

impl CertificateRecord {
    /// Build the initial record from an issue payload.
    pub fn from_payload(payload: &CertificatePayload, issued_at: i64) -> Self {
        Self {
            id: payload.certificate_id.clone(),
            project_id: payload.project_id.clone(),
            vintage_year: payload.vintage_year,
            total_amount: payload.total_amount,
            assigned_amount: 0,
            compensated_amount: 0,
            cert_type: payload.cert_type.clone(),
            standard: payload.standard.clone(),
            issuer: payload.issuer.clone(),
            issued_at,
        }
    }

    /// Certified value not yet retired: `assigned - compensated`.
    pub fn remaining_certified(&self) -> u64 {
        self.assigned_amount.saturating_sub(self.compensated_amount)
    }

    /// Capacity not yet assigned: `total - assigned`.
    pub fn remaining_capacity(&self) -> u64 {
        self.total_amount.saturating_sub(self.assigned_amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Network;
    use crate::constants::COIN;

    fn addr(seed: u8) -> Address {
        Address::from_parts(Network::Mainnet.address_version(), [seed; 20])
    }

    fn sample_tx() -> Transaction {
        Transaction {
            kind: TxKind::Transfer,
            inputs: vec![TxInput {
                previous_output: UtxoKey::new(Hash256([0x11; 32]), 0),
                signature: vec![1, 2, 3],
                public_key: vec![4, 5, 6],
            }],
            outputs: vec![TxOutput::plain(50 * COIN, addr(0xAA))],
            timestamp: 1_700_000_000,
        }
    }

    fn sample_header() -> BlockHeader {
        BlockHeader {
            height: 1,
            prev_hash: Hash256([0x22; 32]),
            merkle_root: Hash256([0x33; 32]),
            timestamp: 1_700_000_000,
            difficulty: 1,
            nonce: 0,
        }
    }

    // --- Hash256 ---

    #[test]
    fn hash256_zero_detection() {
        assert!(Hash256::ZERO.is_zero());
        assert!(!Hash256([1; 32]).is_zero());
    }

    #[test]
    fn hash256_display_is_hex() {
        let s = Hash256([0xAB; 32]).to_string();
        assert_eq!(s.len(), 64);
        assert!(s.starts_with("abab"));
    }

    #[test]
    fn leading_zero_bits_zero_hash() {
        assert_eq!(Hash256::ZERO.leading_zero_bits(), 256);
    }

    #[test]
    fn leading_zero_bits_top_bit_set() {
        let mut h = [0u8; 32];
        h[0] = 0x80;
        assert_eq!(Hash256(h).leading_zero_bits(), 0);
    }

    #[test]
    fn leading_zero_bits_partial_byte() {
        let mut h = [0u8; 32];
        h[0] = 0x00;
        h[1] = 0x10; // 8 + 3 leading zeros
        assert_eq!(Hash256(h).leading_zero_bits(), 11);
    }

    // --- UtxoKey ---

    #[test]
    fn utxo_key_display() {
        let key = UtxoKey::new(Hash256([0xFF; 32]), 7);
        assert!(key.to_string().ends_with(":7"));
    }

    // --- Transaction ---

    #[test]
    fn coinbase_detection() {
        let mut tx = sample_tx();
        assert!(!tx.is_coinbase());
        tx.kind = TxKind::Coinbase;
        assert!(tx.is_coinbase());
    }

    #[test]
    fn txid_deterministic_and_sensitive() {
        let tx = sample_tx();
        assert_eq!(tx.txid(), tx.txid());
        let mut tx2 = tx.clone();
        tx2.timestamp += 1;
        assert_ne!(tx.txid(), tx2.txid());
    }

    #[test]
    fn txid_commits_to_signatures() {
        let tx = sample_tx();
        let mut signed = tx.clone();
        signed.inputs[0].signature = vec![9; 64];
        assert_ne!(tx.txid(), signed.txid());
    }

    #[test]
    fn sighash_ignores_signatures() {
        let tx = sample_tx();
        let mut signed = tx.clone();
        signed.inputs[0].signature = vec![9; 64];
        signed.inputs[0].public_key = vec![7; 33];
        assert_eq!(tx.sighash(), signed.sighash());
    }

    #[test]
    fn total_output_amount_overflow() {
        let mut tx = sample_tx();
        tx.outputs = vec![
            TxOutput::plain(u64::MAX, addr(1)),
            TxOutput::plain(1, addr(2)),
        ];
        assert_eq!(tx.total_output_amount(), None);
    }

    // --- BlockHeader ---

    #[test]
    fn header_hash_changes_with_nonce() {
        let h1 = sample_header();
        let mut h2 = h1.clone();
        h2.nonce = 1;
        assert_ne!(h1.hash(), h2.hash());
    }

    #[test]
    fn header_work_doubles_per_bit() {
        let mut h = sample_header();
        h.difficulty = 4;
        assert_eq!(h.work(), 16);
        h.difficulty = 5;
        assert_eq!(h.work(), 32);
    }

    #[test]
    fn pow_and_identity_hash_differ() {
        let h = sample_header();
        assert_ne!(h.hash(), h.pow_hash());
    }

    // --- UtxoEntry ---

    #[test]
    fn coinbase_entry_matures_at_threshold() {
        let entry = UtxoEntry {
            output: TxOutput::plain(50 * COIN, addr(1)),
            height: 100,
            is_coinbase: true,
        };
        assert!(!entry.is_mature(100));
        assert!(!entry.is_mature(100 + crate::constants::COINBASE_MATURITY - 1));
        assert!(entry.is_mature(100 + crate::constants::COINBASE_MATURITY));
        assert!(entry.is_mature(500));
    }

    #[test]
    fn regular_entry_always_mature() {
        let entry = UtxoEntry {
            output: TxOutput::plain(10, addr(1)),
            height: 100,
            is_coinbase: false,
        };
        assert!(entry.is_mature(0));
        assert!(entry.is_mature(100));
    }

    // --- CertificateRecord ---

    #[test]
    fn certificate_record_counters() {
        let payload = CertificatePayload {
            certificate_id: CertificateId::new("C1"),
            project_id: "forest-1".into(),
            vintage_year: 2025,
            total_amount: 1000,
            cert_type: "removal".into(),
            standard: "VCS".into(),
            issuer: "registry".into(),
        };
        let mut record = CertificateRecord::from_payload(&payload, 1_700_000_000);
        assert_eq!(record.remaining_capacity(), 1000);
        record.assigned_amount = 300;
        record.compensated_amount = 200;
        assert_eq!(record.remaining_certified(), 100);
        assert_eq!(record.remaining_capacity(), 700);
    }
}
