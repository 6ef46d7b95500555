//! Error types for the CarbonChain protocol.
//!
//! Each domain gets its own sealed enum; [`ChainError`] aggregates them at
//! crate boundaries. Rejection kinds carry a stable [`RejectCode`] used by the
//! wire `REJECT` message, so codes must never be renumbered.

use thiserror::Error;

/// Stable wire code attached to a rejection.
pub type RejectCode = u8;

pub mod reject {
    //! Wire codes for the `REJECT` message. Append-only.
    use super::RejectCode;

    pub const INVALID_SIGNATURE: RejectCode = 0x10;
    pub const INSUFFICIENT_FUNDS: RejectCode = 0x11;
    pub const DOUBLE_SPEND: RejectCode = 0x12;
    pub const TX_SIZE_EXCEEDED: RejectCode = 0x13;
    pub const MEMPOOL_FULL: RejectCode = 0x14;
    pub const TRANSACTION_CONFLICT: RejectCode = 0x15;
    pub const TX_MALFORMED: RejectCode = 0x16;
    pub const INVALID_BLOCK: RejectCode = 0x20;
    pub const CERTIFICATE_DUPLICATE: RejectCode = 0x30;
    pub const CERTIFICATE_EXHAUSTED: RejectCode = 0x31;
    pub const COMPENSATION_NOT_CERTIFIED: RejectCode = 0x32;
    pub const COMPENSATION_ALREADY_USED: RejectCode = 0x33;
    pub const INVALID_MESSAGE: RejectCode = 0x40;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input at byte {0}")] UnexpectedEof(usize),
    #[error("trailing bytes after decode: {0}")] TrailingBytes(usize),
    #[error("invalid tag {tag} for {what}")] InvalidTag { what: &'static str, tag: u8 },
    #[error("declared length {len} exceeds remaining input {remaining}")] LengthExceeded { len: usize, remaining: usize },
    #[error("invalid UTF-8 in string field")] InvalidUtf8,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key bytes")] InvalidPublicKey,
    #[error("invalid signature bytes")] InvalidSignature,
    #[error("signature verification failed")] VerificationFailed,
    #[error("public key does not hash to the expected address")] AddressMismatch,
    #[error("input index out of bounds: {index} >= {len}")] InputIndexOutOfBounds { index: usize, len: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid length: {0} bytes decoded")] InvalidLength(usize),
    #[error("character outside the Base58 alphabet")] InvalidCharacter,
    #[error("checksum mismatch")] ChecksumMismatch,
    #[error("unknown version byte: {0:#04x}")] UnknownVersion(u8),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("invalid signature on input {index}")] InvalidSignature { index: usize },
    #[error("insufficient funds: have {have}, need {need}")] InsufficientFunds { have: u64, need: u64 },
    #[error("double spend of {0}")] DoubleSpend(String),
    #[error("oversized: {size} > {max}")] TxSizeExceeded { size: usize, max: usize },
    #[error("unknown UTXO: {0}")] UnknownUtxo(String),
    #[error("empty outputs")] EmptyOutputs,
    #[error("non-coinbase transaction has no inputs")] MissingInputs,
    #[error("amount out of range at output {0}")] AmountOutOfRange(usize),
    #[error("value overflow")] ValueOverflow,
    #[error("immature coinbase spent by input {index}")] ImmatureCoinbase { index: usize },
    #[error("invalid coinbase: {0}")] InvalidCoinbase(String),
    #[error("malformed {kind} transaction: {reason}")] KindShape { kind: &'static str, reason: String },
    #[error("metadata too large at output {0}")] MetadataTooLarge(usize),
    #[error(transparent)] Certificate(#[from] CertificateError),
}

impl TransactionError {
    /// Stable wire code for `REJECT`.
    pub fn reject_code(&self) -> RejectCode {
        match self {
            Self::InvalidSignature { .. } => reject::INVALID_SIGNATURE,
            Self::InsufficientFunds { .. } => reject::INSUFFICIENT_FUNDS,
            Self::DoubleSpend(_) => reject::DOUBLE_SPEND,
            Self::TxSizeExceeded { .. } => reject::TX_SIZE_EXCEEDED,
            Self::Certificate(e) => e.reject_code(),
            _ => reject::TX_MALFORMED,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CertificateError {
    #[error("certificate already issued: {0}")] CertificateDuplicate(String),
    #[error("certificate {id} exhausted: assigned {assigned} + {requested} > total {total}")]
    CertificateExhausted { id: String, assigned: u64, requested: u64, total: u64 },
    #[error("compensation input is not certified: {0}")] CompensationNotCertified(String),
    #[error("compensation exceeds remaining certified amount for {id}: {requested} > {remaining}")]
    CompensationAlreadyUsed { id: String, requested: u64, remaining: u64 },
    #[error("unknown certificate: {0}")] UnknownCertificate(String),
    #[error("missing required certificate field: {0}")] MissingField(&'static str),
}

impl CertificateError {
    pub fn reject_code(&self) -> RejectCode {
        match self {
            Self::CertificateDuplicate(_) => reject::CERTIFICATE_DUPLICATE,
            Self::CertificateExhausted { .. } => reject::CERTIFICATE_EXHAUSTED,
            Self::CompensationNotCertified(_) => reject::COMPENSATION_NOT_CERTIFIED,
            Self::CompensationAlreadyUsed { .. } => reject::COMPENSATION_ALREADY_USED,
            Self::UnknownCertificate(_) => reject::COMPENSATION_NOT_CERTIFIED,
            Self::MissingField(_) => reject::TX_MALFORMED,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("invalid PoW")] InvalidPoW,
    #[error("prev hash does not match any known tip")] InvalidPrevHash,
    #[error("height mismatch: expected {expected}, got {got}")] HeightMismatch { expected: u64, got: u64 },
    #[error("invalid difficulty: got {got}, expected {expected}")] InvalidDifficulty { got: u32, expected: u32 },
    #[error("timestamp {got} not after median-time-past {median}")] TimestampNotAfterMedian { got: i64, median: i64 },
    #[error("timestamp too far in the future by {0}s")] TimestampTooFar(i64),
    #[error("invalid merkle root")] InvalidMerkleRoot,
    #[error("no coinbase transaction")] NoCoinbase,
    #[error("first transaction is not coinbase")] FirstTxNotCoinbase,
    #[error("multiple coinbase transactions")] MultipleCoinbase,
    #[error("oversized: {size} > {max}")] OversizedBlock { size: usize, max: usize },
    #[error("too many transactions: {count} > {max}")] TooManyTransactions { count: usize, max: usize },
    #[error("coinbase claims {got}, maximum {expected}")] InvalidSubsidy { got: u64, expected: u64 },
    #[error("double spend across transactions: {0}")] DoubleSpend(String),
    #[error("duplicate txid: {0}")] DuplicateTxid(String),
    #[error("supply cap exceeded")] SupplyExceeded,
    #[error("tx {index}: {source}")] Transaction { index: usize, source: TransactionError },
}

impl BlockError {
    pub fn reject_code(&self) -> RejectCode {
        match self {
            Self::Transaction { source, .. } => source.reject_code(),
            _ => reject::INVALID_BLOCK,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UtxoError {
    #[error("UTXO already exists: {0}")] UtxoExists(String),
    #[error("UTXO not found: {0}")] UtxoNotFound(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("transaction already in pool: {0}")] AlreadyExists(String),
    #[error("conflicts with pool tx {existing_txid} on {utxo_key}")]
    TransactionConflict { existing_txid: String, utxo_key: String },
    #[error("mempool full")] MempoolFull,
    #[error(transparent)] Rejected(#[from] TransactionError),
}

impl MempoolError {
    pub fn reject_code(&self) -> RejectCode {
        match self {
            Self::AlreadyExists(_) => reject::TRANSACTION_CONFLICT,
            Self::TransactionConflict { .. } => reject::TRANSACTION_CONFLICT,
            Self::MempoolFull => reject::MEMPOOL_FULL,
            Self::Rejected(e) => e.reject_code(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainStateError {
    #[error("empty chain: genesis not connected")] EmptyChain,
    #[error("block not found: {0}")] BlockNotFound(String),
    #[error("unknown parent: {0}")] UnknownParent(String),
    #[error("duplicate block: {0}")] DuplicateBlock(String),
    #[error("branch marked invalid: {0}")] InvalidBranch(String),
    #[error("reorg aborted at {hash}: {source}")] ReorgAborted { hash: String, source: Box<BlockError> },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("message too large: {size} > {max}")] MessageTooLarge { size: usize, max: usize },
    #[error("payload checksum mismatch")] ChecksumMismatch,
    #[error("bad network magic")] BadMagic,
    #[error("unknown command: {0}")] UnknownCommand(String),
    #[error("peer timeout")] PeerTimeout,
    #[error("peer connection error: {0}")] PeerConnectionError(String),
    #[error("invalid message: {0}")] InvalidMessage(String),
    #[error("protocol version {0} below minimum")] VersionTooOld(u32),
    #[error("connected to self")] SelfConnect,
    #[error("peer is banned")] Banned,
}

/// Fatal by policy: abort startup or halt further acceptance.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage I/O: {0}")] Io(String),
    #[error("corrupt store: {0}")] Corrupt(String),
    #[error("missing key: {0}")] MissingKey(String),
}

#[derive(Error, Debug)]
pub enum ChainError {
    #[error(transparent)] Codec(#[from] CodecError),
    #[error(transparent)] Crypto(#[from] CryptoError),
    #[error(transparent)] Address(#[from] AddressError),
    #[error(transparent)] Transaction(#[from] TransactionError),
    #[error(transparent)] Certificate(#[from] CertificateError),
    #[error(transparent)] Block(#[from] BlockError),
    #[error(transparent)] Utxo(#[from] UtxoError),
    #[error(transparent)] Mempool(#[from] MempoolError),
    #[error(transparent)] ChainState(#[from] ChainStateError),
    #[error(transparent)] Network(#[from] NetworkError),
    #[error(transparent)] Storage(#[from] StorageError),
}
