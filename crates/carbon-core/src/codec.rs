//! Canonical serialization for consensus types.
//!
//! Every block, transaction and output has exactly one byte representation,
//! used both for hashing and for wire transport. Two encoders on different
//! nodes MUST produce identical bytes for the same logical value, so the
//! rules are fixed and explicit:
//!
//! - integers are fixed-width **big-endian**
//! - byte strings, UTF-8 strings and sequences carry a `u32` length prefix
//! - enums are a single `u8` tag (plus the variant payload, if any)
//! - options are a presence byte (0/1) followed by the value
//! - field order is the declared field order; there is no padding
//!
//! Generic serializers (serde, bincode) are deliberately not used here:
//! byte-identical hashing is a consensus requirement.

use crate::address::{Address, PAYLOAD_LEN};
use crate::error::CodecError;
use crate::types::{
    Block, BlockHeader, CertificateId, CertificatePayload, CertificateRecord, CoinState, Hash256,
    Transaction, TxInput, TxKind, TxOutput, UtxoKey,
};

/// A type with a canonical byte encoding.
pub trait Encodable {
    /// Append the canonical encoding of `self` to `out`.
    fn encode_into(&self, out: &mut Vec<u8>);

    /// The canonical encoding as a fresh buffer.
    fn encoded(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }
}

/// A type decodable from its canonical encoding.
pub trait Decodable: Sized {
    /// Decode a value from the reader, advancing it past the consumed bytes.
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError>;

    /// Decode a value that must consume the entire input.
    fn decode_all(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(bytes);
        let value = Self::decode_from(&mut reader)?;
        if reader.remaining() != 0 {
            return Err(CodecError::TrailingBytes(reader.remaining()));
        }
        Ok(value)
    }
}

/// Cursor over an input slice with bounds-checked reads.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEof(self.pos));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        Ok(self.take(N)?.try_into().unwrap())
    }

    /// Read a `u32`-length-prefixed byte string.
    ///
    /// The declared length is checked against the remaining input before
    /// allocation, so a hostile prefix cannot force a huge allocation.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_u32()? as usize;
        if len > self.remaining() {
            return Err(CodecError::LengthExceeded {
                len,
                remaining: self.remaining(),
            });
        }
        Ok(self.take(len)?.to_vec())
    }

    /// Read a `u32`-length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
    }

    /// Read a sequence length prefix, bounds-checked against `min_item_size`.
    pub fn read_seq_len(&mut self, min_item_size: usize) -> Result<usize, CodecError> {
        let len = self.read_u32()? as usize;
        let floor = len.saturating_mul(min_item_size.max(1));
        if floor > self.remaining() {
            return Err(CodecError::LengthExceeded {
                len: floor,
                remaining: self.remaining(),
            });
        }
        Ok(len)
    }
}

// --- encode helpers ---

pub fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

pub fn put_string(out: &mut Vec<u8>, s: &str) {
    put_bytes(out, s.as_bytes());
}

fn put_option<T: Encodable>(out: &mut Vec<u8>, value: &Option<T>) {
    match value {
        None => out.push(0),
        Some(v) => {
            out.push(1);
            v.encode_into(out);
        }
    }
}

fn read_option<T: Decodable>(reader: &mut Reader<'_>) -> Result<Option<T>, CodecError> {
    match reader.read_u8()? {
        0 => Ok(None),
        1 => Ok(Some(T::decode_from(reader)?)),
        tag => Err(CodecError::InvalidTag { what: "option", tag }),
    }
}

// --- primitive impls ---

impl Encodable for Hash256 {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0);
    }
}

impl Decodable for Hash256 {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Hash256(reader.read_array::<32>()?))
    }
}

impl Encodable for UtxoKey {
    fn encode_into(&self, out: &mut Vec<u8>) {
        self.txid.encode_into(out);
        out.extend_from_slice(&self.index.to_be_bytes());
    }
}

impl Decodable for UtxoKey {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(UtxoKey {
            txid: Hash256::decode_from(reader)?,
            index: reader.read_u32()?,
        })
    }
}

impl Encodable for Address {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.version());
        out.extend_from_slice(self.payload());
    }
}

impl Decodable for Address {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let version = reader.read_u8()?;
        let payload = reader.read_array::<PAYLOAD_LEN>()?;
        Ok(Address::from_parts(version, payload))
    }
}

impl Encodable for CoinState {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(match self {
            CoinState::Plain => 0,
            CoinState::Certified => 1,
            CoinState::Compensated => 2,
        });
    }
}

impl Decodable for CoinState {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        match reader.read_u8()? {
            0 => Ok(CoinState::Plain),
            1 => Ok(CoinState::Certified),
            2 => Ok(CoinState::Compensated),
            tag => Err(CodecError::InvalidTag { what: "coin state", tag }),
        }
    }
}

impl Encodable for CertificateId {
    fn encode_into(&self, out: &mut Vec<u8>) {
        put_string(out, self.as_str());
    }
}

impl Decodable for CertificateId {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(CertificateId::new(reader.read_string()?))
    }
}

impl Encodable for String {
    fn encode_into(&self, out: &mut Vec<u8>) {
        put_string(out, self);
    }
}

impl Decodable for String {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        reader.read_string()
    }
}

// --- domain impls ---

impl Encodable for CertificatePayload {
    fn encode_into(&self, out: &mut Vec<u8>) {
        self.certificate_id.encode_into(out);
        put_string(out, &self.project_id);
        out.extend_from_slice(&self.vintage_year.to_be_bytes());
        out.extend_from_slice(&self.total_amount.to_be_bytes());
        put_string(out, &self.cert_type);
        put_string(out, &self.standard);
        put_string(out, &self.issuer);
    }
}

impl Decodable for CertificatePayload {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(CertificatePayload {
            certificate_id: CertificateId::decode_from(reader)?,
            project_id: reader.read_string()?,
            vintage_year: reader.read_u16()?,
            total_amount: reader.read_u64()?,
            cert_type: reader.read_string()?,
            standard: reader.read_string()?,
            issuer: reader.read_string()?,
        })
    }
}

impl Encodable for TxKind {
    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            TxKind::Coinbase => out.push(0),
            TxKind::Transfer => out.push(1),
            TxKind::CertificateIssue(payload) => {
                out.push(2);
                payload.encode_into(out);
            }
            TxKind::CertificateAssign => out.push(3),
            TxKind::Compensation => out.push(4),
        }
    }
}

impl Decodable for TxKind {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        match reader.read_u8()? {
            0 => Ok(TxKind::Coinbase),
            1 => Ok(TxKind::Transfer),
            2 => Ok(TxKind::CertificateIssue(CertificatePayload::decode_from(reader)?)),
            3 => Ok(TxKind::CertificateAssign),
            4 => Ok(TxKind::Compensation),
            tag => Err(CodecError::InvalidTag { what: "tx kind", tag }),
        }
    }
}

impl Encodable for TxInput {
    fn encode_into(&self, out: &mut Vec<u8>) {
        self.previous_output.encode_into(out);
        put_bytes(out, &self.signature);
        put_bytes(out, &self.public_key);
    }
}

impl Decodable for TxInput {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(TxInput {
            previous_output: UtxoKey::decode_from(reader)?,
            signature: reader.read_bytes()?,
            public_key: reader.read_bytes()?,
        })
    }
}

impl Encodable for TxOutput {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.amount.to_be_bytes());
        self.address.encode_into(out);
        self.coin_state.encode_into(out);
        put_option(out, &self.certificate_id);
        put_option(out, &self.metadata);
    }
}

impl Decodable for TxOutput {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(TxOutput {
            amount: reader.read_u64()?,
            address: Address::decode_from(reader)?,
            coin_state: CoinState::decode_from(reader)?,
            certificate_id: read_option(reader)?,
            metadata: read_option(reader)?,
        })
    }
}

impl Encodable for Transaction {
    fn encode_into(&self, out: &mut Vec<u8>) {
        self.kind.encode_into(out);
        out.extend_from_slice(&(self.inputs.len() as u32).to_be_bytes());
        for input in &self.inputs {
            input.encode_into(out);
        }
        out.extend_from_slice(&(self.outputs.len() as u32).to_be_bytes());
        for output in &self.outputs {
            output.encode_into(out);
        }
        out.extend_from_slice(&self.timestamp.to_be_bytes());
    }
}

impl Decodable for Transaction {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let kind = TxKind::decode_from(reader)?;
        // Smallest input: 36-byte outpoint + two empty length prefixes.
        let input_count = reader.read_seq_len(44)?;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            inputs.push(TxInput::decode_from(reader)?);
        }
        // Smallest output: amount + address + state + two absence bytes.
        let output_count = reader.read_seq_len(32)?;
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            outputs.push(TxOutput::decode_from(reader)?);
        }
        Ok(Transaction {
            kind,
            inputs,
            outputs,
            timestamp: reader.read_i64()?,
        })
    }
}

impl Encodable for BlockHeader {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.height.to_be_bytes());
        self.prev_hash.encode_into(out);
        self.merkle_root.encode_into(out);
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.difficulty.to_be_bytes());
        out.extend_from_slice(&self.nonce.to_be_bytes());
    }
}

impl Decodable for BlockHeader {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(BlockHeader {
            height: reader.read_u64()?,
            prev_hash: Hash256::decode_from(reader)?,
            merkle_root: Hash256::decode_from(reader)?,
            timestamp: reader.read_i64()?,
            difficulty: reader.read_u32()?,
            nonce: reader.read_u64()?,
        })
    }
}

/// Serialized header size: 8 + 32 + 32 + 8 + 4 + 8.
pub const HEADER_ENCODED_LEN: usize = 92;

impl Encodable for Block {
    fn encode_into(&self, out: &mut Vec<u8>) {
        self.header.encode_into(out);
        out.extend_from_slice(&(self.transactions.len() as u32).to_be_bytes());
        for tx in &self.transactions {
            tx.encode_into(out);
        }
    }
}

impl Decodable for Block {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let header = BlockHeader::decode_from(reader)?;
        // Smallest transaction: kind + two empty sequences + timestamp.
        let tx_count = reader.read_seq_len(17)?;
        let mut transactions = Vec::with_capacity(tx_count);
        for _ in 0..tx_count {
            transactions.push(Transaction::decode_from(reader)?);
        }
        Ok(Block { header, transactions })
    }
}

impl Encodable for CertificateRecord {
    fn encode_into(&self, out: &mut Vec<u8>) {
        self.id.encode_into(out);
        put_string(out, &self.project_id);
        out.extend_from_slice(&self.vintage_year.to_be_bytes());
        out.extend_from_slice(&self.total_amount.to_be_bytes());
        out.extend_from_slice(&self.assigned_amount.to_be_bytes());
        out.extend_from_slice(&self.compensated_amount.to_be_bytes());
        put_string(out, &self.cert_type);
        put_string(out, &self.standard);
        put_string(out, &self.issuer);
        out.extend_from_slice(&self.issued_at.to_be_bytes());
    }
}

impl Decodable for CertificateRecord {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(CertificateRecord {
            id: CertificateId::decode_from(reader)?,
            project_id: reader.read_string()?,
            vintage_year: reader.read_u16()?,
            total_amount: reader.read_u64()?,
            assigned_amount: reader.read_u64()?,
            compensated_amount: reader.read_u64()?,
            cert_type: reader.read_string()?,
            standard: reader.read_string()?,
            issuer: reader.read_string()?,
            issued_at: reader.read_i64()?,
        })
    }
}
