//! Wire message types and their payload codecs.
//!
//! Thirteen message kinds cover handshake, liveness, headers-first sync,
//! inventory relay, and rejection feedback. Payloads use the same canonical
//! encoding as consensus data, never a generic serializer.

use carbon_core::codec::{put_string, Decodable, Encodable, Reader, HEADER_ENCODED_LEN};
use carbon_core::constants::{
    MAX_HEADERS_PER_MSG, MAX_INV_PER_MSG, MAX_LOCATOR_SIZE, PROTOCOL_VERSION, USER_AGENT,
};
use carbon_core::error::{CodecError, NetworkError, RejectCode};
use carbon_core::types::{Block, BlockHeader, Hash256, Transaction};

/// Inventory item kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InvKind {
    Block,
    Tx,
}

/// One announced or requested item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InvItem {
    pub kind: InvKind,
    pub hash: Hash256,
}

impl InvItem {
    pub fn block(hash: Hash256) -> Self {
        Self { kind: InvKind::Block, hash }
    }

    pub fn tx(hash: Hash256) -> Self {
        Self { kind: InvKind::Tx, hash }
    }
}

/// Handshake payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionPayload {
    pub protocol_version: u32,
    /// Services bitmap; bit 0 = full blocks.
    pub services: u64,
    /// Receiver address as observed by the sender.
    pub receiver_addr: String,
    /// Sender's self-reported address.
    pub sender_addr: String,
    /// Random nonce for self-connection detection.
    pub nonce: u64,
    pub user_agent: String,
    /// Sender's best-chain height.
    pub start_height: u64,
}

impl VersionPayload {
    pub fn new(nonce: u64, start_height: u64, receiver_addr: String, sender_addr: String) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            services: 1,
            receiver_addr,
            sender_addr,
            nonce,
            user_agent: USER_AGENT.to_string(),
            start_height,
        }
    }
}

/// A P2P message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Version(VersionPayload),
    Verack,
    Ping(u64),
    Pong(u64),
    GetHeaders { locator: Vec<Hash256>, stop_hash: Hash256 },
    Headers(Vec<BlockHeader>),
    GetBlocks { locator: Vec<Hash256>, stop_hash: Hash256 },
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
    Block(Box<Block>),
    Tx(Box<Transaction>),
    Mempool,
    Reject { message: String, code: RejectCode, reason: String },
}

impl Message {
    /// Wire command name, at most 12 ASCII bytes.
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::GetHeaders { .. } => "getheaders",
            Message::Headers(_) => "headers",
            Message::GetBlocks { .. } => "getblocks",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
            Message::Mempool => "mempool",
            Message::Reject { .. } => "reject",
        }
    }

    /// Enforce per-kind payload limits. Applied on both encode and decode so
    /// a node never relays what it would reject.
    pub fn validate(&self) -> Result<(), NetworkError> {
        let oversized = |what: &str| NetworkError::InvalidMessage(what.to_string());
        match self {
            Message::GetHeaders { locator, .. } | Message::GetBlocks { locator, .. } => {
                if locator.len() > MAX_LOCATOR_SIZE {
                    return Err(oversized("locator exceeds limit"));
                }
            }
            Message::Headers(headers) => {
                if headers.len() > MAX_HEADERS_PER_MSG {
                    return Err(oversized("headers exceed limit"));
                }
            }
            Message::Inv(items) | Message::GetData(items) => {
                if items.len() > MAX_INV_PER_MSG {
                    return Err(oversized("inventory exceeds limit"));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Canonical payload bytes (without the frame header).
    pub fn encode_payload(&self) -> Result<Vec<u8>, NetworkError> {
        self.validate()?;
        let mut out = Vec::new();
        match self {
            Message::Version(v) => v.encode_into(&mut out),
            Message::Verack | Message::Mempool => {}
            Message::Ping(nonce) | Message::Pong(nonce) => {
                out.extend_from_slice(&nonce.to_be_bytes());
            }
            Message::GetHeaders { locator, stop_hash }
            | Message::GetBlocks { locator, stop_hash } => {
                encode_seq(&mut out, locator);
                stop_hash.encode_into(&mut out);
            }
            Message::Headers(headers) => encode_seq(&mut out, headers),
            Message::Inv(items) | Message::GetData(items) => encode_seq(&mut out, items),
            Message::Block(block) => block.encode_into(&mut out),
            Message::Tx(tx) => tx.encode_into(&mut out),
            Message::Reject { message, code, reason } => {
                put_string(&mut out, message);
                out.push(*code);
                put_string(&mut out, reason);
            }
        }
        Ok(out)
    }

    /// Decode a payload for a known command name.
    pub fn decode_payload(command: &str, payload: &[u8]) -> Result<Self, NetworkError> {
        let decoded = match command {
            "version" => Message::Version(decode_all(payload)?),
            "verack" => expect_empty(payload, Message::Verack)?,
            "ping" => Message::Ping(decode_nonce(payload)?),
            "pong" => Message::Pong(decode_nonce(payload)?),
            "getheaders" => {
                let (locator, stop_hash) = decode_locator(payload)?;
                Message::GetHeaders { locator, stop_hash }
            }
            "getblocks" => {
                let (locator, stop_hash) = decode_locator(payload)?;
                Message::GetBlocks { locator, stop_hash }
            }
            "headers" => {
                let mut reader = Reader::new(payload);
                let headers = decode_seq::<BlockHeader>(&mut reader, HEADER_ENCODED_LEN)?;
                finish(reader)?;
                Message::Headers(headers)
            }
            "inv" => Message::Inv(decode_inv(payload)?),
            "getdata" => Message::GetData(decode_inv(payload)?),
            "block" => Message::Block(Box::new(decode_all(payload)?)),
            "tx" => Message::Tx(Box::new(decode_all(payload)?)),
            "mempool" => expect_empty(payload, Message::Mempool)?,
            "reject" => {
                let mut reader = Reader::new(payload);
                let message = reader.read_string().map_err(codec_err)?;
                let code = reader.read_u8().map_err(codec_err)?;
                let reason = reader.read_string().map_err(codec_err)?;
                finish(reader)?;
                Message::Reject { message, code, reason }
            }
            other => return Err(NetworkError::UnknownCommand(other.to_string())),
        };
        decoded.validate()?;
        Ok(decoded)
    }
}

// --- payload helpers ---

fn codec_err(err: CodecError) -> NetworkError {
    NetworkError::InvalidMessage(err.to_string())
}

fn decode_all<T: Decodable>(payload: &[u8]) -> Result<T, NetworkError> {
    T::decode_all(payload).map_err(codec_err)
}

fn decode_nonce(payload: &[u8]) -> Result<u64, NetworkError> {
    let mut reader = Reader::new(payload);
    let nonce = reader.read_u64().map_err(codec_err)?;
    finish(reader)?;
    Ok(nonce)
}

fn expect_empty(payload: &[u8], msg: Message) -> Result<Message, NetworkError> {
    if payload.is_empty() {
        Ok(msg)
    } else {
        Err(NetworkError::InvalidMessage("unexpected payload".into()))
    }
}

fn finish(reader: Reader<'_>) -> Result<(), NetworkError> {
    if reader.remaining() != 0 {
        return Err(NetworkError::InvalidMessage("trailing bytes".into()));
    }
    Ok(())
}

fn encode_seq<T: Encodable>(out: &mut Vec<u8>, items: &[T]) {
    out.extend_from_slice(&(items.len() as u32).to_be_bytes());
    for item in items {
        item.encode_into(out);
    }
}

fn decode_seq<T: Decodable>(reader: &mut Reader<'_>, min_item: usize) -> Result<Vec<T>, NetworkError> {
    let count = reader.read_seq_len(min_item).map_err(codec_err)?;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(T::decode_from(reader).map_err(codec_err)?);
    }
    Ok(items)
}

fn decode_locator(payload: &[u8]) -> Result<(Vec<Hash256>, Hash256), NetworkError> {
    let mut reader = Reader::new(payload);
    let locator = decode_seq::<Hash256>(&mut reader, 32)?;
    let stop_hash = Hash256::decode_from(&mut reader).map_err(codec_err)?;
    finish(reader)?;
    Ok((locator, stop_hash))
}

fn decode_inv(payload: &[u8]) -> Result<Vec<InvItem>, NetworkError> {
    let mut reader = Reader::new(payload);
    let items = decode_seq::<InvItem>(&mut reader, 33)?;
    finish(reader)?;
    Ok(items)
}

impl Encodable for VersionPayload {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.protocol_version.to_be_bytes());
        out.extend_from_slice(&self.services.to_be_bytes());
        put_string(out, &self.receiver_addr);
        put_string(out, &self.sender_addr);
        out.extend_from_slice(&self.nonce.to_be_bytes());
        put_string(out, &self.user_agent);
        out.extend_from_slice(&self.start_height.to_be_bytes());
    }
}

impl Decodable for VersionPayload {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(VersionPayload {
            protocol_version: reader.read_u32()?,
            services: reader.read_u64()?,
            receiver_addr: reader.read_string()?,
            sender_addr: reader.read_string()?,
            nonce: reader.read_u64()?,
            user_agent: reader.read_string()?,
            start_height: reader.read_u64()?,
        })
    }
}

impl Encodable for InvItem {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(match self.kind {
            InvKind::Block => 0,
            InvKind::Tx => 1,
        });
        self.hash.encode_into(out);
    }
}

impl Decodable for InvItem {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let kind = match reader.read_u8()? {
            0 => InvKind::Block,
            1 => InvKind::Tx,
            tag => return Err(CodecError::InvalidTag { what: "inventory kind", tag }),
        };
        Ok(InvItem {
            kind,
            hash: Hash256::decode_from(reader)?,
        })
    }
}
