//! Length-framed wire transport.
//!
//! Every message travels as:
//!
//! ```text
//! magic (4) ‖ command (12, zero-padded ASCII) ‖ payload length (u32 LE)
//!           ‖ checksum (4, first bytes of double-SHA-256(payload)) ‖ payload
//! ```
//!
//! The decoder rejects frames with the wrong magic, a declared length above
//! [`MAX_MESSAGE_SIZE`], or a failed checksum, all of which count as
//! protocol violations against the sending peer.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use carbon_core::address::Network;
use carbon_core::constants::MAX_MESSAGE_SIZE;
use carbon_core::crypto;
use carbon_core::error::NetworkError;

use crate::message::Message;

/// Frame header length: magic + command + length + checksum.
pub const HEADER_LEN: usize = 24;

/// Network magic distinguishing mainnet, testnet and regtest traffic.
pub fn magic(network: Network) -> [u8; 4] {
    match network {
        Network::Mainnet => [0xC0, 0x2C, 0x0C, 0xA1],
        Network::Testnet => [0xC0, 0x2C, 0x0C, 0x7E],
        Network::Regtest => [0xC0, 0x2C, 0x0C, 0x5E],
    }
}

/// Codec error: transport failures plus protocol violations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] NetworkError),
}

enum DecodeState {
    Header,
    Body {
        command: String,
        length: usize,
        checksum: [u8; 4],
    },
}

/// Tokio codec mapping byte streams to [`Message`] streams.
pub struct MessageCodec {
    magic: [u8; 4],
    state: DecodeState,
}

impl MessageCodec {
    pub fn new(network: Network) -> Self {
        Self {
            magic: magic(network),
            state: DecodeState::Header,
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.encode_payload()?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(NetworkError::MessageTooLarge {
                size: payload.len(),
                max: MAX_MESSAGE_SIZE,
            }
            .into());
        }

        let mut command = [0u8; 12];
        command[..item.command().len()].copy_from_slice(item.command().as_bytes());
        let checksum = crypto::sha256d(&payload);

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_slice(&self.magic);
        dst.put_slice(&command);
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&checksum.0[..4]);
        dst.put_slice(&payload);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Self::Error> {
        loop {
            match &self.state {
                DecodeState::Header => {
                    if src.len() < HEADER_LEN {
                        return Ok(None);
                    }

                    let header = src.split_to(HEADER_LEN);
                    if header[0..4] != self.magic {
                        return Err(NetworkError::BadMagic.into());
                    }

                    let command_bytes = &header[4..16];
                    let end = command_bytes
                        .iter()
                        .position(|b| *b == 0)
                        .unwrap_or(command_bytes.len());
                    let command = std::str::from_utf8(&command_bytes[..end])
                        .map_err(|_| {
                            NetworkError::InvalidMessage("non-ASCII command".into())
                        })?
                        .to_string();
                    // Zero padding must be zero all the way out.
                    if command_bytes[end..].iter().any(|b| *b != 0) {
                        return Err(
                            NetworkError::InvalidMessage("garbage in command padding".into()).into()
                        );
                    }

                    let length =
                        u32::from_le_bytes(header[16..20].try_into().unwrap()) as usize;
                    if length > MAX_MESSAGE_SIZE {
                        return Err(NetworkError::MessageTooLarge {
                            size: length,
                            max: MAX_MESSAGE_SIZE,
                        }
                        .into());
                    }
                    let checksum: [u8; 4] = header[20..24].try_into().unwrap();

                    self.state = DecodeState::Body { command, length, checksum };
                }
                DecodeState::Body { command, length, checksum } => {
                    if src.len() < *length {
                        src.reserve(*length - src.len());
                        return Ok(None);
                    }

                    let payload = src.split_to(*length);
                    let computed = crypto::sha256d(&payload);
                    if computed.0[..4] != *checksum {
                        self.state = DecodeState::Header;
                        return Err(NetworkError::ChecksumMismatch.into());
                    }

                    let message = Message::decode_payload(command, &payload)?;
                    self.state = DecodeState::Header;
                    return Ok(Some(message));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carbon_core::genesis;
    use carbon_core::types::Hash256;

    fn encode(network: Network, msg: Message) -> BytesMut {
        let mut codec = MessageCodec::new(network);
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn frame_layout() {
        let buf = encode(Network::Regtest, Message::Verack);
        assert_eq!(&buf[0..4], &magic(Network::Regtest));
        assert_eq!(&buf[4..10], b"verack");
        assert!(buf[10..16].iter().all(|b| *b == 0));
        assert_eq!(&buf[16..20], &0u32.to_le_bytes());
        // Empty-payload checksum is the double-SHA of nothing.
        assert_eq!(&buf[20..24], &crypto::sha256d(&[]).0[..4]);
        assert_eq!(buf.len(), HEADER_LEN);
    }

    #[test]
    fn round_trip_through_codec() {
        let msg = Message::Block(Box::new(genesis::genesis_block().clone()));
        let mut buf = encode(Network::Mainnet, msg.clone());
        let mut codec = MessageCodec::new(Network::Mainnet);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let full = encode(Network::Mainnet, Message::Ping(9));
        let mut codec = MessageCodec::new(Network::Mainnet);

        let mut buf = BytesMut::from(&full[..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[10..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Message::Ping(9));
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut buf = encode(Network::Mainnet, Message::Ping(1));
        buf.extend_from_slice(&encode(Network::Mainnet, Message::Pong(2)));
        let mut codec = MessageCodec::new(Network::Mainnet);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Message::Ping(1));
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Message::Pong(2));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn wrong_magic_rejected() {
        let mut buf = encode(Network::Mainnet, Message::Verack);
        let mut codec = MessageCodec::new(Network::Testnet);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::Protocol(NetworkError::BadMagic)),
        ));
    }

    #[test]
    fn corrupted_checksum_rejected() {
        let mut buf = encode(Network::Mainnet, Message::Ping(9));
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        let mut codec = MessageCodec::new(Network::Mainnet);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::Protocol(NetworkError::ChecksumMismatch)),
        ));
    }

    #[test]
    fn oversize_declared_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_slice(&magic(Network::Mainnet));
        buf.put_slice(b"block\0\0\0\0\0\0\0");
        buf.put_u32_le((MAX_MESSAGE_SIZE + 1) as u32);
        buf.put_slice(&[0u8; 4]);
        let mut codec = MessageCodec::new(Network::Mainnet);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::Protocol(NetworkError::MessageTooLarge { .. })),
        ));
    }

    #[test]
    fn garbage_command_padding_rejected() {
        let mut buf = BytesMut::new();
        buf.put_slice(&magic(Network::Mainnet));
        buf.put_slice(b"ping\0\0\0\0\0\0\0X");
        buf.put_u32_le(8);
        let payload = 1u64.to_be_bytes();
        buf.put_slice(&crypto::sha256d(&payload).0[..4]);
        buf.put_slice(&payload);
        let mut codec = MessageCodec::new(Network::Mainnet);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn distinct_magics_per_network() {
        let magics = [
            magic(Network::Mainnet),
            magic(Network::Testnet),
            magic(Network::Regtest),
        ];
        assert_ne!(magics[0], magics[1]);
        assert_ne!(magics[1], magics[2]);
        assert_ne!(magics[0], magics[2]);
    }

    #[test]
    fn codec_recovers_after_checksum_failure() {
        let mut bad = encode(Network::Mainnet, Message::Ping(9));
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        let mut codec = MessageCodec::new(Network::Mainnet);
        assert!(codec.decode(&mut bad).is_err());

        let mut good = encode(Network::Mainnet, Message::Pong(3));
        assert_eq!(codec.decode(&mut good).unwrap().unwrap(), Message::Pong(3));
    }

    #[test]
    fn stop_hash_frames_round_trip() {
        let msg = Message::GetHeaders {
            locator: vec![Hash256([5; 32])],
            stop_hash: Hash256([6; 32]),
        };
        let mut buf = encode(Network::Regtest, msg.clone());
        let mut codec = MessageCodec::new(Network::Regtest);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), msg);
    }
}
