//! Per-peer protocol state machine: handshake, liveness, misbehavior.
//!
//! The machine is pure (it consumes messages and clock ticks and emits
//! replies), so handshake ordering, ping timeouts and ban scoring are all
//! testable without sockets. The tokio service (see [`service`](crate::service))
//! drives one `Peer` per connection.
//!
//! State flow:
//! `Disconnected → Connecting → HandshakingVersion → HandshakingVerack →
//! Ready → Closing`. `Ready` is reached once both `VERSION` and `VERACK`
//! have been exchanged in each direction.

use std::collections::{HashSet, VecDeque};

use carbon_core::constants::MIN_PROTOCOL_VERSION;
use carbon_core::error::NetworkError;

use crate::message::{InvItem, Message, VersionPayload};

/// Ban score at which the peer is disconnected and blacklisted.
pub const BAN_THRESHOLD: u32 = 100;

/// Bound on the per-peer known-inventory set.
pub const KNOWN_INVENTORY_CAP: usize = 4096;

/// Idle seconds before a PING probe is sent.
pub const PING_INTERVAL_SECS: i64 = 120;

/// Seconds a PONG may take before the peer is closed.
pub const PING_TIMEOUT_SECS: i64 = 30;

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    /// Waiting for the remote `VERSION`.
    HandshakingVersion,
    /// Version exchanged; waiting for `VERACK`.
    HandshakingVerack,
    Ready,
    Closing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Protocol violations and their ban-score weight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Offense {
    InvalidPoW,
    InvalidSignature,
    OversizedMessage,
    InvalidMessage,
    NonMonotonicTimestamp,
    UnsolicitedBlock,
}

impl Offense {
    pub fn points(&self) -> u32 {
        match self {
            Offense::InvalidPoW => 50,
            Offense::InvalidSignature => 50,
            Offense::OversizedMessage => 20,
            Offense::InvalidMessage => 10,
            Offense::NonMonotonicTimestamp => 10,
            Offense::UnsolicitedBlock => 5,
        }
    }
}

/// What the service should do after a clock tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    /// Send the contained PING.
    SendPing(Message),
    /// Liveness window expired: close the connection.
    Close,
}

/// Our side of the handshake.
#[derive(Clone, Debug)]
pub struct HandshakeInfo {
    pub nonce: u64,
    pub start_height: u64,
    pub local_addr: String,
    pub peer_addr: String,
}

impl HandshakeInfo {
    fn version_message(&self) -> Message {
        Message::Version(VersionPayload::new(
            self.nonce,
            self.start_height,
            self.peer_addr.clone(),
            self.local_addr.clone(),
        ))
    }
}

/// State machine for one connection.
pub struct Peer {
    state: PeerState,
    direction: Direction,
    version_sent: bool,
    remote_version: Option<VersionPayload>,
    verack_received: bool,
    ban_score: u32,
    known_inventory: HashSet<InvItem>,
    inventory_order: VecDeque<InvItem>,
    pending_ping: Option<(u64, i64)>,
    last_message_at: i64,
}

impl Peer {
    pub fn outbound(now: i64) -> Self {
        Self::new(Direction::Outbound, now)
    }

    pub fn inbound(now: i64) -> Self {
        Self::new(Direction::Inbound, now)
    }

    fn new(direction: Direction, now: i64) -> Self {
        Self {
            state: PeerState::Connecting,
            direction,
            version_sent: false,
            remote_version: None,
            verack_received: false,
            ban_score: 0,
            known_inventory: HashSet::new(),
            inventory_order: VecDeque::new(),
            pending_ping: None,
            last_message_at: now,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_ready(&self) -> bool {
        self.state == PeerState::Ready
    }

    pub fn ban_score(&self) -> u32 {
        self.ban_score
    }

    /// Remote best height from the handshake, 0 before it completes.
    pub fn start_height(&self) -> u64 {
        self.remote_version.as_ref().map_or(0, |v| v.start_height)
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.remote_version.as_ref().map(|v| v.user_agent.as_str())
    }

    /// Called when the TCP connection is up. The initiator opens with its
    /// `VERSION`; a responder waits to hear the remote's first.
    pub fn on_connected(&mut self, our: &HandshakeInfo) -> Vec<Message> {
        self.state = PeerState::HandshakingVersion;
        match self.direction {
            Direction::Outbound => {
                self.version_sent = true;
                vec![our.version_message()]
            }
            Direction::Inbound => vec![],
        }
    }

    /// Drive the handshake and liveness machinery with an incoming message.
    ///
    /// Returns replies to send. Non-handshake messages arriving before
    /// `Ready` are protocol violations.
    pub fn handle_message(
        &mut self,
        message: &Message,
        our: &HandshakeInfo,
        now: i64,
    ) -> Result<Vec<Message>, NetworkError> {
        self.last_message_at = now;

        match message {
            Message::Version(version) => self.handle_version(version.clone(), our),
            Message::Verack => {
                if self.remote_version.is_none() || self.verack_received {
                    return Err(NetworkError::InvalidMessage(
                        "verack out of order".into(),
                    ));
                }
                self.verack_received = true;
                self.advance_handshake();
                Ok(vec![])
            }
            Message::Ping(nonce) => {
                if !self.is_ready() {
                    return Err(NetworkError::InvalidMessage("ping before handshake".into()));
                }
                Ok(vec![Message::Pong(*nonce)])
            }
            Message::Pong(nonce) => {
                match self.pending_ping {
                    Some((expected, _)) if expected == *nonce => {
                        self.pending_ping = None;
                        Ok(vec![])
                    }
                    _ => Err(NetworkError::InvalidMessage("unsolicited pong".into())),
                }
            }
            _ if !self.is_ready() => Err(NetworkError::InvalidMessage(
                format!("{} before handshake", message.command()),
            )),
            // Application messages are the service's business.
            _ => Ok(vec![]),
        }
    }

    fn handle_version(
        &mut self,
        version: VersionPayload,
        our: &HandshakeInfo,
    ) -> Result<Vec<Message>, NetworkError> {
        if self.remote_version.is_some() {
            return Err(NetworkError::InvalidMessage("duplicate version".into()));
        }
        if version.nonce == our.nonce {
            self.state = PeerState::Closing;
            return Err(NetworkError::SelfConnect);
        }
        if version.protocol_version < MIN_PROTOCOL_VERSION {
            self.state = PeerState::Closing;
            return Err(NetworkError::VersionTooOld(version.protocol_version));
        }

        self.remote_version = Some(version);

        let mut replies = Vec::new();
        if !self.version_sent {
            self.version_sent = true;
            replies.push(our.version_message());
        }
        replies.push(Message::Verack);
        self.advance_handshake();
        Ok(replies)
    }

    fn advance_handshake(&mut self) {
        if matches!(self.state, PeerState::Closing) {
            return;
        }
        if self.remote_version.is_some() && self.verack_received {
            self.state = PeerState::Ready;
        } else if self.remote_version.is_some() || self.verack_received {
            self.state = PeerState::HandshakingVerack;
        }
    }

    /// Periodic liveness check. `ping_nonce` is used only when a probe is
    /// due, so callers can pass a fresh random value every tick.
    pub fn tick(&mut self, now: i64, ping_nonce: u64) -> TickOutcome {
        if !self.is_ready() {
            return TickOutcome::Idle;
        }
        if let Some((_, sent_at)) = self.pending_ping {
            if now - sent_at > PING_TIMEOUT_SECS {
                self.state = PeerState::Closing;
                return TickOutcome::Close;
            }
            return TickOutcome::Idle;
        }
        if now - self.last_message_at >= PING_INTERVAL_SECS {
            self.pending_ping = Some((ping_nonce, now));
            return TickOutcome::SendPing(Message::Ping(ping_nonce));
        }
        TickOutcome::Idle
    }

    /// Raise the ban score. Returns `true` once the threshold is crossed,
    /// at which point the peer is `Closing`.
    pub fn punish(&mut self, offense: Offense) -> bool {
        self.ban_score = self.ban_score.saturating_add(offense.points());
        if self.ban_score >= BAN_THRESHOLD {
            self.state = PeerState::Closing;
            true
        } else {
            false
        }
    }

    /// Record that the peer knows an item. Returns `false` when it was
    /// already known (announcement can be suppressed).
    pub fn record_inventory(&mut self, item: InvItem) -> bool {
        if !self.known_inventory.insert(item) {
            return false;
        }
        self.inventory_order.push_back(item);
        if self.inventory_order.len() > KNOWN_INVENTORY_CAP {
            if let Some(evicted) = self.inventory_order.pop_front() {
                self.known_inventory.remove(&evicted);
            }
        }
        true
    }

    pub fn knows_inventory(&self, item: &InvItem) -> bool {
        self.known_inventory.contains(item)
    }

    pub fn begin_close(&mut self) {
        self.state = PeerState::Closing;
    }
}
