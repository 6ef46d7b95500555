//! Headers-first initial block download.
//!
//! A pure state machine, driven by the connection service: it consumes peer
//! registrations, `HEADERS` batches, arriving `BLOCK` bodies and timeout
//! ticks, and emits [`SyncAction`]s (requests to send, blocks to connect).
//! Keeping it free of I/O makes the download schedule (header validation
//! before body requests, bounded per-peer pipelines, failure-driven peer
//! demotion) directly testable.
//!
//! Flow: pick the best peer (highest advertised height), request headers
//! from our locator, validate each header's linkage and PoW, then pipeline
//! body downloads across every ready peer with a bounded in-flight window,
//! connecting bodies in header order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;

use tracing::{debug, warn};

use carbon_core::constants::{BLOCK_DOWNLOAD_WINDOW, MAX_HEADERS_PER_MSG};
use carbon_core::error::NetworkError;
use carbon_core::types::{Block, BlockHeader, Hash256};

/// Peers are identified by their socket address.
pub type PeerId = SocketAddr;

/// Seconds before an in-flight block request is abandoned.
pub const REQUEST_TIMEOUT_SECS: i64 = 30;

/// Request failures tolerated before a peer is dropped from sync.
pub const MAX_PEER_FAILURES: u32 = 3;

/// Current phase of synchronization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// Caught up; nothing in progress.
    Idle,
    /// Fetching headers toward the sync peer's advertised height.
    DownloadingHeaders { target_height: u64 },
    /// Headers accepted; fetching bodies.
    DownloadingBlocks,
    Done,
}

/// Instructions for the connection service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncAction {
    RequestHeaders {
        peer: PeerId,
        locator: Vec<Hash256>,
        stop_hash: Hash256,
    },
    RequestBlock { peer: PeerId, hash: Hash256 },
    /// Run consensus validation and connect.
    ConnectBlock(Box<Block>),
    SyncComplete,
    Wait,
}

/// Per-peer download bookkeeping.
#[derive(Clone, Debug)]
struct PeerSync {
    height: u64,
    in_flight: HashSet<Hash256>,
    requested_at: HashMap<Hash256, i64>,
    failures: u32,
    dropped: bool,
}

impl PeerSync {
    fn new(height: u64) -> Self {
        Self {
            height,
            in_flight: HashSet::new(),
            requested_at: HashMap::new(),
            failures: 0,
            dropped: false,
        }
    }

    fn usable(&self) -> bool {
        !self.dropped
    }

    fn has_capacity(&self) -> bool {
        self.usable() && self.in_flight.len() < BLOCK_DOWNLOAD_WINDOW
    }
}

/// The sync coordinator.
pub struct SyncManager {
    state: SyncState,
    peers: HashMap<PeerId, PeerSync>,
    /// Header-validated hashes not yet requested, in chain order.
    download_queue: VecDeque<Hash256>,
    /// Every header accepted this session, for body verification.
    accepted_headers: HashMap<Hash256, BlockHeader>,
    /// The peer serving the current header download.
    sync_peer: Option<PeerId>,
    local_height: u64,
}

impl Default for SyncManager {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SyncManager {
    pub fn new(local_height: u64) -> Self {
        Self {
            state: SyncState::Idle,
            peers: HashMap::new(),
            download_queue: VecDeque::new(),
            accepted_headers: HashMap::new(),
            sync_peer: None,
            local_height,
        }
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn set_local_height(&mut self, height: u64) {
        self.local_height = height;
    }

    /// A peer completed its handshake and advertised `height`.
    pub fn register_peer(&mut self, peer: PeerId, height: u64) {
        self.peers.insert(peer, PeerSync::new(height));
    }

    pub fn remove_peer(&mut self, peer: &PeerId) {
        if let Some(state) = self.peers.remove(peer) {
            // Orphaned requests go back to the front of the queue.
            for hash in state.in_flight {
                self.download_queue.push_front(hash);
            }
        }
        if self.sync_peer == Some(*peer) {
            self.sync_peer = None;
        }
    }

    /// Best candidate for header download: highest advertised height among
    /// usable peers that still claim more than we have.
    fn select_sync_peer(&self) -> Option<PeerId> {
        self.peers
            .iter()
            .filter(|(_, p)| p.usable() && p.height > self.local_height)
            .max_by_key(|(_, p)| p.height)
            .map(|(id, _)| *id)
    }

    /// Begin (or continue) syncing. `locator` comes from the chain manager.
    pub fn start(&mut self, locator: Vec<Hash256>) -> SyncAction {
        match self.select_sync_peer() {
            Some(peer) => {
                let target_height = self.peers[&peer].height;
                self.state = SyncState::DownloadingHeaders { target_height };
                self.sync_peer = Some(peer);
                debug!(%peer, target_height, "starting headers-first sync");
                SyncAction::RequestHeaders {
                    peer,
                    locator,
                    stop_hash: Hash256::ZERO,
                }
            }
            None => {
                self.state = SyncState::Done;
                SyncAction::SyncComplete
            }
        }
    }

    /// Process a `HEADERS` batch from the sync peer.
    ///
    /// Each header must link to its predecessor (or a block we already have)
    /// and satisfy its own PoW before its body is ever requested.
    /// `known_block` answers whether a hash is already connected locally.
    pub fn on_headers(
        &mut self,
        peer: PeerId,
        headers: &[BlockHeader],
        known_block: impl Fn(&Hash256) -> bool,
    ) -> Result<Vec<SyncAction>, NetworkError> {
        if self.sync_peer != Some(peer) {
            return Err(NetworkError::InvalidMessage("headers from non-sync peer".into()));
        }
        if headers.is_empty() {
            // Peer has nothing beyond our locator: move to body download.
            return Ok(self.begin_block_download());
        }

        let mut prev_hash: Option<Hash256> = None;
        for header in headers {
            let hash = header.hash();
            let links = match prev_hash {
                Some(prev) => header.prev_hash == prev,
                None => {
                    known_block(&header.prev_hash)
                        || self.accepted_headers.contains_key(&header.prev_hash)
                }
            };
            if !links {
                return Err(NetworkError::InvalidMessage("headers do not link".into()));
            }
            if !header.meets_difficulty() {
                return Err(NetworkError::InvalidMessage("header fails PoW".into()));
            }

            if !known_block(&hash) && !self.accepted_headers.contains_key(&hash) {
                self.accepted_headers.insert(hash, header.clone());
                self.download_queue.push_back(hash);
            }
            prev_hash = Some(hash);
        }

        if headers.len() == MAX_HEADERS_PER_MSG {
            // More likely waiting; continue from the last accepted header.
            let locator = vec![prev_hash.expect("batch was non-empty")];
            return Ok(vec![SyncAction::RequestHeaders {
                peer,
                locator,
                stop_hash: Hash256::ZERO,
            }]);
        }

        Ok(self.begin_block_download())
    }

    fn begin_block_download(&mut self) -> Vec<SyncAction> {
        if self.download_queue.is_empty() && self.total_in_flight() == 0 {
            self.state = SyncState::Done;
            return vec![SyncAction::SyncComplete];
        }
        self.state = SyncState::DownloadingBlocks;
        self.schedule_requests(0)
    }

    fn total_in_flight(&self) -> usize {
        self.peers.values().map(|p| p.in_flight.len()).sum()
    }

    /// Fill every usable peer's window from the download queue.
    fn schedule_requests(&mut self, now: i64) -> Vec<SyncAction> {
        let mut actions = Vec::new();
        let mut peer_ids: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, p)| p.usable())
            .map(|(id, _)| *id)
            .collect();
        peer_ids.sort(); // deterministic assignment order

        'outer: for id in peer_ids {
            loop {
                if self.download_queue.is_empty() {
                    break 'outer;
                }
                let peer = self.peers.get_mut(&id).expect("listed peer exists");
                if !peer.has_capacity() {
                    break;
                }
                let hash = self.download_queue.pop_front().expect("queue non-empty");
                peer.in_flight.insert(hash);
                peer.requested_at.insert(hash, now);
                actions.push(SyncAction::RequestBlock { peer: id, hash });
            }
        }
        if actions.is_empty() {
            actions.push(SyncAction::Wait);
        }
        actions
    }

    /// A `BLOCK` body arrived.
    ///
    /// The body must match an accepted header and an outstanding request from
    /// this peer; anything else is unsolicited and scores against the sender.
    pub fn on_block(
        &mut self,
        peer: PeerId,
        block: &Block,
        now: i64,
    ) -> Result<Vec<SyncAction>, NetworkError> {
        let hash = block.header.hash();
        let expected = self.accepted_headers.get(&hash);
        let Some(expected) = expected else {
            return Err(NetworkError::InvalidMessage("unsolicited block".into()));
        };
        if block.header != *expected {
            return Err(NetworkError::InvalidMessage("body does not match header".into()));
        }

        let Some(peer_state) = self.peers.get_mut(&peer) else {
            return Err(NetworkError::InvalidMessage("block from unknown peer".into()));
        };
        if !peer_state.in_flight.remove(&hash) {
            return Err(NetworkError::InvalidMessage("block was not requested from peer".into()));
        }
        peer_state.requested_at.remove(&hash);

        let mut actions = vec![SyncAction::ConnectBlock(Box::new(block.clone()))];
        actions.extend(self.schedule_requests(now));

        // Completion is detected by the scheduler emitting only Wait with an
        // empty pipeline.
        if self.download_queue.is_empty() && self.total_in_flight() == 0 {
            self.state = SyncState::Done;
            actions.retain(|a| *a != SyncAction::Wait);
            actions.push(SyncAction::SyncComplete);
        }
        Ok(actions)
    }

    /// Reassign requests that have been in flight too long. A peer that
    /// keeps timing out is dropped from the download schedule.
    pub fn on_tick(&mut self, now: i64) -> Vec<SyncAction> {
        let mut reassigned = Vec::new();
        for (id, peer) in self.peers.iter_mut() {
            let expired: Vec<Hash256> = peer
                .requested_at
                .iter()
                .filter(|(_, at)| now - **at > REQUEST_TIMEOUT_SECS)
                .map(|(hash, _)| *hash)
                .collect();
            if expired.is_empty() {
                continue;
            }
            peer.failures += expired.len() as u32;
            if peer.failures >= MAX_PEER_FAILURES {
                warn!(peer = %id, failures = peer.failures, "dropping unresponsive sync peer");
                peer.dropped = true;
            }
            for hash in expired {
                peer.in_flight.remove(&hash);
                peer.requested_at.remove(&hash);
                reassigned.push(hash);
            }
        }

        for hash in reassigned.into_iter().rev() {
            self.download_queue.push_front(hash);
        }

        if matches!(self.state, SyncState::DownloadingBlocks) {
            self.schedule_requests(now)
        } else {
            vec![SyncAction::Wait]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carbon_core::genesis;
    use carbon_core::merkle;
    use carbon_core::types::{Transaction, TxKind, TxOutput};

    fn peer(n: u8) -> PeerId {
        format!("10.0.0.{n}:28333").parse().unwrap()
    }

    /// A chain of mined coinbase-only blocks on top of genesis.
    fn make_chain(length: usize) -> Vec<Block> {
        let mut blocks = Vec::with_capacity(length);
        let mut prev_hash = genesis::genesis_hash();
        let mut timestamp = genesis::GENESIS_TIMESTAMP;
        for height in 1..=length as u64 {
            timestamp += 600;
            let coinbase = Transaction {
                kind: TxKind::Coinbase,
                inputs: vec![],
                outputs: vec![TxOutput {
                    metadata: Some(format!("height:{height}")),
                    ..TxOutput::plain(50, genesis::genesis_address())
                }],
                timestamp,
            };
            let txids = vec![coinbase.txid()];
            let mut block = Block {
                header: carbon_core::types::BlockHeader {
                    height,
                    prev_hash,
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
            prev_hash = block.header.hash();
            blocks.push(block);
        }
        blocks
    }

    fn headers_of(blocks: &[Block]) -> Vec<BlockHeader> {
        blocks.iter().map(|b| b.header.clone()).collect()
    }

    fn genesis_known(hash: &Hash256) -> bool {
        *hash == genesis::genesis_hash()
    }

    // --- Peer selection ---

    #[test]
    fn no_peers_means_done() {
        let mut sync = SyncManager::new(0);
        assert_eq!(sync.start(vec![genesis::genesis_hash()]), SyncAction::SyncComplete);
        assert_eq!(*sync.state(), SyncState::Done);
    }

    #[test]
    fn highest_peer_is_chosen() {
        let mut sync = SyncManager::new(0);
        sync.register_peer(peer(1), 10);
        sync.register_peer(peer(2), 100);
        sync.register_peer(peer(3), 50);

        match sync.start(vec![genesis::genesis_hash()]) {
            SyncAction::RequestHeaders { peer: chosen, .. } => assert_eq!(chosen, peer(2)),
            other => panic!("unexpected action {other:?}"),
        }
        assert_eq!(*sync.state(), SyncState::DownloadingHeaders { target_height: 100 });
    }

    #[test]
    fn peers_behind_us_are_ignored() {
        let mut sync = SyncManager::new(80);
        sync.register_peer(peer(1), 50);
        assert_eq!(sync.start(vec![]), SyncAction::SyncComplete);
    }

    // --- Header processing ---

    #[test]
    fn valid_headers_schedule_block_requests() {
        let chain = make_chain(5);
        let mut sync = SyncManager::new(0);
        sync.register_peer(peer(1), 5);
        sync.start(vec![genesis::genesis_hash()]);

        let actions = sync
            .on_headers(peer(1), &headers_of(&chain), genesis_known)
            .unwrap();
        let requested: Vec<Hash256> = actions
            .iter()
            .filter_map(|a| match a {
                SyncAction::RequestBlock { hash, .. } => Some(*hash),
                _ => None,
            })
            .collect();
        assert_eq!(requested.len(), 5);
        assert_eq!(requested[0], chain[0].header.hash());
        assert_eq!(*sync.state(), SyncState::DownloadingBlocks);
    }

    #[test]
    fn non_linking_headers_rejected() {
        let chain = make_chain(3);
        let mut headers = headers_of(&chain);
        headers[2].prev_hash = Hash256([0x66; 32]);

        let mut sync = SyncManager::new(0);
        sync.register_peer(peer(1), 3);
        sync.start(vec![genesis::genesis_hash()]);
        assert!(sync.on_headers(peer(1), &headers, genesis_known).is_err());
    }

    #[test]
    fn bad_pow_header_rejected() {
        let chain = make_chain(2);
        let mut headers = headers_of(&chain);
        headers[1].difficulty = 200;

        let mut sync = SyncManager::new(0);
        sync.register_peer(peer(1), 2);
        sync.start(vec![genesis::genesis_hash()]);
        assert!(sync.on_headers(peer(1), &headers, genesis_known).is_err());
    }

    #[test]
    fn headers_from_wrong_peer_rejected() {
        let chain = make_chain(1);
        let mut sync = SyncManager::new(0);
        sync.register_peer(peer(1), 5);
        sync.register_peer(peer(2), 4);
        sync.start(vec![genesis::genesis_hash()]);
        assert!(sync
            .on_headers(peer(2), &headers_of(&chain), genesis_known)
            .is_err());
    }

    #[test]
    fn empty_headers_complete_sync() {
        let mut sync = SyncManager::new(0);
        sync.register_peer(peer(1), 5);
        sync.start(vec![genesis::genesis_hash()]);
        let actions = sync.on_headers(peer(1), &[], genesis_known).unwrap();
        assert_eq!(actions, vec![SyncAction::SyncComplete]);
        assert_eq!(*sync.state(), SyncState::Done);
    }

    // --- Block download ---

    #[test]
    fn bodies_flow_through_connect_to_completion() {
        let chain = make_chain(3);
        let mut sync = SyncManager::new(0);
        sync.register_peer(peer(1), 3);
        sync.start(vec![genesis::genesis_hash()]);
        sync.on_headers(peer(1), &headers_of(&chain), genesis_known).unwrap();

        for (i, block) in chain.iter().enumerate() {
            let actions = sync.on_block(peer(1), block, 0).unwrap();
            assert!(matches!(actions[0], SyncAction::ConnectBlock(_)));
            if i == chain.len() - 1 {
                assert!(actions.contains(&SyncAction::SyncComplete));
            }
        }
        assert_eq!(*sync.state(), SyncState::Done);
    }

    #[test]
    fn unsolicited_block_rejected() {
        let chain = make_chain(2);
        let mut sync = SyncManager::new(0);
        sync.register_peer(peer(1), 2);
        sync.start(vec![genesis::genesis_hash()]);
        // No headers accepted yet: any body is unsolicited.
        assert!(sync.on_block(peer(1), &chain[0], 0).is_err());
    }

    #[test]
    fn block_from_wrong_peer_rejected() {
        let chain = make_chain(1);
        let mut sync = SyncManager::new(0);
        sync.register_peer(peer(1), 1);
        sync.register_peer(peer(2), 1);
        sync.start(vec![genesis::genesis_hash()]);
        sync.on_headers(peer(1), &headers_of(&chain), genesis_known).unwrap();

        // peer(1) sorts before peer(2), so the single request went to it.
        assert!(sync.on_block(peer(2), &chain[0], 0).is_err());
        assert!(sync.on_block(peer(1), &chain[0], 0).is_ok());
    }

    #[test]
    fn window_bounds_in_flight_requests() {
        let chain = make_chain(BLOCK_DOWNLOAD_WINDOW + 10);
        let mut sync = SyncManager::new(0);
        sync.register_peer(peer(1), chain.len() as u64);
        sync.start(vec![genesis::genesis_hash()]);

        let actions = sync
            .on_headers(peer(1), &headers_of(&chain), genesis_known)
            .unwrap();
        let requested = actions
            .iter()
            .filter(|a| matches!(a, SyncAction::RequestBlock { .. }))
            .count();
        assert_eq!(requested, BLOCK_DOWNLOAD_WINDOW);

        // Delivering one body frees one slot.
        let follow_up = sync.on_block(peer(1), &chain[0], 0).unwrap();
        let next_requests = follow_up
            .iter()
            .filter(|a| matches!(a, SyncAction::RequestBlock { .. }))
            .count();
        assert_eq!(next_requests, 1);
    }

    #[test]
    fn downloads_spread_across_peers() {
        let chain = make_chain(BLOCK_DOWNLOAD_WINDOW * 2);
        let mut sync = SyncManager::new(0);
        sync.register_peer(peer(1), chain.len() as u64);
        sync.register_peer(peer(2), chain.len() as u64);
        sync.start(vec![genesis::genesis_hash()]);

        let actions = sync
            .on_headers(peer(1), &headers_of(&chain), genesis_known)
            .unwrap();
        let mut per_peer: HashMap<PeerId, usize> = HashMap::new();
        for action in &actions {
            if let SyncAction::RequestBlock { peer, .. } = action {
                *per_peer.entry(*peer).or_default() += 1;
            }
        }
        assert_eq!(per_peer[&peer(1)], BLOCK_DOWNLOAD_WINDOW);
        assert_eq!(per_peer[&peer(2)], BLOCK_DOWNLOAD_WINDOW);
    }

    // --- Timeouts ---

    #[test]
    fn timed_out_requests_are_reassigned() {
        // Enough stalled requests to cross the failure limit in one tick.
        let chain = make_chain(MAX_PEER_FAILURES as usize);
        let mut sync = SyncManager::new(0);
        sync.register_peer(peer(1), chain.len() as u64);
        sync.start(vec![genesis::genesis_hash()]);
        sync.on_headers(peer(1), &headers_of(&chain), genesis_known).unwrap();

        // Another peer joins; the stalled requests move to it once peer 1
        // is dropped for unresponsiveness.
        sync.register_peer(peer(2), chain.len() as u64);
        let actions = sync.on_tick(REQUEST_TIMEOUT_SECS + 1);
        let reassigned: Vec<PeerId> = actions
            .iter()
            .filter_map(|a| match a {
                SyncAction::RequestBlock { peer, .. } => Some(*peer),
                _ => None,
            })
            .collect();
        assert_eq!(reassigned.len(), chain.len());
        assert!(reassigned.iter().all(|p| *p == peer(2)));
    }

    #[test]
    fn repeatedly_failing_peer_is_dropped() {
        let chain = make_chain(MAX_PEER_FAILURES as usize);
        let mut sync = SyncManager::new(0);
        sync.register_peer(peer(1), chain.len() as u64);
        sync.start(vec![genesis::genesis_hash()]);
        sync.on_headers(peer(1), &headers_of(&chain), genesis_known).unwrap();

        sync.on_tick(REQUEST_TIMEOUT_SECS + 1);
        // All requests expired at once; the peer crossed the failure limit
        // and receives no further assignments.
        let actions = sync.on_tick(2 * (REQUEST_TIMEOUT_SECS + 1));
        assert!(actions
            .iter()
            .all(|a| !matches!(a, SyncAction::RequestBlock { peer: p, .. } if *p == peer(1))));
    }

    #[test]
    fn disconnecting_peer_requeues_requests() {
        let chain = make_chain(3);
        let mut sync = SyncManager::new(0);
        sync.register_peer(peer(1), 3);
        sync.start(vec![genesis::genesis_hash()]);
        sync.on_headers(peer(1), &headers_of(&chain), genesis_known).unwrap();

        sync.remove_peer(&peer(1));
        sync.register_peer(peer(2), 3);
        let actions = sync.on_tick(0);
        let count = actions
            .iter()
            .filter(|a| matches!(a, SyncAction::RequestBlock { peer: p, .. } if *p == peer(2)))
            .count();
        assert_eq!(count, 3);
    }
}
