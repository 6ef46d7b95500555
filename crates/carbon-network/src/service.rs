//! Tokio connection service.
//!
//! One cooperative event loop per connection multiplexes the framed socket,
//! a per-peer command channel, and a timer. The loops drive the pure state
//! machines ([`Peer`](crate::peer::Peer) for handshake/liveness, a shared
//! [`SyncManager`](crate::sync::SyncManager) for initial block download) and
//! hand validated blocks and transactions to the chain manager.
//!
//! Inventory relay: accepted blocks and admitted transactions are announced
//! with `INV` to every ready peer except the origin; each peer task consults
//! its known-inventory set before putting the announcement on the wire.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use carbon_consensus::chain::ChainManager;
use carbon_core::address::Network;
use carbon_core::error::{MempoolError, NetworkError};
use carbon_core::types::Hash256;

use crate::frame::{FrameError, MessageCodec};
use crate::message::{InvItem, InvKind, Message};
use crate::peer::{Direction, HandshakeInfo, Offense, Peer, TickOutcome};
use crate::sync::{PeerId, SyncAction, SyncManager};

/// Seconds a banned address stays blacklisted.
pub const BAN_COOLDOWN_SECS: i64 = 24 * 60 * 60;

/// Per-send timeout; a peer that cannot take a message in this window is
/// treated as gone.
const SEND_TIMEOUT: Duration = Duration::from_secs(20);

/// Interval of the per-connection housekeeping timer.
const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Snapshot of one connection for the `peer_info` query.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub ready: bool,
    pub inbound: bool,
    pub start_height: u64,
    pub user_agent: String,
    pub ban_score: u32,
}

/// Commands a peer task accepts from the rest of the node.
enum PeerCommand {
    Send(Message),
    /// Announce an item unless the peer already knows it.
    Announce(InvItem),
}

struct PeerHandle {
    commands: mpsc::Sender<PeerCommand>,
    info: Arc<Mutex<PeerInfo>>,
}

struct ServiceContext {
    network: Network,
    chain: Arc<ChainManager>,
    nonce: u64,
    peers: Mutex<HashMap<PeerId, PeerHandle>>,
    sync: Mutex<SyncManager>,
    banned: Mutex<HashMap<std::net::IpAddr, i64>>,
}

impl ServiceContext {
    async fn is_banned(&self, addr: &SocketAddr) -> bool {
        let now = chrono::Utc::now().timestamp();
        let mut banned = self.banned.lock().await;
        match banned.get(&addr.ip()) {
            Some(until) if *until > now => true,
            Some(_) => {
                banned.remove(&addr.ip());
                false
            }
            None => false,
        }
    }

    async fn ban(&self, addr: &SocketAddr) {
        let until = chrono::Utc::now().timestamp() + BAN_COOLDOWN_SECS;
        self.banned.lock().await.insert(addr.ip(), until);
        warn!(%addr, "peer banned");
    }

    /// Send a command to one peer, dropping it silently if the task is gone.
    async fn send_to(&self, peer: &PeerId, command: PeerCommand) {
        let handle = {
            let peers = self.peers.lock().await;
            peers.get(peer).map(|h| h.commands.clone())
        };
        if let Some(tx) = handle {
            let _ = tx.send(command).await;
        }
    }

    /// Announce an inventory item to every ready peer but the origin.
    async fn relay_inventory(&self, item: InvItem, except: Option<PeerId>) {
        let targets: Vec<mpsc::Sender<PeerCommand>> = {
            let peers = self.peers.lock().await;
            peers
                .iter()
                .filter(|(addr, _)| Some(**addr) != except)
                .map(|(_, handle)| handle.commands.clone())
                .collect()
        };
        for tx in targets {
            let _ = tx.send(PeerCommand::Announce(item)).await;
        }
    }

    /// Apply sync-manager actions, routing requests to their target peers.
    async fn dispatch(&self, actions: Vec<SyncAction>, origin: Option<PeerId>) {
        for action in actions {
            match action {
                SyncAction::RequestHeaders { peer, locator, stop_hash } => {
                    self.send_to(&peer, PeerCommand::Send(Message::GetHeaders { locator, stop_hash }))
                        .await;
                }
                SyncAction::RequestBlock { peer, hash } => {
                    self.send_to(
                        &peer,
                        PeerCommand::Send(Message::GetData(vec![InvItem::block(hash)])),
                    )
                    .await;
                }
                SyncAction::ConnectBlock(block) => {
                    let hash = block.header.hash();
                    match self.chain.process_block(&block) {
                        Ok(_) => {
                            self.sync.lock().await.set_local_height(self.chain.tip().0);
                            self.relay_inventory(InvItem::block(hash), origin).await;
                        }
                        Err(err) => warn!(%hash, error = %err, "synced block rejected"),
                    }
                }
                SyncAction::SyncComplete => {
                    info!(height = self.chain.tip().0, "initial block download complete");
                }
                SyncAction::Wait => {}
            }
        }
    }
}

/// Handle to the running network service.
pub struct NetworkService {
    context: Arc<ServiceContext>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl NetworkService {
    /// Bind the listener and start accepting connections.
    pub async fn spawn(
        network: Network,
        listen_addr: SocketAddr,
        chain: Arc<ChainManager>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let context = Arc::new(ServiceContext {
            network,
            chain,
            nonce: rand::random(),
            peers: Mutex::new(HashMap::new()),
            sync: Mutex::new(SyncManager::new(0)),
            banned: Mutex::new(HashMap::new()),
        });

        let accept_ctx = Arc::clone(&context);
        let mut accept_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            if accept_ctx.is_banned(&addr).await {
                                debug!(%addr, "rejecting banned peer");
                                continue;
                            }
                            let ctx = Arc::clone(&accept_ctx);
                            let shutdown = accept_shutdown.clone();
                            tokio::spawn(async move {
                                run_peer(stream, addr, Direction::Inbound, ctx, shutdown).await;
                            });
                        }
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            tokio::time::sleep(Duration::from_millis(250)).await;
                        }
                    }
                }
            }
        });

        info!(%local_addr, "p2p service listening");
        Ok(Self { context, local_addr, shutdown })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Dial a remote peer.
    pub async fn connect(&self, addr: SocketAddr) -> Result<(), NetworkError> {
        if self.context.is_banned(&addr).await {
            return Err(NetworkError::Banned);
        }
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NetworkError::PeerConnectionError(e.to_string()))?;
        let ctx = Arc::clone(&self.context);
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            run_peer(stream, addr, Direction::Outbound, ctx, shutdown).await;
        });
        Ok(())
    }

    /// Stop accepting work and close every connection.
    ///
    /// Peer loops observe the signal at their next suspension point and run
    /// their normal cleanup; new dials and accepts are refused immediately.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.context.peers.lock().await.clear();
    }

    /// Announce a locally produced block to all ready peers.
    pub async fn broadcast_block(&self, hash: Hash256) {
        self.context
            .sync
            .lock()
            .await
            .set_local_height(self.context.chain.tip().0);
        self.context
            .relay_inventory(InvItem::block(hash), None)
            .await;
    }

    /// Announce a locally admitted transaction to all ready peers.
    pub async fn broadcast_transaction(&self, txid: Hash256) {
        self.context.relay_inventory(InvItem::tx(txid), None).await;
    }

    /// Snapshot of all connections.
    pub async fn peer_info(&self) -> Vec<PeerInfo> {
        let peers = self.context.peers.lock().await;
        let mut out = Vec::with_capacity(peers.len());
        for handle in peers.values() {
            out.push(handle.info.lock().await.clone());
        }
        out
    }
}

/// Drive one connection to completion.
async fn run_peer(
    stream: TcpStream,
    addr: SocketAddr,
    direction: Direction,
    ctx: Arc<ServiceContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let local_addr = stream
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    let mut framed = Framed::new(stream, MessageCodec::new(ctx.network));

    let now = chrono::Utc::now().timestamp();
    let mut machine = match direction {
        Direction::Inbound => Peer::inbound(now),
        Direction::Outbound => Peer::outbound(now),
    };
    let our = HandshakeInfo {
        nonce: ctx.nonce,
        start_height: ctx.chain.tip().0,
        local_addr,
        peer_addr: addr.to_string(),
    };

    let info = Arc::new(Mutex::new(PeerInfo {
        addr,
        ready: false,
        inbound: direction == Direction::Inbound,
        start_height: 0,
        user_agent: String::new(),
        ban_score: 0,
    }));
    let (command_tx, mut command_rx) = mpsc::channel::<PeerCommand>(256);
    ctx.peers.lock().await.insert(
        addr,
        PeerHandle {
            commands: command_tx,
            info: Arc::clone(&info),
        },
    );

    for message in machine.on_connected(&our) {
        if send(&mut framed, message).await.is_err() {
            cleanup(&ctx, &addr).await;
            return;
        }
    }

    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut was_ready = false;

    loop {
        tokio::select! {
            frame = framed.next() => {
                let now = chrono::Utc::now().timestamp();
                let message = match frame {
                    None => break,
                    Some(Err(FrameError::Io(err))) => {
                        debug!(%addr, error = %err, "connection error");
                        break;
                    }
                    Some(Err(FrameError::Protocol(violation))) => {
                        warn!(%addr, error = %violation, "protocol violation");
                        if machine.punish(offense_for(&violation)) {
                            ctx.ban(&addr).await;
                        }
                        if machine.is_ready() { continue } else { break }
                    }
                    Some(Ok(message)) => message,
                };

                // Handshake / liveness layer.
                let replies = match machine.handle_message(&message, &our, now) {
                    Ok(replies) => replies,
                    Err(NetworkError::SelfConnect) => {
                        debug!(%addr, "self-connection detected");
                        break;
                    }
                    Err(err) => {
                        warn!(%addr, error = %err, "peer misbehaved");
                        if machine.punish(Offense::InvalidMessage) {
                            ctx.ban(&addr).await;
                            break;
                        }
                        continue;
                    }
                };
                let mut failed = false;
                for reply in replies {
                    if send(&mut framed, reply).await.is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed {
                    break;
                }

                if machine.is_ready() && !was_ready {
                    was_ready = true;
                    on_peer_ready(&ctx, addr, &machine, &info).await;
                }

                // Application layer.
                if machine.is_ready() {
                    if let Err(err) =
                        handle_application(&ctx, addr, &mut machine, &mut framed, &message).await
                    {
                        debug!(%addr, error = %err, "closing after send failure");
                        break;
                    }
                }

                if matches!(machine.state(), crate::peer::PeerState::Closing) {
                    break;
                }
            }

            command = command_rx.recv() => {
                let Some(command) = command else { break };
                let outgoing = match command {
                    PeerCommand::Send(message) => Some(message),
                    PeerCommand::Announce(item) => {
                        // Suppress announcements the peer has already seen.
                        (machine.is_ready() && machine.record_inventory(item))
                            .then(|| Message::Inv(vec![item]))
                    }
                };
                if let Some(message) = outgoing {
                    if send(&mut framed, message).await.is_err() {
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                let now = chrono::Utc::now().timestamp();
                match machine.tick(now, rand::random()) {
                    TickOutcome::Idle => {}
                    TickOutcome::SendPing(ping) => {
                        if send(&mut framed, ping).await.is_err() {
                            break;
                        }
                    }
                    TickOutcome::Close => {
                        debug!(%addr, "liveness timeout");
                        break;
                    }
                }
                let actions = ctx.sync.lock().await.on_tick(now);
                ctx.dispatch(actions, Some(addr)).await;
                info.lock().await.ban_score = machine.ban_score();
            }

            _ = shutdown.changed() => {
                debug!(%addr, "closing for shutdown");
                break;
            }
        }
    }

    cleanup(&ctx, &addr).await;
    debug!(%addr, "peer disconnected");
}

async fn cleanup(ctx: &Arc<ServiceContext>, addr: &SocketAddr) {
    ctx.peers.lock().await.remove(addr);
    ctx.sync.lock().await.remove_peer(addr);
}

async fn on_peer_ready(
    ctx: &Arc<ServiceContext>,
    addr: SocketAddr,
    machine: &Peer,
    info: &Arc<Mutex<PeerInfo>>,
) {
    {
        let mut info = info.lock().await;
        info.ready = true;
        info.start_height = machine.start_height();
        info.user_agent = machine.user_agent().unwrap_or_default().to_string();
    }

    let local_height = ctx.chain.tip().0;
    let mut sync = ctx.sync.lock().await;
    sync.set_local_height(local_height);
    sync.register_peer(addr, machine.start_height());

    // Behind this peer: kick off headers-first download.
    if machine.start_height() > local_height {
        let locator = ctx.chain.block_locator();
        let action = sync.start(locator);
        drop(sync);
        ctx.dispatch(vec![action], Some(addr)).await;
    }
}

/// Map a frame-level protocol violation onto the ban schedule.
fn offense_for(violation: &NetworkError) -> Offense {
    match violation {
        NetworkError::MessageTooLarge { .. } => Offense::OversizedMessage,
        _ => Offense::InvalidMessage,
    }
}

async fn send(
    framed: &mut Framed<TcpStream, MessageCodec>,
    message: Message,
) -> Result<(), NetworkError> {
    tokio::time::timeout(SEND_TIMEOUT, framed.send(message))
        .await
        .map_err(|_| NetworkError::PeerTimeout)?
        .map_err(|err| NetworkError::PeerConnectionError(err.to_string()))
}

/// Handle a post-handshake application message.
async fn handle_application(
    ctx: &Arc<ServiceContext>,
    addr: SocketAddr,
    machine: &mut Peer,
    framed: &mut Framed<TcpStream, MessageCodec>,
    message: &Message,
) -> Result<(), NetworkError> {
    match message {
        Message::Inv(items) => {
            let mut wanted = Vec::new();
            for item in items {
                machine.record_inventory(*item);
                let have = match item.kind {
                    InvKind::Block => ctx.chain.has_block(&item.hash),
                    InvKind::Tx => {
                        ctx.chain.mempool_contains(&item.hash)
                            || ctx.chain.get_transaction(&item.hash).is_some()
                    }
                };
                if !have {
                    wanted.push(*item);
                }
            }
            if !wanted.is_empty() {
                send(framed, Message::GetData(wanted)).await?;
            }
        }

        Message::GetData(items) => {
            for item in items {
                let response = match item.kind {
                    InvKind::Block => ctx
                        .chain
                        .get_block_by_hash(&item.hash)
                        .map(|block| Message::Block(Box::new(block))),
                    InvKind::Tx => ctx
                        .chain
                        .get_transaction(&item.hash)
                        .map(|(tx, _)| Message::Tx(Box::new(tx))),
                };
                if let Some(message) = response {
                    send(framed, message).await?;
                }
            }
        }

        Message::GetHeaders { locator, stop_hash } => {
            let headers = ctx.chain.headers_after(
                locator,
                stop_hash,
                carbon_core::constants::MAX_HEADERS_PER_MSG,
            );
            send(framed, Message::Headers(headers)).await?;
        }

        Message::GetBlocks { locator, stop_hash } => {
            let items: Vec<InvItem> = ctx
                .chain
                .headers_after(locator, stop_hash, carbon_core::constants::MAX_INV_PER_MSG)
                .into_iter()
                .map(|header| InvItem::block(header.hash()))
                .collect();
            send(framed, Message::Inv(items)).await?;
        }

        Message::Headers(headers) => {
            let chain = Arc::clone(&ctx.chain);
            let result = {
                let mut sync = ctx.sync.lock().await;
                sync.on_headers(addr, headers, |hash| chain.has_block(hash))
            };
            match result {
                Ok(actions) => ctx.dispatch(actions, Some(addr)).await,
                Err(err) => {
                    warn!(%addr, error = %err, "bad headers");
                    if machine.punish(Offense::InvalidPoW) {
                        ctx.ban(&addr).await;
                        machine.begin_close();
                    }
                }
            }
        }

        Message::Block(block) => {
            let hash = block.header.hash();
            let item = InvItem::block(hash);
            // Announced via a prior INV (or requested during IBD)?
            let announced = machine.knows_inventory(&item);
            machine.record_inventory(item);

            let now = chrono::Utc::now().timestamp();
            let sync_result = {
                let mut sync = ctx.sync.lock().await;
                sync.on_block(addr, block, now)
            };
            match sync_result {
                Ok(actions) => {
                    // Body requested during IBD: connect via the sync path.
                    ctx.dispatch(actions, Some(addr)).await;
                }
                Err(_) => {
                    // Steady-state relay. A body nobody announced still gets
                    // processed (a useful block is a useful block) but
                    // scores against the sender.
                    if !announced && machine.punish(Offense::UnsolicitedBlock) {
                        ctx.ban(&addr).await;
                        machine.begin_close();
                        return Ok(());
                    }
                    match ctx.chain.process_block(block) {
                        Ok(_) => {
                            ctx.sync.lock().await.set_local_height(ctx.chain.tip().0);
                            ctx.relay_inventory(InvItem::block(hash), Some(addr)).await;
                        }
                        Err(err) => {
                            debug!(%addr, %hash, error = %err, "relayed block rejected");
                            // Racing relays produce duplicates and orphans;
                            // only an invalid block is misbehavior.
                            let benign = matches!(
                                err,
                                carbon_core::error::ChainError::ChainState(
                                    carbon_core::error::ChainStateError::DuplicateBlock(_)
                                        | carbon_core::error::ChainStateError::UnknownParent(_),
                                ),
                            );
                            if !benign && machine.punish(Offense::InvalidPoW) {
                                ctx.ban(&addr).await;
                                machine.begin_close();
                            }
                        }
                    }
                }
            }
        }

        Message::Tx(tx) => {
            let txid = tx.txid();
            machine.record_inventory(InvItem::tx(txid));
            match ctx.chain.submit_transaction((**tx).clone()) {
                Ok(_) => {
                    ctx.relay_inventory(InvItem::tx(txid), Some(addr)).await;
                }
                // Racing relays: already pooled or conflicting, no offense.
                Err(MempoolError::AlreadyExists(_)) => {}
                Err(err) => {
                    let code = err.reject_code();
                    debug!(%addr, %txid, error = %err, "transaction rejected");
                    send(
                        framed,
                        Message::Reject {
                            message: "tx".into(),
                            code,
                            reason: err.to_string(),
                        },
                    )
                    .await?;
                    // Only a transaction that fails validation outright is
                    // misbehavior; conflicts and a full pool are not.
                    let offense = match &err {
                        MempoolError::Rejected(
                            carbon_core::error::TransactionError::InvalidSignature { .. },
                        ) => Some(Offense::InvalidSignature),
                        MempoolError::Rejected(_) => Some(Offense::InvalidMessage),
                        _ => None,
                    };
                    if let Some(offense) = offense {
                        if machine.punish(offense) {
                            ctx.ban(&addr).await;
                            machine.begin_close();
                        }
                    }
                }
            }
        }

        Message::Mempool => {
            let items: Vec<InvItem> = ctx
                .chain
                .mempool_txids()
                .into_iter()
                .map(InvItem::tx)
                .collect();
            if !items.is_empty() {
                send(framed, Message::Inv(items)).await?;
            }
        }

        Message::Reject { message, code, reason } => {
            debug!(%addr, message = %message, code = *code, reason = %reason, "peer rejected our data");
        }

        // Handshake and liveness messages were handled by the state machine.
        Message::Version(_) | Message::Verack | Message::Ping(_) | Message::Pong(_) => {}
    }
    Ok(())
}
