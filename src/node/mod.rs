//! The node: drives gossip with random peers, answers their requests and hands
//! consensus transactions to the application.
//!
//! ```text
//!            SyncLimit in a sync response
//! Babbling ─────────────────────────────▶ CatchingUp
//!    ▲                                        │
//!    └────────── successful fast-forward ─────┘
//!
//! any state ── shutdown() ──▶ Shutdown (terminal)
//! ```
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::algorithm::datastructure::KnownEvents;
use crate::algorithm::event::{self, SignedEvent};
use crate::algorithm::{Ed25519Signer, PushError, RoundNum, Signer};
use crate::config::{Config, ConfigError, Participant};
use crate::net::{
    EagerSyncRequest, EagerSyncResponse, FastForwardRequest, FastForwardResponse, Request,
    Response, RpcHandler, SyncRequest, SyncResponse, Transport, TransportError,
};
use crate::proxy::{AppProxy, ProxyError};
use crate::{PeerId, Roster, Transaction};

mod core_state;

pub use self::core_state::Core;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    InvalidEvent(#[from] PushError),
    #[error("Peer sent events that cannot be inserted: {0}")]
    ProtocolViolation(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Node is shutting down")]
    ShutdownInProgress,
    #[error("Invalid roster: {0}")]
    InvalidRoster(String),
    #[error("Invalid fast-forward snapshot: {0}")]
    InvalidSnapshot(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Babbling,
    CatchingUp,
    Shutdown,
}

/// Snapshot of the node progress
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub state: NodeState,
    pub last_decided_round: Option<RoundNum>,
    pub consensus_events: usize,
    pub events: usize,
    pub pool_size: usize,
    pub known: KnownEvents,
}

pub struct Node {
    id: PeerId,
    local_addr: String,
    config: Config,
    roster: Roster,
    core: Mutex<Core>,
    state: Mutex<NodeState>,
    transport: Arc<dyn Transport>,
    proxy: Arc<dyn AppProxy>,
    shutdown: CancellationToken,
}

impl Node {
    pub fn new(
        config: Config,
        signer: Ed25519Signer,
        roster: Roster,
        transport: Arc<dyn Transport>,
        proxy: Arc<dyn AppProxy>,
    ) -> Result<Arc<Self>, NodeError> {
        config.validate()?;
        let id = signer.identity();
        if roster.get(&id).is_none() {
            return Err(NodeError::InvalidRoster(format!(
                "own id {} is not listed",
                id
            )));
        }
        let core = Core::new(signer, &roster, config.coin_frequency, config.pool_capacity)?;
        Ok(Arc::new(Self {
            id,
            local_addr: transport.local_addr(),
            config,
            roster,
            core: Mutex::new(core),
            state: Mutex::new(NodeState::Babbling),
            transport,
            proxy,
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    fn set_state(&self, new_state: NodeState) {
        let mut state = self.state.lock();
        // nothing leaves shutdown
        if *state != NodeState::Shutdown && *state != new_state {
            debug!("{:?} -> {:?}", *state, new_state);
            *state = new_state;
        }
    }

    fn ensure_running(&self) -> Result<(), NodeError> {
        match self.state() {
            NodeState::Shutdown => Err(NodeError::ShutdownInProgress),
            _ => Ok(()),
        }
    }

    pub fn stats(&self) -> NodeStats {
        let state = self.state();
        let core = self.core.lock();
        NodeStats {
            state,
            last_decided_round: core.last_decided_round(),
            consensus_events: core.graph().consensus_len(),
            events: core.graph().event_count(),
            pool_size: core.pool_size(),
            known: core.known(),
        }
    }

    pub fn known(&self) -> KnownEvents {
        self.core.lock().known()
    }

    /// Events the holder of `known` misses, topologically sorted
    pub fn diff(&self, known: &KnownEvents) -> Vec<SignedEvent> {
        self.core.lock().diff(known)
    }

    /// Kept part of the consensus order. After a fast-forward the order
    /// starts at [`Self::consensus_window`]'s offset.
    pub fn consensus_events(&self) -> Vec<event::Hash> {
        self.core.lock().graph().consensus_events().to_vec()
    }

    /// Position of the first kept consensus event and the kept events
    pub fn consensus_window(&self) -> (usize, Vec<event::Hash>) {
        let core = self.core.lock();
        let graph = core.graph();
        (graph.consensus_offset(), graph.consensus_events().to_vec())
    }

    pub fn last_decided_round(&self) -> Option<RoundNum> {
        self.core.lock().last_decided_round()
    }

    /// Transactions of the latest own event
    pub fn head_transactions(&self) -> Vec<Transaction> {
        self.core
            .lock()
            .head()
            .map(|e| e.transactions().to_vec())
            .unwrap_or_default()
    }

    /// Queue a transaction for the next own event
    pub fn submit_transaction(&self, tx: Transaction) -> Result<(), NodeError> {
        self.ensure_running()?;
        self.core.lock().add_transaction(tx);
        Ok(())
    }

    // ============================================================================
    // LIFECYCLE
    // ============================================================================

    /// Start answering requests of other nodes
    pub async fn listen(self: &Arc<Self>) -> Result<(), NodeError> {
        self.ensure_running()?;
        let handler: Arc<dyn RpcHandler> = self.clone();
        self.transport.listen(handler).await?;
        info!("Node {:?} listening on {}", self.id, self.local_addr);
        Ok(())
    }

    /// Main loop, returns after [`Self::shutdown`]. Without `gossip` the node
    /// only collects submitted transactions and answers requests.
    #[instrument(level = "info", skip(self), fields(id = ?self.id))]
    pub async fn run(self: Arc<Self>, gossip: bool) {
        let mut submissions = self.proxy.take_submit_receiver();
        let mut heartbeat = tokio::time::interval(self.config.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Run loop stopped");
                    break;
                }
                tx = next_submission(&mut submissions) => match tx {
                    Some(tx) => self.core.lock().add_transaction(tx),
                    None => submissions = None,
                },
                _ = heartbeat.tick(), if gossip => self.tick().await,
            }
        }
    }

    /// Spawn [`Self::run`] after [`Self::listen`]
    pub async fn start(
        self: &Arc<Self>,
        gossip: bool,
    ) -> Result<tokio::task::JoinHandle<()>, NodeError> {
        self.listen().await?;
        Ok(tokio::spawn(self.clone().run(gossip)))
    }

    /// Stop gossip and close the transport, failing in-flight requests.
    /// Idempotent.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if *state == NodeState::Shutdown {
                return;
            }
            *state = NodeState::Shutdown;
        }
        info!("Shutting down node {:?}", self.id);
        self.shutdown.cancel();
        self.transport.close().await;
    }

    async fn tick(&self) {
        match self.state() {
            NodeState::Babbling => match self.random_peer() {
                Some(peer) => {
                    if let Err(e) = self.gossip(&peer).await {
                        debug!("Gossip with {} failed: {}", peer.net_addr, e);
                    }
                }
                None => self.babble_alone(),
            },
            NodeState::CatchingUp => {
                if let Err(e) = self.fast_forward().await {
                    warn!("Fast-forward failed: {}", e);
                }
            }
            NodeState::Shutdown => {}
        }
    }

    fn random_peer(&self) -> Option<Participant> {
        let peers: Vec<&Participant> = self
            .roster
            .participants()
            .iter()
            .filter(|p| p.id != self.id)
            .collect();
        peers.choose(&mut rand::thread_rng()).map(|p| (*p).clone())
    }

    /// Single participant roster: nobody to gossip with, consensus is local
    fn babble_alone(&self) {
        let mut core = self.core.lock();
        if !core.wants_self_event(0) {
            return;
        }
        if let Err(e) = core.create_self_event(None) {
            warn!("Failed to create event: {}", e);
        }
        core.commit(self.proxy.as_ref());
    }

    // ============================================================================
    // OUTGOING SYNC
    // ============================================================================

    /// Gossip with the participant `peer`: pull what it knows, record the sync
    /// in a new own event and push back what it misses.
    pub async fn gossip_with(&self, peer: &PeerId) -> Result<(), NodeError> {
        let participant = self
            .roster
            .get(peer)
            .cloned()
            .ok_or_else(|| NodeError::InvalidRoster(format!("{} is not a participant", peer)))?;
        self.gossip(&participant).await
    }

    #[instrument(level = "debug", skip_all, fields(peer = %peer.net_addr))]
    async fn gossip(&self, peer: &Participant) -> Result<(), NodeError> {
        self.ensure_running()?;
        let request = SyncRequest {
            from: self.local_addr.clone(),
            known: self.core.lock().sync_known(),
        };
        let response = self.transport.sync(&peer.net_addr, request).await?;
        if response.sync_limit {
            info!("{} reports we are too far behind", peer.net_addr);
            self.set_state(NodeState::CatchingUp);
            return Ok(());
        }

        let push = {
            let mut core = self.core.lock();
            if self.state() == NodeState::Shutdown {
                return Err(NodeError::ShutdownInProgress);
            }
            let inserted = core.insert_events(response.events)?;
            trace!("Inserted {} events from {}", inserted, peer.net_addr);
            if inserted > 0 {
                core.forget_resync();
            }
            if core.wants_self_event(inserted) {
                let other_head = core.graph().peer_latest_event(&peer.id).cloned();
                core.create_self_event(other_head)?;
            }
            core.commit(self.proxy.as_ref());
            core.diff(&response.known)
        };

        if !push.is_empty() {
            let request = EagerSyncRequest {
                from: self.local_addr.clone(),
                events: push,
            };
            let response = self.transport.eager_sync(&peer.net_addr, request).await?;
            if !response.success {
                debug!("{} did not accept pushed events", peer.net_addr);
            }
        }
        Ok(())
    }

    /// Replace local state with a snapshot of a random peer.
    ///
    /// The peer must hold all our own events, otherwise they are pushed to it
    /// first and the attempt fails, to be repeated on the next tick. The
    /// snapshot is checked and loaded while the core keeps serving requests.
    pub async fn fast_forward(&self) -> Result<(), NodeError> {
        self.ensure_running()?;
        let peer = self
            .random_peer()
            .ok_or_else(|| NodeError::InvalidRoster("no peers to fast-forward from".to_owned()))?;
        info!("Fast-forwarding from {}", peer.net_addr);
        let (loader, delivered, own_index) = {
            let core = self.core.lock();
            (
                core.frame_loader(),
                core.delivered() as u64,
                core.known().get(&self.id),
            )
        };
        let response = self
            .transport
            .fast_forward(
                &peer.net_addr,
                FastForwardRequest {
                    from: self.local_addr.clone(),
                    delivered,
                },
            )
            .await?;
        if response.from_id != peer.id {
            return Err(NodeError::InvalidSnapshot(format!(
                "expected snapshot of {}, got {}",
                peer.id, response.from_id
            )));
        }
        if response.known.get(&self.id) < own_index {
            let push = self.diff(&response.known);
            debug!(
                "{} misses our events, pushing {} events before fast-forward",
                peer.net_addr,
                push.len()
            );
            let request = EagerSyncRequest {
                from: self.local_addr.clone(),
                events: push,
            };
            self.transport.eager_sync(&peer.net_addr, request).await?;
            return Err(NodeError::InvalidSnapshot(format!(
                "snapshot of {} misses our own events",
                peer.net_addr
            )));
        }

        let FastForwardResponse {
            from_id,
            frame,
            signature,
            ..
        } = response;
        let loaded = tokio::task::spawn_blocking(move || loader.load(frame, &from_id, &signature))
            .await
            .map_err(|e| NodeError::InvalidSnapshot(format!("loading failed: {}", e)))??;
        {
            let mut core = self.core.lock();
            if self.state() == NodeState::Shutdown {
                return Err(NodeError::ShutdownInProgress);
            }
            if loaded.round() <= core.last_decided_round() {
                // refused for another reason than lagging consensus
                info!("Snapshot of {} is not ahead of us, resuming gossip", peer.net_addr);
            } else {
                core.install(loaded, self.proxy.as_ref())?;
            }
        }
        self.set_state(NodeState::Babbling);
        Ok(())
    }

    // ============================================================================
    // INCOMING REQUESTS
    // ============================================================================

    fn process_sync_request(&self, request: SyncRequest) -> SyncResponse {
        let core = self.core.lock();
        let known = core.known();
        let lead = known.max_lead_over(&request.known);
        // events below what we hold cannot be sent either
        let sync_limit = lead > self.config.sync_limit || !core.graph().can_serve(&request.known);
        let events = if sync_limit {
            debug!("{} lags {} events behind, refusing to sync", request.from, lead);
            vec![]
        } else {
            core.diff(&request.known)
        };
        SyncResponse {
            from: self.local_addr.clone(),
            events,
            known,
            sync_limit,
        }
    }

    fn process_eager_sync_request(&self, request: EagerSyncRequest) -> EagerSyncResponse {
        let mut core = self.core.lock();
        let success = match core.insert_events(request.events) {
            Ok(_) => true,
            Err(e) => {
                warn!("Events pushed by {} rejected: {}", request.from, e);
                false
            }
        };
        core.commit(self.proxy.as_ref());
        EagerSyncResponse {
            from: self.local_addr.clone(),
            success,
        }
    }

    fn process_fast_forward_request(
        &self,
        request: FastForwardRequest,
    ) -> Result<FastForwardResponse, NodeError> {
        let core = self.core.lock();
        let (frame, signature) = core.frame(request.delivered)?.ok_or_else(|| {
            NodeError::InvalidSnapshot("no round decided yet".to_owned())
        })?;
        debug!(
            "Sending snapshot of round {} to {}",
            frame.round(),
            request.from
        );
        Ok(FastForwardResponse {
            from: self.local_addr.clone(),
            from_id: self.id,
            frame,
            known: core.known(),
            signature,
        })
    }
}

#[async_trait]
impl RpcHandler for Node {
    async fn handle(&self, request: Request) -> Response {
        if let Err(e) = self.ensure_running() {
            return Response::Error(e.to_string());
        }
        match request {
            Request::Sync(r) => Response::Sync(self.process_sync_request(r)),
            Request::EagerSync(r) => Response::EagerSync(self.process_eager_sync_request(r)),
            Request::FastForward(r) => match self.process_fast_forward_request(r) {
                Ok(response) => Response::FastForward(response),
                Err(e) => Response::Error(e.to_string()),
            },
        }
    }
}

async fn next_submission(
    submissions: &mut Option<mpsc::UnboundedReceiver<Transaction>>,
) -> Option<Transaction> {
    match submissions {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}
