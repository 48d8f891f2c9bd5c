//! State shared between the gossip loop and inbound requests: the hashgraph,
//! the transaction pool and the delivery cursor. Always used under one lock.
use std::collections::{HashMap, VecDeque};

use tracing::{debug, info, instrument, trace, warn};

use super::NodeError;
use crate::algorithm::datastructure::{Graph, KnownEvents};
use crate::algorithm::event::{self, SignedEvent};
use crate::algorithm::{Ed25519Signer, PushError, RoundNum, Signer, SystemClock};
use crate::net::Frame;
use crate::proxy::AppProxy;
use crate::{PeerId, Roster, Transaction};

pub type NodeGraph = Graph<Ed25519Signer, SystemClock>;

pub struct Core {
    graph: NodeGraph,
    signer: Ed25519Signer,
    members: Vec<PeerId>,
    coin_frequency: u64,
    pool: VecDeque<Transaction>,
    /// Number of consensus events handed to the application, counted over
    /// the whole order
    delivered: usize,
    /// Creators with a fork branch we could not insert, with how far back
    /// to ask for their events on the next pull
    resync: HashMap<PeerId, u64>,
}

impl Core {
    /// Fresh store holding only our genesis event
    pub fn new(
        signer: Ed25519Signer,
        roster: &Roster,
        coin_frequency: u64,
        pool_capacity: usize,
    ) -> Result<Self, NodeError> {
        let members: Vec<PeerId> = roster.ids().collect();
        let mut graph = Graph::new(
            signer.clone(),
            SystemClock,
            members.iter().copied(),
            coin_frequency,
        );
        graph.create_event(vec![], None)?;
        Ok(Self {
            graph,
            signer,
            members,
            coin_frequency,
            pool: VecDeque::with_capacity(pool_capacity),
            delivered: 0,
            resync: HashMap::new(),
        })
    }

    pub fn id(&self) -> PeerId {
        self.signer.identity()
    }

    pub fn graph(&self) -> &NodeGraph {
        &self.graph
    }

    pub fn add_transaction(&mut self, tx: Transaction) {
        self.pool.push_back(tx);
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    pub fn delivered(&self) -> usize {
        self.delivered
    }

    pub fn known(&self) -> KnownEvents {
        self.graph.known_events()
    }

    /// Known vector for pull requests. For creators in `resync` it claims
    /// less than we hold, so that the peer resends the missing fork branch.
    pub fn sync_known(&self) -> KnownEvents {
        let mut known = self.graph.known_events();
        for (peer, distance) in &self.resync {
            if let Some(held) = known.get(peer) {
                let from = held
                    .saturating_sub(*distance)
                    .max(self.graph.first_index(peer));
                known.forget_from(peer, from);
            }
        }
        known
    }

    pub fn forget_resync(&mut self) {
        self.resync.clear();
    }

    pub fn diff(&self, known: &KnownEvents) -> Vec<SignedEvent> {
        self.graph.events_unknown_to(known)
    }

    /// Latest event of this node
    pub fn head(&self) -> Option<&event::Event> {
        self.graph.head().and_then(|h| self.graph.event(h))
    }

    /// Insert events received from a peer in the given order.
    ///
    /// Invalid events are skipped, except for a missing parent: the batch was
    /// supposed to be topologically complete, so the rest of it is dropped.
    /// Returns the number of inserted events.
    #[instrument(level = "debug", skip_all, fields(events = events.len()))]
    pub fn insert_events(&mut self, events: Vec<SignedEvent>) -> Result<usize, NodeError> {
        let mut inserted = 0;
        for event in events {
            let creator = event.body().creator;
            let index = event.body().index;
            let self_parent = event.body().parents.self_parent.clone();
            match self.graph.push_event(event) {
                Ok(_) => inserted += 1,
                Err(PushError::EventAlreadyExists(hash)) => {
                    trace!("Already have {}", hash);
                }
                Err(PushError::NoParent(parent)) => {
                    let parent_index = index.checked_sub(1);
                    if self_parent.as_ref() == Some(&parent)
                        && parent_index.map_or(false, |i| self.holds_index(&creator, i))
                    {
                        self.note_fork_branch(creator);
                    }
                    return Err(NodeError::ProtocolViolation(format!(
                        "event references unknown parent {} after inserting {} events",
                        parent, inserted
                    )));
                }
                Err(e) => warn!("Skipping invalid event: {}", e),
            }
        }
        Ok(inserted)
    }

    fn holds_index(&self, creator: &PeerId, index: u64) -> bool {
        self.graph
            .known_events()
            .get(creator)
            .map_or(false, |held| held >= index)
    }

    /// Another event of the creator sits where the missing self parent
    /// should be, so the peer has a branch we do not. Each failed attempt
    /// asks further back.
    fn note_fork_branch(&mut self, creator: PeerId) {
        let distance = self
            .resync
            .get(&creator)
            .map_or(1, |distance| distance.saturating_mul(2));
        info!(
            "Missing a fork branch of {:?}, asking {} events back",
            creator, distance
        );
        self.resync.insert(creator, distance);
    }

    /// A self event is due when there is something to record or consensus
    /// still has events to order.
    pub fn wants_self_event(&self, inserted: usize) -> bool {
        inserted > 0 || !self.pool.is_empty() || self.graph.has_pending_events()
    }

    /// Create a self event with everything from the pool.
    pub fn create_self_event(
        &mut self,
        other_parent: Option<event::Hash>,
    ) -> Result<event::Hash, NodeError> {
        let transactions: Vec<Transaction> = self.pool.drain(..).collect();
        let count = transactions.len();
        match self.graph.create_event(transactions, other_parent) {
            Ok(hash) => {
                debug!("Created event {} with {} transactions", hash, count);
                Ok(hash)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run consensus and hand transactions of newly ordered events to the
    /// application, one batch per event. Returns the number of events
    /// delivered.
    pub fn commit(&mut self, proxy: &dyn AppProxy) -> usize {
        self.graph.process_known_events();
        let mut delivered = 0;
        while let Some(event) = self.graph.next_event() {
            let batch = event.transactions().to_vec();
            delivered += 1;
            if let Err(e) = proxy.commit_batch(batch) {
                warn!("Failed to commit transactions of {}: {}", event.hash(), e);
            }
        }
        self.delivered += delivered;
        delivered
    }

    // ============================================================================
    // FAST FORWARD
    // ============================================================================

    /// Snapshot of our consensus state, signed by us, together with the
    /// transactions the requester has not delivered past `delivered`.
    /// `None` while no round is decided.
    pub fn frame(&self, delivered: u64) -> Result<Option<(Frame, event::Signature)>, NodeError> {
        let Some(snapshot) = self.graph.snapshot() else {
            return Ok(None);
        };
        let missed = usize::try_from(delivered)
            .ok()
            .filter(|from| *from <= self.graph.consensus_len())
            .and_then(|from| self.graph.consensus_transactions(from))
            .ok_or_else(|| {
                NodeError::InvalidSnapshot(format!(
                    "transactions from consensus position {} are not available",
                    delivered
                ))
            })?;
        let frame = Frame {
            snapshot,
            missed_from: delivered,
            missed,
        };
        let digest = frame
            .digest()
            .map_err(|e| NodeError::InvalidSnapshot(e.to_string()))?;
        let signature = self.signer.sign(&digest);
        Ok(Some((frame, signature)))
    }

    pub fn frame_loader(&self) -> FrameLoader {
        FrameLoader {
            signer: self.signer.clone(),
            members: self.members.clone(),
            coin_frequency: self.coin_frequency,
        }
    }

    /// Replace the store with one loaded from a frame and deliver what the
    /// frame says we missed. Nothing changes if the frame does not fit.
    #[instrument(level = "debug", skip_all)]
    pub fn install(&mut self, loaded: LoadedFrame, proxy: &dyn AppProxy) -> Result<usize, NodeError> {
        let LoadedFrame {
            graph,
            missed_from,
            missed,
        } = loaded;
        if graph.last_decided_round() <= self.graph.last_decided_round() {
            return Err(NodeError::InvalidSnapshot(format!(
                "frame of round {:?} is not ahead of round {:?}",
                graph.last_decided_round(),
                self.graph.last_decided_round()
            )));
        }
        let skip = (self.delivered as u64)
            .checked_sub(missed_from)
            .and_then(|skip| usize::try_from(skip).ok())
            .filter(|skip| *skip <= missed.len())
            .ok_or_else(|| {
                NodeError::InvalidSnapshot(format!(
                    "frame resumes at consensus position {}, {} events are delivered",
                    missed_from, self.delivered
                ))
            })?;

        let mut delivered = 0;
        for batch in missed.into_iter().skip(skip) {
            delivered += 1;
            if let Err(e) = proxy.commit_batch(batch) {
                warn!("Failed to commit missed transactions: {}", e);
            }
        }
        self.delivered = graph.consensus_offset();
        self.graph = graph;
        self.resync.clear();
        info!(
            "Fast-forwarded to round {:?} with {} events",
            self.graph.last_decided_round(),
            self.graph.event_count()
        );
        Ok(delivered + self.commit(proxy))
    }

    pub fn last_decided_round(&self) -> Option<RoundNum> {
        self.graph.last_decided_round()
    }
}

/// Checks and rebuilds frames without access to the core, so that the work
/// can happen while the core keeps serving requests.
#[derive(Clone)]
pub struct FrameLoader {
    signer: Ed25519Signer,
    members: Vec<PeerId>,
    coin_frequency: u64,
}

/// Store rebuilt from a frame, ready for [`Core::install`]
pub struct LoadedFrame {
    graph: NodeGraph,
    missed_from: u64,
    missed: Vec<Vec<Transaction>>,
}

impl LoadedFrame {
    pub fn round(&self) -> Option<RoundNum> {
        self.graph.last_decided_round()
    }
}

impl FrameLoader {
    /// Check that `signature` of `signer_id` covers the frame
    pub fn verify(
        &self,
        frame: &Frame,
        signer_id: &PeerId,
        signature: &event::Signature,
    ) -> Result<(), NodeError> {
        if !self.members.contains(signer_id) {
            return Err(NodeError::InvalidSnapshot(format!(
                "{} is not a participant",
                signer_id
            )));
        }
        let digest = frame
            .digest()
            .map_err(|e| NodeError::InvalidSnapshot(e.to_string()))?;
        if !self.signer.verify(&digest, signature, signer_id) {
            return Err(NodeError::InvalidSnapshot("bad signature".to_owned()));
        }
        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(round = frame.round()))]
    pub fn load(
        &self,
        frame: Frame,
        signer_id: &PeerId,
        signature: &event::Signature,
    ) -> Result<LoadedFrame, NodeError> {
        self.verify(&frame, signer_id, signature)?;
        let Frame {
            snapshot,
            missed_from,
            missed,
        } = frame;
        if missed_from.checked_add(missed.len() as u64) != Some(snapshot.consensus_len) {
            return Err(NodeError::InvalidSnapshot(format!(
                "{} missed events from position {} do not end at {}",
                missed.len(),
                missed_from,
                snapshot.consensus_len
            )));
        }
        let graph = Graph::from_snapshot(
            self.signer.clone(),
            SystemClock,
            self.members.iter().copied(),
            self.coin_frequency,
            snapshot,
        )
        .map_err(|e| NodeError::InvalidSnapshot(e.to_string()))?;
        debug!("Loaded {} events", graph.event_count());
        Ok(LoadedFrame {
            graph,
            missed_from,
            missed,
        })
    }
}
