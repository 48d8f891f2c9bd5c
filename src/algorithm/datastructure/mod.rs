use tracing::{debug, instrument, trace, warn};

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use self::ordering::OrderedEvents;
use self::peer_index::{PeerIndex, PeerIndexEntry};
use super::event::{self, AncestorCoordinate, Event, EventBody, Parents, SignedEvent};
use super::{Clock, PushError, RoundNum, Signer};
use crate::{PeerId, Transaction};

pub use self::peer_index::ForkDetected;
pub use self::snapshot::{Snapshot, SnapshotError, SnapshotEvent};
pub use self::sync::KnownEvents;

mod consensus;
mod ordering;
mod peer_index;
mod snapshot;
mod sync;

#[cfg(test)]
mod tests;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum WitnessFamousness {
    Yes,
    No,
    Undecided,
}

/// Vote of a witness on the fame of a witness from an earlier round.
#[derive(Debug, Clone, Copy)]
struct Vote {
    value: bool,
    /// Set if the vote is backed by a supermajority in a normal round, which
    /// finalizes the fame of the candidate.
    decision: Option<bool>,
}

#[derive(Default)]
struct RoundInfo {
    events: Vec<event::Hash>,
    /// Ordered map, so that iteration does not depend on insertion order
    witnesses: BTreeMap<event::Hash, WitnessFamousness>,
    /// `votes[voter][candidate]`, voters are witnesses of this round
    votes: HashMap<event::Hash, HashMap<event::Hash, Vote>>,
}

pub struct Graph<TSigner, TClock> {
    all_events: HashMap<event::Hash, Event>,
    peer_index: PeerIndex,
    /// Participants in canonical order; positions are used to index
    /// `last_ancestors` of events
    members: Vec<PeerId>,
    member_positions: HashMap<PeerId, usize>,
    rounds: Vec<RoundInfo>,
    /// Inserted events that were not assigned a round yet, in insertion order
    pending_rounds: VecDeque<event::Hash>,
    /// Events with round assigned but without round received, in insertion order
    pending_received: Vec<event::Hash>,
    /// The latest round known to have its fame decided. All previous rounds
    /// must be decided as well.
    ///
    /// If `None` - no rounds decided yet
    last_decided_round: Option<RoundNum>,
    ordering: OrderedEvents,
    detected_forks: Vec<ForkDetected>,
    strongly_see_cache: RefCell<HashMap<(event::Hash, event::Hash), bool>>,

    signer: TSigner,
    clock: TClock,
    /// Coin round frequency
    coin_frequency: u64,
}

impl<TSigner, TClock> Graph<TSigner, TClock>
where
    TSigner: Signer,
    TClock: Clock,
{
    /// Empty graph for the given participants. The signer identity is expected
    /// to be one of them to create events.
    pub fn new(
        signer: TSigner,
        clock: TClock,
        members: impl IntoIterator<Item = PeerId>,
        coin_frequency: u64,
    ) -> Self {
        let members: Vec<PeerId> = members
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let member_positions = members.iter().enumerate().map(|(i, p)| (*p, i)).collect();
        Self {
            all_events: HashMap::new(),
            peer_index: HashMap::new(),
            members,
            member_positions,
            rounds: vec![],
            pending_rounds: VecDeque::new(),
            pending_received: vec![],
            last_decided_round: None,
            ordering: OrderedEvents::new(),
            detected_forks: vec![],
            strongly_see_cache: RefCell::new(HashMap::new()),
            signer,
            clock,
            // round right after the voted one must not flip coins
            coin_frequency: coin_frequency.max(2),
        }
    }

    pub fn self_id(&self) -> PeerId {
        self.signer.identity()
    }

    /// Latest event created by this peer
    pub fn head(&self) -> Option<&event::Hash> {
        self.peer_latest_event(&self.signer.identity())
    }

    /// Create and push event to the graph, adding it at the end of own lane
    /// (i.e. the event becomes the latest one of this peer).
    #[instrument(level = "debug", skip(self, transactions))]
    pub fn create_event(
        &mut self,
        transactions: Vec<Transaction>,
        other_parent: Option<event::Hash>,
    ) -> Result<event::Hash, PushError> {
        let creator = self.signer.identity();
        let entry = self.peer_index.get(&creator);
        let self_parent = entry.and_then(|e| e.latest_event()).cloned();
        let index = entry
            .and_then(|e| e.latest_index())
            .map_or(0, |latest| latest + 1);
        let body = EventBody {
            transactions,
            parents: Parents {
                self_parent,
                other_parent,
            },
            creator,
            index,
            timestamp: self.clock.current_timestamp(),
        };
        let signer = &self.signer;
        let new_event = SignedEvent::new(body, |h| signer.sign(h))?;
        self.push_event(new_event)
    }

    /// Validate the event and add it to the graph. Consensus data is not updated
    /// until [`Self::process_known_events`] is called.
    ///
    /// An event from a known creator at an already occupied index is accepted
    /// and recorded as a fork.
    #[instrument(level = "trace", skip_all)]
    pub fn push_event(&mut self, new_event: SignedEvent) -> Result<event::Hash, PushError> {
        // Verification first, no changing state
        let hash = new_event.body().hash()?;
        trace!("Event hash: {}", hash);

        if self.all_events.contains_key(&hash) {
            return Err(PushError::EventAlreadyExists(hash));
        }

        let body = new_event.body();
        let creator = body.creator;
        let creator_position = *self
            .member_positions
            .get(&creator)
            .ok_or(PushError::UnknownCreator(creator))?;

        if !self
            .signer
            .verify(&hash, new_event.signature(), &creator)
        {
            debug!("Signature of {} does not match its creator", hash);
            return Err(PushError::InvalidSignature);
        }

        if let Some(entry) = self.peer_index.get(&creator) {
            if body.index < *entry.first_index() {
                return Err(PushError::BelowHeldHistory(body.index));
            }
        }

        let self_parent = match &body.parents.self_parent {
            Some(self_parent_hash) => {
                let self_parent = self
                    .all_events
                    .get(self_parent_hash)
                    .ok_or_else(|| PushError::NoParent(self_parent_hash.clone()))?;
                // self parent must have the same author by definition
                if self_parent.author() != &creator {
                    return Err(PushError::IncorrectAuthor(*self_parent.author(), creator));
                }
                if self_parent.index() + 1 != body.index {
                    return Err(PushError::IncorrectIndex(self_parent.index() + 1, body.index));
                }
                Some(self_parent)
            }
            None => {
                if body.index != 0 {
                    return Err(PushError::IncorrectIndex(0, body.index));
                }
                None
            }
        };
        let other_parent = match &body.parents.other_parent {
            Some(other_parent_hash) => Some(
                self.all_events
                    .get(other_parent_hash)
                    .ok_or_else(|| PushError::NoParent(other_parent_hash.clone()))?,
            ),
            None => None,
        };

        let (last_ancestors, forks_seen) = self.ancestry_of(
            creator_position,
            body.index,
            &hash,
            [self_parent, other_parent],
        );
        let index = body.index;

        // Insertion, should be valid at this point so that we don't leave in inconsistent state on error.
        trace!("The event is valid, updating state to include it");
        let fork = self
            .peer_index
            .entry(creator)
            .or_insert_with(PeerIndexEntry::new)
            .add_event(creator, index, hash.clone())
            .expect("Parent and duplicate checks guarantee a free spot in the index");
        if let Some(fork) = fork {
            warn!("{}", fork);
            self.detected_forks.push(fork);
        }

        let mut event = Event::new(new_event, hash.clone(), self.all_events.len());
        event.last_ancestors = last_ancestors;
        event.forks_seen = forks_seen;
        self.all_events.insert(hash.clone(), event);
        self.pending_rounds.push_back(hash.clone());
        Ok(hash)
    }

    /// Latest ancestor of each creator and creators whose forks are among the
    /// ancestors, for an event with the given position and parents.
    fn ancestry_of(
        &self,
        creator_position: usize,
        index: u64,
        hash: &event::Hash,
        parents: [Option<&Event>; 2],
    ) -> (Vec<Option<AncestorCoordinate>>, Vec<usize>) {
        let mut last_ancestors: Vec<Option<AncestorCoordinate>> = vec![None; self.members.len()];
        let mut forks_seen = BTreeSet::new();
        for parent in parents.into_iter().flatten() {
            forks_seen.extend(parent.forks_seen.iter().copied());
            for (position, theirs) in parent.last_ancestors.iter().enumerate() {
                let Some(theirs) = theirs else { continue };
                let merged = match &last_ancestors[position] {
                    None => theirs.clone(),
                    Some(ours) => {
                        if !self.on_same_chain(ours, theirs) {
                            forks_seen.insert(position);
                        }
                        if (theirs.index, &theirs.hash) > (ours.index, &ours.hash) {
                            theirs.clone()
                        } else {
                            ours.clone()
                        }
                    }
                };
                last_ancestors[position] = Some(merged);
            }
        }
        // anything of the creator at this index or above reached without the
        // new event is a different branch
        if let Some(known) = &last_ancestors[creator_position] {
            if known.index >= index {
                forks_seen.insert(creator_position);
            }
        }
        last_ancestors[creator_position] = Some(AncestorCoordinate {
            index,
            hash: hash.clone(),
        });
        (last_ancestors, forks_seen.into_iter().collect())
    }

    pub fn next_event(&mut self) -> Option<&Event> {
        let hash = self.ordering.next_event()?.clone();
        self.all_events.get(&hash)
    }
}

/// Synchronization-related stuff.
/// details in [sync]
impl<TSigner, TClock> Graph<TSigner, TClock> {
    /// 1st sync step - (at requester) describe what is already known.
    pub fn known_events(&self) -> KnownEvents {
        self.peer_index
            .iter()
            .filter_map(|(peer, entry)| entry.latest_index().map(|i| (*peer, i)))
            .collect()
    }

    /// 2nd sync step - (at responder) find all events the requester lacks, so that
    /// it gets to the same (or higher) level of graph knowledge as we have.
    ///
    /// For a forking creator the known index may refer to another branch, so
    /// everything from the first fork on is included.
    ///
    /// Result is sorted topologically, so it can be inserted one by one.
    pub fn events_unknown_to(&self, known: &KnownEvents) -> Vec<SignedEvent> {
        let mut unknown: Vec<&Event> = self
            .peer_index
            .iter()
            .flat_map(|(peer, entry)| {
                let mut first_unknown = known.get(peer).map_or(0, |i| i + 1);
                if let Some(fork) = entry.first_fork() {
                    first_unknown = first_unknown.min(*fork);
                }
                let first_unknown = first_unknown.max(*entry.first_index());
                let last = entry.latest_index().map_or(0, |i| i + 1);
                (first_unknown..last).flat_map(move |i| entry.events_at(i).iter())
            })
            .map(|hash| {
                self.all_events
                    .get(hash)
                    .expect("Indexed events must be tracked")
            })
            .collect();
        unknown.sort_by_key(|e| e.topological_index);
        unknown.into_iter().map(|e| e.to_wire()).collect()
    }

    /// False if the holder of `known` misses events older than what we keep,
    /// so that [`Self::events_unknown_to`] cannot bring it up to date.
    pub fn can_serve(&self, known: &KnownEvents) -> bool {
        self.peer_index.iter().all(|(peer, entry)| {
            let first_unknown = known.get(peer).map_or(0, |i| i + 1);
            match entry.latest_index() {
                Some(latest) if first_unknown <= latest => first_unknown >= *entry.first_index(),
                _ => true,
            }
        })
    }

    /// Lowest held index of the creator's events, 0 unless the store was
    /// bootstrapped from a snapshot
    pub fn first_index(&self, peer: &PeerId) -> u64 {
        self.peer_index
            .get(peer)
            .map_or(0, |entry| *entry.first_index())
    }
}

impl<TSigner, TClock> Graph<TSigner, TClock> {
    pub fn members(&self) -> &[PeerId] {
        &self.members
    }

    fn members_count(&self) -> usize {
        self.members.len()
    }

    /// More than two thirds of the participants
    fn is_supermajority(&self, count: usize) -> bool {
        3 * count > 2 * self.members_count()
    }

    pub fn event_count(&self) -> usize {
        self.all_events.len()
    }

    // for navigating the graph state externally
    pub fn event(&self, id: &event::Hash) -> Option<&Event> {
        self.all_events.get(id)
    }

    // for navigating the graph state externally
    pub fn peer_latest_event(&self, peer: &PeerId) -> Option<&event::Hash> {
        self.peer_index.get(peer).and_then(|e| e.latest_event())
    }

    pub fn forking_peers(&self) -> impl Iterator<Item = &PeerId> {
        self.peer_index
            .iter()
            .filter(|(_, entry)| *entry.forking())
            .map(|(peer, _)| peer)
    }

    pub fn detected_forks(&self) -> &[ForkDetected] {
        &self.detected_forks
    }

    pub fn round_of(&self, event_hash: &event::Hash) -> Option<RoundNum> {
        self.all_events.get(event_hash)?.round()
    }

    pub fn round_received_of(&self, event_hash: &event::Hash) -> Option<RoundNum> {
        self.all_events.get(event_hash)?.round_received()
    }

    /// `None` if the event is unknown or its round is not determined yet
    pub fn is_witness(&self, event_hash: &event::Hash) -> Option<bool> {
        let event = self.all_events.get(event_hash)?;
        event.round().map(|_| event.is_witness())
    }

    /// `None` if the event is not a witness (or unknown)
    pub fn fame_of(&self, event_hash: &event::Hash) -> Option<WitnessFamousness> {
        let round = self.round_of(event_hash)?;
        self.round_info(round)?.witnesses.get(event_hash).copied()
    }

    pub fn last_decided_round(&self) -> Option<RoundNum> {
        self.last_decided_round
    }

    /// Highest round containing any events
    pub fn last_round(&self) -> Option<RoundNum> {
        self.rounds.len().checked_sub(1).map(|r| r as RoundNum)
    }

    /// Events in consensus order. Only ever grows.
    ///
    /// In a store bootstrapped from a snapshot the first
    /// [`Self::consensus_offset`] events of the order are not kept.
    pub fn consensus_events(&self) -> &[event::Hash] {
        self.ordering.events()
    }

    /// Position of the first kept event in the overall consensus order
    pub fn consensus_offset(&self) -> usize {
        self.ordering.offset()
    }

    /// Length of the overall consensus order, kept or not
    pub fn consensus_len(&self) -> usize {
        self.ordering.offset() + self.ordering.events().len()
    }

    /// Transactions of every consensus event from position `from` of the
    /// overall order on, one batch per event. `None` if some are not kept.
    pub fn consensus_transactions(&self, from: usize) -> Option<Vec<Vec<Transaction>>> {
        let start = from.checked_sub(self.ordering.offset())?;
        let kept = self.ordering.events().get(start..).unwrap_or(&[]);
        Some(
            kept.iter()
                .map(|hash| {
                    self.all_events
                        .get(hash)
                        .expect("Ordered events are tracked")
                        .transactions()
                        .to_vec()
                })
                .collect(),
        )
    }

    /// True while some inserted event is not in the consensus order yet
    pub fn has_pending_events(&self) -> bool {
        !self.pending_rounds.is_empty() || !self.pending_received.is_empty()
    }

    fn round_info(&self, round: RoundNum) -> Option<&RoundInfo> {
        self.rounds.get(usize::try_from(round).ok()?)
    }

    fn position_of(&self, event: &Event) -> usize {
        *self
            .member_positions
            .get(event.author())
            .expect("Authors of known events are members")
    }

    fn on_same_chain(&self, a: &AncestorCoordinate, b: &AncestorCoordinate) -> bool {
        let (lower, higher) = if a.index <= b.index { (a, b) } else { (b, a) };
        self.self_ancestor_at(&higher.hash, lower.index) == Some(&lower.hash)
    }

    /// Self ancestor of `event_hash` (or itself) with the given index. `None`
    /// if the chain leaves the held events before reaching it.
    fn self_ancestor_at(&self, event_hash: &event::Hash, index: u64) -> Option<&event::Hash> {
        let event = self.all_events.get(event_hash)?;
        if event.index() < index {
            return None;
        }
        let entry = self.peer_index.get(event.author())?;
        // Common case, a creator without forks
        if !*entry.forking() {
            return entry.events_at(index).first();
        }
        let mut current = event;
        while current.index() > index {
            current = self.all_events.get(current.self_parent()?)?;
        }
        Some(current.hash())
    }

    /// True if `potential_ancestor` is `target` or one of its ancestors
    pub fn is_ancestor(&self, target: &event::Hash, potential_ancestor: &event::Hash) -> bool {
        if target == potential_ancestor {
            return self.all_events.contains_key(target);
        }
        let (Some(x), Some(y)) = (
            self.all_events.get(target),
            self.all_events.get(potential_ancestor),
        ) else {
            return false;
        };
        match &x.last_ancestors[self.position_of(y)] {
            Some(coordinate) if coordinate.index >= y.index() => {
                self.self_ancestor_at(&coordinate.hash, y.index()) == Some(potential_ancestor)
            }
            _ => false,
        }
    }

    /// True if target(y) is an ancestor of observer(x), but no fork of target's
    /// creator is an ancestor of observer.
    pub fn see(&self, observer: &event::Hash, target: &event::Hash) -> bool {
        let (Some(x), Some(y)) = (self.all_events.get(observer), self.all_events.get(target))
        else {
            return false;
        };
        !x.forks_seen.contains(&self.position_of(y)) && self.is_ancestor(observer, target)
    }

    /// True if observer sees target through events created by a supermajority of
    /// participants.
    pub fn strongly_see(&self, observer: &event::Hash, target: &event::Hash) -> bool {
        let key = (observer.clone(), target.clone());
        if let Some(cached) = self.strongly_see_cache.borrow().get(&key) {
            return *cached;
        }
        let result = self.calculate_strongly_see(observer, target);
        // only elections of undecided rounds ask again
        if self.round_of(target) > self.last_decided_round {
            self.strongly_see_cache.borrow_mut().insert(key, result);
        }
        result
    }

    fn calculate_strongly_see(&self, observer: &event::Hash, target: &event::Hash) -> bool {
        if !self.see(observer, target) {
            return false;
        }
        let x = self
            .all_events
            .get(observer)
            .expect("`see` is false for unknown events");
        // The latest event of each creator seen by the observer is the one
        // most likely to see the target
        let intermediate_creators = x
            .last_ancestors
            .iter()
            .enumerate()
            .filter(|(position, _)| !x.forks_seen.contains(position))
            .filter_map(|(_, coordinate)| coordinate.as_ref())
            .filter(|coordinate| self.is_ancestor(&coordinate.hash, target))
            .count();
        self.is_supermajority(intermediate_creators)
    }
}
