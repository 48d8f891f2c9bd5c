//! Consensus state from around the last decided round on, enough for another
//! store to continue consensus without the older history.
//!
//! A snapshot holds every event of the first round still relevant for
//! ordering (the last decided one, or an earlier one if some of its events
//! are not ordered yet) and above, together with the latest event of each
//! creator. Events whose parents are left out become roots of the new store;
//! the consensus data it cannot derive for them travels along.
use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use super::ordering::OrderedEvents;
use super::peer_index::PeerIndexEntry;
use super::{Graph, WitnessFamousness};
use crate::algorithm::event::{self, Event, SignedEvent};
use crate::algorithm::{Clock, PushError, RoundNum, Signer};
use crate::{PeerId, Timestamp};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SnapshotEvent {
    pub event: SignedEvent,
    pub round: RoundNum,
    pub witness: bool,
    /// Fame of a witness, once decided
    pub famous: Option<bool>,
    /// Round received and consensus timestamp, once ordered
    pub received: Option<(RoundNum, Timestamp)>,
    /// Creators with a fork among the ancestors
    pub forks_seen: Vec<PeerId>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Snapshot {
    /// Last decided round
    pub round: RoundNum,
    /// Length of the consensus order up to and including `round`
    pub consensus_len: u64,
    /// Topologically sorted
    pub events: Vec<SnapshotEvent>,
}

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error(transparent)]
    InvalidEvent(#[from] PushError),
    #[error("Inconsistent snapshot: {0}")]
    Inconsistent(String),
}

impl<TSigner, TClock> Graph<TSigner, TClock> {
    /// `None` while no round is decided
    pub fn snapshot(&self) -> Option<Snapshot> {
        let round = self.last_decided_round?;
        let base = self
            .pending_received
            .iter()
            .filter_map(|hash| self.round_of(hash))
            .fold(round, RoundNum::min);

        let mut included: HashSet<&event::Hash> = self
            .all_events
            .values()
            .filter(|e| e.round().map_or(false, |r| r >= base))
            .map(|e| e.hash())
            .collect();
        included.extend(
            self.peer_index
                .values()
                .filter_map(PeerIndexEntry::latest_event)
                .filter(|hash| self.round_of(hash).is_some()),
        );
        let mut events: Vec<&Event> = included
            .into_iter()
            .map(|hash| self.all_events.get(hash).expect("Included events are tracked"))
            .collect();
        events.sort_by_key(|e| e.topological_index);

        let events = events
            .into_iter()
            .map(|e| SnapshotEvent {
                event: e.to_wire(),
                round: e.round().expect("Only events with rounds are included"),
                witness: e.is_witness(),
                famous: match self.fame_of(e.hash()) {
                    Some(WitnessFamousness::Yes) => Some(true),
                    Some(WitnessFamousness::No) => Some(false),
                    _ => None,
                },
                received: e.round_received().zip(e.consensus_timestamp()),
                forks_seen: e.forks_seen.iter().map(|p| self.members[*p]).collect(),
            })
            .collect::<Vec<_>>();
        debug!(
            "Snapshot of round {} from round {} on holds {} events",
            round,
            base,
            events.len()
        );
        Some(Snapshot {
            round,
            consensus_len: self.consensus_len() as u64,
            events,
        })
    }
}

impl<TSigner, TClock> Graph<TSigner, TClock>
where
    TSigner: Signer,
    TClock: Clock,
{
    /// Store continuing from `snapshot`. Its consensus order resumes right
    /// after the snapshot round.
    #[instrument(level = "debug", skip_all, fields(round = snapshot.round))]
    pub fn from_snapshot(
        signer: TSigner,
        clock: TClock,
        members: impl IntoIterator<Item = PeerId>,
        coin_frequency: u64,
        snapshot: Snapshot,
    ) -> Result<Self, SnapshotError> {
        let mut graph = Self::new(signer, clock, members, coin_frequency);
        let consensus_len = usize::try_from(snapshot.consensus_len)
            .map_err(|_| SnapshotError::Inconsistent("consensus length overflow".to_owned()))?;
        graph.last_decided_round = Some(snapshot.round);
        graph.ordering = OrderedEvents::resume_after(snapshot.round, consensus_len);
        for event in snapshot.events {
            graph.push_snapshot_event(event)?;
        }
        Ok(graph)
    }

    /// Like [`Self::push_event`], but parents may be missing and consensus
    /// data is taken from the snapshot.
    fn push_snapshot_event(&mut self, snapshot_event: SnapshotEvent) -> Result<(), SnapshotError> {
        let SnapshotEvent {
            event: new_event,
            round,
            witness,
            famous,
            received,
            forks_seen,
        } = snapshot_event;
        let hash = new_event.body().hash().map_err(PushError::from)?;
        if self.all_events.contains_key(&hash) {
            return Err(PushError::EventAlreadyExists(hash).into());
        }
        let body = new_event.body();
        let creator = body.creator;
        let index = body.index;
        let creator_position = *self
            .member_positions
            .get(&creator)
            .ok_or(PushError::UnknownCreator(creator))?;
        if !self
            .signer
            .verify(&hash, new_event.signature(), &creator)
        {
            return Err(PushError::InvalidSignature.into());
        }

        let self_parent = body
            .parents
            .self_parent
            .as_ref()
            .and_then(|h| self.all_events.get(h));
        let other_parent = body
            .parents
            .other_parent
            .as_ref()
            .and_then(|h| self.all_events.get(h));
        if let Some(parent) = self_parent {
            if parent.author() != &creator {
                return Err(PushError::IncorrectAuthor(*parent.author(), creator).into());
            }
            if parent.index() + 1 != index {
                return Err(PushError::IncorrectIndex(parent.index() + 1, index).into());
            }
        }
        for parent in [self_parent, other_parent].into_iter().flatten() {
            if parent.round() > Some(round) {
                return Err(SnapshotError::Inconsistent(format!(
                    "round {} of {} is below the round of its parent",
                    round, hash
                )));
            }
        }
        if let Some(parent) = self_parent {
            if witness != (parent.round() < Some(round)) {
                return Err(SnapshotError::Inconsistent(format!(
                    "witness flag of {} contradicts its round",
                    hash
                )));
            }
        }

        let (last_ancestors, mut forks_seen_positions) =
            self.ancestry_of(creator_position, index, &hash, [self_parent, other_parent]);
        forks_seen_positions.extend(
            forks_seen
                .iter()
                .filter_map(|peer| self.member_positions.get(peer).copied()),
        );
        forks_seen_positions.sort_unstable();
        forks_seen_positions.dedup();

        let has_self_parent = self_parent.is_some();
        let entry = self
            .peer_index
            .entry(creator)
            .or_insert_with(PeerIndexEntry::new);
        let fork = if has_self_parent {
            entry.add_event(creator, index, hash.clone())
        } else {
            entry.add_root(creator, index, hash.clone())
        }
        .map_err(|e| SnapshotError::Inconsistent(e.to_string()))?;
        if let Some(fork) = fork {
            self.detected_forks.push(fork);
        }

        let mut event = Event::new(new_event, hash.clone(), self.all_events.len());
        event.last_ancestors = last_ancestors;
        event.forks_seen = forks_seen_positions;
        event.round = Some(round);
        event.witness = witness;
        if let Some((round_received, timestamp)) = received {
            event.round_received = Some(round_received);
            event.consensus_timestamp = Some(timestamp);
        } else {
            self.pending_received.push(hash.clone());
        }
        self.all_events.insert(hash.clone(), event);

        let decided = self.last_decided_round >= Some(round);
        let round_info = self.round_info_mut(round);
        round_info.events.push(hash.clone());
        if witness {
            let fame = match famous {
                Some(true) => WitnessFamousness::Yes,
                Some(false) => WitnessFamousness::No,
                // fame in decided rounds is final
                None if decided => WitnessFamousness::No,
                None => WitnessFamousness::Undecided,
            };
            round_info.witnesses.insert(hash, fame);
        }
        Ok(())
    }
}
