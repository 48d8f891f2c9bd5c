use std::collections::HashMap;

use derive_getters::Getters;
use thiserror::Error;

use crate::PeerId;

use super::event;

pub type PeerIndex = HashMap<PeerId, PeerIndexEntry>;

/// Most empty slots a root may open up between held events
const MAX_ROOT_GAP: u64 = 1 << 16;

/// Events of a single creator, indexed by their position in the creator's chain.
#[derive(Getters, Default, Debug)]
pub struct PeerIndexEntry {
    /// `authored_events[i]` are all events with index `first_index + i`. More
    /// than one event at the same index means the creator forked (equivocated).
    authored_events: Vec<Vec<event::Hash>>,
    /// Index of the lowest held slot. Non-zero only in stores bootstrapped
    /// from a snapshot, where older events are not kept.
    first_index: u64,
    /// Set once the first fork of the creator is observed, never reset
    forking: bool,
    /// Lowest index with more than one event
    first_fork: Option<u64>,
}

/// Two different events of the same creator claim the same position.
#[derive(Debug, Error, PartialEq, Clone)]
#[error("Peer {creator} created conflicting events at index {index}")]
pub struct ForkDetected {
    pub creator: PeerId,
    pub index: u64,
}

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("Attempted to add an event that is already present in the index")]
    EventAlreadyKnown,
    #[error("Events must be added after their self parent (index {0} skips ahead)")]
    IndexGap(u64),
    #[error("Index {0} is below the lowest held index")]
    BelowFirstIndex(u64),
}

impl PeerIndexEntry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest known index
    pub fn latest_index(&self) -> Option<u64> {
        self.authored_events
            .len()
            .checked_sub(1)
            .map(|i| self.first_index + i as u64)
    }

    /// First observed event at the highest index
    pub fn latest_event(&self) -> Option<&event::Hash> {
        self.authored_events.last().and_then(|slot| slot.first())
    }

    pub fn events_at(&self, index: u64) -> &[event::Hash] {
        index
            .checked_sub(self.first_index)
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|i| self.authored_events.get(i))
            .map(|slot| &slot[..])
            .unwrap_or(&[])
    }

    /// Returns the fork if another event already occupies `index`.
    pub fn add_event(
        &mut self,
        creator: PeerId,
        index: u64,
        event: event::Hash,
    ) -> Result<Option<ForkDetected>, Error> {
        // First do all checks, only then apply changes, to keep the state consistent
        let position = index
            .checked_sub(self.first_index)
            .ok_or(Error::BelowFirstIndex(index))?;
        let position = usize::try_from(position).map_err(|_| Error::IndexGap(index))?;
        if position > self.authored_events.len() {
            return Err(Error::IndexGap(index));
        }
        if self.events_at(index).contains(&event) {
            return Err(Error::EventAlreadyKnown);
        }

        if position == self.authored_events.len() {
            self.authored_events.push(vec![event]);
            Ok(None)
        } else {
            Ok(self.occupy(creator, position, index, event))
        }
    }

    /// Add an event whose self parent is not held. Unlike [`Self::add_event`]
    /// the index may lie anywhere, empty slots fill the gap.
    pub fn add_root(
        &mut self,
        creator: PeerId,
        index: u64,
        event: event::Hash,
    ) -> Result<Option<ForkDetected>, Error> {
        if self.events_at(index).contains(&event) {
            return Err(Error::EventAlreadyKnown);
        }
        if let Some(latest) = self.latest_index() {
            let gap = if index < self.first_index {
                self.first_index - index
            } else {
                index.saturating_sub(latest)
            };
            if gap > MAX_ROOT_GAP {
                return Err(Error::IndexGap(index));
            }
        }
        if self.authored_events.is_empty() {
            self.first_index = index;
        } else if index < self.first_index {
            let missing = usize::try_from(self.first_index - index)
                .map_err(|_| Error::IndexGap(index))?;
            let mut slots = vec![vec![]; missing];
            slots.append(&mut self.authored_events);
            self.authored_events = slots;
            self.first_index = index;
        }
        let position = usize::try_from(index - self.first_index).map_err(|_| Error::IndexGap(index))?;
        if position >= self.authored_events.len() {
            self.authored_events.resize(position + 1, vec![]);
        }
        if self.authored_events[position].is_empty() {
            self.authored_events[position].push(event);
            Ok(None)
        } else {
            Ok(self.occupy(creator, position, index, event))
        }
    }

    fn occupy(
        &mut self,
        creator: PeerId,
        position: usize,
        index: u64,
        event: event::Hash,
    ) -> Option<ForkDetected> {
        self.authored_events[position].push(event);
        self.forking = true;
        self.first_fork = Some(self.first_fork.map_or(index, |f| f.min(index)));
        Some(ForkDetected { creator, index })
    }
}
