//! What a node knows, in a compact form, and what it lacks.
//!
//! The known state of a node is the highest event index it holds for each
//! creator. Since events are only accepted after their self parent, knowing
//! index `i` of a creator implies knowing all its events with lower index
//! (for honest creators at least).
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::PeerId;

/// Highest known event index per creator. Creators without any known
/// events are absent.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct KnownEvents(BTreeMap<PeerId, u64>);

impl KnownEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer: &PeerId) -> Option<u64> {
        self.0.get(peer).copied()
    }

    /// Keeps the higher of the present and the provided index
    pub fn observe(&mut self, peer: PeerId, index: u64) {
        let entry = self.0.entry(peer).or_insert(index);
        *entry = (*entry).max(index);
    }

    /// Claim to know the creator's events only below `first_missing`, so
    /// that they are sent again from there on
    pub fn forget_from(&mut self, peer: &PeerId, first_missing: u64) {
        match first_missing.checked_sub(1) {
            Some(index) => {
                if let Some(entry) = self.0.get_mut(peer) {
                    *entry = (*entry).min(index);
                }
            }
            None => {
                self.0.remove(peer);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &u64)> {
        self.0.iter()
    }

    /// `true` if `self` knows at least as much as `other` for every creator
    pub fn dominates(&self, other: &KnownEvents) -> bool {
        other
            .iter()
            .all(|(peer, index)| self.get(peer).map_or(false, |own| own >= *index))
    }

    /// Largest number of events of a single creator that `self` holds and
    /// `other` does not.
    pub fn max_lead_over(&self, other: &KnownEvents) -> u64 {
        self.iter()
            .map(|(peer, own)| match other.get(peer) {
                Some(theirs) => own.saturating_sub(theirs),
                None => own + 1,
            })
            .max()
            .unwrap_or(0)
    }
}

impl FromIterator<(PeerId, u64)> for KnownEvents {
    fn from_iter<T: IntoIterator<Item = (PeerId, u64)>>(iter: T) -> Self {
        let mut known = KnownEvents::new();
        for (peer, index) in iter {
            known.observe(peer, index);
        }
        known
    }
}
