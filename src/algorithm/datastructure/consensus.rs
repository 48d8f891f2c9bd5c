//! Virtual voting: rounds, fame of witnesses, round received and final order.
//!
//! All of it is computed from the graph structure alone, so nodes holding the
//! same events arrive at the same results regardless of insertion order.
use std::collections::{BTreeMap, HashSet};

use itertools::Itertools;
use tracing::{debug, error, instrument, trace};

use super::{Graph, RoundInfo, Vote, WitnessFamousness};
use crate::algorithm::{event, RoundNum};

impl<TSigner, TClock> Graph<TSigner, TClock> {
    /// Bring consensus data up to date with the inserted events.
    ///
    /// Returns the number of events newly added to the consensus order.
    #[instrument(level = "debug", skip(self))]
    pub fn process_known_events(&mut self) -> usize {
        self.divide_rounds();
        self.decide_fame();
        let received = self.decide_round_received();
        self.order_received(received)
    }

    pub(super) fn round_info_mut(&mut self, round: RoundNum) -> &mut RoundInfo {
        let index = round as usize;
        if self.rounds.len() <= index {
            self.rounds.resize_with(index + 1, RoundInfo::default);
        }
        &mut self.rounds[index]
    }

    fn next_round_to_decide(&self) -> RoundNum {
        self.last_decided_round.map_or(0, |r| r + 1)
    }

    /// Assign rounds to pending events, parents always go first since pending
    /// events are kept in insertion order.
    fn divide_rounds(&mut self) {
        while let Some(hash) = self.pending_rounds.pop_front() {
            let (round, witness) = self.determine_round(&hash);
            trace!("Event {:?} gets round {} (witness: {})", hash, round, witness);
            let fame = if round < self.next_round_to_decide() {
                debug!("Witness {:?} arrived after its round was decided", hash);
                WitnessFamousness::No
            } else {
                WitnessFamousness::Undecided
            };
            let round_info = self.round_info_mut(round);
            round_info.events.push(hash.clone());
            if witness {
                round_info.witnesses.insert(hash.clone(), fame);
            }
            let event = self
                .all_events
                .get_mut(&hash)
                .expect("Pending events must be tracked");
            event.round = Some(round);
            event.witness = witness;
            self.pending_received.push(hash);
        }
    }

    /// Round of an event is the max of its parents' rounds, +1 if it strongly
    /// sees a supermajority of that round's witnesses.
    fn determine_round(&self, event_hash: &event::Hash) -> (RoundNum, bool) {
        let event = self
            .all_events
            .get(event_hash)
            .expect("Pending events must be tracked");
        let round_of_parent = |parent: Option<&event::Hash>| {
            parent.map(|p| {
                self.round_of(p)
                    .expect("Parents are inserted and divided before children")
            })
        };
        let self_parent_round = round_of_parent(event.self_parent());
        let parents_round = self_parent_round
            .max(round_of_parent(event.other_parent()))
            .unwrap_or(0);

        let strongly_seen_creators: HashSet<usize> = self
            .round_info(parents_round)
            .map(|info| {
                info.witnesses
                    .keys()
                    .filter(|w| self.strongly_see(event_hash, w))
                    .map(|w| {
                        self.position_of(self.all_events.get(w).expect("Witnesses must be known"))
                    })
                    .collect()
            })
            .unwrap_or_default();
        let round = if self.is_supermajority(strongly_seen_creators.len()) {
            parents_round + 1
        } else {
            parents_round
        };
        let witness = match self_parent_round {
            None => true,
            Some(self_parent_round) => round > self_parent_round,
        };
        (round, witness)
    }

    #[instrument(level = "debug", skip(self))]
    fn decide_fame(&mut self) {
        let rounds_count = self.rounds.len() as RoundNum;
        for round in self.next_round_to_decide()..rounds_count {
            let undecided: Vec<event::Hash> = self.rounds[round as usize]
                .witnesses
                .iter()
                .filter(|(_, fame)| **fame == WitnessFamousness::Undecided)
                .map(|(hash, _)| hash.clone())
                .collect();
            for candidate in undecided {
                if let Some(famous) = self.elect(round, &candidate) {
                    debug!(
                        "Witness {:?} of round {} is decided, famous: {}",
                        candidate, round, famous
                    );
                    let fame = if famous {
                        WitnessFamousness::Yes
                    } else {
                        WitnessFamousness::No
                    };
                    self.round_info_mut(round)
                        .witnesses
                        .insert(candidate, fame);
                }
            }
        }
        let decided_before = self.last_decided_round;
        self.advance_rounds_decided();
        if self.last_decided_round != decided_before {
            self.forget_settled_votes();
        }
    }

    /// Votes and strongly-see results only serve elections of undecided
    /// rounds. Candidates are at least in the first undecided round, voters
    /// at least one round later.
    fn forget_settled_votes(&mut self) {
        let Some(last_decided) = self.last_decided_round else {
            return;
        };
        let all_events = &self.all_events;
        let is_settled = |hash: &event::Hash| {
            all_events
                .get(hash)
                .and_then(|e| e.round())
                .map_or(false, |round| round <= last_decided)
        };
        for (round, info) in self.rounds.iter_mut().enumerate() {
            if round as RoundNum <= last_decided + 1 {
                info.votes = Default::default();
            } else {
                for votes in info.votes.values_mut() {
                    votes.retain(|candidate, _| !is_settled(candidate));
                }
            }
        }
        self.strongly_see_cache
            .get_mut()
            .retain(|(_, target), _| !is_settled(target));
    }

    /// Collect votes of later witnesses until some of them decides
    fn elect(&mut self, round: RoundNum, candidate: &event::Hash) -> Option<bool> {
        let rounds_count = self.rounds.len() as RoundNum;
        for voting_round in round + 1..rounds_count {
            let voters: Vec<event::Hash> = self.rounds[voting_round as usize]
                .witnesses
                .keys()
                .cloned()
                .collect();
            for voter in voters {
                let vote = self.vote(round, voting_round, &voter, candidate);
                if let Some(decision) = vote.decision {
                    return Some(decision);
                }
            }
        }
        None
    }

    /// Vote of `voter` (witness of `voting_round`) on fame of `candidate`
    /// (witness of `round`). Memoized, as it never changes once computed.
    fn vote(
        &mut self,
        round: RoundNum,
        voting_round: RoundNum,
        voter: &event::Hash,
        candidate: &event::Hash,
    ) -> Vote {
        if let Some(vote) = self.rounds[voting_round as usize]
            .votes
            .get(voter)
            .and_then(|votes| votes.get(candidate))
        {
            return *vote;
        }
        let distance = voting_round - round;
        let vote = if distance == 1 {
            Vote {
                value: self.see(voter, candidate),
                decision: None,
            }
        } else {
            let previous_voters: Vec<event::Hash> = self.rounds[voting_round as usize - 1]
                .witnesses
                .keys()
                .filter(|w| self.strongly_see(voter, w))
                .cloned()
                .collect();
            let (mut yays, mut nays) = (0, 0);
            for previous_voter in &previous_voters {
                if self
                    .vote(round, voting_round - 1, previous_voter, candidate)
                    .value
                {
                    yays += 1;
                } else {
                    nays += 1;
                }
            }
            let majority = yays >= nays;
            let tally = yays.max(nays);
            let strong = self.is_supermajority(tally);
            if distance % self.coin_frequency != 0 {
                // normal round
                Vote {
                    value: majority,
                    decision: strong.then_some(majority),
                }
            } else if strong {
                Vote {
                    value: majority,
                    decision: None,
                }
            } else {
                // coin round
                let coin = self
                    .all_events
                    .get(voter)
                    .expect("Witnesses must be known")
                    .signature()
                    .middle_bit();
                Vote {
                    value: coin,
                    decision: None,
                }
            }
        };
        self.round_info_mut(voting_round)
            .votes
            .entry(voter.clone())
            .or_default()
            .insert(candidate.clone(), vote);
        vote
    }

    /// Round is decided if all known witnesses had their fame decided, for both
    /// round r and all earlier rounds. Therefore it makes sense to check rounds
    /// for it one by one.
    fn advance_rounds_decided(&mut self) {
        while let Some(info) = self.round_info(self.next_round_to_decide()) {
            if info
                .witnesses
                .values()
                .any(|fame| *fame == WitnessFamousness::Undecided)
            {
                break;
            }
            let decided = self.next_round_to_decide();
            debug!("Round {} is decided", decided);
            self.last_decided_round = Some(decided);
        }
    }

    fn famous_witnesses(&self, round: RoundNum) -> Vec<&event::Hash> {
        self.round_info(round)
            .map(|info| {
                info.witnesses
                    .iter()
                    .filter(|(_, fame)| **fame == WitnessFamousness::Yes)
                    .map(|(hash, _)| hash)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Find round received and consensus timestamp for pending events.
    ///
    /// Round received of x is the first decided round in which more than half
    /// of the famous witnesses see x.
    #[instrument(level = "debug", skip(self))]
    fn decide_round_received(&mut self) -> Vec<event::Hash> {
        let Some(last_decided) = self.last_decided_round else {
            return vec![];
        };
        // famous witnesses of already ordered rounds have all been checked
        let first_open = self.ordering.next_round_to_order();
        let pending = std::mem::take(&mut self.pending_received);
        let mut received = vec![];
        for hash in pending {
            let round = self.round_of(&hash).expect("Rounds are divided first");
            let mut decided = None;
            for candidate_round in (round + 1).max(first_open)..=last_decided {
                let famous = self.famous_witnesses(candidate_round);
                let seeing: Vec<&event::Hash> = famous
                    .iter()
                    .copied()
                    .filter(|w| self.see(w, &hash))
                    .collect();
                if 2 * seeing.len() > famous.len() {
                    let timestamps: Vec<_> = seeing
                        .into_iter()
                        .map(|w| *self.earliest_seeing_self_ancestor(w, &hash).timestamp())
                        .sorted()
                        .collect();
                    // the median; with a supermajority of honest famous
                    // witnesses it lies within honest timestamps
                    let consensus_timestamp = timestamps[timestamps.len() / 2];
                    decided = Some((candidate_round, consensus_timestamp));
                    break;
                }
            }
            match decided {
                Some((round_received, consensus_timestamp)) => {
                    trace!("Event {:?} received in round {}", hash, round_received);
                    let event = self
                        .all_events
                        .get_mut(&hash)
                        .expect("Pending events must be tracked");
                    event.round_received = Some(round_received);
                    event.consensus_timestamp = Some(consensus_timestamp);
                    received.push(hash);
                }
                None => self.pending_received.push(hash),
            }
        }
        received
    }

    /// The oldest self ancestor of `witness` that has `target` as ancestor
    fn earliest_seeing_self_ancestor(
        &self,
        witness: &event::Hash,
        target: &event::Hash,
    ) -> &event::Event {
        let mut current = self
            .all_events
            .get(witness)
            .expect("Witnesses must be known");
        while let Some(self_parent) = current.self_parent() {
            if !self.is_ancestor(self_parent, target) {
                break;
            }
            current = self
                .all_events
                .get(self_parent)
                .expect("Parents of known events must be known");
        }
        current
    }

    /// Append newly received events to the consensus order, one decided round at a time
    fn order_received(&mut self, received: Vec<event::Hash>) -> usize {
        let Some(last_decided) = self.last_decided_round else {
            return 0;
        };
        let mut by_round: BTreeMap<RoundNum, Vec<event::Hash>> = BTreeMap::new();
        for hash in received {
            let round = self
                .round_received_of(&hash)
                .expect("Only events with round received are passed");
            by_round.entry(round).or_default().push(hash);
        }
        let first_round = self.ordering.next_round_to_order();
        if let Some((stale, _)) = by_round.range(..first_round).next() {
            error!(
                "Round {} is already ordered, but new events were received by it. Inconsistent state",
                stale
            );
        }

        let before = self.consensus_events().len();
        for round in first_round..=last_decided {
            let events: Vec<_> = by_round
                .remove(&round)
                .unwrap_or_default()
                .into_iter()
                .map(|hash| {
                    let event = self.all_events.get(&hash).expect("Received events are tracked");
                    let timestamp = event
                        .consensus_timestamp()
                        .expect("Set together with round received");
                    let signature = event.signature().clone();
                    (hash, timestamp, signature)
                })
                .collect();
            let famous_sigs: Vec<event::Signature> = self
                .famous_witnesses(round)
                .into_iter()
                .map(|w| {
                    self.all_events
                        .get(w)
                        .expect("Witnesses must be known")
                        .signature()
                        .clone()
                })
                .collect();
            debug!("Ordering {} events received in round {}", events.len(), round);
            self.ordering
                .add_received_round(round, events.into_iter(), famous_sigs.into_iter())
                .expect("Rounds are supplied consecutively starting from the next one to order");
        }
        self.consensus_events().len() - before
    }
}
