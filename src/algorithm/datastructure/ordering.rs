use thiserror::Error;

use crate::{
    algorithm::{event, RoundNum},
    Timestamp,
};

/// Append-only log of events in consensus order. Events are added one
/// decided `round received` at a time, so an event placed here never moves.
pub struct OrderedEvents {
    // None - no rounds were ordered (because first round is 0)
    latest_ordered_round: Option<RoundNum>,
    /// Number of events ordered before the first one in `events`
    offset: usize,
    events: Vec<event::Hash>,
    // For iteration
    next_element_to_access: usize,
}

impl OrderedEvents {
    pub fn new() -> Self {
        Self {
            latest_ordered_round: None,
            offset: 0,
            events: vec![],
            next_element_to_access: 0,
        }
    }

    /// Continue an order that is not kept: `offset` events were ordered up to
    /// and including `round`.
    pub fn resume_after(round: RoundNum, offset: usize) -> Self {
        Self {
            latest_ordered_round: Some(round),
            offset,
            events: vec![],
            next_element_to_access: 0,
        }
    }

    /// We need to supply events by each subsequent `round received`, rounds
    /// without any received events included.
    ///
    /// `events` contains `(event hash, consensus timestamp, event signature)`,
    /// `famous_witness_sigs` is needed for signature whitening.
    pub fn add_received_round(
        &mut self,
        round: RoundNum,
        events: impl Iterator<Item = (event::Hash, Timestamp, event::Signature)>,
        famous_witness_sigs: impl Iterator<Item = event::Signature>,
    ) -> Result<(), RoundAddError> {
        self.verify_round_number(round)?;

        // XOR is associative + commutative, so we can combine the sigs
        // to not recompute it each time
        let sigs_combined = Self::combine_sigs_xor(famous_witness_sigs);
        let mut events: Vec<_> = events
            .map(|(hash, timestamp, sig)| (hash, timestamp, sig ^ &sigs_combined))
            .collect();

        // First by consensus timestamp then by whitened signature
        events.sort_by(
            |(_, timestamp1, whitened_sig1), (_, timestamp2, whitened_sig2)| {
                timestamp1
                    .cmp(timestamp2)
                    .then(whitened_sig1.cmp(whitened_sig2))
            },
        );

        self.events
            .extend(events.into_iter().map(|(hash, _, _)| hash));
        self.latest_ordered_round = Some(round);
        Ok(())
    }

    pub fn next_round_to_order(&self) -> RoundNum {
        match self.latest_ordered_round {
            Some(ordered) => ordered + 1,
            None => 0,
        }
    }

    pub fn events(&self) -> &[event::Hash] {
        &self.events
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Each ordered event is returned exactly once
    pub fn next_event(&mut self) -> Option<&event::Hash> {
        let event_hash = self.events.get(self.next_element_to_access)?;
        self.next_element_to_access += 1;
        Some(event_hash)
    }

    fn verify_round_number(&self, r: RoundNum) -> Result<(), RoundAddError> {
        (r == self.next_round_to_order())
            .then_some(())
            .ok_or(RoundAddError::IncorrectRoundNumber)
    }

    fn combine_sigs_xor(sigs: impl Iterator<Item = event::Signature>) -> event::Signature {
        sigs.fold(
            event::Signature(event::Hash::from_array([0u8; 64])),
            |acc, next| acc ^ &next,
        )
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum RoundAddError {
    #[error("Round right after previously supplied should be provided")]
    IncorrectRoundNumber,
}
