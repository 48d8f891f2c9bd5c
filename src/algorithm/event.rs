use blake2::{Blake2b512, Digest};
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::{PeerId, Timestamp, Transaction};

use super::RoundNum;

#[derive(Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash, Clone)]
pub struct Hash {
    #[serde(with = "BigArray")]
    inner: [u8; 64],
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.inner))
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hash")
            .field("hex_value", &hex::encode(&self.inner[..8]))
            .finish()
    }
}

impl std::ops::BitXor for &Hash {
    type Output = Hash;

    fn bitxor(self, rhs: Self) -> Self::Output {
        let mut result = [0u8; 64];
        for (i, (b1, b2)) in self.inner.iter().zip(rhs.inner.iter()).enumerate() {
            result[i] = b1 ^ b2;
        }
        Hash::from_array(result)
    }
}

impl std::ops::BitXor<&Hash> for Hash {
    type Output = Hash;

    fn bitxor(mut self, rhs: &Self) -> Self::Output {
        for i in 0..self.inner.len() {
            self.inner[i] ^= rhs.inner[i];
        }
        self
    }
}

impl Hash {
    pub fn into_array(self) -> [u8; 64] {
        self.inner
    }

    pub fn as_ref(&self) -> &[u8; 64] {
        &self.inner
    }

    pub const fn from_array(inner: [u8; 64]) -> Self {
        Hash { inner }
    }
}

/// BLAKE2b-512 of `data`
pub fn blake2_hash(data: &[u8]) -> Hash {
    let mut hasher = Blake2b512::new();
    hasher.update(data);
    let mut inner = [0u8; 64];
    inner.copy_from_slice(&hasher.finalize());
    Hash::from_array(inner)
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Debug)]
pub struct Signature(pub Hash);

impl std::ops::BitXor<&Signature> for Signature {
    type Output = Signature;

    fn bitxor(self, rhs: &Signature) -> Self::Output {
        Signature(self.0 ^ &rhs.0)
    }
}

impl Signature {
    /// Middle bit of the signature, used as a pseudo-random coin in voting
    pub fn middle_bit(&self) -> bool {
        let bytes = self.0.as_ref();
        let middle_bit_index = bytes.len() * 8 / 2;
        let middle_byte = bytes[middle_bit_index / 8];
        (middle_byte >> (middle_bit_index % 8) & 1) != 0
    }
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Hash, Clone, Debug, Default)]
pub struct Parents {
    /// `None` only for the first event of a creator
    pub self_parent: Option<Hash>,
    pub other_parent: Option<Hash>,
}

/// Everything covered by the event signature.
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug)]
pub struct EventBody {
    pub transactions: Vec<Transaction>,
    pub parents: Parents,
    pub creator: PeerId,
    /// Position among the events of `creator`, starting from 0
    pub index: u64,
    /// Set by author, only a hint
    pub timestamp: Timestamp,
}

impl EventBody {
    /// Content hash, the event identifier
    pub fn hash(&self) -> bincode::Result<Hash> {
        Ok(blake2_hash(&bincode::serialize(self)?))
    }
}

/// Event as it travels between nodes
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug)]
pub struct SignedEvent {
    body: EventBody,
    signature: Signature,
}

impl SignedEvent {
    pub fn new<F>(body: EventBody, sign: F) -> bincode::Result<Self>
    where
        F: FnOnce(&Hash) -> Signature,
    {
        let hash = body.hash()?;
        let signature = sign(&hash);
        Ok(SignedEvent { body, signature })
    }

    pub fn from_parts(body: EventBody, signature: Signature) -> Self {
        SignedEvent { body, signature }
    }

    pub fn into_parts(self) -> (EventBody, Signature) {
        (self.body, self.signature)
    }

    pub fn body(&self) -> &EventBody {
        &self.body
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }
}

/// Highest event (by index) of some creator known to be an ancestor.
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct AncestorCoordinate {
    pub index: u64,
    pub hash: Hash,
}

/// Graph event with additional metadata for navigation and consensus.
#[derive(Clone, Debug)]
pub struct Event {
    inner: SignedEvent,
    hash: Hash,
    /// Position in insertion order; insertion order is topological
    pub(crate) topological_index: usize,
    /// Indexed by roster position of the creator. Includes the event itself.
    pub(crate) last_ancestors: Vec<Option<AncestorCoordinate>>,
    /// Roster positions of creators with two conflicting events among the ancestors
    pub(crate) forks_seen: Vec<usize>,
    pub(crate) round: Option<RoundNum>,
    pub(crate) witness: bool,
    pub(crate) round_received: Option<RoundNum>,
    pub(crate) consensus_timestamp: Option<Timestamp>,
}

impl Event {
    pub(crate) fn new(inner: SignedEvent, hash: Hash, topological_index: usize) -> Self {
        Event {
            inner,
            hash,
            topological_index,
            last_ancestors: vec![],
            forks_seen: vec![],
            round: None,
            witness: false,
            round_received: None,
            consensus_timestamp: None,
        }
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn signature(&self) -> &Signature {
        self.inner.signature()
    }

    pub fn parents(&self) -> &Parents {
        &self.inner.body().parents
    }

    pub fn self_parent(&self) -> Option<&Hash> {
        self.parents().self_parent.as_ref()
    }

    pub fn other_parent(&self) -> Option<&Hash> {
        self.parents().other_parent.as_ref()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.inner.body().transactions
    }

    pub fn author(&self) -> &PeerId {
        &self.inner.body().creator
    }

    pub fn index(&self) -> u64 {
        self.inner.body().index
    }

    pub fn timestamp(&self) -> &Timestamp {
        &self.inner.body().timestamp
    }

    pub fn round(&self) -> Option<RoundNum> {
        self.round
    }

    pub fn is_witness(&self) -> bool {
        self.witness
    }

    pub fn round_received(&self) -> Option<RoundNum> {
        self.round_received
    }

    pub fn consensus_timestamp(&self) -> Option<Timestamp> {
        self.consensus_timestamp
    }

    pub fn signed(&self) -> &SignedEvent {
        &self.inner
    }

    pub fn to_wire(&self) -> SignedEvent {
        self.inner.clone()
    }
}
