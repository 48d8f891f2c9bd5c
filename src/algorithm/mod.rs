use std::sync::atomic::{AtomicU64, Ordering};

use ed25519_dalek::{Signer as _, SigningKey, Verifier as _, VerifyingKey};
use thiserror::Error;

use crate::{PeerId, Timestamp};

use self::event::{Hash, Signature};

pub mod datastructure;
pub mod event;

// u64 must be enough, if new round each 0.1 second
// then we'll be supplied for >5*10^10 years lol
pub type RoundNum = u64;

/// Produces and checks signatures over event hashes.
pub trait Signer {
    /// Identifier under which events signed by `self` are created
    fn identity(&self) -> PeerId;
    fn sign(&self, event_hash: &Hash) -> Signature;
    fn verify(&self, event_hash: &Hash, signature: &Signature, identity: &PeerId) -> bool;
}

/// Ed25519 keys; the verifying key doubles as [`PeerId`].
#[derive(Clone)]
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            key: SigningKey::generate(&mut rng),
        }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn seed(&self) -> [u8; 32] {
        self.key.to_bytes()
    }
}

impl Signer for Ed25519Signer {
    fn identity(&self) -> PeerId {
        PeerId::from_bytes(self.key.verifying_key().to_bytes())
    }

    fn sign(&self, event_hash: &Hash) -> Signature {
        let signature = self.key.sign(event_hash.as_ref());
        Signature(Hash::from_array(signature.to_bytes()))
    }

    fn verify(&self, event_hash: &Hash, signature: &Signature, identity: &PeerId) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(identity.as_bytes()) else {
            return false;
        };
        let signature = ed25519_dalek::Signature::from_bytes(signature.0.as_ref());
        key.verify(event_hash.as_ref(), &signature).is_ok()
    }
}

/// Signer that just hashes the hash again
#[derive(Clone)]
pub struct MockSigner {
    identity: PeerId,
}

impl MockSigner {
    pub fn new(identity: PeerId) -> Self {
        Self { identity }
    }
}

impl Signer for MockSigner {
    fn identity(&self) -> PeerId {
        self.identity
    }

    fn sign(&self, message: &Hash) -> Signature {
        Signature(event::blake2_hash(message.as_ref()))
    }

    fn verify(&self, message: &Hash, signature: &Signature, _identity: &PeerId) -> bool {
        let calc_hash = self.sign(message);
        &calc_hash == signature
    }
}

pub trait Clock {
    fn current_timestamp(&self) -> Timestamp;
}

/// Wall clock, nanoseconds since UNIX epoch
#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn current_timestamp(&self) -> Timestamp {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default()
    }
}

#[derive(Default)]
pub struct IncrementalClock {
    next_time: AtomicU64,
}

impl IncrementalClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for IncrementalClock {
    fn current_timestamp(&self) -> Timestamp {
        self.next_time.fetch_add(1, Ordering::Relaxed).into()
    }
}

/// Reasons an event is rejected by the store.
#[derive(Error, Debug)]
pub enum PushError {
    #[error("Could not find specified parent in the graph. Parent hash: `{0}`")]
    NoParent(event::Hash),
    #[error("Pushed event is already present in the graph. Hash: `{0}`")]
    EventAlreadyExists(event::Hash),
    #[error("The author of the event is not a participant: {0}")]
    UnknownCreator(PeerId),
    /// `(expected, provided)`
    #[error("Provided author is different from author of self parent (expected {0}, provided {1})")]
    IncorrectAuthor(PeerId, PeerId),
    /// `(expected, provided)`
    #[error("Event index does not follow its self parent (expected {0}, provided {1})")]
    IncorrectIndex(u64, u64),
    #[error("Signature does not match the event creator")]
    InvalidSignature,
    #[error("Event index {0} lies below the oldest held event of its creator")]
    BelowHeldHistory(u64),
    #[error("Serialization failed")]
    SerializationFailure(#[from] bincode::Error),
}
