//! Leaderless asynchronous BFT consensus node built on a hashgraph.
//!
//! Events gossiped between participants form a DAG ([`algorithm::datastructure::Graph`]);
//! virtual voting over that DAG yields a total order of transactions which the
//! [`node::Node`] hands to the application through [`proxy::AppProxy`].

use serde::{Deserialize, Serialize};

pub mod algorithm;
pub mod config;
pub mod net;
pub mod node;
pub mod proxy;

/// Nanoseconds since UNIX epoch (or any monotonic counter in tests)
pub type Timestamp = u128;

/// Opaque application payload
pub type Transaction = Vec<u8>;

/// Stable public identifier of a participant: its ed25519 verifying key.
#[derive(Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Copy)]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s.trim_start_matches("0x"), &mut bytes)?;
        Ok(PeerId(bytes))
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // short form is enough to tell peers apart in logs
        write!(f, "PeerId({})", hex::encode(&self.0[..4]))
    }
}

pub use config::{Participant, Roster};
