//! Node configuration and the participant roster.
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::PeerId;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not read configuration file")]
    Io(#[from] std::io::Error),
    #[error("Malformed peers file")]
    Json(#[from] serde_json::Error),
    #[error("Invalid public key `{0}`")]
    InvalidKey(String),
    #[error("Roster must contain at least one participant")]
    EmptyRoster,
    #[error("Participant {0} is listed more than once")]
    DuplicateId(PeerId),
    #[error("Address {0} is used by more than one participant")]
    DuplicateAddress(String),
    #[error("`{0}` must be positive")]
    NotPositive(&'static str),
    #[error("Coin frequency must be at least 2, got {0}")]
    CoinFrequencyTooLow(u64),
}

// ============================================================================
// NODE CONFIG
// ============================================================================

/// Tunables of a single node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Time between gossip ticks
    pub heartbeat: Duration,
    /// Upper bound for a single request to a peer
    pub sync_timeout: Duration,
    /// Expected number of pending transactions, preallocated in the pool
    pub pool_capacity: usize,
    /// Largest per-creator lag a peer may have before it is told to fast-forward
    pub sync_limit: u64,
    /// Every `coin_frequency`-th voting generation flips coins
    pub coin_frequency: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_millis(50),
            sync_timeout: Duration::from_secs(1),
            pool_capacity: 1000,
            sync_limit: 1000,
            coin_frequency: 10,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    pub fn with_sync_limit(mut self, limit: u64) -> Self {
        self.sync_limit = limit;
        self
    }

    pub fn with_coin_frequency(mut self, frequency: u64) -> Self {
        self.coin_frequency = frequency;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat.is_zero() {
            return Err(ConfigError::NotPositive("heartbeat"));
        }
        if self.sync_timeout.is_zero() {
            return Err(ConfigError::NotPositive("sync_timeout"));
        }
        if self.sync_limit == 0 {
            return Err(ConfigError::NotPositive("sync_limit"));
        }
        if self.coin_frequency < 2 {
            return Err(ConfigError::CoinFrequencyTooLow(self.coin_frequency));
        }
        Ok(())
    }
}

// ============================================================================
// ROSTER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: PeerId,
    /// Transport endpoint of the participant
    pub net_addr: String,
}

impl Participant {
    pub fn new(id: PeerId, net_addr: impl Into<String>) -> Self {
        Self {
            id,
            net_addr: net_addr.into(),
        }
    }
}

/// Entry of a peers file, e.g.
/// `[{"NetAddr": "127.0.0.1:1337", "PubKeyHex": "0x3F1A..."}]`
#[derive(Serialize, Deserialize)]
struct PeersFileEntry {
    #[serde(rename = "NetAddr")]
    net_addr: String,
    #[serde(rename = "PubKeyHex")]
    pub_key_hex: String,
}

/// Fixed set of participants, sorted by id. Identical on all nodes of a
/// consensus instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    participants: Vec<Participant>,
}

impl Roster {
    pub fn new(mut participants: Vec<Participant>) -> Result<Self, ConfigError> {
        if participants.is_empty() {
            return Err(ConfigError::EmptyRoster);
        }
        participants.sort_by(|a, b| a.id.cmp(&b.id));
        let mut addresses = HashSet::with_capacity(participants.len());
        for (i, participant) in participants.iter().enumerate() {
            if i > 0 && participants[i - 1].id == participant.id {
                return Err(ConfigError::DuplicateId(participant.id));
            }
            if !addresses.insert(participant.net_addr.as_str()) {
                return Err(ConfigError::DuplicateAddress(participant.net_addr.clone()));
            }
        }
        Ok(Self { participants })
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn ids(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.participants.iter().map(|p| p.id)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn get(&self, id: &PeerId) -> Option<&Participant> {
        self.participants
            .binary_search_by(|p| p.id.cmp(id))
            .ok()
            .map(|i| &self.participants[i])
    }

    pub fn by_address(&self, net_addr: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.net_addr == net_addr)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let entries: Vec<PeersFileEntry> = serde_json::from_str(json)?;
        let participants = entries
            .into_iter()
            .map(|entry| {
                let id = PeerId::from_hex(&entry.pub_key_hex)
                    .map_err(|_| ConfigError::InvalidKey(entry.pub_key_hex.clone()))?;
                Ok(Participant::new(id, entry.net_addr))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Self::new(participants)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        let entries: Vec<_> = self
            .participants
            .iter()
            .map(|p| PeersFileEntry {
                net_addr: p.net_addr.clone(),
                pub_key_hex: format!("0x{}", p.id),
            })
            .collect();
        Ok(serde_json::to_string_pretty(&entries)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}
