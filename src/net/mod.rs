//! Messages exchanged between nodes and the transports delivering them.
//!
//! Every exchange is a single request followed by a single response. The
//! node side is hidden behind [`RpcHandler`], the network side behind
//! [`Transport`].
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::algorithm::datastructure::{KnownEvents, Snapshot};
use crate::algorithm::event::{self, SignedEvent};
use crate::algorithm::RoundNum;
use crate::{PeerId, Transaction};

pub mod inmem;
pub mod tcp;

pub use inmem::{InmemNetwork, InmemTransport};
pub use tcp::TcpTransport;

// ============================================================================
// MESSAGES
// ============================================================================

/// Pull: "here is what I know, send me what I miss"
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SyncRequest {
    pub from: String,
    pub known: KnownEvents,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SyncResponse {
    pub from: String,
    /// Topologically sorted, empty if `sync_limit` is set
    pub events: Vec<SignedEvent>,
    pub known: KnownEvents,
    /// The requester lags too much and has to fast-forward instead
    pub sync_limit: bool,
}

/// Push: unsolicited events, topologically sorted
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EagerSyncRequest {
    pub from: String,
    pub events: Vec<SignedEvent>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EagerSyncResponse {
    pub from: String,
    pub success: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FastForwardRequest {
    pub from: String,
    /// Consensus events the requester already handed to its application
    pub delivered: u64,
}

/// Consensus state a lagging node bootstraps from
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Frame {
    /// Events of the responder from its last decided round on
    pub snapshot: Snapshot,
    /// Position in the consensus order of the first `missed` batch
    pub missed_from: u64,
    /// Transactions of the consensus events the requester has not delivered,
    /// one batch per event, up to the snapshot round
    pub missed: Vec<Vec<Transaction>>,
}

impl Frame {
    pub fn round(&self) -> RoundNum {
        self.snapshot.round
    }

    /// Hash signed by the responder
    pub fn digest(&self) -> bincode::Result<event::Hash> {
        Ok(event::blake2_hash(&bincode::serialize(self)?))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FastForwardResponse {
    pub from: String,
    pub from_id: PeerId,
    pub frame: Frame,
    pub known: KnownEvents,
    /// Signature of `from_id` over [`Frame::digest`]
    pub signature: event::Signature,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum Request {
    Sync(SyncRequest),
    EagerSync(EagerSyncRequest),
    FastForward(FastForwardRequest),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum Response {
    Sync(SyncResponse),
    EagerSync(EagerSyncResponse),
    FastForward(FastForwardResponse),
    /// The handler refused or failed to process the request
    Error(String),
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Request to {0} timed out")]
    Timeout(String),
    #[error("Could not reach {target}: {reason}")]
    ConnectionFailed { target: String, reason: String },
    #[error("Transport is closed")]
    Closed,
    #[error("Transport is already listening")]
    AlreadyListening,
    #[error("Frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
    #[error("Peer failed to handle the request: {0}")]
    Remote(String),
    #[error("Response does not match the request")]
    UnexpectedResponse,
    #[error("Could not encode or decode a message")]
    Codec(#[from] bincode::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ============================================================================
// TRAITS
// ============================================================================

/// Serves requests coming from other nodes.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Response;
}

/// Request/response delivery between named endpoints. Requests are bounded by
/// the timeout the transport was created with.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Endpoint other nodes use to reach this transport
    fn local_addr(&self) -> String;

    async fn request(&self, target: &str, request: Request) -> Result<Response, TransportError>;

    /// Start serving inbound requests with `handler`
    async fn listen(&self, handler: Arc<dyn RpcHandler>) -> Result<(), TransportError>;

    /// Stop serving and fail all pending and future requests. Idempotent.
    async fn close(&self);

    async fn sync(
        &self,
        target: &str,
        request: SyncRequest,
    ) -> Result<SyncResponse, TransportError> {
        match self.request(target, Request::Sync(request)).await? {
            Response::Sync(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    async fn eager_sync(
        &self,
        target: &str,
        request: EagerSyncRequest,
    ) -> Result<EagerSyncResponse, TransportError> {
        match self.request(target, Request::EagerSync(request)).await? {
            Response::EagerSync(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    async fn fast_forward(
        &self,
        target: &str,
        request: FastForwardRequest,
    ) -> Result<FastForwardResponse, TransportError> {
        match self.request(target, Request::FastForward(request)).await? {
            Response::FastForward(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> TransportError {
    match response {
        Response::Error(reason) => TransportError::Remote(reason),
        _ => TransportError::UnexpectedResponse,
    }
}
