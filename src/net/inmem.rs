//! Transport that keeps everything inside the process; used for tests and
//! simulations.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{Request, Response, RpcHandler, Transport, TransportError};

/// Registry of listening in-memory endpoints
#[derive(Clone, Default)]
pub struct InmemNetwork {
    endpoints: Arc<Mutex<HashMap<String, Arc<dyn RpcHandler>>>>,
}

impl InmemNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport reachable at `addr` within this network
    pub fn transport(&self, addr: impl Into<String>, timeout: Duration) -> InmemTransport {
        InmemTransport {
            addr: addr.into(),
            network: self.clone(),
            timeout,
            closed: CancellationToken::new(),
        }
    }

    fn handler(&self, addr: &str) -> Option<Arc<dyn RpcHandler>> {
        self.endpoints.lock().get(addr).cloned()
    }
}

pub struct InmemTransport {
    addr: String,
    network: InmemNetwork,
    timeout: Duration,
    closed: CancellationToken,
}

#[async_trait]
impl Transport for InmemTransport {
    fn local_addr(&self) -> String {
        self.addr.clone()
    }

    async fn request(&self, target: &str, request: Request) -> Result<Response, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let handler =
            self.network
                .handler(target)
                .ok_or_else(|| TransportError::ConnectionFailed {
                    target: target.to_owned(),
                    reason: "nobody listens at the address".to_owned(),
                })?;
        trace!("{} -> {}", self.addr, target);
        // handled in its own task, like a request arriving over the network
        let task = tokio::spawn(async move { handler.handle(request).await });
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            result = tokio::time::timeout(self.timeout, task) => match result {
                Err(_) => Err(TransportError::Timeout(target.to_owned())),
                Ok(Err(join_error)) => Err(TransportError::ConnectionFailed {
                    target: target.to_owned(),
                    reason: join_error.to_string(),
                }),
                Ok(Ok(response)) => Ok(response),
            },
        }
    }

    async fn listen(&self, handler: Arc<dyn RpcHandler>) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let mut endpoints = self.network.endpoints.lock();
        if endpoints.contains_key(&self.addr) {
            return Err(TransportError::AlreadyListening);
        }
        endpoints.insert(self.addr.clone(), handler);
        Ok(())
    }

    async fn close(&self) {
        self.closed.cancel();
        self.network.endpoints.lock().remove(&self.addr);
    }
}
