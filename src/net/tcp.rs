//! TCP transport. Every request opens its own connection and carries one
//! length-prefixed bincode frame in each direction.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{Request, Response, RpcHandler, Transport, TransportError};

/// Largest accepted frame payload
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

// ============================================================================
// FRAMING
// ============================================================================

async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(message)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(payload.len()));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame<R, T>(reader: &mut R) -> Result<T, TransportError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(bincode::deserialize(&payload)?)
}

// ============================================================================
// TCP TRANSPORT
// ============================================================================

pub struct TcpTransport {
    local_addr: SocketAddr,
    timeout: Duration,
    /// Taken by `listen`
    listener: Mutex<Option<TcpListener>>,
    shutdown: CancellationToken,
}

impl TcpTransport {
    /// Binds immediately so that `local_addr` is known before listening,
    /// port 0 picks a free one.
    pub async fn bind(addr: &str, timeout: Duration) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        debug!("Bound TCP transport to {}", local_addr);
        Ok(Self {
            local_addr,
            timeout,
            listener: Mutex::new(Some(listener)),
            shutdown: CancellationToken::new(),
        })
    }

    async fn exchange(target: &str, request: &Request) -> Result<Response, TransportError> {
        let mut stream =
            TcpStream::connect(target)
                .await
                .map_err(|e| TransportError::ConnectionFailed {
                    target: target.to_owned(),
                    reason: e.to_string(),
                })?;
        stream.set_nodelay(true).ok();
        write_frame(&mut stream, request).await?;
        read_frame(&mut stream).await
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    handler: Arc<dyn RpcHandler>,
) -> Result<(), TransportError> {
    let request: Request = read_frame(&mut stream).await?;
    let response = handler.handle(request).await;
    write_frame(&mut stream, &response).await
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn RpcHandler>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("TCP accept loop stopped");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    trace!("Connection from {}", remote);
                    stream.set_nodelay(true).ok();
                    let handler = handler.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = shutdown.cancelled() => {}
                            result = serve_connection(stream, handler) => {
                                if let Err(e) = result {
                                    debug!("Failed to serve {}: {}", remote, e);
                                }
                            }
                        }
                    });
                }
                Err(e) => warn!("Failed to accept connection: {}", e),
            },
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_addr(&self) -> String {
        self.local_addr.to_string()
    }

    async fn request(&self, target: &str, request: Request) -> Result<Response, TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(TransportError::Closed),
            result = tokio::time::timeout(self.timeout, Self::exchange(target, &request)) => {
                result.map_err(|_| TransportError::Timeout(target.to_owned()))?
            }
        }
    }

    async fn listen(&self, handler: Arc<dyn RpcHandler>) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or(TransportError::AlreadyListening)?;
        tokio::spawn(accept_loop(listener, handler, self.shutdown.clone()));
        Ok(())
    }

    async fn close(&self) {
        self.shutdown.cancel();
        // drops the listener if `listen` was never called
        self.listener.lock().take();
    }
}
