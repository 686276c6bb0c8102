//! Stream transports (TCP and local sockets).
//!
//! Frames are length-delimited; each frame carries one JSON-encoded
//! [`RemoteRequest`] or [`RemoteResponse`]. A channel keeps one request in
//! flight at a time; responses left behind by cancelled requests are skipped.

use super::{Channel, Protocol, RequestHandler, TransportError};
use crate::cache::Connector;
use crate::protocol::{RemoteRequest, RemoteResponse};
use async_trait::async_trait;
use bytes::Bytes;
use clio_core::CoreResult;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

/// Client channel over a framed byte stream
pub struct StreamChannel<S> {
    protocol: Protocol,
    framed: Mutex<Framed<S, LengthDelimitedCodec>>,
}

impl<S> StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap a connected stream
    #[must_use]
    pub fn new(protocol: Protocol, stream: S) -> Self {
        Self {
            protocol,
            framed: Mutex::new(Framed::new(stream, LengthDelimitedCodec::new())),
        }
    }
}

#[async_trait]
impl<S> Channel for StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn request(&self, request: RemoteRequest) -> CoreResult<RemoteResponse> {
        let expected = request.request_id;
        let payload = serde_json::to_vec(&request)?;

        let mut framed = self.framed.lock().await;
        framed
            .send(Bytes::from(payload))
            .await
            .map_err(TransportError::from)?;
        loop {
            let frame = framed
                .next()
                .await
                .ok_or(TransportError::Closed)?
                .map_err(TransportError::from)?;
            let response: RemoteResponse = serde_json::from_slice(&frame)?;
            if response.request_id == expected {
                return Ok(response);
            }
            // Answer to a request whose caller gave up waiting
            debug!(
                expected = %expected,
                received = %response.request_id,
                "Discarding stale response"
            );
        }
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }
}

impl<S> std::fmt::Debug for StreamChannel<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamChannel")
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

/// Connector for `tcp` destinations (`host:port`)
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        key: &str,
        protocol: Protocol,
        destination: &str,
    ) -> CoreResult<Arc<dyn Channel>> {
        let stream = TcpStream::connect(destination)
            .await
            .map_err(|err| TransportError::ConnectionFailed(format!("{destination}: {err}")))?;
        stream.set_nodelay(true).map_err(TransportError::from)?;
        debug!(key, "TCP channel established");
        Ok(Arc::new(StreamChannel::new(protocol, stream)))
    }
}

/// Connector for `ipc` destinations (socket paths)
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct IpcConnector;

#[cfg(unix)]
#[async_trait]
impl Connector for IpcConnector {
    async fn connect(
        &self,
        key: &str,
        protocol: Protocol,
        destination: &str,
    ) -> CoreResult<Arc<dyn Channel>> {
        let stream = tokio::net::UnixStream::connect(destination)
            .await
            .map_err(|err| TransportError::ConnectionFailed(format!("{destination}: {err}")))?;
        debug!(key, "IPC channel established");
        Ok(Arc::new(StreamChannel::new(protocol, stream)))
    }
}

/// Answer requests on one connection until the peer hangs up
///
/// # Errors
///
/// Returns error on socket or framing failure. Undecodable frames are
/// answered by closing the connection.
pub async fn serve_connection<S>(stream: S, handler: Arc<dyn RequestHandler>) -> CoreResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    while let Some(frame) = framed.next().await {
        let frame = frame.map_err(TransportError::from)?;
        let request: RemoteRequest = serde_json::from_slice(&frame)?;
        let response = handler.handle(request).await;
        let payload = serde_json::to_vec(&response)?;
        framed
            .send(Bytes::from(payload))
            .await
            .map_err(TransportError::from)?;
    }
    Ok(())
}

/// Accept TCP connections and serve each on its own task
///
/// # Errors
///
/// Returns error if accepting fails.
pub async fn serve_tcp(listener: TcpListener, handler: Arc<dyn RequestHandler>) -> CoreResult<()> {
    info!(addr = ?listener.local_addr().ok(), "Serving requests over TCP");
    loop {
        let (stream, peer) = listener.accept().await.map_err(TransportError::from)?;
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            if let Err(err) = serve_connection(stream, handler).await {
                warn!(%peer, error = %err, "Connection ended with error");
            }
        });
    }
}

/// Accept local socket connections and serve each on its own task
///
/// # Errors
///
/// Returns error if accepting fails.
#[cfg(unix)]
pub async fn serve_ipc(
    listener: tokio::net::UnixListener,
    handler: Arc<dyn RequestHandler>,
) -> CoreResult<()> {
    info!("Serving requests over local socket");
    loop {
        let (stream, _) = listener.accept().await.map_err(TransportError::from)?;
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            if let Err(err) = serve_connection(stream, handler).await {
                warn!(error = %err, "Connection ended with error");
            }
        });
    }
}
