//! Transports: the in-process thread transport and length-delimited streams.

pub mod stream;
pub mod thread;

use crate::protocol::{RemoteRequest, RemoteResponse};
use async_trait::async_trait;
use clio_core::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transport protocol identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// In-process worker threads
    Thread,
    /// Local socket (Unix domain socket)
    Ipc,
    /// TCP socket
    Tcp,
}

impl Protocol {
    /// Every known protocol
    pub const ALL: [Protocol; 3] = [Protocol::Thread, Protocol::Ipc, Protocol::Tcp];

    /// Identifier as written in configuration and cache keys
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Thread => "thread",
            Self::Ipc => "ipc",
            Self::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "thread" => Ok(Self::Thread),
            "ipc" => Ok(Self::Ipc),
            "tcp" => Ok(Self::Tcp),
            other => Err(CoreError::UnknownProtocol {
                protocol: other.to_string(),
            }),
        }
    }
}

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Peer went away
    #[error("Connection closed")]
    Closed,

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for CoreError {
    fn from(err: TransportError) -> Self {
        CoreError::transport(err.to_string())
    }
}

/// Client side of an established transport
#[async_trait]
pub trait Channel: Send + Sync {
    /// Send a request and wait for its response
    async fn request(&self, request: RemoteRequest) -> CoreResult<RemoteResponse>;

    /// Protocol this channel speaks
    fn protocol(&self) -> Protocol;
}

/// Server side: turns a request into a response
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one request
    async fn handle(&self, request: RemoteRequest) -> RemoteResponse;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_parse() {
        for protocol in Protocol::ALL {
            assert_eq!(protocol.as_str().parse::<Protocol>().unwrap(), protocol);
        }
        let err = "ws".parse::<Protocol>().unwrap_err();
        assert_eq!(
            err,
            CoreError::UnknownProtocol {
                protocol: "ws".to_string()
            }
        );
    }

    #[test]
    fn test_transport_error_into_core() {
        let err: CoreError = TransportError::Closed.into();
        assert_eq!(err, CoreError::transport("Connection closed"));
    }
}
