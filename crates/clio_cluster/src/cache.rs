//! Channel cache.
//!
//! At most one channel exists per `protocol:destination` key. Concurrent
//! requests for a key that is still connecting wait on the same attempt. A
//! failed attempt leaves the key empty so the next request retries.

use crate::transport::{Channel, Protocol};
use async_trait::async_trait;
use clio_core::{CoreError, CoreResult};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;
use tracing::debug;

/// Creates channels for one protocol
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a channel to `destination`; `key` identifies it in logs
    async fn connect(
        &self,
        key: &str,
        protocol: Protocol,
        destination: &str,
    ) -> CoreResult<Arc<dyn Channel>>;
}

/// Protocol to connector table
#[derive(Clone, Default)]
pub struct TransportFactories {
    connectors: IndexMap<Protocol, Arc<dyn Connector>>,
}

impl TransportFactories {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the stream connectors (`tcp`, and `ipc` on Unix)
    #[must_use]
    pub fn with_defaults() -> Self {
        let factories = Self::new().with(Protocol::Tcp, Arc::new(crate::transport::stream::TcpConnector));
        #[cfg(unix)]
        let factories = factories.with(Protocol::Ipc, Arc::new(crate::transport::stream::IpcConnector));
        factories
    }

    /// Builder: install a connector for `protocol`
    #[must_use]
    pub fn with(mut self, protocol: Protocol, connector: Arc<dyn Connector>) -> Self {
        self.register(protocol, connector);
        self
    }

    /// Install or replace the connector for `protocol`
    pub fn register(&mut self, protocol: Protocol, connector: Arc<dyn Connector>) {
        self.connectors.insert(protocol, connector);
    }

    /// Connector for `protocol`
    #[must_use]
    pub fn get(&self, protocol: Protocol) -> Option<&Arc<dyn Connector>> {
        self.connectors.get(&protocol)
    }

    /// Protocols with a connector
    #[must_use]
    pub fn protocols(&self) -> Vec<Protocol> {
        self.connectors.keys().copied().collect()
    }
}

impl std::fmt::Debug for TransportFactories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportFactories")
            .field("protocols", &self.protocols())
            .finish()
    }
}

type Slot = Arc<OnceCell<Arc<dyn Channel>>>;

/// Cache of open channels keyed by `protocol:destination`
pub struct ChannelCache {
    factories: TransportFactories,
    entries: Mutex<HashMap<String, Slot>>,
}

impl ChannelCache {
    /// Create a cache over the given connectors
    #[must_use]
    pub fn new(factories: TransportFactories) -> Self {
        Self {
            factories,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cache key for a protocol and destination
    #[must_use]
    pub fn key(protocol: Protocol, destination: &str) -> String {
        format!("{protocol}:{destination}")
    }

    /// Channel for a protocol given by name
    ///
    /// # Errors
    ///
    /// `UnknownProtocol` if the name is not a protocol or has no connector,
    /// otherwise whatever the connector fails with.
    pub async fn get_channel(
        &self,
        protocol: &str,
        destination: &str,
    ) -> CoreResult<Arc<dyn Channel>> {
        let protocol: Protocol = protocol.parse()?;
        self.get(protocol, destination).await
    }

    /// Channel for `protocol` and `destination`, connecting on first use
    ///
    /// # Errors
    ///
    /// `UnknownProtocol` if no connector is installed, otherwise whatever the
    /// connector fails with.
    pub async fn get(&self, protocol: Protocol, destination: &str) -> CoreResult<Arc<dyn Channel>> {
        let connector = self
            .factories
            .get(protocol)
            .cloned()
            .ok_or_else(|| CoreError::UnknownProtocol {
                protocol: protocol.to_string(),
            })?;
        let key = Self::key(protocol, destination);
        let slot = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(entries.entry(key.clone()).or_default())
        };

        let opened = slot
            .get_or_try_init(|| async {
                debug!(key = %key, "Opening channel");
                connector.connect(&key, protocol, destination).await
            })
            .await;
        match opened {
            Ok(channel) => Ok(Arc::clone(channel)),
            Err(err) => {
                self.evict_failed(&key, &slot);
                Err(err)
            }
        }
    }

    /// Drop an empty slot nobody else is waiting on
    fn evict_failed(&self, key: &str, slot: &Slot) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = entries.get(key).is_some_and(|current| {
            Arc::ptr_eq(current, slot) && !slot.initialized() && Arc::strong_count(slot) == 2
        });
        if idle {
            entries.remove(key);
        }
    }

    /// Number of open channels
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    /// Whether no channel is open
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a channel for this pair is open
    #[must_use]
    pub fn contains(&self, protocol: Protocol, destination: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&Self::key(protocol, destination))
            .is_some_and(|slot| slot.initialized())
    }
}

impl std::fmt::Debug for ChannelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCache")
            .field("factories", &self.factories)
            .field("open", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RemoteRequest, RemoteResponse};
    use clio_core::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct NullChannel;

    #[async_trait]
    impl Channel for NullChannel {
        async fn request(&self, request: RemoteRequest) -> CoreResult<RemoteResponse> {
            Ok(RemoteResponse::value(request.request_id, Value::Null))
        }

        fn protocol(&self) -> Protocol {
            Protocol::Tcp
        }
    }

    #[derive(Default)]
    struct CountingConnector {
        attempts: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(
            &self,
            _key: &str,
            _protocol: Protocol,
            _destination: &str,
        ) -> CoreResult<Arc<dyn Channel>> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail_first && attempt == 0 {
                return Err(CoreError::transport("refused"));
            }
            Ok(Arc::new(NullChannel))
        }
    }

    fn cache_with(connector: Arc<CountingConnector>) -> ChannelCache {
        ChannelCache::new(TransportFactories::new().with(Protocol::Tcp, connector))
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_channel() {
        let connector = Arc::new(CountingConnector::default());
        let cache = cache_with(Arc::clone(&connector));

        let (a, b) = tokio::join!(
            cache.get_channel("tcp", "localhost:9000"),
            cache.get_channel("tcp", "localhost:9000"),
        );
        let (a, b) = (a.ok().unwrap(), b.ok().unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(Protocol::Tcp, "localhost:9000"));
    }

    #[tokio::test]
    async fn test_distinct_destinations_get_distinct_channels() {
        let connector = Arc::new(CountingConnector::default());
        let cache = cache_with(Arc::clone(&connector));

        let a = cache.get_channel("tcp", "a:1").await.ok().unwrap();
        let b = cache.get_channel("tcp", "b:1").await.ok().unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_protocol() {
        let connector = Arc::new(CountingConnector::default());
        let cache = cache_with(Arc::clone(&connector));
        let err = cache.get_channel("ws", "x").await.err().unwrap();
        assert_eq!(
            err,
            CoreError::UnknownProtocol {
                protocol: "ws".to_string()
            }
        );
        // Known protocol with no connector installed
        let err = cache.get_channel("ipc", "/tmp/x").await.err().unwrap();
        assert!(matches!(err, CoreError::UnknownProtocol { .. }));
        assert!(cache.is_empty());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_connect_is_retried() {
        let connector = Arc::new(CountingConnector {
            fail_first: true,
            ..Default::default()
        });
        let cache = cache_with(Arc::clone(&connector));

        assert!(cache.get_channel("tcp", "h:1").await.is_err());
        assert!(!cache.contains(Protocol::Tcp, "h:1"));
        assert!(cache.get_channel("tcp", "h:1").await.is_ok());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_no_slot() {
        let connector = Arc::new(CountingConnector {
            fail_first: true,
            ..Default::default()
        });
        let cache = cache_with(Arc::clone(&connector));

        assert!(cache.get_channel("tcp", "down:1").await.is_err());
        assert!(cache.entries.lock().unwrap().is_empty());

        assert!(cache.get_channel("tcp", "up:1").await.is_ok());
        assert_eq!(cache.entries.lock().unwrap().len(), 1);
    }
}
