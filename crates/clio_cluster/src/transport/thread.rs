//! In-process transport between the main side and worker threads.
//!
//! Workers are added to a [`ThreadTransport`] and handed to the dispatcher
//! once it attaches. Client requests from the main side go through a
//! [`ThreadClient`], which the dispatcher answers.

use super::{Channel, Protocol, TransportError};
use crate::cache::Connector;
use crate::protocol::{RemoteRequest, RemoteResponse};
use crate::worker::{PendingRequest, WorkerHandle, Workload};
use async_trait::async_trait;
use clio_core::{CoreError, CoreResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

/// What the dispatcher receives when it attaches to a transport
#[derive(Debug)]
pub(crate) struct Attachment {
    pub(crate) workers: Vec<WorkerHandle>,
    pub(crate) requests: mpsc::UnboundedReceiver<PendingRequest>,
}

#[derive(Debug)]
struct TransportState {
    pending: Vec<WorkerHandle>,
    requests: Option<mpsc::UnboundedReceiver<PendingRequest>>,
    sink: Option<mpsc::UnboundedSender<WorkerHandle>>,
    added: usize,
}

/// Thread transport
#[derive(Debug)]
pub struct ThreadTransport {
    requests: mpsc::UnboundedSender<PendingRequest>,
    state: Mutex<TransportState>,
}

impl ThreadTransport {
    /// Create an empty transport
    #[must_use]
    pub fn new() -> Self {
        let (requests, requests_rx) = mpsc::unbounded_channel();
        Self {
            requests,
            state: Mutex::new(TransportState {
                pending: Vec::new(),
                requests: Some(requests_rx),
                sink: None,
                added: 0,
            }),
        }
    }

    /// Add a worker. Before attachment it is queued.
    pub fn add_worker(&self, worker: WorkerHandle) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.added += 1;
        let worker = match &state.sink {
            Some(sink) => match sink.send(worker) {
                Ok(()) => return,
                Err(mpsc::error::SendError(worker)) => worker,
            },
            None => worker,
        };
        state.pending.push(worker);
    }

    /// Spawn `count` workers named `{prefix}-{index}` running `workload`
    ///
    /// # Errors
    ///
    /// Returns error if a thread cannot be spawned. Workers spawned before
    /// the failure stay added.
    pub fn spawn_workers(&self, count: usize, prefix: &str, workload: &Workload) -> CoreResult<()> {
        for index in 0..count {
            let worker = WorkerHandle::spawn(index, format!("{prefix}-{index}"), Arc::clone(workload))?;
            self.add_worker(worker);
        }
        debug!(count, prefix, "Spawned worker pool");
        Ok(())
    }

    /// Workers added so far
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .added
    }

    /// Client channel for the main side
    #[must_use]
    pub fn get_transport(&self) -> ThreadClient {
        ThreadClient {
            requests: self.requests.clone(),
        }
    }

    pub(crate) fn attach(
        &self,
        sink: mpsc::UnboundedSender<WorkerHandle>,
    ) -> CoreResult<Attachment> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let requests = state.requests.take().ok_or_else(|| CoreError::Validation {
            field: "transport".to_string(),
            reason: "already attached to a dispatcher".to_string(),
        })?;
        state.sink = Some(sink);
        Ok(Attachment {
            workers: std::mem::take(&mut state.pending),
            requests,
        })
    }
}

impl Default for ThreadTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Main-side client of a thread transport
#[derive(Debug, Clone)]
pub struct ThreadClient {
    requests: mpsc::UnboundedSender<PendingRequest>,
}

#[async_trait]
impl Channel for ThreadClient {
    async fn request(&self, request: RemoteRequest) -> CoreResult<RemoteResponse> {
        let (pending, rx) = PendingRequest::new(request);
        self.requests
            .send(pending)
            .map_err(|_| TransportError::Closed)?;
        Ok(rx.await.map_err(|_| TransportError::Closed)?)
    }

    fn protocol(&self) -> Protocol {
        Protocol::Thread
    }
}

/// Connector resolving `thread` destinations to named in-process pools
#[derive(Debug, Default)]
pub struct ThreadConnector {
    pools: RwLock<HashMap<String, ThreadClient>>,
}

impl ThreadConnector {
    /// Create a connector with no pools
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: expose `client` under `name`
    #[must_use]
    pub fn with_pool(self, name: impl Into<String>, client: ThreadClient) -> Self {
        self.add_pool(name, client);
        self
    }

    /// Expose `client` under `name`
    pub fn add_pool(&self, name: impl Into<String>, client: ThreadClient) {
        self.pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), client);
    }
}

#[async_trait]
impl Connector for ThreadConnector {
    async fn connect(
        &self,
        key: &str,
        _protocol: Protocol,
        destination: &str,
    ) -> CoreResult<Arc<dyn Channel>> {
        let client = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(destination)
            .cloned()
            .ok_or_else(|| CoreError::NotFound {
                kind: "Worker pool".to_string(),
                id: destination.to_string(),
            })?;
        debug!(key, "Connected to worker pool");
        Ok(Arc::new(client))
    }
}
