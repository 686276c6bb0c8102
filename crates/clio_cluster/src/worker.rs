//! Worker threads.
//!
//! Each worker is a named OS thread driving its own current-thread tokio
//! runtime. It runs its workload (normally the user module in worker role),
//! signals ready, then serves calls routed to it by the dispatcher until told
//! to shut down. Everything it sends back to the main side travels as a
//! [`WorkerEvent`].

use crate::executor::{Executor, Registrar};
use crate::protocol::{RemoteRequest, RemoteResponse, RequestKind};
use crate::transport::{RequestHandler, TransportError};
use async_trait::async_trait;
use clio_core::{BoxFuture, CoreError, CoreResult, Function, Value, WorkerId};
use indexmap::IndexMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

/// Code a worker runs before it signals ready
pub type Workload = Arc<dyn Fn(WorkerEndpoint) -> BoxFuture<CoreResult<()>> + Send + Sync>;

/// A request paired with the slot its response goes to
#[derive(Debug)]
pub struct PendingRequest {
    /// The request
    pub request: RemoteRequest,
    /// Where the response goes
    pub reply: oneshot::Sender<RemoteResponse>,
}

impl PendingRequest {
    /// Pair a request with a fresh reply slot
    #[must_use]
    pub fn new(request: RemoteRequest) -> (Self, oneshot::Receiver<RemoteResponse>) {
        let (reply, rx) = oneshot::channel();
        (Self { request, reply }, rx)
    }

    /// Deliver the response; a caller that gave up is ignored
    pub fn respond(self, response: RemoteResponse) {
        let _ = self.reply.send(response);
    }
}

/// Main side to worker
#[derive(Debug)]
pub enum WorkerCommand {
    /// Serve a call or listing against the worker's registrations
    Request(PendingRequest),
    /// Stop serving and let the thread exit
    Shutdown,
}

/// Worker to main side
#[derive(Debug)]
pub enum WorkerEvent {
    /// A function was registered under `path`
    Registered {
        /// Registered name
        path: String,
    },
    /// The workload completed
    Ready,
    /// The workload failed; the worker will never be ready
    Failed {
        /// Failure message
        reason: String,
    },
    /// A name lookup the worker needs the main side to route
    Request(PendingRequest),
}

/// Worker-side view of the channel to the main side
#[derive(Clone)]
pub struct WorkerEndpoint {
    id: WorkerId,
    index: usize,
    functions: Arc<RwLock<IndexMap<String, Function>>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl WorkerEndpoint {
    fn new(id: WorkerId, index: usize, events: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Self {
            id,
            index,
            functions: Arc::new(RwLock::new(IndexMap::new())),
            events,
        }
    }

    /// Worker id
    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Position of this worker in its pool
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Names this worker serves
    #[must_use]
    pub fn function_names(&self) -> Vec<String> {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn emit(&self, event: WorkerEvent) -> CoreResult<()> {
        self.events
            .send(event)
            .map_err(|_| TransportError::Closed.into())
    }

    /// Signal that the workload completed
    ///
    /// # Errors
    ///
    /// Returns error if the main side is gone.
    pub fn ready(&self) -> CoreResult<()> {
        self.emit(WorkerEvent::Ready)
    }

    fn fail(&self, reason: String) {
        let _ = self.emit(WorkerEvent::Failed { reason });
    }

    fn lookup(&self, name: &str) -> Option<Function> {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Serve routed calls until shutdown or until the main side drops
    pub async fn serve(&self, mut commands: mpsc::UnboundedReceiver<WorkerCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                WorkerCommand::Request(PendingRequest { request, reply }) => {
                    let endpoint = self.clone();
                    tokio::spawn(async move {
                        let _ = reply.send(endpoint.handle(request).await);
                    });
                }
                WorkerCommand::Shutdown => {
                    debug!(worker = %self.id, "Shutdown received");
                    break;
                }
            }
        }
        // Registered functions may hold proxies back to this endpoint
        self.functions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Registrar for WorkerEndpoint {
    fn register(&self, path: &str, function: Function) -> CoreResult<()> {
        self.functions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string(), function);
        self.emit(WorkerEvent::Registered {
            path: path.to_string(),
        })
    }
}

impl WorkerEndpoint {
    async fn forward(&self, request: RemoteRequest) -> CoreResult<RemoteResponse> {
        let (pending, rx) = PendingRequest::new(request);
        self.emit(WorkerEvent::Request(pending))?;
        rx.await.map_err(|_| TransportError::Closed.into())
    }
}

#[async_trait]
impl Executor for WorkerEndpoint {
    async fn call(&self, name: &str, args: Vec<Value>) -> CoreResult<Value> {
        self.forward(RemoteRequest::call(name, args))
            .await?
            .into_value()
    }

    async fn list(&self, path: &str) -> CoreResult<Vec<String>> {
        self.forward(RemoteRequest::list(path)).await?.into_names()
    }
}

#[async_trait]
impl RequestHandler for WorkerEndpoint {
    async fn handle(&self, request: RemoteRequest) -> RemoteResponse {
        let request_id = request.request_id;
        match request.kind {
            RequestKind::Call { name, args } => match self.lookup(&name) {
                Some(function) => RemoteResponse::from_result(request_id, function.call(args).await),
                None => RemoteResponse::error(request_id, CoreError::UnknownFunction { name }),
            },
            RequestKind::List { path } => {
                let names = self
                    .function_names()
                    .into_iter()
                    .filter(|name| name.starts_with(&path))
                    .collect();
                RemoteResponse::names(request_id, names)
            }
        }
    }
}

impl std::fmt::Debug for WorkerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerEndpoint")
            .field("id", &self.id)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// Main-side handle to a spawned worker thread
#[derive(Debug)]
pub struct WorkerHandle {
    pub(crate) id: WorkerId,
    pub(crate) index: usize,
    pub(crate) name: String,
    pub(crate) commands: mpsc::UnboundedSender<WorkerCommand>,
    pub(crate) events: mpsc::UnboundedReceiver<WorkerEvent>,
    pub(crate) thread: std::thread::JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawn a worker thread named `name` running `workload`
    ///
    /// # Errors
    ///
    /// Returns error if the OS refuses to create the thread.
    pub fn spawn(index: usize, name: impl Into<String>, workload: Workload) -> CoreResult<Self> {
        let id = WorkerId::new();
        let name = name.into();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let endpoint = WorkerEndpoint::new(id, index, event_tx);

        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_main(endpoint, command_rx, workload))
            .map_err(|err| spawn_error(&name, &err))?;

        info!(worker = %id, name = %name, "Spawned worker thread");

        Ok(Self {
            id,
            index,
            name,
            commands,
            events,
            thread,
        })
    }

    /// Worker id
    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Position in the pool
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Thread name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn worker_main(
    endpoint: WorkerEndpoint,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    workload: Workload,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(worker = %endpoint.id, error = %err, "Failed to start worker runtime");
            endpoint.fail(err.to_string());
            return;
        }
    };

    runtime.block_on(async move {
        if let Err(err) = workload(endpoint.clone()).await {
            error!(worker = %endpoint.id, error = %err, "Worker workload failed");
            endpoint.fail(err.to_string());
            return;
        }
        if endpoint.ready().is_err() {
            return;
        }
        debug!(worker = %endpoint.id, "Worker ready");
        endpoint.serve(commands).await;
    });
}

fn spawn_error(name: &str, err: &std::io::Error) -> CoreError {
    CoreError::internal(format!("cannot spawn worker thread {name}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doubling_workload() -> Workload {
        Arc::new(|endpoint: WorkerEndpoint| -> BoxFuture<CoreResult<()>> {
            Box::pin(async move {
                endpoint.register(
                    "double",
                    Function::sync(|args| {
                        let n = args.first().and_then(Value::as_i64).unwrap_or(0);
                        Ok(json!(n * 2))
                    }),
                )
            })
        })
    }

    #[tokio::test]
    async fn test_worker_registers_then_ready() {
        let mut handle = WorkerHandle::spawn(0, "clio-worker-test", doubling_workload()).unwrap();
        assert!(matches!(
            handle.events.recv().await,
            Some(WorkerEvent::Registered { path }) if path == "double"
        ));
        assert!(matches!(handle.events.recv().await, Some(WorkerEvent::Ready)));

        let (pending, rx) = PendingRequest::new(RemoteRequest::call("double", vec![json!(4)]));
        handle.commands.send(WorkerCommand::Request(pending)).unwrap();
        assert_eq!(rx.await.unwrap().into_value().unwrap(), json!(8));

        handle.commands.send(WorkerCommand::Shutdown).unwrap();
        tokio::task::spawn_blocking(move || handle.thread.join())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_worker_unknown_function() {
        let mut handle = WorkerHandle::spawn(1, "clio-worker-test", doubling_workload()).unwrap();
        while !matches!(handle.events.recv().await, Some(WorkerEvent::Ready)) {}

        let (pending, rx) = PendingRequest::new(RemoteRequest::call("triple", vec![]));
        handle.commands.send(WorkerCommand::Request(pending)).unwrap();
        let err = rx.await.unwrap().into_value().unwrap_err();
        assert_eq!(
            err,
            CoreError::UnknownFunction {
                name: "triple".to_string()
            }
        );
        handle.commands.send(WorkerCommand::Shutdown).unwrap();
    }

    #[tokio::test]
    async fn test_failed_workload_never_ready() {
        let workload: Workload = Arc::new(|_endpoint| -> BoxFuture<CoreResult<()>> {
            Box::pin(async { Err(CoreError::execution("boom")) })
        });
        let mut handle = WorkerHandle::spawn(0, "clio-worker-test", workload).unwrap();
        assert!(matches!(
            handle.events.recv().await,
            Some(WorkerEvent::Failed { reason }) if reason.contains("boom")
        ));
        // Thread ends, so the event stream closes without a Ready
        assert!(handle.events.recv().await.is_none());
    }

    #[test]
    fn test_spawn_failure_is_internal() {
        let err = spawn_error("clio-worker-3", &std::io::Error::other("thread limit"));
        assert_eq!(
            err,
            CoreError::internal("cannot spawn worker thread clio-worker-3: thread limit")
        );
        assert!(err.to_string().starts_with("Internal error"));
    }
}
