//! Dispatcher: the main-side aggregator of a worker pool.
//!
//! Collects registrations announced by workers, routes calls for a name to
//! one of the workers that registered it (round-robin), answers listings, and
//! tracks which workers have signalled ready.

use crate::barrier::ReadinessBarrier;
use crate::protocol::{RemoteRequest, RemoteResponse, RequestKind};
use crate::transport::thread::ThreadTransport;
use crate::transport::{RequestHandler, TransportError};
use crate::worker::{PendingRequest, WorkerCommand, WorkerEvent, WorkerHandle};
use async_trait::async_trait;
use clio_core::{CoreError, CoreResult, Value, WorkerId};
use indexmap::IndexMap;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct WorkerSlot {
    index: usize,
    name: String,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    thread: Option<std::thread::JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct Readiness {
    ready: HashSet<WorkerId>,
    barriers: Vec<Arc<ReadinessBarrier>>,
}

/// Dispatcher
#[derive(Debug, Default)]
pub struct Dispatcher {
    workers: RwLock<IndexMap<WorkerId, WorkerSlot>>,
    routes: RwLock<IndexMap<String, Vec<WorkerId>>>,
    readiness: Mutex<Readiness>,
    cursor: AtomicUsize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Create a dispatcher with no workers
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take over the workers and client requests of a thread transport
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the transport is already attached elsewhere.
    pub fn add_transport(self: &Arc<Self>, transport: &ThreadTransport) -> CoreResult<()> {
        let (sink, mut late_workers) = mpsc::unbounded_channel();
        let attachment = transport.attach(sink)?;
        for worker in attachment.workers {
            self.add_worker(worker);
        }

        let dispatcher = Arc::clone(self);
        let adopt = tokio::spawn(async move {
            while let Some(worker) = late_workers.recv().await {
                dispatcher.add_worker(worker);
            }
        });

        let dispatcher = Arc::clone(self);
        let mut requests = attachment.requests;
        let serve = tokio::spawn(async move {
            while let Some(pending) = requests.recv().await {
                dispatcher.answer(pending);
            }
        });

        self.track_tasks([adopt, serve]);
        Ok(())
    }

    /// Adopt one worker and start pumping its events
    pub fn add_worker(self: &Arc<Self>, worker: WorkerHandle) {
        let WorkerHandle {
            id,
            index,
            name,
            commands,
            mut events,
            thread,
        } = worker;

        self.workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                WorkerSlot {
                    index,
                    name,
                    commands,
                    thread: Some(thread),
                },
            );
        debug!(worker = %id, index, "Worker added");

        let dispatcher = Arc::clone(self);
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    WorkerEvent::Registered { path } => dispatcher.add_route(path, id),
                    WorkerEvent::Ready => dispatcher.mark_ready(id),
                    WorkerEvent::Failed { reason } => {
                        warn!(worker = %id, reason = %reason, "Worker failed before ready");
                    }
                    WorkerEvent::Request(pending) => dispatcher.answer(pending),
                }
            }
            dispatcher.drop_routes(id);
        });
        self.track_tasks([pump]);
    }

    /// Resolve once `count` distinct workers have signalled ready
    ///
    /// Workers already ready when this is called count toward the target.
    pub fn expect_workers(&self, count: usize) -> impl Future<Output = ()> + Send + use<> {
        let barrier = Arc::new(ReadinessBarrier::new(count));
        {
            let mut readiness = self.readiness.lock().unwrap_or_else(PoisonError::into_inner);
            for id in &readiness.ready {
                barrier.observe(*id);
            }
            if !barrier.is_ready() {
                readiness.barriers.push(Arc::clone(&barrier));
            }
        }
        async move { barrier.wait().await }
    }

    /// Workers adopted so far
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Workers that have signalled ready
    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.readiness
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ready
            .len()
    }

    /// Every routable name, in first-registration order
    #[must_use]
    pub fn functions(&self) -> Vec<String> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, workers)| !workers.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Workers registered under `name`
    #[must_use]
    pub fn route_count(&self, name: &str) -> usize {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map_or(0, Vec::len)
    }

    /// Route a call to a worker that registered `name`
    ///
    /// # Errors
    ///
    /// `UnknownFunction` if no worker registered the name, `Transport` if
    /// the chosen worker is gone, or whatever the function fails with.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> CoreResult<Value> {
        self.handle(RemoteRequest::call(name, args))
            .await
            .into_value()
    }

    /// Stop every worker and wait for the threads that reached ready
    pub async fn shutdown(&self) {
        let slots: Vec<(WorkerId, WorkerSlot)> = self
            .workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let ready = self
            .readiness
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ready
            .clone();

        for (id, mut slot) in slots {
            let _ = slot.commands.send(WorkerCommand::Shutdown);
            let Some(thread) = slot.thread.take() else {
                continue;
            };
            if !ready.contains(&id) {
                // A worker still inside its workload never reads the command
                warn!(worker = %id, name = %slot.name, "Detaching worker that never became ready");
                continue;
            }
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => debug!(worker = %id, index = slot.index, "Worker joined"),
                _ => warn!(worker = %id, "Worker thread panicked"),
            }
        }

        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        info!("Dispatcher shut down");
    }

    fn track_tasks(&self, handles: impl IntoIterator<Item = JoinHandle<()>>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);
    }

    fn add_route(&self, path: String, worker: WorkerId) {
        debug!(worker = %worker, path = %path, "Function registered");
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        let workers = routes.entry(path).or_default();
        if !workers.contains(&worker) {
            workers.push(worker);
        }
    }

    fn drop_routes(&self, worker: WorkerId) {
        for workers in self
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .values_mut()
        {
            workers.retain(|id| *id != worker);
        }
        self.workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .shift_remove(&worker);
        debug!(worker = %worker, "Worker gone");
    }

    fn mark_ready(&self, worker: WorkerId) {
        let mut readiness = self.readiness.lock().unwrap_or_else(PoisonError::into_inner);
        readiness.ready.insert(worker);
        readiness.barriers.retain(|barrier| !barrier.observe(worker));
        debug!(worker = %worker, ready = readiness.ready.len(), "Worker ready");
    }

    fn pick(&self, name: &str) -> Option<mpsc::UnboundedSender<WorkerCommand>> {
        let target = {
            let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
            let workers = routes.get(name).filter(|w| !w.is_empty())?;
            workers[self.cursor.fetch_add(1, Ordering::Relaxed) % workers.len()]
        };
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&target)
            .map(|slot| slot.commands.clone())
    }

    fn answer(self: &Arc<Self>, pending: PendingRequest) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let PendingRequest { request, reply } = pending;
            let _ = reply.send(dispatcher.handle(request).await);
        });
    }

    async fn route(&self, request: RemoteRequest, name: String) -> RemoteResponse {
        let request_id = request.request_id;
        let Some(worker) = self.pick(&name) else {
            return RemoteResponse::error(request_id, CoreError::UnknownFunction { name });
        };
        let (pending, rx) = PendingRequest::new(request);
        if worker.send(WorkerCommand::Request(pending)).is_err() {
            return RemoteResponse::error(request_id, TransportError::Closed.into());
        }
        rx.await
            .unwrap_or_else(|_| RemoteResponse::error(request_id, TransportError::Closed.into()))
    }
}

#[async_trait]
impl RequestHandler for Dispatcher {
    async fn handle(&self, request: RemoteRequest) -> RemoteResponse {
        match &request.kind {
            RequestKind::Call { name, .. } => {
                let name = name.clone();
                self.route(request, name).await
            }
            RequestKind::List { path } => {
                let names = self
                    .functions()
                    .into_iter()
                    .filter(|name| name.starts_with(path.as_str()))
                    .collect();
                RemoteResponse::names(request.request_id, names)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Executor, Registrar, RpcExecutor};
    use crate::transport::Channel;
    use crate::worker::{WorkerEndpoint, Workload};
    use clio_core::{BoxFuture, Function};
    use serde_json::json;
    use std::time::Duration;

    fn tagging_workload() -> Workload {
        Arc::new(|endpoint: WorkerEndpoint| -> BoxFuture<CoreResult<()>> {
            Box::pin(async move {
                let index = endpoint.index();
                endpoint.register(
                    "math/whoami",
                    Function::sync(move |_| Ok(json!(index))),
                )?;
                endpoint.register(
                    "math/add",
                    Function::sync(|args| {
                        Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
                    }),
                )
            })
        })
    }

    async fn pool(count: usize, workload: Workload) -> (Arc<Dispatcher>, ThreadTransport) {
        let transport = ThreadTransport::new();
        transport
            .spawn_workers(count, "clio-test-worker", &workload)
            .unwrap();
        let dispatcher = Dispatcher::new();
        dispatcher.add_transport(&transport).unwrap();
        tokio::time::timeout(Duration::from_secs(5), dispatcher.expect_workers(count))
            .await
            .unwrap();
        (dispatcher, transport)
    }

    #[tokio::test]
    async fn test_round_robin_across_workers() {
        let (dispatcher, _transport) = pool(2, tagging_workload()).await;
        assert_eq!(dispatcher.ready_count(), 2);
        assert_eq!(dispatcher.route_count("math/whoami"), 2);

        let mut seen = HashSet::new();
        for _ in 0..4 {
            let out = dispatcher.call("math/whoami", vec![]).await.unwrap();
            seen.insert(out.as_u64().unwrap());
        }
        assert_eq!(seen.len(), 2);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_client_channel_calls_through_dispatcher() {
        let (dispatcher, transport) = pool(1, tagging_workload()).await;
        let executor = RpcExecutor::new(Arc::new(transport.get_transport()) as Arc<dyn Channel>);

        let sum = executor
            .call("math/add", vec![json!(2), json!(3)])
            .await
            .unwrap();
        assert_eq!(sum, json!(5));

        let names = executor.list("math/").await.unwrap();
        assert_eq!(names, vec!["math/whoami".to_string(), "math/add".to_string()]);
        assert!(executor.list("text/").await.unwrap().is_empty());
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_function() {
        let (dispatcher, _transport) = pool(1, tagging_workload()).await;
        let err = dispatcher.call("nope", vec![]).await.unwrap_err();
        assert_eq!(
            err,
            CoreError::UnknownFunction {
                name: "nope".to_string()
            }
        );
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_can_call_through_main() {
        // Worker 0 registers `base`; worker 1 calls it from inside `twice`
        let workload: Workload = Arc::new(|endpoint: WorkerEndpoint| -> BoxFuture<CoreResult<()>> {
            Box::pin(async move {
                if endpoint.index() == 0 {
                    endpoint.register("base", Function::sync(|_| Ok(json!(21))))
                } else {
                    let remote = endpoint.clone();
                    endpoint.register(
                        "twice",
                        Function::new(move |_| {
                            let remote = remote.clone();
                            async move {
                                let base = remote.call("base", vec![]).await?;
                                Ok(json!(base.as_i64().unwrap_or(0) * 2))
                            }
                        }),
                    )
                }
            })
        });
        let (dispatcher, _transport) = pool(2, workload).await;
        assert_eq!(dispatcher.call("twice", vec![]).await.unwrap(), json!(42));
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_worker_stalls_barrier() {
        let workload: Workload = Arc::new(|endpoint: WorkerEndpoint| -> BoxFuture<CoreResult<()>> {
            Box::pin(async move {
                if endpoint.index() == 1 {
                    return Err(CoreError::execution("module failed to load"));
                }
                Ok(())
            })
        });
        let transport = ThreadTransport::new();
        transport.spawn_workers(2, "clio-test-worker", &workload).unwrap();
        let dispatcher = Dispatcher::new();
        dispatcher.add_transport(&transport).unwrap();

        let stalled =
            tokio::time::timeout(Duration::from_millis(200), dispatcher.expect_workers(2)).await;
        assert!(stalled.is_err());
        assert_eq!(dispatcher.ready_count(), 1);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_late_expectation_counts_ready_workers() {
        let (dispatcher, _transport) = pool(2, tagging_workload()).await;
        tokio::time::timeout(Duration::from_millis(100), dispatcher.expect_workers(2))
            .await
            .unwrap();
        dispatcher.shutdown().await;
        assert_eq!(dispatcher.worker_count(), 0);
    }
}
