//! Lifecycle monitor.
//!
//! Gates process exit on outstanding asynchronous work. Every operation the
//! runtime initiates is wrapped in a begin/end pair. Shutdown is two-phase:
//! [`LifecycleMonitor::freeze`] snapshots the active set, anticipated
//! teardown work runs, then [`LifecycleMonitor::request_exit`] arms the exit
//! condition. The exit handler fires once every active operation was already
//! active at freeze time.

use clio_core::OperationId;
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Kind of a tracked operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Awaiting a module entry point result
    Entry,
    /// Remote function call
    RemoteCall,
    /// Channel creation
    Connect,
    /// Worker readiness handshake
    Handshake,
    /// Timer
    Timer,
    /// Scheduler-internal bookkeeping
    PromiseInternal,
    /// Anything else
    Custom(&'static str),
}

impl OperationKind {
    /// Kinds that are never tracked
    pub const EXCLUDED: [OperationKind; 2] = [OperationKind::Timer, OperationKind::PromiseInternal];

    /// Whether this kind is on the exclude list
    #[must_use]
    pub fn is_excluded(&self) -> bool {
        Self::EXCLUDED.contains(self)
    }
}

/// Called once when the exit condition is met
pub trait ExitHandler: Send + Sync {
    /// Terminate with `code`
    fn exit(&self, code: i32);
}

/// Exits the process
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExit;

impl ExitHandler for ProcessExit {
    fn exit(&self, code: i32) {
        std::process::exit(code);
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    active: HashMap<OperationId, OperationKind>,
    frozen: HashSet<OperationId>,
    has_frozen: bool,
    should_exit: bool,
    exited: bool,
    late: u64,
}

impl MonitorState {
    fn exit_ready(&self) -> bool {
        self.should_exit && !self.exited && self.active.keys().all(|id| self.frozen.contains(id))
    }
}

static GLOBAL: Lazy<Arc<LifecycleMonitor>> =
    Lazy::new(|| LifecycleMonitor::new(Arc::new(ProcessExit)));

/// Lifecycle monitor
pub struct LifecycleMonitor {
    enabled: bool,
    next_id: AtomicU64,
    state: Mutex<MonitorState>,
    handler: Arc<dyn ExitHandler>,
    exit_signal: watch::Sender<bool>,
}

impl LifecycleMonitor {
    /// Create a monitor that calls `handler` on exit
    #[must_use]
    pub fn new(handler: Arc<dyn ExitHandler>) -> Arc<Self> {
        Arc::new(Self::build(true, handler))
    }

    /// A monitor that tracks nothing and never triggers exit
    ///
    /// Used when the host has no way to observe its own lifecycle.
    #[must_use]
    pub fn disabled() -> Arc<Self> {
        Arc::new(Self::build(false, Arc::new(ProcessExit)))
    }

    /// Process-wide monitor
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    fn build(enabled: bool, handler: Arc<dyn ExitHandler>) -> Self {
        let (exit_signal, _) = watch::channel(false);
        Self {
            enabled,
            next_id: AtomicU64::new(1),
            state: Mutex::new(MonitorState::default()),
            handler,
            exit_signal,
        }
    }

    /// Whether this monitor tracks anything
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Begin tracking an operation; it ends when the guard completes or drops
    pub fn begin(self: &Arc<Self>, kind: OperationKind) -> OperationGuard {
        if !self.enabled || kind.is_excluded() {
            return OperationGuard {
                monitor: None,
                id: None,
            };
        }

        let id = OperationId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut state = self.lock();
        state.active.insert(id, kind);
        if state.has_frozen {
            state.late += 1;
            warn!(operation = %id, kind = ?kind, "Operation started after freeze");
        }
        drop(state);

        OperationGuard {
            monitor: Some(Arc::clone(self)),
            id: Some(id),
        }
    }

    /// Track `future` as one operation of `kind`
    ///
    /// Tracking starts now, not on first poll.
    pub fn track<F>(self: &Arc<Self>, kind: OperationKind, future: F) -> impl Future<Output = F::Output> + use<F>
    where
        F: Future,
    {
        let guard = self.begin(kind);
        async move {
            let output = future.await;
            guard.complete();
            output
        }
    }

    /// Snapshot the active set. Each call replaces the previous snapshot.
    pub fn freeze(&self) {
        if !self.enabled {
            return;
        }
        let mut state = self.lock();
        state.frozen = state.active.keys().copied().collect();
        state.has_frozen = true;
        debug!(frozen = state.frozen.len(), "Monitor frozen");
    }

    /// Arm the exit condition and evaluate it immediately
    pub fn request_exit(&self) {
        if !self.enabled {
            return;
        }
        let mut state = self.lock();
        state.should_exit = true;
        self.evaluate(state);
    }

    /// Operations currently tracked
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    /// Size of the last freeze snapshot
    #[must_use]
    pub fn frozen_count(&self) -> usize {
        self.lock().frozen.len()
    }

    /// Operations begun after the first freeze
    #[must_use]
    pub fn late_operations(&self) -> u64 {
        self.lock().late
    }

    /// Whether the exit handler has fired
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.lock().exited
    }

    /// Wait until the exit handler has fired
    ///
    /// Never resolves on a disabled monitor.
    pub async fn wait_exit(&self) {
        let mut rx = self.exit_signal.subscribe();
        let _ = rx.wait_for(|exited| *exited).await;
    }

    fn end(&self, id: OperationId) {
        let mut state = self.lock();
        if state.active.remove(&id).is_none() {
            return;
        }
        self.evaluate(state);
    }

    fn evaluate(&self, mut state: std::sync::MutexGuard<'_, MonitorState>) {
        if !state.exit_ready() {
            return;
        }
        state.exited = true;
        drop(state);

        info!("No outstanding work, exiting");
        self.exit_signal.send_replace(true);
        self.handler.exit(0);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for LifecycleMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleMonitor")
            .field("enabled", &self.enabled)
            .field("state", &*self.lock())
            .finish_non_exhaustive()
    }
}

/// Ends its operation when completed or dropped
#[derive(Debug)]
#[must_use = "dropping the guard ends the operation immediately"]
pub struct OperationGuard {
    monitor: Option<Arc<LifecycleMonitor>>,
    id: Option<OperationId>,
}

impl OperationGuard {
    /// Id of the tracked operation; `None` when not tracked
    #[must_use]
    pub fn id(&self) -> Option<OperationId> {
        self.id
    }

    /// End the operation
    pub fn complete(self) {
        drop(self);
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        if let (Some(monitor), Some(id)) = (self.monitor.take(), self.id.take()) {
            monitor.end(id);
        }
    }
}
