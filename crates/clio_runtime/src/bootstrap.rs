//! Runtime bootstrap.
//!
//! [`run`] builds the execution context for one role, loads the module
//! against it and, in main role, drives its entry point. [`import_module`]
//! spawns a worker pool that runs the module in worker role, waits for every
//! worker to become ready, then loads the module once more in main role with
//! its registry routed through the pool.

use crate::config::RuntimeConfig;
use crate::context::{Builtins, ExecutionContext};
use crate::module::{EntryPoint, MainOutput, Module, ModuleExports, ModuleLoader, RunOutcome};
use crate::monitor::{LifecycleMonitor, OperationKind};
use crate::registry::{Distributed, Role, RoleBinding};
use clio_cluster::{
    Dispatcher, Executor, Protocol, Registrar, RpcExecutor, ThreadConnector, ThreadTransport,
    TransportFactories, WorkerEndpoint, Workload,
};
use clio_core::{BoxFuture, CoreError, CoreResult, Function};
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, info};

/// Destination name of the imported pool for the `thread` protocol
pub const LOCAL_POOL: &str = "local";

/// Role-specific inputs to [`run`]
#[derive(Clone)]
pub enum RoleInputs {
    /// Main role: names resolve through `executor`
    Main {
        /// Remote resolution
        executor: Arc<dyn Executor>,
    },
    /// Worker role: registrations are announced through `registrar`
    Worker {
        /// Remote resolution
        executor: Arc<dyn Executor>,
        /// Announces registrations to the main side
        registrar: Arc<dyn Registrar>,
    },
}

impl RoleInputs {
    fn into_binding(self) -> RoleBinding {
        match self {
            Self::Main { executor } => RoleBinding::main(executor),
            Self::Worker {
                executor,
                registrar,
            } => RoleBinding::worker(executor, registrar),
        }
    }
}

/// Options for [`run`]
#[derive(Clone)]
pub struct RunOptions {
    /// Skip invoking `main`
    pub no_main: bool,
    /// Argument vector for `main`, the process arguments unless overridden
    pub argv: Vec<String>,
    /// Builtins merged into the context
    pub builtins: Builtins,
    /// Monitor operations report to
    pub monitor: Arc<LifecycleMonitor>,
    /// Connectors for the registry's channel cache
    pub factories: TransportFactories,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            no_main: false,
            argv: std::env::args().collect(),
            builtins: Builtins::new(),
            monitor: LifecycleMonitor::global(),
            factories: TransportFactories::with_defaults(),
        }
    }
}

impl RunOptions {
    /// Default options
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip `main`
    #[must_use]
    pub fn with_no_main(mut self, no_main: bool) -> Self {
        self.no_main = no_main;
        self
    }

    /// Set the argument vector
    #[must_use]
    pub fn with_argv(mut self, argv: Vec<String>) -> Self {
        self.argv = argv;
        self
    }

    /// Set builtins
    #[must_use]
    pub fn with_builtins(mut self, builtins: Builtins) -> Self {
        self.builtins = builtins;
        self
    }

    /// Use `monitor` instead of the global one
    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<LifecycleMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Set connectors
    #[must_use]
    pub fn with_factories(mut self, factories: TransportFactories) -> Self {
        self.factories = factories;
        self
    }
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("no_main", &self.no_main)
            .field("argv", &self.argv)
            .field("builtins", &self.builtins)
            .field("factories", &self.factories)
            .finish_non_exhaustive()
    }
}

struct Started {
    context: ExecutionContext,
    exports: ModuleExports,
    outcome: Option<RunOutcome>,
}

/// Run `module` in the role given by `inputs`
///
/// Returns the resolved result of `main` in main role, `None` in worker role
/// or when `main` is suppressed.
///
/// # Errors
///
/// Returns error if the module fails to load, if main role has no entry
/// point, or if the entry point fails (the first failure of a sequence).
pub async fn run(
    module: &dyn Module,
    inputs: RoleInputs,
    options: RunOptions,
) -> CoreResult<Option<RunOutcome>> {
    Ok(start(module, inputs, options).await?.outcome)
}

async fn start(module: &dyn Module, inputs: RoleInputs, options: RunOptions) -> CoreResult<Started> {
    let RunOptions {
        no_main,
        argv,
        builtins,
        monitor,
        factories,
    } = options;

    let distributed = Distributed::new(inputs.into_binding(), factories, Arc::clone(&monitor));
    let context = ExecutionContext::new(Arc::new(distributed), builtins);
    debug!(run = %context.run_id(), role = ?context.role(), "Loading module");

    let exports = module.load(&context).await?;

    let outcome = if context.role() == Role::Main && !no_main {
        let main = exports.main.as_ref().ok_or_else(|| CoreError::NotFound {
            kind: "Entry point".to_string(),
            id: "main".to_string(),
        })?;
        Some(invoke_main(main, argv, &monitor).await?)
    } else {
        None
    };

    Ok(Started {
        context,
        exports,
        outcome,
    })
}

async fn invoke_main(
    main: &EntryPoint,
    argv: Vec<String>,
    monitor: &Arc<LifecycleMonitor>,
) -> CoreResult<RunOutcome> {
    match main(argv)? {
        MainOutput::Single(result) => Ok(RunOutcome::Single(
            monitor.track(OperationKind::Entry, result).await?,
        )),
        MainOutput::Sequence(results) => {
            let tracked = results
                .into_iter()
                .map(|result| monitor.track(OperationKind::Entry, result));
            Ok(RunOutcome::Sequence(try_join_all(tracked).await?))
        }
    }
}

/// A module imported into a worker pool
pub struct Imported {
    dispatcher: Arc<Dispatcher>,
    exports: ModuleExports,
    context: ExecutionContext,
    monitor: Arc<LifecycleMonitor>,
    _transport: ThreadTransport,
}

impl Imported {
    /// The pool's aggregator
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Exports of the main-role load
    #[must_use]
    pub fn exports(&self) -> &ModuleExports {
        &self.exports
    }

    /// Main-role context
    #[must_use]
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Exported function, from the module's exports or the context's table
    #[must_use]
    pub fn function(&self, name: &str) -> Option<Function> {
        self.exports
            .function(name)
            .cloned()
            .or_else(|| self.context.exports().get(name).cloned())
    }

    /// Invoke the module's entry point
    ///
    /// # Errors
    ///
    /// `NotFound` if the module has no entry point, otherwise whatever the
    /// entry point fails with.
    pub async fn main(&self, argv: Vec<String>) -> CoreResult<RunOutcome> {
        let main = self.exports.main.as_ref().ok_or_else(|| CoreError::NotFound {
            kind: "Entry point".to_string(),
            id: "main".to_string(),
        })?;
        invoke_main(main, argv, &self.monitor).await
    }

    /// Stop every worker and join their threads
    pub async fn shutdown(self) {
        self.dispatcher.shutdown().await;
    }
}

impl std::fmt::Debug for Imported {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Imported")
            .field("workers", &self.dispatcher.worker_count())
            .field("exports", &self.exports)
            .finish_non_exhaustive()
    }
}

fn worker_workload(entry: &str, loader: Arc<dyn ModuleLoader>, options: RunOptions) -> Workload {
    let entry = entry.to_string();
    Arc::new(move |endpoint: WorkerEndpoint| -> BoxFuture<CoreResult<()>> {
        let entry = entry.clone();
        let loader = Arc::clone(&loader);
        let options = options.clone();
        Box::pin(async move {
            let module = loader.load(&entry)?;
            let endpoint = Arc::new(endpoint);
            let inputs = RoleInputs::Worker {
                executor: endpoint.clone(),
                registrar: endpoint,
            };
            run(module.as_ref(), inputs, options).await.map(|_| ())
        })
    })
}

/// Import `entry` into a fresh worker pool
///
/// Spawns the pool, waits until every worker has loaded the module, then
/// loads it in main role without invoking `main`. There is no timeout: a
/// worker that never becomes ready stalls this call.
///
/// # Errors
///
/// Returns error if the configuration is invalid, the module is unknown to
/// the loader, a worker thread cannot be spawned, the main-role load fails,
/// or a configured server cannot be reached.
pub async fn import_module(
    entry: &str,
    loader: Arc<dyn ModuleLoader>,
    config: &RuntimeConfig,
    options: RunOptions,
) -> CoreResult<Imported> {
    config.validate()?;
    let module = loader.load(entry)?;
    let workers = config.resolved_workers();

    let transport = ThreadTransport::new();
    let dispatcher = Dispatcher::new();
    let workload = worker_workload(entry, loader, options.clone());
    let spawned = transport
        .spawn_workers(workers, &config.worker_thread_prefix, &workload)
        .and_then(|()| dispatcher.add_transport(&transport));
    if let Err(err) = spawned {
        dispatcher.shutdown().await;
        return Err(err);
    }

    info!(entry, workers, "Waiting for workers");
    options
        .monitor
        .track(OperationKind::Handshake, dispatcher.expect_workers(workers))
        .await;
    info!(entry, functions = dispatcher.functions().len(), "Worker pool ready");

    let client = transport.get_transport();
    let factories = options.factories.clone().with(
        Protocol::Thread,
        Arc::new(ThreadConnector::new().with_pool(LOCAL_POOL, client.clone())),
    );
    let executor: Arc<dyn Executor> = Arc::new(RpcExecutor::new(Arc::new(client)));
    let monitor = Arc::clone(&options.monitor);
    let main_options = options.with_factories(factories).with_no_main(true);

    let started = match load_main(module.as_ref(), executor, main_options, config).await {
        Ok(started) => started,
        Err(err) => {
            dispatcher.shutdown().await;
            return Err(err);
        }
    };

    Ok(Imported {
        dispatcher,
        exports: started.exports,
        context: started.context,
        monitor,
        _transport: transport,
    })
}

async fn load_main(
    module: &dyn Module,
    executor: Arc<dyn Executor>,
    options: RunOptions,
    config: &RuntimeConfig,
) -> CoreResult<Started> {
    let started = start(module, RoleInputs::Main { executor }, options).await?;
    for server in &config.servers {
        started
            .context
            .distributed()
            .get_executor(&server.protocol, &server.destination)
            .await?;
        debug!(protocol = %server.protocol, destination = %server.destination, "Server connected");
    }
    Ok(started)
}
