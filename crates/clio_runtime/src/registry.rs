//! Function registry.
//!
//! [`Distributed`] unifies local and remote invocation. `set` binds locally
//! (and, in worker role, announces the binding to the main side); `get` hands
//! back a proxy that resolves the name through the role's executor on every
//! call. The registry also owns the channel cache used to reach other hosts.

use crate::monitor::{LifecycleMonitor, OperationKind};
use clio_cluster::{ChannelCache, Executor, Registrar, RpcExecutor, TransportFactories};
use clio_core::{BoxFuture, Callable, CoreResult, Function, Value};
use indexmap::IndexMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Role of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Owns the entry point and the worker pool
    Main,
    /// Member of a pool; registers functions for the main side
    Worker,
}

/// Main-role adapter: resolves names remotely, registers nothing remotely
#[derive(Clone)]
pub struct MainAdapter {
    executor: Arc<dyn Executor>,
}

/// Worker-role adapter: resolves remotely and announces registrations
#[derive(Clone)]
pub struct WorkerAdapter {
    executor: Arc<dyn Executor>,
    registrar: Arc<dyn Registrar>,
}

/// Role-specific capabilities of a registry
#[derive(Clone)]
pub enum RoleBinding {
    /// Main role
    Main(MainAdapter),
    /// Worker role
    Worker(WorkerAdapter),
}

impl RoleBinding {
    /// Bind the main role
    #[must_use]
    pub fn main(executor: Arc<dyn Executor>) -> Self {
        Self::Main(MainAdapter { executor })
    }

    /// Bind the worker role
    #[must_use]
    pub fn worker(executor: Arc<dyn Executor>, registrar: Arc<dyn Registrar>) -> Self {
        Self::Worker(WorkerAdapter {
            executor,
            registrar,
        })
    }

    /// Role this binding represents
    #[must_use]
    pub fn role(&self) -> Role {
        match self {
            Self::Main(_) => Role::Main,
            Self::Worker(_) => Role::Worker,
        }
    }

    /// Executor used for remote resolution
    #[must_use]
    pub fn executor(&self) -> &Arc<dyn Executor> {
        match self {
            Self::Main(adapter) => &adapter.executor,
            Self::Worker(adapter) => &adapter.executor,
        }
    }

    /// Registrar, only present in worker role
    #[must_use]
    pub fn registrar(&self) -> Option<&Arc<dyn Registrar>> {
        match self {
            Self::Main(_) => None,
            Self::Worker(adapter) => Some(&adapter.registrar),
        }
    }
}

impl std::fmt::Debug for RoleBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RoleBinding").field(&self.role()).finish()
    }
}

struct RemoteFunction {
    name: String,
    executor: Arc<dyn Executor>,
    monitor: Arc<LifecycleMonitor>,
}

impl Callable for RemoteFunction {
    fn call(&self, args: Vec<Value>) -> BoxFuture<CoreResult<Value>> {
        let name = self.name.clone();
        let executor = Arc::clone(&self.executor);
        let tracked = self.monitor.begin(OperationKind::RemoteCall);
        Box::pin(async move {
            let result = executor.call(&name, args).await;
            tracked.complete();
            result
        })
    }
}

/// Function registry
pub struct Distributed {
    local: RwLock<IndexMap<String, Function>>,
    binding: RoleBinding,
    channels: ChannelCache,
    monitor: Arc<LifecycleMonitor>,
}

impl Distributed {
    /// Create a registry
    #[must_use]
    pub fn new(
        binding: RoleBinding,
        factories: TransportFactories,
        monitor: Arc<LifecycleMonitor>,
    ) -> Self {
        Self {
            local: RwLock::new(IndexMap::new()),
            binding,
            channels: ChannelCache::new(factories),
            monitor,
        }
    }

    /// Role of this registry
    #[must_use]
    pub fn role(&self) -> Role {
        self.binding.role()
    }

    /// Role binding
    #[must_use]
    pub fn binding(&self) -> &RoleBinding {
        &self.binding
    }

    /// Channel cache owned by this registry
    #[must_use]
    pub fn channels(&self) -> &ChannelCache {
        &self.channels
    }

    /// Monitor remote calls report to
    #[must_use]
    pub fn monitor(&self) -> &Arc<LifecycleMonitor> {
        &self.monitor
    }

    /// Bind `name` locally, overwriting any previous binding
    ///
    /// In worker role the binding is also announced to the main side.
    ///
    /// # Errors
    ///
    /// Returns error if the announcement cannot be delivered. The local
    /// binding is kept either way.
    pub fn set(&self, name: &str, function: Function) -> CoreResult<()> {
        let previous = self
            .local
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), function.clone());
        debug!(name, overwrite = previous.is_some(), "Function bound");

        if let Some(registrar) = self.binding.registrar() {
            registrar.register(name, function)?;
        }
        Ok(())
    }

    /// Local binding for `name`
    #[must_use]
    pub fn local(&self, name: &str) -> Option<Function> {
        self.local
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Names bound locally, in first-binding order
    #[must_use]
    pub fn local_names(&self) -> Vec<String> {
        self.local
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Remote proxy for `name` as a bare callable
    #[must_use]
    pub fn proxy(&self, name: &str) -> Arc<dyn Callable> {
        Arc::new(RemoteFunction {
            name: name.to_string(),
            executor: Arc::clone(self.binding.executor()),
            monitor: Arc::clone(&self.monitor),
        })
    }

    /// Remote proxy for `name`
    ///
    /// Nothing is resolved until the proxy is called; an unknown name fails
    /// then with the executor's error.
    #[must_use]
    pub fn get(&self, name: &str) -> Function {
        Function::from_callable(self.proxy(name))
    }

    /// Proxies for every remotely reachable name under `path`
    ///
    /// # Errors
    ///
    /// Returns whatever the executor's listing fails with.
    pub async fn get_functions(&self, path: &str) -> CoreResult<IndexMap<String, Function>> {
        let names = self
            .monitor
            .track(OperationKind::RemoteCall, self.binding.executor().list(path))
            .await?;
        Ok(names
            .into_iter()
            .map(|name| {
                let function = self.get(&name);
                (name, function)
            })
            .collect())
    }

    /// Executor over the cached channel to `protocol:destination`
    ///
    /// # Errors
    ///
    /// `UnknownProtocol` if no connector exists for `protocol`, otherwise
    /// whatever channel creation fails with.
    pub async fn get_executor(&self, protocol: &str, destination: &str) -> CoreResult<RpcExecutor> {
        let channel = self
            .monitor
            .track(
                OperationKind::Connect,
                self.channels.get_channel(protocol, destination),
            )
            .await?;
        Ok(RpcExecutor::new(channel))
    }
}

impl std::fmt::Debug for Distributed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Distributed")
            .field("role", &self.role())
            .field("local", &self.local_names())
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use clio_core::CoreError;
    use serde_json::json;
    use std::sync::Mutex;

    /// Executor answering from a fixed table
    #[derive(Default)]
    struct TableExecutor {
        table: Mutex<IndexMap<String, Value>>,
    }

    #[async_trait]
    impl Executor for TableExecutor {
        async fn call(&self, name: &str, _args: Vec<Value>) -> CoreResult<Value> {
            self.table
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| CoreError::UnknownFunction {
                    name: name.to_string(),
                })
        }

        async fn list(&self, path: &str) -> CoreResult<Vec<String>> {
            Ok(self
                .table
                .lock()
                .unwrap()
                .keys()
                .filter(|name| name.starts_with(path))
                .cloned()
                .collect())
        }
    }

    #[derive(Default)]
    struct CollectingRegistrar {
        seen: Mutex<Vec<String>>,
    }

    impl Registrar for CollectingRegistrar {
        fn register(&self, path: &str, _function: Function) -> CoreResult<()> {
            self.seen.lock().unwrap().push(path.to_string());
            Ok(())
        }
    }

    fn main_registry(executor: Arc<TableExecutor>) -> Distributed {
        Distributed::new(
            RoleBinding::main(executor),
            TransportFactories::new(),
            LifecycleMonitor::disabled(),
        )
    }

    #[tokio::test]
    async fn test_overwrite_keeps_last_binding() {
        let registry = main_registry(Arc::default());
        registry.set("n", Function::sync(|_| Ok(json!("a")))).unwrap();
        registry.set("n", Function::sync(|_| Ok(json!("b")))).unwrap();

        let local = registry.local("n").unwrap();
        assert_eq!(local.call(vec![]).await.unwrap(), json!("b"));
        assert_eq!(registry.local_names(), vec!["n".to_string()]);
    }

    #[test]
    fn test_worker_set_announces() {
        let registrar = Arc::new(CollectingRegistrar::default());
        let registry = Distributed::new(
            RoleBinding::worker(Arc::new(TableExecutor::default()), registrar.clone()),
            TransportFactories::new(),
            LifecycleMonitor::disabled(),
        );
        assert_eq!(registry.role(), Role::Worker);
        registry.set("f", Function::sync(|_| Ok(Value::Null))).unwrap();
        assert_eq!(*registrar.seen.lock().unwrap(), vec!["f".to_string()]);
        assert!(registry.local("f").is_some());
    }

    #[test]
    fn test_main_binding_has_no_registrar() {
        let binding = RoleBinding::main(Arc::new(TableExecutor::default()));
        assert_eq!(binding.role(), Role::Main);
        assert!(binding.registrar().is_none());
    }

    #[tokio::test]
    async fn test_proxy_resolves_on_each_call() {
        let executor = Arc::new(TableExecutor::default());
        let registry = main_registry(Arc::clone(&executor));

        let proxy = registry.get("late");
        let err = proxy.call(vec![]).await.unwrap_err();
        assert!(matches!(err, CoreError::UnknownFunction { name } if name == "late"));

        executor
            .table
            .lock()
            .unwrap()
            .insert("late".to_string(), json!(1));
        assert_eq!(proxy.call(vec![]).await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_get_functions_by_prefix() {
        let executor = Arc::new(TableExecutor::default());
        {
            let mut table = executor.table.lock().unwrap();
            table.insert("math/add".to_string(), json!("add"));
            table.insert("math/sub".to_string(), json!("sub"));
            table.insert("text/upper".to_string(), json!("upper"));
        }
        let registry = main_registry(executor);

        let functions = registry.get_functions("math/").await.unwrap();
        let names: Vec<_> = functions.keys().cloned().collect();
        assert_eq!(names, vec!["math/add".to_string(), "math/sub".to_string()]);
        let sub = &functions["math/sub"];
        assert_eq!(sub.call(vec![]).await.unwrap(), json!("sub"));
    }

    #[tokio::test]
    async fn test_get_executor_unknown_protocol() {
        let registry = main_registry(Arc::default());
        let err = registry.get_executor("ws", "localhost").await.unwrap_err();
        assert!(matches!(err, CoreError::UnknownProtocol { .. }));
        assert!(registry.channels().is_empty());
    }

    #[tokio::test]
    async fn test_remote_call_is_tracked() {
        let exit = Arc::new(crate::monitor::tests::RecordingExit::default());
        let monitor = LifecycleMonitor::new(exit.clone());
        let registry = Distributed::new(
            RoleBinding::main(Arc::new(TableExecutor::default())),
            TransportFactories::new(),
            Arc::clone(&monitor),
        );

        let pending = registry.get("anything").call(vec![]);
        assert_eq!(monitor.active_count(), 1);
        let _ = pending.await;
        assert_eq!(monitor.active_count(), 0);
    }
}
