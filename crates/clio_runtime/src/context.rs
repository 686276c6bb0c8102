//! Execution context injected into user modules.

use crate::registry::{Distributed, Role};
use clio_core::{CoreResult, Function, RunId, Value};
use indexmap::IndexMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Builtin bindings, merged into the context verbatim
pub type Builtins = IndexMap<String, Value>;

/// Per-run context handed to a module
///
/// Cloning is cheap; clones share the registry and the export table.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    run_id: RunId,
    distributed: Arc<Distributed>,
    builtins: Arc<Builtins>,
    exports: Arc<RwLock<IndexMap<String, Function>>>,
}

impl ExecutionContext {
    /// Create a context over a registry
    #[must_use]
    pub fn new(distributed: Arc<Distributed>, builtins: Builtins) -> Self {
        Self {
            run_id: RunId::new(),
            distributed,
            builtins: Arc::new(builtins),
            exports: Arc::new(RwLock::new(IndexMap::new())),
        }
    }

    /// Id of the run this context belongs to
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// The function registry
    #[must_use]
    pub fn distributed(&self) -> &Arc<Distributed> {
        &self.distributed
    }

    /// Role of this run
    #[must_use]
    pub fn role(&self) -> Role {
        self.distributed.role()
    }

    /// Whether this run is the main role
    #[must_use]
    pub fn is_main(&self) -> bool {
        self.role() == Role::Main
    }

    /// Whether this run is a worker
    #[must_use]
    pub fn is_worker(&self) -> bool {
        self.role() == Role::Worker
    }

    /// All builtins
    #[must_use]
    pub fn builtins(&self) -> &Builtins {
        &self.builtins
    }

    /// One builtin by name
    #[must_use]
    pub fn builtin(&self, name: &str) -> Option<&Value> {
        self.builtins.get(name)
    }

    /// Register `function` under `name` and wire its `parallel` twin
    ///
    /// Returns the function with `parallel` set; the same value is what the
    /// registry holds.
    ///
    /// # Errors
    ///
    /// Returns error if a worker cannot announce the registration.
    pub fn register(&self, name: &str, function: Function) -> CoreResult<Function> {
        let function = function.with_parallel(self.distributed.proxy(name));
        self.distributed.set(name, function.clone())?;
        Ok(function)
    }

    /// Add `function` to the export table
    pub fn export(&self, name: impl Into<String>, function: Function) {
        self.exports
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), function);
    }

    /// Snapshot of the export table
    #[must_use]
    pub fn exports(&self) -> IndexMap<String, Function> {
        self.exports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::LifecycleMonitor;
    use crate::registry::RoleBinding;
    use async_trait::async_trait;
    use clio_cluster::{Executor, TransportFactories};
    use clio_core::CoreError;
    use serde_json::json;

    struct Upper;

    #[async_trait]
    impl Executor for Upper {
        async fn call(&self, name: &str, _args: Vec<Value>) -> CoreResult<Value> {
            match name {
                "shout" => Ok(json!("REMOTE")),
                _ => Err(CoreError::UnknownFunction {
                    name: name.to_string(),
                }),
            }
        }

        async fn list(&self, _path: &str) -> CoreResult<Vec<String>> {
            Ok(vec!["shout".to_string()])
        }
    }

    fn context() -> ExecutionContext {
        let registry = Distributed::new(
            RoleBinding::main(Arc::new(Upper)),
            TransportFactories::new(),
            LifecycleMonitor::disabled(),
        );
        let mut builtins = Builtins::new();
        builtins.insert("version".to_string(), json!("0.1"));
        ExecutionContext::new(Arc::new(registry), builtins)
    }

    #[tokio::test]
    async fn test_register_wires_parallel() {
        let ctx = context();
        let shout = ctx
            .register("shout", Function::sync(|_| Ok(json!("local"))))
            .unwrap();
        assert!(shout.is_registered());
        assert_eq!(shout.call(vec![]).await.unwrap(), json!("local"));
        assert_eq!(shout.call_parallel(vec![]).await.unwrap(), json!("REMOTE"));

        let stored = ctx.distributed().local("shout").unwrap();
        assert!(stored.is_registered());
    }

    #[test]
    fn test_role_and_builtins() {
        let ctx = context();
        assert!(ctx.is_main());
        assert!(!ctx.is_worker());
        assert_eq!(ctx.builtin("version"), Some(&json!("0.1")));
        assert!(ctx.builtin("missing").is_none());
    }

    #[test]
    fn test_exports_shared_between_clones() {
        let ctx = context();
        let clone = ctx.clone();
        clone.export("f", Function::sync(|_| Ok(Value::Null)));
        assert!(ctx.exports().contains_key("f"));
        assert_eq!(ctx.run_id(), clone.run_id());
    }
}
