//! User module contract and loaders.
//!
//! A module receives the execution context and returns its exports: named
//! functions and, optionally, a `main` entry point. Loaders map a module path
//! to a module; [`StaticModules`] holds modules registered in-process.

use crate::context::ExecutionContext;
use async_trait::async_trait;
use clio_core::{BoxFuture, CoreError, CoreResult, Function, Value};
use indexmap::IndexMap;
use serde::Serialize;
use std::sync::Arc;

/// What `main` hands back: one pending result or an ordered sequence
pub enum MainOutput {
    /// Awaited alone
    Single(BoxFuture<CoreResult<Value>>),
    /// Awaited concurrently; all must succeed
    Sequence(Vec<BoxFuture<CoreResult<Value>>>),
}

impl std::fmt::Debug for MainOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single(_) => f.write_str("MainOutput::Single"),
            Self::Sequence(items) => write!(f, "MainOutput::Sequence({})", items.len()),
        }
    }
}

/// Resolved result of `main`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RunOutcome {
    /// Result of a single pending value
    Single(Value),
    /// Results of a sequence, in order
    Sequence(Vec<Value>),
}

impl RunOutcome {
    /// Collapse into one value; a sequence becomes an array
    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            Self::Single(value) => value,
            Self::Sequence(values) => Value::Array(values),
        }
    }
}

/// Module entry point, invoked with the argument vector
pub type EntryPoint = Arc<dyn Fn(Vec<String>) -> CoreResult<MainOutput> + Send + Sync>;

/// Exports returned by a module
#[derive(Clone, Default)]
pub struct ModuleExports {
    /// Entry point, if the module has one
    pub main: Option<EntryPoint>,
    /// Exported functions
    pub functions: IndexMap<String, Function>,
}

impl ModuleExports {
    /// No entry point, no functions
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set the entry point
    #[must_use]
    pub fn with_main<F>(mut self, main: F) -> Self
    where
        F: Fn(Vec<String>) -> CoreResult<MainOutput> + Send + Sync + 'static,
    {
        self.main = Some(Arc::new(main));
        self
    }

    /// Builder: export a function
    #[must_use]
    pub fn with_function(mut self, name: impl Into<String>, function: Function) -> Self {
        self.functions.insert(name.into(), function);
        self
    }

    /// Exported function by name
    #[must_use]
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }
}

impl std::fmt::Debug for ModuleExports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleExports")
            .field("main", &self.main.is_some())
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A loadable user module
#[async_trait]
pub trait Module: Send + Sync {
    /// Build the module's exports against `ctx`
    async fn load(&self, ctx: &ExecutionContext) -> CoreResult<ModuleExports>;
}

/// Resolves module paths
pub trait ModuleLoader: Send + Sync {
    /// Module registered under `path`
    ///
    /// # Errors
    ///
    /// `NotFound` if the path is unknown.
    fn load(&self, path: &str) -> CoreResult<Arc<dyn Module>>;

    /// Known module paths
    fn paths(&self) -> Vec<String>;
}

/// Loader over modules registered in-process
#[derive(Clone, Default)]
pub struct StaticModules {
    modules: IndexMap<String, Arc<dyn Module>>,
}

impl StaticModules {
    /// Empty loader
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: register `module` under `path`
    #[must_use]
    pub fn with_module(mut self, path: impl Into<String>, module: Arc<dyn Module>) -> Self {
        self.register(path, module);
        self
    }

    /// Register `module` under `path`, replacing any previous one
    pub fn register(&mut self, path: impl Into<String>, module: Arc<dyn Module>) {
        self.modules.insert(path.into(), module);
    }
}

impl ModuleLoader for StaticModules {
    fn load(&self, path: &str) -> CoreResult<Arc<dyn Module>> {
        self.modules
            .get(path)
            .cloned()
            .ok_or_else(|| CoreError::NotFound {
                kind: "Module".to_string(),
                id: path.to_string(),
            })
    }

    fn paths(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }
}

impl std::fmt::Debug for StaticModules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticModules")
            .field("paths", &self.paths())
            .finish()
    }
}
