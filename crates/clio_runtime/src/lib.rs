//! Clio Runtime
//!
//! The function registry that unifies local and remote invocation, the
//! execution context handed to user modules, the bootstrap that runs a module
//! in main or worker role and imports it into a worker pool, and the
//! lifecycle monitor that gates process exit on outstanding work.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bootstrap;
pub mod config;
pub mod context;
pub mod module;
pub mod monitor;
pub mod registry;

pub use bootstrap::{import_module, run, Imported, RoleInputs, RunOptions, LOCAL_POOL};
pub use config::{ConfigError, EndpointConfig, RuntimeConfig};
pub use context::{Builtins, ExecutionContext};
pub use module::{EntryPoint, MainOutput, Module, ModuleExports, ModuleLoader, RunOutcome, StaticModules};
pub use monitor::{ExitHandler, LifecycleMonitor, OperationGuard, OperationKind, ProcessExit};
pub use registry::{Distributed, MainAdapter, Role, RoleBinding, WorkerAdapter};
