//! Clio Core Types
//!
//! Identifiers, the shared error type, and the value/callable model used by
//! every role. This crate performs no I/O.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod function;
pub mod id;

// Re-exports
pub use error::{CoreError, CoreResult};
pub use function::{BoxFuture, Callable, Function, Value};
pub use id::{OperationId, RequestId, RunId, WorkerId};
