//! Clio Cluster
//!
//! Worker pools and the plumbing between roles: the request protocol, the
//! thread and stream transports, the dispatcher that aggregates worker
//! registrations, the readiness barrier, and the channel cache.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod barrier;
pub mod cache;
pub mod dispatcher;
pub mod executor;
pub mod protocol;
pub mod transport;
pub mod worker;

pub use barrier::ReadinessBarrier;
pub use cache::{ChannelCache, Connector, TransportFactories};
pub use dispatcher::Dispatcher;
pub use executor::{Executor, Registrar, RpcExecutor};
pub use protocol::{Outcome, RemoteRequest, RemoteResponse, RequestKind};
pub use transport::thread::{ThreadClient, ThreadConnector, ThreadTransport};
pub use transport::{Channel, Protocol, RequestHandler, TransportError};
pub use worker::{WorkerEndpoint, WorkerHandle, Workload};
