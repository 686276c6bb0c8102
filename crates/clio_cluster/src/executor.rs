//! Executor and registrar seams.
//!
//! An [`Executor`] resolves names against whatever side of a channel holds the
//! registrations. A [`Registrar`] announces a local registration to the
//! aggregator. The runtime binds one or both depending on its role.

use crate::protocol::RemoteRequest;
use crate::transport::Channel;
use async_trait::async_trait;
use clio_core::{CoreResult, Function, Value};
use indexmap::IndexMap;
use std::sync::Arc;

/// Resolves and invokes functions by name
#[async_trait]
pub trait Executor: Send + Sync {
    /// Invoke the function registered under `name`
    async fn call(&self, name: &str, args: Vec<Value>) -> CoreResult<Value>;

    /// Names registered under the given path prefix
    async fn list(&self, path: &str) -> CoreResult<Vec<String>>;
}

/// Announces local registrations to the aggregator
pub trait Registrar: Send + Sync {
    /// Register `function` under `path`
    ///
    /// # Errors
    ///
    /// Returns error if the announcement cannot be delivered.
    fn register(&self, path: &str, function: Function) -> CoreResult<()>;
}

/// Executor speaking the request protocol over a [`Channel`]
#[derive(Clone)]
pub struct RpcExecutor {
    channel: Arc<dyn Channel>,
}

impl RpcExecutor {
    /// Create an executor over a channel
    #[must_use]
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self { channel }
    }

    /// Underlying channel
    #[must_use]
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// Proxy invoking `name` over the channel on every call
    #[must_use]
    pub fn get_function(&self, name: &str) -> Function {
        let executor = self.clone();
        let name = name.to_string();
        Function::new(move |args| {
            let executor = executor.clone();
            let name = name.clone();
            async move { executor.call(&name, args).await }
        })
    }

    /// Proxies for every name the remote side lists under `path`
    ///
    /// # Errors
    ///
    /// Returns error if the listing request fails.
    pub async fn get_functions(&self, path: &str) -> CoreResult<IndexMap<String, Function>> {
        let names = self.list(path).await?;
        Ok(names
            .into_iter()
            .map(|name| {
                let function = self.get_function(&name);
                (name, function)
            })
            .collect())
    }
}

#[async_trait]
impl Executor for RpcExecutor {
    async fn call(&self, name: &str, args: Vec<Value>) -> CoreResult<Value> {
        self.channel
            .request(RemoteRequest::call(name, args))
            .await?
            .into_value()
    }

    async fn list(&self, path: &str) -> CoreResult<Vec<String>> {
        self.channel
            .request(RemoteRequest::list(path))
            .await?
            .into_names()
    }
}

impl std::fmt::Debug for RpcExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcExecutor")
            .field("protocol", &self.channel.protocol())
            .finish()
    }
}
