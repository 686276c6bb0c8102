//! Values and callables shared by every role.
//!
//! A [`Function`] is what user code registers and what the registry hands
//! back. Local implementations and remote proxies both sit behind the same
//! [`Callable`] trait, so a caller never has to know which one it holds.

use crate::error::{CoreError, CoreResult};
use std::future::Future;
use std::sync::Arc;

/// Dynamic value passed to and returned from functions
pub type Value = serde_json::Value;

/// Boxed, sendable future
pub type BoxFuture<T> = futures::future::BoxFuture<'static, T>;

/// Anything that can be invoked with a list of arguments
pub trait Callable: Send + Sync {
    /// Invoke with the given arguments
    fn call(&self, args: Vec<Value>) -> BoxFuture<CoreResult<Value>>;
}

struct FnCallable<F>(F);

impl<F, Fut> Callable for FnCallable<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = CoreResult<Value>> + Send + 'static,
{
    fn call(&self, args: Vec<Value>) -> BoxFuture<CoreResult<Value>> {
        Box::pin((self.0)(args))
    }
}

/// A registered or registrable function
///
/// `parallel` is wired by the runtime right after registration and routes the
/// same name through the remote channel instead of calling locally.
#[derive(Clone)]
pub struct Function {
    callable: Arc<dyn Callable>,
    parallel: Option<Arc<dyn Callable>>,
}

impl Function {
    /// Wrap an async closure
    #[must_use]
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoreResult<Value>> + Send + 'static,
    {
        Self::from_callable(Arc::new(FnCallable(f)))
    }

    /// Wrap a synchronous closure
    #[must_use]
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> CoreResult<Value> + Send + Sync + 'static,
    {
        Self::new(move |args| std::future::ready(f(args)))
    }

    /// Wrap an existing callable
    #[must_use]
    pub fn from_callable(callable: Arc<dyn Callable>) -> Self {
        Self {
            callable,
            parallel: None,
        }
    }

    /// Attach the remote-routed twin of this function
    #[must_use]
    pub fn with_parallel(mut self, parallel: Arc<dyn Callable>) -> Self {
        self.parallel = Some(parallel);
        self
    }

    /// Call the local implementation
    pub fn call(&self, args: Vec<Value>) -> BoxFuture<CoreResult<Value>> {
        self.callable.call(args)
    }

    /// The remote-routed twin, if one was wired
    #[must_use]
    pub fn parallel(&self) -> Option<Function> {
        self.parallel.as_ref().map(|p| Self::from_callable(Arc::clone(p)))
    }

    /// Call through the remote channel
    ///
    /// # Errors
    ///
    /// The returned future fails with `Validation` if the function was never
    /// registered through a context.
    pub fn call_parallel(&self, args: Vec<Value>) -> BoxFuture<CoreResult<Value>> {
        match &self.parallel {
            Some(parallel) => parallel.call(args),
            None => Box::pin(std::future::ready(Err(CoreError::Validation {
                field: "parallel".to_string(),
                reason: "function was not registered".to_string(),
            }))),
        }
    }

    /// Whether a remote twin is wired
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.parallel.is_some()
    }
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("parallel", &self.parallel.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_sync_function_call() {
        let double = Function::sync(|args| {
            let n = args.first().and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(n * 2))
        });
        assert_eq!(double.call(vec![json!(21)]).await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn test_async_function_call() {
        let echo = Function::new(|args: Vec<Value>| async move { Ok(Value::Array(args)) });
        let out = echo.call(vec![json!("a"), json!(1)]).await.unwrap();
        assert_eq!(out, json!(["a", 1]));
    }

    #[tokio::test]
    async fn test_parallel_missing() {
        let f = Function::sync(|_| Ok(Value::Null));
        assert!(!f.is_registered());
        assert!(f.parallel().is_none());
        let err = f.call_parallel(vec![]).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_parallel_wired() {
        let remote = Function::sync(|_| Ok(json!("remote")));
        let f = Function::sync(|_| Ok(json!("local"))).with_parallel(remote.callable.clone());
        assert!(f.is_registered());
        assert_eq!(f.call(vec![]).await.unwrap(), json!("local"));
        assert_eq!(f.call_parallel(vec![]).await.unwrap(), json!("remote"));
    }
}
