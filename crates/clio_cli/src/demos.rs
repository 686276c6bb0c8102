//! Bundled demo modules.

use async_trait::async_trait;
use clio_core::{CoreError, CoreResult, Function, Value};
use clio_runtime::{ExecutionContext, MainOutput, Module, ModuleExports, StaticModules};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Path of the Fibonacci demo
pub const FIB: &str = "fib.clio";

/// Path of the greeting demo
pub const GREET: &str = "greet.clio";

/// Largest index whose Fibonacci number fits in a `u64`
const FIB_MAX: u64 = 93;

/// Loader holding every demo
pub fn modules() -> StaticModules {
    StaticModules::new()
        .with_module(FIB, Arc::new(Fib))
        .with_module(GREET, Arc::new(Greet))
}

fn fibonacci(n: u64) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        // `b` runs one step ahead and wraps past FIB_MAX
        (a, b) = (b, a.wrapping_add(b));
    }
    a
}

fn index_arg(args: &[Value]) -> CoreResult<u64> {
    let n = args
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| CoreError::Validation {
            field: "n".to_string(),
            reason: "expected a non-negative integer".to_string(),
        })?;
    if n > FIB_MAX {
        return Err(CoreError::Validation {
            field: "n".to_string(),
            reason: format!("must be at most {FIB_MAX}"),
        });
    }
    Ok(n)
}

/// Computes Fibonacci numbers for each argument across the pool
struct Fib;

#[async_trait]
impl Module for Fib {
    async fn load(&self, ctx: &ExecutionContext) -> CoreResult<ModuleExports> {
        debug!(role = ?ctx.role(), "Loading fib");
        let fib = ctx.register(
            "fib",
            Function::sync(|args| Ok(json!(fibonacci(index_arg(&args)?)))),
        )?;

        let remote = fib.clone();
        Ok(ModuleExports::new()
            .with_function("fib", fib)
            .with_main(move |argv| {
                let inputs = argv
                    .iter()
                    .map(|arg| {
                        arg.parse::<u64>().map_err(|_| CoreError::Validation {
                            field: "argv".to_string(),
                            reason: format!("not an index: {arg}"),
                        })
                    })
                    .collect::<CoreResult<Vec<_>>>()?;
                if inputs.is_empty() {
                    return Ok(MainOutput::Single(remote.call_parallel(vec![json!(30)])));
                }
                Ok(MainOutput::Sequence(
                    inputs
                        .into_iter()
                        .map(|n| remote.call_parallel(vec![json!(n)]))
                        .collect(),
                ))
            }))
    }
}

/// Greets through a worker, using the `greeting` builtin when present
struct Greet;

#[async_trait]
impl Module for Greet {
    async fn load(&self, ctx: &ExecutionContext) -> CoreResult<ModuleExports> {
        let greeting = ctx
            .builtin("greeting")
            .and_then(Value::as_str)
            .unwrap_or("Hello")
            .to_string();
        let greet = ctx.register(
            "greet",
            Function::sync(move |args| {
                let name = args.first().and_then(Value::as_str).unwrap_or("world");
                Ok(json!(format!("{greeting}, {name}!")))
            }),
        )?;

        let remote = greet.clone();
        Ok(ModuleExports::new()
            .with_function("greet", greet)
            .with_main(move |argv| {
                let name = argv.first().cloned().unwrap_or_else(|| "world".to_string());
                Ok(MainOutput::Single(remote.call_parallel(vec![json!(name)])))
            }))
    }
}
