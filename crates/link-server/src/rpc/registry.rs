//! Method registry and async dispatch.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use link_core::RpcError;
use metrics::{counter, histogram};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{error, warn};

use crate::session::Session;

/// Trait implemented by every RPC method handler.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Execute the handler with the given params on behalf of `session`.
    async fn handle(&self, params: Option<Value>, session: &Arc<Session>) -> Result<Value, RpcError>;
}

/// Registry mapping method names to handlers.
pub struct MethodRegistry {
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
}

impl MethodRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a method name. A later registration replaces
    /// an earlier one.
    pub fn register(&mut self, method: &str, handler: impl MethodHandler + 'static) {
        let _ = self.handlers.insert(method.to_owned(), Arc::new(handler));
    }

    /// Register a closure over raw params.
    pub fn register_fn<F, Fut>(&mut self, method: &str, f: F)
    where
        F: Fn(Option<Value>, Arc<Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.register(method, FnHandler(f));
    }

    /// Register a closure over typed params. Params that do not decode into
    /// `P` fail with InvalidParams before the closure runs.
    pub fn register_typed<P, R, F, Fut>(&mut self, method: &str, f: F)
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P, Arc<Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    {
        self.register(
            method,
            TypedHandler {
                f,
                _marker: PhantomData,
            },
        );
    }

    /// Register a typed method on a shared receiver, such as a device session.
    pub fn register_bound<T, P, R, F, Fut>(&mut self, method: &str, target: &Arc<T>, f: F)
    where
        T: Send + Sync + 'static,
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<T>, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    {
        let target = Arc::clone(target);
        self.register_typed(method, move |params: P, _session| f(Arc::clone(&target), params));
    }

    /// Invoke the handler for `method`.
    ///
    /// Panics are caught and reported as InternalError. If the session closes
    /// while the handler is suspended, the handler is dropped and the call
    /// fails with the session-closed error.
    pub async fn call(&self, method: &str, params: Option<Value>, session: &Arc<Session>) -> Result<Value, RpcError> {
        counter!("rpc_requests_total", "method" => method.to_owned()).increment(1);

        let Some(handler) = self.handlers.get(method) else {
            counter!("rpc_errors_total", "method" => method.to_owned(), "error_type" => "method_not_found").increment(1);
            return Err(RpcError::MethodNotFound {
                method: method.to_owned(),
            });
        };

        let start = Instant::now();
        let cancel = session.cancellation();
        let result = tokio::select! {
            biased;
            outcome = AssertUnwindSafe(handler.handle(params, session)).catch_unwind() => match outcome {
                Ok(result) => result,
                Err(panic) => {
                    let detail = panic_message(panic.as_ref());
                    error!(method, %detail, "handler panicked");
                    Err(RpcError::internal())
                }
            },
            () = cancel.cancelled() => Err(RpcError::session_closed()),
        };

        if let Err(ref err) = result {
            counter!("rpc_errors_total", "method" => method.to_owned(), "error_type" => err.kind()).increment(1);
        }
        let duration = start.elapsed();
        histogram!("rpc_request_duration_seconds", "method" => method.to_owned()).record(duration.as_secs_f64());
        if duration.as_secs() >= 5 {
            warn!(method, duration_secs = duration.as_secs_f64(), "slow RPC request");
        }
        result
    }

    /// List all registered method names (sorted).
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check whether a method is registered.
    pub fn has_method(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode params into `P`. Absent params decode as an empty object.
pub fn parse_params<P: DeserializeOwned>(params: Option<Value>) -> Result<P, RpcError> {
    let value = match params {
        None | Some(Value::Null) => Value::Object(serde_json::Map::new()),
        Some(v) => v,
    };
    serde_json::from_value(value).map_err(|e| RpcError::invalid_params(e.to_string()))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MethodHandler for FnHandler<F>
where
    F: Fn(Option<Value>, Arc<Session>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    async fn handle(&self, params: Option<Value>, session: &Arc<Session>) -> Result<Value, RpcError> {
        (self.0)(params, Arc::clone(session)).await
    }
}

struct TypedHandler<P, R, F> {
    f: F,
    _marker: PhantomData<fn(P) -> R>,
}

#[async_trait]
impl<P, R, F, Fut> MethodHandler for TypedHandler<P, R, F>
where
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(P, Arc<Session>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
{
    async fn handle(&self, params: Option<Value>, session: &Arc<Session>) -> Result<Value, RpcError> {
        let params = parse_params::<P>(params)?;
        let result = (self.f)(params, Arc::clone(session)).await?;
        serde_json::to_value(result).map_err(|e| {
            error!(error = %e, "handler result failed to serialize");
            RpcError::internal()
        })
    }
}
