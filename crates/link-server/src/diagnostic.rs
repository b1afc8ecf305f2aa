//! Session served on unrecognised paths.
//!
//! Speaks the built-in methods plus `echo`, and owns no device. Useful for
//! checking that a client can reach the gateway at all.

use std::sync::Arc;

use async_trait::async_trait;
use link_core::RpcError;
use link_core::value::decode_value;
use serde_json::Value;
use tracing::debug;

use crate::rpc::MethodRegistry;
use crate::session::DeviceSession;

/// Device half of a diagnostic session.
#[derive(Debug, Default)]
pub struct DiagnosticSession;

impl DiagnosticSession {
    /// New diagnostic session.
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl DeviceSession for DiagnosticSession {
    fn register_methods(self: Arc<Self>, registry: &mut MethodRegistry) {
        registry.register_fn("echo", |params, session| async move {
            let params = params.unwrap_or(Value::Null);
            debug!(
                session_id = %session.id(),
                decoded_as = decode_value(&params).type_name(),
                "echo"
            );
            Ok::<_, RpcError>(params)
        });
    }

    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Session, SessionKind};
    use link_core::SessionId;
    use serde_json::json;

    fn registry() -> MethodRegistry {
        let mut registry = MethodRegistry::new();
        DiagnosticSession::new().register_methods(&mut registry);
        registry
    }

    #[tokio::test]
    async fn echo_returns_params_unchanged() {
        let (session, _rx) = Session::new(SessionId::generate(), SessionKind::Diagnostic, 4);
        let registry = registry();
        let params = json!({"a": [1, 2, 3], "b": "text"});
        let result = registry.call("echo", Some(params.clone()), &session).await.unwrap();
        assert_eq!(result, params);

        let result = registry.call("echo", Some(json!(300)), &session).await.unwrap();
        assert_eq!(result, json!(300));
    }

    #[tokio::test]
    async fn echo_without_params_is_null() {
        let (session, _rx) = Session::new(SessionId::generate(), SessionKind::Diagnostic, 4);
        let result = registry().call("echo", None, &session).await.unwrap();
        assert_eq!(result, Value::Null);
    }

    #[test]
    fn registers_no_device_methods() {
        let registry = registry();
        assert_eq!(registry.methods(), vec!["echo".to_owned()]);
        assert!(!registry.has_method("discover"));
    }
}
