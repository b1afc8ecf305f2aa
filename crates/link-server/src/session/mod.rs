//! Session engine: a JSON-RPC actor over one WebSocket connection.
//!
//! A [`Session`] owns the outbound frame queue, the table of server-initiated
//! requests awaiting a client Response, and the cancellation scope tied to the
//! socket's lifetime. Inbound frames go through [`dispatch`]; device-specific
//! behaviour plugs in through [`DeviceSession`].

pub mod client;
pub mod connection;
pub mod pending;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use link_core::jsonrpc::{Message, Notification, Request, Response, parse_message};
use link_core::{RpcError, SessionId};
use metrics::counter;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, instrument, warn};

pub use client::{ClientConnection, QueueError};
pub use pending::PendingRequests;

use crate::rpc::MethodRegistry;

/// Protocol version reported by `getVersion`.
pub const PROTOCOL_VERSION: &str = "1.3";

/// Which device protocol a session speaks, chosen by the request path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionKind {
    /// `/scratch/ble`
    Ble,
    /// `/scratch/bt`
    Bt,
    /// Any other path: built-in methods only.
    Diagnostic,
}

impl SessionKind {
    /// Map a request path to a session kind.
    pub fn from_path(path: &str) -> Self {
        match path.trim_end_matches('/') {
            "/scratch/ble" => Self::Ble,
            "/scratch/bt" => Self::Bt,
            _ => Self::Diagnostic,
        }
    }

    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ble => "ble",
            Self::Bt => "bt",
            Self::Diagnostic => "diagnostic",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device-specific half of a session.
#[async_trait]
pub trait DeviceSession: Send + Sync + 'static {
    /// Add this session's methods to `registry`.
    fn register_methods(self: Arc<Self>, registry: &mut MethodRegistry);

    /// Release the device backend. Called once, after the session closed.
    async fn shutdown(&self);
}

/// One client connection.
pub struct Session {
    id: SessionId,
    kind: SessionKind,
    client: ClientConnection,
    pending: PendingRequests,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Session {
    /// Create a session and the receiving end of its outbound frame queue.
    pub fn new(id: SessionId, kind: SessionKind, queue_capacity: usize) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let session = Arc::new(Self {
            id,
            kind,
            client: ClientConnection::new(tx),
            pending: PendingRequests::new(),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });
        (session, rx)
    }

    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Session kind.
    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// Token cancelled when the session closes.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether [`Session::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Outbound queue and liveness tracking.
    pub fn client(&self) -> &ClientConnection {
        &self.client
    }

    /// Server-initiated requests still awaiting a Response.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Queue a Response, waiting for queue space if the writer is behind.
    /// Responses are still queued after close so that a request racing the
    /// close gets its answer if the socket is open.
    pub async fn send_response(&self, response: Response) -> bool {
        let Some(frame) = self.encode(&Message::Response(response)) else {
            return false;
        };
        self.settle(self.client.send(frame).await)
    }

    /// Queue a Notification. Suppressed once the session closed, and dropped
    /// when the queue is full.
    pub fn send_notification(&self, method: &str, params: impl Serialize) -> bool {
        if self.is_closed() {
            return false;
        }
        let params = match serde_json::to_value(params) {
            Ok(v) => v,
            Err(e) => {
                warn!(session_id = %self.id, method, error = %e, "notification params failed to serialize");
                return false;
            }
        };
        self.queue_now(&Message::Notification(Notification::new(method, Some(params))))
    }

    /// Report a session-level failure as an error Response without an id.
    /// Never waits; dropped when the queue is full.
    pub fn send_error(&self, error: &RpcError) -> bool {
        if self.is_closed() {
            return false;
        }
        self.queue_now(&Message::Response(Response::failure(None, error)))
    }

    /// Issue a server→client Request and wait for the client's Response.
    ///
    /// Resolves exactly once: with the Response, or with the session-closed
    /// error if the session closes first.
    pub async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        let (id, rx) = self.pending.register()?;
        let queued = match self.encode(&Message::Request(Request::new(id.clone(), method, params))) {
            Some(frame) => self.settle(self.client.send(frame).await),
            None => false,
        };
        if !queued {
            self.pending.fail(&id, RpcError::session_closed());
        }
        rx.await.unwrap_or_else(|_| Err(RpcError::session_closed()))
    }

    /// Close the session. Cancels in-flight handlers and the device pump, and
    /// fails every pending outbound request. Returns `false` if the session
    /// was already closed.
    pub fn close(&self, reason: &str) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        let failed = self.pending.fail_all(&RpcError::session_closed());
        info!(session_id = %self.id, kind = %self.kind, reason, failed_requests = failed, "session closed");
        true
    }

    fn encode(&self, message: &Message) -> Option<String> {
        match serde_json::to_string(message) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "outbound message failed to serialize");
                None
            }
        }
    }

    fn queue_now(&self, message: &Message) -> bool {
        match self.encode(message) {
            Some(frame) => self.settle(self.client.try_send(frame)),
            None => false,
        }
    }

    fn settle(&self, queued: Result<(), QueueError>) -> bool {
        match queued {
            Ok(()) => true,
            Err(QueueError::Full) if self.is_closed() => false,
            Err(QueueError::Full) => {
                counter!("ws_frames_dropped_total", "kind" => self.kind.as_str()).increment(1);
                debug!(session_id = %self.id, dropped = self.client.drop_count(), "outbound queue full, frame dropped");
                false
            }
            Err(QueueError::Closed) => {
                if !self.is_closed() {
                    warn!(session_id = %self.id, "client unreachable, closing session");
                    let _ = self.close("client unreachable");
                }
                false
            }
        }
    }
}

/// Handle one inbound text frame.
///
/// Requests get exactly one Response; Notifications get none; Responses
/// complete a pending outbound request. Unparseable frames get an error
/// Response carrying whatever id could be recovered, unless they looked like
/// Responses themselves.
#[instrument(level = "debug", skip_all, fields(method))]
pub async fn dispatch(session: &Arc<Session>, registry: &MethodRegistry, raw: String) {
    match parse_message(&raw) {
        Err(err) if err.is_response => {
            debug!(session_id = %session.id, error = %err, "ignoring malformed response");
        }
        Err(err) => {
            debug!(session_id = %session.id, error = %err, "rejecting malformed message");
            let _ = session.send_response(Response::failure(err.id, &err.error)).await;
        }
        Ok(Message::Response(response)) => {
            let id = response.id.clone();
            if !session.pending.resolve(response) {
                debug!(session_id = %session.id, id = ?id, "response for unknown request");
            }
        }
        Ok(Message::Notification(notification)) => {
            let _ = Span::current().record("method", notification.method.as_str());
            if let Err(err) = registry.call(&notification.method, notification.params, session).await {
                debug!(session_id = %session.id, method = %notification.method, error = %err, "notification handler failed");
            }
        }
        Ok(Message::Request(request)) => {
            let _ = Span::current().record("method", request.method.as_str());
            let response = match registry.call(&request.method, request.params, session).await {
                Ok(result) => Response::success(request.id, result),
                Err(err) => Response::failure(Some(request.id), &err),
            };
            let _ = session.send_response(response).await;
        }
    }
}

/// Methods every session answers regardless of kind.
pub fn register_builtin_methods(registry: &mut MethodRegistry) {
    registry.register_fn("getVersion", |_params, _session| async {
        Ok::<_, RpcError>(json!({ "protocol": PROTOCOL_VERSION }))
    });

    registry.register_fn("keepalive", |_params, _session| async { Ok::<_, RpcError>(Value::Null) });

    registry.register_fn("pingMe", |_params, session| async move {
        let pinger = Arc::clone(&session);
        let _ = tokio::spawn(async move {
            match pinger.send_request("ping", None).await {
                Ok(result) => info!(session_id = %pinger.id, %result, "client answered ping"),
                Err(err) => debug!(session_id = %pinger.id, error = %err, "ping not answered"),
            }
        });
        Ok::<_, RpcError>(json!("willPing"))
    });

    registry.register_fn("close", |_params, session| async move {
        let _ = session.close("client requested close");
        Ok::<_, RpcError>(Value::Null)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn session_with_queue(capacity: usize) -> (Arc<Session>, mpsc::Receiver<String>) {
        Session::new(SessionId::generate(), SessionKind::Diagnostic, capacity)
    }

    fn registry() -> MethodRegistry {
        let mut registry = MethodRegistry::new();
        register_builtin_methods(&mut registry);
        registry
    }

    fn next_frame(rx: &mut mpsc::Receiver<String>) -> Value {
        let frame = rx.try_recv().unwrap();
        serde_json::from_str(&frame).unwrap()
    }

    #[test]
    fn path_selects_kind() {
        assert_eq!(SessionKind::from_path("/scratch/ble"), SessionKind::Ble);
        assert_eq!(SessionKind::from_path("/scratch/bt/"), SessionKind::Bt);
        assert_eq!(SessionKind::from_path("/"), SessionKind::Diagnostic);
        assert_eq!(SessionKind::from_path("/scratch/usb"), SessionKind::Diagnostic);
    }

    #[tokio::test]
    async fn request_gets_exactly_one_response() {
        let (session, mut rx) = session_with_queue(8);
        dispatch(&session, &registry(), r#"{"jsonrpc":"2.0","id":7,"method":"getVersion"}"#.into()).await;
        let frame = next_frame(&mut rx);
        assert_eq!(frame["id"], 7);
        assert_eq!(frame["result"]["protocol"], "1.3");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn notification_gets_no_response() {
        let (session, mut rx) = session_with_queue(8);
        dispatch(&session, &registry(), r#"{"jsonrpc":"2.0","method":"keepalive"}"#.into()).await;
        dispatch(&session, &registry(), r#"{"jsonrpc":"2.0","method":"unknown"}"#.into()).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_method_reports_method_not_found() {
        let (session, mut rx) = session_with_queue(8);
        dispatch(&session, &registry(), r#"{"jsonrpc":"2.0","id":"a","method":"fly"}"#.into()).await;
        let frame = next_frame(&mut rx);
        assert_eq!(frame["id"], "a");
        assert_eq!(frame["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn malformed_json_reports_parse_error_without_id() {
        let (session, mut rx) = session_with_queue(8);
        dispatch(&session, &registry(), "{not json".into()).await;
        let frame = next_frame(&mut rx);
        assert_eq!(frame["error"]["code"], -32700);
        assert!(frame.get("id").is_none());
    }

    #[tokio::test]
    async fn bad_version_reports_invalid_request_with_id() {
        let (session, mut rx) = session_with_queue(8);
        dispatch(&session, &registry(), r#"{"jsonrpc":"1.0","id":3,"method":"getVersion"}"#.into()).await;
        let frame = next_frame(&mut rx);
        assert_eq!(frame["id"], 3);
        assert_eq!(frame["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn stray_responses_are_ignored() {
        let (session, mut rx) = session_with_queue(8);
        dispatch(&session, &registry(), r#"{"jsonrpc":"2.0","id":99,"result":true}"#.into()).await;
        dispatch(&session, &registry(), r#"{"jsonrpc":"2.0","id":99,"result":1,"error":{}}"#.into()).await;
        assert!(rx.try_recv().is_err());
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn outbound_request_resolves_from_client_response() {
        let (session, mut rx) = session_with_queue(8);
        let requester = Arc::clone(&session);
        let call = tokio::spawn(async move { requester.send_request("ping", None).await });
        let frame = loop {
            if let Ok(frame) = rx.try_recv() {
                break serde_json::from_str::<Value>(&frame).unwrap();
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(frame["method"], "ping");
        let reply = json!({"jsonrpc": "2.0", "id": frame["id"], "result": "pong"}).to_string();
        dispatch(&session, &registry(), reply).await;
        assert_eq!(call.await.unwrap().unwrap(), json!("pong"));
        assert_eq!(session.pending_requests(), 0);
    }

    #[tokio::test]
    async fn close_fails_pending_requests_once() {
        let (session, _rx) = session_with_queue(8);
        let requester = Arc::clone(&session);
        let call = tokio::spawn(async move { requester.send_request("ping", None).await });
        while session.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(session.close("test"));
        assert!(!session.close("again"));
        assert_eq!(call.await.unwrap().unwrap_err(), RpcError::session_closed());
        assert_matches!(session.send_request("ping", None).await, Err(e) if e == RpcError::session_closed());
    }

    #[tokio::test]
    async fn close_method_answers_then_closes() {
        let (session, mut rx) = session_with_queue(8);
        dispatch(&session, &registry(), r#"{"jsonrpc":"2.0","id":1,"method":"close"}"#.into()).await;
        let frame = next_frame(&mut rx);
        assert_eq!(frame["id"], 1);
        assert!(frame.get("error").is_none());
        assert!(session.is_closed());
        assert!(session.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn ping_me_issues_a_ping_request() {
        let (session, mut rx) = session_with_queue(8);
        dispatch(&session, &registry(), r#"{"jsonrpc":"2.0","id":1,"method":"pingMe"}"#.into()).await;
        let mut frames = Vec::new();
        while frames.len() < 2 {
            if let Ok(frame) = rx.try_recv() {
                frames.push(serde_json::from_str::<Value>(&frame).unwrap());
            } else {
                tokio::task::yield_now().await;
            }
        }
        assert!(frames.iter().any(|f| f["result"] == "willPing"));
        assert!(frames.iter().any(|f| f["method"] == "ping" && f["id"].is_number()));
    }

    #[tokio::test]
    async fn notifications_stop_after_close() {
        let (session, mut rx) = session_with_queue(8);
        assert!(session.send_notification("didDiscoverPeripheral", json!({"rssi": -40})));
        let _ = session.close("test");
        assert!(!session.send_notification("didDiscoverPeripheral", json!({"rssi": -40})));
        assert!(!session.send_error(&RpcError::application("gone")));
        assert_eq!(next_frame(&mut rx)["method"], "didDiscoverPeripheral");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn error_notification_has_no_id() {
        let (session, mut rx) = session_with_queue(8);
        assert!(session.send_error(&RpcError::application("adapter lost")));
        let frame = next_frame(&mut rx);
        assert!(frame.get("id").is_none());
        assert_eq!(frame["error"]["code"], -32500);
    }

    #[test]
    fn full_queue_drops_notifications_but_keeps_the_session() {
        let (session, mut rx) = session_with_queue(1);
        assert!(session.send_notification("didDiscoverPeripheral", json!({"rssi": -40})));
        assert!(!session.send_notification("didDiscoverPeripheral", json!({"rssi": -41})));
        assert!(!session.is_closed());
        assert_eq!(session.client().drop_count(), 1);
        assert_eq!(next_frame(&mut rx)["params"]["rssi"], -40);
        assert!(session.send_notification("didDiscoverPeripheral", json!({"rssi": -42})));
    }

    #[tokio::test]
    async fn response_waits_behind_a_notification_burst() {
        let (session, mut rx) = session_with_queue(2);
        assert!(session.send_notification("didDiscoverPeripheral", json!({"rssi": -40})));
        assert!(session.send_notification("didDiscoverPeripheral", json!({"rssi": -50})));

        let dispatcher = Arc::clone(&session);
        let call = tokio::spawn(async move {
            dispatch(&dispatcher, &registry(), r#"{"jsonrpc":"2.0","id":42,"method":"getVersion"}"#.into()).await;
        });

        let mut frames = Vec::new();
        while frames.len() < 3 {
            let frame = rx.recv().await.unwrap();
            frames.push(serde_json::from_str::<Value>(&frame).unwrap());
        }
        call.await.unwrap();

        assert_eq!(frames[0]["method"], "didDiscoverPeripheral");
        assert_eq!(frames[1]["method"], "didDiscoverPeripheral");
        assert_eq!(frames[2]["id"], 42);
        assert_eq!(frames[2]["result"]["protocol"], "1.3");
        assert!(!session.is_closed());
        assert_eq!(session.client().drop_count(), 0);
    }

    #[test]
    fn unreachable_client_closes_session() {
        let (session, rx) = session_with_queue(1);
        drop(rx);
        assert!(!session.send_notification("x", json!({})));
        assert!(session.is_closed());
    }
}
