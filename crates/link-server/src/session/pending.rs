//! Server-initiated requests awaiting a client Response.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use link_core::jsonrpc::{RequestId, Response};
use link_core::RpcError;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

type Completion = oneshot::Sender<Result<Value, RpcError>>;

#[derive(Default)]
struct Table {
    closed: bool,
    waiters: HashMap<RequestId, Completion>,
}

/// Outstanding outbound requests. Each entry is removed exactly once: by its
/// Response, or by [`PendingRequests::fail_all`] when the session closes.
pub struct PendingRequests {
    next_id: AtomicI64,
    table: Mutex<Table>,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequests {
    /// Empty table; ids start at 1.
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            table: Mutex::new(Table::default()),
        }
    }

    /// Allocate an id and its completion. Fails once the table is closed.
    pub fn register(&self) -> Result<(RequestId, oneshot::Receiver<Result<Value, RpcError>>), RpcError> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        let mut table = self.table.lock();
        if table.closed {
            return Err(RpcError::session_closed());
        }
        let _ = table.waiters.insert(id.clone(), tx);
        Ok((id, rx))
    }

    /// Complete the entry matching `response`. `false` when no entry matches.
    pub fn resolve(&self, response: Response) -> bool {
        let Some(id) = response.id.clone() else {
            return false;
        };
        let Some(waiter) = self.table.lock().waiters.remove(&id) else {
            return false;
        };
        let _ = waiter.send(response.into_result());
        true
    }

    /// Complete one entry with `err`.
    pub fn fail(&self, id: &RequestId, err: RpcError) {
        if let Some(waiter) = self.table.lock().waiters.remove(id) {
            let _ = waiter.send(Err(err));
        }
    }

    /// Close the table and fail every outstanding entry. Returns how many
    /// were failed.
    pub fn fail_all(&self, err: &RpcError) -> usize {
        let drained: Vec<Completion> = {
            let mut table = self.table.lock();
            table.closed = true;
            table.waiters.drain().map(|(_, w)| w).collect()
        };
        let count = drained.len();
        for waiter in drained {
            let _ = waiter.send(Err(err.clone()));
        }
        count
    }

    /// Outstanding entries.
    pub fn len(&self) -> usize {
        self.table.lock().waiters.len()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[tokio::test]
    async fn response_completes_the_matching_entry() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register().unwrap();
        assert!(pending.resolve(Response::success(id, json!("pong"))));
        assert_eq!(rx.await.unwrap().unwrap(), json!("pong"));
        assert!(pending.is_empty());
    }

    #[test]
    fn unknown_or_repeated_ids_are_ignored() {
        let pending = PendingRequests::new();
        let (id, _rx) = pending.register().unwrap();
        assert!(!pending.resolve(Response::success(RequestId::Number(999), json!(1))));
        assert!(pending.resolve(Response::success(id.clone(), json!(1))));
        assert!(!pending.resolve(Response::success(id, json!(1))));
    }

    #[tokio::test]
    async fn fail_all_resolves_everything_and_closes() {
        let pending = PendingRequests::new();
        let (_, rx1) = pending.register().unwrap();
        let (_, rx2) = pending.register().unwrap();
        assert_eq!(pending.fail_all(&RpcError::session_closed()), 2);
        assert_matches!(rx1.await.unwrap(), Err(e) if e == RpcError::session_closed());
        assert_matches!(rx2.await.unwrap(), Err(_));
        assert_matches!(pending.register(), Err(_));
        assert_eq!(pending.fail_all(&RpcError::session_closed()), 0);
    }

    #[tokio::test]
    async fn error_response_is_delivered_as_error() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register().unwrap();
        let _ = pending.resolve(Response::failure(Some(id), &RpcError::application("nope")));
        assert_matches!(rx.await.unwrap(), Err(RpcError::Application { .. }));
    }

    #[test]
    fn ids_are_unique() {
        let pending = PendingRequests::new();
        let (a, _ra) = pending.register().unwrap();
        let (b, _rb) = pending.register().unwrap();
        assert_ne!(a, b);
    }
}
