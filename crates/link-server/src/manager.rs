//! Session Manager: one per process, one session per connection.

use std::sync::Arc;

use axum::extract::ws::WebSocket;
use dashmap::DashMap;
use link_core::SessionId;
use link_device::{BleBackend, BtBackend};
use metrics::gauge;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tracing::{debug, info};

use crate::ble::BleSession;
use crate::bt::BtSession;
use crate::config::GatewayConfig;
use crate::diagnostic::DiagnosticSession;
use crate::rpc::MethodRegistry;
use crate::session::connection::run_connection;
use crate::session::{DeviceSession, Session, SessionKind, register_builtin_methods};
use crate::shutdown::ShutdownCoordinator;

/// A session wired to its device and methods, not yet attached to a socket.
pub struct CreatedSession {
    /// The protocol half.
    pub session: Arc<Session>,
    /// Receiving end of the session's outbound frame queue.
    pub outbound: mpsc::Receiver<String>,
    /// Built-in methods plus the device's methods.
    pub registry: MethodRegistry,
    /// The device half.
    pub device: Arc<dyn DeviceSession>,
}

/// Creates sessions by path and tracks the live ones.
///
/// Backends are shared handles; every session opens its own scan, inquiry,
/// connection or channel on them, so no device state crosses sessions.
pub struct SessionManager<BLE: BleBackend, BT: BtBackend> {
    ble: Arc<BLE>,
    bt: Arc<BT>,
    config: GatewayConfig,
    sessions: DashMap<SessionId, Arc<Session>>,
    permits: Arc<Semaphore>,
    shutdown: ShutdownCoordinator,
}

impl<BLE: BleBackend, BT: BtBackend> SessionManager<BLE, BT> {
    /// New manager over the given backends.
    pub fn new(ble: Arc<BLE>, bt: Arc<BT>, config: GatewayConfig) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.server.max_connections));
        Arc::new(Self {
            ble,
            bt,
            config,
            sessions: DashMap::new(),
            permits,
            shutdown: ShutdownCoordinator::new(),
        })
    }

    /// Runtime configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Shutdown scope shared with the listener.
    pub fn shutdown_coordinator(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Reserve a connection slot, or `None` when full or shutting down.
    pub fn try_admit(&self) -> Option<OwnedSemaphorePermit> {
        if self.shutdown.is_draining() {
            return None;
        }
        Arc::clone(&self.permits).try_acquire_owned().ok()
    }

    /// Build the session bound to `kind`.
    pub fn create_session(&self, kind: SessionKind) -> CreatedSession {
        let (session, outbound) =
            Session::new(SessionId::generate(), kind, self.config.server.transport.send_queue_capacity);

        let device: Arc<dyn DeviceSession> = match kind {
            SessionKind::Ble => BleSession::start(Arc::clone(&self.ble), Arc::clone(&session), self.config.ble.clone()),
            SessionKind::Bt => BtSession::start(Arc::clone(&self.bt), Arc::clone(&session), self.config.bt.clone()),
            SessionKind::Diagnostic => DiagnosticSession::new(),
        };

        let mut registry = MethodRegistry::new();
        register_builtin_methods(&mut registry);
        Arc::clone(&device).register_methods(&mut registry);
        debug!(session_id = %session.id(), %kind, methods = registry.methods().len(), "session created");

        CreatedSession {
            session,
            outbound,
            registry,
            device,
        }
    }

    /// Serve one upgraded socket until it closes. Holds `permit` throughout.
    pub async fn serve(self: Arc<Self>, socket: WebSocket, kind: SessionKind, permit: OwnedSemaphorePermit) {
        let CreatedSession {
            session,
            outbound,
            registry,
            device,
        } = self.create_session(kind);
        let id = session.id().clone();

        let _ = self.sessions.insert(id.clone(), Arc::clone(&session));
        gauge!("sessions_active").set(self.sessions.len() as f64);
        if self.shutdown.is_draining() {
            let _ = session.close("server shutting down");
        }

        run_connection(
            socket,
            session,
            outbound,
            registry,
            device,
            self.config.server.transport.clone(),
        )
        .await;

        let _ = self.sessions.remove(&id);
        gauge!("sessions_active").set(self.sessions.len() as f64);
        drop(permit);
    }

    /// Snapshot of the sessions currently attached to a socket.
    pub fn live_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Close every live session. Returns how many were newly closed.
    pub fn close_all(&self, reason: &str) -> usize {
        let closed = self
            .live_sessions()
            .iter()
            .filter(|session| session.close(reason))
            .count();
        info!(closed, reason, "closed live sessions");
        closed
    }

    /// Sessions currently attached to a socket.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Connection slots still free.
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use link_device::sim::{SimulatedBle, SimulatedBt};

    fn manager(max_connections: usize) -> Arc<SessionManager<SimulatedBle, SimulatedBt>> {
        let mut config = GatewayConfig::default();
        config.server.max_connections = max_connections;
        SessionManager::new(Arc::new(SimulatedBle::demo()), Arc::new(SimulatedBt::demo()), config)
    }

    #[tokio::test]
    async fn kind_selects_device_methods() {
        let manager = manager(4);

        let ble = manager.create_session(SessionKind::Ble);
        assert!(ble.registry.has_method("discover"));
        assert!(ble.registry.has_method("getServices"));
        assert!(!ble.registry.has_method("send"));
        assert!(ble.registry.has_method("getVersion"));

        let bt = manager.create_session(SessionKind::Bt);
        assert!(bt.registry.has_method("send"));
        assert!(!bt.registry.has_method("read"));

        let diag = manager.create_session(SessionKind::Diagnostic);
        assert!(!diag.registry.has_method("discover"));
        assert!(diag.registry.has_method("echo"));
        assert!(diag.registry.has_method("close"));

        assert_ne!(ble.session.id(), bt.session.id());
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn admission_is_bounded() {
        let manager = manager(2);
        let a = manager.try_admit().unwrap();
        let _b = manager.try_admit().unwrap();
        assert!(manager.try_admit().is_none());
        assert_eq!(manager.available_slots(), 0);

        drop(a);
        assert!(manager.try_admit().is_some());
    }

    #[tokio::test]
    async fn no_admission_while_shutting_down() {
        let manager = manager(2);
        manager.shutdown_coordinator().begin();
        assert!(manager.try_admit().is_none());
    }

    #[tokio::test]
    async fn close_all_with_no_sessions() {
        let manager = manager(2);
        assert!(manager.live_sessions().is_empty());
        assert_eq!(manager.close_all("test"), 0);
    }
}
