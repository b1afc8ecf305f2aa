//! BLE session state machine.
//!
//! `Idle → Discovering → Connecting → Connected → Closed`. Backend callbacks
//! (advertisements, GATT events, adapter changes) arrive on channels and are
//! applied by a single pump task owned by the session, so session state is
//! only ever touched from the session's own tasks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use link_core::encoding::{EncodedMessage, MessageEncoding, decode_message};
use link_core::gatt::resolve_identifier;
use link_core::{PeripheralId, RpcError};
use link_device::{
    AdapterState, BleAdvertisement, BleBackend, BleConnection, BleEvent, CharacteristicProperties, wait_settled,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::blocklist::{self, Access};
use super::filter::{FilterParams, ScanFilter};
use crate::config::BleSessionConfig;
use crate::rpc::MethodRegistry;
use crate::session::{DeviceSession, Session};

type Advertisement<B> = BleAdvertisement<<B as BleBackend>::Peripheral, <B as BleBackend>::Uuid>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Discovering,
    Connecting,
    Connected,
    Closed,
}

struct BleState<B: BleBackend> {
    phase: Phase,
    filters: Vec<ScanFilter<B::Uuid>>,
    allowed: HashSet<B::Uuid>,
    discovered: HashMap<PeripheralId, B::Peripheral>,
    ids: HashMap<B::Peripheral, PeripheralId>,
    scan: Option<B::Scan>,
    connection: Option<Arc<B::Connection>>,
    notifying: HashSet<(B::Uuid, B::Uuid)>,
    generation: u64,
}

impl<B: BleBackend> BleState<B> {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            filters: Vec::new(),
            allowed: HashSet::new(),
            discovered: HashMap::new(),
            ids: HashMap::new(),
            scan: None,
            connection: None,
            notifying: HashSet::new(),
            generation: 0,
        }
    }

    fn matches(&self, adv: &Advertisement<B>) -> bool {
        if self.filters.is_empty() {
            adv.services.iter().any(|s| self.allowed.contains(s))
        } else {
            self.filters.iter().any(|f| f.matches(adv))
        }
    }

    fn peripheral_id(&mut self, peripheral: &B::Peripheral) -> PeripheralId {
        self.ids
            .entry(peripheral.clone())
            .or_insert_with(PeripheralId::generate)
            .clone()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiscoverParams {
    #[serde(default)]
    filters: Vec<FilterParams>,
    #[serde(default)]
    optional_services: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectParams {
    peripheral_id: PeripheralId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CharacteristicParams {
    service_id: Value,
    characteristic_id: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadParams {
    service_id: Value,
    characteristic_id: Value,
    #[serde(default)]
    start_notifications: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteParams {
    service_id: Value,
    characteristic_id: Value,
    message: String,
    #[serde(default)]
    encoding: Option<MessageEncoding>,
    #[serde(default)]
    with_response: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceParams {
    service_id: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DiscoveredPeripheral {
    peripheral_id: PeripheralId,
    name: String,
    rssi: i16,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CharacteristicChange {
    service_id: String,
    characteristic_id: String,
    #[serde(flatten)]
    value: EncodedMessage,
}

#[derive(Serialize)]
struct CharacteristicEntry {
    uuid: String,
    properties: CharacteristicProperties,
}

/// Device half of a `/scratch/ble` session, over any [`BleBackend`].
pub struct BleSession<B: BleBackend> {
    backend: Arc<B>,
    session: Arc<Session>,
    config: BleSessionConfig,
    state: Mutex<BleState<B>>,
    advertisements: mpsc::UnboundedSender<Advertisement<B>>,
    events: mpsc::UnboundedSender<BleEvent<B::Uuid>>,
}

impl<B: BleBackend> BleSession<B> {
    /// Create the session and start its event pump. The pump stops when
    /// `session` closes.
    pub fn start(backend: Arc<B>, session: Arc<Session>, config: BleSessionConfig) -> Arc<Self> {
        let (adv_tx, adv_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let adapter = backend.adapter_state();
        let this = Arc::new(Self {
            backend,
            session,
            config,
            state: Mutex::new(BleState::new()),
            advertisements: adv_tx,
            events: event_tx,
        });
        let _ = tokio::spawn(Arc::clone(&this).pump(adv_rx, event_rx, adapter));
        this
    }

    async fn pump(
        self: Arc<Self>,
        mut advertisements: mpsc::UnboundedReceiver<Advertisement<B>>,
        mut events: mpsc::UnboundedReceiver<BleEvent<B::Uuid>>,
        mut adapter: watch::Receiver<AdapterState>,
    ) {
        let cancel = self.session.cancellation();
        let mut adapter_live = true;
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(event) = events.recv() => self.on_event(event),
                Some(adv) = advertisements.recv() => self.on_advertisement(adv),
                changed = adapter.changed(), if adapter_live => match changed {
                    Ok(()) => {
                        let state = *adapter.borrow_and_update();
                        self.on_adapter(state);
                    }
                    Err(_) => adapter_live = false,
                },
            }
        }
        debug!(session_id = %self.session.id(), "ble pump stopped");
    }

    fn on_advertisement(&self, adv: Advertisement<B>) {
        if adv.rssi < self.config.min_rssi || !adv.connectable {
            return;
        }
        let report = {
            let mut state = self.state.lock();
            if state.phase != Phase::Discovering || !state.matches(&adv) {
                return;
            }
            let id = state.peripheral_id(&adv.peripheral);
            let _ = state.discovered.insert(id.clone(), adv.peripheral.clone());
            DiscoveredPeripheral {
                peripheral_id: id,
                name: adv.name.unwrap_or_default(),
                rssi: adv.rssi,
            }
        };
        let _ = self.session.send_notification("didDiscoverPeripheral", report);
    }

    fn on_event(&self, event: BleEvent<B::Uuid>) {
        match event {
            BleEvent::ValueChanged {
                service,
                characteristic,
                value,
            } => {
                let key = (service, characteristic);
                if !self.state.lock().notifying.contains(&key) {
                    return;
                }
                let (service, characteristic) = key;
                let change = CharacteristicChange {
                    service_id: service.to_string(),
                    characteristic_id: characteristic.to_string(),
                    value: EncodedMessage::base64(&value),
                };
                let _ = self.session.send_notification("characteristicDidChange", change);
            }
            BleEvent::Disconnected { reason } => {
                let phase = self.state.lock().phase;
                if matches!(phase, Phase::Connecting | Phase::Connected) {
                    self.fail(&RpcError::application(format!("peripheral disconnected: {reason}")));
                }
            }
        }
    }

    fn on_adapter(&self, adapter: AdapterState) {
        if adapter != AdapterState::Unavailable {
            return;
        }
        let phase = self.state.lock().phase;
        if !matches!(phase, Phase::Idle | Phase::Closed) {
            self.fail(&RpcError::application("Bluetooth adapter became unavailable"));
        }
    }

    fn fail(&self, error: &RpcError) {
        warn!(session_id = %self.session.id(), error = %error, "ble session failed");
        let _ = self.session.send_error(error);
        let _ = self.session.close("ble backend failure");
    }

    async fn discover(&self, params: DiscoverParams) -> Result<Value, RpcError> {
        let filters = params
            .filters
            .into_iter()
            .map(ScanFilter::from_params)
            .collect::<Result<Vec<_>, _>>()?;
        let optional = params
            .optional_services
            .iter()
            .map(|s| resolve_identifier::<B::Uuid>(s).map_err(|e| RpcError::invalid_params(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        if filters.is_empty() && optional.is_empty() {
            return Err(RpcError::invalid_params("discover requires filters or optionalServices"));
        }

        let mut allowed = HashSet::new();
        for service in filters.iter().flat_map(ScanFilter::services).chain(&optional) {
            blocklist::check_service(service)?;
            let _ = allowed.insert(service.clone());
        }

        self.ensure_can_discover()?;
        match wait_settled(self.backend.adapter_state(), self.config.adapter_settle_timeout).await {
            None => return Err(RpcError::timeout("Bluetooth adapter did not settle")),
            Some(AdapterState::Available) => {}
            Some(_) => return Err(RpcError::application("Bluetooth is unavailable")),
        }

        let scan_services: Vec<B::Uuid> = allowed.iter().cloned().collect();
        let (generation, previous) = {
            let mut state = self.state.lock();
            if !matches!(state.phase, Phase::Idle | Phase::Discovering) {
                return Err(RpcError::invalid_request("cannot discover while connected"));
            }
            state.phase = Phase::Discovering;
            state.filters = filters;
            state.allowed = allowed;
            state.discovered.clear();
            state.generation += 1;
            (state.generation, state.scan.take())
        };
        drop(previous);

        match self.backend.start_scan(scan_services, self.advertisements.clone()).await {
            Ok(scan) => {
                let mut state = self.state.lock();
                if state.generation == generation && state.phase == Phase::Discovering {
                    state.scan = Some(scan);
                }
                info!(session_id = %self.session.id(), filters = state.filters.len(), "ble discovery started");
                Ok(Value::Null)
            }
            Err(e) => {
                let mut state = self.state.lock();
                if state.generation == generation && state.phase == Phase::Discovering {
                    state.phase = Phase::Idle;
                }
                Err(e.into())
            }
        }
    }

    fn ensure_can_discover(&self) -> Result<(), RpcError> {
        match self.state.lock().phase {
            Phase::Idle | Phase::Discovering => Ok(()),
            Phase::Connecting | Phase::Connected => Err(RpcError::invalid_request("cannot discover while connected")),
            Phase::Closed => Err(RpcError::invalid_request("session is closed")),
        }
    }

    async fn connect(&self, params: ConnectParams) -> Result<Value, RpcError> {
        let id = params.peripheral_id;
        let (peripheral, scan) = {
            let mut state = self.state.lock();
            let Some(peripheral) = state.discovered.get(&id).cloned() else {
                return Err(RpcError::invalid_request(format!("unknown peripheral id: {id}")));
            };
            if state.phase != Phase::Discovering {
                return Err(RpcError::invalid_request("connect requires an active discovery"));
            }
            state.phase = Phase::Connecting;
            (peripheral, state.scan.take())
        };
        drop(scan);

        match self.backend.connect(&peripheral, self.events.clone()).await {
            Ok(connection) => {
                let connection = Arc::new(connection);
                {
                    let mut state = self.state.lock();
                    if state.phase == Phase::Connecting && !self.session.is_closed() {
                        state.phase = Phase::Connected;
                        state.connection = Some(connection);
                        info!(session_id = %self.session.id(), peripheral_id = %id, "ble peripheral connected");
                        return Ok(Value::Null);
                    }
                }
                let _ = tokio::spawn(async move { connection.disconnect().await });
                Err(RpcError::session_closed())
            }
            Err(e) => {
                let mut state = self.state.lock();
                if state.phase == Phase::Connecting {
                    state.phase = Phase::Discovering;
                }
                debug!(session_id = %self.session.id(), peripheral_id = %id, error = %e, "ble connect failed");
                Err(e.into())
            }
        }
    }

    fn connection(&self) -> Result<Arc<B::Connection>, RpcError> {
        let state = self.state.lock();
        match (state.phase, &state.connection) {
            (Phase::Connected, Some(connection)) => Ok(Arc::clone(connection)),
            _ => Err(RpcError::invalid_request("no peripheral connected")),
        }
    }

    fn allowed_service(&self, service: &Value) -> Result<B::Uuid, RpcError> {
        let service = resolve_identifier::<B::Uuid>(service).map_err(|e| RpcError::invalid_params(e.to_string()))?;
        blocklist::check_service(&service)?;
        if !self.state.lock().allowed.contains(&service) {
            return Err(RpcError::invalid_params(format!(
                "service {service} was not requested in filters or optionalServices"
            )));
        }
        Ok(service)
    }

    fn target(&self, service: &Value, characteristic: &Value, access: Access) -> Result<(B::Uuid, B::Uuid), RpcError> {
        let service = self.allowed_service(service)?;
        let characteristic =
            resolve_identifier::<B::Uuid>(characteristic).map_err(|e| RpcError::invalid_params(e.to_string()))?;
        blocklist::check_characteristic(&characteristic, access)?;
        Ok((service, characteristic))
    }

    async fn write(&self, params: WriteParams) -> Result<usize, RpcError> {
        let connection = self.connection()?;
        let (service, characteristic) = self.target(&params.service_id, &params.characteristic_id, Access::Write)?;
        let data = decode_message(&params.message, params.encoding)?;
        let with_response = params.with_response.unwrap_or(true);
        Ok(connection.write(&service, &characteristic, &data, with_response).await?)
    }

    async fn read(&self, params: ReadParams) -> Result<EncodedMessage, RpcError> {
        let connection = self.connection()?;
        let (service, characteristic) = self.target(&params.service_id, &params.characteristic_id, Access::Read)?;
        let value = connection.read(&service, &characteristic).await?;
        if params.start_notifications {
            self.set_notify(&connection, service, characteristic, true).await?;
        }
        Ok(EncodedMessage::base64(&value))
    }

    async fn notifications(&self, params: CharacteristicParams, enabled: bool) -> Result<Value, RpcError> {
        let connection = self.connection()?;
        let (service, characteristic) = self.target(&params.service_id, &params.characteristic_id, Access::Read)?;
        self.set_notify(&connection, service, characteristic, enabled).await?;
        Ok(Value::Null)
    }

    async fn set_notify(
        &self,
        connection: &B::Connection,
        service: B::Uuid,
        characteristic: B::Uuid,
        enabled: bool,
    ) -> Result<(), RpcError> {
        connection.set_notify(&service, &characteristic, enabled).await?;
        let mut state = self.state.lock();
        if enabled {
            let _ = state.notifying.insert((service, characteristic));
        } else {
            let _ = state.notifying.remove(&(service, characteristic));
        }
        Ok(())
    }

    async fn services(&self) -> Result<Vec<String>, RpcError> {
        let connection = self.connection()?;
        let offered = connection.services().await?;
        let state = self.state.lock();
        Ok(offered
            .into_iter()
            .filter(|s| state.allowed.contains(s) && !blocklist::is_service_blocked(s))
            .map(|s| s.to_string())
            .collect())
    }

    async fn characteristics(&self, params: ServiceParams) -> Result<Vec<CharacteristicEntry>, RpcError> {
        let connection = self.connection()?;
        let service = self.allowed_service(&params.service_id)?;
        let characteristics = connection.characteristics(&service).await?;
        Ok(characteristics
            .into_iter()
            .filter(|c| blocklist::check_characteristic(&c.uuid, Access::Read).is_ok())
            .map(|c| CharacteristicEntry {
                uuid: c.uuid.to_string(),
                properties: c.properties,
            })
            .collect())
    }
}

#[async_trait]
impl<B: BleBackend> DeviceSession for BleSession<B> {
    fn register_methods(self: Arc<Self>, registry: &mut MethodRegistry) {
        registry.register_bound("discover", &self, |this, p: DiscoverParams| async move { this.discover(p).await });
        registry.register_bound("connect", &self, |this, p: ConnectParams| async move { this.connect(p).await });
        registry.register_bound("write", &self, |this, p: WriteParams| async move { this.write(p).await });
        registry.register_bound("read", &self, |this, p: ReadParams| async move { this.read(p).await });
        registry.register_bound("startNotifications", &self, |this, p: CharacteristicParams| async move {
            this.notifications(p, true).await
        });
        registry.register_bound("stopNotifications", &self, |this, p: CharacteristicParams| async move {
            this.notifications(p, false).await
        });
        registry.register_bound("getServices", &self, |this, _p: Value| async move { this.services().await });
        registry.register_bound("getCharacteristics", &self, |this, p: ServiceParams| async move {
            this.characteristics(p).await
        });
    }

    async fn shutdown(&self) {
        let (connection, scan) = {
            let mut state = self.state.lock();
            state.phase = Phase::Closed;
            state.filters.clear();
            state.discovered.clear();
            state.notifying.clear();
            (state.connection.take(), state.scan.take())
        };
        drop(scan);
        if let Some(connection) = connection {
            connection.disconnect().await;
            info!(session_id = %self.session.id(), "ble peripheral released");
        }
    }
}
