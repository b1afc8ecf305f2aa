use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use link_core::gatt::canonical_uuid;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::{ActiveSink, emit_from_thread, send_from_thread};
use crate::adapter::AdapterState;
use crate::ble::{
    BleAdvertisement, BleBackend, BleConnection, BleEvent, CharacteristicInfo,
    CharacteristicProperties,
};
use crate::error::BackendError;

type Advertisement = BleAdvertisement<String, Uuid>;

/// A characteristic in a simulated GATT table.
#[derive(Clone, Debug)]
pub struct SimCharacteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Supported operations.
    pub properties: CharacteristicProperties,
    /// Current value.
    pub value: Vec<u8>,
}

impl SimCharacteristic {
    /// Readable and notifying.
    pub fn readable(uuid: Uuid, value: impl Into<Vec<u8>>) -> Self {
        Self {
            uuid,
            properties: CharacteristicProperties {
                read: true,
                notify: true,
                ..CharacteristicProperties::default()
            },
            value: value.into(),
        }
    }

    /// Writable with and without response.
    pub fn writable(uuid: Uuid) -> Self {
        Self {
            uuid,
            properties: CharacteristicProperties {
                write: true,
                write_without_response: true,
                ..CharacteristicProperties::default()
            },
            value: Vec::new(),
        }
    }
}

/// A simulated BLE peripheral, keyed by its address.
#[derive(Clone, Debug)]
pub struct SimPeripheral {
    /// Address; used as the backend peripheral handle.
    pub address: String,
    /// Advertised name.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: i16,
    /// Whether connections are accepted.
    pub connectable: bool,
    /// Advertised services.
    pub services: Vec<Uuid>,
    /// Manufacturer data by company id.
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    /// GATT table.
    pub gatt: BTreeMap<Uuid, Vec<SimCharacteristic>>,
}

impl SimPeripheral {
    /// A connectable peripheral at -50 dBm with no services.
    pub fn new(address: impl Into<String>, name: Option<&str>) -> Self {
        Self {
            address: address.into(),
            name: name.map(str::to_owned),
            rssi: -50,
            connectable: true,
            services: Vec::new(),
            manufacturer_data: BTreeMap::new(),
            gatt: BTreeMap::new(),
        }
    }

    /// Set the signal strength.
    #[must_use]
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    /// Mark as not accepting connections.
    #[must_use]
    pub fn non_connectable(mut self) -> Self {
        self.connectable = false;
        self
    }

    /// Advertise a service and give it a GATT table.
    #[must_use]
    pub fn with_service(mut self, service: Uuid, characteristics: Vec<SimCharacteristic>) -> Self {
        self.services.push(service);
        let _ = self.gatt.insert(service, characteristics);
        self
    }

    /// Add manufacturer data.
    #[must_use]
    pub fn with_manufacturer_data(mut self, company_id: u16, data: impl Into<Vec<u8>>) -> Self {
        let _ = self.manufacturer_data.insert(company_id, data.into());
        self
    }

    fn advertisement(&self) -> Advertisement {
        BleAdvertisement {
            peripheral: self.address.clone(),
            name: self.name.clone(),
            rssi: self.rssi,
            connectable: self.connectable,
            services: self.services.clone(),
            manufacturer_data: self.manufacturer_data.clone(),
        }
    }
}

/// A recorded GATT write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimWrite {
    /// Peripheral address.
    pub address: String,
    /// Service written to.
    pub service: Uuid,
    /// Characteristic written to.
    pub characteristic: Uuid,
    /// Bytes written.
    pub value: Vec<u8>,
    /// Whether a write response was requested.
    pub with_response: bool,
}

struct ConnEntry {
    id: u64,
    address: String,
    events: mpsc::UnboundedSender<BleEvent<Uuid>>,
    notifying: HashSet<(Uuid, Uuid)>,
}

#[derive(Default)]
struct Faults {
    scan: Option<BackendError>,
    connect: Option<BackendError>,
    write: Option<BackendError>,
}

struct Inner {
    adapter: watch::Sender<AdapterState>,
    peripherals: Mutex<BTreeMap<String, SimPeripheral>>,
    scans: Mutex<Vec<ActiveSink<Advertisement>>>,
    connections: Mutex<Vec<ConnEntry>>,
    faults: Mutex<Faults>,
    connect_delay: Mutex<Option<Duration>>,
    writes: Mutex<Vec<SimWrite>>,
    next_connection: AtomicU64,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

/// Scriptable BLE backend.
#[derive(Clone)]
pub struct SimulatedBle {
    inner: Arc<Inner>,
}

impl Default for SimulatedBle {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBle {
    /// Empty backend with an available adapter.
    pub fn new() -> Self {
        let (adapter, _) = watch::channel(AdapterState::Available);
        Self {
            inner: Arc::new(Inner {
                adapter,
                peripherals: Mutex::new(BTreeMap::new()),
                scans: Mutex::new(Vec::new()),
                connections: Mutex::new(Vec::new()),
                faults: Mutex::new(Faults::default()),
                connect_delay: Mutex::new(None),
                writes: Mutex::new(Vec::new()),
                next_connection: AtomicU64::new(1),
                connects: AtomicUsize::new(0),
                disconnects: AtomicUsize::new(0),
            }),
        }
    }

    /// Backend pre-populated with a few demo peripherals.
    pub fn demo() -> Self {
        let sim = Self::new();
        let microbit_tx = Uuid::from_u128(0x5261_da01_fa7e_42ab_850b_7c80_2200_97cc);
        let microbit_rx = Uuid::from_u128(0x5261_da02_fa7e_42ab_850b_7c80_2200_97cc);
        sim.add_peripheral(
            SimPeripheral::new("D0:00:00:00:00:01", Some("BBC micro:bit [demo]"))
                .with_rssi(-48)
                .with_service(
                    canonical_uuid(0xf005),
                    vec![
                        SimCharacteristic::readable(microbit_tx, vec![0; 20]),
                        SimCharacteristic::writable(microbit_rx),
                    ],
                ),
        );
        sim.add_peripheral(
            SimPeripheral::new("D0:00:00:00:00:02", Some("Demo Sensor"))
                .with_rssi(-60)
                .with_manufacturer_data(0x0397, [0x00, 0x80, 0x06])
                .with_service(
                    canonical_uuid(0x180f),
                    vec![SimCharacteristic::readable(canonical_uuid(0x2a19), [87])],
                )
                .with_service(
                    canonical_uuid(0x180a),
                    vec![
                        SimCharacteristic::readable(canonical_uuid(0x2a29), b"Scratch Link".to_vec()),
                        SimCharacteristic::readable(canonical_uuid(0x2a25), b"SN-0001".to_vec()),
                    ],
                ),
        );
        sim.add_peripheral(
            SimPeripheral::new("D0:00:00:00:00:03", Some("Far Away Tag"))
                .with_rssi(-95)
                .with_service(canonical_uuid(0x180f), Vec::new()),
        );
        sim
    }

    /// Change the adapter state seen by every session.
    pub fn set_adapter_state(&self, state: AdapterState) {
        let _ = self.inner.adapter.send_replace(state);
    }

    /// Add or replace a peripheral without announcing it.
    pub fn add_peripheral(&self, peripheral: SimPeripheral) {
        let _ = self
            .inner
            .peripherals
            .lock()
            .insert(peripheral.address.clone(), peripheral);
    }

    /// Add or replace a peripheral and advertise it to every active scan.
    pub fn advertise(&self, peripheral: SimPeripheral) {
        let advertisement = peripheral.advertisement();
        self.add_peripheral(peripheral);
        emit_from_thread(self.live_scans(), vec![advertisement]);
    }

    /// Push a value change for a subscribed characteristic.
    pub fn notify_value(&self, address: &str, service: Uuid, characteristic: Uuid, value: Vec<u8>) {
        let sinks: Vec<_> = self
            .inner
            .connections
            .lock()
            .iter()
            .filter(|c| c.address == address && c.notifying.contains(&(service, characteristic)))
            .map(|c| c.events.clone())
            .collect();
        send_from_thread(
            sinks,
            BleEvent::ValueChanged {
                service,
                characteristic,
                value,
            },
        );
    }

    /// Drop every connection to `address` from the peripheral side.
    pub fn drop_connection(&self, address: &str, reason: &str) {
        let sinks: Vec<_> = self
            .inner
            .connections
            .lock()
            .iter()
            .filter(|c| c.address == address)
            .map(|c| c.events.clone())
            .collect();
        send_from_thread(
            sinks,
            BleEvent::Disconnected {
                reason: reason.to_owned(),
            },
        );
    }

    /// Fail the next `start_scan` with `err`.
    pub fn fail_next_scan(&self, err: BackendError) {
        self.inner.faults.lock().scan = Some(err);
    }

    /// Fail the next `connect` with `err`.
    pub fn fail_next_connect(&self, err: BackendError) {
        self.inner.faults.lock().connect = Some(err);
    }

    /// Fail the next GATT write with `err`.
    pub fn fail_next_write(&self, err: BackendError) {
        self.inner.faults.lock().write = Some(err);
    }

    /// Make `connect` take `delay` before completing.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.inner.connect_delay.lock() = delay;
    }

    /// Successful connects so far.
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::Acquire)
    }

    /// `disconnect` calls so far.
    pub fn disconnect_count(&self) -> usize {
        self.inner.disconnects.load(Ordering::Acquire)
    }

    /// Scans whose guard is still alive.
    pub fn active_scan_count(&self) -> usize {
        self.live_scans().len()
    }

    /// Every GATT write, in the order received.
    pub fn writes(&self) -> Vec<SimWrite> {
        self.inner.writes.lock().clone()
    }

    fn live_scans(&self) -> Vec<ActiveSink<Advertisement>> {
        let mut scans = self.inner.scans.lock();
        scans.retain(ActiveSink::is_live);
        scans.clone()
    }
}

/// Scan guard; dropping it stops delivery.
pub struct SimScan {
    active: Arc<AtomicBool>,
}

impl fmt::Debug for SimScan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimScan")
            .field("active", &self.active.load(Ordering::Acquire))
            .finish()
    }
}

impl Drop for SimScan {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

#[async_trait]
impl BleBackend for SimulatedBle {
    type Uuid = Uuid;
    type Peripheral = String;
    type Scan = SimScan;
    type Connection = SimBleConnection;

    fn adapter_state(&self) -> watch::Receiver<AdapterState> {
        self.inner.adapter.subscribe()
    }

    async fn start_scan(
        &self,
        _services: Vec<Uuid>,
        sink: mpsc::UnboundedSender<Advertisement>,
    ) -> Result<SimScan, BackendError> {
        if *self.inner.adapter.borrow() != AdapterState::Available {
            return Err(BackendError::Unavailable);
        }
        if let Some(err) = self.inner.faults.lock().scan.take() {
            return Err(err);
        }

        let active = Arc::new(AtomicBool::new(true));
        let entry = ActiveSink {
            active: Arc::clone(&active),
            sink,
        };
        self.inner.scans.lock().push(entry.clone());

        let current: Vec<_> = self
            .inner
            .peripherals
            .lock()
            .values()
            .map(SimPeripheral::advertisement)
            .collect();
        emit_from_thread(vec![entry], current);
        Ok(SimScan { active })
    }

    async fn connect(
        &self,
        peripheral: &String,
        events: mpsc::UnboundedSender<BleEvent<Uuid>>,
    ) -> Result<SimBleConnection, BackendError> {
        if *self.inner.adapter.borrow() != AdapterState::Available {
            return Err(BackendError::Unavailable);
        }
        let delay = *self.inner.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.inner.faults.lock().connect.take() {
            return Err(err);
        }

        let connectable = self
            .inner
            .peripherals
            .lock()
            .get(peripheral)
            .map(|p| p.connectable);
        match connectable {
            None => return Err(BackendError::NotFound(peripheral.clone())),
            Some(false) => return Err(BackendError::Connect("peripheral is not connectable".into())),
            Some(true) => {}
        }

        let id = self.inner.next_connection.fetch_add(1, Ordering::AcqRel);
        self.inner.connections.lock().push(ConnEntry {
            id,
            address: peripheral.clone(),
            events,
            notifying: HashSet::new(),
        });
        let _ = self.inner.connects.fetch_add(1, Ordering::AcqRel);
        Ok(SimBleConnection {
            inner: Arc::clone(&self.inner),
            id,
            address: peripheral.clone(),
        })
    }
}

/// Connection to a [`SimPeripheral`].
pub struct SimBleConnection {
    inner: Arc<Inner>,
    id: u64,
    address: String,
}

impl fmt::Debug for SimBleConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimBleConnection")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl SimBleConnection {
    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.inner.connections.lock().iter().any(|c| c.id == self.id) {
            Ok(())
        } else {
            Err(BackendError::Disconnected)
        }
    }

    fn with_characteristic<T>(
        &self,
        service: &Uuid,
        characteristic: &Uuid,
        f: impl FnOnce(&mut SimCharacteristic) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        self.ensure_open()?;
        let mut peripherals = self.inner.peripherals.lock();
        let chars = peripherals
            .get_mut(&self.address)
            .and_then(|p| p.gatt.get_mut(service))
            .ok_or_else(|| BackendError::NotFound(format!("service {service}")))?;
        let ch = chars
            .iter_mut()
            .find(|c| c.uuid == *characteristic)
            .ok_or_else(|| BackendError::NotFound(format!("characteristic {characteristic}")))?;
        f(ch)
    }
}

#[async_trait]
impl BleConnection for SimBleConnection {
    type Uuid = Uuid;

    async fn services(&self) -> Result<Vec<Uuid>, BackendError> {
        self.ensure_open()?;
        Ok(self
            .inner
            .peripherals
            .lock()
            .get(&self.address)
            .map(|p| p.gatt.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn characteristics(&self, service: &Uuid) -> Result<Vec<CharacteristicInfo<Uuid>>, BackendError> {
        self.ensure_open()?;
        let peripherals = self.inner.peripherals.lock();
        let chars = peripherals
            .get(&self.address)
            .and_then(|p| p.gatt.get(service))
            .ok_or_else(|| BackendError::NotFound(format!("service {service}")))?;
        Ok(chars
            .iter()
            .map(|c| CharacteristicInfo {
                uuid: c.uuid,
                properties: c.properties,
            })
            .collect())
    }

    async fn read(&self, service: &Uuid, characteristic: &Uuid) -> Result<Vec<u8>, BackendError> {
        self.with_characteristic(service, characteristic, |ch| {
            if ch.properties.read {
                Ok(ch.value.clone())
            } else {
                Err(BackendError::Read("characteristic is not readable".into()))
            }
        })
    }

    async fn write(
        &self,
        service: &Uuid,
        characteristic: &Uuid,
        value: &[u8],
        with_response: bool,
    ) -> Result<usize, BackendError> {
        if let Some(err) = self.inner.faults.lock().write.take() {
            return Err(err);
        }
        self.with_characteristic(service, characteristic, |ch| {
            let allowed = if with_response {
                ch.properties.write
            } else {
                ch.properties.write_without_response
            };
            if !allowed {
                return Err(BackendError::Write("characteristic is not writable".into()));
            }
            ch.value = value.to_vec();
            Ok(())
        })?;
        self.inner.writes.lock().push(SimWrite {
            address: self.address.clone(),
            service: *service,
            characteristic: *characteristic,
            value: value.to_vec(),
            with_response,
        });
        Ok(value.len())
    }

    async fn set_notify(&self, service: &Uuid, characteristic: &Uuid, enabled: bool) -> Result<(), BackendError> {
        self.with_characteristic(service, characteristic, |ch| {
            if ch.properties.notify || ch.properties.indicate {
                Ok(())
            } else {
                Err(BackendError::Other("characteristic does not notify".into()))
            }
        })?;
        let mut connections = self.inner.connections.lock();
        if let Some(entry) = connections.iter_mut().find(|c| c.id == self.id) {
            let key = (*service, *characteristic);
            if enabled {
                let _ = entry.notifying.insert(key);
            } else {
                let _ = entry.notifying.remove(&key);
            }
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let _ = self.inner.disconnects.fetch_add(1, Ordering::AcqRel);
        self.inner.connections.lock().retain(|c| c.id != self.id);
    }
}
