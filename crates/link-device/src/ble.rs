//! BLE backend contract.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;

use async_trait::async_trait;
use link_core::gatt::GattUuid;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::adapter::AdapterState;
use crate::error::BackendError;

/// One advertisement seen during a scan.
#[derive(Clone, Debug, PartialEq)]
pub struct BleAdvertisement<P, U> {
    /// Backend handle; also the identity peripheral ids are keyed on.
    pub peripheral: P,
    /// Advertised or cached local name.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: i16,
    /// Whether the peripheral accepts connections.
    pub connectable: bool,
    /// Advertised and resolved service UUIDs.
    pub services: Vec<U>,
    /// Manufacturer data keyed by company id.
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
}

/// Event on an open BLE connection.
#[derive(Clone, Debug, PartialEq)]
pub enum BleEvent<U> {
    /// A subscribed characteristic changed value.
    ValueChanged {
        /// Owning service.
        service: U,
        /// Characteristic that changed.
        characteristic: U,
        /// New value.
        value: Vec<u8>,
    },
    /// The link dropped, or the adapter went away.
    Disconnected {
        /// Backend's description.
        reason: String,
    },
}

/// GATT characteristic properties.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(clippy::struct_excessive_bools)]
pub struct CharacteristicProperties {
    /// Readable.
    pub read: bool,
    /// Writable with response.
    pub write: bool,
    /// Writable without response.
    pub write_without_response: bool,
    /// Supports notifications.
    pub notify: bool,
    /// Supports indications.
    pub indicate: bool,
}

/// A characteristic and what it supports.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CharacteristicInfo<U> {
    /// Characteristic UUID.
    pub uuid: U,
    /// Supported operations.
    pub properties: CharacteristicProperties,
}

/// Platform BLE stack.
#[async_trait]
pub trait BleBackend: Send + Sync + 'static {
    /// UUID representation used by this platform.
    type Uuid: GattUuid;
    /// Opaque peripheral handle.
    type Peripheral: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;
    /// Scan in progress. Dropping it stops the scan.
    type Scan: Send + 'static;
    /// Open connection.
    type Connection: BleConnection<Uuid = Self::Uuid>;

    /// Current adapter state and its changes.
    fn adapter_state(&self) -> watch::Receiver<AdapterState>;

    /// Start scanning. `services` is a hint; the backend may report more.
    async fn start_scan(
        &self,
        services: Vec<Self::Uuid>,
        sink: mpsc::UnboundedSender<BleAdvertisement<Self::Peripheral, Self::Uuid>>,
    ) -> Result<Self::Scan, BackendError>;

    /// Connect to a peripheral seen during a scan.
    async fn connect(
        &self,
        peripheral: &Self::Peripheral,
        events: mpsc::UnboundedSender<BleEvent<Self::Uuid>>,
    ) -> Result<Self::Connection, BackendError>;
}

/// An open GATT connection.
#[async_trait]
pub trait BleConnection: Send + Sync + 'static {
    /// UUID representation used by this platform.
    type Uuid: GattUuid;

    /// Primary services offered by the peripheral.
    async fn services(&self) -> Result<Vec<Self::Uuid>, BackendError>;

    /// Characteristics of one service.
    async fn characteristics(
        &self,
        service: &Self::Uuid,
    ) -> Result<Vec<CharacteristicInfo<Self::Uuid>>, BackendError>;

    /// Read a characteristic value.
    async fn read(&self, service: &Self::Uuid, characteristic: &Self::Uuid) -> Result<Vec<u8>, BackendError>;

    /// Write a characteristic value, returning the bytes accepted.
    async fn write(
        &self,
        service: &Self::Uuid,
        characteristic: &Self::Uuid,
        value: &[u8],
        with_response: bool,
    ) -> Result<usize, BackendError>;

    /// Enable or disable value-change events for a characteristic.
    async fn set_notify(
        &self,
        service: &Self::Uuid,
        characteristic: &Self::Uuid,
        enabled: bool,
    ) -> Result<(), BackendError>;

    /// Release the connection.
    async fn disconnect(&self);
}
