//! Bluetooth Classic backend contract.

use std::fmt;
use std::hash::Hash;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::adapter::AdapterState;
use crate::error::BackendError;

/// One device found by an inquiry.
#[derive(Clone, Debug, PartialEq)]
pub struct BtInquiryResult<D, I> {
    /// Backend handle.
    pub device: D,
    /// Stable backend id; peripheral ids are keyed on it.
    pub device_id: I,
    /// Friendly name, when resolved.
    pub name: Option<String>,
    /// Signal strength in dBm, when reported.
    pub rssi: Option<i16>,
    /// Whether the host is already paired with the device.
    pub paired: bool,
}

/// Event on an open RFCOMM channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BtChannelEvent {
    /// Bytes received from the device.
    Data(Vec<u8>),
    /// The channel closed from the device side.
    Closed {
        /// Backend's description.
        reason: String,
    },
}

/// Platform Bluetooth Classic stack.
#[async_trait]
pub trait BtBackend: Send + Sync + 'static {
    /// Opaque device handle.
    type Device: Clone + fmt::Debug + Send + Sync + 'static;
    /// Stable device identity.
    type DeviceId: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;
    /// Inquiry in progress. Dropping it stops the inquiry.
    type Inquiry: Send + 'static;
    /// Open RFCOMM channel.
    type Channel: BtChannel;

    /// Current adapter state and its changes.
    fn adapter_state(&self) -> watch::Receiver<AdapterState>;

    /// Start a device inquiry restricted to a class of device.
    async fn start_inquiry(
        &self,
        major_device_class: u32,
        minor_device_class: u32,
        sink: mpsc::UnboundedSender<BtInquiryResult<Self::Device, Self::DeviceId>>,
    ) -> Result<Self::Inquiry, BackendError>;

    /// Pair with a device using `pin`.
    async fn pair(&self, device: &Self::Device, pin: &str) -> Result<(), BackendError>;

    /// Open the serial channel to a paired device.
    async fn open_channel(
        &self,
        device: &Self::Device,
        events: mpsc::UnboundedSender<BtChannelEvent>,
    ) -> Result<Self::Channel, BackendError>;
}

/// An open RFCOMM channel.
#[async_trait]
pub trait BtChannel: Send + Sync + 'static {
    /// Write one buffer, returning the bytes accepted.
    async fn write(&self, data: &[u8]) -> Result<usize, BackendError>;

    /// Release the channel.
    async fn close(&self);
}
