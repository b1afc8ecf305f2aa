//! # link-device
//!
//! The contract between sessions and the platform Bluetooth stack.
//!
//! - [`ble`]: [`BleBackend`] / [`BleConnection`] for BLE scanning and GATT
//! - [`bt`]: [`BtBackend`] / [`BtChannel`] for Classic inquiry and RFCOMM
//! - [`adapter`]: the tri-state adapter model and the bounded settle wait
//! - [`sim`]: scriptable in-memory backends used by tests and the demo binary
//!
//! Backends deliver asynchronous events (advertisements, notifications,
//! inbound data, disconnects) by sending into channels owned by the session;
//! they never call back into session state directly.

#![deny(unsafe_code)]

pub mod adapter;
pub mod ble;
pub mod bt;
pub mod error;
pub mod sim;

pub use adapter::{AdapterState, wait_settled};
pub use ble::{
    BleAdvertisement, BleBackend, BleConnection, BleEvent, CharacteristicInfo,
    CharacteristicProperties,
};
pub use bt::{BtBackend, BtChannel, BtChannelEvent, BtInquiryResult};
pub use error::BackendError;
