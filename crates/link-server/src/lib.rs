//! # link-server
//!
//! Loopback WebSocket gateway serving JSON-RPC 2.0 sessions.
//!
//! - [`session`]: the per-connection engine (dispatch, pending requests, close)
//! - [`rpc`]: method registry with typed parameter decoding
//! - [`ble`] / [`bt`]: BLE GATT and Bluetooth Classic RFCOMM state machines
//! - [`diagnostic`]: the device-less session for unrecognised paths
//! - [`manager`]: creates sessions by path and bounds live connections
//! - [`server`]: axum listener, upgrade handling, graceful shutdown

#![deny(unsafe_code)]

pub mod ble;
pub mod bt;
pub mod config;
pub mod diagnostic;
pub mod manager;
pub mod rpc;
pub mod server;
pub mod session;
pub mod shutdown;

pub use config::{BleSessionConfig, BtSessionConfig, GatewayConfig, ServerConfig, TransportConfig};
pub use manager::SessionManager;
pub use server::{ServerError, ServerHandle, start};
pub use session::{PROTOCOL_VERSION, Session, SessionKind};
