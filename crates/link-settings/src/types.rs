//! Settings type definitions.
//!
//! Field names are camelCase on disk. Every section carries
//! `#[serde(default)]`, so a settings file only needs the keys it changes.

use serde::{Deserialize, Serialize};

/// Root settings for the gateway process.
///
/// ```json
/// { "server": { "port": 20112 }, "ble": { "minRssi": -80 } }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    /// Listener and transport limits.
    pub server: ServerSettings,
    /// BLE session behaviour.
    pub ble: BleSettings,
    /// Bluetooth Classic session behaviour.
    pub bt: BtSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

/// Listener and per-connection transport settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address. Must be a loopback address.
    pub host: String,
    /// Listen port; `0` picks an ephemeral port.
    pub port: u16,
    /// Live sessions allowed at once; further upgrades get HTTP 503.
    pub max_connections: usize,
    /// Outbound frames buffered per session before it is considered dead.
    pub send_queue_capacity: usize,
    /// Largest inbound frame, in bytes.
    pub max_message_size: usize,
    /// Seconds between server ping frames.
    pub heartbeat_interval_secs: u64,
    /// Seconds of client silence before the connection is dropped.
    pub heartbeat_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 20111,
            max_connections: 32,
            send_queue_capacity: 256,
            max_message_size: 1024 * 1024,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
        }
    }
}

/// BLE session settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BleSettings {
    /// Advertisements weaker than this (dBm) are never reported.
    pub min_rssi: i16,
    /// Bound on waiting for the adapter to leave a transitional state.
    pub adapter_settle_timeout_ms: u64,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            min_rssi: -70,
            adapter_settle_timeout_ms: 3000,
        }
    }
}

/// Bluetooth Classic session settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BtSettings {
    /// PIN used for pairing when the client supplies none.
    pub default_pin: String,
    /// Bound on waiting for the adapter to leave a transitional state.
    pub adapter_settle_timeout_ms: u64,
}

impl Default for BtSettings {
    fn default() -> Self {
        Self {
            default_pin: "0000".to_string(),
            adapter_settle_timeout_ms: 3000,
        }
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human-readable, for terminals.
    Pretty,
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level directive (`error`..`trace`). `RUST_LOG` takes precedence.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}
