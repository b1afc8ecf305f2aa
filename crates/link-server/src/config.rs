//! Runtime configuration derived from [`GatewaySettings`].

use std::time::Duration;

use link_settings::GatewaySettings;

/// Per-connection transport limits.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Outbound frames buffered before the client is considered dead.
    pub send_queue_capacity: usize,
    /// Largest inbound text frame accepted for dispatch.
    pub max_message_size: usize,
    /// Interval between server Ping frames.
    pub heartbeat_interval: Duration,
    /// Client silence after which the connection is dropped.
    pub heartbeat_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: 256,
            max_message_size: 1024 * 1024,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
        }
    }
}

/// Listener configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Loopback bind address.
    pub host: String,
    /// Port; `0` for ephemeral.
    pub port: u16,
    /// Live sessions allowed at once.
    pub max_connections: usize,
    /// Limits applied to every connection.
    pub transport: TransportConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 32,
            transport: TransportConfig::default(),
        }
    }
}

/// BLE session tuning.
#[derive(Clone, Debug)]
pub struct BleSessionConfig {
    /// Advertisements below this RSSI are dropped.
    pub min_rssi: i16,
    /// Bound on the adapter settle wait in `discover`.
    pub adapter_settle_timeout: Duration,
}

impl Default for BleSessionConfig {
    fn default() -> Self {
        Self {
            min_rssi: -70,
            adapter_settle_timeout: Duration::from_secs(3),
        }
    }
}

/// Bluetooth Classic session tuning.
#[derive(Clone, Debug)]
pub struct BtSessionConfig {
    /// PIN used when `connect` supplies none.
    pub default_pin: String,
    /// Bound on the adapter settle wait in `discover`.
    pub adapter_settle_timeout: Duration,
}

impl Default for BtSessionConfig {
    fn default() -> Self {
        Self {
            default_pin: "0000".into(),
            adapter_settle_timeout: Duration::from_secs(3),
        }
    }
}

/// Everything the gateway needs at runtime.
#[derive(Clone, Debug, Default)]
pub struct GatewayConfig {
    /// Listener.
    pub server: ServerConfig,
    /// BLE sessions.
    pub ble: BleSessionConfig,
    /// Bluetooth Classic sessions.
    pub bt: BtSessionConfig,
}

impl From<&GatewaySettings> for GatewayConfig {
    fn from(settings: &GatewaySettings) -> Self {
        let server = &settings.server;
        Self {
            server: ServerConfig {
                host: server.host.clone(),
                port: server.port,
                max_connections: server.max_connections,
                transport: TransportConfig {
                    send_queue_capacity: server.send_queue_capacity,
                    max_message_size: server.max_message_size,
                    heartbeat_interval: Duration::from_secs(server.heartbeat_interval_secs),
                    heartbeat_timeout: Duration::from_secs(server.heartbeat_timeout_secs),
                },
            },
            ble: BleSessionConfig {
                min_rssi: settings.ble.min_rssi,
                adapter_settle_timeout: Duration::from_millis(settings.ble.adapter_settle_timeout_ms),
            },
            bt: BtSessionConfig {
                default_pin: settings.bt.default_pin.clone(),
                adapter_settle_timeout: Duration::from_millis(settings.bt.adapter_settle_timeout_ms),
            },
        }
    }
}
