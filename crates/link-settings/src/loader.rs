//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`GatewaySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `SCRATCH_LINK_*` environment overrides
//! 4. Validate (loopback host, non-zero limits)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{GatewaySettings, LogFormat};

const ENV_PREFIX: &str = "SCRATCH_LINK_";

/// Default settings file, `~/.scratch-link/settings.json`.
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".scratch-link").join("settings.json")
}

/// Load from the default path with environment overrides.
pub fn load_settings() -> Result<GatewaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load from `path` with environment overrides.
///
/// A missing file yields defaults; an unreadable or malformed one is an error.
pub fn load_settings_from_path(path: &Path) -> Result<GatewaySettings> {
    load_with_env(path, |key| std::env::var(key).ok())
}

/// Load from `path`, reading overrides through `env` instead of the process
/// environment.
pub fn load_with_env(path: &Path, env: impl Fn(&str) -> Option<String>) -> Result<GatewaySettings> {
    let defaults = serde_json::to_value(GatewaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: GatewaySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, env);
    validate(&settings)?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `SCRATCH_LINK_*` overrides. Invalid values are logged and ignored.
pub fn apply_env_overrides(settings: &mut GatewaySettings, env: impl Fn(&str) -> Option<String>) {
    let read = |suffix: &str| {
        let key = format!("{ENV_PREFIX}{suffix}");
        env(&key).filter(|v| !v.is_empty()).map(|v| (key, v))
    };

    if let Some((_, v)) = read("HOST") {
        settings.server.host = v;
    }
    if let Some((key, v)) = read("PORT") {
        if let Some(port) = checked(&key, &v, parse_u16_range(&v, 0, u16::MAX)) {
            settings.server.port = port;
        }
    }
    if let Some((key, v)) = read("MAX_CONNECTIONS") {
        if let Some(n) = checked(&key, &v, parse_usize_range(&v, 1, 10_000)) {
            settings.server.max_connections = n;
        }
    }
    if let Some((key, v)) = read("MIN_RSSI") {
        if let Some(rssi) = checked(&key, &v, parse_i16_range(&v, -127, 20)) {
            settings.ble.min_rssi = rssi;
        }
    }
    if let Some((key, v)) = read("ADAPTER_SETTLE_TIMEOUT_MS") {
        if let Some(ms) = checked(&key, &v, parse_u64_range(&v, 1, 600_000)) {
            settings.ble.adapter_settle_timeout_ms = ms;
            settings.bt.adapter_settle_timeout_ms = ms;
        }
    }
    if let Some((_, v)) = read("DEFAULT_PIN") {
        settings.bt.default_pin = v;
    }
    if let Some((_, v)) = read("LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some((key, v)) = read("LOG_FORMAT") {
        if let Some(format) = checked(&key, &v, parse_log_format(&v)) {
            settings.logging.format = format;
        }
    }
}

/// Reject settings the gateway must not run with.
pub fn validate(settings: &GatewaySettings) -> Result<()> {
    let server = &settings.server;
    let ip: IpAddr = server
        .host
        .parse()
        .map_err(|_| SettingsError::InvalidValue(format!("host {} is not an IP address", server.host)))?;
    if !ip.is_loopback() {
        return Err(SettingsError::InvalidValue(format!(
            "host {ip} is not a loopback address"
        )));
    }
    if server.max_connections == 0 {
        return Err(SettingsError::InvalidValue("maxConnections must be at least 1".into()));
    }
    if server.send_queue_capacity == 0 {
        return Err(SettingsError::InvalidValue("sendQueueCapacity must be at least 1".into()));
    }
    if server.max_message_size == 0 {
        return Err(SettingsError::InvalidValue("maxMessageSize must be at least 1".into()));
    }
    if server.heartbeat_interval_secs == 0 || server.heartbeat_timeout_secs <= server.heartbeat_interval_secs {
        return Err(SettingsError::InvalidValue(
            "heartbeatTimeoutSecs must exceed a non-zero heartbeatIntervalSecs".into(),
        ));
    }
    Ok(())
}

fn checked<T>(key: &str, raw: &str, parsed: Option<T>) -> Option<T> {
    if parsed.is_none() {
        warn!(key, value = %raw, "invalid env var, ignoring");
    }
    parsed
}

// ── Pure parsing functions ──────────────────────────────────────────

/// Parse a `u16` within an inclusive range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse an `i16` within an inclusive range.
pub fn parse_i16_range(val: &str, min: i16, max: i16) -> Option<i16> {
    let n: i16 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a `usize` within an inclusive range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse `json` / `pretty`, case-insensitively.
pub fn parse_log_format(val: &str) -> Option<LogFormat> {
    match val.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" | "text" => Some(LogFormat::Pretty),
        _ => None,
    }
}
