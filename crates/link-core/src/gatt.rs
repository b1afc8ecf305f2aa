//! GATT identifier normalisation.
//!
//! Clients name services and characteristics in several ways: a 16/32-bit
//! SIG alias (as a JSON number or a 4/8-digit hex string), a canonical
//! 128-bit UUID, or an assigned name such as `"battery_service"`. Everything
//! is normalised to the backend's UUID type through [`GattUuid`].

use std::fmt;
use std::hash::Hash;

use serde_json::Value;
use uuid::Uuid;

/// The Bluetooth Base UUID, `00000000-0000-1000-8000-00805f9b34fb`.
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Errors from identifier parsing.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum GattError {
    /// The text is neither a UUID, an alias, nor a known name.
    #[error("invalid GATT identifier: {0}")]
    InvalidIdentifier(String),
}

/// The UUID representation a backend works with.
pub trait GattUuid: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// Build from the 128-bit big-endian value.
    fn from_u128(value: u128) -> Self;

    /// Parse canonical hyphenated text, case-insensitively.
    fn parse_canonical(text: &str) -> Option<Self>;
}

impl GattUuid for Uuid {
    fn from_u128(value: u128) -> Self {
        Uuid::from_u128(value)
    }

    fn parse_canonical(text: &str) -> Option<Self> {
        if text.len() != 36 {
            return None;
        }
        Uuid::try_parse(text).ok()
    }
}

/// Expand a 16- or 32-bit SIG alias into its full UUID.
pub fn canonical_uuid<U: GattUuid>(alias: u32) -> U {
    U::from_u128((u128::from(alias) << 96) | BLUETOOTH_BASE_UUID)
}

/// Parse a canonical UUID, a short hex alias (optionally `0x`-prefixed), or
/// an assigned name.
pub fn make_uuid<U: GattUuid>(name: &str) -> Result<U, GattError> {
    let text = name.trim();
    if let Some(uuid) = U::parse_canonical(text) {
        return Ok(uuid);
    }

    let hex = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if matches!(hex.len(), 4 | 8) && hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        if let Ok(alias) = u32::from_str_radix(hex, 16) {
            return Ok(canonical_uuid(alias));
        }
    }

    let lowered = text.to_ascii_lowercase();
    ASSIGNED_NAMES
        .iter()
        .find(|(n, _)| *n == lowered)
        .map(|(_, alias)| canonical_uuid(*alias))
        .ok_or_else(|| GattError::InvalidIdentifier(name.to_owned()))
}

/// Resolve a JSON identifier (number alias or string) to a UUID.
pub fn resolve_identifier<U: GattUuid>(value: &Value) -> Result<U, GattError> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .map(canonical_uuid)
            .ok_or_else(|| GattError::InvalidIdentifier(n.to_string())),
        Value::String(s) => make_uuid(s),
        other => Err(GattError::InvalidIdentifier(other.to_string())),
    }
}

/// Bluetooth SIG assigned names accepted in place of a UUID.
const ASSIGNED_NAMES: &[(&str, u32)] = &[
    // services
    ("generic_access", 0x1800),
    ("generic_attribute", 0x1801),
    ("immediate_alert", 0x1802),
    ("link_loss", 0x1803),
    ("tx_power", 0x1804),
    ("device_information", 0x180a),
    ("heart_rate", 0x180d),
    ("battery_service", 0x180f),
    ("human_interface_device", 0x1812),
    ("cycling_speed_and_cadence", 0x1816),
    ("cycling_power", 0x1818),
    ("environmental_sensing", 0x181a),
    ("user_data", 0x181c),
    ("fitness_machine", 0x1826),
    // characteristics
    ("gap.device_name", 0x2a00),
    ("gap.appearance", 0x2a01),
    ("gap.peripheral_privacy_flag", 0x2a02),
    ("gap.reconnection_address", 0x2a03),
    ("battery_level", 0x2a19),
    ("model_number_string", 0x2a24),
    ("serial_number_string", 0x2a25),
    ("firmware_revision_string", 0x2a26),
    ("hardware_revision_string", 0x2a27),
    ("software_revision_string", 0x2a28),
    ("manufacturer_name_string", 0x2a29),
    ("heart_rate_measurement", 0x2a37),
    ("body_sensor_location", 0x2a38),
    ("temperature", 0x2a6e),
    ("humidity", 0x2a6f),
];

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn canonical_uuid_of_0x1234() {
        let uuid: Uuid = canonical_uuid(0x1234);
        assert_eq!(uuid.to_string(), "00001234-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn canonical_uuid_of_32_bit_alias() {
        let uuid: Uuid = canonical_uuid(0xdead_beef);
        assert_eq!(uuid.to_string(), "deadbeef-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn make_uuid_accepts_short_forms() {
        let expected: Uuid = canonical_uuid(0x180f);
        assert_eq!(make_uuid::<Uuid>("180f").unwrap(), expected);
        assert_eq!(make_uuid::<Uuid>("0x180F").unwrap(), expected);
        assert_eq!(make_uuid::<Uuid>("0000180f").unwrap(), expected);
        assert_eq!(make_uuid::<Uuid>("battery_service").unwrap(), expected);
    }

    #[test]
    fn make_uuid_accepts_uppercase_canonical() {
        let uuid = make_uuid::<Uuid>("0000180F-0000-1000-8000-00805F9B34FB").unwrap();
        assert_eq!(uuid, canonical_uuid::<Uuid>(0x180f));
    }

    #[test]
    fn make_uuid_rejects_garbage() {
        assert_matches!(make_uuid::<Uuid>("not-a-uuid"), Err(GattError::InvalidIdentifier(_)));
        assert_matches!(make_uuid::<Uuid>("12345"), Err(GattError::InvalidIdentifier(_)));
        assert_matches!(make_uuid::<Uuid>(""), Err(GattError::InvalidIdentifier(_)));
    }

    #[test]
    fn resolve_identifier_from_json() {
        let expected: Uuid = canonical_uuid(0x2a19);
        assert_eq!(resolve_identifier::<Uuid>(&json!(0x2a19)).unwrap(), expected);
        assert_eq!(resolve_identifier::<Uuid>(&json!("battery_level")).unwrap(), expected);
        assert!(resolve_identifier::<Uuid>(&json!(-1)).is_err());
        assert!(resolve_identifier::<Uuid>(&json!(true)).is_err());
        assert!(resolve_identifier::<Uuid>(&json!(u64::from(u32::MAX) + 1)).is_err());
    }

    proptest! {
        #[test]
        fn alias_lands_in_top_32_bits(alias in any::<u32>()) {
            let uuid: Uuid = canonical_uuid(alias);
            let text = uuid.to_string();
            let head = format!("{alias:08x}");
            prop_assert!(text.starts_with(&head));
            prop_assert!(text.ends_with("-0000-1000-8000-00805f9b34fb"));
        }

        #[test]
        fn canonical_text_round_trips(raw in any::<u128>()) {
            let uuid = Uuid::from_u128(raw);
            prop_assert_eq!(make_uuid::<Uuid>(&uuid.to_string()).unwrap(), uuid);
        }

        #[test]
        fn short_hex_matches_numeric_alias(alias in any::<u16>()) {
            let from_text = make_uuid::<Uuid>(&format!("{alias:04x}")).unwrap();
            prop_assert_eq!(from_text, canonical_uuid::<Uuid>(u32::from(alias)));
        }
    }
}
