//! GATT blocklist.
//!
//! Services that may never be requested, and characteristics that may never
//! be touched (or only read). Entries are canonical lowercase UUID strings so
//! the check works for any [`GattUuid`] whose `Display` is canonical.

use link_core::RpcError;
use link_core::gatt::GattUuid;

const BLOCKED_SERVICES: &[&str] = &[
    // Human Interface Device
    "00001812-0000-1000-8000-00805f9b34fb",
    // Nordic legacy DFU
    "00001530-1212-efde-1523-785feabcd123",
    // TI OAD
    "f000ffc0-0451-4000-b000-000000000000",
    // FIDO
    "00060000-0000-1000-8000-00805f9b34fb",
    "0000fffd-0000-1000-8000-00805f9b34fb",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Rule {
    Exclude,
    ExcludeWrites,
}

const BLOCKED_CHARACTERISTICS: &[(&str, Rule)] = &[
    // gap.peripheral_privacy_flag
    ("00002a02-0000-1000-8000-00805f9b34fb", Rule::ExcludeWrites),
    // gap.reconnection_address
    ("00002a03-0000-1000-8000-00805f9b34fb", Rule::Exclude),
    // serial_number_string
    ("00002a25-0000-1000-8000-00805f9b34fb", Rule::Exclude),
];

/// What a GATT operation does to a characteristic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// Read or subscribe.
    Read,
    /// Write with or without response.
    Write,
}

fn canonical<U: GattUuid>(uuid: &U) -> String {
    uuid.to_string().to_ascii_lowercase()
}

/// Whether `service` is blocked outright.
pub fn is_service_blocked<U: GattUuid>(service: &U) -> bool {
    let text = canonical(service);
    BLOCKED_SERVICES.contains(&text.as_str())
}

/// Fail with InvalidParams when `service` is blocked.
pub fn check_service<U: GattUuid>(service: &U) -> Result<(), RpcError> {
    if is_service_blocked(service) {
        Err(RpcError::invalid_params(format!("service {service} is blocklisted")))
    } else {
        Ok(())
    }
}

/// Fail with InvalidParams when `access` to `characteristic` is blocked.
pub fn check_characteristic<U: GattUuid>(characteristic: &U, access: Access) -> Result<(), RpcError> {
    let text = canonical(characteristic);
    let rule = BLOCKED_CHARACTERISTICS
        .iter()
        .find(|(uuid, _)| *uuid == text)
        .map(|(_, rule)| *rule);
    match (rule, access) {
        (Some(Rule::Exclude), _) | (Some(Rule::ExcludeWrites), Access::Write) => Err(RpcError::invalid_params(
            format!("characteristic {characteristic} is blocklisted"),
        )),
        _ => Ok(()),
    }
}
