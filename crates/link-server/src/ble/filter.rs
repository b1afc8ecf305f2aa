//! Scan filters supplied to `discover`.

use std::collections::BTreeMap;

use link_core::RpcError;
use link_core::gatt::{GattUuid, resolve_identifier};
use link_device::BleAdvertisement;
use serde::Deserialize;
use serde_json::Value;

/// One filter as it appears on the wire.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterParams {
    /// Exact advertised name.
    #[serde(default)]
    pub name: Option<String>,
    /// Advertised name prefix.
    #[serde(default)]
    pub name_prefix: Option<String>,
    /// Services that must all be advertised.
    #[serde(default)]
    pub services: Vec<Value>,
    /// Company id (decimal or `0x` hex) → data prefix.
    #[serde(default)]
    pub manufacturer_data: BTreeMap<String, ManufacturerDataParams>,
}

/// Manufacturer-data prefix, optionally masked.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManufacturerDataParams {
    /// Leading bytes the advertised data must match.
    #[serde(default)]
    pub data_prefix: Vec<u8>,
    /// Bits of `data_prefix` that take part in the comparison.
    #[serde(default)]
    pub mask: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct ManufacturerFilter {
    company: u16,
    prefix: Vec<u8>,
    mask: Vec<u8>,
}

impl ManufacturerFilter {
    fn matches(&self, data: &[u8]) -> bool {
        data.len() >= self.prefix.len()
            && self
                .prefix
                .iter()
                .zip(&self.mask)
                .zip(data)
                .all(|((p, m), d)| p & m == d & m)
    }
}

/// Validated filter. A peripheral matches when every present criterion holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanFilter<U> {
    name: Option<String>,
    name_prefix: Option<String>,
    services: Vec<U>,
    manufacturer_data: Vec<ManufacturerFilter>,
}

impl<U: GattUuid> ScanFilter<U> {
    /// Validate a wire filter.
    pub fn from_params(params: FilterParams) -> Result<Self, RpcError> {
        if params.name.is_none()
            && params.name_prefix.is_none()
            && params.services.is_empty()
            && params.manufacturer_data.is_empty()
        {
            return Err(RpcError::invalid_params("filter must specify at least one criterion"));
        }
        if params.name_prefix.as_deref() == Some("") {
            return Err(RpcError::invalid_params("namePrefix must not be empty"));
        }

        let services = params
            .services
            .iter()
            .map(|s| resolve_identifier::<U>(s).map_err(|e| RpcError::invalid_params(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;

        let manufacturer_data = params
            .manufacturer_data
            .into_iter()
            .map(|(company, data)| {
                let company = parse_company_id(&company)?;
                let mask = match data.mask {
                    Some(mask) if mask.len() != data.data_prefix.len() => {
                        return Err(RpcError::invalid_params(format!(
                            "manufacturerData mask for company {company:#06x} must match dataPrefix length"
                        )));
                    }
                    Some(mask) => mask,
                    None => vec![0xff; data.data_prefix.len()],
                };
                Ok(ManufacturerFilter {
                    company,
                    prefix: data.data_prefix,
                    mask,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: params.name,
            name_prefix: params.name_prefix,
            services,
            manufacturer_data,
        })
    }

    /// Services this filter requires.
    pub fn services(&self) -> &[U] {
        &self.services
    }

    /// Whether `adv` satisfies every criterion.
    pub fn matches<P>(&self, adv: &BleAdvertisement<P, U>) -> bool {
        if let Some(name) = &self.name {
            if adv.name.as_deref() != Some(name.as_str()) {
                return false;
            }
        }
        if let Some(prefix) = &self.name_prefix {
            if !adv.name.as_deref().is_some_and(|n| n.starts_with(prefix.as_str())) {
                return false;
            }
        }
        if !self.services.iter().all(|s| adv.services.contains(s)) {
            return false;
        }
        self.manufacturer_data.iter().all(|m| {
            adv.manufacturer_data
                .get(&m.company)
                .is_some_and(|data| m.matches(data))
        })
    }
}

fn parse_company_id(text: &str) -> Result<u16, RpcError> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => text.parse::<u16>(),
    };
    parsed.map_err(|_| RpcError::invalid_params(format!("invalid manufacturer company id: {text}")))
}
