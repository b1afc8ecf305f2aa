//! # link-settings
//!
//! Layered configuration for the gateway.
//!
//! Settings are resolved from three layers (in priority order):
//! 1. **Compiled defaults**: [`GatewaySettings::default()`]
//! 2. **User file**: `~/.scratch-link/settings.json`, deep-merged over defaults
//! 3. **Environment variables**: `SCRATCH_LINK_*` overrides
//!
//! The result is validated before it is returned; in particular the bind
//! host must be a loopback address.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, parse_log_format, settings_path, validate};
pub use types::*;
