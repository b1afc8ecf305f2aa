//! BLE sessions: scan filters, the GATT blocklist, and the session state
//! machine.

pub mod blocklist;
pub mod filter;
mod session;

pub use filter::{FilterParams, ScanFilter};
pub use session::BleSession;
