//! Bluetooth Classic sessions.

mod session;

pub use session::BtSession;
