//! # link-core
//!
//! Protocol foundation shared by every other crate in the gateway:
//!
//! - [`jsonrpc`]: JSON-RPC 2.0 message model, classifier, and ordered serialization
//! - [`errors`]: RPC error codes and the [`RpcError`](errors::RpcError) taxonomy
//! - [`value`]: narrowest-type decoding of JSON scalars
//! - [`gatt`]: Bluetooth UUID alias expansion and identifier parsing
//! - [`ids`]: opaque session and peripheral ids
//! - [`encoding`]: base64 / UTF-8 payload handling

#![deny(unsafe_code)]

pub mod encoding;
pub mod errors;
pub mod gatt;
pub mod ids;
pub mod jsonrpc;
pub mod value;

pub use errors::{ErrorObject, RpcError};
pub use ids::{PeripheralId, SessionId};
pub use jsonrpc::{Message, Notification, Request, RequestId, Response};
