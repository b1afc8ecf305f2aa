//! RPC method dispatch.

pub mod registry;

pub use registry::{MethodHandler, MethodRegistry, parse_params};
