//! Backend failures and their RPC mapping.

use link_core::RpcError;

/// A failed backend call.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The adapter is off or missing.
    #[error("Bluetooth adapter unavailable")]
    Unavailable,
    /// Scanning or inquiry could not start.
    #[error("scan failed: {0}")]
    Scan(String),
    /// The peripheral could not be connected.
    #[error("connection failed: {0}")]
    Connect(String),
    /// Pairing was rejected or timed out.
    #[error("pairing failed: {0}")]
    Pairing(String),
    /// The RFCOMM channel would not open.
    #[error("channel failed to open: {0}")]
    Channel(String),
    /// A GATT read failed.
    #[error("read failed: {0}")]
    Read(String),
    /// A GATT or RFCOMM write failed.
    #[error("write failed: {0}")]
    Write(String),
    /// A service or characteristic does not exist on the peripheral.
    #[error("not found: {0}")]
    NotFound(String),
    /// The link dropped mid-operation.
    #[error("peripheral disconnected")]
    Disconnected,
    /// Anything the backend could not classify.
    #[error("{0}")]
    Other(String),
}

impl From<BackendError> for RpcError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Other(detail) => {
                tracing::warn!(%detail, "unclassified backend failure");
                RpcError::internal()
            }
            other => RpcError::application(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn domain_failures_are_application_errors() {
        let err: RpcError = BackendError::Pairing("bad pin".into()).into();
        assert_matches!(err, RpcError::Application { ref message, .. } if message == "pairing failed: bad pin");
        let err: RpcError = BackendError::Unavailable.into();
        assert_eq!(err.code(), link_core::errors::APPLICATION_ERROR);
    }

    #[test]
    fn unclassified_failures_are_internal_and_opaque() {
        let err: RpcError = BackendError::Other("hresult 0x8000ffff".into()).into();
        assert_eq!(err, RpcError::internal());
    }
}
