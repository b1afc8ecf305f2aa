//! Settings errors.

use thiserror::Error;

/// Why gateway settings could not be produced.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read gateway settings: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not JSON, or a field has the wrong shape.
    #[error("malformed gateway settings: {0}")]
    Json(#[from] serde_json::Error),
    /// Well-formed, but the gateway refuses to run with it.
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

/// Shorthand for settings results.
pub type Result<T> = std::result::Result<T, SettingsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_file_message() {
        let err: SettingsError = serde_json::from_str::<serde_json::Value>("{port:").unwrap_err().into();
        assert!(err.to_string().starts_with("malformed gateway settings"));
    }

    #[test]
    fn invalid_value_message() {
        let err = SettingsError::InvalidValue("host 0.0.0.0 is not a loopback address".into());
        assert_eq!(
            err.to_string(),
            "invalid settings value: host 0.0.0.0 is not a loopback address"
        );
    }
}
