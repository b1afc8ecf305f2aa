//! Payload encodings for `message` fields.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::errors::RpcError;

/// How a `message` string carries its bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageEncoding {
    /// Standard padded base64.
    Base64,
    /// Raw UTF-8 text.
    #[default]
    Utf8,
}

/// Outbound payload, always base64.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedMessage {
    /// Encoded bytes.
    pub message: String,
    /// Always [`MessageEncoding::Base64`] when produced by [`EncodedMessage::base64`].
    pub encoding: MessageEncoding,
}

impl EncodedMessage {
    /// Encode `bytes` as base64.
    pub fn base64(bytes: &[u8]) -> Self {
        Self {
            message: STANDARD.encode(bytes),
            encoding: MessageEncoding::Base64,
        }
    }
}

/// Decode a client-supplied `message`. A missing encoding means UTF-8.
pub fn decode_message(message: &str, encoding: Option<MessageEncoding>) -> Result<Vec<u8>, RpcError> {
    match encoding.unwrap_or_default() {
        MessageEncoding::Utf8 => Ok(message.as_bytes().to_vec()),
        MessageEncoding::Base64 => STANDARD
            .decode(message)
            .map_err(|e| RpcError::invalid_params(format!("message is not valid base64: {e}"))),
    }
}
