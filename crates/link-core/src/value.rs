//! Narrowest-type decoding of JSON scalars.
//!
//! [`decode_value`] maps a JSON value onto the smallest in-memory type that
//! represents it exactly. Integers are probed in a fixed order:
//! `i8 → u8 → i16 → u16 → i32 → u32 → i64 → u64`, then anything else numeric
//! becomes `f64`. The order is a convenience for in-memory handling only;
//! the wire form is always plain JSON, and [`DecodedValue::to_json`] gives
//! back exactly the value that was decoded.
//!
//! Strings are checked for a canonical (lowercase, hyphenated) UUID first,
//! then for canonical padded base64, and otherwise stay text.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use uuid::Uuid;

/// A JSON value decoded into its narrowest natural representation.
#[derive(Clone, Debug, PartialEq)]
pub enum DecodedValue {
    /// JSON `null`.
    Null,
    /// JSON boolean.
    Bool(bool),
    /// Integer in `i8` range.
    I8(i8),
    /// Integer in `u8` range but not `i8`.
    U8(u8),
    /// Integer in `i16` range.
    I16(i16),
    /// Integer in `u16` range.
    U16(u16),
    /// Integer in `i32` range.
    I32(i32),
    /// Integer in `u32` range.
    U32(u32),
    /// Integer in `i64` range.
    I64(i64),
    /// Integer above `i64::MAX`.
    U64(u64),
    /// Non-integral number.
    F64(f64),
    /// Canonical UUID string.
    Uuid(Uuid),
    /// Canonical base64 string.
    Bytes(Vec<u8>),
    /// Any other string.
    String(String),
    /// Arrays and objects, passed through untouched.
    Structured(Value),
}

impl DecodedValue {
    /// Short name of the variant, for logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::I8(_) => "i8",
            Self::U8(_) => "u8",
            Self::I16(_) => "i16",
            Self::U16(_) => "u16",
            Self::I32(_) => "i32",
            Self::U32(_) => "u32",
            Self::I64(_) => "i64",
            Self::U64(_) => "u64",
            Self::F64(_) => "f64",
            Self::Uuid(_) => "uuid",
            Self::Bytes(_) => "bytes",
            Self::String(_) => "string",
            Self::Structured(_) => "structured",
        }
    }

    /// Integral value, if this is any integer variant that fits `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::I8(v) => Some(i64::from(v)),
            Self::U8(v) => Some(i64::from(v)),
            Self::I16(v) => Some(i64::from(v)),
            Self::U16(v) => Some(i64::from(v)),
            Self::I32(v) => Some(i64::from(v)),
            Self::U32(v) => Some(i64::from(v)),
            Self::I64(v) => Some(v),
            Self::U64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Convert back to the JSON value it was decoded from.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::I8(v) => Value::from(*v),
            Self::U8(v) => Value::from(*v),
            Self::I16(v) => Value::from(*v),
            Self::U16(v) => Value::from(*v),
            Self::I32(v) => Value::from(*v),
            Self::U32(v) => Value::from(*v),
            Self::I64(v) => Value::from(*v),
            Self::U64(v) => Value::from(*v),
            Self::F64(v) => Value::from(*v),
            Self::Uuid(u) => Value::String(u.hyphenated().to_string()),
            Self::Bytes(b) => Value::String(STANDARD.encode(b)),
            Self::String(s) => Value::String(s.clone()),
            Self::Structured(v) => v.clone(),
        }
    }
}

/// Decode `value` into its narrowest representation.
pub fn decode_value(value: &Value) -> DecodedValue {
    match value {
        Value::Null => DecodedValue::Null,
        Value::Bool(b) => DecodedValue::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                narrow_signed(i)
            } else if let Some(u) = n.as_u64() {
                DecodedValue::U64(u)
            } else {
                // serde_json only yields non-finite numbers for arbitrary-precision input.
                n.as_f64().map_or(DecodedValue::Structured(value.clone()), DecodedValue::F64)
            }
        }
        Value::String(s) => decode_string(s),
        Value::Array(_) | Value::Object(_) => DecodedValue::Structured(value.clone()),
    }
}

fn narrow_signed(i: i64) -> DecodedValue {
    if let Ok(v) = i8::try_from(i) {
        DecodedValue::I8(v)
    } else if let Ok(v) = u8::try_from(i) {
        DecodedValue::U8(v)
    } else if let Ok(v) = i16::try_from(i) {
        DecodedValue::I16(v)
    } else if let Ok(v) = u16::try_from(i) {
        DecodedValue::U16(v)
    } else if let Ok(v) = i32::try_from(i) {
        DecodedValue::I32(v)
    } else if let Ok(v) = u32::try_from(i) {
        DecodedValue::U32(v)
    } else {
        DecodedValue::I64(i)
    }
}

fn decode_string(s: &str) -> DecodedValue {
    if s.len() == 36 {
        if let Ok(uuid) = Uuid::parse_str(s) {
            // Only the lowercase hyphenated form converts back byte-for-byte.
            if uuid.hyphenated().to_string() == s {
                return DecodedValue::Uuid(uuid);
            }
        }
    }
    if looks_like_base64(s) {
        if let Ok(bytes) = STANDARD.decode(s) {
            return DecodedValue::Bytes(bytes);
        }
    }
    DecodedValue::String(s.to_owned())
}

fn looks_like_base64(s: &str) -> bool {
    !s.is_empty()
        && s.len() % 4 == 0
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
}
