//! JSON-RPC 2.0 message model.
//!
//! A raw frame is classified before any structured decoding: an object with
//! a `result` or `error` key is a [`Response`], one with a `method` key is a
//! [`Request`] (or a [`Notification`] when it has no id). Anything else is a
//! parse error.
//!
//! On the way out every message is written with `jsonrpc` first, then the
//! known members, then any open-ended extra members. `params`, `id`,
//! `result` and `error` are omitted when null.

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::errors::{ErrorObject, RpcError};

/// Protocol version tag carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Request identifier. JSON-RPC allows numbers and strings.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer id.
    Number(i64),
    /// String id.
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

/// A call that expects exactly one Response.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    /// Identifier echoed by the Response.
    pub id: RequestId,
    /// Method name.
    pub method: String,
    /// Positional or named parameters.
    pub params: Option<Value>,
    /// Members outside the JSON-RPC envelope, preserved verbatim.
    pub extra: Map<String, Value>,
}

impl Request {
    /// Build a request with no extra members.
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
            extra: Map::new(),
        }
    }
}

/// A call that never produces a Response.
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    /// Method name.
    pub method: String,
    /// Positional or named parameters.
    pub params: Option<Value>,
    /// Members outside the JSON-RPC envelope.
    pub extra: Map<String, Value>,
}

impl Notification {
    /// Build a notification with no extra members.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            extra: Map::new(),
        }
    }
}

/// Reply to a [`Request`]. Carries exactly one of a result or an error.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    /// Id of the originating request; `None` for errors not tied to a request.
    pub id: Option<RequestId>,
    /// `Ok(result)` or `Err(error)`.
    pub payload: Result<Value, ErrorObject>,
    /// Members outside the JSON-RPC envelope.
    pub extra: Map<String, Value>,
}

impl Response {
    /// Successful response.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            payload: Ok(result),
            extra: Map::new(),
        }
    }

    /// Error response. `id` is `None` when the request id is unknown.
    pub fn failure(id: Option<RequestId>, error: &RpcError) -> Self {
        Self {
            id,
            payload: Err(error.to_error_object()),
            extra: Map::new(),
        }
    }

    /// Whether this response reports success.
    pub fn is_success(&self) -> bool {
        self.payload.is_ok()
    }

    /// Convert the payload into a handler-style result.
    pub fn into_result(self) -> Result<Value, RpcError> {
        self.payload.map_err(RpcError::from)
    }
}

/// Any JSON-RPC message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Call expecting a Response.
    Request(Request),
    /// Call without a Response.
    Notification(Notification),
    /// Reply to an earlier Request.
    Response(Response),
}

impl From<Request> for Message {
    fn from(r: Request) -> Self {
        Self::Request(r)
    }
}

impl From<Notification> for Message {
    fn from(n: Notification) -> Self {
        Self::Notification(n)
    }
}

impl From<Response> for Message {
    fn from(r: Response) -> Self {
        Self::Response(r)
    }
}

/// Why a raw frame could not be turned into a [`Message`].
#[derive(Clone, Debug, PartialEq)]
pub struct MessageError {
    /// Id recovered from the frame, if any.
    pub id: Option<RequestId>,
    /// Error to report (ParseError or InvalidRequest).
    pub error: RpcError,
    /// The frame looked like a Response; such failures are never answered.
    pub is_response: bool,
}

impl MessageError {
    fn parse(message: impl Into<String>) -> Self {
        Self {
            id: None,
            error: RpcError::Parse {
                message: message.into(),
            },
            is_response: false,
        }
    }

    fn invalid(id: Option<RequestId>, is_response: bool, message: impl Into<String>) -> Self {
        Self {
            id,
            error: RpcError::invalid_request(message),
            is_response,
        }
    }
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl std::error::Error for MessageError {}

/// Parse a raw text frame into a [`Message`].
pub fn parse_message(raw: &str) -> Result<Message, MessageError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| MessageError::parse(format!("Parse error: {e}")))?;
    parse_value(value)
}

/// Classify and decode an already-parsed JSON value.
pub fn parse_value(value: Value) -> Result<Message, MessageError> {
    let Value::Object(mut map) = value else {
        return Err(MessageError::parse("Parse error: expected a JSON object"));
    };

    let is_response = map.contains_key("result") || map.contains_key("error");
    let is_request = map.contains_key("method");
    if !is_response && !is_request {
        return Err(MessageError::parse(
            "Parse error: message is neither a request nor a response",
        ));
    }

    let id = match map.remove("id") {
        None | Some(Value::Null) => None,
        Some(raw_id) => Some(decode_id(raw_id).ok_or_else(|| {
            MessageError::invalid(None, is_response, "Invalid request: malformed id")
        })?),
    };

    match map.remove("jsonrpc") {
        Some(Value::String(v)) if v == JSONRPC_VERSION => {}
        _ => {
            return Err(MessageError::invalid(
                id,
                is_response,
                "Invalid request: jsonrpc must be \"2.0\"",
            ));
        }
    }

    if is_response && is_request {
        return Err(MessageError::invalid(
            id,
            false,
            "Invalid request: message has both method and result/error",
        ));
    }

    if is_response {
        decode_response(id, map)
    } else {
        decode_request(id, map)
    }
}

fn decode_id(value: Value) -> Option<RequestId> {
    match value {
        Value::String(s) => Some(RequestId::String(s)),
        Value::Number(n) => n.as_i64().map(RequestId::Number),
        _ => None,
    }
}

fn decode_request(id: Option<RequestId>, mut map: Map<String, Value>) -> Result<Message, MessageError> {
    let method = match map.remove("method") {
        Some(Value::String(m)) => m,
        _ => {
            return Err(MessageError::invalid(
                id,
                false,
                "Invalid request: method must be a string",
            ));
        }
    };

    let params = match map.remove("params") {
        None | Some(Value::Null) => None,
        Some(p @ (Value::Object(_) | Value::Array(_))) => Some(p),
        Some(_) => {
            return Err(MessageError::invalid(
                id,
                false,
                "Invalid request: params must be an object or an array",
            ));
        }
    };

    Ok(match id {
        Some(id) => Message::Request(Request {
            id,
            method,
            params,
            extra: map,
        }),
        None => Message::Notification(Notification {
            method,
            params,
            extra: map,
        }),
    })
}

fn decode_response(id: Option<RequestId>, mut map: Map<String, Value>) -> Result<Message, MessageError> {
    let result = map.remove("result");
    let error = match map.remove("error") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(serde_json::from_value::<ErrorObject>(raw).map_err(|e| {
            MessageError::invalid(id.clone(), true, format!("Invalid response: bad error object: {e}"))
        })?),
    };

    let payload = match (result, error) {
        (Some(_), Some(_)) => {
            return Err(MessageError::invalid(
                id,
                true,
                "Invalid response: both result and error present",
            ));
        }
        (_, Some(error)) => Err(error),
        (result, None) => Ok(result.unwrap_or(Value::Null)),
    };

    Ok(Message::Response(Response {
        id,
        payload,
        extra: map,
    }))
}

// ── Serialization ───────────────────────────────────────────────────

#[derive(Serialize)]
struct WireMessage<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a ErrorObject>,
    #[serde(flatten)]
    extra: &'a Map<String, Value>,
}

impl<'a> WireMessage<'a> {
    fn new(extra: &'a Map<String, Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: None,
            params: None,
            id: None,
            result: None,
            error: None,
            extra,
        }
    }
}

fn non_null(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

impl Serialize for Request {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireMessage {
            method: Some(&self.method),
            params: non_null(self.params.as_ref()),
            id: Some(&self.id),
            ..WireMessage::new(&self.extra)
        }
        .serialize(serializer)
    }
}

impl Serialize for Notification {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireMessage {
            method: Some(&self.method),
            params: non_null(self.params.as_ref()),
            ..WireMessage::new(&self.extra)
        }
        .serialize(serializer)
    }
}

impl Serialize for Response {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (result, error) = match &self.payload {
            Ok(result) => (non_null(Some(result)), None),
            Err(error) => (None, Some(error)),
        };
        WireMessage {
            id: self.id.as_ref(),
            result,
            error,
            ..WireMessage::new(&self.extra)
        }
        .serialize(serializer)
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Request(r) => r.serialize(serializer),
            Self::Notification(n) => n.serialize(serializer),
            Self::Response(r) => r.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        parse_value(value).map_err(|e| D::Error::custom(e.error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{INVALID_REQUEST, PARSE_ERROR};
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn parse_request_with_numeric_id() {
        let msg = parse_message(r#"{"jsonrpc":"2.0","id":7,"method":"discover","params":{"filters":[]}}"#)
            .unwrap();
        let Message::Request(req) = msg else {
            panic!("expected request");
        };
        assert_eq!(req.id, RequestId::Number(7));
        assert_eq!(req.method, "discover");
        assert_eq!(req.params.unwrap()["filters"], json!([]));
    }

    #[test]
    fn parse_request_with_string_id() {
        let msg = parse_message(r#"{"jsonrpc":"2.0","id":"abc","method":"connect"}"#).unwrap();
        assert_matches!(msg, Message::Request(Request { id: RequestId::String(ref s), .. }) if s == "abc");
    }

    #[test]
    fn missing_or_null_id_is_a_notification() {
        let msg = parse_message(r#"{"jsonrpc":"2.0","method":"keepalive"}"#).unwrap();
        assert_matches!(msg, Message::Notification(_));

        let msg = parse_message(r#"{"jsonrpc":"2.0","id":null,"method":"keepalive"}"#).unwrap();
        assert_matches!(msg, Message::Notification(_));
    }

    #[test]
    fn parse_success_response() {
        let msg = parse_message(r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#).unwrap();
        let Message::Response(resp) = msg else {
            panic!("expected response");
        };
        assert_eq!(resp.id, Some(RequestId::Number(3)));
        assert_eq!(resp.payload.unwrap()["ok"], true);
    }

    #[test]
    fn parse_error_response() {
        let msg = parse_message(
            r#"{"jsonrpc":"2.0","id":"x","error":{"code":-32500,"message":"no adapter"}}"#,
        )
        .unwrap();
        let Message::Response(resp) = msg else {
            panic!("expected response");
        };
        let err = resp.into_result().unwrap_err();
        assert_matches!(err, RpcError::Application { .. });
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let err = parse_message("{not json").unwrap_err();
        assert_eq!(err.error.code(), PARSE_ERROR);
        assert!(err.id.is_none());
    }

    #[test]
    fn object_without_discriminator_is_parse_error() {
        let err = parse_message(r#"{"jsonrpc":"2.0","id":1}"#).unwrap_err();
        assert_eq!(err.error.code(), PARSE_ERROR);
    }

    #[test]
    fn non_object_is_parse_error() {
        let err = parse_message("[1,2,3]").unwrap_err();
        assert_eq!(err.error.code(), PARSE_ERROR);
    }

    #[test]
    fn wrong_version_is_invalid_request_with_id() {
        let err = parse_message(r#"{"jsonrpc":"1.0","id":9,"method":"discover"}"#).unwrap_err();
        assert_eq!(err.error.code(), INVALID_REQUEST);
        assert_eq!(err.id, Some(RequestId::Number(9)));
        assert!(!err.is_response);
    }

    #[test]
    fn non_string_method_is_invalid_request() {
        let err = parse_message(r#"{"jsonrpc":"2.0","id":1,"method":5}"#).unwrap_err();
        assert_eq!(err.error.code(), INVALID_REQUEST);
    }

    #[test]
    fn scalar_params_are_invalid() {
        let err = parse_message(r#"{"jsonrpc":"2.0","id":1,"method":"m","params":3}"#).unwrap_err();
        assert_eq!(err.error.code(), INVALID_REQUEST);
    }

    #[test]
    fn response_with_both_result_and_error_is_invalid() {
        let err = parse_message(
            r#"{"jsonrpc":"2.0","id":1,"result":1,"error":{"code":1,"message":"x"}}"#,
        )
        .unwrap_err();
        assert!(err.is_response);
        assert_eq!(err.error.code(), INVALID_REQUEST);
    }

    #[test]
    fn extra_members_are_preserved() {
        let msg = parse_message(r#"{"jsonrpc":"2.0","method":"m","trace":"t1"}"#).unwrap();
        let Message::Notification(n) = msg else {
            panic!("expected notification");
        };
        assert_eq!(n.extra["trace"], "t1");
    }

    #[test]
    fn serialization_puts_jsonrpc_first_and_extras_last() {
        let mut req = Request::new(1, "discover", Some(json!({"a": 1})));
        let _ = req.extra.insert("zz".into(), json!(true));
        let text = serde_json::to_string(&req).unwrap();
        assert!(text.starts_with(r#"{"jsonrpc":"2.0","method":"discover""#), "{text}");
        assert!(text.ends_with(r#""zz":true}"#), "{text}");
    }

    #[test]
    fn null_members_are_omitted() {
        let n = Notification::new("keepalive", Some(Value::Null));
        assert_eq!(serde_json::to_string(&n).unwrap(), r#"{"jsonrpc":"2.0","method":"keepalive"}"#);

        let r = Response::success(RequestId::Number(2), Value::Null);
        assert_eq!(serde_json::to_string(&r).unwrap(), r#"{"jsonrpc":"2.0","id":2}"#);
    }

    #[test]
    fn notification_wire_snapshot() {
        let n = Notification::new(
            "didDiscoverPeripheral",
            Some(json!({"peripheralId": "p1", "name": "micro:bit", "rssi": -40})),
        );
        insta::assert_snapshot!(
            serde_json::to_string(&n).unwrap(),
            @r#"{"jsonrpc":"2.0","method":"didDiscoverPeripheral","params":{"name":"micro:bit","peripheralId":"p1","rssi":-40}}"#
        );
    }

    #[test]
    fn error_response_without_id() {
        let r = Response::failure(None, &RpcError::application("adapter lost"));
        let v = serde_json::to_value(&r).unwrap();
        assert!(v.get("id").is_none());
        assert_eq!(v["error"]["code"], -32500);
        assert_eq!(v["error"]["message"], "adapter lost");
    }

    #[test]
    fn message_deserialize_uses_classifier() {
        let msg: Message = serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":5}"#).unwrap();
        assert_matches!(msg, Message::Response(_));
        assert!(serde_json::from_str::<Message>(r#"{"jsonrpc":"2.0"}"#).is_err());
    }

    #[test]
    fn request_id_display() {
        assert_eq!(RequestId::from(12).to_string(), "12");
        assert_eq!(RequestId::from("r-1").to_string(), "r-1");
    }
}
