use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};

use crate::error::{TransportError, to_parse_error};

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonRpcKind {
    Request,
    Notification,
    Response,
    Error,
}

/// A JSON-RPC 2.0 message whose shape has been checked.
///
/// The original JSON value is kept untouched so the wire form survives a
/// round trip exactly, including members the protocol layer adds (`_meta`
/// and friends).
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcMessage {
    value: Value,
    kind: JsonRpcKind,
}

impl JsonRpcMessage {
    pub fn from_value(value: Value) -> Result<Self, TransportError> {
        let kind = classify(&value)?;
        Ok(Self { value, kind })
    }

    /// Parses and validates one wire frame.
    pub fn parse(text: &str) -> Result<Self, TransportError> {
        let value: Value = serde_json::from_str(text).map_err(to_parse_error)?;
        Self::from_value(value)
    }

    pub fn to_wire(&self) -> Result<String, TransportError> {
        serde_json::to_string(&self.value).map_err(|err| TransportError::Send(err.to_string()))
    }

    pub fn request(
        id: impl Into<Value>,
        method: &str,
        params: Option<Value>,
    ) -> Result<Self, TransportError> {
        let mut value = json!({ "jsonrpc": JSONRPC_VERSION, "id": id.into(), "method": method });
        if let Some(params) = params {
            value["params"] = params;
        }
        Self::from_value(value)
    }

    pub fn notification(method: &str, params: Option<Value>) -> Result<Self, TransportError> {
        let mut value = json!({ "jsonrpc": JSONRPC_VERSION, "method": method });
        if let Some(params) = params {
            value["params"] = params;
        }
        Self::from_value(value)
    }

    pub fn response(id: impl Into<Value>, result: Value) -> Result<Self, TransportError> {
        Self::from_value(json!({ "jsonrpc": JSONRPC_VERSION, "id": id.into(), "result": result }))
    }

    pub fn kind(&self) -> JsonRpcKind {
        self.kind
    }

    pub fn id(&self) -> Option<&Value> {
        self.value.get("id")
    }

    pub fn method(&self) -> Option<&str> {
        self.value.get("method").and_then(Value::as_str)
    }

    pub fn as_value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

impl TryFrom<Value> for JsonRpcMessage {
    type Error = TransportError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl Serialize for JsonRpcMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for JsonRpcMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(D::Error::custom)
    }
}

fn classify(value: &Value) -> Result<JsonRpcKind, TransportError> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid("message is not a JSON object"))?;

    match object.get("jsonrpc") {
        Some(Value::String(version)) if version == JSONRPC_VERSION => {}
        Some(other) => return Err(invalid(format!("unsupported jsonrpc version {other}"))),
        None => return Err(invalid("missing jsonrpc member")),
    }

    if let Some(method) = object.get("method") {
        if !method.is_string() {
            return Err(invalid("method must be a string"));
        }
        if object.contains_key("result") || object.contains_key("error") {
            return Err(invalid("request carries result or error"));
        }
        check_params(object)?;
        return match object.get("id") {
            Some(id) if is_valid_id(id) => Ok(JsonRpcKind::Request),
            Some(_) => Err(invalid("request id must be a string or number")),
            None => Ok(JsonRpcKind::Notification),
        };
    }

    match (object.get("result"), object.get("error")) {
        (Some(_), None) => match object.get("id") {
            Some(id) if is_valid_id(id) => Ok(JsonRpcKind::Response),
            _ => Err(invalid("response id must be a string or number")),
        },
        (None, Some(error)) => {
            match object.get("id") {
                Some(id) if is_valid_id(id) || id.is_null() => {}
                _ => return Err(invalid("error response id must be a string, number or null")),
            }
            check_error_object(error)?;
            Ok(JsonRpcKind::Error)
        }
        (Some(_), Some(_)) => Err(invalid("response carries both result and error")),
        (None, None) => Err(invalid("message is neither request, notification nor response")),
    }
}

fn check_params(object: &Map<String, Value>) -> Result<(), TransportError> {
    match object.get("params") {
        None | Some(Value::Object(_)) => Ok(()),
        Some(_) => Err(invalid("params must be an object")),
    }
}

fn check_error_object(error: &Value) -> Result<(), TransportError> {
    let error = error
        .as_object()
        .ok_or_else(|| invalid("error member must be an object"))?;
    match error.get("code") {
        Some(code) if code.is_i64() || code.is_u64() => {}
        _ => return Err(invalid("error code must be an integer")),
    }
    match error.get("message") {
        Some(Value::String(_)) => Ok(()),
        _ => Err(invalid("error message must be a string")),
    }
}

fn is_valid_id(id: &Value) -> bool {
    id.is_string() || id.is_number()
}

fn invalid(reason: impl Into<String>) -> TransportError {
    TransportError::Parse(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_the_four_shapes() {
        let request = JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","method":"listTools","id":1}"#)
            .expect("request");
        assert_eq!(request.kind(), JsonRpcKind::Request);
        assert_eq!(request.method(), Some("listTools"));

        let note = JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .expect("notification");
        assert_eq!(note.kind(), JsonRpcKind::Notification);

        let response = JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#)
            .expect("response");
        assert_eq!(response.kind(), JsonRpcKind::Response);
        assert_eq!(response.id(), Some(&json!(1)));

        let error = JsonRpcMessage::parse(
            r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#,
        )
        .expect("error");
        assert_eq!(error.kind(), JsonRpcKind::Error);
    }

    #[test]
    fn rejects_malformed_frames() {
        for frame in [
            "not json",
            "[1,2,3]",
            r#"{"method":"x","id":1}"#,
            r#"{"jsonrpc":"1.0","method":"x","id":1}"#,
            r#"{"jsonrpc":"2.0","method":7,"id":1}"#,
            r#"{"jsonrpc":"2.0","method":"x","id":{"nested":true}}"#,
            r#"{"jsonrpc":"2.0","method":"x","params":[1]}"#,
            r#"{"jsonrpc":"2.0","id":1}"#,
            r#"{"jsonrpc":"2.0","id":1,"result":{},"error":{"code":1,"message":"m"}}"#,
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":"bad","message":"m"}}"#,
            r#"{"jsonrpc":"2.0","result":{}}"#,
        ] {
            let err = JsonRpcMessage::parse(frame).expect_err(frame);
            assert!(matches!(err, TransportError::Parse(_)), "{frame}: {err:?}");
        }
    }

    #[test]
    fn wire_form_preserves_extra_members() {
        let original = json!({
            "jsonrpc": "2.0",
            "id": "abc",
            "method": "tools/call",
            "params": { "name": "echo", "arguments": { "message": "hi" }, "_meta": { "progressToken": 7 } }
        });
        let message = JsonRpcMessage::from_value(original.clone()).expect("valid");
        let wire = message.to_wire().expect("wire");
        let back = JsonRpcMessage::parse(&wire).expect("parse back");
        assert_eq!(back.as_value(), &original);
        assert_eq!(back, message);
    }

    #[test]
    fn serde_goes_through_validation() {
        let parsed: Result<JsonRpcMessage, _> = serde_json::from_str(r#"{"jsonrpc":"2.0"}"#);
        assert!(parsed.is_err());
        let built = JsonRpcMessage::request(1, "ping", None).expect("request");
        assert_eq!(
            serde_json::to_value(&built).expect("serialize"),
            json!({"jsonrpc":"2.0","id":1,"method":"ping"})
        );
    }
}
