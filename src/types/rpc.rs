use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Protocol version literal carried by every request and response.
pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC request id. Nodes echo back whatever they were given, so both
/// numeric and string ids are accepted on the way in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(u64),
    String(String),
}

impl Id {
    /// Reads an id out of a raw JSON value. Anything other than an unsigned
    /// integer or a string is not a usable id.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => number.as_u64().map(Id::Number),
            Value::String(string) => Some(Id::String(string.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Number(number) => write!(f, "{number}"),
            Id::String(string) => write!(f, "{string:?}"),
        }
    }
}

impl From<u64> for Id {
    fn from(id: u64) -> Self {
        Id::Number(id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Id,
    pub method: String,
    pub params: Vec<Value>,
}

impl JsonRpcRequest {
    pub fn new(method: &str, params: Vec<Value>, id: Id) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "jsonrpc": self.jsonrpc,
            "id": self.id,
            "method": self.method,
            "params": self.params,
        })
    }
}

/// The `error` member of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("Returned error: {message} (code {code})")]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Builds an error from whatever the node put in the `error` field.
    /// Well-formed `{code, message, data?}` objects are kept as they are;
    /// anything else is stringified into the message and kept as `data`.
    pub fn from_payload(error: &Value) -> Self {
        if let Ok(parsed) = serde_json::from_value::<JsonRpcError>(error.clone()) {
            return parsed;
        }

        let message = match error {
            Value::String(message) => message.clone(),
            other => other.to_string(),
        };
        Self {
            code: 0,
            message,
            data: Some(error.clone()),
        }
    }
}

/// `params` of a server-pushed `*_subscription` notification.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscriptionParams {
    pub subscription: String,
    #[serde(default)]
    pub result: Value,
}

impl SubscriptionParams {
    /// Extracts the subscription payload from an inbound message, if the
    /// message is a notification at all.
    pub fn from_message(message: &Value) -> Option<Self> {
        message.get("method")?;
        let params = message.get("params")?;
        serde_json::from_value(params.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_with_protocol_fields() {
        let request = JsonRpcRequest::new("eth_getBalance", vec![json!("0xabc"), json!("latest")], Id::Number(0));
        assert_eq!(
            request.to_value(),
            json!({
                "jsonrpc": "2.0",
                "id": 0,
                "method": "eth_getBalance",
                "params": ["0xabc", "latest"],
            })
        );
        assert_eq!(serde_json::to_value(&request).unwrap(), request.to_value());
    }

    #[test]
    fn ids_accept_numbers_and_strings() {
        assert_eq!(Id::from_value(&json!(7)), Some(Id::Number(7)));
        assert_eq!(Id::from_value(&json!("a1")), Some(Id::String("a1".into())));
        assert_eq!(Id::from_value(&json!(null)), None);
        assert_eq!(Id::from_value(&json!(-1)), None);
    }

    #[test]
    fn error_payload_keeps_structure_or_stringifies() {
        let structured = JsonRpcError::from_payload(&json!({"code": -32000, "message": "nonce too low"}));
        assert_eq!(structured.code, -32000);
        assert_eq!(structured.message, "nonce too low");
        assert_eq!(structured.data, None);

        let loose = JsonRpcError::from_payload(&json!("boom"));
        assert_eq!(loose.code, 0);
        assert_eq!(loose.message, "boom");
        assert_eq!(loose.data, Some(json!("boom")));
    }

    #[test]
    fn notification_params_are_extracted() {
        let message = json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": {"subscription": "0x9ce5", "result": {"number": "0x1"}},
        });
        let params = SubscriptionParams::from_message(&message).unwrap();
        assert_eq!(params.subscription, "0x9ce5");
        assert_eq!(params.result, json!({"number": "0x1"}));

        assert!(SubscriptionParams::from_message(&json!({"id": 1, "result": "0x0"})).is_none());
    }
}
