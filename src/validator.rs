use crate::{
    error::{Error, Result},
    types::{Id, JsonRpcError, JsonRpcRequest, JSONRPC_VERSION},
};
use serde_json::Value;

/// Checks a raw response against the JSON-RPC response rules.
///
/// When `payload` is given the response id must match the request id. A
/// `null` result is a valid result; only a missing `result` member is not.
pub fn validate(response: &Value, payload: Option<&JsonRpcRequest>) -> Result<()> {
    let Some(object) = response.as_object() else {
        return Err(Error::InvalidResponse(format!(
            "Response should be of type Object, got {response}"
        )));
    };

    if let Some(error) = object.get("error").filter(|error| !error.is_null()) {
        return Err(JsonRpcError::from_payload(error).into());
    }

    if let Some(payload) = payload {
        let id = object.get("id");
        if id.and_then(Id::from_value).as_ref() != Some(&payload.id) {
            return Err(Error::IdMismatch {
                request: payload.id.clone(),
                response: id.map_or_else(|| "undefined".to_string(), Value::to_string),
            });
        }
    }

    if !object.contains_key("result") {
        return Err(Error::UndefinedResult);
    }

    Ok(())
}

/// Validates and unwraps the `result` member.
pub fn into_result(response: Value, payload: Option<&JsonRpcRequest>) -> Result<Value> {
    validate(&response, payload)?;
    match response {
        Value::Object(mut object) => Ok(object.remove("result").unwrap_or(Value::Null)),
        _ => Err(Error::UndefinedResult),
    }
}

/// Whether a single batch entry looks like a successful response.
pub fn is_valid_response(response: &Value) -> bool {
    let Some(object) = response.as_object() else {
        return false;
    };

    object.get("error").map_or(true, Value::is_null)
        && object.get("jsonrpc").and_then(Value::as_str) == Some(JSONRPC_VERSION)
        && matches!(object.get("id"), Some(Value::Number(_)) | Some(Value::String(_)))
        && object.contains_key("result")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(id: u64) -> JsonRpcRequest {
        JsonRpcRequest::new("eth_blockNumber", vec![], Id::Number(id))
    }

    #[test]
    fn accepts_well_formed_responses() {
        assert!(validate(&json!({"jsonrpc": "2.0", "id": 1, "result": "0x10"}), None).is_ok());
        assert!(validate(&json!({"jsonrpc": "2.0", "id": 1, "result": null}), Some(&request(1))).is_ok());
        assert!(validate(&json!({"jsonrpc": "2.0", "id": 1, "error": null, "result": 1}), None).is_ok());
    }

    #[test]
    fn rejects_non_objects() {
        for response in [json!(null), json!("0x1"), json!([{"id": 1, "result": 1}]), json!(3)] {
            assert!(matches!(validate(&response, None), Err(Error::InvalidResponse(_))));
        }
    }

    #[test]
    fn node_errors_keep_code_and_message() {
        let response = json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32601, "message": "method not found"}});
        match validate(&response, Some(&request(1))) {
            Err(Error::Node(error)) => {
                assert_eq!(error.code, -32601);
                assert_eq!(error.message, "method not found");
            }
            other => panic!("unexpected {other:?}"),
        }

        let loose = json!({"id": 1, "error": "overloaded"});
        assert!(matches!(validate(&loose, None), Err(Error::Node(error)) if error.message == "overloaded"));
    }

    #[test]
    fn error_takes_precedence_over_id_mismatch() {
        let response = json!({"jsonrpc": "2.0", "id": 9, "error": {"code": 1, "message": "x"}});
        assert!(matches!(validate(&response, Some(&request(1))), Err(Error::Node(_))));
    }

    #[test]
    fn id_mismatch_names_both_ids() {
        let response = json!({"jsonrpc": "2.0", "id": 2, "result": "0x1"});
        let error = validate(&response, Some(&request(1))).unwrap_err();
        assert!(matches!(&error, Error::IdMismatch { request, response } if *request == Id::Number(1) && response == "2"));

        let missing = json!({"jsonrpc": "2.0", "result": "0x1"});
        assert!(matches!(
            validate(&missing, Some(&request(1))),
            Err(Error::IdMismatch { response, .. }) if response == "undefined"
        ));
    }

    #[test]
    fn missing_result_is_undefined() {
        let response = json!({"jsonrpc": "2.0", "id": 1});
        assert!(matches!(validate(&response, None), Err(Error::UndefinedResult)));
        assert!(matches!(validate(&json!({}), None), Err(Error::UndefinedResult)));
    }

    #[test]
    fn into_result_unwraps_the_result() {
        let value = into_result(json!({"jsonrpc": "2.0", "id": 3, "result": ["a"]}), Some(&request(3))).unwrap();
        assert_eq!(value, json!(["a"]));
    }

    #[test]
    fn batch_entries_need_protocol_fields() {
        assert!(is_valid_response(&json!({"jsonrpc": "2.0", "id": 0, "result": "a"})));
        assert!(is_valid_response(&json!({"jsonrpc": "2.0", "id": "x", "result": null})));
        assert!(!is_valid_response(&json!({})));
        assert!(!is_valid_response(&json!({"jsonrpc": "1.0", "id": 0, "result": "a"})));
        assert!(!is_valid_response(&json!({"jsonrpc": "2.0", "result": "a"})));
        assert!(!is_valid_response(&json!({"jsonrpc": "2.0", "id": 0, "error": {"code": 1, "message": "x"}})));
    }
}
