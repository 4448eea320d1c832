use crate::{
    error::{Error, Result},
    types::{Id, JsonRpcError, JsonRpcRequest},
    validator::is_valid_response,
};
use serde_json::{json, Value};
use std::{collections::HashMap, fmt};

/// Applied to a successful result before it is handed back.
pub type Formatter = Box<dyn Fn(Value) -> Result<Value> + Send + Sync>;

pub struct BatchEntry {
    pub method: String,
    pub params: Vec<Value>,
    formatter: Option<Formatter>,
}

impl fmt::Debug for BatchEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchEntry")
            .field("method", &self.method)
            .field("params", &self.params)
            .field("formatter", &self.formatter.is_some())
            .finish()
    }
}

/// An ordered list of calls sent as one JSON-RPC array.
///
/// Ids are assigned when the batch is sent, by the client that sends it.
/// Results come back in the order calls were added, whatever order the node
/// answered in.
#[derive(Debug, Default)]
pub struct Batch {
    entries: Vec<BatchEntry>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, method: &str, params: Vec<Value>) -> &mut Self {
        self.push(method, params, None)
    }

    pub fn add_with(
        &mut self,
        method: &str,
        params: Vec<Value>,
        formatter: impl Fn(Value) -> Result<Value> + Send + Sync + 'static,
    ) -> &mut Self {
        self.push(method, params, Some(Box::new(formatter)))
    }

    fn push(&mut self, method: &str, params: Vec<Value>, formatter: Option<Formatter>) -> &mut Self {
        self.entries.push(BatchEntry {
            method: method.to_string(),
            params,
            formatter,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(method, params)` of every call, in order.
    pub fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.entries
            .iter()
            .map(|entry| (entry.method.clone(), entry.params.clone()))
            .collect()
    }

    /// Fans an array response back out to the calls.
    ///
    /// Responses are matched to `requests` by id. A response without a usable
    /// id falls back to its position in the array. Calls left without a
    /// response are checked against `{}` and so fail as invalid responses.
    pub fn distribute(self, requests: &[JsonRpcRequest], responses: Vec<Value>) -> Vec<Result<Value>> {
        let mut by_id = HashMap::new();
        let mut by_position = HashMap::new();
        for (index, response) in responses.into_iter().enumerate() {
            match response.get("id").and_then(Id::from_value) {
                Some(id) => {
                    by_id.insert(id, response);
                }
                None => {
                    by_position.insert(index, response);
                }
            }
        }

        self.entries
            .into_iter()
            .enumerate()
            .map(|(index, entry)| {
                let response = requests
                    .get(index)
                    .and_then(|request| by_id.remove(&request.id))
                    .or_else(|| by_position.remove(&index))
                    .unwrap_or_else(|| json!({}));
                settle(entry, response)
            })
            .collect()
    }
}

fn settle(entry: BatchEntry, mut response: Value) -> Result<Value> {
    if let Some(error) = response.get("error").filter(|error| !error.is_null()) {
        return Err(JsonRpcError::from_payload(error).into());
    }
    if !is_valid_response(&response) {
        return Err(Error::InvalidResponse(response.to_string()));
    }

    let result = response
        .get_mut("result")
        .map(Value::take)
        .unwrap_or(Value::Null);
    match entry.formatter {
        Some(formatter) => formatter(result),
        None => Ok(result),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requests(batch: &Batch) -> Vec<JsonRpcRequest> {
        batch
            .calls()
            .into_iter()
            .enumerate()
            .map(|(id, (method, params))| JsonRpcRequest::new(&method, params, Id::Number(id as u64)))
            .collect()
    }

    #[test]
    fn results_and_errors_go_to_their_calls() {
        let mut batch = Batch::new();
        batch.add("eth_getBalance", vec![json!("0xabc"), json!("latest")]);
        batch.add("eth_getCode", vec![json!("0xabc"), json!("latest")]);
        let requests = requests(&batch);

        let results = batch.distribute(
            &requests,
            vec![
                json!({"id": 0, "jsonrpc": "2.0", "result": "a"}),
                json!({"id": 1, "jsonrpc": "2.0", "error": {"code": -1, "message": "x"}}),
            ],
        );

        assert_eq!(results[0].as_ref().unwrap(), &json!("a"));
        match &results[1] {
            Err(Error::Node(error)) => {
                assert_eq!(error.code, -1);
                assert_eq!(error.message, "x");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn out_of_order_responses_are_matched_by_id() {
        let mut batch = Batch::new();
        batch.add("eth_blockNumber", vec![]).add("eth_chainId", vec![]);
        let requests = requests(&batch);

        let results = batch.distribute(
            &requests,
            vec![
                json!({"id": 1, "jsonrpc": "2.0", "result": "0x1"}),
                json!({"id": 0, "jsonrpc": "2.0", "result": "0x99"}),
            ],
        );
        assert_eq!(results[0].as_ref().unwrap(), &json!("0x99"));
        assert_eq!(results[1].as_ref().unwrap(), &json!("0x1"));
    }

    #[test]
    fn missing_responses_fail_as_invalid() {
        let mut batch = Batch::new();
        batch.add("eth_blockNumber", vec![]).add("eth_chainId", vec![]);
        let requests = requests(&batch);

        let results = batch.distribute(&requests, vec![json!({"id": 0, "jsonrpc": "2.0", "result": "0x1"})]);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(&results[1], Err(Error::InvalidResponse(body)) if body == "{}"));
    }

    #[test]
    fn id_less_errors_fall_back_to_position() {
        let mut batch = Batch::new();
        batch.add("eth_blockNumber", vec![]).add("eth_call", vec![]);
        let requests = requests(&batch);

        let results = batch.distribute(
            &requests,
            vec![
                json!({"id": 0, "jsonrpc": "2.0", "result": "0x1"}),
                json!({"id": null, "jsonrpc": "2.0", "error": {"code": -32700, "message": "parse error"}}),
            ],
        );
        assert!(matches!(&results[1], Err(Error::Node(error)) if error.code == -32700));
    }

    #[test]
    fn formatters_apply_to_results_only() {
        let mut batch = Batch::new();
        batch.add_with("eth_blockNumber", vec![], |value| {
            let hex = value.as_str().unwrap_or_default().trim_start_matches("0x").to_string();
            u64::from_str_radix(&hex, 16)
                .map(|number| json!(number))
                .map_err(|error| Error::InvalidResponse(error.to_string()))
        });
        batch.add_with("eth_chainId", vec![], |_| panic!("formatter must not run on errors"));
        let requests = requests(&batch);

        let results = batch.distribute(
            &requests,
            vec![
                json!({"id": 0, "jsonrpc": "2.0", "result": "0x10"}),
                json!({"id": 1, "jsonrpc": "2.0", "error": {"code": 3, "message": "reverted"}}),
            ],
        );
        assert_eq!(results[0].as_ref().unwrap(), &json!(16));
        assert!(results[1].is_err());
    }
}
