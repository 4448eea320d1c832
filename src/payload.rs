use crate::{
    error::{Error, Result},
    types::{Id, JsonRpcRequest},
};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// Builds JSON-RPC requests with ids unique for the lifetime of one client.
///
/// Every client (and with it every connection) owns its own builder, so two
/// connections open at the same time never hand out colliding ids.
#[derive(Debug, Default)]
pub struct PayloadBuilder {
    next_id: AtomicU64,
}

impl PayloadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_payload(&self, method: &str, params: Vec<Value>) -> Result<JsonRpcRequest> {
        if method.is_empty() {
            return Err(Error::InvalidMethod {
                params: Value::Array(params).to_string(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(JsonRpcRequest::new(method, params, Id::Number(id)))
    }

    /// The id the next payload will receive.
    pub fn peek_id(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_payloads_count_up_from_zero() {
        let builder = PayloadBuilder::new();
        let first = builder
            .to_payload("eth_getBalance", vec![json!("0xabc"), json!("latest")])
            .unwrap();
        assert_eq!(
            first.to_value(),
            json!({"jsonrpc": "2.0", "id": 0, "method": "eth_getBalance", "params": ["0xabc", "latest"]})
        );

        let second = builder
            .to_payload("eth_getBalance", vec![json!("0xabc"), json!("latest")])
            .unwrap();
        assert_eq!(second.id, Id::Number(1));
    }

    #[test]
    fn ids_are_strictly_increasing() {
        let builder = PayloadBuilder::new();
        let mut last = None;
        for method in ["eth_blockNumber", "cfx_epochNumber", "net_version", "eth_chainId"] {
            let Id::Number(id) = builder.to_payload(method, vec![]).unwrap().id else {
                panic!("builder hands out numeric ids");
            };
            if let Some(last) = last {
                assert!(id > last);
            }
            last = Some(id);
        }
        assert_eq!(builder.peek_id(), 4);
    }

    #[test]
    fn empty_method_is_rejected_without_consuming_an_id() {
        let builder = PayloadBuilder::new();
        let error = builder.to_payload("", vec![json!("0x1")]).unwrap_err();
        assert!(matches!(&error, Error::InvalidMethod { params } if params == r#"["0x1"]"#));
        assert_eq!(builder.peek_id(), 0);
    }

    #[test]
    fn builders_do_not_share_counters() {
        let a = PayloadBuilder::new();
        let b = PayloadBuilder::new();
        a.to_payload("eth_blockNumber", vec![]).unwrap();
        assert_eq!(b.to_payload("eth_blockNumber", vec![]).unwrap().id, Id::Number(0));
    }
}
