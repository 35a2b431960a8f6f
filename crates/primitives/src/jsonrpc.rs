use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The JSON-RPC protocol version string.
pub const JSONRPC_VERSION: &str = "2.0";

fn default_version() -> String {
    JSONRPC_VERSION.to_owned()
}

/// A single JSON-RPC 2.0 request envelope.
///
/// Batches are represented as `Vec<JsonRpcRequest>` at the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol version, always `"2.0"` on the wire.
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    /// Request id. Numbers, strings and null are all accepted.
    #[serde(default)]
    pub id: Value,
    /// Method name, e.g. `eth_getLogs`.
    pub method: String,
    /// Positional or named parameters.
    #[serde(default)]
    pub params: Value,
}

impl JsonRpcRequest {
    /// Creates a request with the given id, method and params.
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: default_version(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// Returns a copy of this request with a replaced id.
    ///
    /// Used by the batch coalescer, which rewrites ids so responses can be
    /// matched back to their callers.
    pub fn with_id(&self, id: impl Into<Value>) -> Self {
        Self { id: id.into(), ..self.clone() }
    }
}

/// A single JSON-RPC 2.0 response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Protocol version, always `"2.0"` on the wire.
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    /// Mirrors the request id.
    #[serde(default)]
    pub id: Value,
    /// Result payload, present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error object, present on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Creates a successful response.
    pub fn success(id: Value, result: Value) -> Self {
        Self { jsonrpc: default_version(), id, result: Some(result), error: None }
    }

    /// Creates an error response.
    pub fn error(id: Value, error: JsonRpcError) -> Self {
        Self { jsonrpc: default_version(), id, result: None, error: Some(error) }
    }

    /// Returns `true` if the response carries a result and no error object.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Returns `true` if the result is the kind of "nothing here" payload
    /// that the `retry-empty` directive treats as a miss: `null`, an empty
    /// array, an empty object or an empty hex string.
    pub fn is_empty_result(&self) -> bool {
        match &self.result {
            None => self.error.is_none(),
            Some(Value::Null) => true,
            Some(Value::Array(arr)) => arr.is_empty(),
            Some(Value::Object(map)) => map.is_empty(),
            Some(Value::String(s)) => s.is_empty() || s == "0x",
            Some(_) => false,
        }
    }

    /// Returns `true` if this is an explicit execution revert.
    ///
    /// Reverts are deterministic outcomes of the requested call, so they take
    /// part in consensus comparison even though they arrive as errors.
    pub fn is_execution_reverted(&self) -> bool {
        self.error.as_ref().is_some_and(|err| {
            err.code == 3 || err.message.to_ascii_lowercase().contains("execution reverted")
        })
    }
}

/// The JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Machine readable error code.
    pub code: i64,
    /// Human readable message.
    pub message: String,
    /// Optional structured payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Creates a new error object.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }

    /// Returns `true` if the code or message identifies an unknown method.
    pub fn is_method_not_found(&self) -> bool {
        self.code == -32601 || self.message.to_ascii_lowercase().contains("method not found")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_minimal_request() {
        let req: JsonRpcRequest =
            serde_json::from_value(json!({"method": "eth_chainId"})).unwrap();
        assert_eq!(req.jsonrpc, "2.0");
        assert_eq!(req.id, Value::Null);
        assert_eq!(req.params, Value::Null);
    }

    #[test]
    fn error_is_not_serialized_on_success() {
        let resp = JsonRpcResponse::success(json!(1), json!("0x1"));
        let wire = serde_json::to_value(&resp).unwrap();
        assert_eq!(wire, json!({"jsonrpc": "2.0", "id": 1, "result": "0x1"}));
    }

    #[test]
    fn empty_results() {
        assert!(JsonRpcResponse::success(json!(1), Value::Null).is_empty_result());
        assert!(JsonRpcResponse::success(json!(1), json!([])).is_empty_result());
        assert!(JsonRpcResponse::success(json!(1), json!("0x")).is_empty_result());
        assert!(!JsonRpcResponse::success(json!(1), json!("0x1")).is_empty_result());
    }

    #[test]
    fn revert_detection() {
        let resp = JsonRpcResponse::error(
            json!(1),
            JsonRpcError::new(-32000, "execution reverted: not owner"),
        );
        assert!(resp.is_execution_reverted());
        let resp = JsonRpcResponse::error(json!(1), JsonRpcError::new(-32601, "method not found"));
        assert!(!resp.is_execution_reverted());
        assert!(resp.error.unwrap().is_method_not_found());
    }
}
