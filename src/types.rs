use crate::errors::ProviderError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub const JSONRPC_VERSION: &str = "2.0";

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RpcRequest {
    pub id: u64,
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl RpcRequest {
    /// Builds a request with a fresh process-unique id.
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self::with_id(next_request_id(), method, params)
    }

    pub fn with_id(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        RpcRequest {
            id,
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
        }
    }

    pub fn param(&self, index: usize) -> Option<&Value> {
        self.params.get(index)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Payload {
    Result(Value),
    Error(RpcError),
}

/// Either `{id, jsonrpc, result}` or `{id, jsonrpc, error}`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RpcResponse {
    pub id: u64,
    pub jsonrpc: String,
    #[serde(flatten)]
    pub payload: Payload,
}

impl RpcResponse {
    pub fn new(id: u64, jsonrpc: impl Into<String>, outcome: Result<Value, RpcError>) -> Self {
        let payload = match outcome {
            Ok(result) => Payload::Result(result),
            Err(error) => Payload::Error(error),
        };
        RpcResponse {
            id,
            jsonrpc: jsonrpc.into(),
            payload,
        }
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.payload {
            Payload::Result(v) => Some(v),
            Payload::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&RpcError> {
        match &self.payload {
            Payload::Result(_) => None,
            Payload::Error(e) => Some(e),
        }
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.payload {
            Payload::Result(v) => Ok(v),
            Payload::Error(e) => Err(e),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const SERVER_ERROR: i64 = -32000;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        RpcError {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, message)
    }

    /// Normalizes whatever the widget put in the `error` half of a reply.
    pub fn from_remote(error: Value) -> Self {
        if let Ok(e) = serde_json::from_value::<RpcError>(error.clone()) {
            return e;
        }
        let message = match &error {
            Value::String(s) => s.clone(),
            Value::Object(map) => map
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| error.to_string()),
            other => other.to_string(),
        };
        RpcError {
            code: Self::SERVER_ERROR,
            message,
            data: Some(error),
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for RpcError {}

impl From<ProviderError> for RpcError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Remote(error) => RpcError::from_remote(error),
            ProviderError::JsonError(e) => RpcError::new(RpcError::PARSE_ERROR, e.to_string()),
            other => RpcError::internal(other.to_string()),
        }
    }
}
