//! Wire envelopes of the JSON-lines RPC transport.
//!
//! Every message is one JSON object terminated by `\n`. A request carries a
//! caller-chosen `id` that the matching response echoes back.

use crate::error::{CncError, RpcError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Upper bound on a single encoded message.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Status of a successful response.
pub const STATUS_OK: &str = "Ok";

/// Fault code peers use to ask the caller to come back later.
pub const STATUS_BUSY: &str = "Busy";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcResponse {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            status: STATUS_OK.to_string(),
            result: Some(result),
            error: None,
            data: None,
        }
    }

    pub fn fault(id: u64, fault: RpcFault) -> Self {
        Self {
            id,
            status: fault.code,
            result: None,
            error: Some(fault.message),
            data: fault.data,
        }
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        if self.status == STATUS_OK {
            return Ok(self.result.unwrap_or(Value::Null));
        }
        let message = self.error.unwrap_or_default();
        if self.status == STATUS_BUSY {
            return Err(RpcError::Busy(message));
        }
        Err(RpcError::Remote {
            code: self.status,
            message,
            data: self.data,
        })
    }
}

/// A handler-side failure, sent back as a non-`Ok` response.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcFault {
    pub code: String,
    pub message: String,
    pub data: Option<Value>,
}

impl RpcFault {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("InvalidRequest", message)
    }

    pub fn unknown_method(method: &str) -> Self {
        Self::invalid_request(format!("unknown method '{}'", method))
    }
}

impl From<CncError> for RpcFault {
    fn from(err: CncError) -> Self {
        let data = json!({
            "kind": err.kind(),
            "component": err.component(),
        });
        RpcFault::new(err.status().to_string(), err.to_string()).with_data(data)
    }
}

impl From<RpcError> for RpcFault {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Remote {
                code,
                message,
                data,
            } => RpcFault {
                code,
                message,
                data,
            },
            RpcError::Busy(message) => RpcFault::new(STATUS_BUSY, message),
            other => RpcFault::new("Unreachable", other.to_string()),
        }
    }
}

/// Extracts a required named parameter.
pub fn param<T: DeserializeOwned>(params: &Value, key: &str) -> Result<T, RpcFault> {
    let value = params
        .get(key)
        .ok_or_else(|| RpcFault::invalid_request(format!("missing parameter '{}'", key)))?;
    serde_json::from_value(value.clone())
        .map_err(|e| RpcFault::invalid_request(format!("bad parameter '{}': {}", key, e)))
}

/// Extracts an optional named parameter, falling back to `default`.
pub fn param_or<T: DeserializeOwned>(params: &Value, key: &str, default: T) -> Result<T, RpcFault> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(_) => param(params, key),
    }
}

/// Serializes a handler result.
pub fn to_value<T: Serialize>(value: T) -> Result<Value, RpcFault> {
    serde_json::to_value(value).map_err(|e| RpcFault::new("Internal", e.to_string()))
}
