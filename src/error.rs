//! Custom error types for the coordinator.
//!
//! This module defines the two error types used across the crate, using the
//! `thiserror` crate to keep error handling centralized and consistent.
//!
//! ## Error Hierarchy
//!
//! - **`RpcError`**: failures of a single remote call. A call either timed out
//!   or hit a busy peer (*transient*, retried by the caller), or the peer is
//!   gone / refused / answered with a fault (*permanent*).
//! - **`CncError`**: the coordinator taxonomy. Registry, builder and run-set
//!   operations all return it. Each variant maps onto a wire [`StatusCode`]
//!   and onto an operator [`ExitStatus`].
//!
//! By using `#[from]`, `CncError` can be created from the underlying error
//! types, so the `?` operator works throughout the crate.

use crate::component::ComponentId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the coordinator error type.
pub type CncResult<T> = std::result::Result<T, CncError>;

/// Failure of one remote procedure call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("call '{method}' timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    #[error("peer is busy: {0}")]
    Busy(String),

    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("connection closed by peer")]
    Closed,

    #[error("remote fault [{code}]: {message}")]
    Remote {
        code: String,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RpcError {
    /// Transient errors may be retried within the current transition.
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcError::Timeout { .. } | RpcError::Busy(_))
    }
}

/// Status codes carried by every coordinator RPC response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    NotFound,
    NoComponents,
    Missing,
    UnresolvedConnectors,
    CyclicWiring,
    DuplicateInstance,
    InvalidDescriptor,
    BadState,
    Unreachable,
    Timeout,
    ResetFailed,
    InvalidTransition,
    Cancelled,
    ConfigError,
    InvalidRequest,
    Internal,
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Exit codes of the operator tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success = 0,
    Unhealthy = 1,
    ConfigError = 2,
    Connectivity = 3,
    Cancelled = 4,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        self as i32
    }
}

#[derive(Error, Debug)]
pub enum CncError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Component {name}#{num} at {host}:{port} is already registered")]
    DuplicateInstance {
        name: String,
        num: u32,
        host: String,
        port: u16,
    },

    #[error("Invalid component descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("No components requested")]
    NoComponents,

    #[error("Incomplete run set, missing {}", .missing.join(", "))]
    IncompleteRunSet { missing: Vec<String> },

    #[error("Unresolved connectors: {}", .0.join(", "))]
    UnresolvedConnectors(Vec<String>),

    #[error("Cyclic ordering through {}", .0.join(", "))]
    CyclicWiring(Vec<String>),

    #[error("Run set {0} not found")]
    NotFound(u32),

    #[error("Component {id} unreachable: {reason}")]
    Unreachable { id: ComponentId, reason: String },

    #[error("Component {id} in state '{actual}', expected '{expected}'")]
    BadState {
        id: ComponentId,
        expected: String,
        actual: String,
    },

    #[error("Timed out during {operation}{}", .id.as_ref().map(|id| format!(" waiting for component {}", id)).unwrap_or_default())]
    Timeout {
        id: Option<ComponentId>,
        operation: String,
    },

    #[error("Component {id} failed to reset (final state '{state}')")]
    ResetFailed { id: ComponentId, state: String },

    #[error("Cannot {operation} a run set in state '{from}'")]
    InvalidTransition { from: String, operation: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Transport error: {0}")]
    Rpc(#[from] RpcError),

    #[error("{status}: {message}")]
    Remote { status: StatusCode, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CncError {
    /// Maps a failed call against component `id` onto the taxonomy.
    pub fn from_rpc(id: ComponentId, operation: &str, err: RpcError) -> Self {
        match err {
            RpcError::Timeout { .. } | RpcError::Busy(_) => CncError::Timeout {
                id: Some(id),
                operation: operation.to_string(),
            },
            RpcError::Remote { code, data, message } if code == "BadState" => {
                let field = |key: &str| {
                    data.as_ref()
                        .and_then(|d| d.get(key))
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                };
                CncError::BadState {
                    id,
                    expected: field("expected").unwrap_or_else(|| operation.to_string()),
                    actual: field("actual").unwrap_or(message),
                }
            }
            other => CncError::Unreachable {
                id,
                reason: other.to_string(),
            },
        }
    }

    /// Short kind string used in failure records.
    pub fn kind(&self) -> &'static str {
        match self {
            CncError::Config(_) | CncError::Configuration(_) => "ConfigError",
            CncError::Io(_) => "Io",
            CncError::DuplicateInstance { .. } => "DuplicateInstance",
            CncError::InvalidDescriptor(_) => "InvalidDescriptor",
            CncError::NoComponents => "NoComponents",
            CncError::IncompleteRunSet { .. } => "IncompleteRunSet",
            CncError::UnresolvedConnectors(_) => "UnresolvedConnectors",
            CncError::CyclicWiring(_) => "CyclicWiring",
            CncError::NotFound(_) => "NotFound",
            CncError::Unreachable { .. } => "Unreachable",
            CncError::BadState { .. } => "BadState",
            CncError::Timeout { .. } => "Timeout",
            CncError::ResetFailed { .. } => "ResetFailed",
            CncError::InvalidTransition { .. } => "InvalidTransition",
            CncError::Cancelled => "Cancelled",
            CncError::Rpc(_) => "Transport",
            CncError::Remote { .. } => "Remote",
            CncError::Internal(_) => "Internal",
        }
    }

    /// Offending component, if the error names one.
    pub fn component(&self) -> Option<ComponentId> {
        match self {
            CncError::Unreachable { id, .. }
            | CncError::BadState { id, .. }
            | CncError::ResetFailed { id, .. } => Some(*id),
            CncError::Timeout { id, .. } => *id,
            _ => None,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            CncError::Config(_) | CncError::Configuration(_) => StatusCode::ConfigError,
            CncError::Io(_) | CncError::Internal(_) => StatusCode::Internal,
            CncError::DuplicateInstance { .. } => StatusCode::DuplicateInstance,
            CncError::InvalidDescriptor(_) => StatusCode::InvalidDescriptor,
            CncError::NoComponents => StatusCode::NoComponents,
            CncError::IncompleteRunSet { .. } => StatusCode::Missing,
            CncError::UnresolvedConnectors(_) => StatusCode::UnresolvedConnectors,
            CncError::CyclicWiring(_) => StatusCode::CyclicWiring,
            CncError::NotFound(_) => StatusCode::NotFound,
            CncError::Unreachable { .. } => StatusCode::Unreachable,
            CncError::BadState { .. } => StatusCode::BadState,
            CncError::Timeout { .. } => StatusCode::Timeout,
            CncError::ResetFailed { .. } => StatusCode::ResetFailed,
            CncError::InvalidTransition { .. } => StatusCode::InvalidTransition,
            CncError::Cancelled => StatusCode::Cancelled,
            CncError::Rpc(RpcError::Timeout { .. }) => StatusCode::Timeout,
            CncError::Rpc(_) => StatusCode::Unreachable,
            CncError::Remote { status, .. } => *status,
        }
    }

    /// Exit status the operator tool reports for this error.
    pub fn exit_status(&self) -> ExitStatus {
        match self.status() {
            StatusCode::ConfigError
            | StatusCode::NoComponents
            | StatusCode::Missing
            | StatusCode::UnresolvedConnectors
            | StatusCode::CyclicWiring
            | StatusCode::InvalidRequest
            | StatusCode::DuplicateInstance
            | StatusCode::InvalidDescriptor => ExitStatus::ConfigError,
            StatusCode::Unreachable | StatusCode::Timeout => ExitStatus::Connectivity,
            StatusCode::Cancelled => ExitStatus::Cancelled,
            _ => ExitStatus::Unhealthy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CncError::IncompleteRunSet {
            missing: vec!["builder".to_string()],
        };
        assert_eq!(err.to_string(), "Incomplete run set, missing builder");
        assert_eq!(err.status(), StatusCode::Missing);
        assert_eq!(err.exit_status(), ExitStatus::ConfigError);
    }

    #[test]
    fn test_remote_bad_state_is_decoded() {
        let err = CncError::from_rpc(
            ComponentId(7),
            "startRun",
            RpcError::Remote {
                code: "BadState".into(),
                message: "idle".into(),
                data: Some(serde_json::json!({"expected": "ready", "actual": "idle"})),
            },
        );
        match err {
            CncError::BadState { id, expected, actual } => {
                assert_eq!(id, ComponentId(7));
                assert_eq!(expected, "ready");
                assert_eq!(actual, "idle");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(RpcError::Busy("x".into()).is_transient());
        assert!(!RpcError::Closed.is_transient());
        let err = CncError::from_rpc(ComponentId(1), "connect", RpcError::Closed);
        assert_eq!(err.status(), StatusCode::Unreachable);
        assert_eq!(err.component(), Some(ComponentId(1)));
        assert_eq!(err.exit_status(), ExitStatus::Connectivity);
    }
}
