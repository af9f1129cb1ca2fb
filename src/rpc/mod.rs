//! Request/response transport between the coordinator, its components and
//! operator tools.
//!
//! Messages are newline-delimited JSON over TCP. A failed call is reported
//! as an [`RpcError`](crate::error::RpcError), which the caller classifies as
//! transient (timeout, busy) or permanent.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::RpcClient;
pub use protocol::{param, param_or, to_value, RpcFault, RpcRequest, RpcResponse};
pub use server::{RpcHandler, RpcServer};
