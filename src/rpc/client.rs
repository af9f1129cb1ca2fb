//! RPC client with one persistent connection per callee.

use super::protocol::{RpcRequest, RpcResponse, MAX_LINE_LENGTH};
use crate::error::RpcError;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::debug;

type Connection = Framed<TcpStream, LinesCodec>;

/// Calls made through one client are serialized, so a caller observes its
/// requests to a given peer in issue order.
pub struct RpcClient {
    addr: String,
    timeout: Duration,
    connection: Mutex<Option<Connection>>,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self::with_addr(format!("{}:{}", host, port), timeout)
    }

    /// Client for a `host:port` address.
    pub fn with_addr(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            connection: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Issues `method` and waits at most the client timeout for its answer.
    ///
    /// A connection that failed or timed out is dropped and re-opened on the
    /// next call.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let request = RpcRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: method.to_string(),
            params,
        };

        let mut slot = self.connection.lock().await;
        let outcome = tokio::time::timeout(self.timeout, exchange(&mut slot, &self.addr, &request))
            .await
            .unwrap_or_else(|_| {
                Err(RpcError::Timeout {
                    method: method.to_string(),
                    after: self.timeout,
                })
            });

        match outcome {
            Ok(response) => response.into_result(),
            Err(err) => {
                debug!("rpc {} to {} failed: {}", method, self.addr, err);
                *slot = None;
                Err(err)
            }
        }
    }
}

async fn exchange(
    slot: &mut Option<Connection>,
    addr: &str,
    request: &RpcRequest,
) -> Result<RpcResponse, RpcError> {
    if slot.is_none() {
        let stream = TcpStream::connect(addr).await.map_err(connect_error)?;
        stream.set_nodelay(true).map_err(connect_error)?;
        *slot = Some(Framed::new(
            stream,
            LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        ));
    }
    let connection = slot.as_mut().ok_or(RpcError::Closed)?;

    let line = serde_json::to_string(request).map_err(|e| RpcError::Protocol(e.to_string()))?;
    connection.send(line).await.map_err(codec_error)?;

    loop {
        let line = match connection.next().await {
            Some(line) => line.map_err(codec_error)?,
            None => return Err(RpcError::Closed),
        };
        let response: RpcResponse =
            serde_json::from_str(&line).map_err(|e| RpcError::Protocol(e.to_string()))?;
        // Late answers to calls that already timed out are skipped.
        if response.id == request.id {
            return Ok(response);
        }
    }
}

fn connect_error(err: io::Error) -> RpcError {
    RpcError::Unreachable(err.to_string())
}

fn codec_error(err: LinesCodecError) -> RpcError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => {
            RpcError::Protocol("message exceeds maximum length".to_string())
        }
        LinesCodecError::Io(err) => match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => RpcError::Closed,
            _ => RpcError::Unreachable(err.to_string()),
        },
    }
}
