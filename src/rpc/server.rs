//! RPC server loop.
//!
//! Each accepted connection gets its own task. Requests on one connection
//! are answered in arrival order; separate connections proceed concurrently.

use super::protocol::{RpcFault, RpcRequest, RpcResponse, MAX_LINE_LENGTH};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Dispatch target of an [`RpcServer`].
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, RpcFault>;
}

pub struct RpcServer {
    listener: TcpListener,
    handler: Arc<dyn RpcHandler>,
}

impl RpcServer {
    pub async fn bind(addr: &str, handler: Arc<dyn RpcHandler>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, handler })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` fires.
    pub async fn serve(self, shutdown: CancellationToken) {
        match self.listener.local_addr() {
            Ok(addr) => info!("RPC server listening on {}", addr),
            Err(e) => warn!("RPC server address unavailable: {}", e),
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("RPC server shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let handler = Arc::clone(&self.handler);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            serve_connection(stream, peer, handler, shutdown).await;
                        });
                    }
                    Err(e) => warn!("accept failed: {}", e),
                },
            }
        }
    }

    /// Runs the server on a background task.
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.serve(shutdown))
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn RpcHandler>,
    shutdown: CancellationToken,
) {
    debug!("connection from {}", peer);
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = framed.next() => match line {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    warn!("dropping connection from {}: {}", peer, e);
                    break;
                }
                None => break,
            },
        };

        let response = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(request) => match handler.handle(&request.method, request.params).await {
                Ok(result) => RpcResponse::ok(request.id, result),
                Err(fault) => RpcResponse::fault(request.id, fault),
            },
            Err(e) => RpcResponse::fault(0, RpcFault::invalid_request(e.to_string())),
        };

        let encoded = match serde_json::to_string(&response) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("cannot encode response for {}: {}", peer, e);
                continue;
            }
        };
        if let Err(e) = framed.send(encoded).await {
            debug!("connection from {} closed: {}", peer, e);
            break;
        }
    }
    debug!("connection from {} finished", peer);
}
