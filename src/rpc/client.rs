//! Client-side RPC execution over the mesh transport
//!
//! `forward` opens a connection to the target endpoint, sends one request
//! frame and blocks the calling task until the response header arrives.
//! `forward_async` splits that into a non-blocking send and an explicit
//! [`PendingReply::wait`], so a caller can put several requests in flight
//! (one per collective child) before blocking on any of them.

use std::time::Duration;

use tokio::net::TcpStream;

use super::wire;
use super::{RpcError, RpcOp};

/// One in-flight request, exclusively owned by the call that created it.
pub struct PendingReply<R> {
    handle: tokio::task::JoinHandle<Result<R, RpcError>>,
}

impl<R: Send + 'static> PendingReply<R> {
    /// Block until the response arrives or the forward fails.
    pub async fn wait(self) -> Result<R, RpcError> {
        self.handle
            .await
            .map_err(|e| RpcError::Transport(format!("forward task failed: {}", e)))?
    }
}

/// Mesh RPC client.
///
/// Connection/lookup failures surface to the caller as errors; the engine
/// never retries internally. Retry policy belongs to the caller.
#[derive(Debug, Clone, Copy)]
pub struct RpcClient {
    deadline: Duration,
}

impl RpcClient {
    /// Create a client whose calls all carry the given per-call deadline.
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Synchronous forward: connect, send, await the response.
    pub async fn forward<T: RpcOp>(
        &self,
        endpoint: &str,
        request: &T::RequestHeader,
    ) -> Result<T::ResponseHeader, RpcError> {
        let call = async {
            let mut stream = TcpStream::connect(endpoint).await.map_err(|e| {
                RpcError::Transport(format!("Failed to connect to {}: {}", endpoint, e))
            })?;

            tracing::trace!(
                "forward: rpc_id={}, endpoint={}",
                T::rpc_id(),
                endpoint
            );

            wire::send_request(&mut stream, T::rpc_id(), request).await?;
            wire::recv_response::<_, T::ResponseHeader>(&mut stream).await
        };

        tokio::time::timeout(self.deadline, call)
            .await
            .map_err(|_| RpcError::Timeout)?
    }

    /// Asynchronous forward: issue the request in the background and
    /// return a handle the caller waits on explicitly.
    pub fn forward_async<T: RpcOp + 'static>(
        &self,
        endpoint: String,
        request: T::RequestHeader,
    ) -> PendingReply<T::ResponseHeader> {
        let client = *self;
        let handle = tokio::spawn(async move {
            client.forward::<T>(&endpoint, &request).await
        });

        PendingReply { handle }
    }
}
