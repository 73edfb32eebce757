//! Mesh RPC server
//!
//! Operations are registered before the accept loop starts; registering
//! the same opcode twice is an error. Inbound requests are dispatched on
//! tasks gated by a bounded semaphore, the only admission control in the
//! system: saturation shows up as latency, never as a correctness
//! violation. Handlers may block while issuing their own outbound RPCs
//! (the collective reduce does), so the pool is sized at or above the
//! maximum fan-out degree.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};

use super::wire;
use super::{PeerRpc, RpcError, RpcId};
use crate::membership::MeshContext;

type HandlerFuture = Pin<Box<dyn Future<Output = Vec<u8>> + Send>>;
type HandlerFn = Arc<dyn Fn(Arc<MeshContext>, Vec<u8>) -> HandlerFuture + Send + Sync>;

/// Mesh RPC server: registered operations plus the bounded handler pool.
pub struct RpcServer {
    ctx: Arc<MeshContext>,
    handlers: HashMap<RpcId, HandlerFn>,
    pool: Arc<Semaphore>,
}

impl RpcServer {
    pub fn new(ctx: Arc<MeshContext>, pool_size: usize) -> Self {
        Self {
            ctx,
            handlers: HashMap::new(),
            pool: Arc::new(Semaphore::new(pool_size)),
        }
    }

    /// Register an operation. Must happen before `serve`; an opcode may be
    /// registered at most once per engine instance.
    pub fn register<T: PeerRpc + 'static>(&mut self) -> Result<(), RpcError> {
        let rpc_id = T::rpc_id();
        if self.handlers.contains_key(&rpc_id) {
            return Err(RpcError::DuplicateOpcode(rpc_id));
        }

        let handler: HandlerFn = Arc::new(|ctx, request_bytes| {
            Box::pin(async move {
                let response = match wire::parse_header::<T::RequestHeader>(&request_bytes) {
                    Ok(request) => match T::handle(ctx, request).await {
                        Ok(response) => response,
                        Err(e) => {
                            tracing::warn!(
                                "Handler error for rpc_id={}: {}",
                                T::rpc_id(),
                                e
                            );
                            T::error_response(&e)
                        }
                    },
                    Err(e) => {
                        tracing::warn!("Undecodable request for rpc_id={}", T::rpc_id());
                        T::error_response(&e)
                    }
                };
                zerocopy::IntoBytes::as_bytes(&response).to_vec()
            })
        });

        self.handlers.insert(rpc_id, handler);
        tracing::debug!("Registered rpc_id={}", rpc_id);
        Ok(())
    }

    /// Bind the mesh listener. Returns the listener and the resolved local
    /// address (the endpoint to publish in the address directory).
    pub async fn bind(bind_addr: &str) -> Result<(TcpListener, String), RpcError> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| RpcError::Transport(format!("Failed to bind {}: {}", bind_addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| RpcError::Transport(format!("Failed to read local addr: {}", e)))?;

        Ok((listener, local_addr.to_string()))
    }

    /// Accept loop. Runs until the shutdown flag flips.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), RpcError> {
        tracing::info!("RpcServer: accepting connections");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("RpcServer: shutdown requested, exiting accept loop");
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::trace!("RpcServer: accepted connection from {}", peer);
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = server.serve_connection(stream).await {
                                    tracing::warn!("RpcServer: connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!("RpcServer: accept failed: {}", e);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle all requests on one connection until the peer closes it.
    async fn serve_connection(&self, mut stream: TcpStream) -> Result<(), RpcError> {
        while let Some((rpc_id, request_bytes)) = wire::recv_request(&mut stream).await? {
            tracing::trace!("RpcServer: received rpc_id={}", rpc_id);

            let Some(handler) = self.handlers.get(&rpc_id) else {
                tracing::warn!("RpcServer: no handler registered for rpc_id={}", rpc_id);
                wire::send_error_marker(&mut stream).await?;
                continue;
            };

            // Admission control: the permit is held for the whole handler,
            // including any outbound forwards it performs.
            let _permit = self
                .pool
                .acquire()
                .await
                .map_err(|_| RpcError::Transport("handler pool closed".to_string()))?;

            let response_bytes = handler(Arc::clone(&self.ctx), request_bytes).await;

            let mut frame = Vec::with_capacity(4 + response_bytes.len());
            frame.extend_from_slice(&(response_bytes.len() as u32).to_le_bytes());
            frame.extend_from_slice(&response_bytes);

            use tokio::io::AsyncWriteExt;
            stream
                .write_all(&frame)
                .await
                .map_err(|e| RpcError::Transport(format!("Failed to send response: {}", e)))?;
            stream
                .flush()
                .await
                .map_err(|e| RpcError::Transport(format!("Failed to flush response: {}", e)))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::AddressDirectory;
    use crate::membership::Membership;
    use std::time::Duration;

    fn test_ctx() -> Arc<MeshContext> {
        let membership = Membership::new(0, 1).unwrap();
        let directory = AddressDirectory::from_endpoints(vec!["127.0.0.1:0".to_string()]);
        MeshContext::new(membership, directory, 2, Duration::from_secs(5))
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        use crate::rpc::peer_ops::PeerPing;

        let mut server = RpcServer::new(test_ctx(), 4);
        server.register::<PeerPing>().unwrap();

        let result = server.register::<PeerPing>();
        assert!(matches!(
            result,
            Err(RpcError::DuplicateOpcode(id)) if id == crate::rpc::RPC_PEER_PING
        ));
    }
}
