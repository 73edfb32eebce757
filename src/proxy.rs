//! Host-local proxy multiplexer
//!
//! One proxy runs per daemon, listening on a Unix socket that only
//! co-located client processes can reach; it never accepts mesh traffic.
//! Clients discover the socket through a one-line endpoint file written
//! before the proxy starts accepting.
//!
//! Target ranks outside `[0, group_size)` are normalized by modulo before
//! lookup, so clients need not know the group size in advance. The
//! address directory underneath keeps its hard fail on unknown ranks;
//! only this layer wraps.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{watch, Semaphore};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::collective;
use crate::membership::MeshContext;
use crate::rpc::client::RpcClient;
use crate::rpc::peer_ops::{PeerPing, PeerPingRequest, RET_ERR, RET_OK};
use crate::rpc::wire;
use crate::rpc::{
    RpcError, RpcId, RpcOp, RPC_ECHO, RPC_INIT, RPC_PING, RPC_QUERY, RPC_SUM, RPC_TERMINATE,
};

// Client-facing operation headers. These are the proxy's public wire
// contract; field order and widths are load-bearing.

#[derive(Debug, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct InitRequest {
    pub rank: i32,
    pub pid: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct InitResponse {
    pub ret: i32,
    pub rank: i32,
    pub nranks: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct QueryRequest {
    pub reserved: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct QueryResponse {
    pub local_rank: i32,
    pub group_size: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct EchoRequest {
    pub num: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct EchoResponse {
    pub echo: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PingRequest {
    pub target: i32,
    pub ping: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PingResponse {
    pub ret: i32,
    pub pong: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SumRequest {
    pub seed: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SumResponse {
    pub ret: i32,
    pub sum: i32,
    pub elapsed_usec: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct TerminateRequest {
    pub rank: i32,
    pub pid: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct TerminateResponse {
    pub ret: i32,
}

macro_rules! proxy_op {
    ($name:ident, $id:expr, $req:ty, $resp:ty, $err:expr) => {
        pub struct $name;

        impl RpcOp for $name {
            type RequestHeader = $req;
            type ResponseHeader = $resp;

            fn rpc_id() -> RpcId {
                $id
            }

            fn error_response(_error: &RpcError) -> Self::ResponseHeader {
                $err
            }
        }
    };
}

proxy_op!(Init, RPC_INIT, InitRequest, InitResponse, InitResponse {
    ret: RET_ERR,
    rank: -1,
    nranks: -1,
});
proxy_op!(Query, RPC_QUERY, QueryRequest, QueryResponse, QueryResponse {
    local_rank: -1,
    group_size: -1,
});
proxy_op!(Echo, RPC_ECHO, EchoRequest, EchoResponse, EchoResponse { echo: -1 });
proxy_op!(Ping, RPC_PING, PingRequest, PingResponse, PingResponse {
    ret: RET_ERR,
    pong: 0,
});
proxy_op!(Sum, RPC_SUM, SumRequest, SumResponse, SumResponse {
    ret: RET_ERR,
    sum: 0,
    elapsed_usec: 0,
});
proxy_op!(
    Terminate,
    RPC_TERMINATE,
    TerminateRequest,
    TerminateResponse,
    TerminateResponse { ret: RET_ERR }
);

/// Normalize a client-supplied target rank into `[0, group_size)`.
///
/// Negative and oversized targets both wrap; this layer is deliberately
/// forgiving where the address directory is strict.
pub fn normalize_target(target: i32, group_size: u32) -> u32 {
    target.rem_euclid(group_size as i32) as u32
}

/// Socket path for one rank's proxy. Per-rank naming keeps several ranks
/// on one host (the test topology) from colliding.
pub fn socket_path(proxy_dir: &Path, rank: u32) -> PathBuf {
    proxy_dir.join(format!("proxy-{}.sock", rank))
}

/// Endpoint file a client polls for before connecting.
pub fn addr_path(proxy_dir: &Path, rank: u32) -> PathBuf {
    proxy_dir.join(format!("proxy-{}.addr", rank))
}

/// Per-host proxy bridging co-located clients into the mesh.
pub struct LocalProxy {
    ctx: Arc<MeshContext>,
    socket_path: PathBuf,
    addr_path: PathBuf,
    pool: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl LocalProxy {
    pub fn new(
        ctx: Arc<MeshContext>,
        proxy_dir: &Path,
        pool_size: usize,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        let rank = ctx.rank();
        Self {
            ctx,
            socket_path: socket_path(proxy_dir, rank),
            addr_path: addr_path(proxy_dir, rank),
            pool: Arc::new(Semaphore::new(pool_size)),
            shutdown,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn addr_path(&self) -> &Path {
        &self.addr_path
    }

    /// Bind the Unix socket and publish the endpoint file.
    ///
    /// The endpoint file is written only after the listener exists, so a
    /// client that sees the file can connect immediately.
    pub fn bind(&self) -> Result<UnixListener, RpcError> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                RpcError::Transport(format!("Failed to create proxy dir: {}", e))
            })?;
        }

        // A stale socket from a crashed predecessor blocks the bind.
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => tracing::warn!("Removed stale proxy socket {:?}", self.socket_path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(RpcError::Transport(format!(
                    "Failed to remove stale socket {:?}: {}",
                    self.socket_path, e
                )))
            }
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| {
            RpcError::Transport(format!("Failed to bind {:?}: {}", self.socket_path, e))
        })?;

        let endpoint = format!("{}\n", self.socket_path.display());
        std::fs::write(&self.addr_path, endpoint).map_err(|e| {
            RpcError::Transport(format!(
                "Failed to write endpoint file {:?}: {}",
                self.addr_path, e
            ))
        })?;

        tracing::info!(
            "LocalProxy: listening on {:?}, endpoint published at {:?}",
            self.socket_path,
            self.addr_path
        );
        Ok(listener)
    }

    /// Accept loop. Runs until terminate is received or the shutdown flag
    /// flips from elsewhere.
    pub async fn serve(self: Arc<Self>, listener: UnixListener) -> Result<(), RpcError> {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("LocalProxy: shutdown requested");
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let proxy = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = proxy.serve_connection(stream).await {
                                    tracing::warn!("LocalProxy: connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!("LocalProxy: accept failed: {}", e);
                        }
                    }
                }
            }
        }

        self.cleanup();
        Ok(())
    }

    /// Remove the socket and endpoint files. Best effort; a leftover file
    /// is only cosmetic once the listener is gone.
    pub fn cleanup(&self) {
        for path in [&self.socket_path, &self.addr_path] {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("LocalProxy: failed to remove {:?}: {}", path, e);
                }
            }
        }
    }

    async fn serve_connection(&self, mut stream: UnixStream) -> Result<(), RpcError> {
        while let Some((rpc_id, request_bytes)) = wire::recv_request(&mut stream).await? {
            let _permit = self
                .pool
                .acquire()
                .await
                .map_err(|_| RpcError::Transport("proxy pool closed".to_string()))?;

            tracing::trace!("LocalProxy: dispatching rpc_id={}", rpc_id);
            match rpc_id {
                RPC_INIT => self.handle_init(&mut stream, &request_bytes).await?,
                RPC_QUERY => self.handle_query(&mut stream, &request_bytes).await?,
                RPC_ECHO => self.handle_echo(&mut stream, &request_bytes).await?,
                RPC_PING => self.handle_ping(&mut stream, &request_bytes).await?,
                RPC_SUM => self.handle_sum(&mut stream, &request_bytes).await?,
                RPC_TERMINATE => {
                    self.handle_terminate(&mut stream, &request_bytes).await?;
                    break;
                }
                other => {
                    tracing::warn!("LocalProxy: unknown opcode {}", other);
                    wire::send_error_marker(&mut stream).await?;
                }
            }
        }

        Ok(())
    }

    async fn handle_init(
        &self,
        stream: &mut UnixStream,
        request_bytes: &[u8],
    ) -> Result<(), RpcError> {
        let response = match wire::parse_header::<InitRequest>(request_bytes) {
            Ok(request) => {
                tracing::info!(
                    "LocalProxy: client attached (claimed rank {}, pid {})",
                    request.rank,
                    request.pid
                );
                InitResponse {
                    ret: RET_OK,
                    rank: self.ctx.rank() as i32,
                    nranks: self.ctx.group_size() as i32,
                }
            }
            Err(e) => Init::error_response(&e),
        };
        wire::send_response(stream, &response).await
    }

    async fn handle_query(
        &self,
        stream: &mut UnixStream,
        request_bytes: &[u8],
    ) -> Result<(), RpcError> {
        let response = match wire::parse_header::<QueryRequest>(request_bytes) {
            Ok(_) => QueryResponse {
                local_rank: self.ctx.rank() as i32,
                group_size: self.ctx.group_size() as i32,
            },
            Err(e) => Query::error_response(&e),
        };
        wire::send_response(stream, &response).await
    }

    async fn handle_echo(
        &self,
        stream: &mut UnixStream,
        request_bytes: &[u8],
    ) -> Result<(), RpcError> {
        let response = match wire::parse_header::<EchoRequest>(request_bytes) {
            Ok(request) => EchoResponse { echo: request.num },
            Err(e) => Echo::error_response(&e),
        };
        wire::send_response(stream, &response).await
    }

    /// Route a ping. The proxy's own rank is answered in place; any other
    /// target is resolved through the directory and forwarded over the
    /// mesh, with the peer's reply relayed unchanged.
    async fn handle_ping(
        &self,
        stream: &mut UnixStream,
        request_bytes: &[u8],
    ) -> Result<(), RpcError> {
        let response = match wire::parse_header::<PingRequest>(request_bytes) {
            Ok(request) => {
                let target = normalize_target(request.target, self.ctx.group_size());
                if target == self.ctx.rank() {
                    PingResponse {
                        ret: RET_OK,
                        pong: request.ping,
                    }
                } else {
                    self.forward_ping(target, request.ping).await
                }
            }
            Err(e) => Ping::error_response(&e),
        };
        wire::send_response(stream, &response).await
    }

    async fn forward_ping(&self, target: u32, ping: i32) -> PingResponse {
        let endpoint = match self.ctx.directory().resolve(target) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("LocalProxy: cannot resolve rank {}: {}", target, e);
                return PingResponse {
                    ret: RET_ERR,
                    pong: 0,
                };
            }
        };

        let client = RpcClient::new(self.ctx.rpc_timeout());
        match client
            .forward::<PeerPing>(endpoint, &PeerPingRequest { ping })
            .await
        {
            Ok(reply) => PingResponse {
                ret: reply.ret,
                pong: reply.pong,
            },
            Err(e) => {
                tracing::warn!("LocalProxy: ping forward to rank {} failed: {}", target, e);
                PingResponse {
                    ret: RET_ERR,
                    pong: 0,
                }
            }
        }
    }

    /// Run a sum collective rooted at this proxy's bridged rank and report
    /// the wall-clock time the reduction took.
    async fn handle_sum(
        &self,
        stream: &mut UnixStream,
        request_bytes: &[u8],
    ) -> Result<(), RpcError> {
        let response = match wire::parse_header::<SumRequest>(request_bytes) {
            Ok(request) => {
                let started = Instant::now();
                // Every node in the tree contributes seed + rank, so the
                // total is N*seed + N*(N-1)/2.
                match collective::reduce_sum(
                    &self.ctx,
                    self.ctx.rank(),
                    self.ctx.tree_degree(),
                    request.seed,
                    self.ctx.rpc_timeout(),
                )
                .await
                {
                    Ok(sum) => {
                        let elapsed_usec = started.elapsed().as_micros() as u64;
                        tracing::info!(
                            "LocalProxy: sum collective root={} seed={} sum={} elapsed={}us",
                            self.ctx.rank(),
                            request.seed,
                            sum,
                            elapsed_usec
                        );
                        SumResponse {
                            ret: RET_OK,
                            sum,
                            elapsed_usec,
                        }
                    }
                    Err(e) => {
                        tracing::warn!("LocalProxy: sum collective failed: {}", e);
                        Sum::error_response(&e)
                    }
                }
            }
            Err(e) => Sum::error_response(&e),
        };
        wire::send_response(stream, &response).await
    }

    /// Acknowledge, then flip the shutdown flag the daemon waits on. The
    /// response is written first so the client sees a clean status.
    async fn handle_terminate(
        &self,
        stream: &mut UnixStream,
        request_bytes: &[u8],
    ) -> Result<(), RpcError> {
        let response = match wire::parse_header::<TerminateRequest>(request_bytes) {
            Ok(request) => {
                tracing::info!(
                    "LocalProxy: terminate from client (claimed rank {}, pid {})",
                    request.rank,
                    request.pid
                );
                TerminateResponse { ret: RET_OK }
            }
            Err(e) => Terminate::error_response(&e),
        };
        wire::send_response(stream, &response).await?;

        // Ignore the send error: flipping twice or racing another
        // terminate is harmless.
        let _ = self.shutdown.send(true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_wraps_oversized_target() {
        // groupSize=3, target=7 -> rank 1
        assert_eq!(normalize_target(7, 3), 1);
    }

    #[test]
    fn test_normalize_identity_in_range() {
        for target in 0..5 {
            assert_eq!(normalize_target(target, 5), target as u32);
        }
    }

    #[test]
    fn test_normalize_wraps_negative_target() {
        assert_eq!(normalize_target(-1, 4), 3);
        assert_eq!(normalize_target(-4, 4), 0);
    }

    #[test]
    fn test_header_layouts_are_padding_free() {
        use std::mem::size_of;
        assert_eq!(size_of::<InitRequest>(), 8);
        assert_eq!(size_of::<InitResponse>(), 12);
        assert_eq!(size_of::<QueryResponse>(), 8);
        assert_eq!(size_of::<PingRequest>(), 8);
        assert_eq!(size_of::<SumResponse>(), 16);
        assert_eq!(size_of::<TerminateResponse>(), 4);
    }
}
