//! Request/response RPC engine
//!
//! Every operation is a named `(opcode, request header, response header)`
//! tuple. Headers are fixed-layout PODs serialized with zerocopy; the wire
//! framing is shared between the inter-host mesh transport (TCP) and the
//! host-local proxy transport (Unix socket).

use std::future::Future;
use std::sync::Arc;

use crate::membership::MeshContext;

pub mod client;
pub mod peer_ops;
pub mod server;
pub mod wire;

/// RPC ID type for identifying different RPC operations
pub type RpcId = u16;

// Mesh operations (peer to peer over TCP)
pub const RPC_PEER_PING: RpcId = 1;
pub const RPC_PEER_SUM: RpcId = 2;

// Proxy operations (client to local proxy over Unix socket)
pub const RPC_INIT: RpcId = 10;
pub const RPC_QUERY: RpcId = 11;
pub const RPC_ECHO: RpcId = 12;
pub const RPC_PING: RpcId = 13;
pub const RPC_SUM: RpcId = 14;
pub const RPC_TERMINATE: RpcId = 15;

pub trait Serializable:
    zerocopy::FromBytes
    + zerocopy::IntoBytes
    + zerocopy::KnownLayout
    + zerocopy::Immutable
    + std::fmt::Debug
    + Send
    + Sync
    + 'static
{
}

impl<T> Serializable for T where
    T: zerocopy::FromBytes
        + zerocopy::IntoBytes
        + zerocopy::KnownLayout
        + zerocopy::Immutable
        + std::fmt::Debug
        + Send
        + Sync
        + 'static
{
}

/// Static description of one RPC operation: its opcode and the shapes of
/// its request and response headers. Implemented by both mesh and proxy
/// operations; only mesh operations additionally implement [`PeerRpc`].
pub trait RpcOp {
    /// Request header type (must be serializable)
    type RequestHeader: Serializable;

    /// Response header type (must be serializable)
    type ResponseHeader: Serializable;

    /// Get the RPC ID for this operation
    fn rpc_id() -> RpcId;

    /// Build an error response so the peer never hangs waiting for a
    /// reply the handler could not produce.
    fn error_response(error: &RpcError) -> Self::ResponseHeader;
}

/// Server-side behavior of a mesh operation.
///
/// Implementations get the shared [`MeshContext`] and must resolve exactly
/// once, either with a response header or an error; the dispatch loop
/// turns errors into [`RpcOp::error_response`] so the request's resources
/// are always released.
pub trait PeerRpc: RpcOp {
    fn handle(
        ctx: Arc<MeshContext>,
        request: Self::RequestHeader,
    ) -> impl Future<Output = Result<Self::ResponseHeader, RpcError>> + Send;
}

/// RPC error types
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Invalid RPC header")]
    InvalidHeader,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("RPC timeout")]
    Timeout,

    #[error("Opcode {0} already registered")]
    DuplicateOpcode(RpcId),

    #[error("No handler registered for opcode {0}")]
    UnknownOpcode(RpcId),

    #[error(transparent)]
    Directory(#[from] crate::directory::DirectoryError),
}
