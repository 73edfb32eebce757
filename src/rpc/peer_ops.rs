//! Mesh peer operations: ping and the recursive sum reduction
//!
//! Response headers carry a `ret` status word so a handler failure still
//! produces a well-formed response frame; `ret != 0` means the payload
//! fields are garbage and the caller must treat the call as failed.

use std::sync::Arc;
use std::time::Duration;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::{PeerRpc, RpcError, RpcOp, RpcId, RPC_PEER_PING, RPC_PEER_SUM};
use crate::collective;
use crate::membership::MeshContext;

pub const RET_OK: i32 = 0;
pub const RET_ERR: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PeerPingRequest {
    pub ping: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PeerPingResponse {
    pub ret: i32,
    pub pong: i32,
}

/// Point-to-point liveness probe. The responder echoes the ping value
/// back as the pong.
pub struct PeerPing;

impl RpcOp for PeerPing {
    type RequestHeader = PeerPingRequest;
    type ResponseHeader = PeerPingResponse;

    fn rpc_id() -> RpcId {
        RPC_PEER_PING
    }

    fn error_response(_error: &RpcError) -> Self::ResponseHeader {
        PeerPingResponse {
            ret: RET_ERR,
            pong: 0,
        }
    }
}

impl PeerRpc for PeerPing {
    async fn handle(
        ctx: Arc<MeshContext>,
        request: Self::RequestHeader,
    ) -> Result<Self::ResponseHeader, RpcError> {
        tracing::debug!("ping received: rank={} ping={}", ctx.rank(), request.ping);

        Ok(PeerPingResponse {
            ret: RET_OK,
            pong: request.ping,
        })
    }
}

/// One hop of the sum collective. `root` is the initiating rank and is
/// forwarded unchanged down the tree; every hop re-derives its own
/// children from it. `seed` travels with the request and every node
/// contributes `seed + rank`, so the total comes out to
/// `N*seed + N*(N-1)/2`. `budget_usec` is the remaining time budget,
/// shrunk by each hop's local elapsed time before forwarding.
#[derive(Debug, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PeerSumRequest {
    pub root: i32,
    pub degree: i32,
    pub seed: i32,
    /// Keeps `budget_usec` 8-aligned with no implicit padding.
    pub pad: i32,
    pub budget_usec: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PeerSumResponse {
    pub ret: i32,
    pub sum: i32,
}

pub struct PeerSum;

impl RpcOp for PeerSum {
    type RequestHeader = PeerSumRequest;
    type ResponseHeader = PeerSumResponse;

    fn rpc_id() -> RpcId {
        RPC_PEER_SUM
    }

    fn error_response(_error: &RpcError) -> Self::ResponseHeader {
        PeerSumResponse {
            ret: RET_ERR,
            sum: 0,
        }
    }
}

impl PeerRpc for PeerSum {
    async fn handle(
        ctx: Arc<MeshContext>,
        request: Self::RequestHeader,
    ) -> Result<Self::ResponseHeader, RpcError> {
        if request.root < 0 || request.degree < 1 {
            return Err(RpcError::Handler(format!(
                "bad sum parameters: root={} degree={}",
                request.root, request.degree
            )));
        }
        if request.budget_usec == 0 {
            return Err(RpcError::Timeout);
        }

        let budget = Duration::from_micros(request.budget_usec);
        let sum = collective::reduce_sum(
            &ctx,
            request.root as u32,
            request.degree as u32,
            request.seed,
            budget,
        )
        .await?;

        Ok(PeerSumResponse { ret: RET_OK, sum })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn test_header_layouts_are_padding_free() {
        assert_eq!(size_of::<PeerPingRequest>(), 4);
        assert_eq!(size_of::<PeerPingResponse>(), 8);
        assert_eq!(size_of::<PeerSumRequest>(), 24);
        assert_eq!(size_of::<PeerSumResponse>(), 8);
    }

    #[tokio::test]
    async fn test_ping_echoes_value() {
        use crate::directory::AddressDirectory;
        use crate::membership::Membership;

        let ctx = MeshContext::new(
            Membership::new(0, 1).unwrap(),
            AddressDirectory::from_endpoints(vec!["127.0.0.1:0".to_string()]),
            2,
            Duration::from_secs(5),
        );

        let response = PeerPing::handle(ctx, PeerPingRequest { ping: 1234 })
            .await
            .unwrap();
        assert_eq!(response.ret, RET_OK);
        assert_eq!(response.pong, 1234);
    }

    #[tokio::test]
    async fn test_sum_on_single_rank_group() {
        use crate::directory::AddressDirectory;
        use crate::membership::Membership;

        let ctx = MeshContext::new(
            Membership::new(0, 1).unwrap(),
            AddressDirectory::from_endpoints(vec!["127.0.0.1:0".to_string()]),
            2,
            Duration::from_secs(5),
        );

        let response = PeerSum::handle(
            ctx,
            PeerSumRequest {
                root: 0,
                degree: 2,
                seed: 0,
                pad: 0,
                budget_usec: 5_000_000,
            },
        )
        .await
        .unwrap();

        assert_eq!(response.ret, RET_OK);
        assert_eq!(response.sum, 0);
    }

    #[tokio::test]
    async fn test_sum_seed_contributed_per_rank() {
        use crate::directory::AddressDirectory;
        use crate::membership::Membership;

        // N=1: the single rank contributes seed + 0.
        let ctx = MeshContext::new(
            Membership::new(0, 1).unwrap(),
            AddressDirectory::from_endpoints(vec!["127.0.0.1:0".to_string()]),
            2,
            Duration::from_secs(5),
        );

        let response = PeerSum::handle(
            ctx,
            PeerSumRequest {
                root: 0,
                degree: 2,
                seed: 100,
                pad: 0,
                budget_usec: 5_000_000,
            },
        )
        .await
        .unwrap();

        assert_eq!(response.ret, RET_OK);
        assert_eq!(response.sum, 100);
    }

    #[tokio::test]
    async fn test_sum_rejects_exhausted_budget() {
        use crate::directory::AddressDirectory;
        use crate::membership::Membership;

        let ctx = MeshContext::new(
            Membership::new(0, 1).unwrap(),
            AddressDirectory::from_endpoints(vec!["127.0.0.1:0".to_string()]),
            2,
            Duration::from_secs(5),
        );

        let result = PeerSum::handle(
            ctx,
            PeerSumRequest {
                root: 0,
                degree: 2,
                seed: 0,
                pad: 0,
                budget_usec: 0,
            },
        )
        .await;

        assert!(matches!(result, Err(RpcError::Timeout)));
    }
}
