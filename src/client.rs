//! Client-side library for talking to a host-local proxy
//!
//! A client process never touches the mesh directly: it polls for the
//! proxy's endpoint file, connects to the Unix socket named inside, and
//! issues proxy operations over that single persistent connection.

use std::path::Path;

use tokio::net::UnixStream;

use crate::directory::RetryPolicy;
use crate::proxy::{
    Echo, EchoRequest, Init, InitRequest, Ping, PingRequest, Query, QueryRequest, Sum,
    SumRequest, Terminate, TerminateRequest,
};
use crate::rpc::peer_ops::RET_OK;
use crate::rpc::wire;
use crate::rpc::{RpcError, RpcOp};

/// Identity and group shape reported by the proxy at attach time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachInfo {
    pub local_rank: i32,
    pub group_size: i32,
}

/// Result of a sum collective as reported to the client.
#[derive(Debug, Clone, Copy)]
pub struct SumOutcome {
    pub sum: i32,
    pub elapsed_usec: u64,
}

/// Connection to the co-located proxy.
pub struct MeshClient {
    stream: UnixStream,
}

impl MeshClient {
    /// Poll for the proxy's endpoint file, then connect to the socket it
    /// names. The file appears only after the proxy is accepting, so a
    /// successful read means connect should succeed immediately.
    pub async fn connect(addr_file: &Path, retry: RetryPolicy) -> Result<Self, RpcError> {
        let mut endpoint = None;
        for attempt in 1..=retry.max_attempts {
            match std::fs::read_to_string(addr_file) {
                Ok(contents) => {
                    let line = contents.lines().next().unwrap_or("").trim().to_string();
                    if line.is_empty() {
                        return Err(RpcError::Transport(format!(
                            "Endpoint file {:?} is empty",
                            addr_file
                        )));
                    }
                    endpoint = Some(line);
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if attempt == retry.max_attempts {
                        return Err(RpcError::Transport(format!(
                            "Endpoint file {:?} never appeared after {} attempts",
                            addr_file, retry.max_attempts
                        )));
                    }
                    tracing::debug!(
                        "Waiting for endpoint file {:?} (attempt {}/{})",
                        addr_file,
                        attempt,
                        retry.max_attempts
                    );
                    tokio::time::sleep(retry.interval).await;
                }
                Err(e) => {
                    return Err(RpcError::Transport(format!(
                        "Failed to read endpoint file {:?}: {}",
                        addr_file, e
                    )))
                }
            }
        }

        // The loop either set the endpoint or returned.
        let endpoint = endpoint.ok_or_else(|| {
            RpcError::Transport(format!("Endpoint file {:?} never appeared", addr_file))
        })?;

        let stream = UnixStream::connect(&endpoint).await.map_err(|e| {
            RpcError::Transport(format!("Failed to connect to proxy {}: {}", endpoint, e))
        })?;

        tracing::info!("Connected to proxy at {}", endpoint);
        Ok(Self { stream })
    }

    async fn call<T: RpcOp>(
        &mut self,
        request: &T::RequestHeader,
    ) -> Result<T::ResponseHeader, RpcError> {
        wire::send_request(&mut self.stream, T::rpc_id(), request).await?;
        wire::recv_response(&mut self.stream).await
    }

    /// Attach to the proxy. Reports the bridged rank and group size.
    pub async fn invoke_init(&mut self, rank: i32) -> Result<AttachInfo, RpcError> {
        let response = self
            .call::<Init>(&InitRequest {
                rank,
                pid: std::process::id() as i32,
            })
            .await?;

        if response.ret != RET_OK {
            return Err(RpcError::Handler(format!(
                "init rejected (ret={})",
                response.ret
            )));
        }

        Ok(AttachInfo {
            local_rank: response.rank,
            group_size: response.nranks,
        })
    }

    pub async fn invoke_query(&mut self) -> Result<AttachInfo, RpcError> {
        let response = self.call::<Query>(&QueryRequest { reserved: 0 }).await?;

        if response.local_rank < 0 {
            return Err(RpcError::Handler("query rejected".to_string()));
        }

        Ok(AttachInfo {
            local_rank: response.local_rank,
            group_size: response.group_size,
        })
    }

    /// Local echo. Never touches the mesh.
    pub async fn invoke_echo(&mut self, num: i32) -> Result<i32, RpcError> {
        let response = self.call::<Echo>(&EchoRequest { num }).await?;
        Ok(response.echo)
    }

    /// Ping a target rank through the proxy. Out-of-range targets wrap.
    pub async fn invoke_ping(&mut self, target: i32, ping: i32) -> Result<i32, RpcError> {
        let response = self.call::<Ping>(&PingRequest { target, ping }).await?;

        if response.ret != RET_OK {
            return Err(RpcError::Handler(format!(
                "ping to target {} failed (ret={})",
                target, response.ret
            )));
        }

        Ok(response.pong)
    }

    /// Run a sum collective rooted at the proxy's bridged rank.
    pub async fn invoke_sum(&mut self, seed: i32) -> Result<SumOutcome, RpcError> {
        let response = self.call::<Sum>(&SumRequest { seed }).await?;

        if response.ret != RET_OK {
            return Err(RpcError::Handler(format!(
                "sum collective failed (ret={})",
                response.ret
            )));
        }

        Ok(SumOutcome {
            sum: response.sum,
            elapsed_usec: response.elapsed_usec,
        })
    }

    /// Ask the daemon behind the proxy to shut down.
    pub async fn invoke_terminate(&mut self, rank: i32) -> Result<(), RpcError> {
        let response = self
            .call::<Terminate>(&TerminateRequest {
                rank,
                pid: std::process::id() as i32,
            })
            .await?;

        if response.ret != RET_OK {
            return Err(RpcError::Handler(format!(
                "terminate rejected (ret={})",
                response.ret
            )));
        }

        Ok(())
    }
}
