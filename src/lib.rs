//! MeshMark - A Distributed RPC Testbed
//!
//! MeshMark runs a mesh of rank-addressed peer servers that resolve each
//! other's endpoints through a shared address directory, answer
//! point-to-point RPCs, and execute tree-structured collective operations.
//! Each host additionally runs a local proxy so that co-located client
//! processes can reach the mesh over a Unix socket without opening their
//! own network connections.
//!
//! # Architecture
//!
//! - **Address Directory** ([`directory`]): rank to endpoint resolution,
//!   bootstrapped from a shared append-only directory file
//! - **RPC Layer** ([`rpc`]): length-framed request/response RPCs over TCP
//!   with synchronous and fire-then-wait invocation
//! - **Membership** ([`membership`]): the local rank and fixed group size,
//!   carried in an explicit [`membership::MeshContext`] so several
//!   independent meshes can coexist in one process
//! - **Collective Engine** ([`collective`]): k-ary tree topology and the
//!   recursive fan-out/fan-in sum reduction built on it
//! - **Local Proxy** ([`proxy`]): per-host Unix-socket endpoint bridging
//!   co-located clients into the mesh
//! - **Client Library** ([`client`]): what the driver programs link to
//!   talk to a proxy
//!
//! # Example
//!
//! ```rust,no_run
//! use meshmark::client::MeshClient;
//! use meshmark::directory::RetryPolicy;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = MeshClient::connect(
//!     Path::new("/tmp/meshmark/proxy-0.addr"),
//!     RetryPolicy::default(),
//! )
//! .await?;
//!
//! let info = client.invoke_query().await?;
//! println!("proxied by rank {} of {}", info.local_rank, info.group_size);
//!
//! let pong = client.invoke_ping(1, 42).await?;
//! assert_eq!(pong, 42);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod collective;
pub mod config;
pub mod directory;
pub mod logging;
pub mod membership;
pub mod proxy;
pub mod rpc;
