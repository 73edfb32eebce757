//! MeshMark daemon: one rank of the mesh.
//!
//! Binds the mesh listener, publishes its endpoint in the shared address
//! directory, waits for every peer to publish, then serves mesh RPCs and
//! the host-local proxy until a terminate request (or Ctrl-C) arrives.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;

use meshmark::collective;
use meshmark::config::MeshConfig;
use meshmark::directory::{AddressDirectory, Discovery, FileDiscovery, RetryPolicy};
use meshmark::membership::{Membership, MeshContext};
use meshmark::proxy::LocalProxy;
use meshmark::rpc::client::RpcClient;
use meshmark::rpc::peer_ops::{PeerPing, PeerPingRequest, PeerSum};
use meshmark::rpc::server::RpcServer;

#[derive(Parser, Debug)]
#[command(name = "meshmarkd")]
#[command(about = "MeshMark mesh daemon")]
struct Args {
    /// Rank of this daemon within the process group
    #[arg(long)]
    rank: u32,

    /// Total number of ranks in the process group
    #[arg(long)]
    group_size: u32,

    /// Path to TOML config file (defaults apply when omitted)
    #[arg(long)]
    config: Option<String>,

    /// Run the built-in self-test after bootstrap, then shut down
    #[arg(long)]
    test: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            MeshConfig::from_file(path).with_context(|| format!("loading config {}", path))?
        }
        None => MeshConfig::default(),
    };

    meshmark::logging::init_with_hostname(&config.node.log_level);

    tracing::info!(
        "meshmarkd starting: rank={} group_size={} bind={}",
        args.rank,
        args.group_size,
        config.network.bind_addr
    );

    let membership = Membership::new(args.rank, args.group_size)
        .map_err(|e| anyhow::anyhow!("invalid membership: {}", e))?;

    // Bind first so the published endpoint is live before any peer sees it.
    let (listener, local_addr) = RpcServer::bind(&config.network.bind_addr)
        .await
        .map_err(|e| anyhow::anyhow!("mesh bind failed: {}", e))?;
    let endpoint = publishable_endpoint(&local_addr);
    tracing::info!("Mesh listener bound at {} (publishing {})", local_addr, endpoint);

    let discovery = FileDiscovery::new(&config.network.directory_file, args.group_size);
    discovery
        .publish(args.rank, &endpoint)
        .context("publishing endpoint")?;

    let retry = RetryPolicy {
        max_attempts: config.network.directory_retries,
        interval: Duration::from_millis(config.network.directory_retry_interval_ms),
    };
    let directory = AddressDirectory::load(&discovery, args.group_size, retry)
        .await
        .context("waiting for peers to publish")?;

    for rank in 0..args.group_size {
        if let Ok(peer) = directory.resolve(rank) {
            tracing::debug!("Peer rank {} at {}", rank, peer);
        }
    }

    let ctx = MeshContext::new(
        membership,
        directory,
        config.collective.tree_degree,
        Duration::from_secs(config.network.timeout_secs),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut server = RpcServer::new(Arc::clone(&ctx), config.collective.pool_size);
    server
        .register::<PeerPing>()
        .map_err(|e| anyhow::anyhow!("registering ping: {}", e))?;
    server
        .register::<PeerSum>()
        .map_err(|e| anyhow::anyhow!("registering sum: {}", e))?;

    let server = Arc::new(server);
    let server_task = tokio::spawn(server.serve(listener, shutdown_rx.clone()));

    let proxy = Arc::new(LocalProxy::new(
        Arc::clone(&ctx),
        &config.network.proxy_dir,
        config.collective.pool_size,
        shutdown_tx.clone(),
    ));
    let proxy_listener = proxy
        .bind()
        .map_err(|e| anyhow::anyhow!("proxy bind failed: {}", e))?;
    let proxy_task = tokio::spawn(Arc::clone(&proxy).serve(proxy_listener));

    if args.test {
        run_self_test(&ctx).await.context("self-test")?;
        let _ = shutdown_tx.send(true);
    }

    // Run until terminate flips the flag or the operator interrupts.
    let mut shutdown = shutdown_rx;
    tokio::select! {
        _ = shutdown.changed() => {
            tracing::info!("Shutdown flag set, stopping");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupt received, stopping");
            let _ = shutdown_tx.send(true);
        }
    }

    if let Err(e) = proxy_task.await {
        tracing::warn!("Proxy task join error: {}", e);
    }
    if let Err(e) = server_task.await {
        tracing::warn!("Server task join error: {}", e);
    }

    tracing::info!("meshmarkd rank {} exiting", args.rank);
    Ok(())
}

/// Turn the bound address into something peers can connect to. Binding
/// to a wildcard address (v4 or v6) yields an endpoint no peer can
/// dial, so the hostname stands in for it.
fn publishable_endpoint(local_addr: &str) -> String {
    match local_addr.parse::<std::net::SocketAddr>() {
        Ok(addr) if addr.ip().is_unspecified() => {
            let hostname_os = gethostname::gethostname();
            let hostname = hostname_os.to_str().unwrap_or("localhost");
            format!("{}:{}", hostname, addr.port())
        }
        _ => local_addr.to_string(),
    }
}

/// Ping every peer, then run one sum collective rooted here and check
/// the closed form.
async fn run_self_test(ctx: &Arc<MeshContext>) -> anyhow::Result<()> {
    tracing::info!("Self-test: pinging {} peers", ctx.group_size() - 1);

    let client = RpcClient::new(ctx.rpc_timeout());
    for rank in 0..ctx.group_size() {
        if rank == ctx.rank() {
            continue;
        }
        let endpoint = ctx
            .directory()
            .resolve(rank)
            .map_err(|e| anyhow::anyhow!("resolving rank {}: {}", rank, e))?;
        let ping = ctx.rank() as i32;
        let reply = client
            .forward::<PeerPing>(endpoint, &PeerPingRequest { ping })
            .await
            .map_err(|e| anyhow::anyhow!("ping to rank {}: {}", rank, e))?;
        anyhow::ensure!(
            reply.pong == ping,
            "rank {} echoed {} instead of {}",
            rank,
            reply.pong,
            ping
        );
        tracing::info!("Self-test: rank {} answered ping", rank);
    }

    let result = collective::initiate_sum(ctx, 0)
        .await
        .map_err(|e| anyhow::anyhow!("sum collective: {}", e))?;
    let n = ctx.group_size() as i64;
    let expected = (n * (n - 1) / 2) as i32;
    anyhow::ensure!(
        result.sum == expected,
        "sum collective returned {} (expected {})",
        result.sum,
        expected
    );
    tracing::info!(
        "Self-test: sum collective ok (sum={} elapsed={}us)",
        result.sum,
        result.elapsed.as_micros()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::publishable_endpoint;

    #[test]
    fn test_wildcard_binds_publish_under_hostname() {
        let hostname_os = gethostname::gethostname();
        let hostname = hostname_os.to_str().unwrap_or("localhost");

        assert_eq!(
            publishable_endpoint("0.0.0.0:4000"),
            format!("{}:4000", hostname)
        );
        assert_eq!(
            publishable_endpoint("[::]:4000"),
            format!("{}:4000", hostname)
        );
    }

    #[test]
    fn test_concrete_binds_publish_unchanged() {
        assert_eq!(publishable_endpoint("127.0.0.1:4000"), "127.0.0.1:4000");
        assert_eq!(publishable_endpoint("[::1]:4000"), "[::1]:4000");
    }
}
