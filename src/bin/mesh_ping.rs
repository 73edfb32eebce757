//! Ping driver: route a ping to a target rank through the co-located
//! proxy. Targets outside the group wrap modulo the group size.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use meshmark::client::MeshClient;
use meshmark::directory::RetryPolicy;
use meshmark::proxy;

#[derive(Parser, Debug)]
#[command(name = "mesh-ping")]
#[command(about = "Ping a target rank through the local proxy")]
struct Args {
    /// Directory holding the proxy endpoint files
    #[arg(long, default_value = "/tmp/meshmark")]
    proxy_dir: PathBuf,

    /// Rank of the proxy to attach to
    #[arg(long, default_value_t = 0)]
    rank: u32,

    /// Target rank (may exceed the group size; it wraps)
    #[arg(long)]
    target: i32,

    /// Ping value to send
    #[arg(long, default_value_t = 7)]
    value: i32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let addr_file = proxy::addr_path(&args.proxy_dir, args.rank);
    let mut client = MeshClient::connect(
        &addr_file,
        RetryPolicy {
            max_attempts: 30,
            interval: Duration::from_millis(500),
        },
    )
    .await
    .map_err(|e| anyhow::anyhow!("connecting to proxy: {}", e))?;

    let info = client
        .invoke_query()
        .await
        .map_err(|e| anyhow::anyhow!("query: {}", e))?;
    println!(
        "attached: local_rank={} group_size={}",
        info.local_rank, info.group_size
    );

    let pong = client
        .invoke_ping(args.target, args.value)
        .await
        .map_err(|e| anyhow::anyhow!("ping(target={}, value={}): {}", args.target, args.value, e))?;
    println!("ping(target={}, value={}) = {}", args.target, args.value, pong);

    anyhow::ensure!(
        pong == args.value,
        "pong mismatch: sent {}, got {}",
        args.value,
        pong
    );
    Ok(())
}
