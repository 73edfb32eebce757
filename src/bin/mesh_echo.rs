//! Echo driver: attach to the co-located proxy and bounce a number off
//! it. Exercises the host-local transport without touching the mesh.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use meshmark::client::MeshClient;
use meshmark::directory::RetryPolicy;
use meshmark::proxy;

#[derive(Parser, Debug)]
#[command(name = "mesh-echo")]
#[command(about = "Echo a value off the local proxy")]
struct Args {
    /// Directory holding the proxy endpoint files
    #[arg(long, default_value = "/tmp/meshmark")]
    proxy_dir: PathBuf,

    /// Rank of the proxy to attach to
    #[arg(long, default_value_t = 0)]
    rank: u32,

    /// Value to echo
    #[arg(long, default_value_t = 42)]
    num: i32,
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
        .invoke_init(args.rank as i32)
        .await
        .map_err(|e| anyhow::anyhow!("init: {}", e))?;
    println!(
        "attached: local_rank={} group_size={}",
        info.local_rank, info.group_size
    );

    let echo = client
        .invoke_echo(args.num)
        .await
        .map_err(|e| anyhow::anyhow!("echo({}): {}", args.num, e))?;
    println!("echo({}) = {}", args.num, echo);

    anyhow::ensure!(echo == args.num, "echo mismatch: sent {}, got {}", args.num, echo);
    Ok(())
}
