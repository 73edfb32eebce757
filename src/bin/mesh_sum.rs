//! Sum driver: run the sum collective rooted at the co-located rank and
//! print the result with its wall-clock timing. Optionally shuts the
//! daemon down afterwards.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use meshmark::client::MeshClient;
use meshmark::directory::RetryPolicy;
use meshmark::proxy;

#[derive(Parser, Debug)]
#[command(name = "mesh-sum")]
#[command(about = "Run the sum collective through the local proxy")]
struct Args {
    /// Directory holding the proxy endpoint files
    #[arg(long, default_value = "/tmp/meshmark")]
    proxy_dir: PathBuf,

    /// Rank of the proxy to attach to (also the collective root)
    #[arg(long, default_value_t = 0)]
    rank: u32,

    /// Seed added to the collective result
    #[arg(long, default_value_t = 0)]
    seed: i32,

    /// Terminate the daemon after the collective completes
    #[arg(long)]
    terminate: bool,
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

    let outcome = client
        .invoke_sum(args.seed)
        .await
        .map_err(|e| anyhow::anyhow!("sum(seed={}): {}", args.seed, e))?;
    println!(
        "sum(seed={}) = {} ({}us)",
        args.seed, outcome.sum, outcome.elapsed_usec
    );

    // Each of the N ranks contributes seed + rank.
    let n = info.group_size as i64;
    let expected = n * args.seed as i64 + n * (n - 1) / 2;
    anyhow::ensure!(
        outcome.sum as i64 == expected,
        "sum mismatch: got {}, expected {}",
        outcome.sum,
        expected
    );

    if args.terminate {
        client
            .invoke_terminate(args.rank as i32)
            .await
            .map_err(|e| anyhow::anyhow!("terminate: {}", e))?;
        println!("terminate acknowledged by rank {}", info.local_rank);
    }

    Ok(())
}
