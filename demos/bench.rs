//! In-process direct-write throughput harness.
//!
//! Supplements the original's SSH-launched `SimpleBenchmarker`, which
//! this crate does not reproduce (remote process launching is out of
//! scope). Drives `Node::direct_write` — the commit-protocol bypass —
//! against a local, loopback-only `Node` to measure raw storage
//! throughput. Never representative of a cluster that must tolerate
//! node failure: parity is never touched.

use std::collections::HashMap;
use std::time::Instant;

use clap::Parser;
use netraid::config::NodeConfig;
use netraid::dispatch;
use netraid::node::Node;

#[derive(Parser, Debug)]
#[command(name = "netraid-bench", about = "Direct-write throughput benchmark")]
struct BenchArgs {
    /// Number of stripe-unit writes to issue.
    #[arg(long, default_value = "1000")]
    iterations: u64,

    /// Size in bytes of each write.
    #[arg(long, default_value = "4096")]
    unit_size: usize,

    /// Group size (including the parity unit) of the synthetic layout.
    #[arg(long, default_value = "4")]
    group_size: u8,
}

#[tokio::main]
async fn main() -> netraid::Result<()> {
    let args = BenchArgs::parse();
    let storage = tempfile::tempdir().expect("failed to create scratch storage directory");

    let config = NodeConfig {
        server_id: 0,
        storage: storage.path().to_path_buf(),
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        fsync: false,
        gc_interval: std::time::Duration::from_secs(3600),
        watchdog_interval: std::time::Duration::from_secs(3600),
        direct_write: true,
    };
    let (dispatcher, _queues) = dispatch::channel();
    let node = Node::new(config, HashMap::new(), dispatcher).await?;

    let payload = vec![0xABu8; args.unit_size];
    let started = Instant::now();
    for i in 0..args.iterations {
        let stripe_id = (i % 4096) as u32;
        node.direct_write(1, stripe_id, args.group_size, 0, (i / 4096) as u32 + 1, payload.clone())
            .await?;
    }
    let elapsed = started.elapsed();

    let total_bytes = args.iterations * args.unit_size as u64;
    let mb_per_sec = (total_bytes as f64 / elapsed.as_secs_f64().max(1e-9)) / (1024.0 * 1024.0);
    println!(
        "direct-write bench: {} writes of {} bytes in {:.3}s ({:.2} MiB/s)",
        args.iterations,
        args.unit_size,
        elapsed.as_secs_f64(),
        mb_per_sec
    );

    Ok(())
}
