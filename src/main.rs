//! flowstate - Flow State Table Load Simulator
//!
//! This is the main entry point for the flowstate simulator.
//! It builds a sharded flow-state table, drives one writer thread per shard
//! with a synthetic flow workload, and runs the background expiry sweeper
//! while periodically logging table statistics.

use anyhow::{bail, Context};
use bytes::Bytes;
use flowstate::state::{
    start_expiry_sweeper, FlowStateShard, FlowStateTable, IdleExpiration, ShardedFlowStateTable,
};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Every worker moves on to a fresh set of flows after this many rounds.
const ROUNDS_PER_GENERATION: u64 = 200;

/// One source-address octet per shard.
const MAX_SHARDS: usize = 256;

/// Two source-address octets per flow.
const MAX_FLOWS: u32 = 65_536;

/// Simulator configuration
struct SimConfig {
    /// Number of shards, one writer thread each
    shards: usize,
    /// Live flows per shard
    flows: u32,
    /// How long to run
    duration: Duration,
    /// Idle budget of every flow
    idle: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            shards: 4,
            flows: 1_000,
            duration: Duration::from_secs(10),
            idle: Duration::from_millis(250),
        }
    }
}

impl SimConfig {
    /// Parse configuration from command-line arguments
    fn from_args() -> anyhow::Result<Self> {
        Self::parse(std::env::args().skip(1))
    }

    fn parse<I>(args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = SimConfig::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            let mut value = |flag: &str| {
                args.next()
                    .with_context(|| format!("{} requires a value", flag))
            };
            match arg.as_str() {
                "--shards" | "-s" => {
                    config.shards = value("--shards")?.parse().context("invalid shard count")?;
                }
                "--flows" | "-f" => {
                    config.flows = value("--flows")?.parse().context("invalid flow count")?;
                }
                "--seconds" | "-t" => {
                    let secs: u64 = value("--seconds")?.parse().context("invalid duration")?;
                    config.duration = Duration::from_secs(secs);
                }
                "--idle-ms" | "-i" => {
                    let ms: u64 = value("--idle-ms")?.parse().context("invalid idle budget")?;
                    config.idle = Duration::from_millis(ms);
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("flowstate version {}", flowstate::VERSION);
                    std::process::exit(0);
                }
                other => {
                    print_help();
                    bail!("unknown argument: {}", other);
                }
            }
        }

        if config.shards == 0 {
            bail!("--shards must be at least 1");
        }
        if config.shards > MAX_SHARDS {
            bail!("--shards must be at most {}", MAX_SHARDS);
        }
        if config.flows > MAX_FLOWS {
            bail!("--flows must be at most {}", MAX_FLOWS);
        }
        Ok(config)
    }
}

fn print_help() {
    println!(
        r#"
flowstate - Sharded Flow State Table Simulator

USAGE:
    flowstate [OPTIONS]

OPTIONS:
    -s, --shards <N>      Number of shards / writer threads, 1-256 (default: 4)
    -f, --flows <N>       Live flows per shard, at most 65536 (default: 1000)
    -t, --seconds <N>     Run time in seconds (default: 10)
    -i, --idle-ms <MS>    Idle budget of each flow (default: 250)
    -v, --version         Print version information
    -h, --help            Print this help message

Set RUST_LOG=flowstate=debug to see per-shard sweep results.
"#
    );
}

/// A synthetic 5-tuple with its idle budget.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FlowKey {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    protocol: u8,
    idle: Duration,
}

impl FlowKey {
    /// Shard index is baked into the source address, keeping shard keyspaces
    /// disjoint while `shard < MAX_SHARDS` and `flow < MAX_FLOWS`.
    fn new(shard: usize, flow: u32, generation: u64, idle: Duration) -> Self {
        let [_, _, hi, lo] = flow.to_be_bytes();
        Self {
            src: Ipv4Addr::new(10, shard as u8, hi, lo),
            dst: Ipv4Addr::new(192, 168, 0, 1),
            src_port: 1024 + (generation % 60_000) as u16,
            dst_port: 443,
            protocol: 6,
            idle,
        }
    }

    fn binding(&self) -> Bytes {
        Bytes::from(format!("nat {}:{} -> 203.0.113.7", self.src, self.src_port))
    }
}

impl IdleExpiration for FlowKey {
    fn expires_after(&self) -> Duration {
        self.idle
    }
}

/// Writer loop for one shard: reference, release, keep-alive and look up
/// every owned flow in rotation.
fn worker_loop(
    shard: FlowStateShard<FlowKey, Bytes>,
    flows: u32,
    idle: Duration,
    running: Arc<AtomicBool>,
) -> anyhow::Result<u64> {
    let index = shard.index();
    let mut ops = 0u64;
    let mut round = 0u64;

    while running.load(Ordering::Relaxed) {
        let generation = round / ROUNDS_PER_GENERATION;
        // Release everything before moving on so retired flows can go idle
        let retiring = (round + 1) % ROUNDS_PER_GENERATION == 0;
        for flow in 0..flows {
            let key = FlowKey::new(index, flow, generation, idle);
            let action = if retiring {
                1
            } else {
                (round + u64::from(flow)) % 4
            };
            match action {
                0 => {
                    if shard.reference(&key).is_none() {
                        let binding = key.binding();
                        shard.store_and_reference(key, binding)?;
                    }
                }
                1 => shard.unref(&key),
                2 => {
                    let binding = key.binding();
                    shard.touch(key, binding);
                }
                _ => {
                    shard.get(&key);
                }
            }
            ops += 1;
        }
        round += 1;
        thread::sleep(Duration::from_millis(1));
    }

    Ok(ops)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SimConfig::from_args()?;

    // Set up logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install tracing subscriber")?;

    let table = Arc::new(ShardedFlowStateTable::<FlowKey, Bytes>::new());
    let _sweeper = start_expiry_sweeper(Arc::clone(&table));

    let running = Arc::new(AtomicBool::new(true));
    let workers = (0..config.shards)
        .map(|_| {
            let shard = table.add_shard();
            let running = Arc::clone(&running);
            let (flows, idle) = (config.flows, config.idle);
            thread::Builder::new()
                .name(format!("flow-worker-{}", shard.index()))
                .spawn(move || worker_loop(shard, flows, idle, running))
                .context("failed to spawn worker thread")
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    info!(
        shards = config.shards,
        flows_per_shard = config.flows,
        idle_ms = config.idle.as_millis(),
        "Simulation started"
    );

    let report = {
        let table = Arc::clone(&table);
        async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                let stats = table.stats();
                info!(
                    entries = stats.entries,
                    idle_slots = stats.idle_slots,
                    expired = stats.expired,
                    referenced = table.fold(0usize, |n, k, _| n + table.ref_count(k).min(1)),
                    "Flow table"
                );
            }
        }
    };

    tokio::select! {
        _ = report => {}
        _ = tokio::time::sleep(config.duration) => {
            info!("Simulation time elapsed");
        }
        result = signal::ctrl_c() => {
            result.context("failed to listen for Ctrl+C")?;
            info!("Shutdown signal received, stopping workers...");
        }
    }

    running.store(false, Ordering::Relaxed);
    let total_ops = tokio::task::spawn_blocking(move || {
        workers
            .into_iter()
            .try_fold(0u64, |total, handle| -> anyhow::Result<u64> {
                match handle.join() {
                    Ok(ops) => Ok(total + ops?),
                    Err(_) => {
                        warn!("A flow worker panicked");
                        Ok(total)
                    }
                }
            })
    })
    .await
    .context("failed to join workers")??;

    let stats = table.stats();
    info!(
        total_ops,
        entries = stats.entries,
        expired = stats.expired,
        "Simulation complete"
    );
    Ok(())
}
