// hashforge-miner: long-lived pool worker.
//
// Registers with the pool, then runs two loops side by side: the mining
// loop (fetch work, race CPU/GPU workers, submit) and the heartbeat loop
// (report stats, apply pause/throttle/eviction). Ctrl-C or eviction ends
// both; a graceful exit tells the pool via StopMining.
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use clap::Parser;
use colored::*;
use rand::RngCore;
use tokio::sync::Mutex;

use hashforge::config;
use hashforge::miner::control::{MinerConfig, heartbeat_loop, mining_loop};
use hashforge::miner::engine::EngineShared;
use hashforge::miner::gpu::detect_backends;
use hashforge::net::client::PoolClient;

#[derive(Parser, Debug)]
#[command(name = "hashforge-miner", version, about = "CPU/GPU miner for a hashforge pool")]
struct Args {
    /// Pool address as host:port (overrides HASHFORGE_SERVER)
    #[arg(long)]
    server: Option<String>,

    /// CPU worker threads (default: all logical cores)
    #[arg(long)]
    workers: Option<usize>,

    /// Enable GPU back-ends
    #[arg(long)]
    gpu: bool,

    /// Mine on CPU and GPU simultaneously (disjoint nonce ranges)
    #[arg(long)]
    hybrid: bool,

    /// Miner identity (default: hostname plus random suffix)
    #[arg(long)]
    miner_id: Option<String>,

    /// Suppress per-round output
    #[arg(long)]
    quiet: bool,

    /// Per-heartbeat status lines
    #[arg(long)]
    verbose: bool,
}

fn default_miner_id(host: &str) -> String {
    let mut suffix = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut suffix);
    format!("{host}-{}", hex::encode(suffix))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let server = args.server.unwrap_or_else(config::server_addr);
    let gpu_enabled = args.gpu || config::gpu_enabled();
    let hybrid_mode = gpu_enabled && (args.hybrid || config::hybrid_enabled());

    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown-host".to_string());
    let miner_id = args.miner_id.unwrap_or_else(|| default_miner_id(&hostname));

    let backends = Arc::new(detect_backends(gpu_enabled));
    if gpu_enabled && backends.is_empty() {
        eprintln!(
            "{} no GPU back-end available, continuing on CPU only",
            "[miner]".bright_yellow().bold()
        );
    }
    // GPU-only unless hybrid is on or there is no GPU to lean on.
    let cpu_workers = if !backends.is_empty() && !hybrid_mode {
        0
    } else {
        args.workers.unwrap_or_else(num_cpus::get)
    };

    println!(
        "{} {} → {} ({} CPU workers, {} GPU back-ends{})",
        "[miner]".bright_cyan().bold(),
        miner_id.bright_white(),
        server,
        cpu_workers,
        backends.len(),
        if hybrid_mode { ", hybrid" } else { "" }
    );

    let mut client = PoolClient::new(server);
    if let Err(e) = client.connect_with_retry().await {
        eprintln!("{} {e}", "[miner]".bright_red().bold());
        std::process::exit(1);
    }
    match client.register(&miner_id, &hostname).await {
        Ok((true, _)) => {
            println!("{} registered with pool", "[miner]".bright_green().bold());
        }
        Ok((false, message)) => {
            eprintln!(
                "{} registration rejected: {message}",
                "[miner]".bright_red().bold()
            );
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!(
                "{} registration failed: {e}",
                "[miner]".bright_red().bold()
            );
            std::process::exit(1);
        }
    }

    let gpu_devices: Vec<_> = backends.iter().filter_map(|b| b.device().cloned()).collect();
    let client = Arc::new(Mutex::new(client));
    let shared = EngineShared::new();
    let cfg = Arc::new(MinerConfig {
        miner_id: miner_id.clone(),
        cpu_workers,
        gpu_enabled,
        hybrid_mode,
        quiet: args.quiet,
        verbose: args.verbose,
    });

    let hb = tokio::spawn(heartbeat_loop(
        client.clone(),
        shared.clone(),
        cfg.clone(),
        gpu_devices,
    ));
    let mining = tokio::spawn(mining_loop(
        client.clone(),
        shared.clone(),
        cfg.clone(),
        backends,
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!(
                "{} signal received: shutting down",
                "[miner]".bright_red().bold()
            );
        }
        _ = hb => {
            // Heartbeat loop only returns on eviction or shutdown.
        }
    }
    shared.shutdown.store(true, Ordering::SeqCst);

    // The work watcher closes the current race within one poll interval.
    let _ = tokio::time::timeout(Duration::from_secs(10), mining).await;

    if shared.evicted.load(Ordering::SeqCst) {
        println!(
            "{} server evicted this miner: exiting",
            "[miner]".bright_red().bold()
        );
    } else {
        match client.lock().await.stop_mining(&miner_id, &hostname).await {
            Ok((blocks, _)) => {
                println!(
                    "{} stopped; {} blocks mined this session",
                    "[miner]".bright_green().bold(),
                    blocks
                );
            }
            Err(e) => {
                eprintln!(
                    "{} could not notify pool of shutdown: {e}",
                    "[miner]".bright_yellow().bold()
                );
            }
        }
    }
    Ok(())
}
