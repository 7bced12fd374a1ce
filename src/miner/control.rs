// Miner control loop: heartbeat ticker plus the outer mining loop.
//
// All server control arrives through heartbeat responses: there is no push
// channel. Pause, throttle and eviction therefore take effect within one
// heartbeat interval; tip advances are spotted sooner by the work-poll
// task that runs beside each race.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use colored::*;
use sysinfo::System;
use tokio::sync::Mutex;
use tokio::time::{Instant, interval, sleep};

use crate::config::{HEARTBEAT_INTERVAL_SECS, WORK_POLL_SECS};
use crate::miner::engine::{EngineShared, run_race};
use crate::miner::gpu::RangeBackend;
use crate::net::client::PoolClient;
use crate::primitives::{GpuDevice, MinerStatus, Submission};

pub struct MinerConfig {
    pub miner_id: String,
    pub cpu_workers: usize,
    pub gpu_enabled: bool,
    pub hybrid_mode: bool,
    pub quiet: bool,
    pub verbose: bool,
}

/// Periodic status report; applies whatever the pool decided since last
/// tick. Returns when the miner is evicted or shut down.
pub async fn heartbeat_loop(
    client: Arc<Mutex<PoolClient>>,
    shared: Arc<EngineShared>,
    cfg: Arc<MinerConfig>,
    gpu_devices: Vec<GpuDevice>,
) {
    let started = Instant::now();
    let mut sys = System::new();
    sys.refresh_cpu_usage();

    let mut ticker = interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    ticker.tick().await; // immediate first tick is not a measurement
    let mut prev_total: u64 = 0;
    let mut prev_gpu: u64 = 0;

    loop {
        ticker.tick().await;
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }

        // Rates are computed out here; the registry lock on the server side
        // only ever sees the finished numbers.
        sys.refresh_cpu_usage();
        let cpu_usage_pct = sys.global_cpu_info().cpu_usage();
        let total = shared.total_hashes.load(Ordering::Relaxed);
        let gpu = shared.gpu_hashes.load(Ordering::Relaxed);
        let hash_rate = (total - prev_total) / HEARTBEAT_INTERVAL_SECS;
        let gpu_hash_rate = (gpu - prev_gpu) / HEARTBEAT_INTERVAL_SECS;
        prev_total = total;
        prev_gpu = gpu;

        let status = MinerStatus {
            miner_id: cfg.miner_id.clone(),
            hash_rate,
            blocks_mined: shared.blocks_mined.load(Ordering::Relaxed),
            cpu_usage_pct,
            total_hashes: total,
            mining_time_seconds: started.elapsed().as_secs(),
            gpu_devices: gpu_devices.clone(),
            gpu_hash_rate,
            gpu_enabled: cfg.gpu_enabled,
            hybrid_mode: cfg.hybrid_mode,
        };

        match client.lock().await.heartbeat(status).await {
            Ok(d) if !d.active => {
                println!(
                    "{} pool terminated this miner: {}",
                    "[heartbeat]".bright_red().bold(),
                    d.message
                );
                shared.evicted.store(true, Ordering::SeqCst);
                shared.shutdown.store(true, Ordering::SeqCst);
                return;
            }
            Ok(d) => {
                let was_mining = shared.should_mine.swap(d.should_mine, Ordering::SeqCst);
                if was_mining != d.should_mine && !cfg.quiet {
                    println!(
                        "{} mining {}",
                        "[heartbeat]".bright_cyan().bold(),
                        if d.should_mine { "resumed" } else { "paused" }
                    );
                }
                shared
                    .throttle_pct
                    .store(d.cpu_throttle_pct as u32, Ordering::SeqCst);
                if cfg.verbose {
                    println!(
                        "{} {} H/s cpu {:.0}% throttle {}%",
                        "[heartbeat]".bright_cyan().bold(),
                        hash_rate,
                        cpu_usage_pct,
                        d.cpu_throttle_pct
                    );
                }
            }
            Err(e) => {
                // Transient: keep mining, report again next tick.
                eprintln!(
                    "{} heartbeat failed ({e}); retrying next tick",
                    "[heartbeat]".bright_yellow().bold()
                );
            }
        }
    }
}

/// Outer mining loop: fetch work, race it, submit the winner, repeat.
pub async fn mining_loop(
    client: Arc<Mutex<PoolClient>>,
    shared: Arc<EngineShared>,
    cfg: Arc<MinerConfig>,
    backends: Arc<Vec<RangeBackend>>,
) {
    let mut current_index: u64 = 0;

    while !shared.shutdown.load(Ordering::SeqCst) {
        if !shared.should_mine.load(Ordering::SeqCst) {
            sleep(Duration::from_millis(500)).await;
            continue;
        }

        let tpl = match client.lock().await.get_work(&cfg.miner_id).await {
            Ok(tpl) => tpl,
            Err(e) => {
                eprintln!(
                    "{} get_work failed ({e}); retrying",
                    "[miner]".bright_yellow().bold()
                );
                sleep(Duration::from_secs(2)).await;
                continue;
            }
        };

        // Stale work guard: never race a height below what we already saw.
        if tpl.block_index < current_index {
            sleep(Duration::from_millis(500)).await;
            continue;
        }
        current_index = tpl.block_index;
        if !cfg.quiet {
            println!(
                "{} racing block {} (difficulty {})",
                "[miner]".bright_cyan().bold(),
                tpl.block_index,
                tpl.difficulty
            );
        }

        let done = Arc::new(AtomicBool::new(false));
        let watcher = tokio::spawn(work_watcher(
            client.clone(),
            shared.clone(),
            cfg.clone(),
            done.clone(),
            tpl.block_index,
        ));

        let race_tpl = tpl.clone();
        let race_backends = backends.clone();
        let race_shared = shared.clone();
        let race_done = done.clone();
        let workers = cfg.cpu_workers;
        let solution = tokio::task::spawn_blocking(move || {
            run_race(&race_tpl, &race_backends, workers, &race_shared, &race_done)
        })
        .await
        .unwrap_or(None);

        done.store(true, Ordering::SeqCst);
        let _ = watcher.await;

        let Some(sol) = solution else {
            // Cancelled (new tip, pause, shutdown) or nonce space exhausted;
            // either way the next iteration fetches fresh work.
            continue;
        };
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }

        let submission = Submission {
            miner_id: cfg.miner_id.clone(),
            block_index: tpl.block_index,
            nonce: sol.nonce,
            hash: sol.hash,
        };
        match client.lock().await.submit_work(submission).await {
            Ok((true, reward, _)) => {
                shared.blocks_mined.fetch_add(1, Ordering::Relaxed);
                println!(
                    "{} block {} accepted, reward {}",
                    "[miner]".bright_green().bold(),
                    tpl.block_index,
                    reward
                );
            }
            Ok((false, _, message)) => {
                if !cfg.quiet {
                    println!(
                        "{} block {} rejected: {}",
                        "[miner]".bright_yellow().bold(),
                        tpl.block_index,
                        message
                    );
                }
            }
            Err(e) => {
                eprintln!(
                    "{} submit failed ({e})",
                    "[miner]".bright_yellow().bold()
                );
            }
        }
    }
}

/// Runs beside a race and closes `done` when the race is obsolete: the tip
/// advanced past our height, the pool paused us, or we are shutting down.
async fn work_watcher(
    client: Arc<Mutex<PoolClient>>,
    shared: Arc<EngineShared>,
    cfg: Arc<MinerConfig>,
    done: Arc<AtomicBool>,
    racing_index: u64,
) {
    loop {
        sleep(Duration::from_secs(WORK_POLL_SECS)).await;
        if done.load(Ordering::SeqCst) {
            return;
        }
        if shared.shutdown.load(Ordering::SeqCst) || !shared.should_mine.load(Ordering::SeqCst) {
            done.store(true, Ordering::SeqCst);
            return;
        }
        match client.lock().await.get_work(&cfg.miner_id).await {
            Ok(tpl) if tpl.block_index > racing_index => {
                if !cfg.quiet {
                    println!(
                        "{} tip advanced to {}, cancelling race",
                        "[miner]".bright_cyan().bold(),
                        tpl.block_index
                    );
                }
                done.store(true, Ordering::SeqCst);
                return;
            }
            // Same height or a transient error: keep racing.
            _ => {}
        }
    }
}
