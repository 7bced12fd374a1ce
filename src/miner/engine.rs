// Worker engine: one race per work template.
//
// The coordinator spawns CPU stride workers and one driver thread per GPU
// back-end, then blocks on a bounded result channel. First valid solution
// wins; the shared `done` flag fans the cancellation out and every worker
// observes it between hash batches (CPU) or between range launches (GPU).
//
// Nonce partition: GPU back-ends own [0, GPU_NONCE_START), split evenly
// between them and scanned in GPU_BATCH chunks. CPU worker `w` of `n`
// starts at GPU_NONCE_START + w and strides by n. Without GPUs the CPU
// base drops to zero. No two workers ever test the same nonce.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;

use crate::config::{GPU_BATCH, GPU_NONCE_START, THROTTLE_CHECK_HASHES};
use crate::crypto::hash::meets_difficulty;
use crate::miner::gpu::RangeBackend;
use crate::primitives::WorkTemplate;

/// State shared between the engine, the heartbeat loop and the binary.
/// Control flags flow in (pause, throttle, shutdown), counters flow out.
pub struct EngineShared {
    pub should_mine: AtomicBool,
    pub shutdown: AtomicBool,
    pub evicted: AtomicBool,
    pub throttle_pct: AtomicU32,
    pub total_hashes: AtomicU64,
    pub gpu_hashes: AtomicU64,
    pub blocks_mined: AtomicU64,
}

impl EngineShared {
    pub fn new() -> Arc<Self> {
        Arc::new(EngineShared {
            should_mine: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
            throttle_pct: AtomicU32::new(0),
            total_hashes: AtomicU64::new(0),
            gpu_hashes: AtomicU64::new(0),
            blocks_mined: AtomicU64::new(0),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub nonce: i64,
    pub hash: String,
}

/// Base nonce for CPU workers: offset past the GPU window in hybrid mode,
/// zero when no GPU back-end is present.
pub fn cpu_nonce_base(gpu_backends: usize) -> i64 {
    if gpu_backends == 0 { 0 } else { GPU_NONCE_START }
}

/// Sub-window of [0, GPU_NONCE_START) owned by GPU back-end `g` of `n`.
pub fn gpu_window(g: usize, n: usize) -> (i64, i64) {
    let share = GPU_NONCE_START / n as i64;
    let lo = g as i64 * share;
    let hi = if g + 1 == n { GPU_NONCE_START } else { lo + share };
    (lo, hi)
}

/// Race all workers over one template until a solution, cancellation, or
/// full nonce-space exhaustion. Blocking; run it on a blocking thread.
pub fn run_race(
    tpl: &WorkTemplate,
    backends: &Arc<Vec<RangeBackend>>,
    cpu_workers: usize,
    shared: &Arc<EngineShared>,
    done: &Arc<AtomicBool>,
) -> Option<Solution> {
    // Capacity 2: the winner plus at most one racing runner-up; extra
    // posts fall away via try_send once `done` closes the race.
    let (tx, rx) = bounded::<Solution>(2);
    let cpu_base = cpu_nonce_base(backends.len());
    let mut handles = Vec::with_capacity(cpu_workers + backends.len());

    for w in 0..cpu_workers {
        let tpl = tpl.clone();
        let tx = tx.clone();
        let done = done.clone();
        let shared = shared.clone();
        let start = cpu_base + w as i64;
        let stride = cpu_workers as i64;
        let handle = thread::Builder::new()
            .name(format!("cpu-worker-{w}"))
            .spawn(move || cpu_worker(&tpl, start, stride, &shared, &done, tx))
            .expect("spawn cpu worker");
        handles.push(handle);
    }

    for g in 0..backends.len() {
        let tpl = tpl.clone();
        let tx = tx.clone();
        let done = done.clone();
        let shared = shared.clone();
        let backends = backends.clone();
        let count = backends.len();
        let handle = thread::Builder::new()
            .name(format!("gpu-driver-{g}"))
            .spawn(move || gpu_driver(&tpl, &backends[g], g, count, &shared, &done, tx))
            .expect("spawn gpu driver");
        handles.push(handle);
    }

    // The coordinator's copy of the sender must go away so recv() unblocks
    // once every worker has exited.
    drop(tx);

    let winner = rx.recv().ok();
    done.store(true, Ordering::SeqCst);
    // Drain a possible runner-up so no stale solution survives the round.
    while rx.try_recv().is_ok() {}
    for handle in handles {
        let _ = handle.join();
    }
    winner
}

fn cpu_worker(
    tpl: &WorkTemplate,
    start: i64,
    stride: i64,
    shared: &EngineShared,
    done: &AtomicBool,
    tx: crossbeam_channel::Sender<Solution>,
) {
    let mut nonce = start;
    let mut batch: u64 = 0;
    loop {
        for _ in 0..THROTTLE_CHECK_HASHES {
            let hash = tpl.hash_with_nonce(nonce);
            batch += 1;
            if meets_difficulty(&hash, tpl.difficulty) {
                shared.total_hashes.fetch_add(batch, Ordering::Relaxed);
                let _ = tx.try_send(Solution { nonce, hash });
                return;
            }
            nonce = match nonce.checked_add(stride) {
                Some(n) => n,
                None => {
                    // Stride exhausted: end the round; the control loop
                    // re-fetches work with a fresh timestamp.
                    shared.total_hashes.fetch_add(batch, Ordering::Relaxed);
                    return;
                }
            };
        }
        shared.total_hashes.fetch_add(batch, Ordering::Relaxed);
        batch = 0;

        if done.load(Ordering::Relaxed) {
            return;
        }
        let throttle = shared.throttle_pct.load(Ordering::Relaxed) as u64;
        if throttle > 0 {
            thread::sleep(Duration::from_millis(throttle / 10));
        }
    }
}

fn gpu_driver(
    tpl: &WorkTemplate,
    backend: &RangeBackend,
    g: usize,
    backend_count: usize,
    shared: &EngineShared,
    done: &AtomicBool,
    tx: crossbeam_channel::Sender<Solution>,
) {
    let (lo, hi) = gpu_window(g, backend_count);
    let mut start = lo;
    while start < hi {
        if done.load(Ordering::Relaxed) {
            return;
        }
        let count = GPU_BATCH.min((hi - start) as u64);
        let out = backend.mine_range(tpl, start, count, done);
        shared.total_hashes.fetch_add(out.hashes_tried, Ordering::Relaxed);
        shared.gpu_hashes.fetch_add(out.hashes_tried, Ordering::Relaxed);
        if let Some((nonce, hash)) = out.solution {
            let _ = tx.try_send(Solution { nonce, hash });
            return;
        }
        start += count as i64;
    }
    // Window exhausted without a solution; the round ends on the CPU side
    // or by template refresh.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{GpuDevice, GpuKind};

    fn template(difficulty: u8) -> WorkTemplate {
        WorkTemplate {
            block_index: 1,
            timestamp: 1700000000,
            data: "Block 1".to_string(),
            previous_hash: "0".repeat(64),
            difficulty,
        }
    }

    fn cuda_backend() -> RangeBackend {
        RangeBackend::Cuda(GpuDevice {
            id: 0,
            name: "test".to_string(),
            kind: GpuKind::Cuda,
            memory_bytes: 1 << 30,
            compute_units: 8,
            available: true,
        })
    }

    #[test]
    fn test_cpu_race_finds_valid_solution() {
        let tpl = template(1);
        let shared = EngineShared::new();
        let done = Arc::new(AtomicBool::new(false));
        let backends = Arc::new(Vec::new());
        let sol = run_race(&tpl, &backends, 2, &shared, &done).expect("difficulty 1");
        assert!(tpl.solves(sol.nonce, &sol.hash));
        // CPU-only: nonces start at zero, no GPU offset.
        assert!(sol.nonce < GPU_NONCE_START);
        assert!(shared.total_hashes.load(Ordering::Relaxed) > 0);
        assert_eq!(shared.gpu_hashes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_gpu_only_race() {
        let tpl = template(1);
        let shared = EngineShared::new();
        let done = Arc::new(AtomicBool::new(false));
        let backends = Arc::new(vec![cuda_backend()]);
        let sol = run_race(&tpl, &backends, 0, &shared, &done).expect("difficulty 1");
        assert!(tpl.solves(sol.nonce, &sol.hash));
        assert!(shared.gpu_hashes.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_cancelled_race_returns_none() {
        let tpl = template(64); // unsatisfiable
        let shared = EngineShared::new();
        let done = Arc::new(AtomicBool::new(true));
        let backends = Arc::new(Vec::new());
        // Workers run at most one batch before observing `done`.
        let sol = run_race(&tpl, &backends, 2, &shared, &done);
        assert!(sol.is_none());
    }

    #[test]
    fn test_hybrid_partition_disjoint() {
        // CPU workers sit strictly above the GPU window.
        assert_eq!(cpu_nonce_base(1), GPU_NONCE_START);
        assert_eq!(cpu_nonce_base(0), 0);

        // CPU stride classes never collide with each other.
        let n = 4i64;
        for w1 in 0..n {
            for w2 in (w1 + 1)..n {
                // start ≡ base + w (mod n); distinct residues, disjoint sets
                assert_ne!((GPU_NONCE_START + w1) % n, (GPU_NONCE_START + w2) % n);
            }
        }

        // GPU sub-windows tile [0, GPU_NONCE_START) without overlap.
        let (a_lo, a_hi) = gpu_window(0, 2);
        let (b_lo, b_hi) = gpu_window(1, 2);
        assert_eq!(a_lo, 0);
        assert_eq!(a_hi, b_lo);
        assert_eq!(b_hi, GPU_NONCE_START);
    }

    #[test]
    fn test_winner_is_single_and_drained() {
        // Two workers at difficulty 0 both solve on their first hash; the
        // race must still yield exactly one winner and leave no residue.
        let tpl = template(0);
        let shared = EngineShared::new();
        let done = Arc::new(AtomicBool::new(false));
        let backends = Arc::new(Vec::new());
        let sol = run_race(&tpl, &backends, 2, &shared, &done).expect("always solves");
        assert!(tpl.solves(sol.nonce, &sol.hash));
        assert!(done.load(Ordering::SeqCst));
    }
}
