// Miner registry: id → record, heartbeat liveness, control flags.
//
// The registry exclusively owns every record; callers get clones. All
// mutation happens through the pool's registry writer lock. Records outlive
// their miners: a stale or stopped miner keeps its historical stats and
// only drops out of the "active" aggregates.
use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;

use crate::config::{HEARTBEAT_INTERVAL_SECS, LIVENESS_FACTOR};
use crate::primitives::{GpuDevice, MinerStatus};

/// A miner is externally "active" while its last heartbeat is within this
/// window.
pub const LIVENESS_WINDOW_SECS: i64 = (LIVENESS_FACTOR * HEARTBEAT_INTERVAL_SECS) as i64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("miner id already registered and active")]
    Duplicate,
}

#[derive(Debug, Clone, Serialize)]
pub struct MinerRecord {
    pub id: String,
    /// IP the miner claims for itself.
    pub reported_ip: String,
    /// IP the transport actually saw at registration. Never client-mutable.
    pub observed_ip: String,
    pub hostname: String,
    pub registered_at: i64,
    pub last_heartbeat: i64,
    pub active: bool,
    pub blocks_mined: u64,
    pub total_hashes: u64,
    pub hash_rate: u64,
    pub cpu_usage_pct: f32,
    pub started_at: i64,
    pub should_mine: bool,
    pub cpu_throttle_pct: u8,
    pub gpu_devices: Vec<GpuDevice>,
    pub gpu_hash_rate: u64,
    pub gpu_enabled: bool,
    pub hybrid_mode: bool,
    pub pending_deletion: bool,
}

impl MinerRecord {
    fn fresh(id: String, reported_ip: String, hostname: String, observed_ip: String, now: i64) -> Self {
        MinerRecord {
            id,
            reported_ip,
            observed_ip,
            hostname,
            registered_at: now,
            last_heartbeat: now,
            active: true,
            blocks_mined: 0,
            total_hashes: 0,
            hash_rate: 0,
            cpu_usage_pct: 0.0,
            started_at: now,
            should_mine: true,
            cpu_throttle_pct: 0,
            gpu_devices: Vec::new(),
            gpu_hash_rate: 0,
            gpu_enabled: false,
            hybrid_mode: false,
            pending_deletion: false,
        }
    }

    fn is_fresh(&self, now: i64) -> bool {
        now - self.last_heartbeat <= LIVENESS_WINDOW_SECS
    }

    /// The externally visible notion of "active": the record is active AND
    /// heartbeat-fresh.
    pub fn is_live(&self, now: i64) -> bool {
        self.active && self.is_fresh(now)
    }
}

/// What a miner is told on each heartbeat.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatDirective {
    pub active: bool,
    pub should_mine: bool,
    pub cpu_throttle_pct: u8,
    pub message: String,
}

impl HeartbeatDirective {
    fn terminate(message: &str) -> Self {
        HeartbeatDirective {
            active: false,
            should_mine: false,
            cpu_throttle_pct: 0,
            message: message.to_string(),
        }
    }
}

/// Aggregate over the live subset, for /api/stats and /api/cpu.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryAggregate {
    pub total_miners: usize,
    pub active_miners: usize,
    pub total_blocks_mined: u64,
    pub total_hashes: u64,
    pub cpu_hash_rate: u64,
    pub gpu_hash_rate: u64,
    pub total_hash_rate: u64,
    pub avg_cpu_usage_pct: f32,
    pub gpu_miners: usize,
    pub hybrid_miners: usize,
    pub gpu_devices: usize,
}

#[derive(Default)]
pub struct MinerRegistry {
    miners: HashMap<String, MinerRecord>,
}

impl MinerRegistry {
    pub fn new() -> Self {
        MinerRegistry {
            miners: HashMap::new(),
        }
    }

    /// Create or replace a record. An id held by a live miner is taken; an
    /// id whose holder went stale, was stopped or was evicted is reusable
    /// and the old record is replaced wholesale.
    pub fn register(
        &mut self,
        id: &str,
        reported_ip: &str,
        hostname: &str,
        observed_ip: &str,
        now: i64,
    ) -> Result<(), RegisterError> {
        if let Some(existing) = self.miners.get(id)
            && existing.is_live(now)
        {
            return Err(RegisterError::Duplicate);
        }
        self.miners.insert(
            id.to_string(),
            MinerRecord::fresh(
                id.to_string(),
                reported_ip.to_string(),
                hostname.to_string(),
                observed_ip.to_string(),
                now,
            ),
        );
        Ok(())
    }

    /// Apply a status report and hand back the control directive. A missing,
    /// stopped or pending-deletion record tells the miner to terminate; a
    /// pending deletion is consumed here by deactivating the record.
    pub fn heartbeat(&mut self, status: &MinerStatus, now: i64) -> HeartbeatDirective {
        let Some(rec) = self.miners.get_mut(&status.miner_id) else {
            return HeartbeatDirective::terminate("unknown miner: re-register or shut down");
        };
        if rec.pending_deletion {
            rec.pending_deletion = false;
            rec.active = false;
            return HeartbeatDirective::terminate("evicted by pool operator");
        }
        if !rec.active {
            return HeartbeatDirective::terminate("miner is stopped");
        }

        // Monotonic: two heartbeats racing must never move the clock back.
        rec.last_heartbeat = rec.last_heartbeat.max(now);
        rec.hash_rate = status.hash_rate;
        rec.total_hashes = status.total_hashes;
        rec.cpu_usage_pct = status.cpu_usage_pct;
        rec.gpu_devices = status.gpu_devices.clone();
        rec.gpu_hash_rate = status.gpu_hash_rate;
        rec.gpu_enabled = status.gpu_enabled;
        rec.hybrid_mode = status.hybrid_mode;

        HeartbeatDirective {
            active: true,
            should_mine: rec.should_mine,
            cpu_throttle_pct: rec.cpu_throttle_pct,
            message: "ok".to_string(),
        }
    }

    /// Flag consumed on the next heartbeat (eviction).
    pub fn mark_pending_deletion(&mut self, id: &str) -> bool {
        match self.miners.get_mut(id) {
            Some(rec) => {
                rec.pending_deletion = true;
                true
            }
            None => false,
        }
    }

    pub fn set_should_mine(&mut self, id: &str, should_mine: bool) -> bool {
        match self.miners.get_mut(id) {
            Some(rec) => {
                rec.should_mine = should_mine;
                true
            }
            None => false,
        }
    }

    pub fn set_throttle(&mut self, id: &str, pct: u8) -> bool {
        match self.miners.get_mut(id) {
            Some(rec) => {
                rec.cpu_throttle_pct = pct.min(100);
                true
            }
            None => false,
        }
    }

    /// Deactivate and return the final block count.
    pub fn stop(&mut self, id: &str) -> Option<u64> {
        let rec = self.miners.get_mut(id)?;
        rec.active = false;
        Some(rec.blocks_mined)
    }

    pub fn record_block(&mut self, id: &str) {
        if let Some(rec) = self.miners.get_mut(id) {
            rec.blocks_mined += 1;
        }
    }

    pub fn get(&self, id: &str) -> Option<&MinerRecord> {
        self.miners.get(id)
    }

    pub fn is_live(&self, id: &str, now: i64) -> bool {
        self.miners.get(id).is_some_and(|r| r.is_live(now))
    }

    /// Clones of every record with `active` resolved to the external
    /// liveness notion.
    pub fn snapshot(&self, now: i64) -> Vec<MinerRecord> {
        let mut out: Vec<MinerRecord> = self
            .miners
            .values()
            .map(|r| {
                let mut r = r.clone();
                r.active = r.is_live(now);
                r
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn aggregate(&self, now: i64) -> RegistryAggregate {
        let mut agg = RegistryAggregate {
            total_miners: self.miners.len(),
            ..Default::default()
        };
        let mut cpu_pct_sum = 0.0f32;
        for rec in self.miners.values() {
            agg.total_blocks_mined += rec.blocks_mined;
            if !rec.is_live(now) {
                continue;
            }
            agg.active_miners += 1;
            agg.total_hashes += rec.total_hashes;
            agg.cpu_hash_rate += rec.hash_rate.saturating_sub(rec.gpu_hash_rate);
            agg.gpu_hash_rate += rec.gpu_hash_rate;
            agg.total_hash_rate += rec.hash_rate;
            cpu_pct_sum += rec.cpu_usage_pct;
            if rec.gpu_enabled {
                agg.gpu_miners += 1;
            }
            if rec.hybrid_mode {
                agg.hybrid_miners += 1;
            }
            agg.gpu_devices += rec.gpu_devices.len();
        }
        if agg.active_miners > 0 {
            agg.avg_cpu_usage_pct = cpu_pct_sum / agg.active_miners as f32;
        }
        agg
    }
}
