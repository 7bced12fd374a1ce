// Data Structures: Block, WorkTemplate, Submission, miner status
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::crypto::hash::{block_hash, meets_difficulty};

pub const GENESIS_DATA: &str = "Genesis Block";
pub const GENESIS_PREV_HASH: &str = "0";

/// Current unix time in whole seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// One link of the chain. Created only by the submission validator when a
/// solution is accepted; never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub index: u64,
    pub timestamp: i64,
    pub data: String,
    pub previous_hash: String,
    pub nonce: i64,
    pub hash: String,
    pub miner_id: String,
}

impl Block {
    /// Genesis: index 0, previous_hash "0", nonce 0. The hash is computed,
    /// not subject to difficulty.
    pub fn genesis(timestamp: i64) -> Self {
        let hash = block_hash(0, timestamp, GENESIS_DATA, GENESIS_PREV_HASH, 0);
        Block {
            index: 0,
            timestamp,
            data: GENESIS_DATA.to_string(),
            previous_hash: GENESIS_PREV_HASH.to_string(),
            nonce: 0,
            hash,
            miner_id: String::new(),
        }
    }

    /// Recompute the canonical hash from this block's own fields.
    pub fn compute_hash(&self) -> String {
        block_hash(
            self.index,
            self.timestamp,
            &self.data,
            &self.previous_hash,
            self.nonce,
        )
    }
}

/// The prefix of a block a miner must solve: everything except nonce, hash
/// and miner_id. Pure value; copies of the latest template per height are
/// cached by the pool so every miner races the same target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkTemplate {
    pub block_index: u64,
    pub timestamp: i64,
    pub data: String,
    pub previous_hash: String,
    pub difficulty: u8,
}

impl WorkTemplate {
    /// Hash of this template solved with `nonce`.
    pub fn hash_with_nonce(&self, nonce: i64) -> String {
        block_hash(
            self.block_index,
            self.timestamp,
            &self.data,
            &self.previous_hash,
            nonce,
        )
    }

    /// Does `nonce` solve this template?
    pub fn solves(&self, nonce: i64, hash: &str) -> bool {
        meets_difficulty(hash, self.difficulty) && self.hash_with_nonce(nonce) == hash
    }

    /// Materialize a full block from this template plus a winning nonce.
    pub fn into_block(self, nonce: i64, hash: String, miner_id: String) -> Block {
        Block {
            index: self.block_index,
            timestamp: self.timestamp,
            data: self.data,
            previous_hash: self.previous_hash,
            nonce,
            hash,
            miner_id,
        }
    }
}

/// A claimed solution, consumed by the validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub miner_id: String,
    pub block_index: u64,
    pub nonce: i64,
    pub hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpuKind {
    Cuda,
    OpenCl,
}

impl std::fmt::Display for GpuKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuKind::Cuda => write!(f, "CUDA"),
            GpuKind::OpenCl => write!(f, "OpenCL"),
        }
    }
}

/// Immutable GPU snapshot carried in each heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GpuDevice {
    pub id: i32,
    pub name: String,
    pub kind: GpuKind,
    pub memory_bytes: u64,
    pub compute_units: i32,
    pub available: bool,
}

/// Per-heartbeat status report from a miner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinerStatus {
    pub miner_id: String,
    pub hash_rate: u64,
    pub blocks_mined: u64,
    pub cpu_usage_pct: f32,
    pub total_hashes: u64,
    pub mining_time_seconds: u64,
    pub gpu_devices: Vec<GpuDevice>,
    pub gpu_hash_rate: u64,
    pub gpu_enabled: bool,
    pub hybrid_mode: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_invariants() {
        let g = Block::genesis(1700000000);
        assert_eq!(g.index, 0);
        assert_eq!(g.previous_hash, "0");
        assert_eq!(g.nonce, 0);
        assert_eq!(g.data, "Genesis Block");
        assert_eq!(g.hash, g.compute_hash());
        assert_eq!(g.hash.len(), 64);
    }

    #[test]
    fn test_template_solve_and_materialize() {
        let tpl = WorkTemplate {
            block_index: 1,
            timestamp: 1700000000,
            data: "Block 1".to_string(),
            previous_hash: "0".repeat(64),
            difficulty: 0,
        };
        let hash = tpl.hash_with_nonce(42);
        assert!(tpl.solves(42, &hash));
        assert!(!tpl.solves(43, &hash));

        let block = tpl.clone().into_block(42, hash.clone(), "m1".to_string());
        assert_eq!(block.index, 1);
        assert_eq!(block.hash, hash);
        assert_eq!(block.compute_hash(), hash);
        assert_eq!(block.miner_id, "m1");
    }
}
