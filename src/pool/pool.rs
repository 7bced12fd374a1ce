// MiningPool: the process-wide coordinator state.
//
// Owns the blockchain and the miner registry behind two reader/writer
// locks. The cached work template lives under the SAME lock as the chain so
// that appending a block and invalidating the template are one atomic step;
// that is what makes the single-winner guarantee hold.
//
// Lock discipline: when both locks are needed, the chain state lock is
// taken first and the registry lock nests inside it (submit) or follows it
// (reward accounting). No lock is held across an await point. Poisoning is
// fatal by design.
use std::sync::RwLock;

use rand::RngCore;
use serde::Serialize;

use crate::chain::{Blockchain, ValidationError};
use crate::crypto::hash::meets_difficulty;
use crate::pool::registry::{HeartbeatDirective, MinerRecord, MinerRegistry, RegisterError, RegistryAggregate};
use crate::config::TEMPLATE_MAX_AGE_SECS;
use crate::primitives::{Block, MinerStatus, Submission, WorkTemplate, unix_now};

struct ChainState {
    chain: Blockchain,
    template: Option<WorkTemplate>,
}

/// Verdict returned to a submitting miner.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitOutcome {
    pub accepted: bool,
    pub reward: u64,
    pub message: String,
}

impl SubmitOutcome {
    fn rejected(message: &str) -> Self {
        SubmitOutcome {
            accepted: false,
            reward: 0,
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub height: u64,
    pub difficulty: u8,
    pub reward: u64,
    pub started_at: i64,
    pub total_miners: usize,
    pub active_miners: usize,
    pub total_blocks_mined: u64,
    pub total_hash_rate: u64,
    pub cpu_hash_rate: u64,
    pub gpu_hash_rate: u64,
}

pub struct MiningPool {
    state: RwLock<ChainState>,
    registry: RwLock<MinerRegistry>,
    admin_token: String,
    started_at: i64,
}

/// 64-hex process secret for the admin surface.
pub fn generate_admin_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl MiningPool {
    pub fn new(difficulty: u8, reward: u64, admin_token: Option<String>) -> Self {
        MiningPool {
            state: RwLock::new(ChainState {
                chain: Blockchain::new(difficulty, reward),
                template: None,
            }),
            registry: RwLock::new(MinerRegistry::new()),
            admin_token: admin_token.unwrap_or_else(generate_admin_token),
            started_at: unix_now(),
        }
    }

    pub fn admin_token(&self) -> &str {
        &self.admin_token
    }

    // ---- miner RPC surface -------------------------------------------------

    pub fn register_miner(
        &self,
        id: &str,
        reported_ip: &str,
        hostname: &str,
        observed_ip: &str,
    ) -> Result<(), RegisterError> {
        self.registry
            .write()
            .expect("registry lock poisoned")
            .register(id, reported_ip, hostname, observed_ip, unix_now())
    }

    /// Template for the current tip. All miners asking at the same height
    /// get the same cached template, so the whole pool races one target.
    pub fn get_work(&self) -> WorkTemplate {
        let mut st = self.state.write().expect("chain lock poisoned");
        let height = st.chain.height();
        let fresh = match &st.template {
            Some(tpl) if tpl.block_index == height => None,
            _ => Some(WorkTemplate {
                block_index: height,
                timestamp: unix_now(),
                data: format!("Block {height}"),
                previous_hash: st.chain.tip().hash,
                difficulty: st.chain.difficulty(),
            }),
        };
        if let Some(tpl) = fresh {
            st.template = Some(tpl);
        }
        st.template.clone().expect("template just ensured")
    }

    /// Validate a claimed solution and, if it wins its height, append it.
    ///
    /// The whole ladder runs under the chain writer lock: exactly one
    /// submission per height can observe `block_index == height()`, so at
    /// most one append happens and every later submitter sees `Stale`.
    ///
    /// Template policy is strict: the candidate is rebuilt from the cached
    /// template, so a solution computed against a refreshed-away template
    /// cannot reach the chain.
    pub fn submit(&self, sub: &Submission) -> SubmitOutcome {
        let reward;
        {
            let mut st = self.state.write().expect("chain lock poisoned");
            let height = st.chain.height();
            if sub.block_index < height {
                return SubmitOutcome::rejected("stale block: height already mined");
            }
            if sub.block_index > height {
                return SubmitOutcome::rejected("block index ahead of chain: re-fetch work");
            }

            // Registry read nests inside the chain writer lock (always in
            // that order) so the verdict is decided atomically: a stale
            // submission reads as stale even from an evicted miner, and
            // an eviction landing mid-ladder cannot split the outcome.
            if !self
                .registry
                .read()
                .expect("registry lock poisoned")
                .is_live(&sub.miner_id, unix_now())
            {
                return SubmitOutcome::rejected("unknown miner");
            }

            let Some(tpl) = st.template.clone().filter(|t| t.block_index == height) else {
                return SubmitOutcome::rejected("stale template: re-fetch work");
            };

            if !meets_difficulty(&sub.hash, st.chain.difficulty())
                || tpl.hash_with_nonce(sub.nonce) != sub.hash
            {
                return SubmitOutcome::rejected("invalid hash");
            }

            let block = tpl.into_block(sub.nonce, sub.hash.clone(), sub.miner_id.clone());
            if let Err(e) = st.chain.append(block) {
                // Unreachable given the checks above; never corrupt the chain.
                return SubmitOutcome::rejected(&format!("rejected: {e}"));
            }
            st.template = None;
            reward = st.chain.reward();
        }

        self.registry
            .write()
            .expect("registry lock poisoned")
            .record_block(&sub.miner_id);

        SubmitOutcome {
            accepted: true,
            reward,
            message: format!("block {} accepted", sub.block_index),
        }
    }

    pub fn heartbeat(&self, status: &MinerStatus) -> HeartbeatDirective {
        self.registry
            .write()
            .expect("registry lock poisoned")
            .heartbeat(status, unix_now())
    }

    /// Graceful miner shutdown; returns the final block count if known.
    pub fn stop_miner(&self, id: &str) -> Option<u64> {
        self.registry.write().expect("registry lock poisoned").stop(id)
    }

    // ---- template lifecycle ------------------------------------------------

    /// Drop the cached template once its timestamp ages out, so an idle
    /// pool still hands out reasonably fresh work. Returns true when the
    /// cache was invalidated.
    pub fn refresh_stale_template(&self) -> bool {
        let mut st = self.state.write().expect("chain lock poisoned");
        match &st.template {
            Some(tpl) if unix_now() - tpl.timestamp >= TEMPLATE_MAX_AGE_SECS => {
                st.template = None;
                true
            }
            _ => false,
        }
    }

    /// Unconditional invalidation (exercised by tests and operator tooling).
    pub fn invalidate_template(&self) {
        self.state.write().expect("chain lock poisoned").template = None;
    }

    // ---- control plane -----------------------------------------------------

    pub fn pause_miner(&self, id: &str) -> bool {
        self.registry
            .write()
            .expect("registry lock poisoned")
            .set_should_mine(id, false)
    }

    pub fn resume_miner(&self, id: &str) -> bool {
        self.registry
            .write()
            .expect("registry lock poisoned")
            .set_should_mine(id, true)
    }

    pub fn throttle_miner(&self, id: &str, pct: u8) -> bool {
        self.registry
            .write()
            .expect("registry lock poisoned")
            .set_throttle(id, pct)
    }

    pub fn delete_miner(&self, id: &str) -> bool {
        self.registry
            .write()
            .expect("registry lock poisoned")
            .mark_pending_deletion(id)
    }

    // ---- admin snapshots ---------------------------------------------------

    pub fn height(&self) -> u64 {
        self.state.read().expect("chain lock poisoned").chain.height()
    }

    pub fn difficulty(&self) -> u8 {
        self.state.read().expect("chain lock poisoned").chain.difficulty()
    }

    pub fn stats(&self) -> PoolStats {
        let (height, difficulty, reward) = {
            let st = self.state.read().expect("chain lock poisoned");
            (st.chain.height(), st.chain.difficulty(), st.chain.reward())
        };
        let agg = self.aggregate();
        PoolStats {
            height,
            difficulty,
            reward,
            started_at: self.started_at,
            total_miners: agg.total_miners,
            active_miners: agg.active_miners,
            total_blocks_mined: agg.total_blocks_mined,
            total_hash_rate: agg.total_hash_rate,
            cpu_hash_rate: agg.cpu_hash_rate,
            gpu_hash_rate: agg.gpu_hash_rate,
        }
    }

    pub fn aggregate(&self) -> RegistryAggregate {
        self.registry
            .read()
            .expect("registry lock poisoned")
            .aggregate(unix_now())
    }

    pub fn miners_snapshot(&self) -> Vec<MinerRecord> {
        self.registry
            .read()
            .expect("registry lock poisoned")
            .snapshot(unix_now())
    }

    pub fn chain_snapshot(&self) -> Vec<Block> {
        self.state
            .read()
            .expect("chain lock poisoned")
            .chain
            .snapshot_all()
    }

    pub fn block(&self, index: u64) -> Option<Block> {
        self.state.read().expect("chain lock poisoned").chain.get(index)
    }

    pub fn validate_chain(&self) -> Result<(), ValidationError> {
        self.state.read().expect("chain lock poisoned").chain.validate_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> MiningPool {
        // Difficulty 1 keeps brute-force solves around 16 attempts.
        MiningPool::new(1, 50, Some("t".repeat(64)))
    }

    fn join(pool: &MiningPool, id: &str) {
        pool.register_miner(id, "10.0.0.2", "host", "192.0.2.1").unwrap();
    }

    fn solve(tpl: &WorkTemplate) -> Submission {
        for nonce in 0.. {
            let hash = tpl.hash_with_nonce(nonce);
            if meets_difficulty(&hash, tpl.difficulty) {
                return Submission {
                    miner_id: String::new(),
                    block_index: tpl.block_index,
                    nonce,
                    hash,
                };
            }
        }
        unreachable!()
    }

    #[test]
    fn test_genesis_and_first_mine() {
        let pool = pool();
        join(&pool, "a");
        assert_eq!(pool.height(), 1);

        let tpl = pool.get_work();
        assert_eq!(tpl.block_index, 1);
        assert_eq!(tpl.data, "Block 1");
        assert_eq!(tpl.previous_hash, pool.block(0).unwrap().hash);

        let mut sub = solve(&tpl);
        sub.miner_id = "a".to_string();
        let out = pool.submit(&sub);
        assert!(out.accepted, "{}", out.message);
        assert_eq!(out.reward, 50);
        assert_eq!(pool.height(), 2);
        assert!(pool.validate_chain().is_ok());

        let rec = pool.miners_snapshot().into_iter().find(|m| m.id == "a").unwrap();
        assert_eq!(rec.blocks_mined, 1);
    }

    #[test]
    fn test_same_template_for_all_miners() {
        let pool = pool();
        join(&pool, "a");
        join(&pool, "b");
        let t1 = pool.get_work();
        let t2 = pool.get_work();
        assert_eq!(t1, t2);
    }

    #[test]
    fn test_race_single_winner() {
        let pool = pool();
        join(&pool, "a");
        join(&pool, "b");

        let tpl = pool.get_work();
        let mut first = solve(&tpl);
        first.miner_id = "a".to_string();

        // A distinct valid solution for the same height.
        let mut second = Submission {
            miner_id: "b".to_string(),
            block_index: tpl.block_index,
            nonce: first.nonce + 1,
            hash: String::new(),
        };
        loop {
            let h = tpl.hash_with_nonce(second.nonce);
            if meets_difficulty(&h, tpl.difficulty) {
                second.hash = h;
                break;
            }
            second.nonce += 1;
        }

        assert!(pool.submit(&first).accepted);
        let out = pool.submit(&second);
        assert!(!out.accepted);
        assert!(out.message.contains("stale"), "{}", out.message);
        assert_eq!(pool.height(), 2);
    }

    #[test]
    fn test_refreshed_template_rejects_old_solution() {
        let pool = pool();
        join(&pool, "a");

        let old = pool.get_work();
        let mut sub = solve(&old);
        sub.miner_id = "a".to_string();

        // Refresh produces a new template for the same height; strict
        // matching means the old solution no longer validates.
        pool.invalidate_template();
        let fresh = pool.get_work();
        assert_eq!(fresh.block_index, old.block_index);

        let out = pool.submit(&sub);
        // Same height, same data, but timestamps (almost always) differ; if
        // the clock did not tick the old solution is still template-exact
        // and acceptance is correct under the documented policy.
        if fresh.timestamp != old.timestamp {
            assert!(!out.accepted);
            assert!(out.message.contains("invalid hash"), "{}", out.message);
        }
        assert!(pool.validate_chain().is_ok());
    }

    #[test]
    fn test_no_template_in_flight_is_stale() {
        let pool = pool();
        join(&pool, "a");
        let tpl = pool.get_work();
        let mut sub = solve(&tpl);
        sub.miner_id = "a".to_string();

        pool.invalidate_template();
        // No cached template for the height at all.
        let out = pool.submit(&sub);
        assert!(!out.accepted);
        assert!(out.message.contains("stale template"), "{}", out.message);
    }

    #[test]
    fn test_index_ahead_rejected() {
        let pool = pool();
        join(&pool, "a");
        let tpl = pool.get_work();
        let mut sub = solve(&tpl);
        sub.miner_id = "a".to_string();
        sub.block_index = 9;
        let out = pool.submit(&sub);
        assert!(!out.accepted);
        assert!(out.message.contains("ahead"), "{}", out.message);
    }

    #[test]
    fn test_unknown_miner_rejected() {
        let pool = pool();
        let tpl = pool.get_work();
        let mut sub = solve(&tpl);
        sub.miner_id = "ghost".to_string();
        let out = pool.submit(&sub);
        assert!(!out.accepted);
        assert_eq!(out.message, "unknown miner");
    }

    #[test]
    fn test_template_invalidated_after_accept() {
        let pool = pool();
        join(&pool, "a");
        let t1 = pool.get_work();
        let mut sub = solve(&t1);
        sub.miner_id = "a".to_string();
        assert!(pool.submit(&sub).accepted);

        let t2 = pool.get_work();
        assert_eq!(t2.block_index, 2);
        assert_eq!(t2.previous_hash, sub.hash);
    }

    #[test]
    fn test_control_ops_roundtrip() {
        let pool = pool();
        join(&pool, "a");
        assert!(pool.pause_miner("a"));
        assert!(!pool.heartbeat(&status("a")).should_mine);
        assert!(pool.resume_miner("a"));
        assert!(pool.heartbeat(&status("a")).should_mine);
        assert!(pool.throttle_miner("a", 50));
        assert_eq!(pool.heartbeat(&status("a")).cpu_throttle_pct, 50);
        assert!(pool.delete_miner("a"));
        assert!(!pool.heartbeat(&status("a")).active);
        assert!(!pool.pause_miner("ghost"));
    }

    fn status(id: &str) -> MinerStatus {
        MinerStatus {
            miner_id: id.to_string(),
            hash_rate: 0,
            blocks_mined: 0,
            cpu_usage_pct: 0.0,
            total_hashes: 0,
            mining_time_seconds: 0,
            gpu_devices: Vec::new(),
            gpu_hash_rate: 0,
            gpu_enabled: false,
            hybrid_mode: false,
        }
    }
}
