// Append-only hash-chained block store.
//
// The store itself is a plain value; the owning pool wraps it in a single
// reader/writer lock. Blocks are validated on the way in and never mutated
// or removed, so a full-chain validation failure can only mean an internal
// invariant was broken.
use rayon::prelude::*;
use thiserror::Error;

use crate::crypto::hash::meets_difficulty;
use crate::primitives::{Block, unix_now};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AppendError {
    #[error("index mismatch: candidate {candidate}, chain height {height}")]
    IndexMismatch { candidate: u64, height: u64 },
    #[error("previous hash does not match chain tip")]
    PrevHashMismatch,
    #[error("hash does not match canonical serialization")]
    HashMismatch,
    #[error("hash does not meet difficulty {0}")]
    DifficultyUnmet(u8),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("block {0}: index out of sequence")]
    IndexOutOfSequence(u64),
    #[error("block {0}: previous hash link broken")]
    BrokenLink(u64),
    #[error("block {0}: stored hash does not match canonical serialization")]
    HashMismatch(u64),
    #[error("block {0}: hash does not meet difficulty")]
    DifficultyUnmet(u64),
}

pub struct Blockchain {
    blocks: Vec<Block>,
    difficulty: u8,
    reward: u64,
}

impl Blockchain {
    /// Construct with a genesis block at index 0. The genesis hash is
    /// computed, not mined; difficulty applies from block 1 on.
    pub fn new(difficulty: u8, reward: u64) -> Self {
        Blockchain {
            blocks: vec![Block::genesis(unix_now())],
            difficulty,
            reward,
        }
    }

    pub fn difficulty(&self) -> u8 {
        self.difficulty
    }

    pub fn reward(&self) -> u64 {
        self.reward
    }

    /// Number of blocks, genesis included. Equals the index the next block
    /// must carry.
    pub fn height(&self) -> u64 {
        self.blocks.len() as u64
    }

    /// Copy of the latest block. The chain is never empty.
    pub fn tip(&self) -> Block {
        self.blocks.last().cloned().expect("chain has genesis")
    }

    pub fn get(&self, index: u64) -> Option<Block> {
        self.blocks.get(index as usize).cloned()
    }

    pub fn snapshot_all(&self) -> Vec<Block> {
        self.blocks.clone()
    }

    /// Append `candidate` iff it extends the tip with a valid proof.
    /// Rejection leaves the chain untouched.
    pub fn append(&mut self, candidate: Block) -> Result<(), AppendError> {
        let height = self.height();
        if candidate.index != height {
            return Err(AppendError::IndexMismatch {
                candidate: candidate.index,
                height,
            });
        }
        let tip_hash = &self.blocks.last().expect("chain has genesis").hash;
        if candidate.previous_hash != *tip_hash {
            return Err(AppendError::PrevHashMismatch);
        }
        if candidate.compute_hash() != candidate.hash {
            return Err(AppendError::HashMismatch);
        }
        if !meets_difficulty(&candidate.hash, self.difficulty) {
            return Err(AppendError::DifficultyUnmet(self.difficulty));
        }
        self.blocks.push(candidate);
        Ok(())
    }

    /// Linear scan of every chain invariant. Hash recomputation is the
    /// expensive part and is stateless per block, so it runs in parallel.
    pub fn validate_all(&self) -> Result<(), ValidationError> {
        self.blocks
            .par_iter()
            .enumerate()
            .try_for_each(|(i, b)| {
                if b.index != i as u64 {
                    return Err(ValidationError::IndexOutOfSequence(i as u64));
                }
                if b.compute_hash() != b.hash {
                    return Err(ValidationError::HashMismatch(b.index));
                }
                if b.index > 0 && !meets_difficulty(&b.hash, self.difficulty) {
                    return Err(ValidationError::DifficultyUnmet(b.index));
                }
                Ok(())
            })?;

        for pair in self.blocks.windows(2) {
            if pair[1].previous_hash != pair[0].hash {
                return Err(ValidationError::BrokenLink(pair[1].index));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::WorkTemplate;

    // Brute-force a nonce for the template. Only sane at low difficulty.
    fn solve(tpl: &WorkTemplate) -> (i64, String) {
        for nonce in 0.. {
            let hash = tpl.hash_with_nonce(nonce);
            if meets_difficulty(&hash, tpl.difficulty) {
                return (nonce, hash);
            }
        }
        unreachable!()
    }

    fn template_for(chain: &Blockchain) -> WorkTemplate {
        WorkTemplate {
            block_index: chain.height(),
            timestamp: unix_now(),
            data: format!("Block {}", chain.height()),
            previous_hash: chain.tip().hash,
            difficulty: chain.difficulty(),
        }
    }

    fn mined_block(chain: &Blockchain, miner: &str) -> Block {
        let tpl = template_for(chain);
        let (nonce, hash) = solve(&tpl);
        tpl.into_block(nonce, hash, miner.to_string())
    }

    #[test]
    fn test_new_chain_has_genesis() {
        let chain = Blockchain::new(1, 50);
        assert_eq!(chain.height(), 1);
        assert_eq!(chain.tip().index, 0);
        assert!(chain.validate_all().is_ok());
    }

    #[test]
    fn test_append_and_validate() {
        let mut chain = Blockchain::new(1, 50);
        chain.append(mined_block(&chain, "a")).unwrap();
        chain.append(mined_block(&chain, "b")).unwrap();
        assert_eq!(chain.height(), 3);
        assert!(chain.validate_all().is_ok());
        assert_eq!(chain.get(2).unwrap().miner_id, "b");
        assert!(chain.get(3).is_none());
    }

    #[test]
    fn test_append_rejects_wrong_index() {
        let mut chain = Blockchain::new(1, 50);
        let mut block = mined_block(&chain, "a");
        block.index = 5;
        assert!(matches!(
            chain.append(block),
            Err(AppendError::IndexMismatch { candidate: 5, height: 1 })
        ));
        assert_eq!(chain.height(), 1);
    }

    #[test]
    fn test_append_rejects_wrong_prev_hash() {
        let mut chain = Blockchain::new(1, 50);
        let tpl = WorkTemplate {
            block_index: 1,
            timestamp: unix_now(),
            data: "Block 1".to_string(),
            previous_hash: "f".repeat(64),
            difficulty: 1,
        };
        let (nonce, hash) = solve(&tpl);
        let block = tpl.into_block(nonce, hash, "a".to_string());
        assert_eq!(chain.append(block), Err(AppendError::PrevHashMismatch));
    }

    #[test]
    fn test_append_rejects_tampered_hash() {
        let mut chain = Blockchain::new(1, 50);
        let mut block = mined_block(&chain, "a");
        block.nonce += 1; // hash no longer matches the payload
        assert_eq!(chain.append(block), Err(AppendError::HashMismatch));
    }

    #[test]
    fn test_append_rejects_unmet_difficulty() {
        let mut chain = Blockchain::new(4, 50);
        let tpl = template_for(&chain);
        // Find a nonce whose hash is canonical but fails difficulty 4.
        let mut nonce = 0;
        let hash = loop {
            let h = tpl.hash_with_nonce(nonce);
            if !meets_difficulty(&h, 4) {
                break h;
            }
            nonce += 1;
        };
        let block = tpl.into_block(nonce, hash, "a".to_string());
        assert_eq!(chain.append(block), Err(AppendError::DifficultyUnmet(4)));
    }

    #[test]
    fn test_validate_detects_tamper() {
        let mut chain = Blockchain::new(1, 50);
        chain.append(mined_block(&chain, "a")).unwrap();
        chain.blocks[1].data = "rewritten".to_string();
        assert_eq!(
            chain.validate_all(),
            Err(ValidationError::HashMismatch(1))
        );
    }
}
