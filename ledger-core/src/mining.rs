//! Candidate block assembly and the proof-of-work search (§2 Miner, §4.2).

use crate::block::{calculate_merkle_root, Block, BlockHeader};
use crate::transaction::Transaction;
use shared::{BlockchainError, Hash256, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Configuration for a [`Miner`] instance.
#[derive(Debug, Clone)]
pub struct MinerConfig {
    /// Address credited with the block reward and fees.
    pub miner_address: String,
    /// Number of worker threads searching the nonce space.
    pub threads: usize,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            miner_address: String::new(),
            threads: std::thread::available_parallelism()
                .map(std::num::NonZero::get)
                .unwrap_or(1),
        }
    }
}

/// The outcome of a successful proof-of-work search.
#[derive(Debug, Clone)]
pub struct MiningResult {
    pub block: Block,
    pub hash: Hash256,
    pub nonce: u64,
    pub attempts: u64,
}

/// Assembles candidate blocks and searches the nonce space for a hash
/// meeting the target difficulty, splitting the search across threads.
pub struct Miner {
    config: MinerConfig,
    is_mining: Arc<AtomicBool>,
}

impl Miner {
    /// Creates a new miner.
    #[must_use]
    pub fn new(config: MinerConfig) -> Self {
        Self {
            config,
            is_mining: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Searches for a nonce meeting `difficulty` over `transactions`, a
    /// caller-assembled body with the coinbase already at index 0 (the
    /// caller, not the miner, knows the block's fee total and credits
    /// it to the coinbase — see [`crate::block_reward`]).
    ///
    /// # Errors
    ///
    /// Returns an error if merkle root computation fails or if the
    /// nonce space is exhausted without a solution (practically
    /// unreachable at realistic difficulties).
    pub fn mine_block(
        &self,
        previous_hash: Hash256,
        transactions: Vec<Transaction>,
        block_height: u64,
        difficulty: u32,
        timestamp: i64,
    ) -> Result<MiningResult> {
        let merkle_root = calculate_merkle_root(&transactions)?;
        let header = BlockHeader::new(block_height, previous_hash, merkle_root, timestamp, difficulty, 0);

        self.mine_header_parallel(&header, &transactions)
    }

    fn mine_header_parallel(&self, header: &BlockHeader, transactions: &[Transaction]) -> Result<MiningResult> {
        let is_mining = Arc::clone(&self.is_mining);
        is_mining.store(true, Ordering::SeqCst);

        let result: Arc<Mutex<Option<MiningResult>>> = Arc::new(Mutex::new(None));
        let mut handles = Vec::with_capacity(self.config.threads);

        let threads = self.config.threads.max(1) as u64;
        let nonce_per_thread = u64::MAX / threads;

        for thread_id in 0..threads {
            let header_clone = header.clone();
            let transactions_clone = transactions.to_owned();
            let is_mining_clone = Arc::clone(&is_mining);
            let result_clone = Arc::clone(&result);

            let start_nonce = thread_id * nonce_per_thread;
            let end_nonce = if thread_id + 1 == threads {
                u64::MAX
            } else {
                (thread_id + 1) * nonce_per_thread
            };

            handles.push(thread::spawn(move || {
                Self::mine_header_range(
                    header_clone,
                    &transactions_clone,
                    start_nonce,
                    end_nonce,
                    &is_mining_clone,
                    &result_clone,
                );
            }));
        }

        for handle in handles {
            let _ = handle.join();
        }

        result
            .lock()
            .expect("mining result mutex poisoned")
            .take()
            .ok_or(BlockchainError::MiningExhausted)
    }

    fn mine_header_range(
        mut header: BlockHeader,
        transactions: &[Transaction],
        start_nonce: u64,
        end_nonce: u64,
        is_mining: &Arc<AtomicBool>,
        result: &Arc<Mutex<Option<MiningResult>>>,
    ) {
        let mut attempts = 0u64;

        for nonce in start_nonce..end_nonce {
            if !is_mining.load(Ordering::SeqCst) {
                break;
            }

            header.nonce = nonce;
            attempts += 1;

            if let Ok(hash) = header.hash() {
                if hash.meets_difficulty(header.difficulty) {
                    is_mining.store(false, Ordering::SeqCst);

                    let block = Block::new(header, transactions.to_owned());
                    let mut guard = result.lock().expect("mining result mutex poisoned");
                    if guard.is_none() {
                        *guard = Some(MiningResult {
                            block,
                            hash,
                            nonce,
                            attempts,
                        });
                    }
                    break;
                }
            }

            if attempts % 100_000 == 0 && result.lock().expect("mining result mutex poisoned").is_some() {
                break;
            }
        }
    }

    /// Signals every worker thread to stop searching.
    pub fn stop_mining(&self) {
        self.is_mining.store(false, Ordering::SeqCst);
    }

    /// Whether a search is currently in progress.
    #[must_use]
    pub fn is_mining(&self) -> bool {
        self.is_mining.load(Ordering::SeqCst)
    }
}

/// Computes the next difficulty from a window of prior block headers
/// per §4.2's retargeting rule:
/// `new = old × clamp(actual_time / target_time, 1/MAX_FACTOR, MAX_FACTOR)`.
pub struct DifficultyAdjuster {
    pub target_block_time_secs: u64,
    pub retarget_interval: u64,
    pub max_retarget_factor: f64,
}

impl DifficultyAdjuster {
    /// Creates a new adjuster.
    #[must_use]
    pub const fn new(target_block_time_secs: u64, retarget_interval: u64, max_retarget_factor: f64) -> Self {
        Self {
            target_block_time_secs,
            retarget_interval,
            max_retarget_factor,
        }
    }

    /// Given the timestamps of the first and last block in the most
    /// recently completed retarget window, returns the new difficulty.
    /// Returns `current_difficulty` unchanged if not at a retarget
    /// boundary (callers check `height % retarget_interval == 0`).
    ///
    /// # Errors
    ///
    /// Returns an error if the window's timestamps are inverted.
    #[allow(clippy::cast_precision_loss)]
    pub fn next_difficulty(&self, current_difficulty: u32, window_start_timestamp: i64, window_end_timestamp: i64) -> Result<u32> {
        let actual_time = window_end_timestamp.saturating_sub(window_start_timestamp).max(1) as f64;
        let expected_time = (self.target_block_time_secs * self.retarget_interval.saturating_sub(1).max(1)) as f64;

        let factor = (actual_time / expected_time).clamp(1.0 / self.max_retarget_factor, self.max_retarget_factor);

        let new_difficulty = (f64::from(current_difficulty) / factor).round();
        Ok(new_difficulty.clamp(1.0, f64::from(u32::MAX)) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miner_mines_a_block_at_low_difficulty() {
        let config = MinerConfig {
            miner_address: "miner-1".to_string(),
            threads: 1,
        };
        let miner = Miner::new(config);
        let coinbase = Transaction::coinbase(1, 5_000, "miner-1".to_string(), 1_700_000_000);

        let result = miner
            .mine_block(Hash256::zero(), vec![coinbase], 1, 1, 1_700_000_000)
            .unwrap();

        assert!(result.block.validate_basic("xai").is_ok());
        assert_eq!(result.block.transactions.len(), 1);
        assert!(result.hash.meets_difficulty(1));
    }

    #[test]
    fn difficulty_increases_when_blocks_arrive_faster_than_target() {
        let adjuster = DifficultyAdjuster::new(600, 10, 4.0);
        let new_difficulty = adjuster.next_difficulty(20, 0, 300 * 9).unwrap();
        assert!(new_difficulty > 20);
    }

    #[test]
    fn difficulty_decreases_when_blocks_arrive_slower_than_target() {
        let adjuster = DifficultyAdjuster::new(600, 10, 4.0);
        let new_difficulty = adjuster.next_difficulty(20, 0, 1200 * 9).unwrap();
        assert!(new_difficulty < 20);
    }

    #[test]
    fn retarget_factor_is_clamped() {
        let adjuster = DifficultyAdjuster::new(600, 10, 4.0);
        let new_difficulty = adjuster.next_difficulty(20, 0, 100_000 * 9).unwrap();
        assert!(new_difficulty >= 5);
    }
}
