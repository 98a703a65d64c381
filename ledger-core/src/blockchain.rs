//! The consensus engine: block validation, difficulty retargeting, fork
//! choice, the orphan pool and finality queries (§4.2).

use crate::block::Block;
use crate::ledger::Ledger;
use crate::mining::DifficultyAdjuster;
use crate::transaction::{Transaction, TxType};
use serde::{Deserialize, Serialize};
use shared::{BlockchainError, ConsensusConfig, Hash256, Result};
use std::collections::{BTreeMap, HashMap};

/// Outcome of presenting a freshly received block to the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Extended the active tip (or won a reorg and became the new tip).
    Accepted,
    /// Parent is unknown; parked until it arrives.
    Orphan,
    /// Failed validation and was not stored.
    Rejected,
}

/// `{depth, finalized}` answer to a finality query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalityStatus {
    pub depth: u64,
    pub finalized: bool,
}

struct StoredBlock {
    block: Block,
    cumulative_work: u128,
}

/// Applies a transaction's effect to the ledger according to its
/// `tx_type`. Sponsored transactions charge the fee to the sponsor
/// rather than the sender; HTLC legs move funds into/out of an implicit
/// escrow held at the sending address until the swap resolves.
///
/// # Errors
///
/// Returns an error if any credit/debit would overflow or underflow.
pub fn apply_transaction(ledger: &mut Ledger, tx: &Transaction) -> Result<()> {
    match tx.tx_type {
        TxType::Coinbase => {
            ledger.credit(&tx.recipient, tx.amount)?;
        }
        TxType::Faucet => {
            ledger.credit(&tx.recipient, tx.amount)?;
        }
        TxType::HtlcClaim => {
            ledger.credit(&tx.recipient, tx.amount)?;
            ledger.debit(&tx.sender, 0, tx.nonce)?;
        }
        TxType::HtlcRefund => {
            ledger.credit(&tx.recipient, tx.amount)?;
            ledger.debit(&tx.sender, 0, tx.nonce)?;
        }
        TxType::Normal | TxType::Treasure | TxType::TimeCapsule | TxType::HtlcFund => {
            let sender_charge = if tx.gas_sponsor.is_some() {
                tx.amount
            } else {
                tx.amount.checked_add(tx.fee).ok_or_else(|| {
                    BlockchainError::InvalidTransaction("amount + fee overflow".to_string())
                })?
            };
            ledger.debit(&tx.sender, sender_charge, tx.nonce)?;
            if let Some(sponsor) = &tx.gas_sponsor {
                ledger.debit(&sponsor.sponsor_address, tx.fee, ledger.account(&sponsor.sponsor_address).last_confirmed_nonce)?;
            }
            ledger.credit(&tx.recipient, tx.amount)?;
        }
    }
    Ok(())
}

/// The active chain: a DAG of received blocks with one active tip
/// chosen by cumulative proof-of-work, plus an orphan pool for blocks
/// whose parent has not yet arrived.
pub struct Chain {
    blocks_by_hash: HashMap<Hash256, StoredBlock>,
    height_index: BTreeMap<u64, Hash256>,
    tip_hash: Hash256,
    tip_height: u64,
    ledger: Ledger,
    orphans: HashMap<Hash256, Vec<Block>>,
    consensus: ConsensusConfig,
    address_hrp: String,
}

impl Chain {
    /// Creates a new chain seeded with `genesis`.
    ///
    /// # Errors
    ///
    /// Returns an error if the genesis block fails validation or
    /// application.
    pub fn new(genesis: Block, consensus: ConsensusConfig, address_hrp: String) -> Result<Self> {
        genesis.validate_basic(&address_hrp)?;
        let genesis_hash = genesis.hash()?;

        let mut ledger = Ledger::new();
        for tx in &genesis.transactions {
            apply_transaction(&mut ledger, tx)?;
        }
        ledger.height = 0;
        ledger.tip = genesis_hash;

        let mut blocks_by_hash = HashMap::new();
        blocks_by_hash.insert(
            genesis_hash,
            StoredBlock {
                block: genesis,
                cumulative_work: work_of(consensus.initial_difficulty),
            },
        );

        let mut height_index = BTreeMap::new();
        height_index.insert(0, genesis_hash);

        Ok(Self {
            blocks_by_hash,
            height_index,
            tip_hash: genesis_hash,
            tip_height: 0,
            ledger,
            orphans: HashMap::new(),
            consensus,
            address_hrp,
        })
    }

    /// The active tip's height.
    #[must_use]
    pub const fn height(&self) -> u64 {
        self.tip_height
    }

    /// The active tip's hash.
    #[must_use]
    pub const fn tip(&self) -> Hash256 {
        self.tip_hash
    }

    /// Read-only access to the ledger at the active tip.
    #[must_use]
    pub const fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Looks up a block on the active chain by height.
    #[must_use]
    pub fn block_at_height(&self, height: u64) -> Option<&Block> {
        self.height_index
            .get(&height)
            .and_then(|hash| self.blocks_by_hash.get(hash))
            .map(|stored| &stored.block)
    }

    /// Looks up any known block (active chain or side branch) by hash.
    #[must_use]
    pub fn block_by_hash(&self, hash: &Hash256) -> Option<&Block> {
        self.blocks_by_hash.get(hash).map(|stored| &stored.block)
    }

    /// The difficulty the block at `next_index` must have, per the
    /// retarget schedule.
    #[must_use]
    pub fn difficulty_for(&self, next_index: u64) -> u32 {
        let tip_difficulty = self
            .height_index
            .get(&self.tip_height)
            .and_then(|hash| self.blocks_by_hash.get(hash))
            .map_or(self.consensus.initial_difficulty, |stored| stored.block.header.difficulty);

        if next_index == 0 || next_index % self.consensus.retarget_interval != 0 {
            return tip_difficulty;
        }

        let Some(window_start_height) = next_index.checked_sub(self.consensus.retarget_interval) else {
            return tip_difficulty;
        };

        let (Some(start_block), Some(end_block)) = (
            self.block_at_height(window_start_height),
            self.block_at_height(next_index - 1),
        ) else {
            return tip_difficulty;
        };

        let adjuster = DifficultyAdjuster::new(
            self.consensus.target_block_time_secs,
            self.consensus.retarget_interval,
            self.consensus.max_retarget_factor,
        );

        adjuster
            .next_difficulty(tip_difficulty, start_block.header.timestamp, end_block.header.timestamp)
            .unwrap_or(tip_difficulty)
    }

    /// `{depth, finalized}` for the block at `index`, relative to the
    /// active tip.
    #[must_use]
    pub fn finality_of(&self, index: u64) -> FinalityStatus {
        let depth = self.tip_height.saturating_sub(index).saturating_add(1);
        FinalityStatus {
            depth,
            finalized: depth >= self.consensus.finality_depth,
        }
    }

    fn median_past_11_timestamp(&self) -> i64 {
        let mut timestamps: Vec<i64> = (0..=self.tip_height)
            .rev()
            .take(11)
            .filter_map(|h| self.block_at_height(h))
            .map(|b| b.header.timestamp)
            .collect();
        timestamps.sort_unstable();
        timestamps.get(timestamps.len() / 2).copied().unwrap_or(0)
    }

    /// Full validation of `block` against the current tip: structural
    /// checks (via [`Block::validate_basic`]), parent linkage, height,
    /// expected difficulty, timestamp bounds, size/tx-count caps, and
    /// per-transaction nonce/balance checks replayed against a scratch
    /// copy of the ledger.
    ///
    /// # Errors
    ///
    /// Returns the `BlockchainError` describing the first failed check.
    pub fn validate_block(&self, block: &Block, now: i64) -> Result<()> {
        if self.consensus.pow_enabled {
            block.validate_basic(&self.address_hrp)?;
        } else {
            if !block.transactions[0].is_coinbase() {
                return Err(BlockchainError::InvalidBlock("first transaction is not coinbase".to_string()));
            }
            let merkle = crate::block::calculate_merkle_root(&block.transactions)?;
            if merkle != block.header.merkle_root {
                return Err(BlockchainError::InvalidBlock("invalid merkle root".to_string()));
            }
        }

        if block.header.previous_hash != self.tip_hash {
            return Err(BlockchainError::HeaderMismatch);
        }
        if block.header.index != self.tip_height + 1 {
            return Err(BlockchainError::InvalidBlock("unexpected block height".to_string()));
        }

        let expected_difficulty = self.difficulty_for(block.header.index);
        if self.consensus.pow_enabled && block.header.difficulty != expected_difficulty {
            return Err(BlockchainError::InvalidBlock("difficulty does not match expected value".to_string()));
        }

        let median_past = self.median_past_11_timestamp();
        if block.header.timestamp < median_past {
            return Err(BlockchainError::InvalidBlock("timestamp at or before median of past blocks".to_string()));
        }
        if block.header.timestamp > now + self.consensus.max_clock_skew_secs {
            return Err(BlockchainError::InvalidBlock("timestamp too far in the future".to_string()));
        }

        if block.transactions.len() > self.consensus.max_block_tx_count {
            return Err(BlockchainError::InvalidBlock("too many transactions".to_string()));
        }
        if block.size() > self.consensus.max_block_size_bytes {
            return Err(BlockchainError::InvalidBlock("block exceeds maximum size".to_string()));
        }

        let total_fees = block.total_fees()?;
        let expected_coinbase = block_reward(block.header.index).checked_add(total_fees).ok_or_else(|| {
            BlockchainError::InvalidBlock("coinbase amount overflow".to_string())
        })?;
        if block.transactions[0].amount != expected_coinbase {
            return Err(BlockchainError::InvalidBlock("invalid coinbase reward".to_string()));
        }

        let mut scratch = self.ledger.clone();
        for tx in block.transactions.iter().skip(1) {
            self.validate_transaction_against(&scratch, tx)?;
            apply_transaction(&mut scratch, tx)?;
        }

        Ok(())
    }

    fn validate_transaction_against(&self, ledger: &Ledger, tx: &Transaction) -> Result<()> {
        tx.validate_structural(&self.address_hrp)?;

        if matches!(tx.tx_type, TxType::Faucet) {
            return Ok(());
        }

        let account = ledger.account(&tx.sender);
        if tx.nonce <= account.last_confirmed_nonce {
            return Err(BlockchainError::Replay);
        }
        if tx.nonce - account.last_confirmed_nonce > self.consensus.max_nonce_gap {
            return Err(BlockchainError::FutureNonce);
        }

        let charge = if tx.gas_sponsor.is_some() { tx.amount } else { tx.amount + tx.fee };
        if account.balance < charge {
            return Err(BlockchainError::InsufficientFunds);
        }

        Ok(())
    }

    /// Applies an already-validated block to the active chain,
    /// extending the tip.
    ///
    /// # Errors
    ///
    /// Returns an error if applying any transaction fails.
    fn apply_block_to_tip(&mut self, block: Block) -> Result<Hash256> {
        let block_hash = block.hash()?;
        let mut ledger = self.ledger.clone();
        for tx in &block.transactions {
            apply_transaction(&mut ledger, tx)?;
        }
        ledger.height = block.header.index;
        ledger.tip = block_hash;

        let cumulative_work = self
            .blocks_by_hash
            .get(&block.header.previous_hash)
            .map_or(0, |parent| parent.cumulative_work)
            + work_of(block.header.difficulty);

        self.height_index.insert(block.header.index, block_hash);
        self.tip_hash = block_hash;
        self.tip_height = block.header.index;
        self.ledger = ledger;
        self.blocks_by_hash.insert(block_hash, StoredBlock { block, cumulative_work });

        Ok(block_hash)
    }

    /// Public entry point: validates `block` and applies it if it
    /// extends the current tip, per `validate_block`/`apply_block` in
    /// the consensus engine's operation list.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn apply_block(&mut self, block: Block, now: i64) -> Result<Hash256> {
        self.validate_block(&block, now)?;
        self.apply_block_to_tip(block)
    }

    /// Presents a freshly received block to the chain: stores orphans
    /// whose parent is unknown, extends the tip when the block links
    /// directly to it, and triggers a reorg when a side branch's
    /// cumulative work exceeds the active tip's.
    pub fn on_receive_block(&mut self, block: Block, now: i64) -> ReceiveOutcome {
        let Ok(block_hash) = block.hash() else {
            return ReceiveOutcome::Rejected;
        };

        if self.blocks_by_hash.contains_key(&block_hash) {
            return ReceiveOutcome::Accepted;
        }

        if !self.blocks_by_hash.contains_key(&block.header.previous_hash) {
            self.orphans.entry(block.header.previous_hash).or_default().push(block);
            return ReceiveOutcome::Orphan;
        }

        if block.header.previous_hash == self.tip_hash {
            if self.validate_block(&block, now).is_err() {
                return ReceiveOutcome::Rejected;
            }
            if self.apply_block_to_tip(block).is_err() {
                return ReceiveOutcome::Rejected;
            }
            self.resolve_orphans(block_hash, now);
            return ReceiveOutcome::Accepted;
        }

        // Side branch: store it unconditionally (basic checks only),
        // then see whether its tip now outweighs the active tip.
        if block.validate_basic(&self.address_hrp).is_err() {
            return ReceiveOutcome::Rejected;
        }
        let cumulative_work = self
            .blocks_by_hash
            .get(&block.header.previous_hash)
            .map_or(0, |parent| parent.cumulative_work)
            + work_of(block.header.difficulty);
        self.blocks_by_hash.insert(block_hash, StoredBlock { block, cumulative_work });

        if self.maybe_reorg_to(block_hash).is_ok() {
            self.resolve_orphans(block_hash, now);
            ReceiveOutcome::Accepted
        } else {
            ReceiveOutcome::Accepted
        }
    }

    fn resolve_orphans(&mut self, parent_hash: Hash256, now: i64) {
        if let Some(pending) = self.orphans.remove(&parent_hash) {
            for orphan in pending {
                self.on_receive_block(orphan, now);
            }
        }
    }

    /// If the block at `candidate_hash` sits on a branch with strictly
    /// greater cumulative work than the active tip, rebuilds the ledger
    /// along that branch and switches to it atomically.
    fn maybe_reorg_to(&mut self, candidate_hash: Hash256) -> Result<()> {
        let candidate_work = self.blocks_by_hash.get(&candidate_hash).map_or(0, |s| s.cumulative_work);
        let tip_work = self.blocks_by_hash.get(&self.tip_hash).map_or(0, |s| s.cumulative_work);
        if candidate_work <= tip_work {
            return Ok(());
        }

        let mut path = Vec::new();
        let mut cursor = candidate_hash;
        loop {
            let Some(stored) = self.blocks_by_hash.get(&cursor) else {
                return Ok(());
            };
            path.push(cursor);
            if stored.block.header.index == 0 {
                break;
            }
            cursor = stored.block.header.previous_hash;
        }
        path.reverse();

        let mut ledger = Ledger::new();
        let mut height_index = BTreeMap::new();
        for hash in &path {
            let stored = self.blocks_by_hash.get(hash).expect("path entries exist in block store");
            for tx in &stored.block.transactions {
                apply_transaction(&mut ledger, tx)?;
            }
            ledger.height = stored.block.header.index;
            ledger.tip = *hash;
            height_index.insert(stored.block.header.index, *hash);
        }

        self.ledger = ledger;
        self.height_index = height_index;
        self.tip_hash = candidate_hash;
        self.tip_height = self
            .blocks_by_hash
            .get(&candidate_hash)
            .map_or(0, |s| s.block.header.index);

        Ok(())
    }
}

/// The block subsidy at `height`. Flat for now; halving schedules are
/// an open extension point, not required by the spec this chain
/// implements.
#[must_use]
pub const fn block_reward(_height: u64) -> u64 {
    5_000
}

fn work_of(difficulty: u32) -> u128 {
    1u128 << difficulty.min(127)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mining::{Miner, MinerConfig};

    fn genesis_chain(difficulty: u32) -> Chain {
        let mut consensus = ConsensusConfig::default();
        consensus.initial_difficulty = difficulty;
        consensus.retarget_interval = 5;
        let genesis = Block::genesis(5_000, "genesis-miner".to_string(), 1_700_000_000, difficulty).unwrap();
        Chain::new(genesis, consensus, "xai".to_string()).unwrap()
    }

    #[test]
    fn chain_starts_at_height_zero_with_genesis_reward_credited() {
        let chain = genesis_chain(1);
        assert_eq!(chain.height(), 0);
        assert_eq!(chain.ledger().balance("genesis-miner"), 5_000);
    }

    #[test]
    fn mined_block_extends_the_tip() {
        let chain = genesis_chain(1);
        let miner = Miner::new(MinerConfig {
            miner_address: "miner-2".to_string(),
            threads: 1,
        });

        let coinbase = Transaction::coinbase(chain.height() + 1, block_reward(1), "miner-2".to_string(), 1_700_000_600);
        let result = miner
            .mine_block(chain.tip(), vec![coinbase], chain.height() + 1, chain.difficulty_for(1), 1_700_000_600)
            .unwrap();

        let mut chain = chain;
        let new_hash = chain.apply_block(result.block, 1_700_001_000).unwrap();

        assert_eq!(chain.height(), 1);
        assert_eq!(chain.tip(), new_hash);
        assert_eq!(chain.ledger().balance("miner-2"), 5_000);
    }

    #[test]
    fn on_receive_block_parks_orphan_with_unknown_parent() {
        let mut chain = genesis_chain(1);
        let dangling_parent = Hash256::sha256(b"not-in-chain");
        let orphan_block = Block::genesis(5_000, "someone".to_string(), 1_700_000_500, 1).unwrap();
        let mut orphan_block = orphan_block;
        orphan_block.header.previous_hash = dangling_parent;
        orphan_block.header.index = 99;

        let outcome = chain.on_receive_block(orphan_block, 1_700_001_000);
        assert_eq!(outcome, ReceiveOutcome::Orphan);
    }

    #[test]
    fn finality_status_reports_unfinalized_then_finalized() {
        let mut chain = genesis_chain(1);
        let miner = Miner::new(MinerConfig {
            miner_address: "miner-3".to_string(),
            threads: 1,
        });

        for i in 0..3 {
            let height = chain.height() + 1;
            let coinbase = Transaction::coinbase(height, block_reward(1), "miner-3".to_string(), 1_700_000_600 + i);
            let result = miner
                .mine_block(chain.tip(), vec![coinbase], height, chain.difficulty_for(height), 1_700_000_600 + i)
                .unwrap();
            chain.apply_block(result.block, 1_700_001_000 + i).unwrap();
        }

        let status = chain.finality_of(0);
        assert!(!status.finalized);
    }
}
