//! Block header, body and merkle root computation (§3 Block, §4.2).

use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use shared::{BlockchainError, Hash256, Result};

/// The block header: everything the proof-of-work hash covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub index: u64,
    pub previous_hash: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: i64,
    pub difficulty: u32,
    pub nonce: u64,
}

impl BlockHeader {
    /// Creates a new header.
    #[must_use]
    pub const fn new(
        index: u64,
        previous_hash: Hash256,
        merkle_root: Hash256,
        timestamp: i64,
        difficulty: u32,
        nonce: u64,
    ) -> Self {
        Self {
            index,
            previous_hash,
            merkle_root,
            timestamp,
            difficulty,
            nonce,
        }
    }

    /// `SHA256(SHA256(header_canonical))`, the hash the proof-of-work
    /// target is checked against.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be canonically encoded.
    pub fn hash(&self) -> Result<Hash256> {
        let bytes = shared::canonical::encode(self)?;
        Ok(Hash256::double_sha256(&bytes))
    }

    /// Whether this header's hash meets its own `difficulty` target.
    ///
    /// # Errors
    ///
    /// Returns an error if hashing fails.
    pub fn meets_difficulty(&self) -> Result<bool> {
        Ok(self.hash()?.meets_difficulty(self.difficulty))
    }
}

/// A full block: header plus an ordered transaction list with the
/// coinbase at index 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Creates a new block.
    #[must_use]
    pub const fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    /// Mines the genesis block at difficulty `genesis_difficulty`,
    /// paying `genesis_reward` to `genesis_address`.
    ///
    /// # Errors
    ///
    /// Returns an error if hashing or merkle root computation fails, or
    /// if [`crate::mining`]'s bounded search exhausts the nonce space
    /// (practically unreachable at a genesis-level difficulty).
    pub fn genesis(genesis_reward: u64, genesis_address: String, timestamp: i64, genesis_difficulty: u32) -> Result<Self> {
        let coinbase = Transaction::coinbase(0, genesis_reward, genesis_address, timestamp);
        let merkle_root = calculate_merkle_root(std::slice::from_ref(&coinbase))?;

        let mut header = BlockHeader::new(0, Hash256::zero(), merkle_root, timestamp, genesis_difficulty, 0);

        loop {
            if header.meets_difficulty()? {
                break;
            }
            header.nonce = header.nonce.checked_add(1).ok_or(BlockchainError::MiningExhausted)?;
        }

        Ok(Self::new(header, vec![coinbase]))
    }

    /// The block's hash (delegates to [`BlockHeader::hash`]).
    ///
    /// # Errors
    ///
    /// Returns an error if hashing fails.
    pub fn hash(&self) -> Result<Hash256> {
        self.header.hash()
    }

    /// The block's height, taken directly from the header (the teacher's
    /// predecessor encoded height into the coinbase script; the
    /// account-model header carries it explicitly as `index`).
    #[must_use]
    pub const fn height(&self) -> u64 {
        self.header.index
    }

    /// Structural validation: coinbase placement, merkle root, fee
    /// accounting and per-transaction structural checks. Does not check
    /// proof-of-work or difficulty retargeting; see
    /// [`crate::consensus::validate_block`] for the full pipeline.
    ///
    /// # Errors
    ///
    /// Returns the `BlockchainError` describing the first failed check.
    pub fn validate_basic(&self, address_hrp: &str) -> Result<()> {
        if self.transactions.is_empty() {
            return Err(BlockchainError::InvalidBlock("block has no transactions".to_string()));
        }

        if !self.transactions[0].is_coinbase() {
            return Err(BlockchainError::InvalidBlock(
                "first transaction is not coinbase".to_string(),
            ));
        }

        for (i, tx) in self.transactions.iter().enumerate() {
            if i == 0 {
                continue;
            }
            if tx.is_coinbase() {
                return Err(BlockchainError::InvalidBlock(
                    "multiple coinbase transactions".to_string(),
                ));
            }
            tx.validate_structural(address_hrp)?;
        }

        let calculated_merkle = calculate_merkle_root(&self.transactions)?;
        if calculated_merkle != self.header.merkle_root {
            return Err(BlockchainError::InvalidBlock("invalid merkle root".to_string()));
        }

        if !self.header.meets_difficulty()? {
            return Err(BlockchainError::BelowPoWTarget);
        }

        Ok(())
    }

    /// Sum of the fees paid by every non-coinbase transaction.
    ///
    /// # Errors
    ///
    /// Returns an error on fee overflow.
    pub fn total_fees(&self) -> Result<u64> {
        let mut total = 0u64;
        for tx in self.transactions.iter().skip(1) {
            total = total
                .checked_add(tx.fee)
                .ok_or_else(|| BlockchainError::InvalidBlock("fee overflow".to_string()))?;
        }
        Ok(total)
    }

    /// Estimated serialized size in bytes, used against
    /// `ConsensusConfig::max_block_size_bytes`.
    #[must_use]
    pub fn size(&self) -> usize {
        const HEADER_SIZE: usize = 128;
        let transactions_size: usize = self.transactions.iter().map(Transaction::estimated_size).sum();
        HEADER_SIZE + transactions_size
    }
}

/// Computes the merkle root over transaction ids, pairing odd-length
/// levels with a self-duplicate, matching Bitcoin-family convention.
///
/// # Errors
///
/// Returns an error if computing any transaction's id fails.
pub fn calculate_merkle_root(transactions: &[Transaction]) -> Result<Hash256> {
    if transactions.is_empty() {
        return Ok(Hash256::zero());
    }

    let mut hashes: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect::<Result<Vec<_>>>()?;

    if hashes.len() == 1 {
        return Ok(hashes[0]);
    }

    while hashes.len() > 1 {
        let mut next_level = Vec::with_capacity(hashes.len().div_ceil(2));

        for chunk in hashes.chunks(2) {
            let mut data = Vec::with_capacity(64);
            data.extend_from_slice(chunk[0].as_bytes());
            if chunk.len() == 2 {
                data.extend_from_slice(chunk[1].as_bytes());
            } else {
                data.extend_from_slice(chunk[0].as_bytes());
            }
            next_level.push(Hash256::sha256(&data));
        }

        hashes = next_level;
    }

    Ok(hashes[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_block_is_valid_and_mines_at_height_zero() {
        let genesis = Block::genesis(5_000, "genesis-address".to_string(), 1_700_000_000, 4).unwrap();

        assert_eq!(genesis.transactions.len(), 1);
        assert!(genesis.transactions[0].is_coinbase());
        assert_eq!(genesis.height(), 0);
        genesis.validate_basic("xai").unwrap();
    }

    #[test]
    fn block_hash_is_deterministic() {
        let genesis = Block::genesis(5_000, "genesis-address".to_string(), 1_700_000_000, 4).unwrap();
        assert_eq!(genesis.hash().unwrap(), genesis.hash().unwrap());
    }

    #[test]
    fn merkle_root_differs_for_different_transaction_sets() {
        let tx1 = Transaction::coinbase(0, 5_000, "addr-a".to_string(), 1_700_000_000);
        let tx2 = Transaction::coinbase(1, 5_000, "addr-b".to_string(), 1_700_000_000);

        let single_root = calculate_merkle_root(std::slice::from_ref(&tx1)).unwrap();
        let double_root = calculate_merkle_root(&[tx1, tx2]).unwrap();

        assert_ne!(single_root, double_root);
        assert_ne!(single_root, Hash256::zero());
    }

    #[test]
    fn block_size_is_positive_and_bounded_for_genesis() {
        let genesis = Block::genesis(5_000, "genesis-address".to_string(), 1_700_000_000, 4).unwrap();
        assert!(genesis.size() > 0);
        assert!(genesis.size() < 1_000);
    }
}
