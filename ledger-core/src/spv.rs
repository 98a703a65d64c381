//! Simplified Payment Verification for counterparty chains (§4.4): a
//! header store plus merkle-proof reconstruction, used by the HTLC
//! engine to confirm a counterparty funding or claim transaction
//! without running a full node for every supported coin.

use crate::htlc::CoinType;
use serde::{Deserialize, Serialize};
use shared::{BlockchainError, Hash256, Result};
use std::collections::HashMap;

/// How long a [`SpvVerifier::verify_tx_on_chain`] result is cached
/// before the provider is consulted again.
pub const CACHE_TTL_SECS: i64 = 60;

/// A parsed 80-byte Bitcoin-convention block header: `version(4)
/// prev(32) merkle(32) time(4) bits(4) nonce(4)`, all little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignHeader {
    pub version: u32,
    pub previous_hash: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl ForeignHeader {
    /// Parses an 80-byte raw header blob.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::Malformed`] if `raw` is not exactly 80 bytes.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() != 80 {
            return Err(BlockchainError::Malformed(format!(
                "foreign header must be 80 bytes, got {}",
                raw.len()
            )));
        }
        let version = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        let mut prev = [0u8; 32];
        prev.copy_from_slice(&raw[4..36]);
        let mut merkle = [0u8; 32];
        merkle.copy_from_slice(&raw[36..68]);
        let timestamp = u32::from_le_bytes(raw[68..72].try_into().unwrap());
        let bits = u32::from_le_bytes(raw[72..76].try_into().unwrap());
        let nonce = u32::from_le_bytes(raw[76..80].try_into().unwrap());

        Ok(Self {
            version,
            previous_hash: Hash256::from_bytes(prev),
            merkle_root: Hash256::from_bytes(merkle),
            timestamp,
            bits,
            nonce,
        })
    }

    /// The header's double-SHA256 hash, reversed to the conventional
    /// big-endian display order.
    #[must_use]
    pub fn hash(&self, raw: &[u8]) -> Hash256 {
        Hash256::double_sha256(raw).reversed()
    }
}

/// A merkle inclusion proof for `txid` within a block, Bitcoin
/// convention: siblings ordered from the leaf level upward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleProof {
    pub txid: Hash256,
    pub siblings: Vec<Hash256>,
    pub tx_index: u32,
}

/// Reconstructs the merkle root from `proof` and checks it against
/// `header.merkle_root`. At each level: `position & 1 == 1` means
/// `current` is the right child (`concat = sibling || current`),
/// otherwise `current` is the left child (`concat = current ||
/// sibling`); `current = SHA256(SHA256(concat))`; `position >>= 1`.
/// Byte-reversal matches Bitcoin's little-endian txid/hash display
/// convention ([`Hash256::reversed`]).
///
/// # Errors
///
/// Returns [`BlockchainError::SpvInvalidProof`] if the reconstructed
/// root does not match.
pub fn verify_merkle_proof(proof: &MerkleProof, header: &ForeignHeader) -> Result<()> {
    let mut current = proof.txid.reversed();
    let mut position = proof.tx_index;

    for sibling in &proof.siblings {
        let sibling = sibling.reversed();
        let mut concat = Vec::with_capacity(64);
        if position & 1 == 1 {
            concat.extend_from_slice(sibling.as_bytes());
            concat.extend_from_slice(current.as_bytes());
        } else {
            concat.extend_from_slice(current.as_bytes());
            concat.extend_from_slice(sibling.as_bytes());
        }
        current = Hash256::double_sha256(&concat);
        position >>= 1;
    }

    if current.reversed() == header.merkle_root {
        Ok(())
    } else {
        Err(BlockchainError::SpvInvalidProof)
    }
}

/// A counterparty-chain output, normalized to base units.
#[derive(Debug, Clone)]
pub struct ProviderOutput {
    pub address: String,
    pub amount: u64,
}

/// A counterparty-chain transaction as reported by a provider.
#[derive(Debug, Clone)]
pub struct ProviderTransaction {
    pub outputs: Vec<ProviderOutput>,
    pub block_height: u64,
    pub provider_confirmations: Option<u64>,
    pub proof: Option<MerkleProof>,
    pub header_raw: Option<Vec<u8>>,
}

/// The network-level abstraction over "ask a counterparty chain about
/// a transaction". Production nodes back this with a light client or
/// block explorer API; tests back it with a fixed fixture.
pub trait ChainDataProvider {
    /// Fetches `txid` on `coin`.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::ProviderUnavailable`] if the
    /// transaction cannot be retrieved.
    fn fetch_transaction(&self, coin: CoinType, txid: &str) -> Result<ProviderTransaction>;
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    valid: bool,
    cached_at: i64,
}

/// Tracks accepted counterparty-chain headers per coin, enforcing
/// monotone height progression unless a deeper branch with greater
/// cumulative work is presented.
#[derive(Debug, Default)]
pub struct HeaderStore {
    headers: HashMap<CoinType, HashMap<u64, (ForeignHeader, u128)>>,
    tips: HashMap<CoinType, u64>,
}

impl HeaderStore {
    /// Creates an empty header store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn work_of(bits: u32) -> u128 {
        1u128 << (bits.min(127))
    }

    /// Ingests headers for `coin` at the given heights. Accepts a
    /// header only if its height extends the known tip, or if it sits
    /// on a branch whose cumulative work (recomputed from the new
    /// header backward) exceeds the current tip's — a header the
    /// store has already accepted at a lower-work height is otherwise
    /// rejected to keep height monotone.
    ///
    /// Returns the accepted heights and the rejected ones.
    pub fn ingest_headers(&mut self, coin: CoinType, headers: &[(u64, ForeignHeader)]) -> (Vec<u64>, Vec<u64>) {
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        let chain = self.headers.entry(coin).or_default();

        for &(height, header) in headers {
            let work = Self::work_of(header.bits);
            let cumulative = chain.get(&height.saturating_sub(1)).map_or(work, |(_, w)| w + work);

            let current_tip_height = *self.tips.get(&coin).unwrap_or(&0);
            let accept = height > current_tip_height
                || chain.get(&height).map_or(true, |(_, existing_work)| cumulative > *existing_work);

            if accept {
                chain.insert(height, (header, cumulative));
                if height >= current_tip_height {
                    self.tips.insert(coin, height);
                }
                accepted.push(height);
            } else {
                rejected.push(height);
            }
        }

        (accepted, rejected)
    }

    /// The highest ingested height for `coin`.
    #[must_use]
    pub fn tip_height(&self, coin: CoinType) -> u64 {
        *self.tips.get(&coin).unwrap_or(&0)
    }

    /// Confirmations for a transaction at `block_height`, derived from
    /// the ingested header tip: `tip.height - block_height + 1`.
    #[must_use]
    pub fn confirmations_for(&self, coin: CoinType, block_height: u64) -> u64 {
        let tip = self.tip_height(coin);
        if tip < block_height {
            0
        } else {
            tip - block_height + 1
        }
    }

    fn header_at(&self, coin: CoinType, height: u64) -> Option<ForeignHeader> {
        self.headers.get(&coin)?.get(&height).map(|(header, _)| *header)
    }
}

/// Verifies counterparty-chain transactions against a provider and an
/// ingested header store, with a short-lived result cache.
pub struct SpvVerifier<P: ChainDataProvider> {
    provider: P,
    headers: HeaderStore,
    cache: HashMap<(CoinType, String, u64), CacheEntry>,
}

impl<P: ChainDataProvider> SpvVerifier<P> {
    /// Creates a verifier backed by `provider`.
    #[must_use]
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            headers: HeaderStore::new(),
            cache: HashMap::new(),
        }
    }

    /// Ingests counterparty headers (`ingest_headers` in §4.4).
    pub fn ingest_headers(&mut self, coin: CoinType, headers: &[(u64, ForeignHeader)]) -> (Vec<u64>, Vec<u64>) {
        self.headers.ingest_headers(coin, headers)
    }

    /// Verifies that `txid` pays at least `expected_amount` (within
    /// `tolerance`) to `recipient` with at least `min_confirmations`.
    /// Caches the verdict for [`CACHE_TTL_SECS`].
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot supply the transaction.
    #[allow(clippy::too_many_arguments)]
    pub fn verify_tx_on_chain(
        &mut self,
        coin: CoinType,
        txid: &str,
        expected_amount: u64,
        recipient: &str,
        min_confirmations: u64,
        tolerance: u64,
        now: i64,
    ) -> Result<(bool, String)> {
        let cache_key = (coin, txid.to_string(), min_confirmations);
        if let Some(entry) = self.cache.get(&cache_key) {
            if now - entry.cached_at < CACHE_TTL_SECS {
                let message = if entry.valid { "cached: verified" } else { "cached: not verified" };
                return Ok((entry.valid, message.to_string()));
            }
        }

        let tx = self.provider.fetch_transaction(coin, txid)?;

        let recipient_normalized = normalize_address(coin, recipient);
        let amount_received: u64 = tx
            .outputs
            .iter()
            .filter(|output| normalize_address(coin, &output.address) == recipient_normalized)
            .map(|output| output.amount)
            .sum();

        let header_confirmations = self.headers.confirmations_for(coin, tx.block_height);
        let confirmations = tx
            .provider_confirmations
            .map_or(header_confirmations, |provider_value| provider_value.max(header_confirmations));

        let valid = confirmations >= min_confirmations && amount_received + tolerance >= expected_amount;
        let message = if valid {
            format!("verified: {amount_received} received, {confirmations} confirmations")
        } else {
            format!("not verified: {amount_received} received, {confirmations} confirmations")
        };

        self.cache.insert(cache_key, CacheEntry { valid, cached_at: now });
        Ok((valid, message))
    }

    /// Verifies the merkle inclusion proof for `txid`, fetching the
    /// transaction (for its proof and header) from the provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot supply the transaction
    /// or proof, or [`BlockchainError::SpvInvalidProof`] if the proof
    /// does not reconstruct the header's merkle root.
    pub fn verify_spv(&mut self, coin: CoinType, txid: &str) -> Result<(bool, MerkleProof)> {
        let tx = self.provider.fetch_transaction(coin, txid)?;
        let proof = tx
            .proof
            .ok_or_else(|| BlockchainError::Malformed("provider returned no merkle proof".to_string()))?;

        let header = if let Some(raw) = &tx.header_raw {
            ForeignHeader::parse(raw)?
        } else {
            self.headers
                .header_at(coin, tx.block_height)
                .ok_or_else(|| BlockchainError::Malformed("no header ingested for block height".to_string()))?
        };

        verify_merkle_proof(&proof, &header)?;
        Ok((true, proof))
    }
}

fn normalize_address(coin: CoinType, address: &str) -> String {
    match coin.protocol() {
        crate::htlc::Protocol::EthereumHtlc => address.to_lowercase(),
        _ => address.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixtureProvider {
        tx: ProviderTransaction,
    }

    impl ChainDataProvider for FixtureProvider {
        fn fetch_transaction(&self, _coin: CoinType, _txid: &str) -> Result<ProviderTransaction> {
            Ok(self.tx.clone())
        }
    }

    #[test]
    fn merkle_proof_matches_bitcoin_convention_example() {
        let txid = Hash256::from_hex(&"ab".repeat(32)).unwrap();
        let sibling = Hash256::from_hex(&"cd".repeat(32)).unwrap();

        let reversed_txid = txid.reversed();
        let reversed_sibling = sibling.reversed();
        let mut concat = Vec::with_capacity(64);
        concat.extend_from_slice(reversed_txid.as_bytes());
        concat.extend_from_slice(reversed_sibling.as_bytes());
        let root = Hash256::double_sha256(&concat).reversed();

        let proof = MerkleProof {
            txid,
            siblings: vec![sibling],
            tx_index: 0,
        };
        let header = ForeignHeader {
            version: 1,
            previous_hash: Hash256::zero(),
            merkle_root: root,
            timestamp: 0,
            bits: 0,
            nonce: 0,
        };

        verify_merkle_proof(&proof, &header).unwrap();
    }

    #[test]
    fn header_store_tracks_monotone_tip_height() {
        let mut store = HeaderStore::new();
        let header = ForeignHeader {
            version: 1,
            previous_hash: Hash256::zero(),
            merkle_root: Hash256::zero(),
            timestamp: 0,
            bits: 1,
            nonce: 0,
        };

        let (accepted, rejected) = store.ingest_headers(CoinType::Btc, &[(1, header), (2, header)]);
        assert_eq!(accepted, vec![1, 2]);
        assert!(rejected.is_empty());
        assert_eq!(store.tip_height(CoinType::Btc), 2);
    }

    #[test]
    fn verify_tx_on_chain_accepts_sufficient_payment_and_confirmations() {
        let tx = ProviderTransaction {
            outputs: vec![ProviderOutput {
                address: "recipient-addr".to_string(),
                amount: 1_000,
            }],
            block_height: 100,
            provider_confirmations: Some(10),
            proof: None,
            header_raw: None,
        };
        let mut verifier = SpvVerifier::new(FixtureProvider { tx });

        let (valid, _) = verifier
            .verify_tx_on_chain(CoinType::Btc, "txid", 1_000, "recipient-addr", 6, 0, 1_700_000_000)
            .unwrap();
        assert!(valid);
    }

    #[test]
    fn verify_tx_on_chain_rejects_insufficient_confirmations() {
        let tx = ProviderTransaction {
            outputs: vec![ProviderOutput {
                address: "recipient-addr".to_string(),
                amount: 1_000,
            }],
            block_height: 100,
            provider_confirmations: Some(1),
            proof: None,
            header_raw: None,
        };
        let mut verifier = SpvVerifier::new(FixtureProvider { tx });

        let (valid, _) = verifier
            .verify_tx_on_chain(CoinType::Btc, "txid", 1_000, "recipient-addr", 6, 0, 1_700_000_000)
            .unwrap();
        assert!(!valid);
    }
}
