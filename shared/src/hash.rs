use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sha3::Keccak256;
use std::fmt;

/// 256-bit hash used to identify blocks, transactions, swaps and headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash256([u8; 32]);

impl Hash256 {
    /// Creates a zeroed hash (used for the genesis `previous_hash`).
    #[must_use]
    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    /// Creates a hash from a 32-byte array.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of the hash.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Computes the single SHA-256 hash of `data`. This is the canonical
    /// hash used for txids, merkle leaves, sponsor preimages and
    /// checkpoint integrity digests.
    #[must_use]
    pub fn sha256(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        Self(hash)
    }

    /// Computes SHA256(SHA256(data)), used for block header hashing so the
    /// PoW target check is resistant to length-extension shortcuts.
    #[must_use]
    pub fn double_sha256(data: &[u8]) -> Self {
        Self::sha256(Self::sha256(data).as_bytes())
    }

    /// Computes Keccak-256. Kept for merkle-path byte compatibility checks
    /// against EVM-family chains where callers explicitly need it; block
    /// and transaction hashing use [`Hash256::sha256`] exclusively.
    #[must_use]
    pub fn keccak256(data: &[u8]) -> Self {
        use sha3::Digest as _;
        let mut hasher = Keccak256::new();
        hasher.update(data);
        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        Self(hash)
    }

    /// Checks whether the hash, read as a big-endian integer, is less than
    /// or equal to `2^256 / difficulty` by requiring at least `difficulty`
    /// leading zero bits. This mirrors the simplified target used
    /// throughout the consensus engine.
    #[must_use]
    pub fn meets_difficulty(&self, difficulty: u32) -> bool {
        self.leading_zeros() >= difficulty
    }

    /// Counts the number of leading zero bits.
    #[must_use]
    pub fn leading_zeros(&self) -> u32 {
        let mut zeros = 0;
        for &byte in &self.0 {
            if byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros();
                break;
            }
        }
        zeros
    }

    /// Returns a byte-reversed copy, used when converting between the
    /// node's big-endian display convention and the little-endian
    /// convention SPV merkle proofs borrow from Bitcoin.
    #[must_use]
    pub fn reversed(&self) -> Self {
        let mut bytes = self.0;
        bytes.reverse();
        Self(bytes)
    }

    /// Parses a hash from a hex string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid hex or not 32 bytes long.
    pub fn from_hex(hex_str: &str) -> crate::Result<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| crate::BlockchainError::SerializationError(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(crate::BlockchainError::InvalidKeySize {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes);
        Ok(Self(hash))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl TryFrom<&str> for Hash256 {
    type Error = crate::BlockchainError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::from_hex(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_hash_displays_as_64_zero_chars() {
        let hash = Hash256::zero();
        assert_eq!(hash.to_string(), "0".repeat(64));
    }

    #[test]
    fn sha256_is_deterministic_and_nonzero() {
        let data = b"xai node";
        let a = Hash256::sha256(data);
        let b = Hash256::sha256(data);
        assert_eq!(a, b);
        assert_ne!(a, Hash256::zero());
    }

    #[test]
    fn double_sha256_differs_from_single() {
        let data = b"header bytes";
        assert_ne!(Hash256::sha256(data), Hash256::double_sha256(data));
    }

    #[test]
    fn difficulty_check_respects_leading_zero_bits() {
        let easy_hash = Hash256::from_bytes([
            0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            0, 0, 0,
        ]);
        assert!(easy_hash.meets_difficulty(20));
        assert!(!easy_hash.meets_difficulty(40));
    }

    #[test]
    fn leading_zeros_counts_partial_bytes() {
        let hash = Hash256::from_bytes([
            0, 0, 0, 128, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            0, 0, 0, 0,
        ]);
        assert_eq!(hash.leading_zeros(), 24);
    }

    #[test]
    fn reversed_round_trips() {
        let hash = Hash256::sha256(b"roundtrip");
        assert_eq!(hash.reversed().reversed(), hash);
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        assert!(Hash256::from_hex("abcd").is_err());
    }
}
