//! The Ethereum-family HTLC leg (ETH, ERC-20). No EVM executes inside
//! this node: the artifact records what an `HTLC.sol`-style contract
//! call would carry, and claims/refunds are observed back via SPV
//! against the counterparty chain's logs (§4.3).

use serde::{Deserialize, Serialize};
use shared::Hash256;

/// The artifact needed to fund and later settle the Ethereum-family
/// leg of a swap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EthereumHtlcArtifact {
    pub secret_hash: Hash256,
    pub recipient: String,
    pub timelock: i64,
    pub amount: u64,
}

/// Builds the Ethereum-family HTLC artifact.
#[must_use]
pub fn build_artifact(secret_hash: &Hash256, recipient: &str, timelock: i64, amount: u64) -> EthereumHtlcArtifact {
    EthereumHtlcArtifact {
        secret_hash: *secret_hash,
        recipient: recipient.to_string(),
        timelock,
        amount,
    }
}

/// Whether a claim transaction's revealed secret matches the artifact.
#[must_use]
pub fn verify_claim_secret(artifact: &EthereumHtlcArtifact, secret: &[u8]) -> bool {
    Hash256::sha256(secret) == artifact.secret_hash
}

/// Whether a refund is permitted: only after `artifact.timelock` has
/// elapsed, matching `HTLC.sol`'s `require(block.timestamp >= timelock)`.
#[must_use]
pub fn refund_permitted(artifact: &EthereumHtlcArtifact, now: i64) -> bool {
    now >= artifact.timelock
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_claim_secret_matches_only_the_correct_preimage() {
        let secret_hash = Hash256::sha256(b"correct-secret");
        let artifact = build_artifact(&secret_hash, "0xabc", 1_700_000_000, 1_000);

        assert!(verify_claim_secret(&artifact, b"correct-secret"));
        assert!(!verify_claim_secret(&artifact, b"wrong-secret"));
    }

    #[test]
    fn refund_permitted_only_after_timelock() {
        let artifact = build_artifact(&Hash256::sha256(b"s"), "0xabc", 1_700_000_000, 1_000);

        assert!(!refund_permitted(&artifact, 1_699_999_999));
        assert!(refund_permitted(&artifact, 1_700_000_000));
    }
}
