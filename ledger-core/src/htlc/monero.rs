//! Monero's HTLC leg is an explicit non-goal: Monero's ring signatures
//! and stealth addresses make hash-locked contracts impossible to
//! express the way the UTXO and Ethereum families do, so the only
//! supported scheme would be adaptor-signature-based Bulletproofs
//! swaps, which this node does not implement. `build_artifact` exists
//! only so [`crate::htlc::SwapContract`] can represent (and reject)
//! Monero swap attempts uniformly with the supported coins.

use serde::{Deserialize, Serialize};

/// A placeholder artifact. `deployment_ready` is always `false`: no
/// caller should attempt to fund or claim a Monero-leg swap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoneroHtlcArtifact {
    pub deployment_ready: bool,
}

/// Builds the (non-functional) Monero artifact.
#[must_use]
pub fn build_artifact() -> MoneroHtlcArtifact {
    MoneroHtlcArtifact { deployment_ready: false }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monero_artifact_is_never_deployment_ready() {
        assert!(!build_artifact().deployment_ready);
    }
}
