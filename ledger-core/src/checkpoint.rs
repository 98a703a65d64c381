//! Checkpoint-based bootstrap and partial sync (§4.5): lets a new node
//! skip replaying the full chain history by trusting a quorum- and
//! signature-validated snapshot of chain state at some height.

use serde::{Deserialize, Serialize};
use shared::{BlockchainError, CheckpointConfig, Hash256, PublicKey, Result};
use std::collections::{HashMap, HashSet};

/// The data a checkpoint commits to: the canonically encoded state the
/// node should adopt (account balances, UTXO set, or whatever snapshot
/// format the caller supplies).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointData(pub serde_json::Value);

/// A candidate checkpoint as advertised by a peer or stored locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointPayload {
    pub height: u64,
    pub block_hash: Hash256,
    pub state_hash: Hash256,
    pub work: Option<u128>,
    pub data: CheckpointData,
    pub signature: Option<Vec<u8>>,
    pub pubkey: Option<Vec<u8>>,
}

/// The subset of a payload advertised during discovery, before the
/// full payload (and its `data`) is fetched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub height: u64,
    pub block_hash: Hash256,
    pub state_hash: Hash256,
}

/// The message signed over a checkpoint: `SHA256(canonical({height,
/// block_hash, state_hash}))`.
#[derive(Debug, Serialize)]
struct SignedCheckpointHeader {
    height: u64,
    block_hash: Hash256,
    state_hash: Hash256,
}

fn checkpoint_digest(payload: &CheckpointPayload) -> Result<Hash256> {
    let header = SignedCheckpointHeader {
        height: payload.height,
        block_hash: payload.block_hash,
        state_hash: payload.state_hash,
    };
    let bytes = shared::canonical::encode(&header)?;
    Ok(Hash256::sha256(&bytes))
}

/// One peer's advertisement of a `(block_hash, state_hash)` pair at a
/// given height, tracked for quorum counting.
#[derive(Debug, Clone)]
struct Advertisement {
    peer_ids: HashSet<String>,
    last_seen: i64,
}

/// Accepts and tracks checkpoint metadata advertised by peers, applies
/// quorum/signature/work checks, and applies the winning payload.
pub struct CheckpointSync {
    config: CheckpointConfig,
    trusted_signers: Vec<PublicKey>,
    advertisements: HashMap<(Hash256, Hash256), HashMap<u64, Advertisement>>,
    latest_checkpoint_work: u128,
    local_metadata: Option<CheckpointMetadata>,
}

impl CheckpointSync {
    /// Creates a checkpoint sync tracker. `trusted_signers` is the
    /// configured trusted-signer set; an empty set means unsigned
    /// payloads are accepted (dev mode).
    #[must_use]
    pub fn new(config: CheckpointConfig, trusted_signers: Vec<PublicKey>) -> Self {
        Self {
            config,
            trusted_signers,
            advertisements: HashMap::new(),
            latest_checkpoint_work: 0,
            local_metadata: None,
        }
    }

    /// Records a peer's advertisement of a checkpoint candidate.
    pub fn observe_advertisement(&mut self, peer_id: &str, height: u64, block_hash: Hash256, state_hash: Hash256, now: i64) {
        let by_height = self.advertisements.entry((block_hash, state_hash)).or_default();
        let entry = by_height.entry(height).or_insert_with(|| Advertisement {
            peer_ids: HashSet::new(),
            last_seen: now,
        });
        entry.peer_ids.insert(peer_id.to_string());
        entry.last_seen = now;
    }

    /// Sets the metadata of a checkpoint known locally (e.g. from a
    /// previous run), used as a fallback when no peer quorum exists yet.
    pub fn set_local_metadata(&mut self, metadata: CheckpointMetadata) {
        self.local_metadata = Some(metadata);
    }

    /// Selects the best checkpoint metadata: prefers a peer-reported
    /// candidate that has reached quorum (`≥ quorum` distinct peers
    /// spanning `≥ min_peer_diversity` peers within the request-rate
    /// window) over the local one, when peer data is available and
    /// complete; among quorum-passing candidates picks the highest
    /// `height`.
    #[must_use]
    pub fn get_best_checkpoint_metadata(&self, now: i64) -> Option<CheckpointMetadata> {
        let mut best: Option<CheckpointMetadata> = None;

        for (&(block_hash, state_hash), by_height) in &self.advertisements {
            for (&height, advertisement) in by_height {
                let within_window = now - advertisement.last_seen <= self.config.request_rate_seconds as i64;
                let meets_quorum = advertisement.peer_ids.len() >= self.config.quorum
                    && advertisement.peer_ids.len() >= self.config.min_peer_diversity;

                if within_window && meets_quorum {
                    let candidate = CheckpointMetadata { height, block_hash, state_hash };
                    if best.is_none_or_height_lower(height) {
                        best = Some(candidate);
                    }
                }
            }
        }

        best.or(self.local_metadata)
    }

    /// Validates `payload` against the configured signature policy,
    /// work monotonicity and data integrity.
    ///
    /// # Errors
    ///
    /// Returns the specific `BlockchainError` describing which check
    /// failed.
    pub fn validate(&self, payload: &CheckpointPayload) -> Result<()> {
        let bytes = shared::canonical::encode(&payload.data)?;
        if Hash256::sha256(&bytes) != payload.state_hash {
            return Err(BlockchainError::CheckpointSignatureInvalid);
        }

        if !self.trusted_signers.is_empty() {
            let (Some(signature_bytes), Some(pubkey_bytes)) = (&payload.signature, &payload.pubkey) else {
                return Err(BlockchainError::CheckpointSignatureInvalid);
            };

            let public_key = shared::public_key_from_bytes(pubkey_bytes)?;
            let is_trusted = self.trusted_signers.iter().any(|signer| signer.as_bytes() == public_key.as_bytes());
            if !is_trusted {
                return Err(BlockchainError::CheckpointSignatureInvalid);
            }

            let signature = shared::crypto::signature_from_compact(signature_bytes, public_key.clone())?;
            let digest = checkpoint_digest(payload)?;
            if !signature.verify(&digest)? {
                return Err(BlockchainError::CheckpointSignatureInvalid);
            }
        }

        if let Some(work) = payload.work {
            if work == 0 || work < self.latest_checkpoint_work {
                return Err(BlockchainError::CheckpointQuorumFailed);
            }
        }

        Ok(())
    }

    /// Validates and "applies" `payload`: in this node, applying a
    /// checkpoint means handing the validated state snapshot back to
    /// the caller (the node wires it into [`crate::blockchain::Chain`]
    /// or the UTXO set) and recording its work as the new watermark.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn apply(&mut self, payload: CheckpointPayload) -> Result<CheckpointPayload> {
        self.validate(&payload)?;
        if let Some(work) = payload.work {
            self.latest_checkpoint_work = work;
        }
        Ok(payload)
    }

    /// Bootstraps from the best available checkpoint if the caller has
    /// no existing chain state yet (or `force` is set), fetching via
    /// `fetch_payload` and validating/applying the result.
    ///
    /// # Errors
    ///
    /// Returns an error if no checkpoint metadata is available, the
    /// fetch fails, or validation fails.
    pub fn bootstrap_if_empty<F>(&mut self, force: bool, is_empty: bool, fetch_payload: F, now: i64) -> Result<Option<CheckpointPayload>>
    where
        F: FnOnce(CheckpointMetadata) -> Result<CheckpointPayload>,
    {
        if !force && !is_empty {
            return Ok(None);
        }

        let Some(metadata) = self.get_best_checkpoint_metadata(now) else {
            return Ok(None);
        };

        let payload = fetch_payload(metadata)?;
        let applied = self.apply(payload)?;
        Ok(Some(applied))
    }
}

trait OptionHeightExt {
    fn is_none_or_height_lower(&self, height: u64) -> bool;
}

impl OptionHeightExt for Option<CheckpointMetadata> {
    fn is_none_or_height_lower(&self, height: u64) -> bool {
        match self {
            None => true,
            Some(existing) => height > existing.height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> CheckpointConfig {
        CheckpointConfig {
            quorum: 2,
            min_peer_diversity: 2,
            request_rate_seconds: 30,
            chunk_size_bytes: 1024,
        }
    }

    fn sample_payload(height: u64, work: u128) -> CheckpointPayload {
        let data = CheckpointData(serde_json::json!({ "balances": { "addr-a": 1000 } }));
        let bytes = shared::canonical::encode(&data).unwrap();
        let state_hash = Hash256::sha256(&bytes);
        CheckpointPayload {
            height,
            block_hash: Hash256::sha256(format!("block-{height}").as_bytes()),
            state_hash,
            work: Some(work),
            data,
            signature: None,
            pubkey: None,
        }
    }

    #[test]
    fn unsigned_payload_accepted_when_no_trusted_signers_configured() {
        let sync = CheckpointSync::new(sample_config(), vec![]);
        let payload = sample_payload(100, 500);
        sync.validate(&payload).unwrap();
    }

    #[test]
    fn integrity_check_rejects_tampered_state_hash() {
        let sync = CheckpointSync::new(sample_config(), vec![]);
        let mut payload = sample_payload(100, 500);
        payload.state_hash = Hash256::sha256(b"tampered");
        assert!(sync.validate(&payload).is_err());
    }

    #[test]
    fn work_must_be_monotone_across_applied_checkpoints() {
        let mut sync = CheckpointSync::new(sample_config(), vec![]);
        sync.apply(sample_payload(100, 500)).unwrap();

        let regressed = sample_payload(150, 400);
        assert!(sync.validate(&regressed).is_err());

        let advanced = sample_payload(150, 600);
        sync.validate(&advanced).unwrap();
    }

    #[test]
    fn quorum_requires_enough_distinct_diverse_peers() {
        let mut sync = CheckpointSync::new(sample_config(), vec![]);
        let block_hash = Hash256::sha256(b"block-100");
        let state_hash = Hash256::sha256(b"state-100");

        sync.observe_advertisement("peer-a", 100, block_hash, state_hash, 1_700_000_000);
        assert!(sync.get_best_checkpoint_metadata(1_700_000_000).is_none());

        sync.observe_advertisement("peer-b", 100, block_hash, state_hash, 1_700_000_001);
        let best = sync.get_best_checkpoint_metadata(1_700_000_001).unwrap();
        assert_eq!(best.height, 100);
    }
}
