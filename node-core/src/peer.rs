//! The P2P transport's authentication surface (§6 Peer wire, §4's "P2P
//! transport" component): signed envelope verification, replay
//! rejection, per-IP/per-ASN/per-prefix diversity caps, and reputation
//! tracking. Socket I/O, gossip fan-out and peer discovery are the
//! async reactor's job (`src/network.rs`); this module is the
//! stateless-per-call logic that reactor calls into on every inbound
//! message, mirroring how [`crate::inspector`] is the logic `ai_safety`
//! calls into rather than a component of its own.

use ledger_core::{Block, BlockHeader, CheckpointMetadata, CheckpointPayload, Transaction};
use serde::{Deserialize, Serialize};
use shared::{public_key_from_bytes, BlockchainError, Hash256, Result};
use std::collections::{HashMap, HashSet, VecDeque};

/// One of the wire message types named in spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PeerMessage {
    Tx(Transaction),
    Block(Block),
    Header(BlockHeader),
    GetHeaders { from_height: u64, count: u32 },
    GetBlocks { from_height: u64, count: u32 },
    CheckpointMetadata(CheckpointMetadata),
    CheckpointPayload(CheckpointPayload),
    Ping(u64),
    Pong(u64),
    PeerExchange(Vec<String>),
}

/// The preimage signed over: everything but the signature itself. A
/// change to any of these fields invalidates the signature, same
/// discipline as the sponsor authorization preimage.
#[derive(Debug, Serialize)]
struct SignedEnvelopeHeader<'a> {
    payload: &'a PeerMessage,
    sender_pubkey: &'a [u8],
    nonce: u64,
    timestamp: i64,
}

/// A signed peer wire envelope: `{payload, signature, sender_pubkey,
/// nonce, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEnvelope {
    pub payload: PeerMessage,
    pub signature: Vec<u8>,
    pub sender_pubkey: Vec<u8>,
    pub nonce: u64,
    pub timestamp: i64,
}

fn envelope_digest(envelope: &PeerEnvelope) -> Result<Hash256> {
    let header = SignedEnvelopeHeader {
        payload: &envelope.payload,
        sender_pubkey: &envelope.sender_pubkey,
        nonce: envelope.nonce,
        timestamp: envelope.timestamp,
    };
    let bytes = shared::canonical::encode(&header)?;
    Ok(Hash256::sha256(&bytes))
}

/// Rejects replayed `(sender, nonce)` pairs within a sliding time
/// window; entries older than the window are pruned lazily on insert.
pub struct ReplayCache {
    window_secs: i64,
    seen: HashMap<String, HashSet<u64>>,
    order: VecDeque<(i64, String, u64)>,
}

impl ReplayCache {
    #[must_use]
    pub fn new(window_secs: i64) -> Self {
        Self {
            window_secs,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: i64) {
        while let Some(&(timestamp, ref sender, nonce)) = self.order.front() {
            if now - timestamp <= self.window_secs {
                break;
            }
            if let Some(nonces) = self.seen.get_mut(sender) {
                nonces.remove(&nonce);
                if nonces.is_empty() {
                    self.seen.remove(sender);
                }
            }
            self.order.pop_front();
        }
    }

    /// Records `(sender, nonce)` if not already seen within the window.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::Replay`] if this pair was already
    /// observed inside the window.
    pub fn check_and_record(&mut self, sender: &str, nonce: u64, now: i64) -> Result<()> {
        self.prune(now);

        let nonces = self.seen.entry(sender.to_string()).or_default();
        if !nonces.insert(nonce) {
            return Err(BlockchainError::Replay);
        }
        self.order.push_back((now, sender.to_string(), nonce));
        Ok(())
    }
}

/// Per-scope (IP / ASN / routing prefix) connection counters enforcing
/// a diversity cap, so a single Sybil operator holding many peer
/// identities behind one network vantage point cannot dominate a
/// node's peer table.
#[derive(Debug, Default)]
pub struct DiversityLimiter {
    max_per_ip: usize,
    max_per_asn: usize,
    max_per_prefix: usize,
    by_ip: HashMap<String, usize>,
    by_asn: HashMap<u32, usize>,
    by_prefix: HashMap<String, usize>,
}

/// The network-topology facts used to decide whether a new peer
/// connection would exceed a diversity cap.
#[derive(Debug, Clone, Copy)]
pub struct PeerLocation<'a> {
    pub ip: &'a str,
    pub asn: u32,
    pub prefix: &'a str,
}

impl DiversityLimiter {
    #[must_use]
    pub const fn new(max_per_ip: usize, max_per_asn: usize, max_per_prefix: usize) -> Self {
        Self {
            max_per_ip,
            max_per_asn,
            max_per_prefix,
            by_ip: HashMap::new(),
            by_asn: HashMap::new(),
            by_prefix: HashMap::new(),
        }
    }

    /// Admits a new connection from `location` if doing so keeps every
    /// scope's count at or under its configured cap; records the
    /// acceptance.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::RateLimited`] if any of the per-IP,
    /// per-ASN or per-prefix caps would be exceeded.
    pub fn try_admit(&mut self, location: PeerLocation<'_>) -> Result<()> {
        let ip_count = self.by_ip.get(location.ip).copied().unwrap_or(0);
        let asn_count = self.by_asn.get(&location.asn).copied().unwrap_or(0);
        let prefix_count = self.by_prefix.get(location.prefix).copied().unwrap_or(0);

        if ip_count >= self.max_per_ip || asn_count >= self.max_per_asn || prefix_count >= self.max_per_prefix {
            return Err(BlockchainError::RateLimited { retry_after_secs: 0 });
        }

        *self.by_ip.entry(location.ip.to_string()).or_insert(0) += 1;
        *self.by_asn.entry(location.asn).or_insert(0) += 1;
        *self.by_prefix.entry(location.prefix.to_string()).or_insert(0) += 1;
        Ok(())
    }

    /// Releases a previously admitted connection's counters, e.g. on
    /// disconnect.
    pub fn release(&mut self, location: PeerLocation<'_>) {
        decrement(&mut self.by_ip, location.ip);
        if let Some(count) = self.by_asn.get_mut(&location.asn) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.by_asn.remove(&location.asn);
            }
        }
        decrement(&mut self.by_prefix, location.prefix);
    }
}

fn decrement(map: &mut HashMap<String, usize>, key: &str) {
    if let Some(count) = map.get_mut(key) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            map.remove(key);
        }
    }
}

/// How severely a peer offense degrades its reputation. Applied by the
/// reactor on invalid blocks/transactions/envelopes observed from a
/// peer; repeated offenses accumulate toward a ban.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffenseSeverity {
    Minor,
    Moderate,
    Severe,
}

impl OffenseSeverity {
    const fn penalty(self) -> i64 {
        match self {
            Self::Minor => 5,
            Self::Moderate => 20,
            Self::Severe => 100,
        }
    }
}

/// Per-peer reputation score, starting at 100 and decaying on
/// observed offenses; a peer is banned once its score reaches zero.
pub struct ReputationTable {
    ban_threshold: i64,
    scores: HashMap<String, i64>,
    banned: HashSet<String>,
}

impl Default for ReputationTable {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ReputationTable {
    #[must_use]
    pub fn new(ban_threshold: i64) -> Self {
        Self {
            ban_threshold,
            scores: HashMap::new(),
            banned: HashSet::new(),
        }
    }

    fn score_mut(&mut self, peer_id: &str) -> &mut i64 {
        self.scores.entry(peer_id.to_string()).or_insert(100)
    }

    /// Applies `severity`'s penalty to `peer_id`'s score, banning it if
    /// the score drops to or below the ban threshold.
    pub fn penalize(&mut self, peer_id: &str, severity: OffenseSeverity) {
        let threshold = self.ban_threshold;
        let score = self.score_mut(peer_id);
        *score -= severity.penalty();
        if *score <= threshold {
            self.banned.insert(peer_id.to_string());
        }
    }

    #[must_use]
    pub fn score(&self, peer_id: &str) -> i64 {
        self.scores.get(peer_id).copied().unwrap_or(100)
    }

    #[must_use]
    pub fn is_banned(&self, peer_id: &str) -> bool {
        self.banned.contains(peer_id)
    }
}

/// Signs `payload` into a fresh envelope under `keypair`, for outbound
/// gossip. The counterpart to [`PeerAuthGate::authenticate`].
///
/// # Errors
///
/// Returns an error if canonical encoding or signing fails.
pub fn sign_peer_message(keypair: &shared::KeyPair, payload: PeerMessage, nonce: u64, timestamp: i64) -> Result<PeerEnvelope> {
    let header = SignedEnvelopeHeader {
        payload: &payload,
        sender_pubkey: keypair.public_key.as_bytes(),
        nonce,
        timestamp,
    };
    let bytes = shared::canonical::encode(&header)?;
    let digest = Hash256::sha256(&bytes);
    let signature = keypair.sign(&digest)?;

    Ok(PeerEnvelope {
        payload,
        signature: signature.as_bytes().to_vec(),
        sender_pubkey: keypair.public_key.as_bytes().to_vec(),
        nonce,
        timestamp,
    })
}

/// The authentication gate every inbound peer message passes through
/// before it is handed to the component its payload belongs to
/// (mempool, chain, checkpoint sync, ...): signature verification and
/// replay rejection. Diversity and reputation are tracked per
/// connection rather than per message, so they live alongside this
/// gate rather than inside it.
pub struct PeerAuthGate {
    replay_cache: ReplayCache,
}

impl PeerAuthGate {
    #[must_use]
    pub fn new(replay_window_secs: i64) -> Self {
        Self {
            replay_cache: ReplayCache::new(replay_window_secs),
        }
    }

    /// Verifies `envelope`'s signature under its claimed sender public
    /// key and rejects it if `(sender, nonce)` has already been seen
    /// within the replay window.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::InvalidSignature`] if the signature
    /// does not verify, or [`BlockchainError::Replay`] if the nonce was
    /// already observed.
    pub fn authenticate(&mut self, envelope: &PeerEnvelope, now: i64) -> Result<&PeerMessage> {
        let public_key = public_key_from_bytes(&envelope.sender_pubkey)?;
        let digest = envelope_digest(envelope)?;
        let signature = shared::crypto::signature_from_compact(&envelope.signature, public_key)?;

        if !signature.verify(&digest)? {
            return Err(BlockchainError::InvalidSignature);
        }

        let sender_id = hex::encode(&envelope.sender_pubkey);
        self.replay_cache.check_and_record(&sender_id, envelope.nonce, now)?;

        Ok(&envelope.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::KeyPair;

    fn signed_envelope(keypair: &KeyPair, payload: PeerMessage, nonce: u64, timestamp: i64) -> PeerEnvelope {
        let header = SignedEnvelopeHeader {
            payload: &payload,
            sender_pubkey: keypair.public_key.as_bytes(),
            nonce,
            timestamp,
        };
        let bytes = shared::canonical::encode(&header).unwrap();
        let digest = Hash256::sha256(&bytes);
        let signature = keypair.sign(&digest).unwrap();

        PeerEnvelope {
            payload,
            signature: signature.as_bytes().to_vec(),
            sender_pubkey: keypair.public_key.as_bytes().to_vec(),
            nonce,
            timestamp,
        }
    }

    #[test]
    fn valid_envelope_authenticates_once() {
        let keypair = KeyPair::generate().unwrap();
        let envelope = signed_envelope(&keypair, PeerMessage::Ping(1), 1, 1_700_000_000);

        let mut gate = PeerAuthGate::new(60);
        assert!(gate.authenticate(&envelope, 1_700_000_000).is_ok());
    }

    #[test]
    fn replayed_nonce_is_rejected() {
        let keypair = KeyPair::generate().unwrap();
        let envelope = signed_envelope(&keypair, PeerMessage::Ping(1), 1, 1_700_000_000);

        let mut gate = PeerAuthGate::new(60);
        gate.authenticate(&envelope, 1_700_000_000).unwrap();

        let result = gate.authenticate(&envelope, 1_700_000_010);
        assert!(matches!(result, Err(BlockchainError::Replay)));
    }

    #[test]
    fn replay_cache_forgets_nonces_outside_the_window() {
        let keypair = KeyPair::generate().unwrap();
        let envelope = signed_envelope(&keypair, PeerMessage::Ping(1), 1, 1_700_000_000);

        let mut gate = PeerAuthGate::new(60);
        gate.authenticate(&envelope, 1_700_000_000).unwrap();

        let later = signed_envelope(&keypair, PeerMessage::Ping(1), 1, 1_700_000_200);
        assert!(gate.authenticate(&later, 1_700_000_200).is_ok());
    }

    #[test]
    fn tampered_payload_fails_signature_verification() {
        let keypair = KeyPair::generate().unwrap();
        let mut envelope = signed_envelope(&keypair, PeerMessage::Ping(1), 1, 1_700_000_000);
        envelope.payload = PeerMessage::Ping(2);

        let mut gate = PeerAuthGate::new(60);
        let result = gate.authenticate(&envelope, 1_700_000_000);
        assert!(matches!(result, Err(BlockchainError::InvalidSignature)));
    }

    #[test]
    fn diversity_limiter_caps_connections_per_scope() {
        let mut limiter = DiversityLimiter::new(2, 5, 5);
        let a = PeerLocation { ip: "203.0.113.1", asn: 64500, prefix: "203.0.113.0/24" };
        let b = PeerLocation { ip: "203.0.113.2", asn: 64500, prefix: "203.0.113.0/24" };
        let c = PeerLocation { ip: "203.0.113.3", asn: 64500, prefix: "203.0.113.0/24" };

        limiter.try_admit(a).unwrap();
        limiter.try_admit(b).unwrap();
        assert!(limiter.try_admit(c).is_err());
    }

    #[test]
    fn diversity_limiter_release_frees_capacity() {
        let mut limiter = DiversityLimiter::new(1, 5, 5);
        let a = PeerLocation { ip: "203.0.113.1", asn: 64500, prefix: "203.0.113.0/24" };

        limiter.try_admit(a).unwrap();
        assert!(limiter.try_admit(a).is_err());

        limiter.release(a);
        assert!(limiter.try_admit(a).is_ok());
    }

    #[test]
    fn reputation_bans_after_enough_severe_offenses() {
        let mut table = ReputationTable::new(0);
        table.penalize("peer-a", OffenseSeverity::Severe);
        assert!(table.is_banned("peer-a"));

        table.penalize("peer-b", OffenseSeverity::Minor);
        assert!(!table.is_banned("peer-b"));
    }
}
