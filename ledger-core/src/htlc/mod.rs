//! The cross-chain atomic-swap state machine (§4.3): one `SwapContract`
//! per in-flight swap, advanced only along the allowed transition graph
//! and persisted atomically on every transition.

pub mod eth_protocol;
pub mod monero;
pub mod recovery;
pub mod utxo_protocol;

use serde::{Deserialize, Serialize};
use shared::{BlockchainError, Hash256, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A chain a swap leg can settle on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CoinType {
    Btc,
    Ltc,
    Doge,
    Bch,
    Zec,
    Dash,
    Eth,
    Erc20,
    Xmr,
}

/// Which HTLC implementation family a swap's counterparty leg uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    UtxoHtlc,
    EthereumHtlc,
    MoneroHtlc,
}

impl CoinType {
    /// The protocol family this coin's HTLC leg is implemented with.
    #[must_use]
    pub const fn protocol(self) -> Protocol {
        match self {
            Self::Btc | Self::Ltc | Self::Doge | Self::Bch | Self::Zec | Self::Dash => Protocol::UtxoHtlc,
            Self::Eth | Self::Erc20 => Protocol::EthereumHtlc,
            Self::Xmr => Protocol::MoneroHtlc,
        }
    }
}

/// The swap contract's lifecycle state. Terminal states (`Claimed`,
/// `Refunded`, `Expired`) are immutable except that `Failed` may
/// transition to `Claimed` or `Refunded` during recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapState {
    Initiated,
    Funded,
    CounterpartyFunded,
    Claimed,
    Refunded,
    Expired,
    Failed,
}

impl SwapState {
    fn can_transition_to(self, next: Self) -> bool {
        use SwapState::{Claimed, CounterpartyFunded, Expired, Failed, Funded, Initiated, Refunded};
        matches!(
            (self, next),
            (Initiated, Funded)
                | (Initiated, Failed)
                | (Initiated, Expired)
                | (Funded, CounterpartyFunded)
                | (Funded, Refunded)
                | (Funded, Expired)
                | (Funded, Failed)
                | (CounterpartyFunded, Claimed)
                | (CounterpartyFunded, Refunded)
                | (CounterpartyFunded, Expired)
                | (Failed, Claimed)
                | (Failed, Refunded)
        )
    }
}

/// One entry in a swap's append-only audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub state: SwapState,
    pub event: String,
    pub timestamp: i64,
    pub data: Option<String>,
}

/// Protocol-specific artifacts produced by [`SwapEngine::create_swap`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProtocolArtifact {
    Utxo(utxo_protocol::UtxoHtlcArtifact),
    Ethereum(eth_protocol::EthereumHtlcArtifact),
    Monero(monero::MoneroHtlcArtifact),
}

/// A single cross-chain atomic swap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapContract {
    pub swap_id: Hash256,
    pub coin: CoinType,
    pub protocol: Protocol,
    pub secret_hash: Hash256,
    pub timelock_unix: i64,
    pub counterparty: String,
    pub amount_local: u64,
    pub amount_remote: u64,
    pub funding_txid: Option<Hash256>,
    pub state: SwapState,
    pub history: Vec<HistoryEntry>,
    pub auto_recovery_attempts: u32,
    pub artifact: ProtocolArtifact,
}

impl SwapContract {
    fn push_history(&mut self, event: &str, timestamp: i64, data: Option<String>) {
        self.history.push(HistoryEntry {
            state: self.state,
            event: event.to_string(),
            timestamp,
            data,
        });
    }

    fn transition(&mut self, next: SwapState, event: &str, timestamp: i64) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(BlockchainError::SwapTransitionInvalid);
        }
        self.state = next;
        self.push_history(event, timestamp, None);
        Ok(())
    }

    /// The secret, if this swap's history already recorded one being
    /// revealed (by a local claim or an observed counterparty claim).
    /// Used by claim recovery to retry a `Failed` swap without the
    /// caller having to resupply the secret out of band.
    #[must_use]
    pub fn known_secret(&self) -> Option<Vec<u8>> {
        self.history
            .iter()
            .rev()
            .find(|entry| entry.event == "swap.counterparty_claimed" || entry.event == "swap.secret_revealed")
            .and_then(|entry| entry.data.as_deref())
            .and_then(|hex_secret| hex::decode(hex_secret).ok())
    }
}

/// An event observed on a counterparty chain via SPV, advancing a
/// swap's state.
#[derive(Debug, Clone)]
pub enum ExternalEvent {
    CounterpartyFunded { funding_txid: Hash256 },
    CounterpartyClaimed { revealed_secret: Vec<u8> },
    TimelockElapsed,
}

/// Owns every in-flight swap and exposes the operations that advance
/// them. A reentrant-lock-free design: callers serialize access (see
/// §5's ownership model — the recovery services hold only read access
/// plus transition submissions, never concurrent mutation of the same
/// swap).
pub struct SwapEngine {
    swaps: HashMap<Hash256, SwapContract>,
    persist_path: Option<PathBuf>,
}

impl SwapEngine {
    /// Creates an engine with no persistence backing (tests, ephemeral use).
    #[must_use]
    pub fn new() -> Self {
        Self {
            swaps: HashMap::new(),
            persist_path: None,
        }
    }

    /// Creates an engine that atomically persists its swap table to
    /// `path` after every transition.
    #[must_use]
    pub fn with_persistence(path: impl Into<PathBuf>) -> Self {
        Self {
            swaps: HashMap::new(),
            persist_path: Some(path.into()),
        }
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let snapshot: Vec<&SwapContract> = self.swaps.values().collect();
        shared::persist::write_json_atomic(path, &snapshot)
    }

    /// Loads a previously persisted swap table from `path`, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contracts: Option<Vec<SwapContract>> = shared::persist::read_json(path.as_ref())?;
        let mut swaps = HashMap::new();
        for contract in contracts.unwrap_or_default() {
            swaps.insert(contract.swap_id, contract);
        }
        Ok(Self {
            swaps,
            persist_path: Some(path.as_ref().to_path_buf()),
        })
    }

    /// Starts a new swap: generates (or accepts) a 32-byte `secret`,
    /// computes `secret_hash`, sets `timelock_unix = now + hours*3600`,
    /// builds the protocol-specific artifact and persists at `Initiated`.
    ///
    /// # Errors
    ///
    /// Returns an error if building the protocol artifact fails (e.g.
    /// Ethereum-family address malformed) or persistence fails.
    #[allow(clippy::too_many_arguments)]
    pub fn create_swap(
        &mut self,
        coin: CoinType,
        amount_local: u64,
        amount_remote: u64,
        counterparty: String,
        timelock_hours: i64,
        secret: Option<[u8; 32]>,
        local_pubkey_hash: &[u8],
        counterparty_pubkey_hash: &[u8],
        now: i64,
    ) -> Result<SwapContract> {
        let protocol = coin.protocol();
        if protocol == Protocol::MoneroHtlc {
            return Err(BlockchainError::UnsupportedProtocol);
        }

        let secret = secret.unwrap_or_else(random_secret);
        let secret_hash = Hash256::sha256(&secret);
        let timelock_unix = now + timelock_hours * 3600;

        let artifact = match protocol {
            Protocol::UtxoHtlc => ProtocolArtifact::Utxo(utxo_protocol::build_artifact(
                &secret_hash,
                counterparty_pubkey_hash,
                local_pubkey_hash,
                timelock_unix,
                "xai",
            )?),
            Protocol::EthereumHtlc => ProtocolArtifact::Ethereum(eth_protocol::build_artifact(
                &secret_hash,
                &counterparty,
                timelock_unix,
                amount_remote,
            )),
            Protocol::MoneroHtlc => unreachable!("rejected above"),
        };

        let swap_id = Hash256::sha256(
            format!("{counterparty}:{amount_local}:{amount_remote}:{timelock_unix}:{secret_hash}").as_bytes(),
        );

        let mut contract = SwapContract {
            swap_id,
            coin,
            protocol,
            secret_hash,
            timelock_unix,
            counterparty,
            amount_local,
            amount_remote,
            funding_txid: None,
            state: SwapState::Initiated,
            history: Vec::new(),
            auto_recovery_attempts: 0,
            artifact,
        };
        contract.push_history("swap.created", now, None);

        self.swaps.insert(swap_id, contract.clone());
        self.persist()?;
        Ok(contract)
    }

    /// Records that the local leg has been funded on-chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the swap is unknown or not in `Initiated`.
    pub fn mark_funded(&mut self, swap_id: Hash256, funding_txid: Hash256, now: i64) -> Result<()> {
        let contract = self.require_mut(swap_id)?;
        contract.transition(SwapState::Funded, "swap.funded", now)?;
        contract.funding_txid = Some(funding_txid);
        self.persist()
    }

    /// Verifies a claim attempt: the revealed `secret` must hash to
    /// `contract.secret_hash` and the timelock must not have elapsed.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::InvalidSignature`] if the secret is
    /// wrong, or a swap-specific error if the timelock has expired.
    pub fn verify_claim(secret: &[u8], contract: &SwapContract, now: i64) -> Result<()> {
        if Hash256::sha256(secret) != contract.secret_hash {
            return Err(BlockchainError::InvalidSignature);
        }
        if now >= contract.timelock_unix {
            return Err(BlockchainError::SwapTransitionInvalid);
        }
        Ok(())
    }

    /// Claims a counterparty-funded swap: verifies the secret, then
    /// transitions `CounterpartyFunded -> Claimed`.
    ///
    /// # Errors
    ///
    /// Returns an error if verification or the state transition fails.
    pub fn claim(&mut self, swap_id: Hash256, secret: &[u8], now: i64) -> Result<SwapContract> {
        {
            let contract = self.require(swap_id)?;
            Self::verify_claim(secret, contract, now)?;
        }
        let contract = self.require_mut(swap_id)?;
        contract.transition(SwapState::Claimed, "swap.claimed", now)?;
        contract.push_history("swap.secret_revealed", now, Some(hex::encode(secret)));
        let result = contract.clone();
        self.persist()?;
        Ok(result)
    }

    /// Refunds an expired swap: allowed once `now >= timelock_unix` and
    /// the swap is in `Funded` or `CounterpartyFunded`.
    ///
    /// # Errors
    ///
    /// Returns an error if the timelock has not elapsed or the swap has
    /// already been claimed.
    pub fn refund(&mut self, swap_id: Hash256, now: i64) -> Result<SwapContract> {
        let contract = self.require_mut(swap_id)?;
        if now < contract.timelock_unix {
            return Err(BlockchainError::SwapTransitionInvalid);
        }
        if matches!(contract.state, SwapState::Claimed) {
            return Err(BlockchainError::SwapTransitionInvalid);
        }
        contract.transition(SwapState::Refunded, "swap.refunded", now)?;
        let result = contract.clone();
        self.persist()?;
        Ok(result)
    }

    /// Advances a swap's state in response to an event observed on a
    /// counterparty chain (via SPV).
    ///
    /// # Errors
    ///
    /// Returns an error if the swap is unknown or the event is not a
    /// valid transition from its current state.
    pub fn handle_external_event(&mut self, swap_id: Hash256, event: ExternalEvent, now: i64) -> Result<()> {
        let contract = self.require_mut(swap_id)?;
        match event {
            ExternalEvent::CounterpartyFunded { funding_txid } => {
                contract.transition(SwapState::CounterpartyFunded, "swap.counterparty_funded", now)?;
                contract.funding_txid = Some(funding_txid);
            }
            ExternalEvent::CounterpartyClaimed { revealed_secret } => {
                if Hash256::sha256(&revealed_secret) != contract.secret_hash {
                    contract.transition(SwapState::Failed, "swap.counterparty_claim_invalid", now)?;
                } else {
                    contract.push_history("swap.counterparty_claimed", now, Some(hex::encode(&revealed_secret)));
                }
            }
            ExternalEvent::TimelockElapsed => {
                if matches!(contract.state, SwapState::Initiated | SwapState::Funded) {
                    contract.transition(SwapState::Expired, "swap.expired", now)?;
                }
            }
        }
        self.persist()
    }

    /// Looks up a swap by id.
    #[must_use]
    pub fn get(&self, swap_id: Hash256) -> Option<&SwapContract> {
        self.swaps.get(&swap_id)
    }

    /// Returns every swap currently tracked, for recovery sweeps.
    #[must_use]
    pub fn all(&self) -> Vec<&SwapContract> {
        self.swaps.values().collect()
    }

    /// Increments a swap's automated-recovery attempt counter (e.g.
    /// after a refund attempt fails) and returns the new count.
    ///
    /// # Errors
    ///
    /// Returns an error if the swap is unknown or persistence fails.
    pub fn bump_recovery_attempt(&mut self, swap_id: Hash256) -> Result<u32> {
        let contract = self.require_mut(swap_id)?;
        contract.auto_recovery_attempts += 1;
        let attempts = contract.auto_recovery_attempts;
        self.persist()?;
        Ok(attempts)
    }

    fn require(&self, swap_id: Hash256) -> Result<&SwapContract> {
        self.swaps
            .get(&swap_id)
            .ok_or_else(|| BlockchainError::Malformed("unknown swap id".to_string()))
    }

    fn require_mut(&mut self, swap_id: Hash256) -> Result<&mut SwapContract> {
        self.swaps
            .get_mut(&swap_id)
            .ok_or_else(|| BlockchainError::Malformed("unknown swap id".to_string()))
    }
}

impl Default for SwapEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn random_secret() -> [u8; 32] {
    use rand::RngCore;
    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_swap_starts_at_initiated() {
        let mut engine = SwapEngine::new();
        let contract = engine
            .create_swap(CoinType::Btc, 1_000, 900, "counterparty-addr".to_string(), 24, None, &[1; 20], &[2; 20], 1_700_000_000)
            .unwrap();

        assert_eq!(contract.state, SwapState::Initiated);
        assert!(matches!(contract.artifact, ProtocolArtifact::Utxo(_)));
    }

    #[test]
    fn monero_swap_creation_is_rejected() {
        let mut engine = SwapEngine::new();
        let result = engine.create_swap(
            CoinType::Xmr,
            1_000,
            900,
            "counterparty-addr".to_string(),
            24,
            None,
            &[1; 20],
            &[2; 20],
            1_700_000_000,
        );

        assert!(matches!(result, Err(BlockchainError::UnsupportedProtocol)));
    }

    #[test]
    fn claim_requires_correct_secret() {
        let mut engine = SwapEngine::new();
        let secret = [7u8; 32];
        let contract = engine
            .create_swap(CoinType::Eth, 1_000, 900, "0xcounterparty".to_string(), 24, Some(secret), &[], &[], 1_700_000_000)
            .unwrap();

        engine.mark_funded(contract.swap_id, Hash256::sha256(b"funding"), 1_700_000_100).unwrap();
        engine
            .handle_external_event(
                contract.swap_id,
                ExternalEvent::CounterpartyFunded { funding_txid: Hash256::sha256(b"counterparty-funding") },
                1_700_000_200,
            )
            .unwrap();

        let wrong = engine.claim(contract.swap_id, b"wrong-secret-bytes-000000000000", 1_700_000_300);
        assert!(wrong.is_err());

        let claimed = engine.claim(contract.swap_id, &secret, 1_700_000_400).unwrap();
        assert_eq!(claimed.state, SwapState::Claimed);
    }

    #[test]
    fn refund_rejected_before_timelock_elapses() {
        let mut engine = SwapEngine::new();
        let contract = engine
            .create_swap(CoinType::Ltc, 500, 450, "counterparty".to_string(), 24, None, &[1; 20], &[2; 20], 1_700_000_000)
            .unwrap();
        engine.mark_funded(contract.swap_id, Hash256::sha256(b"fund"), 1_700_000_100).unwrap();

        let result = engine.refund(contract.swap_id, 1_700_000_200);
        assert!(result.is_err());
    }

    #[test]
    fn refund_succeeds_after_timelock_elapses() {
        let mut engine = SwapEngine::new();
        let contract = engine
            .create_swap(CoinType::Ltc, 500, 450, "counterparty".to_string(), 1, None, &[1; 20], &[2; 20], 1_700_000_000)
            .unwrap();
        engine.mark_funded(contract.swap_id, Hash256::sha256(b"fund"), 1_700_000_100).unwrap();

        let refunded = engine.refund(contract.swap_id, 1_700_000_000 + 3601).unwrap();
        assert_eq!(refunded.state, SwapState::Refunded);
    }

    #[test]
    fn failed_swap_can_still_be_claimed_during_recovery() {
        let mut engine = SwapEngine::new();
        let secret = [9u8; 32];
        let contract = engine
            .create_swap(CoinType::Eth, 100, 90, "counterparty".to_string(), 24, Some(secret), &[], &[], 1_700_000_000)
            .unwrap();
        engine.mark_funded(contract.swap_id, Hash256::sha256(b"fund"), 1_700_000_100).unwrap();
        engine
            .handle_external_event(
                contract.swap_id,
                ExternalEvent::CounterpartyFunded { funding_txid: Hash256::sha256(b"cp-fund") },
                1_700_000_200,
            )
            .unwrap();
        engine
            .handle_external_event(
                contract.swap_id,
                ExternalEvent::CounterpartyClaimed { revealed_secret: vec![0u8; 32] },
                1_700_000_300,
            )
            .unwrap();

        assert_eq!(engine.get(contract.swap_id).unwrap().state, SwapState::Failed);

        let claimed = engine.claim(contract.swap_id, &secret, 1_700_000_400).unwrap();
        assert_eq!(claimed.state, SwapState::Claimed);
    }
}
