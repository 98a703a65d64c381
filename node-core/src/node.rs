//! The node orchestrator (§4, §6): the single owner wiring the chain,
//! mempool, swap engine, sponsorship engine, faucet, checkpoint and
//! chunked-sync subsystems together with the AI safety kernel, sandbox
//! guard and API auth gate behind one handle.
//!
//! HTTP routing is an external concern (spec.md §1's explicit
//! non-goal); this struct is the collaborator interface that surface
//! would call into — one method per contract named in §6 (`POST
//! /send`, `POST /mine`, `POST /block/receive`, ...).

use ledger_core::{
    Block, Chain, CheckpointSync, ChunkedTransfer, FaucetGate, Mempool, Miner, MinerConfig, NonceTracker,
    ReceiveOutcome, SpvVerifier, SwapEngine,
};
use serde::{Deserialize, Serialize};
use shared::{BlockchainError, NodeConfig, Result};
use std::sync::{Mutex, RwLock};

use crate::ai_safety::AiSafetyKernel;
use crate::api_auth::ApiAuthGate;
use crate::peer::{DiversityLimiter, OffenseSeverity, PeerAuthGate, PeerEnvelope, PeerLocation, PeerMessage, ReputationTable};
use crate::sandbox::SandboxGuard;

/// A [`ledger_core::ChainDataProvider`] that always reports the
/// counterparty chain unavailable. Wired in by default; a real
/// deployment supplies its own provider backed by a light client or a
/// block explorer API (e.g. the one `XAI_ETHERSCAN_API_KEY`
/// authenticates against).
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableChainDataProvider;

impl ledger_core::ChainDataProvider for UnavailableChainDataProvider {
    fn fetch_transaction(
        &self,
        _coin: ledger_core::CoinType,
        _txid: &str,
    ) -> Result<ledger_core::spv::ProviderTransaction> {
        Err(BlockchainError::ProviderUnavailable("no chain data provider configured".to_string()))
    }
}

/// Snapshot of chain state returned by `GET /state/snapshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub height: u64,
    pub tip: String,
    pub mempool_size: usize,
}

/// The node: the sole owner of consensus state and the shared handle
/// every external-facing method runs against.
///
/// Locking follows §5: `chain` is mutated only under its own lock by
/// the logical "consensus thread" (here, whichever caller currently
/// holds it — single-writer by construction since `apply_block` and
/// `submit_transaction` both take `&mut`); `mempool` uses a
/// reader-writer lock; swap/sponsor/AI-safety/sandbox/API-auth each
/// own their state behind an internal mutex already.
pub struct Node<P: ledger_core::ChainDataProvider = UnavailableChainDataProvider> {
    pub config: NodeConfig,
    chain: Mutex<Chain>,
    mempool: RwLock<Mempool>,
    nonce_tracker: Mutex<NonceTracker>,
    miner: Miner,
    swap_engine: Mutex<SwapEngine>,
    sponsorship: Mutex<ledger_core::SponsorshipEngine>,
    faucet: Mutex<FaucetGate>,
    checkpoint_sync: Mutex<CheckpointSync>,
    chunked_transfer: Mutex<Option<ChunkedTransfer>>,
    spv_verifier: Mutex<SpvVerifier<P>>,
    pub ai_safety: AiSafetyKernel,
    pub sandbox: SandboxGuard,
    pub api_auth: ApiAuthGate,
    peer_auth: Mutex<PeerAuthGate>,
    diversity: Mutex<DiversityLimiter>,
    reputation: Mutex<ReputationTable>,
}

impl Node<UnavailableChainDataProvider> {
    /// Builds a node over the default (always-unavailable) chain data
    /// provider. Most deployments that don't need live SPV
    /// verification against a counterparty chain can use this.
    ///
    /// # Errors
    ///
    /// Returns an error if genesis block construction fails, or if any
    /// subsystem's persisted state cannot be loaded.
    pub fn new(config: NodeConfig, genesis: Block, now: i64) -> Result<Self> {
        Self::with_provider(config, genesis, UnavailableChainDataProvider, now)
    }
}

impl<P: ledger_core::ChainDataProvider> Node<P> {
    /// Builds a node over an explicit chain data provider, for
    /// deployments that perform live cross-chain SPV verification.
    ///
    /// # Errors
    ///
    /// Returns an error if genesis block construction fails, or if any
    /// subsystem's persisted state cannot be loaded.
    pub fn with_provider(config: NodeConfig, genesis: Block, provider: P, now: i64) -> Result<Self> {
        let chain = Chain::new(genesis, config.consensus.clone(), config.address_hrp.clone())?;
        let mempool = Mempool::new(config.consensus.min_fee, config.consensus.max_nonce_gap);

        let swap_path = format!("{}/swaps/state.json", config.data_dir);
        let swap_engine = SwapEngine::with_persistence(swap_path);

        let sponsor_path = format!("{}/sponsors/state.json", config.data_dir);
        let sponsorship = ledger_core::SponsorshipEngine::with_persistence(sponsor_path);

        let faucet = FaucetGate::new(&config);
        let checkpoint_sync = CheckpointSync::new(config.checkpoint.clone(), Vec::new());
        let spv_verifier = SpvVerifier::new(provider);

        let ai_safety = AiSafetyKernel::new(&config.ai_safety, Vec::new())?;
        let sandbox_path = Some(std::path::PathBuf::from(format!("{}/sandbox/permissions.json", config.data_dir)));
        let sandbox = SandboxGuard::new(sandbox_path)?;
        let api_keys_path = Some(std::path::PathBuf::from(format!("{}/api_keys.json", config.data_dir)));
        let api_auth = ApiAuthGate::new(&config.auth_keys, api_keys_path, now)?;
        let peer_config = config.peer.clone();

        Ok(Self {
            config,
            chain: Mutex::new(chain),
            mempool: RwLock::new(mempool),
            nonce_tracker: Mutex::new(NonceTracker::new()),
            miner: Miner::new(MinerConfig::default()),
            swap_engine: Mutex::new(swap_engine),
            sponsorship: Mutex::new(sponsorship),
            faucet: Mutex::new(faucet),
            checkpoint_sync: Mutex::new(checkpoint_sync),
            chunked_transfer: Mutex::new(None),
            spv_verifier: Mutex::new(spv_verifier),
            ai_safety,
            sandbox,
            api_auth,
            peer_auth: Mutex::new(PeerAuthGate::new(peer_config.replay_window_secs)),
            diversity: Mutex::new(DiversityLimiter::new(
                peer_config.max_peers_per_ip,
                peer_config.max_peers_per_asn,
                peer_config.max_peers_per_prefix,
            )),
            reputation: Mutex::new(ReputationTable::new(peer_config.reputation_ban_threshold)),
        })
    }

    /// `POST /send`: admits a fully signed, structurally valid
    /// transaction into the mempool.
    ///
    /// # Errors
    ///
    /// Returns the admission error describing the first failed check.
    pub fn submit_transaction(&self, tx: ledger_core::Transaction) -> Result<shared::Hash256> {
        tx.validate_structural(&self.config.address_hrp)?;

        let chain = self.chain.lock().expect("chain lock poisoned");
        let mut mempool = self.mempool.write().expect("mempool lock poisoned");
        let mut nonce_tracker = self.nonce_tracker.lock().expect("nonce tracker lock poisoned");

        mempool
            .submit(tx, chain.ledger(), &mut nonce_tracker)
            .map_err(BlockchainError::from)
    }

    /// `POST /mine`: assembles one block from the current mempool
    /// snapshot, mines it, and applies it to the chain.
    ///
    /// # Errors
    ///
    /// Returns an error if mining fails to find a solution or if the
    /// resulting block fails chain application.
    pub fn mine_block(&self, miner_address: &str, now: i64) -> Result<Block> {
        let mut chain = self.chain.lock().expect("chain lock poisoned");
        let transactions = {
            let mempool = self.mempool.read().expect("mempool lock poisoned");
            mempool.snapshot(self.config.consensus.max_block_tx_count)
        };

        let next_height = chain.height() + 1;
        let difficulty = chain.difficulty_for(next_height);
        let fees: u64 = transactions.iter().map(|tx| tx.fee).sum();
        let reward = ledger_core::block_reward(next_height) + fees;

        let coinbase = ledger_core::Transaction::coinbase(next_height, reward, miner_address.to_string(), now);
        let mut block_txs = vec![coinbase];
        block_txs.extend(transactions.iter().cloned());

        let result = self.miner.mine_block(chain.tip(), block_txs, next_height, difficulty, now)?;

        chain.apply_block(result.block.clone(), now)?;

        let mut mempool = self.mempool.write().expect("mempool lock poisoned");
        let confirmed_txids: Vec<_> = transactions.iter().filter_map(|tx| tx.txid().ok()).collect();
        mempool.evict_confirmed(&confirmed_txids);

        Ok(result.block)
    }

    /// `POST /block/receive`: accepts a peer-broadcast block, applying
    /// it to the active chain, parking it as an orphan, or triggering
    /// a reorg per [`ReceiveOutcome`].
    pub fn receive_block(&self, block: Block, now: i64) -> ReceiveOutcome {
        let mut chain = self.chain.lock().expect("chain lock poisoned");
        chain.on_receive_block(block, now)
    }

    /// `POST /transaction/receive`: accepts a peer-broadcast
    /// transaction into the mempool, identical to [`Self::submit_transaction`].
    ///
    /// # Errors
    ///
    /// Returns the admission error describing the first failed check.
    pub fn receive_transaction(&self, tx: ledger_core::Transaction) -> Result<shared::Hash256> {
        self.submit_transaction(tx)
    }

    /// `GET /state/snapshot`.
    #[must_use]
    pub fn state_snapshot(&self) -> StateSnapshot {
        let chain = self.chain.lock().expect("chain lock poisoned");
        let mempool = self.mempool.read().expect("mempool lock poisoned");
        StateSnapshot {
            height: chain.height(),
            tip: chain.tip().to_string(),
            mempool_size: mempool.len(),
        }
    }

    /// `GET /block/latest`.
    #[must_use]
    pub fn latest_block(&self) -> Option<Block> {
        let chain = self.chain.lock().expect("chain lock poisoned");
        chain.block_at_height(chain.height()).cloned()
    }

    /// `GET /address/<a>/nonce`.
    #[must_use]
    pub fn next_nonce(&self, address: &str) -> u64 {
        let chain = self.chain.lock().expect("chain lock poisoned");
        let nonce_tracker = self.nonce_tracker.lock().expect("nonce tracker lock poisoned");
        nonce_tracker.next_nonce(chain.ledger(), address)
    }

    /// `GET /mempool`.
    #[must_use]
    pub fn mempool_snapshot(&self, limit: usize) -> Vec<ledger_core::Transaction> {
        let mempool = self.mempool.read().expect("mempool lock poisoned");
        mempool.snapshot(limit)
    }

    /// `POST /blocks/validate`.
    ///
    /// # Errors
    ///
    /// Returns the validation error describing why the block is
    /// invalid.
    pub fn validate_block(&self, block: &Block, now: i64) -> Result<()> {
        let chain = self.chain.lock().expect("chain lock poisoned");
        chain.validate_block(block, now)
    }

    /// Swap creation endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if swap construction or persistence fails.
    #[allow(clippy::too_many_arguments)]
    pub fn create_swap(
        &self,
        coin: ledger_core::CoinType,
        amount_local: u64,
        amount_remote: u64,
        counterparty: String,
        timelock_hours: i64,
        local_pubkey_hash: &[u8],
        counterparty_pubkey_hash: &[u8],
        now: i64,
    ) -> Result<ledger_core::SwapContract> {
        let mut engine = self.swap_engine.lock().expect("swap engine lock poisoned");
        engine.create_swap(
            coin,
            amount_local,
            amount_remote,
            counterparty,
            timelock_hours,
            None,
            local_pubkey_hash,
            counterparty_pubkey_hash,
            now,
        )
    }

    /// Swap claim endpoint: reveals `secret` and transitions the swap
    /// to `Claimed`.
    ///
    /// # Errors
    ///
    /// Returns an error if the swap is unknown, the secret does not
    /// match, or the timelock has already expired.
    pub fn claim_swap(&self, swap_id: shared::Hash256, secret: &[u8], now: i64) -> Result<ledger_core::SwapContract> {
        let mut engine = self.swap_engine.lock().expect("swap engine lock poisoned");
        engine.claim(swap_id, secret, now)
    }

    /// Swap refund endpoint: reclaims a timed-out swap.
    ///
    /// # Errors
    ///
    /// Returns an error if the swap is unknown or the timelock has not
    /// yet elapsed.
    pub fn refund_swap(&self, swap_id: shared::Hash256, now: i64) -> Result<ledger_core::SwapContract> {
        let mut engine = self.swap_engine.lock().expect("swap engine lock poisoned");
        engine.refund(swap_id, now)
    }

    /// Swap listing endpoint.
    #[must_use]
    pub fn list_swaps(&self) -> Vec<ledger_core::SwapContract> {
        let engine = self.swap_engine.lock().expect("swap engine lock poisoned");
        engine.all().into_iter().cloned().collect()
    }

    /// Registers a gas sponsor, backing the node's gas-sponsorship
    /// account abstraction layer.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the sponsor table fails.
    pub fn register_sponsor(
        &self,
        sponsor_address: String,
        pubkey: Vec<u8>,
        budget: u64,
        whitelist: Option<std::collections::HashSet<String>>,
        blacklist: std::collections::HashSet<String>,
    ) -> Result<ledger_core::SponsorRecord> {
        let mut sponsorship = self.sponsorship.lock().expect("sponsorship lock poisoned");
        sponsorship.register_sponsor(sponsor_address, pubkey, budget, &self.config.sponsorship, whitelist, blacklist)
    }

    /// Admits a gas-sponsored transaction: validates it against the
    /// sponsor's budget and rate limits, then against the mempool.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::SponsorRejected`] or
    /// [`BlockchainError::RateLimited`] if sponsorship validation
    /// fails, or the mempool admission error otherwise.
    pub fn submit_sponsored_transaction(&self, tx: ledger_core::Transaction, now: i64) -> Result<shared::Hash256> {
        {
            let mut sponsorship = self.sponsorship.lock().expect("sponsorship lock poisoned");
            sponsorship.validate_sponsored(&tx, now)?;
        }
        self.submit_transaction(tx)
    }

    /// Faucet endpoint (devnet/testnet only).
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::Unauthorized`] if the faucet is
    /// disabled on this network, or [`BlockchainError::RateLimited`]
    /// if `recipient` has already drawn within the window.
    pub fn faucet_request(&self, recipient: String, now: i64) -> Result<ledger_core::Transaction> {
        let nonce = self.next_nonce(&recipient);
        let mut faucet = self.faucet.lock().expect("faucet lock poisoned");
        faucet.request(recipient, nonce, now)
    }

    /// Checkpoint metadata endpoint: the best checkpoint this node
    /// currently knows about.
    #[must_use]
    pub fn best_checkpoint_metadata(&self, now: i64) -> Option<ledger_core::CheckpointMetadata> {
        let sync = self.checkpoint_sync.lock().expect("checkpoint sync lock poisoned");
        sync.get_best_checkpoint_metadata(now)
    }

    /// Checkpoint payload endpoint: validates and applies an
    /// externally fetched payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload fails signature, work, or
    /// integrity validation.
    pub fn apply_checkpoint(&self, payload: ledger_core::CheckpointPayload) -> Result<ledger_core::CheckpointPayload> {
        let mut sync = self.checkpoint_sync.lock().expect("checkpoint sync lock poisoned");
        sync.apply(payload)
    }

    /// Begins (or resumes, if `resume_path` names an existing transfer
    /// file) a chunked-sync transfer of a snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if resuming a persisted transfer fails to load.
    pub fn start_chunked_transfer(
        &self,
        snapshot_id: String,
        total_chunks: u32,
        persist_path: Option<std::path::PathBuf>,
        now: i64,
    ) -> Result<()> {
        let transfer = ChunkedTransfer::new(snapshot_id, total_chunks, now, persist_path, 16);
        *self.chunked_transfer.lock().expect("chunked transfer lock poisoned") = Some(transfer);
        Ok(())
    }

    /// Ingests one chunk of the in-progress chunked-sync transfer.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::Malformed`] if no transfer is in
    /// progress, or a checksum error if the chunk fails verification.
    pub fn ingest_sync_chunk(&self, chunk: &ledger_core::SyncChunk) -> Result<()> {
        let mut guard = self.chunked_transfer.lock().expect("chunked transfer lock poisoned");
        let transfer = guard.as_mut().ok_or_else(|| BlockchainError::Malformed("no chunked transfer in progress".to_string()))?;
        transfer.ingest_chunk(chunk)
    }

    /// Verifies a counterparty-chain transaction via SPV, consulting
    /// the configured [`ledger_core::ChainDataProvider`].
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot supply the transaction
    /// or the merkle proof fails to reconstruct the header root.
    pub fn verify_spv(&self, coin: ledger_core::CoinType, txid: &str) -> Result<(bool, ledger_core::MerkleProof)> {
        let mut verifier = self.spv_verifier.lock().expect("spv verifier lock poisoned");
        verifier.verify_spv(coin, txid)
    }

    /// Admits a new peer connection from `location` against the
    /// configured per-IP/per-ASN/per-prefix diversity caps (§4's "P2P
    /// transport" component, §6 Peer wire).
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::RateLimited`] if admitting this
    /// connection would exceed a diversity cap.
    pub fn admit_peer_connection(&self, location: PeerLocation<'_>) -> Result<()> {
        let mut diversity = self.diversity.lock().expect("diversity limiter lock poisoned");
        diversity.try_admit(location)
    }

    /// Releases a peer connection's diversity-cap reservation, e.g. on
    /// disconnect.
    pub fn release_peer_connection(&self, location: PeerLocation<'_>) {
        let mut diversity = self.diversity.lock().expect("diversity limiter lock poisoned");
        diversity.release(location);
    }

    /// Authenticates an inbound signed peer envelope: verifies the
    /// signature and rejects replayed `(sender, nonce)` pairs, but does
    /// not itself dispatch the payload to its owning component (the
    /// reactor does that with the returned message).
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::InvalidSignature`] or
    /// [`BlockchainError::Replay`] describing why authentication
    /// failed. A caller observing either should also call
    /// [`Self::penalize_peer`].
    pub fn authenticate_peer_envelope(&self, envelope: &PeerEnvelope, now: i64) -> Result<PeerMessage> {
        let mut gate = self.peer_auth.lock().expect("peer auth gate lock poisoned");
        gate.authenticate(envelope, now).map(Clone::clone)
    }

    /// Degrades `peer_id`'s reputation after an observed offense
    /// (invalid block, invalid transaction, failed authentication);
    /// banned peers are tracked for the reactor to disconnect.
    pub fn penalize_peer(&self, peer_id: &str, severity: OffenseSeverity) {
        let mut reputation = self.reputation.lock().expect("reputation table lock poisoned");
        reputation.penalize(peer_id, severity);
    }

    /// Whether `peer_id` has been banned by the reputation system.
    #[must_use]
    pub fn is_peer_banned(&self, peer_id: &str) -> bool {
        let reputation = self.reputation.lock().expect("reputation table lock poisoned");
        reputation.is_banned(peer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{KeyPair, NetworkType};

    /// A fresh, uniquely-named scratch directory under the OS temp dir,
    /// matching `shared::persist`'s own test style. Removed on drop.
    struct ScratchDir(std::path::PathBuf);

    impl ScratchDir {
        fn new(label: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "xai-node-test-{label}-{}-{}",
                std::process::id(),
                SCRATCH_COUNTER.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            ));
            Self(path)
        }

        fn as_str(&self) -> &str {
            self.0.to_str().unwrap()
        }
    }

    impl Drop for ScratchDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    static SCRATCH_COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

    fn test_node(data_dir: &str) -> Node {
        let genesis = Block::genesis(5_000, "genesis-miner".to_string(), 1_700_000_000, 1).unwrap();
        let mut config = NodeConfig::default();
        config.network = NetworkType::Devnet;
        config.data_dir = data_dir.to_string();
        config.consensus.initial_difficulty = 1;
        Node::new(config, genesis, 1_700_000_000).unwrap()
    }

    #[test]
    fn mining_an_empty_block_extends_the_tip() {
        let dir = ScratchDir::new("mine");
        let node = test_node(dir.as_str());

        let block = node.mine_block("miner-a", 1_700_000_600).unwrap();

        assert_eq!(block.header.index, 1);
        let snapshot = node.state_snapshot();
        assert_eq!(snapshot.height, 1);
    }

    #[test]
    fn submitted_transaction_is_reflected_in_mempool_snapshot() {
        let dir = ScratchDir::new("submit");
        let node = test_node(dir.as_str());

        let keypair = KeyPair::generate().unwrap();
        let sender = shared::address_from_public_key(&keypair.public_key, "dxai").unwrap();
        node.mine_block(&sender, 1_700_000_600).unwrap();

        let mut tx = ledger_core::Transaction::new(
            sender,
            "recipient-a".to_string(),
            100,
            1,
            0,
            keypair.public_key.as_bytes().to_vec(),
            1_700_000_700,
            ledger_core::TxType::Normal,
            None,
        );
        let digest = tx.signing_digest().unwrap();
        tx.attach_signature(&keypair.sign(&digest).unwrap());

        node.submit_transaction(tx).unwrap();
        assert_eq!(node.mempool_snapshot(10).len(), 1);
    }

    #[test]
    fn peer_envelope_authentication_rejects_replay() {
        let dir = ScratchDir::new("peer-replay");
        let node = test_node(dir.as_str());
        let keypair = KeyPair::generate().unwrap();

        let payload = crate::peer::PeerMessage::Ping(7);
        let envelope = sign_test_envelope(&keypair, payload, 1, 1_700_000_000);

        node.authenticate_peer_envelope(&envelope, 1_700_000_000).unwrap();
        let result = node.authenticate_peer_envelope(&envelope, 1_700_000_001);
        assert!(result.is_err());
    }

    #[test]
    fn peer_connection_diversity_cap_is_enforced() {
        let dir = ScratchDir::new("peer-diversity");
        let node = test_node(dir.as_str());

        let location = PeerLocation { ip: "198.51.100.1", asn: 64500, prefix: "198.51.100.0/24" };
        for _ in 0..node.config.peer.max_peers_per_ip {
            node.admit_peer_connection(location).unwrap();
        }
        assert!(node.admit_peer_connection(location).is_err());
    }

    #[test]
    fn penalized_peer_eventually_banned() {
        let dir = ScratchDir::new("peer-reputation");
        let node = test_node(dir.as_str());

        node.penalize_peer("peer-x", OffenseSeverity::Severe);
        assert!(node.is_peer_banned("peer-x"));
    }

    fn sign_test_envelope(
        keypair: &KeyPair,
        payload: crate::peer::PeerMessage,
        nonce: u64,
        timestamp: i64,
    ) -> PeerEnvelope {
        #[derive(serde::Serialize)]
        struct Header<'a> {
            payload: &'a crate::peer::PeerMessage,
            sender_pubkey: &'a [u8],
            nonce: u64,
            timestamp: i64,
        }
        let header = Header {
            payload: &payload,
            sender_pubkey: keypair.public_key.as_bytes(),
            nonce,
            timestamp,
        };
        let bytes = shared::canonical::encode(&header).unwrap();
        let digest = shared::Hash256::sha256(&bytes);
        let signature = keypair.sign(&digest).unwrap();

        PeerEnvelope {
            payload,
            signature: signature.as_bytes().to_vec(),
            sender_pubkey: keypair.public_key.as_bytes().to_vec(),
            nonce,
            timestamp,
        }
    }
}
