//! Types shared between every crate in the workspace.

use serde::{Deserialize, Serialize};

/// Alias for a transaction identifier.
pub type TxId = crate::Hash256;

/// Alias for a block identifier.
pub type BlockId = crate::Hash256;

/// Alias for a public key encoded as a hex string.
pub type PublicKeyHex = String;

/// Alias for a signature encoded as a hex string.
pub type SignatureHex = String;

/// Monetary amount, expressed as an integer count of the smallest unit
/// (8 decimal places), matching the fixed-point convention used by the
/// ledger and the HTLC swap engine.
pub type Amount = u64;

/// Unix timestamp, seconds.
pub type Timestamp = i64;

/// Block height in the chain.
pub type BlockHeight = u64;

/// Output index within a transaction.
pub type OutputIndex = u32;

/// Input index within a transaction.
pub type InputIndex = u32;

/// Reference to a transaction output (used by the UTXO leg of the HTLC
/// swap engine).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    /// Hash of the transaction that contains the output.
    pub txid: TxId,
    /// Index of the output within the transaction.
    pub vout: OutputIndex,
}

impl OutPoint {
    /// Creates a new transaction output reference.
    #[must_use]
    pub const fn new(txid: TxId, vout: OutputIndex) -> Self {
        Self { txid, vout }
    }
}

/// Network environment the node is configured for.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkType {
    /// Main production network.
    Mainnet,
    /// Public test network.
    Testnet,
    /// Local development network.
    #[default]
    Devnet,
    /// Regression network for deterministic tests.
    Regtest,
}

impl NetworkType {
    /// Returns the bech32 human-readable prefix conventionally used for
    /// addresses on this network.
    #[must_use]
    pub const fn default_hrp(self) -> &'static str {
        match self {
            Self::Mainnet => "xai",
            Self::Testnet => "txai",
            Self::Devnet => "dxai",
            Self::Regtest => "rxai",
        }
    }
}

/// Proof-of-work and consensus parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Whether proof-of-work validation is enforced. Disabled only on
    /// regtest, where blocks are accepted regardless of hash target.
    pub pow_enabled: bool,
    /// Starting difficulty (leading zero bits required).
    pub initial_difficulty: u32,
    /// Number of blocks between difficulty retargets.
    pub retarget_interval: u64,
    /// Target number of seconds a retarget interval should take.
    pub target_block_time_secs: u64,
    /// Maximum multiplicative adjustment applied to difficulty in a
    /// single retarget, in either direction.
    pub max_retarget_factor: f64,
    /// Number of confirmations after which a block is considered final
    /// and no longer subject to reorg.
    pub finality_depth: u64,
    /// Maximum allowed clock skew, in seconds, for a block's timestamp
    /// relative to the local clock.
    pub max_clock_skew_secs: i64,
    /// Maximum number of transactions in a single block.
    pub max_block_tx_count: usize,
    /// Maximum serialized size of a block, in bytes.
    pub max_block_size_bytes: usize,
    /// Maximum gap between an admitted transaction's nonce and the
    /// sender's next expected nonce.
    pub max_nonce_gap: u64,
    /// Minimum fee accepted into the mempool.
    pub min_fee: Amount,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            pow_enabled: true,
            initial_difficulty: 16,
            retarget_interval: 2016,
            target_block_time_secs: 600,
            max_retarget_factor: 4.0,
            finality_depth: 6,
            max_clock_skew_secs: 7200,
            max_block_tx_count: 4096,
            max_block_size_bytes: 4 * 1024 * 1024,
            max_nonce_gap: 64,
            min_fee: 1,
        }
    }
}

/// Checkpoint/partial-sync protocol parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Minimum distinct peers that must advertise the same
    /// `(block_hash, state_hash)` before it is accepted.
    pub quorum: usize,
    /// Minimum number of distinct peer identities contributing to a
    /// quorum (defends against a Sybil cluster of puppets).
    pub min_peer_diversity: usize,
    /// Minimum seconds between repeated checkpoint requests to the same
    /// peer.
    pub request_rate_seconds: u64,
    /// Size, in bytes, of a single chunk of a chunked-sync transfer.
    pub chunk_size_bytes: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            quorum: 3,
            min_peer_diversity: 3,
            request_rate_seconds: 30,
            chunk_size_bytes: 1024 * 1024,
        }
    }
}

/// Gas sponsorship defaults applied to newly registered sponsors unless
/// overridden by an explicit `rate_config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SponsorshipConfig {
    /// Default maximum gas (fee) for a single sponsored transaction.
    pub default_max_gas_per_transaction: Amount,
    /// Default maximum total cost for a single sponsored transaction.
    pub default_max_cost_per_transaction: Amount,
    /// Default per-second sponsored transaction count cap.
    pub default_per_second_count_cap: u32,
    /// Default per-minute sponsored transaction count cap.
    pub default_per_minute_count_cap: u32,
    /// Default per-hour sponsored transaction count cap.
    pub default_per_hour_count_cap: u32,
    /// Default per-day sponsored transaction count cap.
    pub default_per_day_count_cap: u32,
}

impl Default for SponsorshipConfig {
    fn default() -> Self {
        Self {
            default_max_gas_per_transaction: 10_000,
            default_max_cost_per_transaction: 1_000_000,
            default_per_second_count_cap: 5,
            default_per_minute_count_cap: 60,
            default_per_hour_count_cap: 1_000,
            default_per_day_count_cap: 10_000,
        }
    }
}

/// AI safety kernel rate-limit and persistence parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiSafetyConfig {
    /// Path to the file backing persisted per-identifier rate limits.
    pub rate_limit_path: String,
    /// Default daily token budget per identifier, absent an explicit
    /// override.
    pub default_daily_token_budget: u64,
    /// How long an idle rate-limit entry is kept before being pruned.
    pub entry_ttl_secs: u64,
    /// Default timeout applied to upstream provider calls.
    pub default_provider_timeout_secs: u64,
}

impl Default for AiSafetyConfig {
    fn default() -> Self {
        Self {
            rate_limit_path: "./data/ai_safety_rate_limits.json".to_string(),
            default_daily_token_budget: 1_000_000,
            entry_ttl_secs: 30 * 24 * 3600,
            default_provider_timeout_secs: 30,
        }
    }
}

/// P2P transport parameters (§4's "P2P transport" component, §6 Peer
/// wire): the signed-envelope replay window, per-scope diversity caps,
/// and the reputation threshold at which a peer is banned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// How long a `(sender, nonce)` pair is remembered for replay
    /// rejection.
    pub replay_window_secs: i64,
    /// Maximum simultaneous peer connections from a single IP address.
    pub max_peers_per_ip: usize,
    /// Maximum simultaneous peer connections from a single ASN.
    pub max_peers_per_asn: usize,
    /// Maximum simultaneous peer connections from a single routing
    /// prefix (e.g. a `/24`).
    pub max_peers_per_prefix: usize,
    /// Reputation score at or below which a peer is banned.
    pub reputation_ban_threshold: i64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            replay_window_secs: 300,
            max_peers_per_ip: 3,
            max_peers_per_asn: 8,
            max_peers_per_prefix: 12,
            reputation_ban_threshold: 0,
        }
    }
}

/// Top-level node configuration, built once at startup from defaults
/// overridden by environment variables and CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Network environment.
    pub network: NetworkType,
    /// Bech32 human-readable address prefix for this network.
    pub address_hrp: String,
    /// P2P listen port.
    pub p2p_port: u16,
    /// RPC/API listen port.
    pub rpc_port: u16,
    /// Bind address for both listeners.
    pub bind_address: String,
    /// Initial peers to dial at startup.
    pub bootstrap_peers: Vec<String>,
    /// Directory holding chain state, swap state, checkpoints and the
    /// rate-limit file.
    pub data_dir: String,
    /// Amount credited by a faucet-type transaction on networks where
    /// the faucet is enabled (devnet/testnet only).
    pub faucet_amount: Amount,
    /// API keys accepted by the authentication gate.
    pub auth_keys: Vec<String>,
    /// Consensus parameters.
    pub consensus: ConsensusConfig,
    /// Checkpoint sync parameters.
    pub checkpoint: CheckpointConfig,
    /// Sponsorship defaults.
    pub sponsorship: SponsorshipConfig,
    /// AI safety kernel parameters.
    pub ai_safety: AiSafetyConfig,
    /// P2P transport parameters.
    pub peer: PeerConfig,
    /// API key for the counterparty-chain block explorer consulted by
    /// SPV verification (e.g. Etherscan for the Ethereum HTLC leg).
    /// `None` disables live cross-chain lookups.
    pub etherscan_api_key: Option<String>,
    /// Per-provider daily token budget overrides for the AI safety
    /// kernel, keyed by provider name, parsed from a JSON object.
    pub provider_daily_token_budgets: std::collections::HashMap<String, u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let network = NetworkType::Devnet;
        Self {
            address_hrp: network.default_hrp().to_string(),
            network,
            p2p_port: 8333,
            rpc_port: 8332,
            bind_address: "127.0.0.1".to_string(),
            bootstrap_peers: vec![],
            data_dir: "./data".to_string(),
            faucet_amount: 100_000_000,
            auth_keys: vec![],
            consensus: ConsensusConfig::default(),
            checkpoint: CheckpointConfig::default(),
            sponsorship: SponsorshipConfig::default(),
            ai_safety: AiSafetyConfig::default(),
            peer: PeerConfig::default(),
            etherscan_api_key: None,
            provider_daily_token_budgets: std::collections::HashMap::new(),
        }
    }
}

impl NodeConfig {
    /// Builds a configuration from defaults, overridden by environment
    /// variables where present: `XAI_HOST`, `XAI_PORT`, `XAI_AUTH_KEYS`
    /// (comma-separated), `XAI_AI_SAFETY_RATE_LIMIT_PATH`,
    /// `XAI_ETHERSCAN_API_KEY`, and `XAI_PROVIDER_RATE_LIMITS_JSON` (a
    /// JSON object mapping provider name to daily token budget).
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("XAI_HOST") {
            config.bind_address = host;
        }
        if let Ok(port) = std::env::var("XAI_PORT") {
            if let Ok(parsed) = port.parse() {
                config.rpc_port = parsed;
            }
        }
        if let Ok(keys) = std::env::var("XAI_AUTH_KEYS") {
            config.auth_keys = keys
                .split(',')
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(path) = std::env::var("XAI_AI_SAFETY_RATE_LIMIT_PATH") {
            config.ai_safety.rate_limit_path = path;
        }
        if let Ok(key) = std::env::var("XAI_ETHERSCAN_API_KEY") {
            config.etherscan_api_key = Some(key);
        }
        if let Ok(raw) = std::env::var("XAI_PROVIDER_RATE_LIMITS_JSON") {
            if let Ok(parsed) = serde_json::from_str::<std::collections::HashMap<String, u64>>(&raw) {
                config.provider_daily_token_budgets = parsed;
            }
        }

        config
    }
}

/// Snapshot of the chain's aggregate state, surfaced over RPC and to
/// peers during checkpoint advertisement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockchainStats {
    /// Current chain height.
    pub height: BlockHeight,
    /// Hash of the current tip block.
    pub tip_hash: BlockId,
    /// Total number of confirmed transactions.
    pub total_transactions: u64,
    /// Total number of unspent outputs tracked by the UTXO set.
    pub total_utxos: u64,
    /// Current proof-of-work difficulty.
    pub current_difficulty: u32,
    /// Timestamp of the tip block.
    pub last_block_time: Timestamp,
    /// Estimated network hash rate, derived from recent block spacing.
    pub estimated_hash_rate: f64,
}

impl Default for BlockchainStats {
    fn default() -> Self {
        Self {
            height: 0,
            tip_hash: crate::Hash256::zero(),
            total_transactions: 0,
            total_utxos: 0,
            current_difficulty: 1,
            last_block_time: 0,
            estimated_hash_rate: 0.0,
        }
    }
}

/// Information about a connected or recently seen P2P peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Unique peer identifier.
    pub peer_id: String,
    /// Network address of the peer.
    pub address: String,
    /// Peer's last-reported chain height.
    pub height: BlockHeight,
    /// Wire protocol version spoken by the peer.
    pub protocol_version: u32,
    /// Timestamp of the last message received from the peer.
    pub last_seen: Timestamp,
    /// Whether the peer is currently connected.
    pub connected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outpoint_creation_roundtrips_fields() {
        let txid = crate::Hash256::zero();
        let vout = 0;
        let outpoint = OutPoint::new(txid, vout);

        assert_eq!(outpoint.txid, txid);
        assert_eq!(outpoint.vout, vout);
    }

    #[test]
    fn node_config_defaults_match_devnet_hrp() {
        let config = NodeConfig::default();

        assert_eq!(config.network, NetworkType::Devnet);
        assert_eq!(config.address_hrp, "dxai");
        assert_eq!(config.p2p_port, 8333);
        assert_eq!(config.rpc_port, 8332);
        assert_eq!(config.bind_address, "127.0.0.1");
    }

    #[test]
    fn node_config_from_env_overrides_defaults() {
        std::env::set_var("XAI_HOST", "0.0.0.0");
        std::env::set_var("XAI_PORT", "9000");
        std::env::set_var("XAI_AUTH_KEYS", "key-a, key-b");

        let config = NodeConfig::from_env();

        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.rpc_port, 9000);
        assert_eq!(config.auth_keys, vec!["key-a".to_string(), "key-b".to_string()]);

        std::env::remove_var("XAI_HOST");
        std::env::remove_var("XAI_PORT");
        std::env::remove_var("XAI_AUTH_KEYS");
    }

    #[test]
    fn blockchain_stats_default_is_genesis() {
        let stats = BlockchainStats::default();

        assert_eq!(stats.height, 0);
        assert_eq!(stats.total_transactions, 0);
        assert_eq!(stats.total_utxos, 0);
    }
}
