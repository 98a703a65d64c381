pub mod block;
pub mod blockchain;
pub mod checkpoint;
pub mod chunked_sync;
pub mod error;
pub mod faucet;
pub mod htlc;
pub mod ledger;
pub mod mempool;
pub mod mining;
pub mod script;
pub mod spv;
pub mod sponsorship;
pub mod transaction;
pub mod utxo;

pub use block::{Block, BlockHeader};
pub use blockchain::{block_reward, Chain, FinalityStatus, ReceiveOutcome};
pub use checkpoint::{CheckpointData, CheckpointMetadata, CheckpointPayload, CheckpointSync};
pub use chunked_sync::{ChunkPriority, ChunkedTransfer, SyncChunk, SyncProgress};
pub use faucet::FaucetGate;
pub use htlc::{CoinType, ExternalEvent, Protocol, SwapContract, SwapEngine, SwapState};
pub use ledger::{AccountState, Ledger, NonceTracker};
pub use mempool::{AdmissionError, Mempool};
pub use mining::{DifficultyAdjuster, Miner, MinerConfig, MiningResult};
pub use spv::{ChainDataProvider, HeaderStore, MerkleProof, SpvVerifier};
pub use sponsorship::{RateConfig, SlidingWindowLimiter, SponsorRecord, SponsorshipEngine};
pub use transaction::{GasSponsor, Transaction, TxType};
pub use utxo::{p2pkh_script, p2pkh_unlock_script, OutPoint, TxInput, TxOutput, Utxo, UtxoSet};

pub use shared::{BlockchainError, Hash256, Result};
