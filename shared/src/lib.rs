pub mod canonical;
pub mod crypto;
pub mod error;
pub mod hash;
pub mod persist;
pub mod types;

pub use crypto::{
    address_from_public_key, is_valid_address, public_key_from_bytes, sign_digest, verify_digest, KeyPair,
    PrivateKey, PublicKey, Signature,
};
pub use error::BlockchainError;
pub use hash::Hash256;
pub use types::{
    AiSafetyConfig, CheckpointConfig, ConsensusConfig, NetworkType, NodeConfig, PeerConfig, SponsorshipConfig,
};

pub type Result<T> = std::result::Result<T, BlockchainError>;
