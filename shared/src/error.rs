use thiserror::Error;

/// Stable error kinds shared across every crate in the workspace.
///
/// Admission/validation errors are returned to the caller as-is and are
/// never retried by the core; transient I/O errors are the caller's
/// responsibility to retry with backoff.
#[derive(Error, Debug)]
pub enum BlockchainError {
    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("invalid hash")]
    InvalidHash,

    #[error("block does not meet the required proof-of-work target")]
    BelowPoWTarget,

    #[error("block header does not match expected parent/height/difficulty")]
    HeaderMismatch,

    #[error("block references an unknown parent and was parked as an orphan")]
    OrphanBlock,

    #[error("chain reorganization in progress")]
    Reorg,

    #[error("nonce replay: transaction nonce already confirmed")]
    Replay,

    #[error("nonce too far ahead of the next expected nonce")]
    FutureNonce,

    #[error("fee below configured minimum")]
    BelowMinFee,

    #[error("duplicate transaction")]
    Duplicate,

    #[error("account or UTXO not found")]
    UtxoNotFound,

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid key size: expected {expected}, got {actual}")]
    InvalidKeySize { expected: usize, actual: usize },

    #[error("cryptographic error: {0}")]
    CryptographicError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("sponsor rejected the transaction: {0}")]
    SponsorRejected(String),

    #[error("invalid swap state transition")]
    SwapTransitionInvalid,

    #[error("unsupported swap protocol")]
    UnsupportedProtocol,

    #[error("SPV proof does not reconstruct the header merkle root")]
    SpvInvalidProof,

    #[error("insufficient confirmations")]
    InsufficientConfirmations,

    #[error("checkpoint did not reach peer quorum")]
    CheckpointQuorumFailed,

    #[error("checkpoint signature invalid or untrusted signer")]
    CheckpointSignatureInvalid,

    #[error("chunk checksum mismatch")]
    ChunkChecksumMismatch,

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("unauthorized")]
    Unauthorized,

    #[error("emergency stop is active")]
    EmergencyStopActive,

    #[error("upstream provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("persistence error: {0}")]
    PersistenceError(String),

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("mining exhausted the nonce space without finding a solution")]
    MiningExhausted,
}
