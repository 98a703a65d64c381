use shared::BlockchainError;
use std::fmt;

/// Error type local to the UTXO script engine, where a `shared::BlockchainError`
/// is usually too coarse (script failures need their own message shape).
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerError {
    /// Script execution failed (stack underflow, bad opcode, oversized script).
    ScriptError(String),
    /// Referenced transaction or UTXO does not exist.
    TransactionNotFound(String),
    /// Transaction failed structural or policy validation.
    InvalidTransaction(String),
    /// Block failed structural or consensus validation.
    InvalidBlock(String),
    /// A cryptographic operation failed.
    CryptoError(String),
    /// A generic validation check failed.
    ValidationError(String),
    /// (De)serialization failed.
    SerializationError(String),
    /// Catch-all for errors without a more specific variant.
    Other(String),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScriptError(msg) => write!(f, "script error: {msg}"),
            Self::TransactionNotFound(msg) => write!(f, "transaction not found: {msg}"),
            Self::InvalidTransaction(msg) => write!(f, "invalid transaction: {msg}"),
            Self::InvalidBlock(msg) => write!(f, "invalid block: {msg}"),
            Self::CryptoError(msg) => write!(f, "crypto error: {msg}"),
            Self::ValidationError(msg) => write!(f, "validation error: {msg}"),
            Self::SerializationError(msg) => write!(f, "serialization error: {msg}"),
            Self::Other(msg) => write!(f, "error: {msg}"),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<BlockchainError> for LedgerError {
    fn from(err: BlockchainError) -> Self {
        match err {
            BlockchainError::InvalidTransaction(msg) => Self::InvalidTransaction(msg),
            BlockchainError::InvalidBlock(msg) => Self::InvalidBlock(msg),
            BlockchainError::CryptographicError(msg) => Self::CryptoError(msg),
            BlockchainError::SerializationError(msg) => Self::SerializationError(msg),
            BlockchainError::InsufficientFunds => {
                Self::InvalidTransaction("insufficient funds".to_string())
            }
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<LedgerError> for BlockchainError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InvalidTransaction(msg) => Self::InvalidTransaction(msg),
            LedgerError::InvalidBlock(msg) => Self::InvalidBlock(msg),
            LedgerError::CryptoError(msg) => Self::CryptographicError(msg),
            LedgerError::SerializationError(msg) => Self::SerializationError(msg),
            LedgerError::TransactionNotFound(_) => Self::UtxoNotFound,
            LedgerError::ScriptError(msg) | LedgerError::ValidationError(msg) | LedgerError::Other(msg) => {
                Self::Malformed(msg)
            }
        }
    }
}

/// Alias for a `Result` using [`LedgerError`].
pub type LedgerResult<T> = std::result::Result<T, LedgerError>;
