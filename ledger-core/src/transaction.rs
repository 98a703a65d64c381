//! The account-model transaction that drives the primary ledger: every
//! transfer, coinbase payout, faucet drip, sponsored send and HTLC leg
//! is one `Transaction`, distinguished by `tx_type`.

use serde::{Deserialize, Serialize};
use shared::{
    address_from_public_key, public_key_from_bytes, verify_digest, BlockchainError, Hash256,
    PublicKey, Result, Signature,
};

/// Discriminates the purpose of a transaction. Every variant shares the
/// same wire shape; `tx_type` only changes which invariants admission
/// enforces (e.g. a `Coinbase` is exempt from the `sender != recipient`
/// rule and pays no fee).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    Normal,
    Coinbase,
    Treasure,
    TimeCapsule,
    Faucet,
    HtlcFund,
    HtlcClaim,
    HtlcRefund,
}

/// Gas sponsorship attached to a transaction: the sponsor's address and
/// its signature over the sponsorship preimage (see
/// `crate::sponsorship::authorization_preimage`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasSponsor {
    pub sponsor_address: String,
    pub sponsor_signature: Vec<u8>,
}

/// A signed transfer, admitted into the mempool and ultimately included
/// in a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: String,
    pub recipient: String,
    /// Amount, fixed-point with 8 decimal places (i.e. the smallest unit
    /// is 1e-8 of the display denomination).
    pub amount: u64,
    pub fee: u64,
    pub nonce: u64,
    pub public_key: Vec<u8>,
    pub signature: Option<Vec<u8>>,
    pub timestamp: i64,
    pub tx_type: TxType,
    pub gas_sponsor: Option<GasSponsor>,
}

/// The fields that make up the signed preimage: everything except the
/// signature itself, so a signature cannot be replayed onto a
/// different transaction body.
#[derive(Serialize)]
struct SigningPreimage<'a> {
    sender: &'a str,
    recipient: &'a str,
    amount: u64,
    fee: u64,
    nonce: u64,
    public_key: &'a [u8],
    timestamp: i64,
    tx_type: TxType,
    gas_sponsor: &'a Option<GasSponsor>,
}

impl Transaction {
    /// Builds an unsigned transaction. Call [`Self::attach_signature`]
    /// before admission.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sender: String,
        recipient: String,
        amount: u64,
        fee: u64,
        nonce: u64,
        public_key: Vec<u8>,
        timestamp: i64,
        tx_type: TxType,
        gas_sponsor: Option<GasSponsor>,
    ) -> Self {
        Self {
            sender,
            recipient,
            amount,
            fee,
            nonce,
            public_key,
            signature: None,
            timestamp,
            tx_type,
            gas_sponsor,
        }
    }

    /// Builds the coinbase transaction for a block: pays `reward + fees`
    /// to `miner_address`, encoding `height` in the nonce field so
    /// coinbases across blocks never collide.
    #[must_use]
    pub fn coinbase(height: u64, reward_plus_fees: u64, miner_address: String, timestamp: i64) -> Self {
        Self {
            sender: miner_address.clone(),
            recipient: miner_address,
            amount: reward_plus_fees,
            fee: 0,
            nonce: height,
            public_key: Vec::new(),
            signature: None,
            timestamp,
            tx_type: TxType::Coinbase,
            gas_sponsor: None,
        }
    }

    /// Builds a faucet transaction crediting `recipient`. Only
    /// meaningful on devnet/testnet; admission rejects `TxType::Faucet`
    /// elsewhere.
    #[must_use]
    pub fn faucet(recipient: String, amount: u64, nonce: u64, timestamp: i64) -> Self {
        Self {
            sender: "faucet".to_string(),
            recipient,
            amount,
            fee: 0,
            nonce,
            public_key: Vec::new(),
            signature: None,
            timestamp,
            tx_type: TxType::Faucet,
            gas_sponsor: None,
        }
    }

    fn signing_preimage(&self) -> SigningPreimage<'_> {
        SigningPreimage {
            sender: &self.sender,
            recipient: &self.recipient,
            amount: self.amount,
            fee: self.fee,
            nonce: self.nonce,
            public_key: &self.public_key,
            timestamp: self.timestamp,
            tx_type: self.tx_type,
            gas_sponsor: &self.gas_sponsor,
        }
    }

    /// Computes the digest signed by the sender: SHA-256 of the
    /// canonical preimage excluding the signature field.
    ///
    /// # Errors
    ///
    /// Returns an error if the preimage cannot be canonically encoded.
    pub fn signing_digest(&self) -> Result<Hash256> {
        let bytes = shared::canonical::encode(&self.signing_preimage())?;
        Ok(Hash256::sha256(&bytes))
    }

    /// Signs the transaction in place with `signature`, which must have
    /// been produced over [`Self::signing_digest`].
    pub fn attach_signature(&mut self, signature: &Signature) {
        self.signature = Some(signature.as_bytes().to_vec());
    }

    /// The transaction identifier: SHA-256 of the canonical encoding
    /// without the signature (the same value as [`Self::signing_digest`]
    /// by construction, since both hash the unsigned preimage).
    ///
    /// # Errors
    ///
    /// Returns an error if the preimage cannot be canonically encoded.
    pub fn txid(&self) -> Result<Hash256> {
        self.signing_digest()
    }

    /// Whether this is the block's coinbase transaction.
    #[must_use]
    pub const fn is_coinbase(&self) -> bool {
        matches!(self.tx_type, TxType::Coinbase)
    }

    /// Recovers the sender's public key.
    ///
    /// # Errors
    ///
    /// Returns an error if `public_key` is not a valid compressed
    /// secp256k1 point.
    pub fn sender_public_key(&self) -> Result<PublicKey> {
        public_key_from_bytes(&self.public_key)
    }

    /// Verifies every invariant §3/§4.1 places on a transaction in
    /// isolation (not requiring chain or mempool state): address
    /// well-formedness, sender/recipient distinctness, signature
    /// validity and the `hash(public_key) == sender` binding. Does not
    /// check nonce ordering or balance, which require external state.
    ///
    /// # Errors
    ///
    /// Returns the specific [`BlockchainError`] variant describing which
    /// invariant failed.
    pub fn validate_structural(&self, address_hrp: &str) -> Result<()> {
        if self.is_coinbase() {
            if self.sender != self.recipient {
                return Err(BlockchainError::InvalidTransaction(
                    "coinbase sender must equal recipient".to_string(),
                ));
            }
            return Ok(());
        }

        if matches!(self.tx_type, TxType::Faucet) {
            return Ok(());
        }

        if self.sender == self.recipient {
            return Err(BlockchainError::InvalidTransaction(
                "sender and recipient must differ".to_string(),
            ));
        }

        let public_key = self.sender_public_key()?;
        let expected_sender = address_from_public_key(&public_key, address_hrp)?;
        if expected_sender != self.sender {
            return Err(BlockchainError::InvalidTransaction(
                "sender does not match hash of public key".to_string(),
            ));
        }

        let signature_bytes = self
            .signature
            .as_ref()
            .ok_or(BlockchainError::InvalidSignature)?;
        let signature = shared::crypto::signature_from_compact(signature_bytes, public_key)?;
        let digest = self.signing_digest()?;
        if !verify_digest(&digest, &signature, signature.public_key())? {
            return Err(BlockchainError::InvalidSignature);
        }

        Ok(())
    }

    /// Estimated wire size in bytes, used for mempool and block size caps.
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        let base = self.sender.len() + self.recipient.len() + self.public_key.len() + 64;
        base + self.signature.as_ref().map_or(0, Vec::len) + 48
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::KeyPair;

    fn signed_transfer(sender_keys: &KeyPair, sender: &str, recipient: &str, nonce: u64) -> Transaction {
        let mut tx = Transaction::new(
            sender.to_string(),
            recipient.to_string(),
            1_000,
            10,
            nonce,
            sender_keys.public_key.as_bytes().to_vec(),
            1_700_000_000,
            TxType::Normal,
            None,
        );
        let digest = tx.signing_digest().unwrap();
        let signature = sender_keys.sign(&digest).unwrap();
        tx.attach_signature(&signature);
        tx
    }

    #[test]
    fn coinbase_transaction_is_exempt_from_sender_recipient_check() {
        let tx = Transaction::coinbase(10, 5_000, "miner-address".to_string(), 1_700_000_000);
        assert!(tx.is_coinbase());
        assert!(tx.validate_structural("xai").is_ok());
    }

    #[test]
    fn signed_transfer_validates_against_its_own_public_key() {
        let keys = KeyPair::generate().unwrap();
        let address = address_from_public_key(&keys.public_key, "xai").unwrap();
        let tx = signed_transfer(&keys, &address, "someone-else", 1);

        assert!(tx.validate_structural("xai").is_ok());
    }

    #[test]
    fn tampering_with_amount_invalidates_signature() {
        let keys = KeyPair::generate().unwrap();
        let address = address_from_public_key(&keys.public_key, "xai").unwrap();
        let mut tx = signed_transfer(&keys, &address, "someone-else", 1);
        tx.amount = 999_999;

        assert!(tx.validate_structural("xai").is_err());
    }

    #[test]
    fn sender_must_differ_from_recipient_for_normal_transfers() {
        let keys = KeyPair::generate().unwrap();
        let address = address_from_public_key(&keys.public_key, "xai").unwrap();
        let tx = signed_transfer(&keys, &address, &address, 1);

        assert!(tx.validate_structural("xai").is_err());
    }

    #[test]
    fn txid_is_deterministic() {
        let keys = KeyPair::generate().unwrap();
        let address = address_from_public_key(&keys.public_key, "xai").unwrap();
        let tx = signed_transfer(&keys, &address, "someone-else", 1);

        assert_eq!(tx.txid().unwrap(), tx.txid().unwrap());
    }
}
