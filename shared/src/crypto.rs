//! ECDSA (secp256k1) signing, verification and bech32 address derivation.

use crate::{BlockchainError, Hash256, Result};
use bech32::{ToBase32, Variant};
use secp256k1::ecdsa::Signature as EcdsaSignature;
use secp256k1::{Message, PublicKey as SecpPublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// Signature algorithms supported by the node. secp256k1 is the only
/// algorithm accepted by consensus; the enum exists so serialized
/// payloads are self-describing and a future algorithm can be added
/// without breaking the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    Secp256k1Ecdsa,
}

/// A compressed secp256k1 public key (33 bytes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    key_data: Vec<u8>,
    algorithm: SignatureAlgorithm,
}

/// A secp256k1 private scalar (32 bytes). Zeroized on drop.
#[derive(Debug, Clone)]
pub struct PrivateKey {
    key_data: Vec<u8>,
    algorithm: SignatureAlgorithm,
}

/// A public/private secp256k1 keypair.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public_key: PublicKey,
    pub private_key: PrivateKey,
}

/// An ECDSA signature bound to the public key that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    data: Vec<u8>,
    public_key: PublicKey,
    algorithm: SignatureAlgorithm,
}

impl PublicKey {
    /// Creates a public key from its compressed (33-byte) encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes do not decode to a valid curve point.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        SecpPublicKey::from_slice(&bytes)
            .map_err(|e| BlockchainError::CryptographicError(e.to_string()))?;
        Ok(Self {
            key_data: bytes,
            algorithm: SignatureAlgorithm::Secp256k1Ecdsa,
        })
    }

    /// Returns the raw compressed bytes of the public key.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.key_data
    }

    /// Returns the signature algorithm used by this key.
    #[must_use]
    pub const fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    fn to_secp(&self) -> std::result::Result<SecpPublicKey, secp256k1::Error> {
        SecpPublicKey::from_slice(&self.key_data)
    }
}

impl PrivateKey {
    /// Creates a `PrivateKey` from its raw 32-byte scalar.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid secp256k1 scalar.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        SecretKey::from_slice(&bytes)
            .map_err(|e| BlockchainError::CryptographicError(e.to_string()))?;
        Ok(Self {
            key_data: bytes,
            algorithm: SignatureAlgorithm::Secp256k1Ecdsa,
        })
    }

    /// Returns the raw bytes of the private scalar.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.key_data
    }

    /// Returns the signature algorithm used by this key.
    #[must_use]
    pub const fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    fn to_secp(&self) -> std::result::Result<SecretKey, secp256k1::Error> {
        SecretKey::from_slice(&self.key_data)
    }
}

impl KeyPair {
    /// Generates a new random secp256k1 keypair.
    ///
    /// # Errors
    ///
    /// Returns an error if the generated material is rejected by the
    /// curve (practically unreachable, kept for interface symmetry with
    /// the rest of the crate).
    pub fn generate() -> Result<Self> {
        let secp = Secp256k1::new();
        let mut rng = rand::thread_rng();
        let (secret_key, public_key) = secp.generate_keypair(&mut rng);

        let private_key = PrivateKey::from_bytes(secret_key.secret_bytes().to_vec())?;
        let public_key = PublicKey::from_bytes(public_key.serialize().to_vec())?;

        Ok(Self {
            public_key,
            private_key,
        })
    }

    /// Derives a keypair from an existing 32-byte private scalar.
    ///
    /// # Errors
    ///
    /// Returns an error if `secret_bytes` is not a valid scalar.
    pub fn from_private_bytes(secret_bytes: &[u8]) -> Result<Self> {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::from_slice(secret_bytes)
            .map_err(|e| BlockchainError::CryptographicError(e.to_string()))?;
        let public_key = SecpPublicKey::from_secret_key(&secp, &secret_key);

        Ok(Self {
            public_key: PublicKey::from_bytes(public_key.serialize().to_vec())?,
            private_key: PrivateKey::from_bytes(secret_key.secret_bytes().to_vec())?,
        })
    }

    /// Signs a 32-byte digest, producing a signature bound to this
    /// keypair's public key.
    ///
    /// # Errors
    ///
    /// Returns an error if either key is malformed.
    pub fn sign(&self, digest: &Hash256) -> Result<Signature> {
        sign_digest(digest, &self.private_key, &self.public_key)
    }
}

impl Signature {
    /// Verifies the signature against a 32-byte digest.
    ///
    /// # Errors
    ///
    /// Returns an error if the signature or public key bytes are malformed.
    pub fn verify(&self, digest: &Hash256) -> Result<bool> {
        verify_digest(digest, self, &self.public_key)
    }

    /// Returns the public key bound to this signature.
    #[must_use]
    pub const fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Returns the signature algorithm.
    #[must_use]
    pub const fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    /// Returns the compact (64-byte) encoding of the signature.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Returns the size in bytes of this signature.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.data.len()
    }
}

impl Zeroize for PrivateKey {
    fn zeroize(&mut self) {
        self.key_data.zeroize();
    }
}

impl Drop for PrivateKey {
    fn drop(&mut self) {
        self.zeroize();
    }
}

/// Signs a 32-byte digest with `private_key`, stamping the signature with
/// `public_key` so verifiers never need a separate key lookup.
///
/// # Errors
///
/// Returns an error if either key is malformed.
pub fn sign_digest(
    digest: &Hash256,
    private_key: &PrivateKey,
    public_key: &PublicKey,
) -> Result<Signature> {
    let secp = Secp256k1::new();
    let secret_key = private_key
        .to_secp()
        .map_err(|e| BlockchainError::CryptographicError(e.to_string()))?;
    let message = Message::from_digest(*digest.as_bytes());
    let signature = secp.sign_ecdsa(&message, &secret_key);

    Ok(Signature {
        data: signature.serialize_compact().to_vec(),
        public_key: public_key.clone(),
        algorithm: SignatureAlgorithm::Secp256k1Ecdsa,
    })
}

/// Verifies `signature` against `digest` using `public_key`.
///
/// # Errors
///
/// Returns an error if the signature or public key bytes are malformed.
pub fn verify_digest(
    digest: &Hash256,
    signature: &Signature,
    public_key: &PublicKey,
) -> Result<bool> {
    let secp = Secp256k1::new();
    let secp_public_key = public_key
        .to_secp()
        .map_err(|e| BlockchainError::CryptographicError(e.to_string()))?;
    let ecdsa_signature = EcdsaSignature::from_compact(&signature.data)
        .map_err(|e| BlockchainError::CryptographicError(e.to_string()))?;
    let message = Message::from_digest(*digest.as_bytes());

    Ok(secp
        .verify_ecdsa(&message, &ecdsa_signature, &secp_public_key)
        .is_ok())
}

/// Reconstructs a [`Signature`] from its compact (64-byte) encoding and
/// the public key it is claimed to belong to. Used by callers (such as
/// the UTXO script VM) that receive detached signature/pubkey pairs
/// off the wire rather than a serialized `Signature`.
///
/// # Errors
///
/// Returns an error if `compact_bytes` is not a valid 64-byte compact
/// ECDSA signature.
pub fn signature_from_compact(compact_bytes: &[u8], public_key: PublicKey) -> Result<Signature> {
    EcdsaSignature::from_compact(compact_bytes)
        .map_err(|e| BlockchainError::CryptographicError(e.to_string()))?;
    Ok(Signature {
        data: compact_bytes.to_vec(),
        public_key,
        algorithm: SignatureAlgorithm::Secp256k1Ecdsa,
    })
}

/// Creates a public key from raw compressed bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not a valid curve point.
pub fn public_key_from_bytes(bytes: &[u8]) -> Result<PublicKey> {
    PublicKey::from_bytes(bytes.to_vec())
}

/// Derives the node's bech32 address from a public key, using `hrp` as
/// the human-readable part (e.g. `"xai"` on mainnet, `"txai"` on
/// testnet). The address payload is the first 20 bytes of the SHA-256
/// digest of the compressed public key, mirroring the hash160-style
/// pubkey-hash addressing used by UTXO-family chains.
///
/// # Errors
///
/// Returns an error if bech32 encoding fails (e.g. `hrp` contains
/// characters outside the bech32 charset).
pub fn address_from_public_key(public_key: &PublicKey, hrp: &str) -> Result<String> {
    let digest = Hash256::sha256(public_key.as_bytes());
    let payload = &digest.as_bytes()[..20];
    bech32::encode(hrp, payload.to_base32(), Variant::Bech32)
        .map_err(|e| BlockchainError::CryptographicError(e.to_string()))
}

/// Whether `address` is well-formed bech32, independent of which `hrp`
/// it carries. Used to reject obviously malformed `--miner`/address
/// CLI arguments before they reach consensus code.
#[must_use]
pub fn is_valid_address(address: &str) -> bool {
    bech32::decode(address).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secp256k1_sign_and_verify_round_trips() {
        let keypair = KeyPair::generate().unwrap();
        let digest = Hash256::sha256(b"xai node consensus digest");

        let signature = keypair.sign(&digest).unwrap();
        assert!(signature.verify(&digest).unwrap());
        assert_eq!(signature.size(), 64);
    }

    #[test]
    fn verification_fails_for_wrong_digest() {
        let keypair = KeyPair::generate().unwrap();
        let digest = Hash256::sha256(b"original message");
        let other_digest = Hash256::sha256(b"tampered message");

        let signature = keypair.sign(&digest).unwrap();
        assert!(!signature.verify(&other_digest).unwrap());
    }

    #[test]
    fn verification_fails_for_wrong_public_key() {
        let keypair_a = KeyPair::generate().unwrap();
        let keypair_b = KeyPair::generate().unwrap();
        let digest = Hash256::sha256(b"message");

        let signature = keypair_a.sign(&digest).unwrap();
        assert!(!verify_digest(&digest, &signature, &keypair_b.public_key).unwrap());
    }

    #[test]
    fn address_from_public_key_is_deterministic_bech32() {
        let keypair = KeyPair::generate().unwrap();
        let address_a = address_from_public_key(&keypair.public_key, "xai").unwrap();
        let address_b = address_from_public_key(&keypair.public_key, "xai").unwrap();
        assert_eq!(address_a, address_b);
        assert!(address_a.starts_with("xai1"));
    }

    #[test]
    fn from_private_bytes_recovers_matching_public_key() {
        let keypair = KeyPair::generate().unwrap();
        let recovered = KeyPair::from_private_bytes(keypair.private_key.as_bytes()).unwrap();
        assert_eq!(recovered.public_key, keypair.public_key);
    }

    #[test]
    fn is_valid_address_accepts_derived_addresses_and_rejects_garbage() {
        let keypair = KeyPair::generate().unwrap();
        let address = address_from_public_key(&keypair.public_key, "xai").unwrap();
        assert!(is_valid_address(&address));
        assert!(!is_valid_address("not-a-bech32-address"));
    }
}
