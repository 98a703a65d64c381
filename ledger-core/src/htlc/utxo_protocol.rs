//! The UTXO-family HTLC leg (BTC, LTC, DOGE, BCH, ZEC, DASH): redeem
//! script construction and P2WSH address derivation (§4.3).
//!
//! The redeem script is the conventional cross-chain HTLC form:
//!
//! ```text
//! OP_IF
//!     OP_SHA256 <secret_hash> OP_EQUALVERIFY <recipient_pubkey_hash> OP_CHECKSIG
//! OP_ELSE
//!     <locktime> OP_CHECKLOCKTIMEVERIFY OP_DROP <sender_pubkey_hash> OP_CHECKSIG
//! OP_ENDIF
//! ```
//!
//! This node never executes UTXO-chain scripts itself — counterparty
//! chains do that — so the script is built as a plain byte string
//! whose hash becomes the P2WSH program. Claim/refund happen on the
//! counterparty chain and are observed back via SPV ([`crate::spv`]).

use bech32::{ToBase32, Variant};
use serde::{Deserialize, Serialize};
use shared::{BlockchainError, Hash256, Result};

const OP_IF: u8 = 0x63;
const OP_ELSE: u8 = 0x67;
const OP_ENDIF: u8 = 0x68;
const OP_SHA256: u8 = 0xa8;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;
const OP_DROP: u8 = 0x75;

/// The artifact needed to fund and later spend the UTXO-family leg of
/// a swap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtxoHtlcArtifact {
    pub redeem_script: Vec<u8>,
    pub witness_program_address: String,
}

fn push(script: &mut Vec<u8>, data: &[u8]) {
    script.push(u8::try_from(data.len()).unwrap_or(u8::MAX));
    script.extend_from_slice(data);
}

/// Builds the HTLC redeem script for `secret_hash`, payable to
/// `recipient_pubkey_hash` on claim or back to `sender_pubkey_hash`
/// after `locktime_unix` on refund.
#[must_use]
pub fn build_redeem_script(
    secret_hash: &Hash256,
    recipient_pubkey_hash: &[u8],
    sender_pubkey_hash: &[u8],
    locktime_unix: i64,
) -> Vec<u8> {
    let mut script = Vec::new();
    script.push(OP_IF);
    script.push(OP_SHA256);
    push(&mut script, secret_hash.as_bytes());
    script.push(OP_EQUALVERIFY);
    push(&mut script, recipient_pubkey_hash);
    script.push(OP_CHECKSIG);
    script.push(OP_ELSE);
    push(&mut script, &locktime_unix.to_le_bytes());
    script.push(OP_CHECKLOCKTIMEVERIFY);
    script.push(OP_DROP);
    push(&mut script, sender_pubkey_hash);
    script.push(OP_CHECKSIG);
    script.push(OP_ENDIF);
    script
}

/// Encodes a witness-v0 P2WSH address: bech32 over a version-0 `u5`
/// symbol followed by the base32 of `SHA256(redeem_script)`.
///
/// # Errors
///
/// Returns an error if `hrp` contains characters outside the bech32
/// charset.
pub fn witness_address(redeem_script: &[u8], hrp: &str) -> Result<String> {
    let program_hash = Hash256::sha256(redeem_script);
    let version =
        bech32::u5::try_from_u8(0).map_err(|e| BlockchainError::CryptographicError(e.to_string()))?;

    let mut data = vec![version];
    data.extend(program_hash.as_bytes().to_base32());

    bech32::encode(hrp, data, Variant::Bech32).map_err(|e| BlockchainError::CryptographicError(e.to_string()))
}

/// Builds the full artifact for a UTXO-family swap leg.
///
/// # Errors
///
/// Returns an error if address encoding fails.
pub fn build_artifact(
    secret_hash: &Hash256,
    recipient_pubkey_hash: &[u8],
    sender_pubkey_hash: &[u8],
    locktime_unix: i64,
    hrp: &str,
) -> Result<UtxoHtlcArtifact> {
    let redeem_script = build_redeem_script(secret_hash, recipient_pubkey_hash, sender_pubkey_hash, locktime_unix);
    let witness_program_address = witness_address(&redeem_script, hrp)?;
    Ok(UtxoHtlcArtifact {
        redeem_script,
        witness_program_address,
    })
}

/// The claim witness stack: `[sig, secret, 1, redeem_script]`. `1`
/// selects the `OP_IF` branch.
#[must_use]
pub fn claim_witness(sig: &[u8], secret: &[u8], redeem_script: &[u8]) -> Vec<Vec<u8>> {
    vec![sig.to_vec(), secret.to_vec(), vec![1], redeem_script.to_vec()]
}

/// The refund witness stack: `[sig, 0, redeem_script]`. `0` selects the
/// `OP_ELSE` branch.
#[must_use]
pub fn refund_witness(sig: &[u8], redeem_script: &[u8]) -> Vec<Vec<u8>> {
    vec![sig.to_vec(), vec![0], redeem_script.to_vec()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redeem_script_contains_secret_hash_and_pubkey_hashes() {
        let secret_hash = Hash256::sha256(b"preimage");
        let script = build_redeem_script(&secret_hash, &[1u8; 20], &[2u8; 20], 1_700_000_000);

        assert!(script.windows(32).any(|w| w == secret_hash.as_bytes()));
        assert_eq!(script[0], OP_IF);
        assert_eq!(*script.last().unwrap(), OP_ENDIF);
    }

    #[test]
    fn witness_address_is_deterministic_and_hrp_sensitive() {
        let script = build_redeem_script(&Hash256::sha256(b"x"), &[1u8; 20], &[2u8; 20], 1_700_000_000);

        let address_a = witness_address(&script, "xai").unwrap();
        let address_b = witness_address(&script, "xai").unwrap();
        let address_testnet = witness_address(&script, "txai").unwrap();

        assert_eq!(address_a, address_b);
        assert_ne!(address_a, address_testnet);
        assert!(address_a.starts_with("xai1"));
    }

    #[test]
    fn claim_and_refund_witnesses_select_opposite_branches() {
        let script = build_redeem_script(&Hash256::sha256(b"x"), &[1u8; 20], &[2u8; 20], 1_700_000_000);
        let claim = claim_witness(b"sig", b"secret", &script);
        let refund = refund_witness(b"sig", &script);

        assert_eq!(claim[2], vec![1]);
        assert_eq!(refund[1], vec![0]);
    }
}
