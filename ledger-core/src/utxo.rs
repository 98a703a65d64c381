//! UTXO primitives backing the HTLC atomic-swap leg. The node's primary
//! ledger is account-based (see [`crate::ledger`]); this module models
//! the UTXO-family side of a cross-chain swap, where funding, claim and
//! refund transactions spend and create discrete outputs locked by a
//! script (see [`crate::script`]).

use crate::script::{OpCode, ScriptBuilder};
use serde::{Deserialize, Serialize};
use shared::{BlockchainError, Hash256, Result};

/// Identifier of a transaction output: the transaction hash plus the
/// index of the output within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Hash256,
    pub vout: u32,
}

impl OutPoint {
    /// Creates a new `OutPoint`.
    #[must_use]
    pub const fn new(txid: Hash256, vout: u32) -> Self {
        Self { txid, vout }
    }
}

/// An input spending a previously created output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Reference to the output being spent.
    pub previous_output: OutPoint,
    /// Unlocking script proving the right to spend the referenced output.
    pub script_sig: Vec<u8>,
    /// Sequence number, reserved for relative-timelock semantics.
    pub sequence: u32,
}

impl TxInput {
    /// Creates a new transaction input.
    #[must_use]
    pub const fn new(previous_output: OutPoint, script_sig: Vec<u8>, sequence: u32) -> Self {
        Self {
            previous_output,
            script_sig,
            sequence,
        }
    }
}

/// A transaction output: an amount locked under a script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Value of the output, in the smallest unit of the UTXO-family chain.
    pub value: u64,
    /// Locking script (see [`OpCode`]) that must evaluate to true for
    /// this output to be spent.
    pub script_pubkey: Vec<u8>,
}

impl TxOutput {
    /// Creates a new transaction output.
    #[must_use]
    pub const fn new(value: u64, script_pubkey: Vec<u8>) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }
}

/// An unspent transaction output, tracked by the identifier of the
/// transaction and output slot that created it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: Hash256,
    pub vout: u32,
    /// The underlying output.
    pub output: TxOutput,
    /// Height of the block in which this output was created, used for
    /// coinbase maturity checks.
    pub height: u64,
}

impl Utxo {
    /// Creates a new UTXO.
    #[must_use]
    pub const fn new(txid: Hash256, vout: u32, value: u64, script_pubkey: Vec<u8>, height: u64) -> Self {
        Self {
            txid,
            vout,
            output: TxOutput {
                value,
                script_pubkey,
            },
            height,
        }
    }

    /// Returns the identifier of this output.
    #[must_use]
    pub const fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.txid,
            vout: self.vout,
        }
    }

    /// Whether this output can be spent at `current_height`. Coinbase
    /// outputs require 100 confirmations to mature; ordinary outputs are
    /// spendable as soon as they are confirmed.
    #[must_use]
    pub const fn is_mature(&self, current_height: u64, is_coinbase: bool) -> bool {
        if is_coinbase {
            current_height >= self.height + 100
        } else {
            true
        }
    }
}

/// The set of unspent outputs tracked for the UTXO-family side of swap
/// funding, claim and refund transactions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UtxoSet {
    utxos: std::collections::HashMap<OutPoint, Utxo>,
}

impl UtxoSet {
    /// Creates an empty UTXO set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a UTXO, keyed by the outpoint supplied.
    pub fn add(&mut self, outpoint: OutPoint, utxo: Utxo) {
        self.utxos.insert(outpoint, utxo);
    }

    /// Inserts a UTXO, keyed by its own `(txid, vout)`.
    pub fn add_utxo(&mut self, utxo: Utxo) {
        let outpoint = utxo.outpoint();
        self.utxos.insert(outpoint, utxo);
    }

    /// Removes and returns a UTXO, if present (spends it).
    pub fn remove_utxo(&mut self, outpoint: &OutPoint) -> Option<Utxo> {
        self.utxos.remove(outpoint)
    }

    /// Looks up a UTXO by outpoint.
    #[must_use]
    pub fn get(&self, outpoint: &OutPoint) -> Option<&Utxo> {
        self.utxos.get(outpoint)
    }

    /// Looks up a UTXO by outpoint (alias of [`Self::get`], kept for
    /// call sites that read more naturally with a verb).
    #[must_use]
    pub fn get_utxo(&self, outpoint: &OutPoint) -> Option<&Utxo> {
        self.utxos.get(outpoint)
    }

    /// Whether `outpoint` is present in the set.
    #[must_use]
    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.utxos.contains_key(outpoint)
    }

    /// Sum of the value of every output locked under `script`.
    #[must_use]
    pub fn get_balance_for_script(&self, script: &[u8]) -> u64 {
        self.utxos
            .values()
            .filter(|utxo| utxo.output.script_pubkey == script)
            .map(|utxo| utxo.output.value)
            .sum()
    }

    /// Greedily selects outputs locked under `script` until their total
    /// value reaches `amount`.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::InsufficientFunds`] if the script's
    /// outputs do not sum to at least `amount`.
    pub fn find_utxos_for_amount(&self, script: &[u8], amount: u64) -> Result<Vec<&Utxo>> {
        let mut selected = Vec::new();
        let mut total = 0u64;

        for utxo in self.utxos.values() {
            if utxo.output.script_pubkey == script {
                selected.push(utxo);
                total = total.checked_add(utxo.output.value).ok_or_else(|| {
                    BlockchainError::InvalidTransaction("overflow selecting UTXOs".to_string())
                })?;

                if total >= amount {
                    return Ok(selected);
                }
            }
        }

        if total < amount {
            return Err(BlockchainError::InsufficientFunds);
        }

        Ok(selected)
    }

    /// Number of tracked outputs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    /// Whether the set holds no outputs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }
}

/// Builds a pay-to-public-key-hash locking script:
/// `OP_DUP OP_HASH256 <pubkey_hash> OP_EQUALVERIFY OP_CHECKSIG`.
#[must_use]
pub fn p2pkh_script(pubkey_hash: &[u8]) -> Vec<u8> {
    ScriptBuilder::new()
        .push_opcode(OpCode::OP_DUP)
        .push_opcode(OpCode::OP_HASH256)
        .push_data(pubkey_hash)
        .push_opcode(OpCode::OP_EQUALVERIFY)
        .push_opcode(OpCode::OP_CHECKSIG)
        .build()
}

/// Builds the unlocking script for a [`p2pkh_script`]: `<signature> <pubkey>`.
#[must_use]
pub fn p2pkh_unlock_script(signature: &[u8], pubkey: &[u8]) -> Vec<u8> {
    ScriptBuilder::new().push_data(signature).push_data(pubkey).build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utxo_creation_sets_fields() {
        let utxo = Utxo::new(Hash256::zero(), 0, 5000, vec![1, 2, 3], 100);

        assert_eq!(utxo.output.value, 5000);
        assert_eq!(utxo.output.script_pubkey, vec![1, 2, 3]);
        assert_eq!(utxo.height, 100);
    }

    #[test]
    fn outpoint_matches_stored_txid_and_vout() {
        let txid = Hash256::sha256(b"funding tx");
        let utxo = Utxo::new(txid, 2, 5000, vec![], 10);

        assert_eq!(utxo.outpoint(), OutPoint::new(txid, 2));
    }

    #[test]
    fn coinbase_maturity_requires_100_confirmations() {
        let utxo = Utxo::new(Hash256::zero(), 0, 5000, vec![1, 2, 3], 100);

        assert!(utxo.is_mature(101, false));
        assert!(!utxo.is_mature(150, true));
        assert!(utxo.is_mature(200, true));
    }

    #[test]
    fn utxo_set_add_get_remove_round_trips() {
        let mut utxo_set = UtxoSet::new();
        let utxo = Utxo::new(Hash256::zero(), 0, 5000, vec![1, 2, 3], 100);
        let outpoint = utxo.outpoint();

        utxo_set.add_utxo(utxo.clone());
        assert!(utxo_set.contains(&outpoint));
        assert_eq!(utxo_set.len(), 1);
        assert_eq!(utxo_set.get(&outpoint).unwrap().output.value, utxo.output.value);

        let removed = utxo_set.remove_utxo(&outpoint);
        assert!(removed.is_some());
        assert!(!utxo_set.contains(&outpoint));
    }

    #[test]
    fn balance_for_script_sums_matching_outputs() {
        let mut utxo_set = UtxoSet::new();
        let script = vec![1, 2, 3];

        utxo_set.add_utxo(Utxo::new(Hash256::sha256(b"a"), 0, 1000, script.clone(), 100));
        utxo_set.add_utxo(Utxo::new(Hash256::sha256(b"b"), 1, 2000, script.clone(), 100));
        utxo_set.add_utxo(Utxo::new(Hash256::sha256(b"c"), 2, 3000, vec![4, 5, 6], 100));

        assert_eq!(utxo_set.get_balance_for_script(&script), 3000);
    }

    #[test]
    fn find_utxos_for_amount_rejects_insufficient_funds() {
        let mut utxo_set = UtxoSet::new();
        let script = vec![9, 9, 9];
        utxo_set.add_utxo(Utxo::new(Hash256::sha256(b"only"), 0, 100, script.clone(), 1));

        assert!(utxo_set.find_utxos_for_amount(&script, 1000).is_err());
        assert!(utxo_set.find_utxos_for_amount(&script, 50).is_ok());
    }
}
