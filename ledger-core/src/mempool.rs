//! Transaction admission and the mempool priority structure (§4.1): a
//! single-writer, many-reader store keyed by txid, indexed by
//! `(sender, nonce)` for replay detection and contiguity checks, and by
//! fee rate for block assembly.

use crate::ledger::{Ledger, NonceTracker};
use crate::transaction::{Transaction, TxType};
use shared::{BlockchainError, Hash256, Result};
use std::collections::{BTreeMap, HashMap};

/// Minimum multiplicative fee bump required for a replace-by-fee
/// resubmission at the same `(sender, nonce)` to be accepted.
pub const RBF_MARGIN: f64 = 0.10;

struct Entry {
    tx: Transaction,
    txid: Hash256,
}

/// The mempool: pending, not-yet-confirmed transactions awaiting block
/// assembly.
pub struct Mempool {
    by_txid: HashMap<Hash256, Entry>,
    by_sender_nonce: HashMap<(String, u64), Hash256>,
    min_fee: u64,
    max_nonce_gap: u64,
}

/// Outcome of evaluating a transaction for mempool admission.
pub enum AdmissionError {
    Chain(BlockchainError),
    Replay,
    FutureNonce,
    Duplicate,
    BelowMinFee,
}

impl From<AdmissionError> for BlockchainError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::Chain(e) => e,
            AdmissionError::Replay => Self::Replay,
            AdmissionError::FutureNonce => Self::FutureNonce,
            AdmissionError::Duplicate => Self::Duplicate,
            AdmissionError::BelowMinFee => Self::BelowMinFee,
        }
    }
}

impl Mempool {
    /// Creates an empty mempool enforcing `min_fee` and `max_nonce_gap`.
    #[must_use]
    pub fn new(min_fee: u64, max_nonce_gap: u64) -> Self {
        Self {
            by_txid: HashMap::new(),
            by_sender_nonce: HashMap::new(),
            min_fee,
            max_nonce_gap,
        }
    }

    /// Runs the §4.1 admission sequence (structural validation is the
    /// caller's responsibility via `tx.validate_structural`; this
    /// covers steps 3-7: nonce, balance, policy, duplicate, insert) and
    /// inserts the transaction on success.
    ///
    /// # Errors
    ///
    /// Returns the `AdmissionError` variant naming the first failed
    /// check.
    pub fn submit(
        &mut self,
        tx: Transaction,
        ledger: &Ledger,
        nonce_tracker: &mut NonceTracker,
    ) -> std::result::Result<Hash256, AdmissionError> {
        let txid = tx.txid().map_err(AdmissionError::Chain)?;

        if self.by_txid.contains_key(&txid) {
            return Err(AdmissionError::Duplicate);
        }

        if !tx.is_coinbase() && !matches!(tx.tx_type, TxType::Faucet) {
            let confirmed_next = ledger.account(&tx.sender).last_confirmed_nonce + 1;
            if tx.nonce < confirmed_next {
                return Err(AdmissionError::Replay);
            }
            if tx.nonce - confirmed_next > self.max_nonce_gap {
                return Err(AdmissionError::FutureNonce);
            }

            if tx.fee < self.min_fee {
                return Err(AdmissionError::BelowMinFee);
            }

            let pending_sends = self.pending_sent_total(&tx.sender);
            let fee_charge = if tx.gas_sponsor.is_some() { 0 } else { tx.fee };
            let available = ledger
                .balance(&tx.sender)
                .saturating_sub(pending_sends)
                .saturating_sub(fee_charge);
            if tx.amount > available {
                return Err(AdmissionError::Chain(BlockchainError::InsufficientFunds));
            }

            let key = (tx.sender.clone(), tx.nonce);
            if let Some(existing_txid) = self.by_sender_nonce.get(&key) {
                let existing_fee = self.by_txid.get(existing_txid).map_or(0, |e| e.tx.fee);
                let required = (existing_fee as f64) * (1.0 + RBF_MARGIN);
                if (tx.fee as f64) < required {
                    return Err(AdmissionError::Duplicate);
                }
                let existing_txid = *existing_txid;
                self.by_txid.remove(&existing_txid);
            }

            nonce_tracker.record_pending(&tx.sender, tx.nonce);
            self.by_sender_nonce.insert(key, txid);
        }

        self.by_txid.insert(txid, Entry { tx, txid });
        Ok(txid)
    }

    fn pending_sent_total(&self, sender: &str) -> u64 {
        self.by_txid
            .values()
            .filter(|entry| entry.tx.sender == sender)
            .map(|entry| entry.tx.amount)
            .sum()
    }

    /// Removes a transaction by ban-or-not eviction (e.g. expiry or
    /// manual removal).
    pub fn evict(&mut self, txid: &Hash256) -> Option<Transaction> {
        let entry = self.by_txid.remove(txid)?;
        self.by_sender_nonce
            .retain(|_, mapped_txid| mapped_txid != txid);
        Some(entry.tx)
    }

    /// Removes every transaction confirmed by a newly accepted block.
    pub fn evict_confirmed(&mut self, confirmed_txids: &[Hash256]) {
        for txid in confirmed_txids {
            self.evict(txid);
        }
    }

    /// Returns up to `limit` transactions ordered by descending
    /// fee-per-byte, the order block assembly consumes them in. Callers
    /// are responsible for enforcing per-sender nonce contiguity when
    /// assembling a block (a child tx is only included once its parent
    /// nonce is confirmed or already staged earlier in the same block).
    #[must_use]
    pub fn snapshot(&self, limit: usize) -> Vec<Transaction> {
        let mut by_fee_rate: BTreeMap<(u64, Hash256), &Transaction> = BTreeMap::new();
        for entry in self.by_txid.values() {
            let size = entry.tx.estimated_size().max(1) as u64;
            let fee_rate = (entry.tx.fee * 1_000_000) / size;
            by_fee_rate.insert((fee_rate, entry.txid), &entry.tx);
        }

        by_fee_rate
            .into_iter()
            .rev()
            .take(limit)
            .map(|(_, tx)| tx.clone())
            .collect()
    }

    /// Number of transactions currently pending.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_txid.len()
    }

    /// Whether the mempool holds no transactions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_txid.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;
    use shared::{address_from_public_key, KeyPair};

    fn signed(keys: &KeyPair, address: &str, recipient: &str, nonce: u64, amount: u64, fee: u64) -> Transaction {
        let mut tx = Transaction::new(
            address.to_string(),
            recipient.to_string(),
            amount,
            fee,
            nonce,
            keys.public_key.as_bytes().to_vec(),
            1_700_000_000,
            TxType::Normal,
            None,
        );
        let digest = tx.signing_digest().unwrap();
        let signature = keys.sign(&digest).unwrap();
        tx.attach_signature(&signature);
        tx
    }

    #[test]
    fn admits_first_valid_transaction() {
        let keys = KeyPair::generate().unwrap();
        let address = address_from_public_key(&keys.public_key, "xai").unwrap();
        let mut ledger = Ledger::new();
        ledger.credit(&address, 10_000).unwrap();

        let mut mempool = Mempool::new(1, 64);
        let mut tracker = NonceTracker::new();
        let tx = signed(&keys, &address, "bob", 1, 1_000, 10);

        assert!(mempool.submit(tx, &ledger, &mut tracker).is_ok());
        assert_eq!(mempool.len(), 1);
    }

    #[test]
    fn rejects_replayed_nonce() {
        let keys = KeyPair::generate().unwrap();
        let address = address_from_public_key(&keys.public_key, "xai").unwrap();
        let mut ledger = Ledger::new();
        ledger.credit(&address, 10_000).unwrap();
        ledger.debit(&address, 1, 5).unwrap();

        let mut mempool = Mempool::new(1, 64);
        let mut tracker = NonceTracker::new();
        let tx = signed(&keys, &address, "bob", 3, 1_000, 10);

        assert!(matches!(
            mempool.submit(tx, &ledger, &mut tracker),
            Err(AdmissionError::Replay)
        ));
    }

    #[test]
    fn rejects_nonce_gap_beyond_limit() {
        let keys = KeyPair::generate().unwrap();
        let address = address_from_public_key(&keys.public_key, "xai").unwrap();
        let mut ledger = Ledger::new();
        ledger.credit(&address, 10_000).unwrap();

        let mut mempool = Mempool::new(1, 2);
        let mut tracker = NonceTracker::new();
        let tx = signed(&keys, &address, "bob", 10, 1_000, 10);

        assert!(matches!(
            mempool.submit(tx, &ledger, &mut tracker),
            Err(AdmissionError::FutureNonce)
        ));
    }

    #[test]
    fn rejects_insufficient_balance() {
        let keys = KeyPair::generate().unwrap();
        let address = address_from_public_key(&keys.public_key, "xai").unwrap();
        let ledger = Ledger::new();

        let mut mempool = Mempool::new(1, 64);
        let mut tracker = NonceTracker::new();
        let tx = signed(&keys, &address, "bob", 1, 1_000, 10);

        assert!(matches!(
            mempool.submit(tx, &ledger, &mut tracker),
            Err(AdmissionError::Chain(BlockchainError::InsufficientFunds))
        ));
    }

    #[test]
    fn snapshot_orders_by_descending_fee_rate() {
        let keys_a = KeyPair::generate().unwrap();
        let keys_b = KeyPair::generate().unwrap();
        let address_a = address_from_public_key(&keys_a.public_key, "xai").unwrap();
        let address_b = address_from_public_key(&keys_b.public_key, "xai").unwrap();

        let mut ledger = Ledger::new();
        ledger.credit(&address_a, 10_000).unwrap();
        ledger.credit(&address_b, 10_000).unwrap();

        let mut mempool = Mempool::new(1, 64);
        let mut tracker = NonceTracker::new();
        mempool
            .submit(signed(&keys_a, &address_a, "bob", 1, 100, 5), &ledger, &mut tracker)
            .unwrap();
        mempool
            .submit(signed(&keys_b, &address_b, "carol", 1, 100, 50), &ledger, &mut tracker)
            .unwrap();

        let snapshot = mempool.snapshot(10);
        assert_eq!(snapshot[0].fee, 50);
    }
}
