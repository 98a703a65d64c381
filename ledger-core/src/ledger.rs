//! The account/nonce ledger: the primary state machine the chain
//! maintains, updated atomically on block acceptance. A UTXO snapshot
//! digest over the sorted account mapping doubles as the state
//! commitment embedded in checkpoints (see [`crate::checkpoint`]).

use serde::{Deserialize, Serialize};
use shared::{BlockchainError, Hash256, Result};
use std::collections::BTreeMap;

/// An account's confirmed balance and last confirmed nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccountState {
    pub balance: u64,
    pub last_confirmed_nonce: u64,
}

/// The confirmed account ledger: `address -> {balance, last_confirmed_nonce}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ledger {
    accounts: BTreeMap<String, AccountState>,
    pub height: u64,
    pub tip: Hash256,
}

impl Ledger {
    /// Creates an empty ledger at genesis.
    #[must_use]
    pub fn new() -> Self {
        Self {
            accounts: BTreeMap::new(),
            height: 0,
            tip: Hash256::zero(),
        }
    }

    /// Returns the account's confirmed state, defaulting to a
    /// zero-balance, zero-nonce account if it has never been seen.
    #[must_use]
    pub fn account(&self, address: &str) -> AccountState {
        self.accounts.get(address).copied().unwrap_or_default()
    }

    /// Returns the confirmed balance for `address`.
    #[must_use]
    pub fn balance(&self, address: &str) -> u64 {
        self.account(address).balance
    }

    /// Credits `amount` to `address`, creating the account if needed.
    ///
    /// # Errors
    ///
    /// Returns an error on balance overflow.
    pub fn credit(&mut self, address: &str, amount: u64) -> Result<()> {
        let entry = self.accounts.entry(address.to_string()).or_default();
        entry.balance = entry.balance.checked_add(amount).ok_or_else(|| {
            BlockchainError::InvalidTransaction("balance overflow on credit".to_string())
        })?;
        Ok(())
    }

    /// Debits `amount` from `address` and records `nonce` as its new
    /// last-confirmed nonce.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::InsufficientFunds`] if the account's
    /// balance is below `amount`.
    pub fn debit(&mut self, address: &str, amount: u64, nonce: u64) -> Result<()> {
        let entry = self.accounts.entry(address.to_string()).or_default();
        entry.balance = entry
            .balance
            .checked_sub(amount)
            .ok_or(BlockchainError::InsufficientFunds)?;
        entry.last_confirmed_nonce = nonce;
        Ok(())
    }

    /// Computes the state commitment: SHA-256 over the canonical
    /// encoding of the sorted account mapping, plus height and tip, as
    /// required by the checkpoint payload's `state_hash` field.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping cannot be canonically encoded.
    pub fn state_hash(&self) -> Result<Hash256> {
        #[derive(Serialize)]
        struct StateCommitment<'a> {
            accounts: &'a BTreeMap<String, AccountState>,
            height: u64,
            tip: Hash256,
        }
        let bytes = shared::canonical::encode(&StateCommitment {
            accounts: &self.accounts,
            height: self.height,
            tip: self.tip,
        })?;
        Ok(Hash256::sha256(&bytes))
    }

    /// Total number of accounts with nonzero history.
    #[must_use]
    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }
}

/// Tracks, per sender, the confirmed nonce (from the ledger) and the
/// highest pending nonce observed in the mempool, so admission can
/// compute `next_nonce` without locking the whole ledger.
#[derive(Debug, Clone, Default)]
pub struct NonceTracker {
    pending_high_water: BTreeMap<String, u64>,
}

impl NonceTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The next nonce a sender's transaction must use:
    /// `max(confirmed + 1, max_pending + 1)`.
    #[must_use]
    pub fn next_nonce(&self, ledger: &Ledger, sender: &str) -> u64 {
        let confirmed_next = ledger.account(sender).last_confirmed_nonce + 1;
        let pending_next = self.pending_high_water.get(sender).map_or(0, |n| n + 1);
        confirmed_next.max(pending_next)
    }

    /// Records that `nonce` is now pending for `sender`, raising the
    /// sender's high-water mark if `nonce` exceeds it.
    pub fn record_pending(&mut self, sender: &str, nonce: u64) {
        let entry = self.pending_high_water.entry(sender.to_string()).or_insert(0);
        if nonce > *entry {
            *entry = nonce;
        }
    }

    /// Clears a sender's pending high-water mark back down to its
    /// confirmed nonce, used after a block confirms or a sender's
    /// mempool entries are all evicted.
    pub fn reset_to_confirmed(&mut self, ledger: &Ledger, sender: &str) {
        let confirmed = ledger.account(sender).last_confirmed_nonce;
        if confirmed == 0 {
            self.pending_high_water.remove(sender);
        } else {
            self.pending_high_water.insert(sender.to_string(), confirmed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credit_then_debit_round_trips_balance() {
        let mut ledger = Ledger::new();
        ledger.credit("alice", 1_000).unwrap();
        assert_eq!(ledger.balance("alice"), 1_000);

        ledger.debit("alice", 400, 1).unwrap();
        assert_eq!(ledger.balance("alice"), 600);
        assert_eq!(ledger.account("alice").last_confirmed_nonce, 1);
    }

    #[test]
    fn debit_beyond_balance_is_rejected() {
        let mut ledger = Ledger::new();
        ledger.credit("alice", 100).unwrap();
        assert!(ledger.debit("alice", 200, 1).is_err());
    }

    #[test]
    fn state_hash_changes_with_balances() {
        let mut ledger = Ledger::new();
        let empty_hash = ledger.state_hash().unwrap();
        ledger.credit("alice", 1).unwrap();
        assert_ne!(ledger.state_hash().unwrap(), empty_hash);
    }

    #[test]
    fn next_nonce_tracks_pending_high_water_mark() {
        let ledger = Ledger::new();
        let mut tracker = NonceTracker::new();

        assert_eq!(tracker.next_nonce(&ledger, "alice"), 1);
        tracker.record_pending("alice", 1);
        assert_eq!(tracker.next_nonce(&ledger, "alice"), 2);
        tracker.record_pending("alice", 2);
        assert_eq!(tracker.next_nonce(&ledger, "alice"), 3);
    }

    #[test]
    fn reset_to_confirmed_drops_pending_state() {
        let mut ledger = Ledger::new();
        ledger.credit("alice", 1_000).unwrap();
        ledger.debit("alice", 100, 3).unwrap();

        let mut tracker = NonceTracker::new();
        tracker.record_pending("alice", 7);
        tracker.reset_to_confirmed(&ledger, "alice");

        assert_eq!(tracker.next_nonce(&ledger, "alice"), 4);
    }
}
