//! The testnet/devnet faucet gate (§6, §9 "fail-closed globally"): a
//! per-address daily drip, disabled outright on mainnet and rejecting
//! requests fail-closed if the rate limiter itself cannot be consulted.

use crate::sponsorship::SlidingWindowLimiter;
use crate::transaction::Transaction;
use shared::{BlockchainError, NetworkType, NodeConfig, Result};
use std::collections::HashMap;

/// Caps faucet drips to one `faucet_amount` credit per address per
/// [`FAUCET_WINDOW_SECS`], and refuses to operate at all outside
/// devnet/testnet.
pub struct FaucetGate {
    network: NetworkType,
    faucet_amount: u64,
    limiters: HashMap<String, SlidingWindowLimiter>,
    rate_config: crate::sponsorship::RateConfig,
}

impl FaucetGate {
    /// Builds a faucet gate from node configuration.
    #[must_use]
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            network: config.network,
            faucet_amount: config.faucet_amount,
            limiters: HashMap::new(),
            rate_config: crate::sponsorship::RateConfig {
                max_gas_per_transaction: 0,
                max_cost_per_transaction: 0,
                per_second_count_cap: u32::MAX,
                per_minute_count_cap: u32::MAX,
                per_hour_count_cap: u32::MAX,
                per_day_count_cap: 1,
            },
        }
    }

    /// Whether the faucet is enabled on this network at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        matches!(self.network, NetworkType::Devnet | NetworkType::Testnet)
    }

    /// Issues a faucet transaction crediting `recipient`, subject to
    /// the network gate and the per-address daily limit. Fails closed:
    /// any uncertainty about whether the limiter allows the request is
    /// treated as a rejection, never as an allowance.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::Unauthorized`] if the faucet is
    /// disabled on this network, or [`BlockchainError::RateLimited`] if
    /// `recipient` has already drawn from the faucet within the window.
    pub fn request(&mut self, recipient: String, nonce: u64, now: i64) -> Result<Transaction> {
        if !self.is_enabled() {
            return Err(BlockchainError::Unauthorized);
        }

        let limiter = self.limiters.entry(recipient.clone()).or_default();
        if !limiter.allows(now, 1, &self.rate_config) {
            let retry_after_secs = limiter.retry_after(now, &self.rate_config);
            return Err(BlockchainError::RateLimited { retry_after_secs });
        }
        limiter.record(now, 1);

        Ok(Transaction::faucet(recipient, self.faucet_amount, nonce, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devnet_config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.network = NetworkType::Devnet;
        config.faucet_amount = 50_000;
        config
    }

    #[test]
    fn faucet_issues_a_credit_on_devnet() {
        let mut gate = FaucetGate::new(&devnet_config());
        let tx = gate.request("addr-a".to_string(), 0, 1_700_000_000).unwrap();
        assert_eq!(tx.amount, 50_000);
    }

    #[test]
    fn faucet_is_disabled_on_mainnet() {
        let mut config = devnet_config();
        config.network = NetworkType::Mainnet;
        let mut gate = FaucetGate::new(&config);

        assert!(gate.request("addr-a".to_string(), 0, 1_700_000_000).is_err());
    }

    #[test]
    fn faucet_rejects_a_second_request_within_the_window() {
        let mut gate = FaucetGate::new(&devnet_config());
        gate.request("addr-a".to_string(), 0, 1_700_000_000).unwrap();

        let second = gate.request("addr-a".to_string(), 1, 1_700_000_001);
        assert!(second.is_err());
    }

    #[test]
    fn faucet_allows_different_addresses_independently() {
        let mut gate = FaucetGate::new(&devnet_config());
        gate.request("addr-a".to_string(), 0, 1_700_000_000).unwrap();
        let other = gate.request("addr-b".to_string(), 0, 1_700_000_000);
        assert!(other.is_ok());
    }
}
