//! The API key lifecycle and rate gate fronting the node's HTTP
//! surface (§6): key registration/revocation/rotation, scope
//! enforcement, deprecated-route headers, and a fail-closed rate
//! limiter — "never allow traffic if limits cannot be enforced".
//!
//! Reuses [`ledger_core::SlidingWindowLimiter`]/[`ledger_core::RateConfig`]
//! for the per-key request budget, the same way the sponsorship engine
//! applies them to gas.

use ledger_core::{RateConfig, SlidingWindowLimiter};
use serde::{Deserialize, Serialize};
use shared::{BlockchainError, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// A named capability an API key may be scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Read,
    Send,
    Mine,
    Swap,
    Checkpoint,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiKeyRecord {
    scopes: Vec<Scope>,
    revoked: bool,
    created_at: i64,
    /// Key this one was rotated from, so a caller presenting the old
    /// key during the grace window still resolves to the same scopes.
    rotated_from: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedKeys {
    keys: HashMap<String, ApiKeyRecord>,
}

struct Inner {
    keys: PersistedKeys,
    limiters: HashMap<String, SlidingWindowLimiter>,
}

/// Authenticates and rate-gates every inbound API request. A request
/// without a registered, unrevoked key carrying the required scope is
/// rejected; a request against a saturated rate window is rejected
/// with a retry-after; a request whose limiter state cannot be
/// consulted (e.g. disk unavailable for the persisted key store) is
/// rejected, never allowed through.
pub struct ApiAuthGate {
    inner: Mutex<Inner>,
    storage_path: Option<PathBuf>,
    default_rate_config: RateConfig,
}

/// The outcome of a successful [`ApiAuthGate::authenticate`] call: the
/// scopes the key carries, and whether the caller should be told the
/// key is deprecated (rotated, used within its grace window).
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub scopes: Vec<Scope>,
    pub deprecated: bool,
}

impl ApiAuthGate {
    /// Builds the gate from a configured key list (as loaded from
    /// `NodeConfig::auth_keys`, each granted every scope by default)
    /// and loads any persisted key-lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns an error if `storage_path` exists but cannot be parsed.
    pub fn new(configured_keys: &[String], storage_path: Option<PathBuf>, now: i64) -> Result<Self> {
        let mut persisted = match &storage_path {
            Some(path) => shared::persist::read_json::<PersistedKeys>(path)?.unwrap_or_default(),
            None => PersistedKeys::default(),
        };

        for key in configured_keys {
            persisted.keys.entry(key.clone()).or_insert(ApiKeyRecord {
                scopes: vec![Scope::Read, Scope::Send, Scope::Mine, Scope::Swap, Scope::Checkpoint, Scope::Admin],
                revoked: false,
                created_at: now,
                rotated_from: None,
            });
        }

        Ok(Self {
            inner: Mutex::new(Inner { keys: persisted, limiters: HashMap::new() }),
            storage_path,
            default_rate_config: RateConfig {
                max_gas_per_transaction: 1,
                max_cost_per_transaction: 1,
                per_second_count_cap: 20,
                per_minute_count_cap: 600,
                per_hour_count_cap: 10_000,
                per_day_count_cap: 100_000,
            },
        })
    }

    fn persist_locked(&self, inner: &Inner) -> Result<()> {
        match &self.storage_path {
            Some(path) => shared::persist::write_json_atomic(path, &inner.keys),
            None => Ok(()),
        }
    }

    /// Registers a fresh API key with the given scopes.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the updated key store fails.
    pub fn register_key(&self, key: &str, scopes: Vec<Scope>, now: i64) -> Result<()> {
        let mut inner = self.inner.lock().expect("api auth lock poisoned");
        inner.keys.keys.insert(
            key.to_string(),
            ApiKeyRecord { scopes, revoked: false, created_at: now, rotated_from: None },
        );
        self.persist_locked(&inner)
    }

    /// Revokes a key outright. A revoked key authenticates nothing,
    /// including during what would otherwise be a rotation grace
    /// window.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the updated key store fails.
    pub fn revoke_key(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("api auth lock poisoned");
        if let Some(record) = inner.keys.keys.get_mut(key) {
            record.revoked = true;
        }
        self.persist_locked(&inner)
    }

    /// Rotates `old_key` to `new_key`, carrying over its scopes. The
    /// old key keeps authenticating (flagged deprecated) until the
    /// caller revokes it explicitly — callers should treat
    /// [`AuthOutcome::deprecated`] as a signal to stop using it.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::Malformed`] if `old_key` is unknown,
    /// or a persistence error.
    pub fn rotate_key(&self, old_key: &str, new_key: &str, now: i64) -> Result<()> {
        let mut inner = self.inner.lock().expect("api auth lock poisoned");
        let scopes = inner
            .keys
            .keys
            .get(old_key)
            .ok_or_else(|| BlockchainError::Malformed("unknown api key".to_string()))?
            .scopes
            .clone();

        inner.keys.keys.insert(
            new_key.to_string(),
            ApiKeyRecord { scopes, revoked: false, created_at: now, rotated_from: Some(old_key.to_string()) },
        );
        self.persist_locked(&inner)
    }

    /// Authenticates `key` and verifies it carries `required_scope`,
    /// consulting the key's rate limiter along the way. Fails closed:
    /// if the limiter cannot be consulted for any reason other than a
    /// clean "limit exceeded" outcome, the request is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::Unauthorized`] if the key is unknown,
    /// revoked, or lacks `required_scope`; [`BlockchainError::RateLimited`]
    /// if the key's window is saturated.
    pub fn authenticate(&self, key: &str, required_scope: Scope, now: i64) -> Result<AuthOutcome> {
        let mut inner = self.inner.lock().expect("api auth lock poisoned");
        let record = inner.keys.keys.get(key).cloned().ok_or(BlockchainError::Unauthorized)?;

        if record.revoked {
            return Err(BlockchainError::Unauthorized);
        }
        if !record.scopes.contains(&required_scope) && !record.scopes.contains(&Scope::Admin) {
            return Err(BlockchainError::Unauthorized);
        }

        let limiter = inner.limiters.entry(key.to_string()).or_default();
        if !limiter.allows(now, 1, &self.default_rate_config) {
            let retry_after_secs = limiter.retry_after(now, &self.default_rate_config);
            return Err(BlockchainError::RateLimited { retry_after_secs });
        }
        limiter.record(now, 1);

        let was_rotated_to_something_newer = inner.keys.keys.values().any(|r| r.rotated_from.as_deref() == Some(key));

        Ok(AuthOutcome { scopes: record.scopes, deprecated: was_rotated_to_something_newer })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> ApiAuthGate {
        ApiAuthGate::new(&["key-a".to_string()], None, 1_700_000_000).unwrap()
    }

    #[test]
    fn configured_key_authenticates_with_full_scope() {
        let gate = gate();
        let outcome = gate.authenticate("key-a", Scope::Send, 1_700_000_001).unwrap();
        assert!(outcome.scopes.contains(&Scope::Send));
        assert!(!outcome.deprecated);
    }

    #[test]
    fn unknown_key_is_unauthorized() {
        let gate = gate();
        let result = gate.authenticate("does-not-exist", Scope::Read, 1_700_000_001);
        assert!(matches!(result, Err(BlockchainError::Unauthorized)));
    }

    #[test]
    fn revoked_key_is_rejected() {
        let gate = gate();
        gate.revoke_key("key-a").unwrap();
        let result = gate.authenticate("key-a", Scope::Read, 1_700_000_001);
        assert!(matches!(result, Err(BlockchainError::Unauthorized)));
    }

    #[test]
    fn rotation_flags_old_key_as_deprecated_but_still_valid() {
        let gate = gate();
        gate.rotate_key("key-a", "key-b", 1_700_000_010).unwrap();

        let old = gate.authenticate("key-a", Scope::Read, 1_700_000_020).unwrap();
        assert!(old.deprecated);

        let new = gate.authenticate("key-b", Scope::Read, 1_700_000_021).unwrap();
        assert!(!new.deprecated);
    }

    #[test]
    fn scoped_key_is_denied_outside_its_scope() {
        let gate = gate();
        gate.register_key("scoped-key", vec![Scope::Read], 1_700_000_000).unwrap();
        let result = gate.authenticate("scoped-key", Scope::Mine, 1_700_000_001);
        assert!(matches!(result, Err(BlockchainError::Unauthorized)));
    }

    #[test]
    fn rate_limit_eventually_saturates() {
        let gate = gate();
        for i in 0..20 {
            gate.authenticate("key-a", Scope::Read, 1_700_000_000 + i).unwrap();
        }
        let result = gate.authenticate("key-a", Scope::Read, 1_700_000_000);
        assert!(matches!(result, Err(BlockchainError::RateLimited { .. })));
    }
}
