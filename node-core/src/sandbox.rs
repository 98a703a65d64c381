//! The sandbox capability guard (§4.7's "sandbox" boundary): a
//! capability-based permission gate for mini-apps and AI agents
//! running inside the node, not the sandboxed executor itself.
//!
//! Grounded on `permissions.py`'s `PermissionManager`/`AuditLog`: an
//! app must request a capability before using it; dangerous
//! capabilities always need explicit user approval, a fixed safe set
//! can be auto-granted to verified apps, every grant/check/revoke is
//! appended to an audit trail, and state persists to disk atomically.

use serde::{Deserialize, Serialize};
use shared::{BlockchainError, Result};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

/// A capability an app inside the sandbox may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ReadBalance,
    ReadTransactions,
    ReadBlockchain,
    SignTransactions,
    SendTransactions,
    NetworkHttp,
    NetworkHttps,
    NetworkWebsocket,
    NetworkAll,
    StorageRead,
    StorageWrite,
    StorageDelete,
    FilesystemRead,
    FilesystemWrite,
    ProcessSpawn,
    Notifications,
    KeyringAccess,
    PrivateKeyExport,
}

impl Capability {
    /// Capabilities that always require explicit user approval, never
    /// auto-grant.
    #[must_use]
    pub fn is_dangerous(self) -> bool {
        matches!(
            self,
            Capability::SignTransactions
                | Capability::SendTransactions
                | Capability::KeyringAccess
                | Capability::PrivateKeyExport
                | Capability::FilesystemWrite
                | Capability::ProcessSpawn
        )
    }

    /// Capabilities that a verified app may be auto-granted.
    #[must_use]
    pub fn is_safe(self) -> bool {
        matches!(
            self,
            Capability::ReadBalance
                | Capability::ReadTransactions
                | Capability::ReadBlockchain
                | Capability::StorageRead
                | Capability::StorageWrite
                | Capability::Notifications
        )
    }
}

/// The access level a capability was (or is being) requested at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Read,
    Write,
    Execute,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Grant {
    level: AccessLevel,
    granted_at: i64,
    expires_at: Option<i64>,
    user_approved: bool,
}

impl Grant {
    fn is_valid(&self, now: i64) -> bool {
        if !self.user_approved {
            return false;
        }
        match self.expires_at {
            Some(expiry) => now < expiry,
            None => true,
        }
    }

    fn satisfies(&self, requested: AccessLevel, now: i64) -> bool {
        self.is_valid(now) && self.level >= requested
    }
}

/// One audit trail entry recording a capability request, approval,
/// check or revocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: i64,
    pub app_id: String,
    pub capability: Capability,
    pub action: String,
    pub success: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    grants: HashMap<String, HashMap<Capability, Grant>>,
    verified_apps: HashSet<String>,
}

struct Inner {
    state: PersistedState,
    audit_log: Vec<AuditEntry>,
}

/// Tracks which apps have been granted which capabilities, at what
/// level, enforces dangerous-capability approval and auto-grants the
/// safe set for verified apps, and keeps an audit trail of every
/// decision.
pub struct SandboxGuard {
    inner: Mutex<Inner>,
    storage_path: Option<PathBuf>,
    max_audit_entries: usize,
}

impl SandboxGuard {
    /// Builds a guard, loading persisted grants from `storage_path` if
    /// given and present.
    ///
    /// # Errors
    ///
    /// Returns an error if `storage_path` exists but cannot be parsed.
    pub fn new(storage_path: Option<PathBuf>) -> Result<Self> {
        let state = match &storage_path {
            Some(path) => shared::persist::read_json::<PersistedState>(path)?.unwrap_or_default(),
            None => PersistedState::default(),
        };
        Ok(Self {
            inner: Mutex::new(Inner { state, audit_log: Vec::new() }),
            storage_path,
            max_audit_entries: 10_000,
        })
    }

    fn persist_locked(&self, inner: &Inner) -> Result<()> {
        match &self.storage_path {
            Some(path) => shared::persist::write_json_atomic(path, &inner.state),
            None => Ok(()),
        }
    }

    fn audit(&self, inner: &mut Inner, entry: AuditEntry) {
        if entry.success {
            tracing::info!(app_id = %entry.app_id, capability = ?entry.capability, action = %entry.action, "sandbox: granted");
        } else {
            tracing::warn!(app_id = %entry.app_id, capability = ?entry.capability, action = %entry.action, reason = ?entry.reason, "sandbox: denied");
        }
        inner.audit_log.push(entry);
        if inner.audit_log.len() > self.max_audit_entries {
            let overflow = inner.audit_log.len() - self.max_audit_entries;
            inner.audit_log.drain(0..overflow);
        }
    }

    /// Marks `app_id` as verified, allowing the safe capability set to
    /// be auto-granted on request.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the updated state fails.
    pub fn verify_app(&self, app_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("sandbox lock poisoned");
        inner.state.verified_apps.insert(app_id.to_string());
        self.persist_locked(&inner)
    }

    /// Removes `app_id`'s verified status.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the updated state fails.
    pub fn unverify_app(&self, app_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("sandbox lock poisoned");
        inner.state.verified_apps.remove(app_id);
        self.persist_locked(&inner)
    }

    /// Requests `capability` at `level` for `app_id`. Returns `true` if
    /// granted immediately (already valid, or auto-approved because
    /// the app is verified and the capability is in the safe set and
    /// not dangerous); `false` if the request is recorded pending user
    /// approval via [`approve`](Self::approve).
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the updated state fails.
    pub fn request(
        &self,
        app_id: &str,
        capability: Capability,
        level: AccessLevel,
        duration_secs: Option<i64>,
        now: i64,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().expect("sandbox lock poisoned");

        if inner
            .state
            .grants
            .get(app_id)
            .and_then(|grants| grants.get(&capability))
            .is_some_and(|grant| grant.satisfies(level, now))
        {
            return Ok(true);
        }

        let can_auto_approve =
            !capability.is_dangerous() && capability.is_safe() && inner.state.verified_apps.contains(app_id);

        let grant = Grant {
            level,
            granted_at: now,
            expires_at: duration_secs.map(|secs| now + secs),
            user_approved: can_auto_approve,
        };

        inner.state.grants.entry(app_id.to_string()).or_default().insert(capability, grant);

        self.audit(
            &mut inner,
            AuditEntry {
                timestamp: now,
                app_id: app_id.to_string(),
                capability,
                action: "request".to_string(),
                success: can_auto_approve,
                reason: None,
            },
        );

        self.persist_locked(&inner)?;
        Ok(can_auto_approve)
    }

    /// Approves a pending capability request for `app_id`, granted by
    /// `approver` (a user address or operator identifier).
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::Malformed`] if there is no such
    /// pending request.
    pub fn approve(&self, app_id: &str, capability: Capability, approver: &str, now: i64) -> Result<()> {
        let mut inner = self.inner.lock().expect("sandbox lock poisoned");
        let grant = inner
            .state
            .grants
            .get_mut(app_id)
            .and_then(|grants| grants.get_mut(&capability))
            .ok_or_else(|| BlockchainError::Malformed("no pending capability request".to_string()))?;

        grant.user_approved = true;
        grant.granted_at = now;

        self.audit(
            &mut inner,
            AuditEntry {
                timestamp: now,
                app_id: app_id.to_string(),
                capability,
                action: format!("approve:{approver}"),
                success: true,
                reason: None,
            },
        );

        self.persist_locked(&inner)
    }

    /// Revokes a single capability grant for `app_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the updated state fails.
    pub fn revoke(&self, app_id: &str, capability: Capability, now: i64) -> Result<()> {
        let mut inner = self.inner.lock().expect("sandbox lock poisoned");
        if let Some(grants) = inner.state.grants.get_mut(app_id) {
            grants.remove(&capability);
        }
        self.audit(
            &mut inner,
            AuditEntry {
                timestamp: now,
                app_id: app_id.to_string(),
                capability,
                action: "revoke".to_string(),
                success: true,
                reason: None,
            },
        );
        self.persist_locked(&inner)
    }

    /// Revokes every capability grant held by `app_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the updated state fails.
    pub fn revoke_all(&self, app_id: &str, now: i64) -> Result<()> {
        let mut inner = self.inner.lock().expect("sandbox lock poisoned");
        let Some(grants) = inner.state.grants.remove(app_id) else {
            return Ok(());
        };
        for capability in grants.into_keys() {
            self.audit(
                &mut inner,
                AuditEntry {
                    timestamp: now,
                    app_id: app_id.to_string(),
                    capability,
                    action: "revoke_all".to_string(),
                    success: true,
                    reason: None,
                },
            );
        }
        self.persist_locked(&inner)
    }

    /// Whether `app_id` currently holds a valid grant for `capability`
    /// at (at least) `level`.
    #[must_use]
    pub fn has_capability(&self, app_id: &str, capability: Capability, level: AccessLevel, now: i64) -> bool {
        let inner = self.inner.lock().expect("sandbox lock poisoned");
        inner
            .state
            .grants
            .get(app_id)
            .and_then(|grants| grants.get(&capability))
            .is_some_and(|grant| grant.satisfies(level, now))
    }

    /// Checks `app_id` holds `capability` at `level`, recording the
    /// outcome in the audit log either way.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::Unauthorized`] if the capability is
    /// not held at the requested level.
    pub fn check(&self, app_id: &str, capability: Capability, level: AccessLevel, action: &str, now: i64) -> Result<()> {
        let granted = self.has_capability(app_id, capability, level, now);
        let mut inner = self.inner.lock().expect("sandbox lock poisoned");
        self.audit(
            &mut inner,
            AuditEntry {
                timestamp: now,
                app_id: app_id.to_string(),
                capability,
                action: action.to_string(),
                success: granted,
                reason: if granted { None } else { Some("capability not granted or expired".to_string()) },
            },
        );

        if granted {
            Ok(())
        } else {
            Err(BlockchainError::Unauthorized)
        }
    }

    /// Snapshot of the most recent audit entries, newest last.
    #[must_use]
    pub fn audit_entries(&self, limit: usize) -> Vec<AuditEntry> {
        let inner = self.inner.lock().expect("sandbox lock poisoned");
        let start = inner.audit_log.len().saturating_sub(limit);
        inner.audit_log[start..].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> SandboxGuard {
        SandboxGuard::new(None).unwrap()
    }

    #[test]
    fn safe_capability_auto_grants_for_verified_app() {
        let guard = guard();
        guard.verify_app("app-a").unwrap();
        let granted = guard
            .request("app-a", Capability::ReadBalance, AccessLevel::Read, None, 1_700_000_000)
            .unwrap();
        assert!(granted);
        assert!(guard.has_capability("app-a", Capability::ReadBalance, AccessLevel::Read, 1_700_000_000));
    }

    #[test]
    fn dangerous_capability_never_auto_grants() {
        let guard = guard();
        guard.verify_app("app-a").unwrap();
        let granted = guard
            .request("app-a", Capability::SendTransactions, AccessLevel::Write, None, 1_700_000_000)
            .unwrap();
        assert!(!granted);
        assert!(!guard.has_capability("app-a", Capability::SendTransactions, AccessLevel::Write, 1_700_000_000));
    }

    #[test]
    fn approval_makes_a_pending_request_valid() {
        let guard = guard();
        guard
            .request("app-a", Capability::SendTransactions, AccessLevel::Write, None, 1_700_000_000)
            .unwrap();
        guard.approve("app-a", Capability::SendTransactions, "user-1", 1_700_000_010).unwrap();
        assert!(guard.has_capability("app-a", Capability::SendTransactions, AccessLevel::Write, 1_700_000_020));
    }

    #[test]
    fn expired_grant_no_longer_satisfies() {
        let guard = guard();
        guard
            .request("app-a", Capability::SendTransactions, AccessLevel::Write, Some(60), 1_700_000_000)
            .unwrap();
        guard.approve("app-a", Capability::SendTransactions, "user-1", 1_700_000_000).unwrap();
        assert!(guard.has_capability("app-a", Capability::SendTransactions, AccessLevel::Write, 1_700_000_030));
        assert!(!guard.has_capability("app-a", Capability::SendTransactions, AccessLevel::Write, 1_700_000_090));
    }

    #[test]
    fn check_denies_and_audits_when_capability_missing() {
        let guard = guard();
        let result = guard.check("app-a", Capability::FilesystemWrite, AccessLevel::Write, "write_file", 1_700_000_000);
        assert!(matches!(result, Err(BlockchainError::Unauthorized)));
        assert_eq!(guard.audit_entries(10).len(), 1);
        assert!(!guard.audit_entries(10)[0].success);
    }

    #[test]
    fn revoke_all_clears_every_grant_for_an_app() {
        let guard = guard();
        guard.verify_app("app-a").unwrap();
        guard
            .request("app-a", Capability::ReadBalance, AccessLevel::Read, None, 1_700_000_000)
            .unwrap();
        guard.revoke_all("app-a", 1_700_000_100).unwrap();
        assert!(!guard.has_capability("app-a", Capability::ReadBalance, AccessLevel::Read, 1_700_000_200));
    }
}
