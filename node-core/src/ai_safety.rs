//! The AI safety kernel (§4.7): the top-level gate every AI-initiated or
//! AI-assisted action must pass through, plus the persisted rate limiting
//! and semantic output inspection it performs along the way.
//!
//! Grounded on `ai_safety_controls.py`'s `AISafetyControls`: authorized
//! callers gate level changes and the emergency stop; the emergency stop
//! cancels personal requests, pauses governance tasks and halts trading
//! bots atomically; per-identifier and per-provider rate limits persist
//! to disk on every update via `shared::persist`.

use serde::{Deserialize, Serialize};
use shared::{AiSafetyConfig, BlockchainError, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Why an emergency stop, pause or cancellation happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    UserRequested,
    Emergency,
    SecurityThreat,
    CommunityVote,
    BudgetExceeded,
    ErrorThreshold,
    Timeout,
}

/// The node's current posture toward AI-driven actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    Normal,
    Caution,
    Restricted,
    EmergencyStop,
    Lockdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EmergencyStopState {
    active: bool,
    reason: Option<StopReason>,
    started_at: Option<i64>,
}

impl Default for EmergencyStopState {
    fn default() -> Self {
        Self {
            active: false,
            reason: None,
            started_at: None,
        }
    }
}

#[derive(Debug, Clone)]
struct PersonalRequest {
    user_address: String,
    cancelled: bool,
    completed: bool,
}

#[derive(Debug, Clone)]
struct GovernanceTask {
    paused: bool,
    paused_by: Option<String>,
}

#[derive(Debug, Clone)]
struct TradingBot {
    user_address: String,
    stopped: bool,
}

/// Proof that an action cleared the kernel's gate at issuance time. It
/// carries no further enforcement power — a caller holding one must
/// still check `is_request_cancelled`/`is_task_paused` before acting if
/// the action is long-running, since the kernel can revoke standing
/// permission (emergency stop, task pause) after a token is issued.
#[derive(Debug, Clone)]
pub struct AiCapability {
    pub id: String,
    pub issued_at: i64,
    pub level_at_issuance: SafetyLevel,
}

/// Persisted per-identifier daily token budget.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct TokenUsageEntry {
    day_start: i64,
    tokens_used: u64,
}

/// Persisted per-provider call/token budget.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct ProviderUsageEntry {
    window_start: i64,
    call_count: u32,
    day_start: i64,
    tokens_used: u64,
}

impl Default for ProviderUsageEntry {
    fn default() -> Self {
        Self {
            window_start: 0,
            call_count: 0,
            day_start: 0,
            tokens_used: 0,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RateLimitState {
    users: HashMap<String, TokenUsageEntry>,
    providers: HashMap<String, ProviderUsageEntry>,
}

/// A provider's call-window and daily token limits, consulted by
/// `enforce_provider_request_limit`/`track_token_usage`.
#[derive(Debug, Clone, Copy)]
pub struct ProviderLimits {
    pub window_secs: i64,
    pub calls_per_window: u32,
    pub daily_token_budget: u64,
}

impl Default for ProviderLimits {
    fn default() -> Self {
        Self {
            window_secs: 60,
            calls_per_window: 60,
            daily_token_budget: 1_000_000,
        }
    }
}

struct Inner {
    level: SafetyLevel,
    emergency_stop: EmergencyStopState,
    authorized_callers: std::collections::HashSet<String>,
    personal_requests: HashMap<String, PersonalRequest>,
    governance_tasks: HashMap<String, GovernanceTask>,
    trading_bots: HashMap<String, TradingBot>,
    rate_limits: RateLimitState,
}

/// The AI safety kernel: one instance per node, shared behind a mutex
/// per §5 ("AI safety kernel... hold a dedicated mutex covering
/// read-modify-write cycles on their persisted state").
pub struct AiSafetyKernel {
    inner: Mutex<Inner>,
    rate_limit_path: PathBuf,
    entry_ttl_secs: i64,
    default_daily_token_budget: u64,
    provider_limits: HashMap<String, ProviderLimits>,
    default_provider_limits: ProviderLimits,
}

impl AiSafetyKernel {
    /// Builds the kernel from configuration, loading any persisted
    /// rate-limit state at `config.rate_limit_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted rate-limit file exists but
    /// cannot be parsed.
    pub fn new(config: &AiSafetyConfig, authorized_callers: impl IntoIterator<Item = String>) -> Result<Self> {
        let path = PathBuf::from(&config.rate_limit_path);
        let rate_limits = shared::persist::read_json::<RateLimitState>(&path)?.unwrap_or_default();

        let mut callers: std::collections::HashSet<String> =
            authorized_callers.into_iter().map(|c| c.to_lowercase()).collect();
        callers.insert("system".to_string());

        Ok(Self {
            inner: Mutex::new(Inner {
                level: SafetyLevel::Normal,
                emergency_stop: EmergencyStopState::default(),
                authorized_callers: callers,
                personal_requests: HashMap::new(),
                governance_tasks: HashMap::new(),
                trading_bots: HashMap::new(),
                rate_limits,
            }),
            rate_limit_path: path,
            entry_ttl_secs: config.entry_ttl_secs as i64,
            default_daily_token_budget: config.default_daily_token_budget,
            provider_limits: HashMap::new(),
            default_provider_limits: ProviderLimits::default(),
        })
    }

    /// Registers an explicit rate-limit policy for `provider`,
    /// overriding [`ProviderLimits::default`].
    pub fn configure_provider(&mut self, provider: impl Into<String>, limits: ProviderLimits) {
        self.provider_limits.insert(provider.into().to_lowercase(), limits);
    }

    fn provider_limits_for(&self, provider: &str) -> ProviderLimits {
        self.provider_limits
            .get(&provider.to_lowercase())
            .copied()
            .unwrap_or(self.default_provider_limits)
    }

    fn persist_locked(&self, inner: &Inner) -> Result<()> {
        shared::persist::write_json_atomic(&self.rate_limit_path, &inner.rate_limits)
    }

    /// Whether `identifier` may change the safety level or trigger the
    /// emergency stop.
    #[must_use]
    pub fn is_authorized_caller(&self, identifier: &str) -> bool {
        let inner = self.inner.lock().expect("ai safety lock poisoned");
        inner.authorized_callers.contains(&identifier.to_lowercase())
    }

    /// Grants `identifier` authority to change level / trigger stop.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::Unauthorized`] if `caller` is not
    /// itself an authorized caller.
    pub fn authorize_caller(&self, identifier: &str, caller: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("ai safety lock poisoned");
        if !inner.authorized_callers.contains(&caller.to_lowercase()) {
            return Err(BlockchainError::Unauthorized);
        }
        inner.authorized_callers.insert(identifier.to_lowercase());
        Ok(())
    }

    /// Current safety level.
    #[must_use]
    pub fn level(&self) -> SafetyLevel {
        self.inner.lock().expect("ai safety lock poisoned").level
    }

    /// Sets the safety level. Only an authorized caller may do so.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::Unauthorized`] if `caller` is not
    /// authorized.
    pub fn set_level(&self, level: SafetyLevel, caller: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("ai safety lock poisoned");
        if !inner.authorized_callers.contains(&caller.to_lowercase()) {
            return Err(BlockchainError::Unauthorized);
        }
        inner.level = level;
        Ok(())
    }

    /// Whether the kill switch is currently active.
    #[must_use]
    pub fn is_emergency_stopped(&self) -> bool {
        self.inner.lock().expect("ai safety lock poisoned").emergency_stop.active
    }

    /// Activates the emergency stop: cancels every active personal
    /// request, pauses every governance task and stops every trading
    /// bot, atomically under the kernel's lock.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::Unauthorized`] if `caller` is not
    /// authorized.
    pub fn activate_emergency_stop(&self, reason: StopReason, caller: &str, now: i64) -> Result<()> {
        let mut inner = self.inner.lock().expect("ai safety lock poisoned");
        if !inner.authorized_callers.contains(&caller.to_lowercase()) {
            return Err(BlockchainError::Unauthorized);
        }

        inner.emergency_stop = EmergencyStopState {
            active: true,
            reason: Some(reason),
            started_at: Some(now),
        };
        inner.level = SafetyLevel::EmergencyStop;

        for request in inner.personal_requests.values_mut() {
            request.cancelled = true;
        }
        for task in inner.governance_tasks.values_mut() {
            task.paused = true;
            task.paused_by = Some(caller.to_string());
        }
        for bot in inner.trading_bots.values_mut() {
            bot.stopped = true;
        }

        tracing::warn!(reason = ?reason, %caller, "ai safety: emergency stop activated");
        Ok(())
    }

    /// Deactivates the emergency stop, restoring [`SafetyLevel::Normal`].
    /// Cancelled requests and paused tasks stay cancelled/paused — an
    /// operator must explicitly resume them.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::Unauthorized`] if `caller` is not
    /// authorized.
    pub fn deactivate_emergency_stop(&self, caller: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("ai safety lock poisoned");
        if !inner.authorized_callers.contains(&caller.to_lowercase()) {
            return Err(BlockchainError::Unauthorized);
        }
        inner.emergency_stop = EmergencyStopState::default();
        inner.level = SafetyLevel::Normal;
        Ok(())
    }

    /// Registers a personal AI request and issues a capability token
    /// for it, or fails with [`BlockchainError::EmergencyStopActive`] if
    /// the kill switch is engaged.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::EmergencyStopActive`] while the
    /// emergency stop is active.
    pub fn register_personal_request(&self, request_id: &str, user_address: &str, now: i64) -> Result<AiCapability> {
        let mut inner = self.inner.lock().expect("ai safety lock poisoned");
        if inner.emergency_stop.active {
            return Err(BlockchainError::EmergencyStopActive);
        }
        inner.personal_requests.insert(
            request_id.to_string(),
            PersonalRequest {
                user_address: user_address.to_string(),
                cancelled: false,
                completed: false,
            },
        );
        Ok(AiCapability {
            id: request_id.to_string(),
            issued_at: now,
            level_at_issuance: inner.level,
        })
    }

    /// Cancels a personal request. The owning user or an authorized
    /// caller may cancel.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::Unauthorized`] if neither condition
    /// holds.
    pub fn cancel_personal_request(&self, request_id: &str, caller: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("ai safety lock poisoned");
        let authorized = inner.authorized_callers.contains(&caller.to_lowercase());
        let Some(request) = inner.personal_requests.get_mut(request_id) else {
            return Err(BlockchainError::Malformed("unknown request_id".to_string()));
        };
        if request.user_address != caller && !authorized {
            return Err(BlockchainError::Unauthorized);
        }
        request.cancelled = true;
        Ok(())
    }

    /// Whether `request_id` has been cancelled (by its owner, by an
    /// authorized caller, or by an emergency stop).
    #[must_use]
    pub fn is_request_cancelled(&self, request_id: &str) -> bool {
        let inner = self.inner.lock().expect("ai safety lock poisoned");
        inner.personal_requests.get(request_id).is_none_or(|r| r.cancelled)
    }

    /// Marks a personal request complete, removing it from active
    /// tracking.
    pub fn complete_personal_request(&self, request_id: &str) {
        let mut inner = self.inner.lock().expect("ai safety lock poisoned");
        if let Some(request) = inner.personal_requests.get_mut(request_id) {
            request.completed = true;
        }
    }

    /// Registers a governance task, rejecting registration while the
    /// kill switch is active.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::EmergencyStopActive`] while the
    /// emergency stop is active.
    pub fn register_governance_task(&self, task_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("ai safety lock poisoned");
        if inner.emergency_stop.active {
            return Err(BlockchainError::EmergencyStopActive);
        }
        inner.governance_tasks.insert(
            task_id.to_string(),
            GovernanceTask {
                paused: false,
                paused_by: None,
            },
        );
        Ok(())
    }

    /// Pauses a governance task (community vote or authorized caller).
    pub fn pause_governance_task(&self, task_id: &str, pauser: &str) {
        let mut inner = self.inner.lock().expect("ai safety lock poisoned");
        if let Some(task) = inner.governance_tasks.get_mut(task_id) {
            task.paused = true;
            task.paused_by = Some(pauser.to_string());
        }
    }

    /// Resumes a paused governance task. Refuses while the emergency
    /// stop is active.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::EmergencyStopActive`] while the
    /// emergency stop is active.
    pub fn resume_governance_task(&self, task_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("ai safety lock poisoned");
        if inner.emergency_stop.active {
            return Err(BlockchainError::EmergencyStopActive);
        }
        if let Some(task) = inner.governance_tasks.get_mut(task_id) {
            task.paused = false;
            task.paused_by = None;
        }
        Ok(())
    }

    /// Whether a governance task is currently paused.
    #[must_use]
    pub fn is_task_paused(&self, task_id: &str) -> bool {
        let inner = self.inner.lock().expect("ai safety lock poisoned");
        inner.governance_tasks.get(task_id).is_some_and(|t| t.paused)
    }

    /// Registers a trading bot under `user_address`. Refuses while the
    /// kill switch is active.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::EmergencyStopActive`] while the
    /// emergency stop is active.
    pub fn register_trading_bot(&self, user_address: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("ai safety lock poisoned");
        if inner.emergency_stop.active {
            return Err(BlockchainError::EmergencyStopActive);
        }
        inner.trading_bots.insert(
            user_address.to_string(),
            TradingBot {
                user_address: user_address.to_string(),
                stopped: false,
            },
        );
        Ok(())
    }

    /// Stops a single trading bot (user-initiated or authorized).
    pub fn stop_trading_bot(&self, user_address: &str) {
        let mut inner = self.inner.lock().expect("ai safety lock poisoned");
        if let Some(bot) = inner.trading_bots.get_mut(user_address) {
            bot.stopped = true;
        }
    }

    /// Whether the trading bot registered for `user_address` is
    /// stopped (explicitly, or via emergency stop).
    #[must_use]
    pub fn is_trading_bot_stopped(&self, user_address: &str) -> bool {
        let inner = self.inner.lock().expect("ai safety lock poisoned");
        inner.trading_bots.get(user_address).is_none_or(|b| b.stopped)
    }

    /// Enforces the per-provider call-rate window, rejecting with
    /// [`BlockchainError::RateLimited`] if the window's call budget is
    /// exhausted. Fails closed: any persistence error enforcing the
    /// limit is surfaced rather than silently allowing the call.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::RateLimited`] if the window is
    /// exhausted, or a persistence error if the updated state cannot
    /// be written.
    pub fn enforce_provider_request_limit(&self, provider: &str, now: i64) -> Result<()> {
        let limits = self.provider_limits_for(provider);
        let key = provider.to_lowercase();
        let mut inner = self.inner.lock().expect("ai safety lock poisoned");
        purge_stale(&mut inner.rate_limits, now, self.entry_ttl_secs);

        let entry = inner.rate_limits.providers.entry(key).or_insert_with(|| ProviderUsageEntry {
            window_start: now,
            call_count: 0,
            day_start: day_start(now),
            tokens_used: 0,
        });

        if now - entry.window_start >= limits.window_secs {
            entry.window_start = now;
            entry.call_count = 0;
        }

        if entry.call_count >= limits.calls_per_window {
            let retry_after_secs = (entry.window_start + limits.window_secs - now).max(0) as u64;
            return Err(BlockchainError::RateLimited { retry_after_secs });
        }

        entry.call_count += 1;
        let new_day_start = day_start(now);
        if entry.day_start < new_day_start {
            entry.day_start = new_day_start;
            entry.tokens_used = 0;
        }

        self.persist_locked(&inner)
    }

    /// Records `tokens` consumed by `identifier` (optionally attributed
    /// to `provider`), rejecting if it would exceed `max_tokens` (the
    /// identifier's override, or the kernel's configured default) for
    /// the current UTC day.
    ///
    /// # Errors
    ///
    /// Returns [`BlockchainError::RateLimited`] if the daily budget
    /// would be exceeded.
    pub fn track_token_usage(
        &self,
        identifier: &str,
        tokens: u64,
        max_tokens: Option<u64>,
        provider: Option<&str>,
        now: i64,
    ) -> Result<()> {
        let budget = max_tokens.unwrap_or(self.default_daily_token_budget);
        let today = day_start(now);

        let mut inner = self.inner.lock().expect("ai safety lock poisoned");
        purge_stale(&mut inner.rate_limits, now, self.entry_ttl_secs);

        let entry = inner.rate_limits.users.entry(identifier.to_string()).or_insert(TokenUsageEntry {
            day_start: today,
            tokens_used: 0,
        });
        if entry.day_start < today {
            entry.day_start = today;
            entry.tokens_used = 0;
        }
        if entry.tokens_used + tokens > budget {
            return Err(BlockchainError::RateLimited { retry_after_secs: (today + 86_400 - now).max(0) as u64 });
        }
        entry.tokens_used += tokens;

        if let Some(provider) = provider {
            let provider_entry = inner
                .rate_limits
                .providers
                .entry(provider.to_lowercase())
                .or_insert(ProviderUsageEntry {
                    window_start: now,
                    call_count: 0,
                    day_start: today,
                    tokens_used: 0,
                });
            if provider_entry.day_start < today {
                provider_entry.day_start = today;
                provider_entry.tokens_used = 0;
            }
            provider_entry.tokens_used += tokens;
        }

        self.persist_locked(&inner)
    }

    /// Runs the semantic output inspector over `output` (see
    /// [`crate::inspector::inspect`]).
    #[must_use]
    pub fn validate_ai_output(&self, output: &str, context: &str) -> crate::inspector::SemanticAnalysisResult {
        crate::inspector::inspect(output, context)
    }
}

fn day_start(now: i64) -> i64 {
    now - now.rem_euclid(86_400)
}

fn purge_stale(state: &mut RateLimitState, now: i64, ttl_secs: i64) {
    state.users.retain(|_, entry| now - entry.day_start <= ttl_secs);
    state.providers.retain(|_, entry| now - entry.day_start <= ttl_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel() -> AiSafetyKernel {
        let mut config = AiSafetyConfig::default();
        config.rate_limit_path = std::env::temp_dir()
            .join(format!("xai-ai-safety-test-{}-{}.json", std::process::id(), line!()))
            .to_string_lossy()
            .to_string();
        AiSafetyKernel::new(&config, vec!["owner".to_string()]).unwrap()
    }

    #[test]
    fn unauthorized_caller_cannot_change_level() {
        let kernel = kernel();
        let result = kernel.set_level(SafetyLevel::Caution, "random-user");
        assert!(matches!(result, Err(BlockchainError::Unauthorized)));
    }

    #[test]
    fn emergency_stop_cancels_pauses_and_halts_everything() {
        let kernel = kernel();
        kernel.register_personal_request("req-1", "alice", 1_700_000_000).unwrap();
        kernel.register_governance_task("task-1").unwrap();
        kernel.register_trading_bot("alice").unwrap();

        kernel
            .activate_emergency_stop(StopReason::Emergency, "owner", 1_700_000_100)
            .unwrap();

        assert!(kernel.is_request_cancelled("req-1"));
        assert!(kernel.is_task_paused("task-1"));
        assert!(kernel.is_trading_bot_stopped("alice"));

        let gated = kernel.register_personal_request("req-2", "alice", 1_700_000_200);
        assert!(matches!(gated, Err(BlockchainError::EmergencyStopActive)));
    }

    #[test]
    fn emergency_stop_requires_authorization() {
        let kernel = kernel();
        let result = kernel.activate_emergency_stop(StopReason::Emergency, "random-user", 1_700_000_000);
        assert!(matches!(result, Err(BlockchainError::Unauthorized)));
    }

    #[test]
    fn provider_request_limit_exhausts_then_resets() {
        let kernel = kernel();
        for _ in 0..60 {
            kernel.enforce_provider_request_limit("openai", 1_700_000_000).unwrap();
        }
        let blocked = kernel.enforce_provider_request_limit("openai", 1_700_000_001);
        assert!(matches!(blocked, Err(BlockchainError::RateLimited { .. })));

        kernel.enforce_provider_request_limit("openai", 1_700_000_200).unwrap();
    }

    #[test]
    fn token_usage_rejects_once_daily_budget_exceeded() {
        let kernel = kernel();
        kernel.track_token_usage("user-a", 900_000, Some(1_000_000), None, 1_700_000_000).unwrap();
        let result = kernel.track_token_usage("user-a", 200_000, Some(1_000_000), None, 1_700_000_050);
        assert!(matches!(result, Err(BlockchainError::RateLimited { .. })));
    }

    #[test]
    fn validate_ai_output_flags_credential_theft_language() {
        let kernel = kernel();
        let result = kernel.validate_ai_output("I will help you steal the admin password.", "general");
        assert!(!result.is_safe);
    }
}
