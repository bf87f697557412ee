//! Multi-account OAuth credential pool.
//!
//! The pool owns a set of [`OAuthProfile`] records keyed by profile name and
//! implements the deterministic selection policy used by the OAuth-backed
//! provider: explicit > pinned > sticky last-used, then the total order
//! (remaining quota ascending, reset time ascending, email ascending) over
//! the profiles that are currently usable.
//!
//! On disk the pool is a single camelCase JSON file, pretty-printed with a
//! trailing newline and tightened to owner-only permissions. Loading is
//! lenient: missing or wrongly-typed fields fall back to defaults instead of
//! failing the whole file.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::util::now_iso;
use crate::util::now_ms;
use crate::util::restrict_to_owner;

/// Provider tag written into pool files.
pub const POOL_PROVIDER: &str = "openai.codex.oauth.pool";
/// Provider tag written into legacy single-token files.
pub const SINGLE_TOKEN_PROVIDER: &str = "openai.codex.oauth";

/// Access tokens are treated as expired this long before their deadline.
const EXPIRY_MARGIN_MS: i64 = 30_000;

/// Stand-in for "never resets" when a profile carries no quota hints.
const FAR_FUTURE_MS: i64 = i64::MAX;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("OAuth profile not found in pool: {0}")]
    UnknownProfile(String),

    #[error("OAuth pinnedProfile not found in pool: {0}")]
    UnknownPinnedProfile(String),

    #[error(
        "No usable OAuth profiles available (all disabled). Profiles: {profiles}. \
         Next action: re-login and re-import the tokens with `workbench pool import`."
    )]
    AllDisabled { profiles: String },

    #[error(
        "No usable OAuth profiles available (all rate-limited). Profiles: {profiles}. \
         Wait and retry (nextResetAtMs={next_reset_at_ms}, email={email})."
    )]
    AllRateLimited {
        profiles: String,
        next_reset_at_ms: i64,
        email: String,
    },

    #[error("No usable OAuth profiles available (all rate-limited or disabled). Profiles: {profiles}")]
    NoneUsable { profiles: String },

    #[error("No usable OAuth profiles available to rotate to")]
    NoRotationTarget,

    #[error("invalid OAuth pool file (expected object)")]
    InvalidFile,

    #[error("unsupported OAuth pool version (expected 1)")]
    UnsupportedVersion,

    #[error("OAuth pool file has no profiles: {0}")]
    EmptyPool(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// One credential record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthProfile {
    pub profile: String,
    pub email: Option<String>,
    pub account_id: Option<String>,
    pub issuer: Option<String>,
    pub client_id: Option<String>,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at_ms: i64,
    pub remaining: Option<f64>,
    pub reset_at_ms: Option<i64>,
    pub provider: Option<String>,
    pub last_seen_at: Option<String>,
    pub rate_limited_until_ms: Option<i64>,
    pub disabled: bool,
    pub updated_at: Option<String>,
}

impl OAuthProfile {
    pub fn new(profile: &str, access_token: &str, refresh_token: &str, expires_at_ms: i64) -> Self {
        Self {
            profile: profile.to_string(),
            email: None,
            account_id: None,
            issuer: None,
            client_id: None,
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
            expires_at_ms,
            remaining: None,
            reset_at_ms: None,
            provider: None,
            last_seen_at: None,
            rate_limited_until_ms: None,
            disabled: false,
            updated_at: None,
        }
    }

    /// Lenient construction from a JSON object: missing or wrongly-typed
    /// fields become defaults rather than errors.
    pub fn from_value(value: &Value) -> Self {
        Self {
            profile: string_or_default(value.get("profile")),
            email: nonempty_string(value.get("email")),
            account_id: any_string(value.get("accountId")),
            issuer: any_string(value.get("issuer")),
            client_id: any_string(value.get("clientId")),
            access_token: string_or_default(value.get("accessToken")),
            refresh_token: string_or_default(value.get("refreshToken")),
            expires_at_ms: int_or_default(value.get("expiresAtMs")),
            remaining: value.get("remaining").and_then(Value::as_f64),
            reset_at_ms: value.get("resetAtMs").and_then(Value::as_i64),
            provider: nonempty_string(value.get("provider")),
            last_seen_at: nonempty_string(value.get("lastSeenAt")),
            rate_limited_until_ms: value.get("rateLimitedUntilMs").and_then(Value::as_i64),
            disabled: value.get("disabled").and_then(Value::as_bool).unwrap_or(false),
            updated_at: any_string(value.get("updatedAt")),
        }
    }

    /// Usable: not disabled and not inside a rate-limit window.
    pub fn is_usable(&self, at_ms: i64) -> bool {
        !self.disabled && self.rate_limited_until_ms.unwrap_or(0) <= at_ms
    }

    /// Expired: within the safety margin of the access-token deadline.
    pub fn is_expired(&self, at_ms: i64) -> bool {
        self.expires_at_ms <= at_ms + EXPIRY_MARGIN_MS
    }

    pub fn effective_email(&self) -> &str {
        self.email.as_deref().unwrap_or(&self.profile)
    }

    /// Unknown quota sorts *after* any known quota.
    pub fn effective_remaining(&self) -> f64 {
        self.remaining.unwrap_or(1e18)
    }

    pub fn effective_reset_at_ms(&self) -> i64 {
        match self.reset_at_ms {
            Some(reset) if reset > 0 => reset,
            _ => match self.rate_limited_until_ms {
                Some(until) if until > 0 => until,
                _ => FAR_FUTURE_MS,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    #[default]
    Sticky,
    RoundRobin,
}

impl SelectionStrategy {
    /// Lenient parse: anything that is not `round-robin` is sticky.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("round-robin") {
            Self::RoundRobin
        } else {
            Self::Sticky
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub strategy: SelectionStrategy,
    pub pinned_profile: Option<String>,
    pub last_used_profile: Option<String>,
}

/// The pool file: shared connection fields, selection state, and the
/// profiles keyed by name.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthPool {
    pub version: i64,
    pub provider: String,
    pub updated_at: String,
    pub issuer: Option<String>,
    pub client_id: Option<String>,
    pub model: Option<String>,
    pub codex_endpoint: Option<String>,
    pub selection: Selection,
    pub profiles: BTreeMap<String, OAuthProfile>,
}

impl OAuthPool {
    pub fn empty() -> Self {
        Self {
            version: 1,
            provider: POOL_PROVIDER.to_string(),
            updated_at: now_iso(),
            issuer: None,
            client_id: None,
            model: None,
            codex_endpoint: None,
            selection: Selection::default(),
            profiles: BTreeMap::new(),
        }
    }

    pub fn from_value(value: &Value) -> Self {
        let selection = value.get("selection");
        let mut profiles = BTreeMap::new();
        if let Some(map) = value.get("profiles").and_then(Value::as_object) {
            for (key, entry) in map {
                if !entry.is_object() {
                    continue;
                }
                let mut profile = OAuthProfile::from_value(entry);
                if entry.get("profile").is_none() {
                    profile.profile = key.clone();
                }
                if profile.profile.is_empty() {
                    continue;
                }
                profiles.insert(profile.profile.clone(), profile);
            }
        }
        Self {
            version: value.get("version").and_then(Value::as_i64).unwrap_or(1),
            provider: any_string(value.get("provider")).unwrap_or_else(|| POOL_PROVIDER.to_string()),
            updated_at: any_string(value.get("updatedAt")).unwrap_or_else(now_iso),
            issuer: any_string(value.get("issuer")),
            client_id: any_string(value.get("clientId")),
            model: any_string(value.get("model")),
            codex_endpoint: any_string(value.get("codexEndpoint")),
            selection: Selection {
                strategy: selection
                    .and_then(|s| s.get("strategy"))
                    .and_then(Value::as_str)
                    .map(SelectionStrategy::parse)
                    .unwrap_or_default(),
                pinned_profile: selection
                    .and_then(|s| s.get("pinnedProfile"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                last_used_profile: selection
                    .and_then(|s| s.get("lastUsedProfile"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            profiles,
        }
    }

    /// Profile names in deterministic (lexicographic) order.
    pub fn list_profiles(&self) -> Vec<String> {
        self.profiles.keys().cloned().collect()
    }

    fn joined_names(&self) -> String {
        self.list_profiles().join(", ")
    }

    /// Pick the profile for the next request at time `at_ms`.
    ///
    /// Precedence: `explicit` > pinned > sticky last-used (when usable) >
    /// first usable profile in the total order; round-robin advances past the
    /// last-used profile within that order, wrapping around.
    pub fn choose_profile(&self, explicit: Option<&str>, at_ms: i64) -> Result<String, PoolError> {
        if let Some(name) = explicit.filter(|name| !name.is_empty()) {
            if !self.profiles.contains_key(name) {
                return Err(PoolError::UnknownProfile(name.to_string()));
            }
            return Ok(name.to_string());
        }
        if let Some(pinned) = self.selection.pinned_profile.as_deref() {
            if !self.profiles.contains_key(pinned) {
                return Err(PoolError::UnknownPinnedProfile(pinned.to_string()));
            }
            return Ok(pinned.to_string());
        }

        if self.selection.strategy == SelectionStrategy::Sticky
            && let Some(last) = self.selection.last_used_profile.as_deref()
            && let Some(profile) = self.profiles.get(last)
            && profile.is_usable(at_ms)
        {
            return Ok(profile.profile.clone());
        }

        let mut usable: Vec<&OAuthProfile> = self
            .profiles
            .values()
            .filter(|profile| profile.is_usable(at_ms))
            .collect();
        if usable.is_empty() {
            return Err(self.no_usable_error(at_ms));
        }
        usable.sort_by(|a, b| total_order(a, b));

        if self.selection.strategy == SelectionStrategy::RoundRobin
            && let Some(last) = self.selection.last_used_profile.as_deref()
            && let Some(index) = usable.iter().position(|profile| profile.profile == last)
        {
            return Ok(usable[(index + 1) % usable.len()].profile.clone());
        }
        Ok(usable[0].profile.clone())
    }

    fn no_usable_error(&self, at_ms: i64) -> PoolError {
        let profiles = self.joined_names();
        let total = self.profiles.len();
        if total > 0 {
            let disabled = self.profiles.values().filter(|p| p.disabled).count();
            if disabled == total {
                return PoolError::AllDisabled { profiles };
            }
            let limited = self
                .profiles
                .values()
                .filter(|p| p.rate_limited_until_ms.unwrap_or(0) > at_ms)
                .count();
            if limited == total
                && let Some(target) = self.profiles.values().min_by(|a, b| {
                    a.effective_reset_at_ms()
                        .cmp(&b.effective_reset_at_ms())
                        .then_with(|| a.effective_email().cmp(b.effective_email()))
                })
            {
                return PoolError::AllRateLimited {
                    profiles,
                    next_reset_at_ms: target.effective_reset_at_ms(),
                    email: target.effective_email().to_string(),
                };
            }
        }
        PoolError::NoneUsable { profiles }
    }

    /// Pick the best usable profile other than `current`.
    ///
    /// Returns `current` itself only when it is the sole usable profile.
    pub fn rotate_after(
        &self,
        current: &str,
        explicit: Option<&str>,
        at_ms: i64,
    ) -> Result<String, PoolError> {
        if let Some(name) = explicit.filter(|name| !name.is_empty()) {
            return Ok(name.to_string());
        }
        let mut usable: Vec<&OAuthProfile> = self
            .profiles
            .values()
            .filter(|profile| profile.is_usable(at_ms))
            .collect();
        if usable.is_empty() {
            return Err(PoolError::NoRotationTarget);
        }
        usable.sort_by(|a, b| total_order(a, b));
        if !usable.iter().any(|profile| profile.profile == current) {
            return Ok(usable[0].profile.clone());
        }
        for profile in &usable {
            if profile.profile != current {
                return Ok(profile.profile.clone());
            }
        }
        Ok(current.to_string())
    }

    pub fn mark_used(&mut self, profile: &str) {
        self.selection.last_used_profile = Some(profile.to_string());
        self.updated_at = now_iso();
    }

    /// Record a rate-limit window for a profile, clamped to start no earlier
    /// than now. Unknown profiles are ignored.
    pub fn mark_rate_limited(&mut self, profile: &str, until_ms: i64) {
        let Some(entry) = self.profiles.get_mut(profile) else {
            return;
        };
        entry.rate_limited_until_ms = Some(until_ms.max(now_ms()));
        entry.updated_at = Some(now_iso());
        self.updated_at = now_iso();
    }

    pub fn disable(&mut self, profile: &str) -> Result<(), PoolError> {
        self.set_disabled(profile, true)
    }

    pub fn enable(&mut self, profile: &str) -> Result<(), PoolError> {
        self.set_disabled(profile, false)
    }

    fn set_disabled(&mut self, profile: &str, disabled: bool) -> Result<(), PoolError> {
        let entry = self
            .profiles
            .get_mut(profile)
            .ok_or_else(|| PoolError::UnknownProfile(profile.to_string()))?;
        entry.disabled = disabled;
        entry.updated_at = Some(now_iso());
        self.updated_at = now_iso();
        Ok(())
    }

    /// Remove a profile, clearing any selection state that referenced it.
    pub fn remove(&mut self, profile: &str) -> Result<(), PoolError> {
        if self.profiles.remove(profile).is_none() {
            return Err(PoolError::UnknownProfile(profile.to_string()));
        }
        if self.selection.pinned_profile.as_deref() == Some(profile) {
            self.selection.pinned_profile = None;
        }
        if self.selection.last_used_profile.as_deref() == Some(profile) {
            self.selection.last_used_profile = None;
        }
        self.updated_at = now_iso();
        Ok(())
    }

    pub fn pin(&mut self, profile: &str) -> Result<(), PoolError> {
        if !self.profiles.contains_key(profile) {
            return Err(PoolError::UnknownProfile(profile.to_string()));
        }
        self.selection.pinned_profile = Some(profile.to_string());
        self.updated_at = now_iso();
        Ok(())
    }

    pub fn unpin(&mut self) {
        self.selection.pinned_profile = None;
        self.updated_at = now_iso();
    }

    pub fn activate(&mut self, profile: &str) -> Result<(), PoolError> {
        if !self.profiles.contains_key(profile) {
            return Err(PoolError::UnknownProfile(profile.to_string()));
        }
        self.mark_used(profile);
        Ok(())
    }

    pub fn set_strategy(&mut self, strategy: SelectionStrategy) {
        self.selection.strategy = strategy;
        self.updated_at = now_iso();
    }

    /// Insert or replace a profile (ingestion from a login flow or refresh)
    /// and make it the last-used one.
    pub fn upsert_profile(&mut self, mut profile: OAuthProfile) {
        if profile.updated_at.is_none() {
            profile.updated_at = Some(now_iso());
        }
        let name = profile.profile.clone();
        self.profiles.insert(name.clone(), profile);
        self.mark_used(&name);
    }
}

/// The deterministic total order over profiles: remaining quota ascending,
/// reset time ascending, effective email ascending.
fn total_order(a: &OAuthProfile, b: &OAuthProfile) -> Ordering {
    a.effective_remaining()
        .total_cmp(&b.effective_remaining())
        .then_with(|| a.effective_reset_at_ms().cmp(&b.effective_reset_at_ms()))
        .then_with(|| a.effective_email().cmp(b.effective_email()))
}

/// Load a pool file. A missing file is an empty pool; a present file must be
/// a JSON object carrying `version: 1`.
pub fn load_pool(path: &Path) -> Result<OAuthPool, PoolError> {
    if !path.exists() {
        return Ok(OAuthPool::empty());
    }
    let raw = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&raw)?;
    if !value.is_object() {
        return Err(PoolError::InvalidFile);
    }
    let pool = OAuthPool::from_value(&value);
    if pool.version != 1 {
        return Err(PoolError::UnsupportedVersion);
    }
    Ok(pool)
}

/// Write the whole pool file (pretty JSON, trailing newline) and tighten its
/// permissions to the owner.
pub fn save_pool(path: &Path, pool: &OAuthPool) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut body = serde_json::to_string_pretty(pool)?;
    body.push('\n');
    std::fs::write(path, body)?;
    restrict_to_owner(path);
    Ok(())
}

fn any_string(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::to_string)
}

fn nonempty_string(value: Option<&Value>) -> Option<String> {
    any_string(value).filter(|s| !s.is_empty())
}

fn string_or_default(value: Option<&Value>) -> String {
    any_string(value).unwrap_or_default()
}

fn int_or_default(value: Option<&Value>) -> i64 {
    value.and_then(Value::as_i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn profile(name: &str, email: &str, remaining: f64, reset_at_ms: i64) -> OAuthProfile {
        let mut p = OAuthProfile::new(name, &format!("token-{name}"), &format!("refresh-{name}"), i64::MAX / 2);
        p.email = Some(email.to_string());
        p.remaining = Some(remaining);
        p.reset_at_ms = Some(reset_at_ms);
        p
    }

    fn three_profile_pool(now: i64) -> OAuthPool {
        let mut pool = OAuthPool::empty();
        for p in [
            profile("p1", "b@example.com", 100.0, now + 5_000),
            profile("p2", "a@example.com", 100.0, now + 1_000),
            profile("p3", "c@example.com", 50.0, now + 9_000),
        ] {
            pool.profiles.insert(p.profile.clone(), p);
        }
        pool
    }

    #[test]
    fn selection_prefers_smallest_remaining_then_reset_then_email() {
        let now = now_ms();
        let mut pool = three_profile_pool(now);

        assert_eq!(pool.choose_profile(None, now).expect("choose"), "p3");

        // Remaining tie -> earliest resetAtMs.
        if let Some(p3) = pool.profiles.get_mut("p3") {
            p3.remaining = Some(100.0);
        }
        assert_eq!(pool.choose_profile(None, now).expect("choose"), "p2");

        // Remaining and reset tie -> lexicographically smallest email.
        let p2_reset = pool.profiles.get("p2").and_then(|p| p.reset_at_ms);
        if let Some(p1) = pool.profiles.get_mut("p1") {
            p1.reset_at_ms = p2_reset;
        }
        assert_eq!(pool.choose_profile(None, now).expect("choose"), "p2");
    }

    #[test]
    fn selection_is_deterministic_for_identical_snapshots() {
        let now = now_ms();
        let pool = three_profile_pool(now);
        let first = pool.choose_profile(None, now).expect("choose");
        for _ in 0..8 {
            assert_eq!(pool.choose_profile(None, now).expect("choose"), first);
        }
    }

    #[test]
    fn explicit_and_pinned_override_ranking() {
        let now = now_ms();
        let mut pool = three_profile_pool(now);
        assert_eq!(pool.choose_profile(Some("p1"), now).expect("choose"), "p1");
        assert!(matches!(
            pool.choose_profile(Some("ghost"), now),
            Err(PoolError::UnknownProfile(_))
        ));

        pool.pin("p1").expect("pin");
        assert_eq!(pool.choose_profile(None, now).expect("choose"), "p1");
        pool.selection.pinned_profile = Some("ghost".to_string());
        assert!(matches!(
            pool.choose_profile(None, now),
            Err(PoolError::UnknownPinnedProfile(_))
        ));
    }

    #[test]
    fn sticky_keeps_last_used_while_usable() {
        let now = now_ms();
        let mut pool = three_profile_pool(now);
        pool.mark_used("p1");
        assert_eq!(pool.choose_profile(None, now).expect("choose"), "p1");

        // Once the last-used profile is rate limited, ranking takes over.
        pool.mark_rate_limited("p1", now + 60_000);
        assert_eq!(pool.choose_profile(None, now).expect("choose"), "p3");
    }

    #[test]
    fn round_robin_advances_past_last_used_and_wraps() {
        let now = now_ms();
        let mut pool = three_profile_pool(now);
        pool.set_strategy(SelectionStrategy::RoundRobin);

        // Total order is p3 (remaining=50), p2, p1.
        pool.mark_used("p3");
        assert_eq!(pool.choose_profile(None, now).expect("choose"), "p2");
        pool.mark_used("p1");
        assert_eq!(pool.choose_profile(None, now).expect("choose"), "p3");
    }

    #[test]
    fn rate_limit_window_expires() {
        let now = now_ms();
        let mut pool = three_profile_pool(now);
        let until = now + 10_000;
        pool.mark_rate_limited("p3", until);

        let limited = pool.profiles.get("p3").expect("p3");
        assert!(!limited.is_usable(until - 1));
        assert!(limited.is_usable(until));
    }

    #[test]
    fn all_rate_limited_error_names_the_soonest_reset() {
        let now = now_ms();
        let mut pool = three_profile_pool(now);
        for name in ["p1", "p2", "p3"] {
            pool.mark_rate_limited(name, now + 10_000);
        }
        let err = pool.choose_profile(None, now).expect_err("no usable");
        match err {
            PoolError::AllRateLimited {
                next_reset_at_ms,
                ref email,
                ..
            } => {
                // p2 has the earliest resetAtMs (it trumps the rate-limit window).
                assert_eq!(next_reset_at_ms, now + 1_000);
                assert_eq!(email, "a@example.com");
            }
            other => panic!("unexpected error: {other}"),
        }
        let message = err.to_string();
        assert!(message.contains("nextResetAtMs="));
        assert!(message.contains("email="));
    }

    #[test]
    fn all_disabled_error_suggests_relogin() {
        let now = now_ms();
        let mut pool = three_profile_pool(now);
        for name in ["p1", "p2", "p3"] {
            pool.disable(name).expect("disable");
        }
        let err = pool.choose_profile(None, now).expect_err("no usable");
        assert!(matches!(err, PoolError::AllDisabled { .. }));
        assert!(err.to_string().contains("re-login"));
    }

    #[test]
    fn rotate_after_excludes_current() {
        let now = now_ms();
        let pool = three_profile_pool(now);
        let rotated = pool.rotate_after("p2", None, now).expect("rotate");
        assert_ne!(rotated, "p2");

        // Explicit wins unconditionally.
        assert_eq!(
            pool.rotate_after("p2", Some("p1"), now).expect("rotate"),
            "p1"
        );
    }

    #[test]
    fn rotate_after_returns_current_when_it_is_the_only_option() {
        let now = now_ms();
        let mut pool = three_profile_pool(now);
        pool.disable("p1").expect("disable");
        pool.disable("p2").expect("disable");
        assert_eq!(pool.rotate_after("p3", None, now).expect("rotate"), "p3");

        pool.disable("p3").expect("disable");
        assert!(matches!(
            pool.rotate_after("p3", None, now),
            Err(PoolError::NoRotationTarget)
        ));
    }

    #[test]
    fn remove_clears_dangling_selection_state() {
        let now = now_ms();
        let mut pool = three_profile_pool(now);
        pool.pin("p1").expect("pin");
        pool.mark_used("p1");
        pool.remove("p1").expect("remove");
        assert_eq!(pool.selection.pinned_profile, None);
        assert_eq!(pool.selection.last_used_profile, None);
        assert!(!pool.profiles.contains_key("p1"));
    }

    #[test]
    fn load_rejects_unknown_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pool.json");
        std::fs::write(&path, json!({"version": 2, "profiles": {}}).to_string())
            .expect("write");
        assert!(matches!(
            load_pool(&path),
            Err(PoolError::UnsupportedVersion)
        ));
    }

    #[test]
    fn save_and_load_round_trip() {
        let now = now_ms();
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("auth").join("pool.json");

        let mut pool = three_profile_pool(now);
        pool.client_id = Some("app_test".to_string());
        pool.model = Some("gpt-5.2-codex".to_string());
        pool.mark_used("p2");
        save_pool(&path, &pool).expect("save");

        let raw = std::fs::read_to_string(&path).expect("read");
        assert!(raw.ends_with('\n'));
        let value: Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["version"], 1);
        assert_eq!(value["selection"]["strategy"], "sticky");
        assert_eq!(value["selection"]["lastUsedProfile"], "p2");
        assert_eq!(value["profiles"]["p1"]["email"], "b@example.com");
        assert_eq!(value["profiles"]["p1"]["accessToken"], "token-p1");

        let loaded = load_pool(&path).expect("load");
        assert_eq!(loaded.list_profiles(), vec!["p1", "p2", "p3"]);
        assert_eq!(loaded.selection.last_used_profile.as_deref(), Some("p2"));
        assert_eq!(loaded.client_id.as_deref(), Some("app_test"));
    }

    #[cfg(unix)]
    #[test]
    fn saved_pool_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pool.json");
        save_pool(&path, &OAuthPool::empty()).expect("save");
        let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn lenient_loading_defaults_bad_fields() {
        let value = json!({
            "version": 1,
            "profiles": {
                "main": {
                    "accessToken": "tok",
                    "refreshToken": "ref",
                    "expiresAtMs": "not-a-number",
                    "remaining": "lots",
                    "email": "",
                }
            }
        });
        let pool = OAuthPool::from_value(&value);
        let p = pool.profiles.get("main").expect("profile");
        assert_eq!(p.profile, "main");
        assert_eq!(p.expires_at_ms, 0);
        assert_eq!(p.remaining, None);
        assert_eq!(p.email, None);
        assert_eq!(p.effective_email(), "main");
    }
}
