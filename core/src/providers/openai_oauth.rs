//! OAuth-backed ChatGPT Codex provider.
//!
//! Credentials come from the profile pool (or a legacy single-token file).
//! Before each attempt the chosen profile is refreshed if its access token is
//! near expiry; on HTTP 429 (or a rate-limit-shaped error body) the profile
//! is marked rate-limited and the request rotates to the next usable profile.
//! An invalid refresh token permanently disables its profile and rotates.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::warn;

use crate::config::OpenAiOauthConfig;
use crate::error::Result;
use crate::error::RunnerError;
use crate::evidence::EvidenceWriter;
use crate::oauth_pool::OAuthPool;
use crate::oauth_pool::OAuthProfile;
use crate::oauth_pool::PoolError;
use crate::oauth_pool::SINGLE_TOKEN_PROVIDER;
use crate::oauth_pool::load_pool;
use crate::oauth_pool::save_pool;
use crate::providers::ChatMessage;
use crate::providers::LlmProvider;
use crate::providers::Role;
use crate::token_data::extract_account_id;
use crate::util::now_iso;
use crate::util::now_ms;
use crate::util::restrict_to_owner;

/// Fallback rate-limit backoff when the server sends no Retry-After hint.
const DEFAULT_RETRY_AFTER_MS: i64 = 10_000;

/// Refresh calls get a tighter deadline than the chat request they precede.
const REFRESH_TIMEOUT_CAP: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolOrigin {
    /// Loaded from the pool file; saved back to it.
    Pool,
    /// Loaded from the legacy single-token file; saved back in that shape.
    Single,
}

/// Outcome of one POST to the codex endpoint, before rotation policy.
enum ChatOnceError {
    Status {
        status: u16,
        body: String,
        retry_after_ms: Option<i64>,
    },
    Other(RunnerError),
}

enum RefreshFailure {
    /// The issuer rejected the refresh token outright; the profile is dead
    /// until a re-login.
    Invalid(String),
    Fatal(RunnerError),
}

pub struct OpenAiCodexProvider {
    cfg: OpenAiOauthConfig,
    client: reqwest::Client,
    evidence: Option<Arc<EvidenceWriter>>,
}

impl OpenAiCodexProvider {
    pub fn new(cfg: OpenAiOauthConfig, evidence: Option<Arc<EvidenceWriter>>) -> Self {
        Self {
            cfg,
            client: reqwest::Client::new(),
            evidence,
        }
    }

    pub fn config(&self) -> &OpenAiOauthConfig {
        &self.cfg
    }

    fn load_pool_or_single(&self) -> Result<(OAuthPool, PoolOrigin)> {
        if self.cfg.pool_path.exists() {
            let mut pool = load_pool(&self.cfg.pool_path)?;
            if pool.profiles.is_empty() {
                return Err(PoolError::EmptyPool(self.cfg.pool_path.display().to_string()).into());
            }
            pool.issuer.get_or_insert_with(|| self.cfg.issuer.clone());
            pool.client_id.get_or_insert_with(|| self.cfg.client_id.clone());
            pool.model.get_or_insert_with(|| self.cfg.model.clone());
            pool.codex_endpoint
                .get_or_insert_with(|| self.cfg.codex_endpoint.clone());
            return Ok((pool, PoolOrigin::Pool));
        }

        if !self.cfg.token_path.exists() {
            return Err(RunnerError::TokenFile(format!(
                "OAuth token file not found: {}",
                self.cfg.token_path.display()
            )));
        }
        let raw = std::fs::read_to_string(&self.cfg.token_path)?;
        let data: Value = serde_json::from_str(&raw)?;
        if data.get("version").and_then(Value::as_i64) != Some(1) {
            return Err(RunnerError::TokenFile(
                "invalid token file (expected version=1)".to_string(),
            ));
        }
        let access = data
            .get("accessToken")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let refresh = data
            .get("refreshToken")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if access.is_empty() || refresh.is_empty() {
            return Err(RunnerError::TokenFile(
                "OAuth token file missing accessToken/refreshToken".to_string(),
            ));
        }

        let mut profile = OAuthProfile::new(
            "default",
            access,
            refresh,
            data.get("expiresAtMs").and_then(Value::as_i64).unwrap_or(0),
        );
        profile.account_id = data
            .get("accountId")
            .and_then(Value::as_str)
            .map(str::to_string);
        profile.issuer = Some(
            data.get("issuer")
                .and_then(Value::as_str)
                .unwrap_or(&self.cfg.issuer)
                .to_string(),
        );
        profile.client_id = Some(
            data.get("clientId")
                .and_then(Value::as_str)
                .unwrap_or(&self.cfg.client_id)
                .to_string(),
        );

        let mut pool = OAuthPool::empty();
        pool.issuer = profile.issuer.clone();
        pool.client_id = profile.client_id.clone();
        pool.model = Some(
            data.get("model")
                .and_then(Value::as_str)
                .filter(|m| !m.is_empty())
                .unwrap_or(&self.cfg.model)
                .to_string(),
        );
        pool.codex_endpoint = Some(
            data.get("codexEndpoint")
                .and_then(Value::as_str)
                .filter(|e| !e.is_empty())
                .unwrap_or(&self.cfg.codex_endpoint)
                .to_string(),
        );
        pool.selection.strategy = self.cfg.selection_strategy;
        pool.selection.last_used_profile = Some(profile.profile.clone());
        pool.profiles.insert(profile.profile.clone(), profile);
        Ok((pool, PoolOrigin::Single))
    }

    fn persist_pool(&self, pool: &OAuthPool, origin: PoolOrigin) -> Result<()> {
        match origin {
            PoolOrigin::Pool => {
                save_pool(&self.cfg.pool_path, pool)?;
                Ok(())
            }
            PoolOrigin::Single => {
                // Keep the legacy token file updated for compatibility.
                let Some(profile) = pool.profiles.get("default") else {
                    return Ok(());
                };
                let updated = json!({
                    "version": 1,
                    "provider": SINGLE_TOKEN_PROVIDER,
                    "updatedAt": now_iso(),
                    "issuer": profile.issuer.as_deref().unwrap_or(&self.cfg.issuer),
                    "clientId": profile.client_id.as_deref().unwrap_or(&self.cfg.client_id),
                    "model": pool.model.as_deref().unwrap_or(&self.cfg.model),
                    "codexEndpoint": pool.codex_endpoint.as_deref().unwrap_or(&self.cfg.codex_endpoint),
                    "accountId": profile.account_id,
                    "accessToken": profile.access_token,
                    "refreshToken": profile.refresh_token,
                    "expiresAtMs": profile.expires_at_ms,
                });
                if let Some(parent) = self.cfg.token_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut body = serde_json::to_string_pretty(&updated)?;
                body.push('\n');
                std::fs::write(&self.cfg.token_path, body)?;
                restrict_to_owner(&self.cfg.token_path);
                Ok(())
            }
        }
    }

    async fn ensure_fresh_profile(
        &self,
        pool: &mut OAuthPool,
        name: &str,
        timeout: Duration,
    ) -> std::result::Result<(), RefreshFailure> {
        let (refresh_token, client_id, expired) = match pool.profiles.get(name) {
            Some(profile) => (
                profile.refresh_token.clone(),
                profile
                    .client_id
                    .clone()
                    .unwrap_or_else(|| self.cfg.client_id.clone()),
                profile.is_expired(now_ms()),
            ),
            None => {
                return Err(RefreshFailure::Fatal(RunnerError::MissingProfile(
                    name.to_string(),
                )));
            }
        };
        if !expired {
            return Ok(());
        }
        if refresh_token.is_empty() {
            return Err(RefreshFailure::Fatal(RunnerError::TokenFile(
                "OAuth refresh token missing; re-login required".to_string(),
            )));
        }

        let tokens = match self.refresh(&refresh_token, &client_id, timeout).await {
            Ok(tokens) => tokens,
            Err(err) => {
                if let RunnerError::Refresh { body, .. } = &err
                    && is_refresh_invalid(body)
                {
                    return Err(RefreshFailure::Invalid(body.clone()));
                }
                return Err(RefreshFailure::Fatal(err));
            }
        };

        let access = tokens
            .get("access_token")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if access.is_empty() {
            return Err(RefreshFailure::Fatal(RunnerError::Refresh {
                status: 0,
                body: "token refresh did not return access_token".to_string(),
            }));
        }
        // The issuer does not always rotate the refresh token; reuse the old
        // one when none comes back.
        let next_refresh = tokens
            .get("refresh_token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .unwrap_or(&refresh_token)
            .to_string();
        let expires_in = tokens
            .get("expires_in")
            .and_then(Value::as_i64)
            .unwrap_or(3600);

        if let Some(profile) = pool.profiles.get_mut(name) {
            profile.access_token = access.to_string();
            profile.refresh_token = next_refresh;
            profile.expires_at_ms = now_ms() + expires_in * 1000;
            if let Some(account_id) = extract_account_id(&tokens) {
                profile.account_id = Some(account_id);
            }
            profile.updated_at = Some(now_iso());
        }
        Ok(())
    }

    async fn refresh(
        &self,
        refresh_token: &str,
        client_id: &str,
        timeout: Duration,
    ) -> Result<Value> {
        let url = format!("{}/oauth/token", self.cfg.issuer);
        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", client_id),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            warn!("OAuth refresh failed: {status}");
            return Err(RunnerError::Refresh {
                status: status.as_u16(),
                body: truncate(&body, 500),
            });
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn chat_once(
        &self,
        profile: &OAuthProfile,
        body: &Value,
        timeout: Duration,
    ) -> std::result::Result<Value, ChatOnceError> {
        let mut request = self
            .client
            .post(&self.cfg.codex_endpoint)
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .bearer_auth(&profile.access_token);
        if let Some(account_id) = profile.account_id.as_deref().filter(|id| !id.is_empty()) {
            request = request.header("ChatGPT-Account-Id", account_id);
        }

        let response = request
            .json(body)
            .send()
            .await
            .map_err(|err| ChatOnceError::Other(err.into()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after_ms = parse_retry_after(
                header_str(&response, "Retry-After-Ms").as_deref(),
                header_str(&response, "Retry-After").as_deref(),
            );
            let body = response.text().await.unwrap_or_default();
            return Err(ChatOnceError::Status {
                status: status.as_u16(),
                body,
                retry_after_ms,
            });
        }

        // The endpoint streams server-sent events; `[DONE]` terminates.
        let mut events = response.bytes_stream().eventsource();
        let mut text_parts: Vec<String> = Vec::new();
        let mut last_event: Option<Value> = None;
        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    return Err(ChatOnceError::Other(RunnerError::Http {
                        status: status.as_u16(),
                        body: format!("SSE stream error: {err}"),
                    }));
                }
            };
            let data = event.data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                break;
            }
            let Ok(parsed) = serde_json::from_str::<Value>(data) else {
                continue;
            };
            match parsed.get("type").and_then(Value::as_str) {
                Some("response.output_text.delta") => {
                    if let Some(delta) = parsed.get("delta").and_then(Value::as_str) {
                        text_parts.push(delta.to_string());
                    }
                }
                Some("response.completed") => {
                    if let Some(text) = parsed
                        .pointer("/response/output_text")
                        .and_then(Value::as_str)
                    {
                        return Ok(json!({"output_text": text}));
                    }
                }
                _ => {}
            }
            last_event = Some(parsed);
        }

        if !text_parts.is_empty() {
            return Ok(json!({"output_text": text_parts.concat()}));
        }
        if let Some(event) = last_event {
            return Ok(event);
        }
        Ok(json!({}))
    }

    fn emit_rotate_event(&self, payload: Value) {
        if let Some(evidence) = &self.evidence {
            let mut event = json!({"type": "openai_oauth.rotate", "at": now_iso(), "atMs": now_ms()});
            if let (Some(target), Some(source)) = (event.as_object_mut(), payload.as_object()) {
                for (key, value) in source {
                    target.insert(key.clone(), value.clone());
                }
            }
            evidence.append(event);
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiCodexProvider {
    fn doctor(&self) -> Value {
        let report = self.load_pool_or_single().and_then(|(pool, origin)| {
            let selected =
                pool.choose_profile(self.cfg.selection_profile.as_deref(), now_ms())?;
            let profile = pool
                .profiles
                .get(&selected)
                .ok_or_else(|| RunnerError::MissingProfile(selected.clone()))?;
            Ok(json!({
                "ok": true,
                "mode": "openai-oauth-codex",
                "issuer": self.cfg.issuer,
                "clientId": self.cfg.client_id,
                "model": self.cfg.model,
                "codexEndpoint": self.cfg.codex_endpoint,
                "origin": match origin {
                    PoolOrigin::Pool => "pool",
                    PoolOrigin::Single => "single",
                },
                "poolPath": self.cfg.pool_path.display().to_string(),
                "tokenPath": self.cfg.token_path.display().to_string(),
                "profilesCount": pool.profiles.len(),
                "profiles": pool.list_profiles(),
                "selectionStrategy": pool.selection.strategy,
                "explicitProfile": self.cfg.selection_profile,
                "pinnedProfile": pool.selection.pinned_profile,
                "lastUsedProfile": pool.selection.last_used_profile,
                "selectedProfile": selected,
                "selectedAccountId": profile.account_id,
                "expired": profile.is_expired(now_ms()),
            }))
        });
        report.unwrap_or_else(|err| {
            json!({
                "ok": false,
                "mode": "openai-oauth-codex",
                "error": err.to_string(),
                "poolPath": self.cfg.pool_path.display().to_string(),
                "tokenPath": self.cfg.token_path.display().to_string(),
            })
        })
    }

    async fn chat(&self, messages: &[ChatMessage], timeout: Duration) -> Result<Value> {
        let (mut pool, origin) = self.load_pool_or_single()?;
        pool.selection.strategy = self.cfg.selection_strategy;

        let max_rotations = if self.cfg.max_rotations > 0 {
            self.cfg.max_rotations
        } else {
            pool.profiles.len().max(1)
        };

        let (instructions, input) = split_messages(messages);
        let body = json!({
            "model": pool.model.as_deref().unwrap_or(&self.cfg.model),
            "instructions": instructions,
            "input": input,
            "store": false,
            "stream": true,
        });

        let explicit = self.cfg.selection_profile.as_deref();
        let mut attempted: Vec<String> = Vec::new();
        let mut selected = pool.choose_profile(explicit, now_ms())?;

        for attempt in 0..max_rotations {
            if attempted.contains(&selected) {
                selected = pool.rotate_after(&selected, explicit, now_ms())?;
            }
            attempted.push(selected.clone());

            let refresh_timeout = timeout.min(REFRESH_TIMEOUT_CAP);
            match self
                .ensure_fresh_profile(&mut pool, &selected, refresh_timeout)
                .await
            {
                Ok(()) => {}
                Err(RefreshFailure::Invalid(detail)) => {
                    debug!("refresh token invalid for profile {selected}: {detail}");
                    pool.disable(&selected)?;
                    self.persist_pool(&pool, origin)?;
                    self.emit_rotate_event(json!({
                        "fromProfile": selected,
                        "reason": "refresh_invalid",
                        "attempt": attempt + 1,
                        "attemptedProfiles": attempted,
                    }));
                    if distinct_count(&attempted) >= pool.profiles.len() {
                        return Err(RunnerError::RefreshInvalidExhausted);
                    }
                    selected = pool.rotate_after(&selected, explicit, now_ms())?;
                    continue;
                }
                Err(RefreshFailure::Fatal(err)) => return Err(err),
            }

            let profile = pool
                .profiles
                .get(&selected)
                .cloned()
                .ok_or_else(|| RunnerError::MissingProfile(selected.clone()))?;

            match self.chat_once(&profile, &body, timeout).await {
                Ok(response) => {
                    pool.mark_used(&selected);
                    self.persist_pool(&pool, origin)?;
                    return Ok(response);
                }
                Err(ChatOnceError::Status {
                    status,
                    body,
                    retry_after_ms,
                }) if self.cfg.rotate_on_rate_limit && is_rate_limit(status, &body) => {
                    let retry_after_ms = retry_after_ms.unwrap_or(DEFAULT_RETRY_AFTER_MS);
                    pool.mark_rate_limited(&selected, now_ms() + retry_after_ms);
                    self.persist_pool(&pool, origin)?;
                    self.emit_rotate_event(json!({
                        "fromProfile": selected,
                        "reason": "rate_limit",
                        "status": status,
                        "retryAfterMs": retry_after_ms,
                        "attempt": attempt + 1,
                        "attemptedProfiles": attempted,
                    }));
                    if distinct_count(&attempted) >= pool.profiles.len() {
                        return Err(RunnerError::RateLimitExhausted {
                            profiles: pool.list_profiles(),
                        });
                    }
                    selected = pool.rotate_after(&selected, explicit, now_ms())?;
                }
                Err(ChatOnceError::Status { status, body, .. }) => {
                    return Err(RunnerError::Http {
                        status,
                        body: truncate(&body, 500),
                    });
                }
                Err(ChatOnceError::Other(err)) => return Err(err),
            }
        }

        Err(RunnerError::RotationExhausted { attempted })
    }
}

/// Split a conversation into the `instructions` string (all system messages)
/// and the `input` sequence (user/assistant messages only).
fn split_messages(messages: &[ChatMessage]) -> (String, Vec<Value>) {
    let mut system_parts: Vec<&str> = Vec::new();
    let mut input: Vec<Value> = Vec::new();
    for message in messages {
        match message.role {
            Role::System => system_parts.push(&message.content),
            Role::User | Role::Assistant => {
                input.push(json!({"role": message.role, "content": message.content}));
            }
        }
    }
    let instructions = system_parts.join("\n\n").trim().to_string();
    let instructions = if instructions.is_empty() {
        "Workbench session.".to_string()
    } else {
        instructions
    };
    (instructions, input)
}

fn is_refresh_invalid(body: &str) -> bool {
    body.contains("refresh_token_reused") || body.contains("invalid_grant")
}

/// HTTP 429, or an error body the vendor shapes like a rate limit.
fn is_rate_limit(status: u16, body: &str) -> bool {
    if status == 429 {
        return true;
    }
    let Ok(data) = serde_json::from_str::<Value>(body) else {
        return false;
    };
    if data.get("type").and_then(Value::as_str) != Some("error") {
        return false;
    }
    let Some(error) = data.get("error").and_then(Value::as_object) else {
        return false;
    };
    if let Some(kind) = error.get("type").and_then(Value::as_str)
        && (kind == "too_many_requests" || kind == "rate_limit")
    {
        return true;
    }
    error
        .get("code")
        .and_then(Value::as_str)
        .is_some_and(|code| code.contains("rate_limit"))
}

/// `Retry-After-Ms` (milliseconds) wins over `Retry-After` (seconds or an
/// HTTP date).
fn parse_retry_after(ms_header: Option<&str>, seconds_header: Option<&str>) -> Option<i64> {
    if let Some(raw) = ms_header
        && let Ok(ms) = raw.trim().parse::<f64>()
    {
        return Some((ms as i64).max(0));
    }
    let raw = seconds_header?.trim();
    if let Ok(seconds) = raw.parse::<f64>() {
        return Some(((seconds * 1000.0) as i64).max(0));
    }
    if let Ok(at) = DateTime::parse_from_rfc2822(raw) {
        let delta = at.with_timezone(&Utc).timestamp_millis() - now_ms();
        return Some(delta.max(0));
    }
    None
}

fn header_str(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn distinct_count(attempted: &[String]) -> usize {
    attempted.iter().collect::<BTreeSet<_>>().len()
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn retry_after_prefers_millisecond_header() {
        assert_eq!(parse_retry_after(Some("50"), Some("9")), Some(50));
        assert_eq!(parse_retry_after(None, Some("2")), Some(2000));
        assert_eq!(parse_retry_after(None, Some("1.5")), Some(1500));
        assert_eq!(parse_retry_after(None, None), None);
        assert_eq!(parse_retry_after(Some("junk"), Some("junk")), None);
    }

    #[test]
    fn retry_after_accepts_http_dates() {
        let future = Utc::now() + chrono::Duration::seconds(30);
        let header = future.to_rfc2822();
        let parsed = parse_retry_after(None, Some(&header)).expect("parsed");
        assert!(parsed > 0 && parsed <= 31_000);
    }

    #[test]
    fn rate_limit_sniffs_status_and_body() {
        assert!(is_rate_limit(429, ""));
        assert!(is_rate_limit(
            400,
            &json!({"type": "error", "error": {"type": "too_many_requests"}}).to_string()
        ));
        assert!(is_rate_limit(
            400,
            &json!({"type": "error", "error": {"code": "rate_limit_exceeded"}}).to_string()
        ));
        assert!(!is_rate_limit(500, "oops"));
        assert!(!is_rate_limit(
            400,
            &json!({"type": "error", "error": {"type": "bad_request"}}).to_string()
        ));
    }

    #[test]
    fn split_messages_builds_instructions_and_input() {
        let messages = vec![
            ChatMessage::system("one"),
            ChatMessage::user("hi"),
            ChatMessage::system("two"),
            ChatMessage::assistant("yo"),
        ];
        let (instructions, input) = split_messages(&messages);
        assert_eq!(instructions, "one\n\ntwo");
        assert_eq!(
            input,
            vec![
                json!({"role": "user", "content": "hi"}),
                json!({"role": "assistant", "content": "yo"}),
            ]
        );

        let (fallback, _) = split_messages(&[ChatMessage::user("hi")]);
        assert_eq!(fallback, "Workbench session.");
    }

    #[test]
    fn refresh_invalid_detection() {
        assert!(is_refresh_invalid("{\"error\":\"invalid_grant\"}"));
        assert!(is_refresh_invalid("refresh_token_reused detected"));
        assert!(!is_refresh_invalid("server exploded"));
    }
}
