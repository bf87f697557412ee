//! LLM provider seam.
//!
//! The dispatch loop only needs three capabilities from a back-end: a dry
//! diagnostic, one chat turn, and text extraction from whatever response
//! shape came back. Selection is a flat switch over the configured mode
//! string, with `auto` preferring OAuth whenever saved credentials exist.

pub mod mock;
pub mod openai_oauth;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

use crate::config::Config;
use crate::config::OpenAiOauthConfig;
use crate::error::Result;
use crate::error::RunnerError;
use crate::evidence::EvidenceWriter;
use crate::providers::mock::MockProvider;
use crate::providers::openai_oauth::OpenAiCodexProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// The narrow capability set the runner requires from any LLM back-end.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Cheap, side-effect-free diagnostic snapshot.
    fn doctor(&self) -> Value;

    /// One model turn over the given conversation.
    async fn chat(&self, messages: &[ChatMessage], timeout: Duration) -> Result<Value>;

    /// Pull the assistant text out of a provider response.
    fn extract_text(&self, response: &Value) -> String {
        extract_text(response)
    }
}

/// Text extraction across the response shapes the runner encounters:
/// `output_text`, chat-completions `choices`, and nested Responses-API
/// `output[i].content[j].text` items.
pub fn extract_text(response: &Value) -> String {
    if let Some(text) = response.get("output_text").and_then(Value::as_str) {
        return text.to_string();
    }
    if let Some(content) = response
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
    {
        return content.to_string();
    }
    if let Some(output) = response.get("output").and_then(Value::as_array) {
        let texts: Vec<&str> = output
            .iter()
            .filter_map(|item| item.get("content").and_then(Value::as_array))
            .flatten()
            .filter_map(|chunk| chunk.get("text").and_then(Value::as_str))
            .collect();
        if !texts.is_empty() {
            return texts.concat();
        }
    }
    String::new()
}

/// A resolved provider plus what the evidence log needs to know about it.
pub struct ResolvedProvider {
    pub provider: Arc<dyn LlmProvider>,
    pub info: Value,
    /// Secret strings (access/refresh tokens) that seed the redactor.
    pub secrets: Vec<String>,
}

/// Flat switch over the provider mode string.
///
/// `auto` prefers OAuth when a pool or token file exists; it never silently
/// falls back to the mock provider, which must be requested explicitly.
pub fn resolve_provider(
    config: &Config,
    evidence: Option<Arc<EvidenceWriter>>,
) -> Result<ResolvedProvider> {
    let mode = config.provider_mode.trim().to_lowercase();
    match mode.as_str() {
        "mock" | "mock-v1" => Ok(ResolvedProvider {
            provider: Arc::new(MockProvider::new()),
            info: json!({
                "mode": "mock",
                "baseUrl": null,
                "model": null,
                "sendAuth": false,
                "authReason": "mock provider",
            }),
            secrets: Vec::new(),
        }),
        "openai-oauth" | "openai-codex-oauth" | "oauth-openai" => {
            resolve_openai_oauth(config, evidence).map_err(|_| {
                RunnerError::Config(format!(
                    "missing OpenAI OAuth client id. Set {} (or import saved tokens with \
                     `workbench pool import`) and rerun.",
                    crate::config::OAUTH_CLIENT_ID_ENV_VAR
                ))
            })
        }
        "auto" => {
            if let Ok(resolved) = resolve_openai_oauth(config, evidence) {
                return Ok(resolved);
            }
            Err(RunnerError::Config(
                "no provider configured. Examples:\n\
                 WORKBENCH_PROVIDER=mock workbench run  # offline\n\
                 WORKBENCH_PROVIDER=openai-oauth workbench run  # after a login was imported"
                    .to_string(),
            ))
        }
        other => Err(RunnerError::Config(format!(
            "unknown provider mode: {other}. Supported: auto, openai-oauth, mock"
        ))),
    }
}

fn resolve_openai_oauth(
    config: &Config,
    evidence: Option<Arc<EvidenceWriter>>,
) -> std::result::Result<ResolvedProvider, crate::config::MissingClientId> {
    let oauth = OpenAiOauthConfig::from_env(&config.state_dir)?;
    let secrets = collect_oauth_secrets(&oauth);
    let info = json!({
        "mode": "openai-oauth-codex",
        "baseUrl": oauth.codex_endpoint,
        "model": oauth.model,
        "sendAuth": true,
        "authReason": "OpenAI OAuth access token (stored under the state dir)",
        "tokenPath": oauth.token_path.display().to_string(),
        "poolPath": oauth.pool_path.display().to_string(),
        "profile": oauth.selection_profile,
    });
    Ok(ResolvedProvider {
        provider: Arc::new(OpenAiCodexProvider::new(oauth, evidence)),
        info,
        secrets,
    })
}

/// Pull every access/refresh token out of the saved pool (or legacy token
/// file) so the redactor can scrub them from the evidence log.
fn collect_oauth_secrets(oauth: &OpenAiOauthConfig) -> Vec<String> {
    let mut secrets = Vec::new();
    let mut push_tokens = |value: &Value| {
        for key in ["accessToken", "refreshToken"] {
            if let Some(token) = value.get(key).and_then(Value::as_str)
                && !token.is_empty()
            {
                secrets.push(token.to_string());
            }
        }
    };

    if oauth.pool_path.exists() {
        if let Ok(raw) = std::fs::read_to_string(&oauth.pool_path)
            && let Ok(data) = serde_json::from_str::<Value>(&raw)
            && let Some(profiles) = data.get("profiles").and_then(Value::as_object)
        {
            for profile in profiles.values() {
                push_tokens(profile);
            }
        }
    } else if let Ok(raw) = std::fs::read_to_string(&oauth.token_path)
        && let Ok(data) = serde_json::from_str::<Value>(&raw)
    {
        push_tokens(&data);
    }
    secrets
}
