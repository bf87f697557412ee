//! Environment-derived runner configuration.
//!
//! Every knob has a canonical `WORKBENCH_*` environment variable; values that
//! identify the OAuth application (client id, model, endpoint) additionally
//! fall back to whatever the pool or legacy token file recorded, so a saved
//! login is enough to run without re-exporting anything.

use std::env;
use std::path::Path;
use std::path::PathBuf;

use serde_json::Value;

use crate::evidence::DEFAULT_EVIDENCE_MAX_BYTES;
use crate::oauth_pool::SelectionStrategy;
use crate::oauth_pool::load_pool;

pub const STATE_DIR_ENV_VAR: &str = "WORKBENCH_STATE_DIR";
pub const PROVIDER_ENV_VAR: &str = "WORKBENCH_PROVIDER";
pub const OAUTH_ISSUER_ENV_VAR: &str = "WORKBENCH_OPENAI_OAUTH_ISSUER";
pub const OAUTH_CLIENT_ID_ENV_VAR: &str = "WORKBENCH_OPENAI_OAUTH_CLIENT_ID";
pub const MODEL_ENV_VAR: &str = "WORKBENCH_OPENAI_MODEL";
pub const CODEX_ENDPOINT_ENV_VAR: &str = "WORKBENCH_OPENAI_CODEX_ENDPOINT";
pub const OAUTH_TOKEN_PATH_ENV_VAR: &str = "WORKBENCH_OPENAI_OAUTH_TOKEN_PATH";
pub const OAUTH_POOL_PATH_ENV_VAR: &str = "WORKBENCH_OPENAI_OAUTH_POOL_PATH";
pub const OAUTH_PROFILE_ENV_VAR: &str = "WORKBENCH_OPENAI_OAUTH_PROFILE";
pub const OAUTH_STRATEGY_ENV_VAR: &str = "WORKBENCH_OPENAI_OAUTH_STRATEGY";
pub const OAUTH_ROTATE_ENV_VAR: &str = "WORKBENCH_OPENAI_OAUTH_ROTATE_ON_RATE_LIMIT";
pub const OAUTH_MAX_ROTATIONS_ENV_VAR: &str = "WORKBENCH_OPENAI_OAUTH_MAX_ROTATIONS";
pub const EVIDENCE_MAX_BYTES_ENV_VAR: &str = "WORKBENCH_EVIDENCE_MAX_BYTES";
pub const REGISTRY_COMMAND_ENV_VAR: &str = "WORKBENCH_REGISTRY_COMMAND";

pub const DEFAULT_ISSUER: &str = "https://auth.openai.com";
pub const DEFAULT_CODEX_ENDPOINT: &str = "https://chatgpt.com/backend-api/codex/responses";
pub const DEFAULT_MODEL: &str = "gpt-5.2-codex";

/// Runner-level configuration, independent of any provider.
#[derive(Debug, Clone)]
pub struct Config {
    pub repo_root: PathBuf,
    pub state_dir: PathBuf,
    pub provider_mode: String,
    pub evidence_max_bytes: u64,
    /// Command line for the statically-known registry MCP server.
    pub registry_command: Vec<String>,
}

impl Config {
    pub fn from_env(repo_root: &Path) -> Self {
        let state_dir = env_string(STATE_DIR_ENV_VAR)
            .map_or_else(|| repo_root.join(".workbench"), PathBuf::from);
        let registry_command = env_string(REGISTRY_COMMAND_ENV_VAR)
            .map(|raw| raw.split_whitespace().map(str::to_string).collect())
            .unwrap_or_else(|| {
                vec![
                    "bun".to_string(),
                    "mcp/servers/registry/src/index.js".to_string(),
                ]
            });
        Self {
            repo_root: repo_root.to_path_buf(),
            state_dir,
            provider_mode: env_string(PROVIDER_ENV_VAR).unwrap_or_else(|| "auto".to_string()),
            evidence_max_bytes: env_string(EVIDENCE_MAX_BYTES_ENV_VAR)
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(DEFAULT_EVIDENCE_MAX_BYTES),
            registry_command,
        }
    }
}

/// Everything the OAuth-backed provider needs.
#[derive(Debug, Clone)]
pub struct OpenAiOauthConfig {
    pub issuer: String,
    pub client_id: String,
    pub model: String,
    pub codex_endpoint: String,
    pub token_path: PathBuf,
    pub pool_path: PathBuf,
    pub selection_profile: Option<String>,
    pub selection_strategy: SelectionStrategy,
    pub rotate_on_rate_limit: bool,
    /// 0 means "one attempt per profile".
    pub max_rotations: usize,
}

/// How the OAuth config could not be assembled.
pub struct MissingClientId;

impl OpenAiOauthConfig {
    /// Assemble the OAuth config from the environment, falling back to the
    /// pool file and then the legacy token file for client id / model /
    /// endpoint.
    pub fn from_env(state_dir: &Path) -> Result<Self, MissingClientId> {
        let issuer = env_string(OAUTH_ISSUER_ENV_VAR)
            .unwrap_or_else(|| DEFAULT_ISSUER.to_string())
            .trim_end_matches('/')
            .to_string();
        let mut codex_endpoint =
            env_string(CODEX_ENDPOINT_ENV_VAR).unwrap_or_else(|| DEFAULT_CODEX_ENDPOINT.to_string());

        let token_path = env_string(OAUTH_TOKEN_PATH_ENV_VAR).map_or_else(
            || state_dir.join("auth").join("openai_codex_oauth.json"),
            PathBuf::from,
        );
        let pool_path = pool_path_from_env(state_dir);

        let mut client_id = env_string(OAUTH_CLIENT_ID_ENV_VAR).unwrap_or_default();
        let mut model = env_string(MODEL_ENV_VAR).unwrap_or_default();

        // Avoid manual guesswork: saved pool/token files already carry the
        // client id, model, and endpoint of the login that produced them.
        if (client_id.is_empty() || model.is_empty())
            && pool_path.exists()
            && let Ok(pool) = load_pool(&pool_path)
        {
            if client_id.is_empty() {
                client_id = pool.client_id.unwrap_or_default();
            }
            if model.is_empty() {
                model = pool.model.unwrap_or_default();
            }
            if let Some(endpoint) = pool.codex_endpoint.filter(|e| !e.trim().is_empty()) {
                codex_endpoint = endpoint;
            }
        }

        if (client_id.is_empty() || model.is_empty())
            && token_path.exists()
            && let Ok(raw) = std::fs::read_to_string(&token_path)
            && let Ok(data) = serde_json::from_str::<Value>(&raw)
        {
            if client_id.is_empty()
                && let Some(id) = data.get("clientId").and_then(Value::as_str)
            {
                client_id = id.to_string();
            }
            if model.is_empty()
                && let Some(m) = data.get("model").and_then(Value::as_str)
            {
                model = m.to_string();
            }
            if let Some(endpoint) = data
                .get("codexEndpoint")
                .and_then(Value::as_str)
                .filter(|e| !e.trim().is_empty())
            {
                codex_endpoint = endpoint.to_string();
            }
        }

        if client_id.is_empty() {
            return Err(MissingClientId);
        }
        if model.is_empty() {
            model = DEFAULT_MODEL.to_string();
        }

        let selection_profile = env_string(OAUTH_PROFILE_ENV_VAR).filter(|p| !p.is_empty());
        let selection_strategy = env_string(OAUTH_STRATEGY_ENV_VAR)
            .map(|raw| SelectionStrategy::parse(&raw))
            .unwrap_or_default();

        Ok(Self {
            issuer,
            client_id,
            model,
            codex_endpoint,
            token_path,
            pool_path,
            selection_profile,
            selection_strategy,
            rotate_on_rate_limit: env_string(OAUTH_ROTATE_ENV_VAR).as_deref() != Some("0"),
            max_rotations: env_string(OAUTH_MAX_ROTATIONS_ENV_VAR)
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0),
        })
    }
}

/// Pool file location: env override, else `<state_dir>/auth/...`.
pub fn pool_path_from_env(state_dir: &Path) -> PathBuf {
    env_string(OAUTH_POOL_PATH_ENV_VAR).map_or_else(
        || state_dir.join("auth").join("openai_codex_oauth_pool.json"),
        PathBuf::from,
    )
}

fn env_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
