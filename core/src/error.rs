use thiserror::Error;
use workbench_mcp_client::McpClientError;

use crate::oauth_pool::PoolError;

/// Failure taxonomy for a run.
///
/// Every variant maps to a stable machine-readable [`kind`](RunnerError::kind)
/// surfaced in the run summary, and to a process exit code: configuration
/// problems exit 2, everything else exits 1.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("runner config error: {0}")]
    Config(String),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(
        "OAuth refresh token invalid for all profiles. Next action: re-login, \
         then re-import the new tokens with `workbench pool import`."
    )]
    RefreshInvalidExhausted,

    #[error("OAuth refresh failed (HTTP {status}): {body}")]
    Refresh { status: u16, body: String },

    #[error("rate limited and no alternate OAuth profiles available: {profiles:?}")]
    RateLimitExhausted { profiles: Vec<String> },

    #[error("failed after rotating OAuth profiles: attempted={attempted:?}")]
    RotationExhausted { attempted: Vec<String> },

    #[error("LLM request failed (HTTP {status}): {body}")]
    Http { status: u16, body: String },

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("selected OAuth profile missing from pool: {0}")]
    MissingProfile(String),

    #[error("{0}")]
    TokenFile(String),

    #[error("LLM output was not parseable JSON too many times")]
    ParseStrikeOut,

    #[error("model ignored the expected tool script too many times; next required tool is {expected}")]
    ToolStrikeOut { expected: String },

    #[error("invalid tool call from model: {0}")]
    InvalidToolCall(String),

    #[error("no tools discovered yet; the model must call the registry scan tool first")]
    NoToolsDiscovered,

    #[error("no MCP server is registered for tool {0}")]
    UnknownTool(String),

    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    McpClient(#[from] McpClientError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RunnerError {
    /// Stable discriminator recorded as `errorKind` in the run summary.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Pool(_) => "pool",
            Self::RefreshInvalidExhausted => "refresh_invalid",
            Self::Refresh { .. } => "http",
            Self::RateLimitExhausted { .. } | Self::RotationExhausted { .. } => "rate_limit",
            Self::Http { .. } | Self::Transport(_) => "http",
            Self::MissingProfile(_) | Self::TokenFile(_) => "pool",
            Self::ParseStrikeOut => "parse",
            Self::ToolStrikeOut { .. } | Self::InvalidToolCall(_) => "tool_mismatch",
            Self::NoToolsDiscovered | Self::UnknownTool(_) => "tool_mismatch",
            Self::Interrupted => "interrupted",
            Self::McpClient(err) => match err {
                McpClientError::Timeout { .. } => "timeout",
                _ => "subprocess",
            },
            Self::Io(_) => "io",
            Self::Json(_) => "internal",
        }
    }

    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, RunnerError>;
