//! Core of the workbench agent runner.
//!
//! The runner drives a language model through a fixed script of MCP tool
//! calls. Credentials for the OAuth-backed model provider live in a pool of
//! profiles with rate-limit-aware rotation; everything observable in a run is
//! appended, redacted, to a JSON-Lines evidence log.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod evidence;
pub mod oauth_pool;
pub mod providers;
pub mod redact;
pub mod registry;
pub mod token_data;
pub mod util;

pub use config::Config;
pub use dispatch::RunSummary;
pub use dispatch::run_dispatch;
pub use error::RunnerError;
pub use evidence::EvidenceWriter;
