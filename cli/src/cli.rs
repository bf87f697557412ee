use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use workbench_core::dispatch::DEFAULT_MAX_STEPS;

#[derive(Parser, Debug)]
#[command(name = "workbench", version, about = "Workbench agent runner")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the smoke scenario through the configured LLM provider.
    Run(RunArgs),

    /// Scan MCP server manifests and rewrite the registry file.
    Scan(ScanArgs),

    /// Print the provider's diagnostic snapshot without touching the vendor.
    Doctor,

    /// Manage the OAuth credential pool.
    Pool {
        #[command(subcommand)]
        command: PoolCommand,
    },
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Maximum number of model turns before the run stops.
    #[arg(long, default_value_t = DEFAULT_MAX_STEPS)]
    pub max_steps: usize,
}

#[derive(Parser, Debug)]
pub struct ScanArgs {
    /// Per-server handshake timeout.
    #[arg(long, default_value_t = 10_000)]
    pub timeout_ms: u64,
}

#[derive(Subcommand, Debug)]
pub enum PoolCommand {
    /// List profiles and selection state.
    List,

    /// Set `lastUsedProfile` so sticky selection starts from this profile.
    Activate { profile: String },

    /// Pin every request to one profile.
    Pin { profile: String },

    /// Remove the pin.
    Unpin,

    /// Set the selection strategy (`sticky` or `round-robin`).
    Strategy { strategy: String },

    /// Disable a profile without removing it.
    Disable { profile: String },

    /// Re-enable a disabled profile.
    Enable { profile: String },

    /// Remove a profile from the pool.
    Remove { profile: String },

    /// Ingest a token record (JSON file produced by a login flow) as a
    /// profile.
    Import {
        /// Path to the token record.
        file: PathBuf,

        /// Profile name; defaults to the record's `profile`, then `email`,
        /// then `default`.
        #[arg(long)]
        profile: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_max_steps() {
        let cli = Cli::parse_from(["workbench", "run", "--max-steps", "3"]);
        match cli.command {
            Command::Run(args) => assert_eq!(args.max_steps, 3),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_pool_import_with_profile_override() {
        let cli = Cli::parse_from([
            "workbench",
            "pool",
            "import",
            "/tmp/tokens.json",
            "--profile",
            "work",
        ]);
        match cli.command {
            Command::Pool {
                command: PoolCommand::Import { file, profile },
            } => {
                assert_eq!(file, PathBuf::from("/tmp/tokens.json"));
                assert_eq!(profile.as_deref(), Some("work"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
