//! Entry-point for the `workbench` binary.
//!
//! Thin front-end over `workbench-core`: argument parsing, tracing setup,
//! human-facing output, and exit codes (0 success, 1 runtime failure,
//! 2 configuration failure).

mod cli;
mod pool_cmd;

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use workbench_core::config::Config;
use workbench_core::dispatch;
use workbench_core::providers::resolve_provider;
use workbench_core::registry::scan_registry;

use crate::cli::Cli;
use crate::cli::Command;
use crate::cli::RunArgs;
use crate::cli::ScanArgs;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let repo_root = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(err) => {
            eprintln!("failed to resolve working directory: {err}");
            return ExitCode::from(1);
        }
    };
    let config = Config::from_env(&repo_root);

    let code = match cli.command {
        Command::Run(args) => run_cmd(&config, args).await,
        Command::Scan(args) => scan_cmd(&config, args).await,
        Command::Doctor => doctor_cmd(&config),
        Command::Pool { command } => pool_cmd::run(&config, command),
    };
    ExitCode::from(code)
}

async fn run_cmd(config: &Config, args: RunArgs) -> u8 {
    let (summary, code) = dispatch::run(config, args.max_steps).await;
    match serde_json::to_string_pretty(&summary) {
        Ok(text) => println!("{text}"),
        Err(err) => eprintln!("failed to render summary: {err}"),
    }

    if code == 2 {
        println!(
            "\n[workbench-runner] CONFIG ERROR: {}",
            summary.error.as_deref().unwrap_or("unknown")
        );
        println!("- Evidence: {}", summary.events);
    } else if code != 0 {
        println!("\n[workbench-runner] FAILED");
        println!("- Evidence: {}", summary.events);
        println!("- Next action: run in mock mode: WORKBENCH_PROVIDER=mock workbench run");
        if summary.provider.get("mode").and_then(serde_json::Value::as_str)
            == Some("openai-oauth-codex")
        {
            println!(
                "- Next action (openai oauth): re-login, import the new tokens with \
                 `workbench pool import`, then rerun."
            );
        }
    } else {
        println!("\n[workbench-runner] OK");
        println!("- Evidence: {}", summary.events);
    }

    code.clamp(0, u8::MAX as i32) as u8
}

async fn scan_cmd(config: &Config, args: ScanArgs) -> u8 {
    match scan_registry(
        &config.repo_root,
        &config.state_dir,
        Duration::from_millis(args.timeout_ms),
    )
    .await
    {
        Ok(outcome) => {
            match serde_json::to_string(&outcome) {
                Ok(text) => println!("{text}"),
                Err(err) => eprintln!("failed to render scan outcome: {err}"),
            }
            0
        }
        Err(err) => {
            eprintln!("registry scan failed: {err}");
            1
        }
    }
}

fn doctor_cmd(config: &Config) -> u8 {
    match resolve_provider(config, None) {
        Ok(resolved) => {
            let doctor = resolved.provider.doctor();
            match serde_json::to_string_pretty(&doctor) {
                Ok(text) => println!("{text}"),
                Err(err) => eprintln!("failed to render doctor report: {err}"),
            }
            0
        }
        Err(err) => {
            eprintln!("{err}");
            err.exit_code().clamp(0, u8::MAX as i32) as u8
        }
    }
}
