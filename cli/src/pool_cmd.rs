//! `workbench pool …` subcommands: straight-line mutations of the OAuth
//! credential pool file.

use std::path::Path;

use anyhow::Context;
use anyhow::bail;
use serde_json::Value;
use serde_json::json;
use workbench_core::config::Config;
use workbench_core::config::pool_path_from_env;
use workbench_core::oauth_pool::OAuthProfile;
use workbench_core::oauth_pool::SelectionStrategy;
use workbench_core::oauth_pool::load_pool;
use workbench_core::oauth_pool::save_pool;

use crate::cli::PoolCommand;

pub fn run(config: &Config, command: PoolCommand) -> u8 {
    let pool_path = pool_path_from_env(&config.state_dir);
    match execute(&pool_path, command) {
        Ok(message) => {
            println!("{message}");
            0
        }
        Err(err) => {
            eprintln!("{err:#}");
            2
        }
    }
}

fn execute(pool_path: &Path, command: PoolCommand) -> anyhow::Result<String> {
    let mut pool = load_pool(pool_path)?;

    match command {
        PoolCommand::List => {
            let profiles: Vec<Value> = pool
                .profiles
                .values()
                .map(|p| {
                    json!({
                        "profile": p.profile,
                        "email": p.email,
                        "accountId": p.account_id,
                        "disabled": p.disabled,
                        "rateLimitedUntilMs": p.rate_limited_until_ms,
                        "expiresAtMs": p.expires_at_ms,
                        "updatedAt": p.updated_at,
                    })
                })
                .collect();
            let listing = json!({
                "poolPath": pool_path.display().to_string(),
                "version": pool.version,
                "provider": pool.provider,
                "selection": pool.selection,
                "profiles": profiles,
            });
            Ok(serde_json::to_string_pretty(&listing)?)
        }
        PoolCommand::Strategy { strategy } => {
            let normalized = strategy.trim().to_lowercase();
            if normalized != "sticky" && normalized != "round-robin" {
                bail!("strategy must be one of: sticky, round-robin");
            }
            pool.set_strategy(SelectionStrategy::parse(&normalized));
            save_pool(pool_path, &pool)?;
            Ok(format!("Set selection strategy: {normalized}"))
        }
        PoolCommand::Activate { profile } => {
            pool.activate(&profile)?;
            save_pool(pool_path, &pool)?;
            Ok(format!("Activated profile (lastUsedProfile): {profile}"))
        }
        PoolCommand::Pin { profile } => {
            pool.pin(&profile)?;
            save_pool(pool_path, &pool)?;
            Ok(format!("Pinned profile: {profile}"))
        }
        PoolCommand::Unpin => {
            pool.unpin();
            save_pool(pool_path, &pool)?;
            Ok("Unpinned profile".to_string())
        }
        PoolCommand::Disable { profile } => {
            pool.disable(&profile)?;
            save_pool(pool_path, &pool)?;
            Ok(format!("Disabled profile: {profile}"))
        }
        PoolCommand::Enable { profile } => {
            pool.enable(&profile)?;
            save_pool(pool_path, &pool)?;
            Ok(format!("Enabled profile: {profile}"))
        }
        PoolCommand::Remove { profile } => {
            pool.remove(&profile)?;
            save_pool(pool_path, &pool)?;
            Ok(format!("Removed profile: {profile}"))
        }
        PoolCommand::Import { file, profile } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read token record {}", file.display()))?;
            let record: Value = serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in {}", file.display()))?;

            let name = profile
                .or_else(|| record.get("profile").and_then(Value::as_str).map(String::from))
                .or_else(|| record.get("email").and_then(Value::as_str).map(String::from))
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "default".to_string());

            let mut imported = OAuthProfile::from_value(&record);
            imported.profile = name.clone();
            if imported.access_token.is_empty() || imported.refresh_token.is_empty() {
                bail!("token record missing accessToken/refreshToken");
            }

            // Shared pool fields inherit from the record when it carries them.
            for (field, key) in [
                (&mut pool.issuer, "issuer"),
                (&mut pool.client_id, "clientId"),
                (&mut pool.model, "model"),
                (&mut pool.codex_endpoint, "codexEndpoint"),
            ] {
                if let Some(value) = record.get(key).and_then(Value::as_str).filter(|v| !v.is_empty())
                {
                    *field = Some(value.to_string());
                }
            }

            pool.upsert_profile(imported);
            save_pool(pool_path, &pool)?;
            Ok(format!("Imported profile: {name}"))
        }
    }
}
