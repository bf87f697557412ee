//! MCP server registry: manifest discovery, the scan that handshakes every
//! server, and the derived tool-to-server mapping.
//!
//! The scan rewrites a single registry file atomically; a failure on one
//! server is recorded in its entry and never aborts the others.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use tracing::warn;
use workbench_mcp_client::McpStdioClient;

use crate::error::Result;
use crate::util::now_iso;

/// The registry server itself is excluded from scans: it is the one server
/// the runner always knows how to reach without a registry.
pub const REGISTRY_SERVER_NAME: &str = "workbench.registry";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerManifest {
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub transport: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ServerManifest {
    /// Working directory for the server process, resolved against the repo
    /// root.
    pub fn resolved_cwd(&self, repo_root: &Path) -> PathBuf {
        match self.cwd.as_deref() {
            Some(cwd) if !cwd.is_empty() => repo_root.join(cwd),
            _ => repo_root.to_path_buf(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub version: i64,
    pub name: String,
    pub manifest: ServerManifest,
    pub last_scanned_at: String,
    pub last_handshake_ok: bool,
    pub last_error: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryFile {
    pub version: i64,
    pub updated_at: String,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerRecord>,
}

/// `toolName -> (serverName, manifest)`, derived from the registry file.
pub type ToolMapping = BTreeMap<String, (String, ServerManifest)>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    pub name: String,
    pub last_handshake_ok: bool,
    pub tools: Option<Vec<String>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanOutcome {
    pub scanned: usize,
    pub results: Vec<ScanResult>,
    pub registry_path: PathBuf,
}

pub fn registry_path(state_dir: &Path) -> PathBuf {
    state_dir.join("registry").join("mcp.json")
}

/// Discover stdio server manifests under `mcp/servers/*/manifest.json`.
///
/// Entries with the wrong version, a non-stdio transport, a missing command,
/// or the reserved registry name are skipped, as are unreadable files.
pub fn discover_manifests(repo_root: &Path) -> Vec<ServerManifest> {
    let servers_dir = repo_root.join("mcp").join("servers");
    let Ok(entries) = std::fs::read_dir(&servers_dir) else {
        return Vec::new();
    };

    let mut manifests = Vec::new();
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();

    for dir in dirs {
        let manifest_path = dir.join("manifest.json");
        let Ok(raw) = std::fs::read_to_string(&manifest_path) else {
            continue;
        };
        let Ok(manifest) = serde_json::from_str::<ServerManifest>(&raw) else {
            debug!("skipping unparseable manifest at {}", manifest_path.display());
            continue;
        };
        if manifest.version != 1
            || manifest.transport != "stdio"
            || manifest.command.is_empty()
            || manifest.name == REGISTRY_SERVER_NAME
        {
            continue;
        }
        manifests.push(manifest);
    }
    manifests
}

/// Start every discovered server, perform `initialize` + `tools/list`, and
/// atomically rewrite the registry file with the outcome.
pub async fn scan_registry(
    repo_root: &Path,
    state_dir: &Path,
    timeout: Duration,
) -> Result<ScanOutcome> {
    let manifests = discover_manifests(repo_root);
    let mut results = Vec::new();
    let mut servers = BTreeMap::new();
    let now = now_iso();

    for manifest in manifests {
        let result = scan_one(&manifest, repo_root, timeout).await;
        servers.insert(
            result.name.clone(),
            ServerRecord {
                version: 1,
                name: result.name.clone(),
                manifest,
                last_scanned_at: now.clone(),
                last_handshake_ok: result.last_handshake_ok,
                last_error: result.last_error.clone(),
                tools: result.tools.clone().unwrap_or_default(),
            },
        );
        results.push(result);
    }

    let registry = RegistryFile {
        version: 1,
        updated_at: now,
        servers,
    };
    let path = registry_path(state_dir);
    write_registry_atomically(&path, &registry)?;

    Ok(ScanOutcome {
        scanned: results.len(),
        results,
        registry_path: path,
    })
}

async fn scan_one(manifest: &ServerManifest, repo_root: &Path, timeout: Duration) -> ScanResult {
    let mut result = ScanResult {
        name: manifest.name.clone(),
        last_handshake_ok: false,
        tools: None,
        last_error: None,
    };

    let mut client = McpStdioClient::new(
        manifest.command.clone(),
        &manifest.resolved_cwd(repo_root),
        manifest.env.clone(),
    );

    match client.initialize(timeout).await {
        Ok(init) => {
            if let Some(error) = init.get("error") {
                result.last_error = Some(error_message(error));
                client.stop();
                return result;
            }
            result.last_handshake_ok = true;
        }
        Err(err) => {
            result.last_error = Some(err.to_string());
            client.stop();
            return result;
        }
    }

    match client.list_tools(timeout).await {
        Ok(listed) => {
            if let Some(error) = listed.get("error") {
                result.last_error = Some(error_message(error));
            } else {
                let tools = listed
                    .pointer("/result/tools")
                    .and_then(Value::as_array)
                    .map(|tools| {
                        tools
                            .iter()
                            .filter_map(|tool| tool.get("name").and_then(Value::as_str))
                            .map(str::to_string)
                            .collect::<Vec<String>>()
                    })
                    .unwrap_or_default();
                result.tools = Some(tools);
            }
        }
        Err(err) => {
            result.last_error = Some(err.to_string());
        }
    }

    client.stop();
    result
}

fn error_message(error: &Value) -> String {
    error
        .get("message")
        .and_then(Value::as_str)
        .map_or_else(|| error.to_string(), str::to_string)
}

fn write_registry_atomically(path: &Path, registry: &RegistryFile) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) => parent,
        None => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;
    let mut body = serde_json::to_string_pretty(registry)?;
    body.push('\n');

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(body.as_bytes())?;
    tmp.persist(path)
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    Ok(())
}

/// Load the registry file and derive the tool-to-server mapping.
///
/// Tool names are assumed globally unique; if two servers expose the same
/// name, the first (in sorted server order) wins and the collision is logged.
pub fn load_tool_mapping(state_dir: &Path) -> Result<ToolMapping> {
    let raw = std::fs::read_to_string(registry_path(state_dir))?;
    let registry: RegistryFile = serde_json::from_str(&raw)?;

    let mut mapping = ToolMapping::new();
    for (server_name, record) in &registry.servers {
        for tool in &record.tools {
            if mapping.contains_key(tool) {
                warn!("tool name collision for `{tool}`; keeping the first registration");
                continue;
            }
            mapping.insert(tool.clone(), (server_name.clone(), record.manifest.clone()));
        }
    }
    Ok(mapping)
}

/// Build the `registry.loaded` summary fields from a mapping.
pub fn mapping_summary(mapping: &ToolMapping) -> (Vec<String>, Vec<String>) {
    let mut servers: Vec<String> = mapping
        .values()
        .map(|(server, _)| server.clone())
        .collect();
    servers.sort();
    servers.dedup();
    let tools: Vec<String> = mapping.keys().cloned().collect();
    (servers, tools)
}
