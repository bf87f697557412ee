//! The tool-dispatch loop: drive the LLM through a fixed script of MCP tool
//! calls, route each call to its server, and record everything (redacted) in
//! the evidence log.
//!
//! The first call of every script is the registry scan, which is always
//! routed to the statically-known registry server; only after it succeeds is
//! the tool-to-server mapping loaded and the remaining tools become
//! routable. Malformed model output and script deviations get a steering
//! reply; five cumulative strikes end the run.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use sha2::Digest;
use sha2::Sha256;
use tracing::info;
use workbench_mcp_client::McpStdioClient;

use crate::config::Config;
use crate::error::Result;
use crate::error::RunnerError;
use crate::evidence::EvidenceWriter;
use crate::providers::ChatMessage;
use crate::providers::LlmProvider;
use crate::providers::resolve_provider;
use crate::redact::redact_text;
use crate::redact::redact_value;
use crate::registry::REGISTRY_SERVER_NAME;
use crate::registry::ToolMapping;
use crate::registry::load_tool_mapping;
use crate::registry::mapping_summary;
use crate::registry::registry_path;
use crate::util::now_iso;

pub const SUMMARY_SCHEMA_VERSION: i64 = 1;
pub const DEFAULT_MAX_STEPS: usize = 12;

/// The fixed smoke script the model is expected to follow, in order.
pub const EXPECTED_SMOKE_SCRIPT: &[&str] = &[
    "workbench.registry.scan",
    "workbench.workflow.upload",
    "workbench.workflow.status",
    "workbench.workflow.update",
    "workbench.workflow.status",
];

pub const REGISTRY_SCAN_TOOL: &str = "workbench.registry.scan";
const WORKFLOW_UPLOAD_TOOL: &str = "workbench.workflow.upload";

/// Cumulative cap on malformed / misrouted model outputs.
const MAX_BAD_OUTPUTS: usize = 5;
/// Raw provider responses in evidence are capped at this many characters.
const RAW_TEXT_CAP: usize = 20_000;

const CHAT_TIMEOUT: Duration = Duration::from_secs(60);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const SCAN_CALL_TIMEOUT: Duration = Duration::from_secs(120);
const TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub schema_version: i64,
    pub run_id: String,
    pub run_dir: String,
    pub events: String,
    pub workflow_id: Option<String>,
    pub discovered_servers: Vec<String>,
    pub discovered_tools: Vec<String>,
    pub tool_calls_seen: Vec<String>,
    pub provider: Value,
    pub provider_doctor: Value,
    pub state_dir: String,
    pub error_kind: Option<String>,
    pub error: Option<String>,
}

/// What the loop produced, successful or not.
pub struct LoopOutcome {
    pub workflow_id: Option<String>,
    pub discovered_servers: Vec<String>,
    pub discovered_tools: Vec<String>,
    pub tool_calls_seen: Vec<String>,
    pub error: Option<RunnerError>,
}

struct LoopState {
    tool_clients: BTreeMap<String, McpStdioClient>,
    tool_to_server: ToolMapping,
    workflow_id: Option<String>,
    discovered_servers: Vec<String>,
    discovered_tools: Vec<String>,
    tool_calls_seen: Vec<String>,
}

/// Run the dispatch loop against an already-resolved provider.
///
/// Never panics or returns early without cleanup: every spawned server
/// client is stopped, and any failure is recorded as a `run.error` event
/// before being surfaced in the outcome.
pub async fn run_dispatch(
    config: &Config,
    provider: &dyn LlmProvider,
    secrets: &[String],
    evidence: &EvidenceWriter,
    expected: &[&str],
    max_steps: usize,
) -> LoopOutcome {
    let mut state = LoopState {
        tool_clients: BTreeMap::new(),
        tool_to_server: ToolMapping::new(),
        workflow_id: None,
        discovered_servers: Vec::new(),
        discovered_tools: Vec::new(),
        tool_calls_seen: Vec::new(),
    };

    // A Ctrl-C mid-run still produces a run.error event and clean shutdown.
    let result = tokio::select! {
        result = state.run(config, provider, secrets, evidence, expected, max_steps) => result,
        _ = tokio::signal::ctrl_c() => Err(RunnerError::Interrupted),
    };

    for client in state.tool_clients.values_mut() {
        client.stop();
    }

    let error = result.err();
    if let Some(err) = &error {
        evidence.append(json!({
            "type": "run.error",
            "at": now_iso(),
            "errorKind": err.kind(),
            "error": redact_text(&err.to_string(), secrets),
        }));
    }

    LoopOutcome {
        workflow_id: state.workflow_id,
        discovered_servers: state.discovered_servers,
        discovered_tools: state.discovered_tools,
        tool_calls_seen: state.tool_calls_seen,
        error,
    }
}

impl LoopState {
    async fn run(
        &mut self,
        config: &Config,
        provider: &dyn LlmProvider,
        secrets: &[String],
        evidence: &EvidenceWriter,
        expected: &[&str],
        max_steps: usize,
    ) -> Result<()> {
        // Tool routing starts with the registry server only; everything else
        // becomes routable after the scan succeeds.
        let mut registry = McpStdioClient::new(
            config.registry_command.clone(),
            &config.repo_root,
            std::collections::HashMap::new(),
        );
        registry.initialize(HANDSHAKE_TIMEOUT).await?;
        let listed = registry.list_tools(HANDSHAKE_TIMEOUT).await?;
        let mut registry_tools: Vec<String> = listed
            .pointer("/result/tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(|tool| tool.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        registry_tools.sort();
        self.tool_clients
            .insert(REGISTRY_SERVER_NAME.to_string(), registry);

        let mut messages = initial_messages(&registry_tools);
        let mut expected_i = 0usize;
        let mut bad_outputs = 0usize;

        for step in 0..max_steps {
            evidence.append(json!({
                "type": "llm.request",
                "at": now_iso(),
                "step": step,
                "messages": redact_value(&serde_json::to_value(&messages)?, secrets),
            }));

            let llm_response = provider.chat(&messages, CHAT_TIMEOUT).await?;
            let content = provider.extract_text(&llm_response);
            let mut raw_text = redact_value(&llm_response, secrets).to_string();
            if raw_text.len() > RAW_TEXT_CAP {
                raw_text.truncate(floor_char_boundary(&raw_text, RAW_TEXT_CAP));
                raw_text.push_str("...<truncated>");
            }
            let content_redacted = redact_text(&content, secrets);
            evidence.append(json!({
                "type": "llm.response",
                "at": now_iso(),
                "step": step,
                "rawText": raw_text,
                "content": content_redacted.clone(),
            }));

            let call = match parse_tool_json(&content) {
                Ok(call) => call,
                Err(parse_error) => {
                    evidence.append(json!({
                        "type": "llm.parse_error",
                        "at": now_iso(),
                        "error": parse_error,
                        "content": content_redacted.clone(),
                    }));
                    bad_outputs += 1;
                    if bad_outputs >= MAX_BAD_OUTPUTS {
                        return Err(RunnerError::ParseStrikeOut);
                    }
                    let next_required = expected.get(expected_i).copied().unwrap_or(
                        expected.last().copied().unwrap_or(REGISTRY_SCAN_TOOL),
                    );
                    messages.push(ChatMessage::assistant(content_redacted));
                    messages.push(ChatMessage::user(format!(
                        "Output ONLY a single-line JSON tool call. No prose.\n\
                         Example: {{\"tool\":\"{next_required}\",\"arguments\":{{...}}}}"
                    )));
                    continue;
                }
            };

            if let Some(final_value) = call.get("final") {
                if expected_i < expected.len() {
                    bad_outputs += 1;
                    if bad_outputs >= MAX_BAD_OUTPUTS {
                        return Err(RunnerError::ToolStrikeOut {
                            expected: expected[expected_i].to_string(),
                        });
                    }
                    messages.push(ChatMessage::assistant(content_redacted));
                    messages.push(ChatMessage::user(format!(
                        "Do NOT finish yet. Next required tool is {}. Output ONLY the tool-call JSON.",
                        expected[expected_i]
                    )));
                    continue;
                }
                evidence.append(json!({
                    "type": "run.final",
                    "at": now_iso(),
                    "final": redact_value(final_value, secrets),
                }));
                return Ok(());
            }

            let tool = call
                .get("tool")
                .and_then(Value::as_str)
                .filter(|name| !name.is_empty())
                .ok_or_else(|| {
                    RunnerError::InvalidToolCall(redact_text(&call.to_string(), secrets))
                })?
                .to_string();
            let arguments = call.get("arguments").cloned().unwrap_or_else(|| json!({}));

            if expected_i < expected.len() && tool != expected[expected_i] {
                evidence.append(json!({
                    "type": "tool.rejected",
                    "at": now_iso(),
                    "tool": tool,
                    "expected": expected[expected_i],
                }));
                bad_outputs += 1;
                if bad_outputs >= MAX_BAD_OUTPUTS {
                    return Err(RunnerError::ToolStrikeOut {
                        expected: expected[expected_i].to_string(),
                    });
                }
                // Keep the model's original response in history for
                // transparency, then steer.
                messages.push(ChatMessage::assistant(content.clone()));
                messages.push(ChatMessage::user(format!(
                    "Incorrect tool. Next required tool is {}. Output ONLY the tool-call JSON.",
                    expected[expected_i]
                )));
                continue;
            }

            if tool == REGISTRY_SCAN_TOOL {
                let response = self
                    .call_via(
                        REGISTRY_SERVER_NAME,
                        &tool,
                        arguments,
                        SCAN_CALL_TIMEOUT,
                        config,
                        secrets,
                        evidence,
                    )
                    .await?;
                expected_i = (expected_i + 1).min(expected.len());

                self.tool_to_server = load_tool_mapping(&config.state_dir)?;
                let (servers, tools) = mapping_summary(&self.tool_to_server);
                self.discovered_servers = servers;
                self.discovered_tools = tools;
                evidence.append(json!({
                    "type": "registry.loaded",
                    "at": now_iso(),
                    "servers": self.discovered_servers,
                    "tools": self.discovered_tools,
                }));
                info!(
                    "registry scan discovered {} tools across {} servers",
                    self.discovered_tools.len(),
                    self.discovered_servers.len()
                );

                messages.push(ChatMessage::assistant(content));
                messages.push(ChatMessage::user(format!(
                    "Tool result for {tool}: {response}"
                )));
                messages.push(ChatMessage::user(format!(
                    "Discovered tools: {}",
                    self.discovered_tools.join(", ")
                )));
                continue;
            }

            if self.tool_to_server.is_empty() {
                return Err(RunnerError::NoToolsDiscovered);
            }
            let server = self.start_client_for(&tool, config).await?;
            let response = self
                .call_via(
                    &server,
                    &tool,
                    arguments,
                    TOOL_CALL_TIMEOUT,
                    config,
                    secrets,
                    evidence,
                )
                .await?;
            expected_i = (expected_i + 1).min(expected.len());

            messages.push(ChatMessage::assistant(content));
            messages.push(ChatMessage::user(format!(
                "Tool result for {tool}: {response}"
            )));
        }

        Ok(())
    }

    /// Lazily start (and cache) the client for the server that owns `tool`.
    async fn start_client_for(&mut self, tool: &str, config: &Config) -> Result<String> {
        let (server, manifest) = self
            .tool_to_server
            .get(tool)
            .cloned()
            .ok_or_else(|| RunnerError::UnknownTool(tool.to_string()))?;
        if !self.tool_clients.contains_key(&server) {
            let mut client = McpStdioClient::new(
                manifest.command.clone(),
                &manifest.resolved_cwd(&config.repo_root),
                manifest.env.clone(),
            );
            client.initialize(HANDSHAKE_TIMEOUT).await?;
            self.tool_clients.insert(server.clone(), client);
        }
        Ok(server)
    }

    /// Issue one `tools/call`, record the full exchange, and snapshot state.
    #[allow(clippy::too_many_arguments)]
    async fn call_via(
        &mut self,
        server: &str,
        tool: &str,
        arguments: Value,
        timeout: Duration,
        config: &Config,
        secrets: &[String],
        evidence: &EvidenceWriter,
    ) -> Result<Value> {
        let client = self
            .tool_clients
            .get_mut(server)
            .ok_or_else(|| RunnerError::UnknownTool(tool.to_string()))?;

        let started = Instant::now();
        let (request, response, meta) = client
            .request_with_meta(
                "tools/call",
                Some(json!({"name": tool, "arguments": arguments.clone()})),
                timeout,
            )
            .await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        if tool == WORKFLOW_UPLOAD_TOOL
            && let Some(payload) = extract_first_json_content(&response)
            && let Some(id) = payload.get("id").and_then(Value::as_str)
        {
            self.workflow_id = Some(id.to_string());
        }

        self.tool_calls_seen.push(tool.to_string());
        evidence.append(redact_value(
            &json!({
                "type": "tool.call",
                "at": now_iso(),
                "tool": tool,
                "server": server,
                "arguments": arguments,
                "jsonrpcRequest": request,
                "jsonrpcResponse": response,
                "process": meta,
                "durationMs": duration_ms,
                "state": snapshot_state(&config.state_dir, self.workflow_id.as_deref()),
            }),
            secrets,
        ));

        Ok(response)
    }
}

fn initial_messages(registry_tools: &[String]) -> Vec<ChatMessage> {
    let workflow_id = format!("smoke_{}", Utc::now().timestamp_millis());
    vec![
        ChatMessage::system(format!(
            "You are a tool-using agent.\n\
             When you need to call a tool, output ONLY a single-line JSON object:\n\
             {{\"tool\":\"<tool_name>\",\"arguments\":{{...}}}}\n\
             When finished, output ONLY: {{\"final\":\"...\"}}\n\
             Do not output anything else.\n\
             You MUST call tools to complete the scenario and MUST NOT output a final answer \
             until all required tool calls are done.\n\n\
             Initial tools available: {}",
            registry_tools.join(", ")
        )),
        ChatMessage::user(format!(
            "Use workflow id: {workflow_id}\n\
             Run the smoke scenario strictly in this order using tool calls:\n\
             1) Call tool workbench.registry.scan with {{\"timeoutMs\": 10000}}\n\
             2) Call tool workbench.workflow.upload with a minimal workflow definition:\n   \
             {{\"version\":1,\"id\":\"{workflow_id}\",\"steps\":[{{\"id\":\"s1\",\"kind\":\"note\",\"note\":\"hello\"}}]}}\n\
             3) Call tool workbench.workflow.status for that workflow id\n\
             4) Call tool workbench.workflow.update with {{\"id\":...,\"note\":\"updated\"}}\n\
             5) Call tool workbench.workflow.status again and then finish.\n"
        )),
    ]
}

/// Parse the model output as a single JSON object, tolerating surrounding
/// prose by taking the first `{...}` span.
fn parse_tool_json(text: &str) -> std::result::Result<Value, String> {
    let trimmed = text.trim();
    let parsed = serde_json::from_str::<Value>(trimmed).or_else(|err| {
        match (trimmed.find('{'), trimmed.rfind('}')) {
            (Some(start), Some(end)) if end > start => {
                serde_json::from_str::<Value>(&trimmed[start..=end]).map_err(|e| e.to_string())
            }
            _ => Err(err.to_string()),
        }
    })?;
    if parsed.is_object() {
        Ok(parsed)
    } else {
        Err("expected a JSON object".to_string())
    }
}

/// First `type: "json"` item in a `tools/call` result's content array.
fn extract_first_json_content(response: &Value) -> Option<Value> {
    response
        .pointer("/result/content")
        .and_then(Value::as_array)?
        .iter()
        .find(|item| {
            item.get("type").and_then(Value::as_str) == Some("json") && item.get("json").is_some()
        })
        .and_then(|item| item.get("json"))
        .cloned()
}

/// Hashes of the registry file and, once bound, the workflow's status and
/// definition files: verifiable proof of state progression without dumping
/// contents into the evidence log.
fn snapshot_state(state_dir: &Path, workflow_id: Option<&str>) -> Value {
    let mut snapshot = json!({});
    let reg_path = registry_path(state_dir);
    if let Ok(raw) = std::fs::read_to_string(&reg_path) {
        snapshot["registry"] = json!({
            "path": reg_path.display().to_string(),
            "sha256": sha256_hex(&raw),
        });
    }

    if let Some(id) = workflow_id {
        let workflow_dir = state_dir.join("workflows").join(id);
        let status_path = workflow_dir.join("status.json");
        let definition_path = workflow_dir.join("definition.json");
        snapshot["workflow"] = json!({
            "id": id,
            "dir": workflow_dir.display().to_string(),
            "status": {
                "path": status_path.display().to_string(),
                "sha256": std::fs::read_to_string(&status_path).ok().map(|raw| sha256_hex(&raw)),
            },
            "definition": {
                "path": definition_path.display().to_string(),
                "sha256": std::fs::read_to_string(&definition_path).ok().map(|raw| sha256_hex(&raw)),
            },
        });
    }
    snapshot
}

fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn write_json_file(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut body = serde_json::to_string_pretty(value)?;
    body.push('\n');
    std::fs::write(path, body)?;
    Ok(())
}

/// Execute a full run: resolve the provider, run the loop, write the summary
/// and the `state/current.json` pointer. Returns the summary and the process
/// exit code.
pub async fn run(config: &Config, max_steps: usize) -> (RunSummary, i32) {
    let run_id = format!("run_{}", Utc::now().timestamp());
    let run_dir = config.state_dir.join("runs").join(&run_id);
    if let Err(err) = std::fs::create_dir_all(&run_dir) {
        let mut summary = base_summary(config, &run_id, &run_dir);
        summary.error_kind = Some("io".to_string());
        summary.error = Some(format!("failed to create run dir: {err}"));
        return (summary, 1);
    }
    let events_path = run_dir.join("events.jsonl");
    let evidence = Arc::new(EvidenceWriter::new(
        events_path.clone(),
        config.evidence_max_bytes,
    ));

    let resolved = match resolve_provider(config, Some(Arc::clone(&evidence))) {
        Ok(resolved) => resolved,
        Err(err) => {
            let mut summary = base_summary(config, &run_id, &run_dir);
            summary.provider = json!({"mode": "unconfigured"});
            summary.error_kind = Some(err.kind().to_string());
            summary.error = Some(err.to_string().replace('\n', " "));
            let _ = write_json_file(
                &run_dir.join("summary.json"),
                &serde_json::to_value(&summary).unwrap_or_default(),
            );
            return (summary, err.exit_code());
        }
    };

    let provider_info = redact_value(&resolved.info, &resolved.secrets);
    let doctor = redact_value(&resolved.provider.doctor(), &resolved.secrets);

    evidence.append(json!({
        "type": "run.start",
        "at": now_iso(),
        "runId": run_id,
        "provider": provider_info.clone(),
    }));
    evidence.append(json!({
        "type": "provider.doctor",
        "at": now_iso(),
        "provider": provider_info.clone(),
        "doctor": doctor.clone(),
    }));

    let outcome = run_dispatch(
        config,
        resolved.provider.as_ref(),
        &resolved.secrets,
        &evidence,
        EXPECTED_SMOKE_SCRIPT,
        max_steps,
    )
    .await;

    let mut summary = base_summary(config, &run_id, &run_dir);
    summary.workflow_id = outcome.workflow_id;
    summary.discovered_servers = outcome.discovered_servers;
    summary.discovered_tools = outcome.discovered_tools;
    summary.tool_calls_seen = outcome.tool_calls_seen;
    summary.provider = provider_info;
    summary.provider_doctor = doctor;
    if let Some(err) = &outcome.error {
        summary.error_kind = Some(err.kind().to_string());
        summary.error = Some(redact_text(&err.to_string(), &resolved.secrets));
    }

    if let Ok(value) = serde_json::to_value(&summary) {
        let _ = write_json_file(&run_dir.join("summary.json"), &value);
    }
    update_current_pointer(config, &run_id);

    let exit = if outcome.error.is_some() { 1 } else { 0 };
    (summary, exit)
}

fn base_summary(config: &Config, run_id: &str, run_dir: &Path) -> RunSummary {
    RunSummary {
        schema_version: SUMMARY_SCHEMA_VERSION,
        run_id: run_id.to_string(),
        run_dir: run_dir.display().to_string(),
        events: run_dir.join("events.jsonl").display().to_string(),
        workflow_id: None,
        discovered_servers: Vec::new(),
        discovered_tools: Vec::new(),
        tool_calls_seen: Vec::new(),
        provider: Value::Null,
        provider_doctor: Value::Null,
        state_dir: config.state_dir.display().to_string(),
        error_kind: None,
        error: None,
    }
}

/// Pointer file consumed by state aggregation: which run is the latest.
fn update_current_pointer(config: &Config, run_id: &str) {
    let current_path = config.state_dir.join("state").join("current.json");
    let mut current = std::fs::read_to_string(&current_path)
        .ok()
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        .filter(Value::is_object)
        .unwrap_or_else(|| json!({"schemaVersion": 1}));
    current["runnerRunId"] = json!(run_id);
    current["updatedAt"] = json!(now_iso());
    let _ = write_json_file(&current_path, &current);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_tool_json_tolerates_surrounding_prose() {
        let parsed =
            parse_tool_json("Sure! {\"tool\":\"x\",\"arguments\":{}} hope that helps").expect("parse");
        assert_eq!(parsed["tool"], "x");

        assert!(parse_tool_json("not json").is_err());
        assert!(parse_tool_json("42").is_err());
        assert!(parse_tool_json("[1,2]").is_err());
    }

    #[test]
    fn extracts_first_json_content_item() {
        let response = json!({
            "result": {
                "content": [
                    {"type": "text", "text": "ignored"},
                    {"type": "json", "json": {"id": "wf_1", "ok": true}},
                    {"type": "json", "json": {"id": "wf_2"}},
                ]
            }
        });
        let payload = extract_first_json_content(&response).expect("payload");
        assert_eq!(payload["id"], "wf_1");
        assert_eq!(extract_first_json_content(&json!({"result": {}})), None);
    }

    #[test]
    fn snapshot_hashes_registry_and_workflow_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state_dir = dir.path();
        std::fs::create_dir_all(state_dir.join("registry")).expect("mkdir");
        std::fs::write(state_dir.join("registry").join("mcp.json"), "{}").expect("write");
        let workflow_dir = state_dir.join("workflows").join("wf_1");
        std::fs::create_dir_all(&workflow_dir).expect("mkdir");
        std::fs::write(workflow_dir.join("status.json"), "{\"state\":\"ok\"}").expect("write");

        let snapshot = snapshot_state(state_dir, Some("wf_1"));
        assert_eq!(
            snapshot["registry"]["sha256"],
            json!(sha256_hex("{}"))
        );
        assert_eq!(
            snapshot["workflow"]["status"]["sha256"],
            json!(sha256_hex("{\"state\":\"ok\"}"))
        );
        // definition.json does not exist: hash is null, not an error.
        assert_eq!(snapshot["workflow"]["definition"]["sha256"], Value::Null);
    }
}
