use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::ChildStdout;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::debug;
use tracing::warn;

use crate::framing::FrameBuffer;
use crate::framing::encode_message;

/// Protocol version sent in the `initialize` handshake.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// At most this many bytes of recent stderr are retained for diagnostics.
const STDERR_TAIL_BYTES: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum McpClientError {
    #[error("failed to spawn MCP server process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("timed out waiting for response id={id} to `{method}`")]
    Timeout { method: String, id: i64 },

    #[error("MCP server process exited before a response arrived: {stderr_tail}")]
    ProcessExited { stderr_tail: String },

    #[error("MCP server sent an unparseable frame: {0}")]
    InvalidFrame(#[from] serde_json::Error),

    #[error("I/O error talking to MCP server: {0}")]
    Io(#[from] std::io::Error),

    #[error("MCP server command is empty")]
    EmptyCommand,
}

/// Diagnostic snapshot of the child process, taken alongside each response so
/// callers can seed their evidence log when something goes wrong.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMeta {
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub stderr_tail: String,
    pub command: Vec<String>,
    pub cwd: String,
}

struct ChildState {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    frames: FrameBuffer,
    stderr_tail: Arc<Mutex<Vec<u8>>>,
}

/// A JSON-RPC client for one spawned MCP server.
///
/// Requests are strictly serial: the caller holds `&mut self` for the
/// duration of each call, so one request can never consume bytes that belong
/// to another. Responses are correlated by the integer request id; frames
/// carrying any other id are discarded.
pub struct McpStdioClient {
    command: Vec<String>,
    cwd: PathBuf,
    env: HashMap<String, String>,
    next_id: i64,
    state: Option<ChildState>,
}

impl McpStdioClient {
    pub fn new(command: Vec<String>, cwd: &Path, env: HashMap<String, String>) -> Self {
        Self {
            command,
            cwd: cwd.to_path_buf(),
            env,
            next_id: 1,
            state: None,
        }
    }

    /// Spawn the server process if it is not already running.
    pub fn start(&mut self) -> Result<(), McpClientError> {
        if self.state.is_some() {
            return Ok(());
        }
        let (program, args) = self
            .command
            .split_first()
            .ok_or(McpClientError::EmptyCommand)?;
        let mut child = Command::new(program)
            .args(args)
            .current_dir(&self.cwd)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // As noted in the `kill_on_drop` documentation, the Tokio runtime
            // makes a "best effort" to reap-after-exit to avoid zombie
            // processes, but it is not a guarantee.
            .kill_on_drop(true)
            .spawn()
            .map_err(McpClientError::Spawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpClientError::Spawn(std::io::Error::other("missing child stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpClientError::Spawn(std::io::Error::other("missing child stdout")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpClientError::Spawn(std::io::Error::other("missing child stderr")))?;

        let stderr_tail: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        // Drain stderr in the background so the pipe never fills up; keep
        // only the most recent tail.
        let tail = Arc::clone(&stderr_tail);
        tokio::spawn(async move {
            let mut stderr = stderr;
            let mut chunk = [0u8; 4096];
            loop {
                match stderr.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(read) => {
                        #[expect(clippy::unwrap_used)]
                        let mut guard = tail.lock().unwrap();
                        guard.extend_from_slice(&chunk[..read]);
                        let excess = guard.len().saturating_sub(STDERR_TAIL_BYTES);
                        if excess > 0 {
                            guard.drain(..excess);
                        }
                    }
                }
            }
        });

        self.state = Some(ChildState {
            child,
            stdin,
            stdout,
            frames: FrameBuffer::new(),
            stderr_tail,
        });
        Ok(())
    }

    /// Kill the server process. Safe to call when it was never started.
    pub fn stop(&mut self) {
        if let Some(mut state) = self.state.take()
            && let Err(err) = state.child.start_kill()
        {
            warn!("failed to kill MCP server process: {err}");
        }
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Send a request and await the matching response.
    pub async fn request(
        &mut self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpClientError> {
        let (_, response, _) = self.request_with_meta(method, params, timeout).await?;
        Ok(response)
    }

    /// Send a request and return `(request, response, process meta)`.
    ///
    /// On timeout the child is left running so the caller decides whether to
    /// [`stop`](Self::stop) it.
    pub async fn request_with_meta(
        &mut self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<(Value, Value, ProcessMeta), McpClientError> {
        self.start()?;
        let id = self.next_id;
        self.next_id += 1;

        let mut request = json!({"jsonrpc": "2.0", "id": id, "method": method});
        if let Some(params) = params {
            request["params"] = params;
        }

        let deadline = Instant::now() + timeout;
        let Some(state) = self.state.as_mut() else {
            return Err(McpClientError::Spawn(std::io::Error::other(
                "client not started",
            )));
        };
        state.stdin.write_all(&encode_message(&request)).await?;
        state.stdin.flush().await?;
        debug!("MCP request to server: {request}");

        let response = state.read_response(method, id, deadline).await?;
        let meta = self.meta();
        Ok((request, response, meta))
    }

    /// Negotiate the `initialize` handshake.
    pub async fn initialize(&mut self, timeout: Duration) -> Result<Value, McpClientError> {
        self.request(
            "initialize",
            Some(json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": "workbench-runner", "version": env!("CARGO_PKG_VERSION")},
            })),
            timeout,
        )
        .await
    }

    /// Convenience wrapper around `tools/list`.
    pub async fn list_tools(&mut self, timeout: Duration) -> Result<Value, McpClientError> {
        self.request("tools/list", None, timeout).await
    }

    /// Convenience wrapper around `tools/call`.
    pub async fn call_tool(
        &mut self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, McpClientError> {
        self.request(
            "tools/call",
            Some(json!({"name": name, "arguments": arguments})),
            timeout,
        )
        .await
    }

    /// Diagnostic snapshot of the child process.
    pub fn meta(&mut self) -> ProcessMeta {
        let (pid, exit_code, stderr_tail) = match self.state.as_mut() {
            Some(state) => (
                state.child.id(),
                state.child.try_wait().ok().flatten().and_then(|s| s.code()),
                state.stderr_tail_string(),
            ),
            None => (None, None, String::new()),
        };
        ProcessMeta {
            pid,
            exit_code,
            stderr_tail,
            command: self.command.clone(),
            cwd: self.cwd.display().to_string(),
        }
    }
}

impl ChildState {
    async fn read_response(
        &mut self,
        method: &str,
        want_id: i64,
        deadline: Instant,
    ) -> Result<Value, McpClientError> {
        let mut chunk = [0u8; 4096];
        loop {
            while let Some(message) = self.frames.try_next()? {
                if message.get("id").and_then(Value::as_i64) == Some(want_id) {
                    return Ok(message);
                }
                // One request at a time: anything else is stale or unsolicited.
                debug!("discarding frame with unexpected id: {message}");
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(McpClientError::Timeout {
                    method: method.to_string(),
                    id: want_id,
                });
            }
            let read = tokio::time::timeout(remaining, self.stdout.read(&mut chunk))
                .await
                .map_err(|_| McpClientError::Timeout {
                    method: method.to_string(),
                    id: want_id,
                })??;
            if read == 0 {
                return Err(McpClientError::ProcessExited {
                    stderr_tail: self.stderr_tail_string(),
                });
            }
            self.frames.extend(&chunk[..read]);
        }
    }

    fn stderr_tail_string(&self) -> String {
        #[expect(clippy::unwrap_used)]
        let guard = self.stderr_tail.lock().unwrap();
        String::from_utf8_lossy(&guard).into_owned()
    }
}

impl Drop for McpStdioClient {
    fn drop(&mut self) {
        if let Some(state) = self.state.as_mut() {
            // `kill_on_drop(true)` already covers us; this extra check reaps
            // the process immediately if it has already exited instead of
            // waiting for the Tokio runtime to do it later.
            let _ = state.child.try_wait();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sh_client(script: &str) -> McpStdioClient {
        McpStdioClient::new(
            vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            Path::new("."),
            HashMap::new(),
        )
    }

    fn framed_shell_payload(value: &Value) -> String {
        let body = value.to_string();
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body)
    }

    #[tokio::test]
    async fn skips_frames_for_other_request_ids() {
        let stale = json!({"jsonrpc": "2.0", "id": 99, "result": {"stale": true}});
        let wanted = json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}});
        let script = format!(
            "printf '%s%s' '{}' '{}'; sleep 1",
            framed_shell_payload(&stale),
            framed_shell_payload(&wanted),
        );

        let mut client = sh_client(&script);
        let response = client
            .request("tools/list", None, Duration::from_secs(5))
            .await
            .expect("response");
        assert_eq!(response, wanted);
        client.stop();
    }

    #[tokio::test]
    async fn reports_process_exit_with_stderr_tail() {
        let mut client = sh_client("echo 'boom' >&2; exit 3");
        let err = client
            .request("tools/list", None, Duration::from_secs(5))
            .await
            .expect_err("should fail");
        match err {
            McpClientError::ProcessExited { stderr_tail } => {
                assert!(stderr_tail.contains("boom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn times_out_when_no_response_arrives() {
        let mut client = sh_client("sleep 30");
        let err = client
            .request("tools/list", None, Duration::from_millis(200))
            .await
            .expect_err("should time out");
        assert!(matches!(err, McpClientError::Timeout { .. }));
        client.stop();
    }
}
