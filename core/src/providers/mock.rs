//! Deterministic offline provider for exercising the tool-loop path.
//!
//! It emits canned tool-call JSON outputs that drive the smoke script:
//! registry scan, workflow upload, status, update, status, then a final
//! answer. The step is inferred from how many tool calls already appear in
//! the conversation, so the provider itself stays stateless.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use serde_json::json;

use crate::error::Result;
use crate::providers::ChatMessage;
use crate::providers::LlmProvider;
use crate::providers::Role;

static WORKFLOW_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[expect(clippy::unwrap_used)]
    let re = Regex::new(r"\bUse workflow id:\s*(smoke_\d+)\b").unwrap();
    re
});

#[derive(Default)]
pub struct MockProvider;

impl MockProvider {
    pub fn new() -> Self {
        Self
    }

    fn infer_step(messages: &[ChatMessage]) -> usize {
        messages
            .iter()
            .filter(|m| m.role == Role::Assistant && m.content.trim().starts_with("{\"tool\":"))
            .count()
    }

    fn workflow_id(messages: &[ChatMessage]) -> String {
        for message in messages {
            if message.role != Role::User {
                continue;
            }
            if let Some(captures) = WORKFLOW_ID_RE.captures(&message.content) {
                return captures[1].to_string();
            }
        }
        "smoke_0".to_string()
    }

    fn last_status_state(messages: &[ChatMessage]) -> Option<String> {
        for message in messages.iter().rev() {
            if message.role != Role::User
                || !message
                    .content
                    .contains("Tool result for workbench.workflow.status")
            {
                continue;
            }
            let (Some(start), Some(end)) = (message.content.find('{'), message.content.rfind('}'))
            else {
                continue;
            };
            if end <= start {
                continue;
            }
            let Ok(response) = serde_json::from_str::<Value>(&message.content[start..=end]) else {
                continue;
            };
            if let Some(state) = response
                .pointer("/result/content/0/json/status/state")
                .and_then(Value::as_str)
            {
                return Some(state.to_string());
            }
        }
        None
    }

    fn next_content(step: usize, messages: &[ChatMessage]) -> String {
        let workflow_id = Self::workflow_id(messages);
        match step {
            0 => r#"{"tool":"workbench.registry.scan","arguments":{"timeoutMs":10000}}"#.to_string(),
            1 => {
                let workflow = json!({
                    "version": 1,
                    "id": workflow_id,
                    "steps": [{"id": "s1", "kind": "note", "note": "hello"}],
                });
                format!(r#"{{"tool":"workbench.workflow.upload","arguments":{{"workflow":{workflow}}}}}"#)
            }
            2 => format!(r#"{{"tool":"workbench.workflow.status","arguments":{{"id":"{workflow_id}"}}}}"#),
            3 => format!(
                r#"{{"tool":"workbench.workflow.update","arguments":{{"id":"{workflow_id}","note":"updated"}}}}"#
            ),
            4 => format!(r#"{{"tool":"workbench.workflow.status","arguments":{{"id":"{workflow_id}"}}}}"#),
            _ => {
                let state =
                    Self::last_status_state(messages).unwrap_or_else(|| "unknown".to_string());
                format!(r#"{{"final":"smoke ok (mock). last workflow state={state}"}}"#)
            }
        }
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn doctor(&self) -> Value {
        json!({"ok": true, "mode": "mock", "note": "Deterministic offline provider (no network)."})
    }

    async fn chat(&self, messages: &[ChatMessage], _timeout: Duration) -> Result<Value> {
        let step = Self::infer_step(messages);
        let content = Self::next_content(step, messages);
        Ok(json!({
            "choices": [{"message": {"role": "assistant", "content": content}}],
            "mock": true,
            "step": step,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::extract_text;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn replays_the_smoke_script_in_order() {
        let provider = MockProvider::new();
        let mut messages = vec![
            ChatMessage::system("You are a tool-using agent."),
            ChatMessage::user("Use workflow id: smoke_42\nRun the smoke scenario."),
        ];

        let mut tools = Vec::new();
        for _ in 0..5 {
            let response = provider
                .chat(&messages, Duration::from_secs(1))
                .await
                .expect("chat");
            let content = extract_text(&response);
            let call: Value = serde_json::from_str(&content).expect("tool json");
            tools.push(call["tool"].as_str().unwrap_or_default().to_string());
            messages.push(ChatMessage::assistant(content));
            messages.push(ChatMessage::user("Tool result: {}".to_string()));
        }

        assert_eq!(
            tools,
            vec![
                "workbench.registry.scan",
                "workbench.workflow.upload",
                "workbench.workflow.status",
                "workbench.workflow.update",
                "workbench.workflow.status",
            ]
        );

        let final_response = provider
            .chat(&messages, Duration::from_secs(1))
            .await
            .expect("chat");
        let final_text = extract_text(&final_response);
        let call: Value = serde_json::from_str(&final_text).expect("final json");
        assert!(call.get("final").is_some());
    }

    #[tokio::test]
    async fn upload_call_reuses_the_requested_workflow_id() {
        let provider = MockProvider::new();
        let messages = vec![
            ChatMessage::user("Use workflow id: smoke_777"),
            ChatMessage::assistant(r#"{"tool":"workbench.registry.scan","arguments":{}}"#),
        ];
        let response = provider
            .chat(&messages, Duration::from_secs(1))
            .await
            .expect("chat");
        let call: Value =
            serde_json::from_str(&extract_text(&response)).expect("tool json");
        assert_eq!(call["tool"], "workbench.workflow.upload");
        assert_eq!(call["arguments"]["workflow"]["id"], "smoke_777");
    }
}
