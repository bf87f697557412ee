//! Secret scrubbing for everything that reaches the evidence log.
//!
//! Two passes: replace every known secret string, then blank out anything
//! that still looks like a bearer token. Map keys that conventionally carry
//! credentials are replaced wholesale without descending into their values.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

pub const REDACTED: &str = "<redacted>";

static BEARER_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[expect(clippy::unwrap_used)]
    let re = Regex::new(r"Bearer\s+[A-Za-z0-9._-]+").unwrap();
    re
});

const SENSITIVE_KEYS: &[&str] = &["authorization", "api_key", "apikey"];

/// Scrub known secrets and bearer tokens out of a string.
pub fn redact_text(text: &str, secrets: &[String]) -> String {
    let mut out = text.to_string();
    for secret in secrets {
        if !secret.is_empty() {
            out = out.replace(secret, REDACTED);
        }
    }
    BEARER_RE.replace_all(&out, "Bearer <redacted>").into_owned()
}

/// Scrub a JSON value recursively.
pub fn redact_value(value: &Value, secrets: &[String]) -> Value {
    match value {
        Value::String(text) => Value::String(redact_text(text, secrets)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| redact_value(item, secrets))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    if SENSITIVE_KEYS.contains(&key.to_lowercase().as_str()) {
                        (key.clone(), Value::String(REDACTED.to_string()))
                    } else {
                        (key.clone(), redact_value(item, secrets))
                    }
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn replaces_known_secrets_everywhere() {
        let secrets = vec!["sk-live-123".to_string(), "refresh-xyz".to_string()];
        let value = json!({
            "note": "token sk-live-123 then refresh-xyz",
            "nested": [{"inner": "sk-live-123"}],
            "count": 3,
        });
        let redacted = redact_value(&value, &secrets);
        let text = redacted.to_string();
        assert!(!text.contains("sk-live-123"));
        assert!(!text.contains("refresh-xyz"));
        assert_eq!(redacted["count"], 3);
        assert_eq!(redacted["nested"][0]["inner"], REDACTED);
    }

    #[test]
    fn masks_bearer_tokens_without_a_secret_list() {
        let text = redact_text("Authorization: Bearer abc.def-123", &[]);
        assert_eq!(text, "Authorization: Bearer <redacted>");
    }

    #[test]
    fn credential_keys_are_replaced_wholesale() {
        let value = json!({
            "Authorization": {"scheme": "Bearer", "token": "abc"},
            "api_key": "sk-1",
            "APIKEY": "sk-2",
            "other": "kept",
        });
        let redacted = redact_value(&value, &[]);
        assert_eq!(redacted["Authorization"], REDACTED);
        assert_eq!(redacted["api_key"], REDACTED);
        assert_eq!(redacted["APIKEY"], REDACTED);
        assert_eq!(redacted["other"], "kept");
    }

    #[test]
    fn non_string_scalars_pass_through() {
        let value = json!({"a": null, "b": true, "c": 1.5});
        assert_eq!(redact_value(&value, &[]), value);
    }
}
