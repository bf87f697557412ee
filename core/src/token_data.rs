//! Best-effort JWT claim extraction for OAuth token responses.
//!
//! Tokens are *not* verified here; the runner only mines identity hints
//! (notably the ChatGPT account id) out of tokens the issuer already handed
//! us over TLS.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value;

/// Decode the payload section of a JWT without verifying the signature.
pub fn parse_jwt_claims(token: &str) -> Option<Value> {
    let mut parts = token.split('.');
    let (_header, payload, _sig) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let raw = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    serde_json::from_slice(&raw).ok()
}

/// Extract the account id from a token-endpoint response.
///
/// Claims are consulted on the `id_token` first, then the `access_token`,
/// preferring `chatgpt_account_id` (top-level), then the same claim nested
/// under `https://api.openai.com/auth`, then `organizations[0].id`.
pub fn extract_account_id(tokens: &Value) -> Option<String> {
    for key in ["id_token", "access_token"] {
        let Some(token) = tokens.get(key).and_then(Value::as_str) else {
            continue;
        };
        let Some(claims) = parse_jwt_claims(token) else {
            continue;
        };
        if let Some(id) = claims.get("chatgpt_account_id").and_then(Value::as_str) {
            return Some(id.to_string());
        }
        if let Some(id) = claims
            .get("https://api.openai.com/auth")
            .and_then(|nested| nested.get("chatgpt_account_id"))
            .and_then(Value::as_str)
        {
            return Some(id.to_string());
        }
        if let Some(id) = claims
            .get("organizations")
            .and_then(Value::as_array)
            .and_then(|orgs| orgs.first())
            .and_then(|org| org.get("id"))
            .and_then(Value::as_str)
        {
            return Some(id.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn fake_jwt(claims: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(b"{\"alg\":\"none\"}");
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        format!("{header}.{payload}.sig")
    }

    #[test]
    fn prefers_top_level_account_claim() {
        let token = fake_jwt(&json!({
            "chatgpt_account_id": "acct_top",
            "https://api.openai.com/auth": {"chatgpt_account_id": "acct_nested"},
            "organizations": [{"id": "org_1"}],
        }));
        let account = extract_account_id(&json!({"id_token": token}));
        assert_eq!(account.as_deref(), Some("acct_top"));
    }

    #[test]
    fn falls_back_to_nested_then_organizations() {
        let nested = fake_jwt(&json!({
            "https://api.openai.com/auth": {"chatgpt_account_id": "acct_nested"},
        }));
        assert_eq!(
            extract_account_id(&json!({"id_token": nested})).as_deref(),
            Some("acct_nested")
        );

        let orgs = fake_jwt(&json!({"organizations": [{"id": "org_1"}]}));
        assert_eq!(
            extract_account_id(&json!({"id_token": orgs})).as_deref(),
            Some("org_1")
        );
    }

    #[test]
    fn checks_access_token_when_id_token_is_unusable() {
        let access = fake_jwt(&json!({"chatgpt_account_id": "acct_access"}));
        let tokens = json!({"id_token": "not-a-jwt", "access_token": access});
        assert_eq!(extract_account_id(&tokens).as_deref(), Some("acct_access"));
    }

    #[test]
    fn malformed_tokens_yield_none() {
        assert_eq!(parse_jwt_claims("only.two"), None);
        assert_eq!(parse_jwt_claims("a.b.c.d"), None);
        assert_eq!(extract_account_id(&json!({})), None);
    }
}
