//! Rotation scenarios for the OAuth-backed provider, with the token endpoint
//! and the codex endpoint stubbed by wiremock.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::Value;
use serde_json::json;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::body_string_contains;
use wiremock::matchers::header;
use wiremock::matchers::method;
use wiremock::matchers::path;
use workbench_core::config::OpenAiOauthConfig;
use workbench_core::evidence::EvidenceWriter;
use workbench_core::oauth_pool::OAuthPool;
use workbench_core::oauth_pool::OAuthProfile;
use workbench_core::oauth_pool::SelectionStrategy;
use workbench_core::oauth_pool::load_pool;
use workbench_core::oauth_pool::save_pool;
use workbench_core::providers::ChatMessage;
use workbench_core::providers::LlmProvider;
use workbench_core::providers::openai_oauth::OpenAiCodexProvider;
use workbench_core::util::now_ms;

fn oauth_config(server: &MockServer, dir: &Path) -> OpenAiOauthConfig {
    OpenAiOauthConfig {
        issuer: server.uri(),
        client_id: "app_test".to_string(),
        model: "gpt-5.2-codex".to_string(),
        codex_endpoint: format!("{}/codex", server.uri()),
        token_path: dir.join("token.json"),
        pool_path: dir.join("pool.json"),
        selection_profile: None,
        selection_strategy: SelectionStrategy::Sticky,
        rotate_on_rate_limit: true,
        max_rotations: 0,
    }
}

fn two_profile_pool(now: i64) -> OAuthPool {
    let mut pool = OAuthPool::empty();
    pool.client_id = Some("app_test".to_string());
    pool.model = Some("gpt-5.2-codex".to_string());
    pool.profiles.insert(
        "a".to_string(),
        OAuthProfile::new("a", "tokenA", "refreshA", now + 86_400_000),
    );
    pool.profiles.insert(
        "b".to_string(),
        OAuthProfile::new("b", "tokenB", "refreshB", now + 86_400_000),
    );
    pool.selection.last_used_profile = Some("a".to_string());
    pool
}

fn sse_delta_body(text: &str) -> String {
    let event = json!({"type": "response.output_text.delta", "delta": text});
    format!("data: {event}\n\ndata: [DONE]\n\n")
}

async fn mount_success(server: &MockServer, bearer: &str, text: &str) {
    Mock::given(method("POST"))
        .and(path("/codex"))
        .and(header("authorization", format!("Bearer {bearer}")))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse_delta_body(text), "text/event-stream"),
        )
        .mount(server)
        .await;
}

fn evidence_events(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|line| serde_json::from_str(line).expect("event line"))
        .collect()
}

#[tokio::test]
async fn rate_limited_profile_rotates_and_sticks_to_the_replacement() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let now = now_ms();

    // Profile `a` is always rate-limited; `b` answers.
    Mock::given(method("POST"))
        .and(path("/codex"))
        .and(header("authorization", "Bearer tokenA"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("Retry-After-Ms", "50")
                .set_body_string(
                    json!({"type": "error", "error": {"type": "too_many_requests"}}).to_string(),
                ),
        )
        .expect(1)
        .mount(&server)
        .await;
    mount_success(&server, "tokenB", "ok-from-b").await;

    let cfg = oauth_config(&server, dir.path());
    save_pool(&cfg.pool_path, &two_profile_pool(now)).expect("save pool");

    let events_path = dir.path().join("events.jsonl");
    let evidence = Arc::new(EvidenceWriter::new(events_path.clone(), 20_000_000));
    let provider = OpenAiCodexProvider::new(cfg.clone(), Some(evidence));

    let first = provider
        .chat(&[ChatMessage::user("test")], Duration::from_secs(2))
        .await
        .expect("first chat");
    assert_eq!(first["output_text"], "ok-from-b");

    let pool = load_pool(&cfg.pool_path).expect("reload pool");
    assert_eq!(pool.selection.last_used_profile.as_deref(), Some("b"));
    let rate_limited_until = pool
        .profiles
        .get("a")
        .and_then(|p| p.rate_limited_until_ms)
        .expect("rate-limit marker");
    assert!(rate_limited_until >= now);

    let rotations: Vec<Value> = evidence_events(&events_path)
        .into_iter()
        .filter(|event| event["type"] == "openai_oauth.rotate")
        .collect();
    assert_eq!(rotations.len(), 1);
    assert_eq!(rotations[0]["reason"], "rate_limit");
    assert_eq!(rotations[0]["fromProfile"], "a");
    assert_eq!(rotations[0]["retryAfterMs"], 50);

    // Sticky selection now starts from `b`; `a` is not touched again (the
    // 429 mock's expect(1) verifies on drop).
    let second = provider
        .chat(&[ChatMessage::user("test2")], Duration::from_secs(2))
        .await
        .expect("second chat");
    assert_eq!(second["output_text"], "ok-from-b");
}

#[tokio::test]
async fn invalid_refresh_disables_the_profile_and_rotates() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let now = now_ms();

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("refreshA"))
        .respond_with(
            ResponseTemplate::new(400).set_body_string(json!({"error": "invalid_grant"}).to_string()),
        )
        .mount(&server)
        .await;
    mount_success(&server, "tokenB", "ok-from-b").await;

    let cfg = oauth_config(&server, dir.path());
    let mut pool = two_profile_pool(now);
    if let Some(a) = pool.profiles.get_mut("a") {
        // Expired, so the first attempt must refresh before chatting.
        a.expires_at_ms = now - 1_000;
    }
    save_pool(&cfg.pool_path, &pool).expect("save pool");

    let events_path = dir.path().join("events.jsonl");
    let evidence = Arc::new(EvidenceWriter::new(events_path.clone(), 20_000_000));
    let provider = OpenAiCodexProvider::new(cfg.clone(), Some(evidence));

    let response = provider
        .chat(&[ChatMessage::user("test")], Duration::from_secs(2))
        .await
        .expect("chat");
    assert_eq!(response["output_text"], "ok-from-b");

    let pool = load_pool(&cfg.pool_path).expect("reload pool");
    assert!(pool.profiles.get("a").expect("a").disabled);
    assert_eq!(pool.selection.last_used_profile.as_deref(), Some("b"));

    let rotations: Vec<Value> = evidence_events(&events_path)
        .into_iter()
        .filter(|event| event["type"] == "openai_oauth.rotate")
        .collect();
    assert_eq!(rotations.len(), 1);
    assert_eq!(rotations[0]["reason"], "refresh_invalid");
}

#[tokio::test]
async fn refresh_persists_rotated_tokens() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let now = now_ms();

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("refreshA"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            json!({
                "access_token": "tokenA2",
                "refresh_token": "refreshA2",
                "expires_in": 3600,
            })
            .to_string(),
        ))
        .mount(&server)
        .await;
    mount_success(&server, "tokenA2", "fresh").await;

    let cfg = oauth_config(&server, dir.path());
    let mut pool = OAuthPool::empty();
    pool.client_id = Some("app_test".to_string());
    pool.profiles.insert(
        "a".to_string(),
        OAuthProfile::new("a", "tokenA", "refreshA", now - 1_000),
    );
    save_pool(&cfg.pool_path, &pool).expect("save pool");

    let provider = OpenAiCodexProvider::new(cfg.clone(), None);
    let response = provider
        .chat(&[ChatMessage::user("test")], Duration::from_secs(2))
        .await
        .expect("chat");
    assert_eq!(response["output_text"], "fresh");

    let pool = load_pool(&cfg.pool_path).expect("reload pool");
    let profile = pool.profiles.get("a").expect("a");
    assert_eq!(profile.access_token, "tokenA2");
    assert_eq!(profile.refresh_token, "refreshA2");
    assert!(profile.expires_at_ms > now);
}

#[tokio::test]
async fn completed_event_returns_output_text_verbatim() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let now = now_ms();

    let completed = json!({"type": "response.completed", "response": {"output_text": "done"}});
    Mock::given(method("POST"))
        .and(path("/codex"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            format!("data: {completed}\n\ndata: [DONE]\n\n"),
            "text/event-stream",
        ))
        .mount(&server)
        .await;

    let cfg = oauth_config(&server, dir.path());
    let mut pool = OAuthPool::empty();
    pool.profiles.insert(
        "solo".to_string(),
        OAuthProfile::new("solo", "tokenS", "refreshS", now + 86_400_000),
    );
    save_pool(&cfg.pool_path, &pool).expect("save pool");

    let provider = OpenAiCodexProvider::new(cfg, None);
    let response = provider
        .chat(&[ChatMessage::user("go")], Duration::from_secs(2))
        .await
        .expect("chat");
    assert_eq!(response, json!({"output_text": "done"}));
}

#[tokio::test]
async fn exhausting_all_profiles_is_a_rate_limit_error() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let now = now_ms();

    Mock::given(method("POST"))
        .and(path("/codex"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After-Ms", "50"))
        .mount(&server)
        .await;

    let cfg = oauth_config(&server, dir.path());
    save_pool(&cfg.pool_path, &two_profile_pool(now)).expect("save pool");

    let provider = OpenAiCodexProvider::new(cfg, None);
    let err = provider
        .chat(&[ChatMessage::user("test")], Duration::from_secs(2))
        .await
        .expect_err("should exhaust");
    assert_eq!(err.kind(), "rate_limit");
}
