//! Integration tests for the OpenAI-compatible provider
//!
//! Runs against a mock chat-completions endpoint.

use serde_json::json;
use std::sync::Arc;
use wiremock::{
    matchers::{body_partial_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

use shield_engine::audit::MemoryAuditSink;
use shield_engine::config::{Config, LLMConfig};
use shield_engine::llm::{LLMError, LLMProvider, Message, OpenAICompatProvider};
use shield_engine::pipeline::{Overrides, Shield};
use shield_sdk::manifest::{Manifest, Step};

fn completion(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }]
    })
}

fn provider(server: &MockServer) -> OpenAICompatProvider {
    let config = LLMConfig {
        base_url: server.uri(),
        ..LLMConfig::default()
    };
    OpenAICompatProvider::with_key(&config, Some("test-key".to_string()))
}

#[tokio::test]
async fn test_completion_sends_key_and_json_mode() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("Authorization", "Bearer test-key"))
        .and(body_partial_json(json!({"response_format": {"type": "json_object"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("  {\"ok\": true}\n")))
        .expect(1)
        .mount(&server)
        .await;

    let reply = provider(&server)
        .complete(&[Message::system("be terse"), Message::user("hi")], true)
        .await
        .unwrap();

    assert_eq!(reply, "{\"ok\": true}");
}

#[tokio::test]
async fn test_error_statuses_map_to_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&server)
        .await;

    let err = provider(&server)
        .complete(&[Message::user("hi")], false)
        .await
        .unwrap_err();
    assert!(matches!(err, LLMError::AuthenticationFailed(_)));

    let limited = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&limited)
        .await;
    let err = provider(&limited)
        .complete(&[Message::user("hi")], false)
        .await
        .unwrap_err();
    assert!(matches!(err, LLMError::RateLimitExceeded));
}

#[tokio::test]
async fn test_missing_content_is_parse_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
        .mount(&server)
        .await;

    let err = provider(&server)
        .complete(&[Message::user("hi")], false)
        .await
        .unwrap_err();
    assert!(matches!(err, LLMError::ParseError(_)));
}

#[tokio::test]
async fn test_planning_over_http_accepts_fenced_manifest() {
    let server = MockServer::start().await;
    let fenced = "```json\n{\"pipeline\": [{\"tool\": \"Mute Keywords\", \"args\": {\"mode\": \"beep\"}}]}\n```";
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(fenced)))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = Config::rooted_at(dir.path()).unwrap();
    let llm = Arc::new(provider(&server));
    let shield = Shield::with_overrides(
        config,
        Overrides {
            llm: Some(llm),
            audit: Some(Arc::new(MemoryAuditSink::new())),
            ..Overrides::default()
        },
    )
    .unwrap();

    let manifest = shield.plan("beep out my address").await.unwrap();
    assert_eq!(
        manifest,
        Manifest::new(vec![Step::new("mute_keywords").with_arg("mode", json!("beep"))])
    );
}

#[tokio::test]
async fn test_unreachable_model_is_planning_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let shield = Shield::with_overrides(
        Config::rooted_at(dir.path()).unwrap(),
        Overrides {
            llm: Some(Arc::new(provider(&server))),
            audit: Some(Arc::new(MemoryAuditSink::new())),
            ..Overrides::default()
        },
    )
    .unwrap();

    let err = shield.plan("blur faces").await.unwrap_err();
    assert_eq!(shield_sdk::errors::ShieldErrorExt::category(&err), "PlanningFailure");
}
