// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP provider against a mocked OpenAI-compatible endpoint.

use std::time::Duration;
use steward_core::cancel::CancelToken;
use steward_llm::{ChatMessage, CompletionParams, CompletionProvider, CompletionRequest, HttpProvider, LlmError};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request(model: &str) -> CompletionRequest {
    CompletionRequest {
        model: model.into(),
        messages: vec![
            ChatMessage::system("You are an infrastructure planner."),
            ChatMessage::user("Deploy Kuma monitoring"),
        ],
        params: CompletionParams {
            temperature: Some(0.2),
            max_tokens: Some(512),
            json_mode: false,
        },
    }
}

#[tokio::test]
async fn parses_chat_completion_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(serde_json::json!({"model": "qwen2.5"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "model": "qwen2.5",
            "choices": [{"message": {"role": "assistant", "content": "{\"tasks\":[]}"}}],
            "usage": {"prompt_tokens": 42, "completion_tokens": 7}
        })))
        .mount(&server)
        .await;

    let provider = HttpProvider::new(
        "local",
        format!("{}/v1", server.uri()),
        "qwen2.5",
        Duration::from_secs(5),
    );
    let completion = provider
        .complete(&request("qwen2.5"), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(completion.content, "{\"tasks\":[]}");
    assert_eq!(completion.usage.prompt_tokens, 42);
    assert_eq!(completion.provider, "local");
}

#[tokio::test]
async fn empty_model_uses_provider_default() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(serde_json::json!({"model": "default-model"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "ok"}}]
        })))
        .mount(&server)
        .await;

    let provider = HttpProvider::new(
        "local",
        format!("{}/v1", server.uri()),
        "default-model",
        Duration::from_secs(5),
    );
    let completion = provider.complete(&request(""), &CancelToken::new()).await.unwrap();
    assert_eq!(completion.model, "default-model");
}

#[tokio::test]
async fn unauthorized_is_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let provider = HttpProvider::new(
        "hosted",
        format!("{}/v1", server.uri()),
        "m",
        Duration::from_secs(5),
    );
    let err = provider.complete(&request("m"), &CancelToken::new()).await.unwrap_err();
    assert!(matches!(err, LlmError::Auth { .. }));
}

#[tokio::test]
async fn missing_model_is_model_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let provider = HttpProvider::new(
        "hosted",
        format!("{}/v1", server.uri()),
        "m",
        Duration::from_secs(5),
    );
    let err = provider
        .complete(&request("vanished"), &CancelToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::ModelNotFound { model, .. } if model == "vanished"));
}

#[tokio::test]
async fn server_error_is_transport() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let provider = HttpProvider::new(
        "local",
        format!("{}/v1", server.uri()),
        "m",
        Duration::from_secs(5),
    );
    let err = provider.complete(&request("m"), &CancelToken::new()).await.unwrap_err();
    assert!(err.falls_through(), "5xx should fall through: {err}");
}

#[tokio::test]
async fn slow_endpoint_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(5))
                .set_body_json(serde_json::json!({"choices": []})),
        )
        .mount(&server)
        .await;

    let provider = HttpProvider::new(
        "local",
        format!("{}/v1", server.uri()),
        "m",
        Duration::from_millis(200),
    );
    let err = provider.complete(&request("m"), &CancelToken::new()).await.unwrap_err();
    assert!(matches!(err, LlmError::Timeout { .. }), "got {err}");
}

#[tokio::test]
async fn embeddings_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [
                {"embedding": [0.1, 0.2, 0.3]},
                {"embedding": [0.4, 0.5, 0.6]}
            ]
        })))
        .mount(&server)
        .await;

    let provider = HttpProvider::new(
        "local",
        format!("{}/v1", server.uri()),
        "embedder",
        Duration::from_secs(5),
    );
    let embeddings = provider
        .embed(&["uptime kuma".into(), "jellyfin".into()])
        .await
        .unwrap();
    assert_eq!(embeddings.len(), 2);
    assert_eq!(embeddings[0], vec![0.1, 0.2, 0.3]);
}
