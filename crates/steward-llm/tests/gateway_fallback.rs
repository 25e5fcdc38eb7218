// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fallback-chain behaviour with scripted providers.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use steward_core::cancel::CancelToken;
use steward_core::config::LlmProviderConfig;
use steward_llm::{
    ChatMessage, Completion, CompletionParams, CompletionProvider, CompletionRequest, Gateway,
    LlmError, TokenUsage,
};

enum Script {
    Succeed,
    Fail(fn(&str) -> LlmError),
}

struct ScriptedProvider {
    name: String,
    script: Script,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn succeeding(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            script: Script::Succeed,
            calls: AtomicUsize::new(0),
        })
    }

    fn failing(name: &str, make: fn(&str) -> LlmError) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            script: Script::Fail(make),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        _request: &CompletionRequest,
        _cancel: &CancelToken,
    ) -> Result<Completion, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Succeed => Ok(Completion {
                content: format!("answer from {}", self.name),
                model: "scripted".into(),
                provider: self.name.clone(),
                usage: TokenUsage {
                    prompt_tokens: 100,
                    completion_tokens: 50,
                },
            }),
            Script::Fail(make) => Err(make(&self.name)),
        }
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Succeed => Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect()),
            Script::Fail(make) => Err(make(&self.name)),
        }
    }
}

fn config(name: &str) -> LlmProviderConfig {
    LlmProviderConfig {
        name: name.into(),
        base_url: "http://unused".into(),
        api_key_env: None,
        model: "scripted".into(),
        monthly_spend_cap_usd: None,
        usd_per_million_tokens: None,
    }
}

fn gateway_of(providers: Vec<Arc<dyn CompletionProvider>>, configs: &[LlmProviderConfig]) -> Gateway {
    Gateway::new(providers, configs, 80.0, Duration::from_secs(3600), 64)
}

fn request() -> CompletionRequest {
    CompletionRequest {
        model: String::new(),
        messages: vec![ChatMessage::user("plan: deploy kuma")],
        params: CompletionParams::default(),
    }
}

#[tokio::test]
async fn primary_success_never_touches_fallback() {
    let primary = ScriptedProvider::succeeding("primary");
    let fallback = ScriptedProvider::succeeding("fallback");
    let gateway = gateway_of(
        vec![primary.clone(), fallback.clone()],
        &[config("primary"), config("fallback")],
    );

    let completion = gateway.complete(&request(), &CancelToken::new()).await.unwrap();
    assert_eq!(completion.provider, "primary");
    assert_eq!(primary.calls(), 1);
    assert_eq!(fallback.calls(), 0);
}

#[tokio::test]
async fn transient_failure_falls_through() {
    let primary = ScriptedProvider::failing("primary", |p| LlmError::Timeout {
        provider: p.to_string(),
    });
    let fallback = ScriptedProvider::succeeding("fallback");
    let gateway = gateway_of(
        vec![primary.clone(), fallback.clone()],
        &[config("primary"), config("fallback")],
    );

    let completion = gateway.complete(&request(), &CancelToken::new()).await.unwrap();
    assert_eq!(completion.provider, "fallback");
    assert_eq!(primary.calls(), 1);
    assert_eq!(fallback.calls(), 1);
}

#[tokio::test]
async fn auth_failure_aborts_the_chain() {
    let primary = ScriptedProvider::failing("primary", |p| LlmError::Auth {
        provider: p.to_string(),
    });
    let fallback = ScriptedProvider::succeeding("fallback");
    let gateway = gateway_of(
        vec![primary.clone(), fallback.clone()],
        &[config("primary"), config("fallback")],
    );

    let err = gateway.complete(&request(), &CancelToken::new()).await.unwrap_err();
    assert!(matches!(err, LlmError::Auth { .. }));
    assert_eq!(fallback.calls(), 0);
}

#[tokio::test]
async fn model_not_found_aborts_the_chain() {
    let primary = ScriptedProvider::failing("primary", |p| LlmError::ModelNotFound {
        provider: p.to_string(),
        model: "pinned".into(),
    });
    let fallback = ScriptedProvider::succeeding("fallback");
    let gateway = gateway_of(
        vec![primary, fallback.clone()],
        &[config("primary"), config("fallback")],
    );

    let err = gateway.complete(&request(), &CancelToken::new()).await.unwrap_err();
    assert!(matches!(err, LlmError::ModelNotFound { .. }));
    assert_eq!(fallback.calls(), 0);
}

#[tokio::test]
async fn exhausted_chain_reports_every_failure() {
    let a = ScriptedProvider::failing("a", |p| LlmError::Timeout {
        provider: p.to_string(),
    });
    let b = ScriptedProvider::failing("b", |p| LlmError::Transport {
        provider: p.to_string(),
        reason: "connection refused".into(),
    });
    let gateway = gateway_of(vec![a, b], &[config("a"), config("b")]);

    let err = gateway.complete(&request(), &CancelToken::new()).await.unwrap_err();
    match err {
        LlmError::Exhausted { summary } => {
            assert!(summary.contains("a:"));
            assert!(summary.contains("b:"));
        }
        other => panic!("expected Exhausted, got {other}"),
    }
}

#[tokio::test]
async fn capped_unrefreshed_provider_is_skipped_preemptively() {
    let capped = ScriptedProvider::succeeding("capped");
    let fallback = ScriptedProvider::succeeding("fallback");
    let mut capped_config = config("capped");
    capped_config.monthly_spend_cap_usd = Some(20.0);
    let gateway = gateway_of(
        vec![capped.clone(), fallback.clone()],
        &[capped_config, config("fallback")],
    );

    // Conservative startup default: capped providers sit out until
    // their first quota refresh.
    let completion = gateway.complete(&request(), &CancelToken::new()).await.unwrap();
    assert_eq!(completion.provider, "fallback");
    assert_eq!(capped.calls(), 0);

    gateway.quota().refresh("capped", 0.0);
    let completion = gateway
        .complete(
            &CompletionRequest {
                model: String::new(),
                messages: vec![ChatMessage::user("another prompt")],
                params: CompletionParams::default(),
            },
            &CancelToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(completion.provider, "capped");
}

#[tokio::test]
async fn quota_spend_accumulates_from_usage() {
    let provider = ScriptedProvider::succeeding("metered");
    let mut metered = config("metered");
    metered.monthly_spend_cap_usd = Some(1.0);
    metered.usd_per_million_tokens = Some(1000.0);
    let gateway = gateway_of(vec![provider], &[metered]);
    gateway.quota().refresh("metered", 0.0);

    // 150 tokens at $1000/M = $0.15 per call.
    for i in 0..6 {
        let result = gateway
            .complete(
                &CompletionRequest {
                    model: String::new(),
                    messages: vec![ChatMessage::user(format!("prompt {i}"))],
                    params: CompletionParams::default(),
                },
                &CancelToken::new(),
            )
            .await;
        assert!(result.is_ok(), "call {i} should pass under the threshold");
    }
    // Spend is now $0.90 of $1.00 (90% >= 80%): skipped, chain exhausted.
    let err = gateway
        .complete(
            &CompletionRequest {
                model: String::new(),
                messages: vec![ChatMessage::user("one too many")],
                params: CompletionParams::default(),
            },
            &CancelToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::Exhausted { .. }));
}

#[tokio::test]
async fn identical_requests_hit_the_cache() {
    let provider = ScriptedProvider::succeeding("primary");
    let gateway = gateway_of(vec![provider.clone()], &[config("primary")]);

    let first = gateway.complete(&request(), &CancelToken::new()).await.unwrap();
    let second = gateway.complete(&request(), &CancelToken::new()).await.unwrap();
    assert_eq!(first.content, second.content);
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn cancelled_token_short_circuits() {
    let provider = ScriptedProvider::succeeding("primary");
    let gateway = gateway_of(vec![provider.clone()], &[config("primary")]);
    let cancel = CancelToken::new();
    cancel.cancel();

    let err = gateway.complete(&request(), &cancel).await.unwrap_err();
    assert!(matches!(err, LlmError::Cancelled));
    assert_eq!(provider.calls(), 0);
}
