use std::time::Duration;

use brand_harness::gateway::{
    AiClient, AiClientFactory, FinishReason, OpenRouterAdapter, OpenRouterClientFactory,
    ProviderError,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn factory(server: &MockServer) -> OpenRouterClientFactory {
    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
            .unwrap();
    OpenRouterClientFactory::new(adapter).with_model("gpt", "openai/gpt-5-mini")
}

#[tokio::test]
async fn client_sends_mapped_model_id_and_parses_answer() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "model": "openai/gpt-5-mini" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "openai/gpt-5-mini-2025",
            "choices": [{
                "message": { "content": "Acme is the usual pick." },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 20 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = factory(&server).create("gpt").unwrap();
    let resp = client.generate_response("best crm?").await.unwrap();

    assert_eq!(resp.text, "Acme is the usual pick.");
    assert_eq!(resp.model, "openai/gpt-5-mini-2025");
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!(resp.input_tokens, 10);
    assert_eq!(resp.output_tokens, 20);

    let received = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(body["messages"][0]["role"], "user");
    assert_eq!(body["messages"][0]["content"], "best crm?");
}

#[tokio::test]
async fn factory_rejects_unmapped_models() {
    let server = MockServer::start().await;
    let err = factory(&server).create("claude").err().unwrap();
    assert!(matches!(err, ProviderError::UnknownModel(ref m) if m == "claude"));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn refusal_is_permanent() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "I cannot comply with that request." },
                "finish_reason": "stop"
            }]
        })))
        .mount(&server)
        .await;

    let client = factory(&server).create("gpt").unwrap();
    let err = client.generate_response("hi").await.unwrap_err();
    assert!(matches!(err, ProviderError::Refused(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn http_429_is_retryable_throttling_with_retry_after_and_context() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("x-request-id", "abc123")
                .insert_header("retry-after", "7")
                .set_body_json(json!({
                    "error": { "message": "rate limited", "code": "rate_limit_exceeded" }
                })),
        )
        .mount(&server)
        .await;

    let client = factory(&server).create("gpt").unwrap();
    let err = client.generate_response("hi").await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    match err {
        ProviderError::Throttled { context: ctx, .. } => {
            assert_eq!(ctx.http_status, Some(429));
            assert_eq!(ctx.provider_code.as_deref(), Some("rate_limit_exceeded"));
            assert_eq!(ctx.request_id.as_deref(), Some("abc123"));
        }
        other => panic!("expected Throttled, got {other:?}"),
    }
}

#[tokio::test]
async fn http_429_without_retry_after_uses_the_default_wait() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let client = factory(&server).create("gpt").unwrap();
    let err = client.generate_response("hi").await.unwrap_err();
    assert_eq!(err.code(), "throttled");
    assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));
    assert_eq!(err.context().and_then(|c| c.http_status), Some(429));
}

#[tokio::test]
async fn server_errors_are_retryable_and_client_errors_are_not() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "model": "openai/gpt-5-mini" })))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "model": "nope/missing" })))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "message": "unknown model", "code": "bad_request" }
        })))
        .mount(&server)
        .await;

    let factory = factory(&server).with_model("missing", "nope/missing");

    let err = factory
        .create("gpt")
        .unwrap()
        .generate_response("hi")
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.context().and_then(|c| c.http_status), Some(502));

    let err = factory
        .create("missing")
        .unwrap()
        .generate_response("hi")
        .await
        .unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(err.code(), "platform_error");
}
