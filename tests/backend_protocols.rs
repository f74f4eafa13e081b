use campus_nlq::config::{BackendConfig, ProviderKind};
use campus_nlq::{GenerationBackend, LlmClient, NlqError};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(provider: ProviderKind, server: &MockServer) -> LlmClient {
    LlmClient::new(&BackendConfig {
        provider,
        api_key: "test-key".to_string(),
        model: "m".to_string(),
        base_url: server.uri(),
        timeout: Duration::from_secs(5),
        max_tokens: 64,
    })
    .unwrap()
}

fn sse(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.as_bytes().to_vec(), "text/event-stream")
}

/// Run a streaming call and collect what reached the consumer.
async fn stream(client: &LlmClient, prompt: &str) -> (Result<String, NlqError>, Vec<String>) {
    let (tx, mut rx) = mpsc::channel(64);
    let result = client.generate_streaming(prompt, tx).await;
    let mut tokens = Vec::new();
    while let Some(token) = rx.recv().await {
        tokens.push(token);
    }
    (result, tokens)
}

#[tokio::test]
async fn token_delta_batch_and_stream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({"stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "SELECT 1"}}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(sse(concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {broken\n\n",
            ": keep-alive\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
        )))
        .mount(&server)
        .await;

    let client = client(ProviderKind::OpenAi, &server);
    let text = client.generate("q").await.unwrap();
    assert_eq!(text.as_str(), "SELECT 1");

    let (result, tokens) = stream(&client, "q").await;
    assert_eq!(result.unwrap(), "Hello");
    assert_eq!(tokens, vec!["Hel", "lo"]);
}

#[tokio::test]
async fn block_delta_batch_and_stream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .and(header("x-api-key", "test-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(json!({"stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{"type": "text", "text": "SELECT 2"}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(sse(concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Two \"}}\n\n",
            "{\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"rows\"}}\n",
            "data: {\"type\":\"ping\"}\n\n",
            "data: {\"type\":\"message_stop\"}\n\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"ignored\"}}\n\n",
        )))
        .mount(&server)
        .await;

    let client = client(ProviderKind::Anthropic, &server);
    assert_eq!(client.generate("q").await.unwrap().as_str(), "SELECT 2");

    let (result, tokens) = stream(&client, "q").await;
    assert_eq!(result.unwrap(), "Two rows");
    assert_eq!(tokens, vec!["Two ", "rows"]);
}

#[tokio::test]
async fn candidate_batch_and_stream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/m:generateContent"))
        .and(header("x-goog-api-key", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{"content": {"parts": [{"text": "SELECT "}, {"text": "3"}]}}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/models/m:streamGenerateContent"))
        .and(query_param("alt", "sse"))
        .respond_with(sse(concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Three\"}]}}]}\r\n\r\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\" exams\"}]}}]}\r\n\r\n",
            "data: {\"usageMetadata\":{\"totalTokenCount\":9}}",
        )))
        .mount(&server)
        .await;

    let client = client(ProviderKind::Gemini, &server);
    assert_eq!(client.generate("q").await.unwrap().as_str(), "SELECT 3");

    let (result, tokens) = stream(&client, "q").await;
    assert_eq!(result.unwrap(), "Three exams");
    assert_eq!(tokens, vec!["Three", " exams"]);
}

#[tokio::test]
async fn http_errors_carry_the_provider_detail() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": {"message": "Rate limit reached", "type": "rate_limit"}
        })))
        .mount(&server)
        .await;

    let client = client(ProviderKind::OpenAi, &server);
    let err = client.generate("q").await.unwrap_err();
    assert_eq!(err.kind(), "generation");
    assert!(err.to_string().contains("Rate limit reached"), "{}", err);
    assert!(err.to_string().contains("429"), "{}", err);

    let (result, tokens) = stream(&client, "q").await;
    assert!(matches!(result, Err(NlqError::Generation(_))));
    assert!(tokens.is_empty());
}

#[tokio::test]
async fn stream_error_frames_fail_after_delivering_earlier_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(sse(concat!(
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Partial\"}}\n\n",
            "data: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n",
        )))
        .mount(&server)
        .await;

    let client = client(ProviderKind::Anthropic, &server);
    let (result, tokens) = stream(&client, "q").await;
    match result {
        Err(NlqError::Generation(message)) => assert_eq!(message, "Overloaded"),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(tokens, vec!["Partial"]);
}

#[tokio::test]
async fn empty_completion_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
        .mount(&server)
        .await;

    let client = client(ProviderKind::OpenAi, &server);
    assert!(matches!(client.generate("q").await, Err(NlqError::Generation(_))));
}
