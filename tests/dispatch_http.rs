//! Dispatcher and transport behavior against a mock HTTP server.

use tokio_util::sync::CancellationToken;

use agentry::types::events::StreamChunk;
use agentry::{ChatRequest, Error, Message, Provider, ProviderConfig, ProviderDispatcher};

fn openai_config(base_url: &str) -> ProviderConfig {
    ProviderConfig {
        provider: Provider::OpenAi,
        api_key: "sk-test".to_string(),
        base_url: Some(base_url.to_string()),
        model: None,
    }
}

const COMPLETION_BODY: &str = r#"{
    "id": "chatcmpl-1",
    "object": "chat.completion",
    "created": 1700000000,
    "model": "gpt-4o",
    "choices": [{
        "index": 0,
        "message": {"role": "assistant", "content": "hi"},
        "finish_reason": "stop"
    }],
    "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
}"#;

#[tokio::test]
async fn test_chat_round_trip_over_http() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/chat/completions")
        .match_header("authorization", "Bearer sk-test")
        .match_header("content-type", "application/json")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(COMPLETION_BODY)
        .create_async()
        .await;

    let mut dispatcher = ProviderDispatcher::new().unwrap();
    dispatcher.add_provider(openai_config(&server.url()));

    let req = ChatRequest::new(vec![Message::user("hello")]);
    let resp = dispatcher
        .chat(&CancellationToken::new(), Provider::OpenAi, &req)
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(resp.message().unwrap().text(), "hi");
    assert_eq!(resp.usage.total_tokens, 4);
}

#[tokio::test]
async fn test_default_model_filled_in_request() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/chat/completions")
        .match_body(mockito::Matcher::PartialJsonString(
            r#"{"model": "gpt-4o", "max_tokens": 3000}"#.to_string(),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(COMPLETION_BODY)
        .create_async()
        .await;

    let mut dispatcher = ProviderDispatcher::new().unwrap();
    dispatcher.add_provider(openai_config(&server.url()));

    let req = ChatRequest::new(vec![Message::user("hello")]);
    dispatcher
        .chat(&CancellationToken::new(), Provider::OpenAi, &req)
        .await
        .unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn test_non_2xx_surfaces_status_and_body() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(429)
        .with_body("rate limited, slow down")
        .create_async()
        .await;

    let mut dispatcher = ProviderDispatcher::new().unwrap();
    dispatcher.add_provider(openai_config(&server.url()));

    let req = ChatRequest::new(vec![Message::user("hello")]);
    let err = dispatcher
        .chat(&CancellationToken::new(), Provider::OpenAi, &req)
        .await
        .unwrap_err();

    match err {
        Error::Remote { status, body } => {
            assert_eq!(status, 429);
            assert!(body.contains("rate limited"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_streaming_chunks_until_done() {
    let sse_body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"},\"index\":0}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"index\":0}]}\n\n",
        "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\",\"index\":0}]}\n\n",
        "data: [DONE]\n\n",
    );
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(sse_body)
        .create_async()
        .await;

    let mut dispatcher = ProviderDispatcher::new().unwrap();
    dispatcher.add_provider(openai_config(&server.url()));

    let req = ChatRequest::new(vec![Message::user("hello")]);
    let mut rx = dispatcher
        .chat_stream(&CancellationToken::new(), Provider::OpenAi, &req)
        .await
        .unwrap();

    let mut chunks = Vec::new();
    while let Some(chunk) = rx.recv().await {
        chunks.push(chunk);
    }

    assert_eq!(
        chunks,
        vec![
            StreamChunk::ContentDelta {
                content: "Hel".to_string()
            },
            StreamChunk::ContentDelta {
                content: "lo".to_string()
            },
            StreamChunk::Done {
                finish_reason: Some("stop".to_string())
            },
        ]
    );
}

#[tokio::test]
async fn test_stream_cancellation_closes_channel() {
    // A body without a DONE sentinel; cancelling must still end the
    // channel.
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body("data: {\"choices\":[{\"delta\":{\"content\":\"x\"},\"index\":0}]}\n\n")
        .create_async()
        .await;

    let mut dispatcher = ProviderDispatcher::new().unwrap();
    dispatcher.add_provider(openai_config(&server.url()));

    let cancel = CancellationToken::new();
    let req = ChatRequest::new(vec![Message::user("hello")]);
    let mut rx = dispatcher
        .chat_stream(&cancel, Provider::OpenAi, &req)
        .await
        .unwrap();

    cancel.cancel();
    // Drain whatever arrived; the channel must close rather than hang.
    while rx.recv().await.is_some() {}
}

#[tokio::test]
async fn test_google_official_endpoint_shape() {
    let mut server = mockito::Server::new_async().await;
    // Any host other than the known proxy gets the official shape: the
    // key rides in the query string and no auth header is sent.
    let mock = server
        .mock("POST", "/models/gemini-pro:generateContent")
        .match_query(mockito::Matcher::UrlEncoded(
            "key".to_string(),
            "g-key".to_string(),
        ))
        .match_header("authorization", mockito::Matcher::Missing)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": "hi"}]},
                    "finishReason": "STOP",
                    "index": 0
                }],
                "usageMetadata": {"promptTokenCount": 1, "candidatesTokenCount": 1, "totalTokenCount": 2}
            }"#,
        )
        .create_async()
        .await;

    let mut dispatcher = ProviderDispatcher::new().unwrap();
    dispatcher.add_provider(ProviderConfig {
        provider: Provider::Google,
        api_key: "g-key".to_string(),
        base_url: Some(server.url()),
        model: None,
    });

    let req = ChatRequest::new(vec![Message::user("hello")]);
    let resp = dispatcher
        .chat(&CancellationToken::new(), Provider::Google, &req)
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(resp.message().unwrap().text(), "hi");
}

#[tokio::test]
async fn test_anthropic_headers_over_http() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/messages")
        .match_header("x-api-key", "a-key")
        .match_header("anthropic-version", "2023-06-01")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{
                "id": "msg_1",
                "role": "assistant",
                "model": "claude-3-5-sonnet-20241022",
                "content": [{"type": "text", "text": "hi"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 2, "output_tokens": 1}
            }"#,
        )
        .create_async()
        .await;

    let mut dispatcher = ProviderDispatcher::new().unwrap();
    dispatcher.add_provider(ProviderConfig {
        provider: Provider::Anthropic,
        api_key: "a-key".to_string(),
        base_url: Some(server.url()),
        model: None,
    });

    let req = ChatRequest::new(vec![Message::user("hello")]);
    let resp = dispatcher
        .chat(&CancellationToken::new(), Provider::Anthropic, &req)
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(resp.message().unwrap().text(), "hi");
    assert_eq!(resp.usage.total_tokens, 3);
}
