//! Exercises `ChatCompletionsGateway` against a local stand-in endpoint.

use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chatflow_core::{CallError, ConversationEntry, InferenceGateway};
use chatflow_providers::ChatCompletionsGateway;
use serde_json::{Value, json};

async fn echo_last(Json(request): Json<Value>) -> Json<Value> {
    let messages = request["messages"].as_array().cloned().unwrap_or_default();
    let last = messages
        .last()
        .and_then(|m| m["content"].as_str())
        .unwrap_or_default()
        .to_string();
    Json(json!({
        "choices": [{ "message": { "role": "assistant", "content": format!("{} messages, last: {last}", messages.len()) } }]
    }))
}

async fn busy() -> (StatusCode, &'static str) {
    (StatusCode::SERVICE_UNAVAILABLE, "overloaded")
}

async fn reject() -> (StatusCode, &'static str) {
    (StatusCode::BAD_REQUEST, "unsupported model")
}

async fn missing_content() -> Json<Value> {
    Json(json!({ "choices": [] }))
}

async fn spawn_server() -> String {
    let router = Router::new()
        .route("/ok/chat/completions", post(echo_last))
        .route("/busy/chat/completions", post(busy))
        .route("/reject/chat/completions", post(reject))
        .route("/empty/chat/completions", post(missing_content));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn gateway(base: &str, path: &str) -> ChatCompletionsGateway {
    ChatCompletionsGateway::new("test-key".to_string()).with_base_url(format!("{base}/{path}"))
}

#[tokio::test]
async fn generate_returns_first_choice_content() {
    let base = spawn_server().await;
    let context = vec![
        ConversationEntry::user("What animals are marsupials?"),
        ConversationEntry::agent("Kangaroos, koalas, wombats."),
    ];

    let reply = gateway(&base, "ok")
        .generate("Which one is largest?", &context)
        .await
        .unwrap();

    assert_eq!(reply, "4 messages, last: Which one is largest?");
}

#[tokio::test]
async fn summarize_sends_transcript_and_instruction() {
    let base = spawn_server().await;
    let context = vec![ConversationEntry::user("hi"), ConversationEntry::agent("hello")];

    let reply = gateway(&base, "ok").summarize(&context).await.unwrap();

    assert!(reply.starts_with("4 messages, last: Please produce a concise summary"));
}

#[tokio::test]
async fn server_errors_are_transient() {
    let base = spawn_server().await;
    let err = gateway(&base, "busy").generate("hi", &[]).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(err.cause().contains("overloaded"));
}

#[tokio::test]
async fn client_errors_are_fatal() {
    let base = spawn_server().await;
    let err = gateway(&base, "reject").generate("hi", &[]).await.unwrap_err();
    assert!(matches!(err, CallError::Fatal(_)));
}

#[tokio::test]
async fn missing_content_is_fatal() {
    let base = spawn_server().await;
    let err = gateway(&base, "empty").summarize(&[]).await.unwrap_err();
    assert_eq!(
        err,
        CallError::fatal("invalid response format: missing content")
    );
}

#[tokio::test]
async fn unreachable_endpoint_is_transient() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = ChatCompletionsGateway::new("k".to_string())
        .with_base_url(format!("http://{addr}"))
        .generate("hi", &[])
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}
