// OpenAiProvider against a local stand-in for the chat-completions endpoint.

use axum::routing::post;
use axum::Router;
use relay_agent::openai::OpenAiProvider;
use relay_agent::provider::{ChatRequest, LlmProvider};
use relay_agent::stream::StreamEvent;
use relay_core::config::OpenAiConfig;
use relay_core::types::Turn;
use tokio::sync::mpsc;

const CHUNK: &str = r#"data: {"model":"m","choices":[{"delta":{"content":"Half an ans"},"finish_reason":null}]}"#;

async fn serve(body: String) -> String {
    let app = Router::new().route(
        "/chat/completions",
        post(move || {
            let body = body.clone();
            async move { ([("content-type", "text/event-stream")], body) }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn collect(base: String) -> Vec<StreamEvent> {
    let provider = OpenAiProvider::new(&OpenAiConfig {
        api_key: Some("sk-test".into()),
        api_base: base,
        ..OpenAiConfig::default()
    })
    .unwrap();
    let req = ChatRequest {
        model: "m".into(),
        messages: vec![Turn::user("hi", None)],
        max_tokens: 16,
        temperature: 1.0,
        functions: Vec::new(),
        user: None,
    };
    let (tx, mut rx) = mpsc::channel(16);
    provider.send_stream(&req, tx).await.unwrap();
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn closed_connection_without_done_is_an_error() {
    let base = serve(format!("{CHUNK}\n\n")).await;
    let events = collect(base).await;
    assert_eq!(
        events,
        vec![
            StreamEvent::TextDelta {
                text: "Half an ans".into()
            },
            StreamEvent::Error {
                message: "stream ended before completion".into()
            },
        ]
    );
}

#[tokio::test]
async fn done_marker_completes_the_stream() {
    let base = serve(format!("{CHUNK}\n\ndata: [DONE]\n\n")).await;
    let events = collect(base).await;
    assert_eq!(
        events.last(),
        Some(&StreamEvent::Done {
            model: "m".into(),
            finish_reason: None
        })
    );
}
