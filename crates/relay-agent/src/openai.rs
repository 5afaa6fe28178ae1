use async_trait::async_trait;
use relay_core::config::{ApiType, OpenAiConfig};
use relay_core::types::Turn;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::provider::{ChatRequest, LlmProvider, ProviderError};
use crate::stream::{parse_sse_line, SseLineBuffer, SseParsed, StreamEvent};

/// OpenAI chat-completions endpoint, or an Azure OpenAI deployment of it.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    api_type: ApiType,
    url: String,
    organization: Option<String>,
}

impl OpenAiProvider {
    pub fn new(config: &OpenAiConfig) -> Result<Self, ProviderError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ProviderError::Config("openai.api_key is not set".to_string()))?;
        let base = config.api_base.trim_end_matches('/');

        let url = match config.api_type {
            ApiType::OpenAi => format!("{base}/chat/completions"),
            ApiType::Azure => {
                let deployment = config.deployment_id.as_deref().ok_or_else(|| {
                    ProviderError::Config("azure requires openai.deployment_id".to_string())
                })?;
                let version = config.api_version.as_deref().ok_or_else(|| {
                    ProviderError::Config("azure requires openai.api_version".to_string())
                })?;
                format!("{base}/openai/deployments/{deployment}/chat/completions?api-version={version}")
            }
        };

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            api_type: config.api_type,
            url,
            organization: config.organization.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        match self.api_type {
            ApiType::OpenAi => "openai",
            ApiType::Azure => "azure-openai",
        }
    }

    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let body = build_request_body(req);

        debug!(
            model = %req.model,
            messages = req.messages.len(),
            functions = req.functions.len(),
            "sending streaming request to {}",
            self.name()
        );

        let mut builder = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .json(&body);
        builder = match self.api_type {
            ApiType::OpenAi => builder.bearer_auth(&self.api_key),
            ApiType::Azure => builder.header("api-key", &self.api_key),
        };
        if let Some(org) = &self.organization {
            builder = builder.header("OpenAI-Organization", org);
        }

        let resp = builder.send().await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after_ms = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1000); // seconds to ms
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "OpenAI streaming API error");
            return Err(ProviderError::from_status(status, text, retry_after_ms));
        }

        process_openai_stream(resp, req.model.clone(), tx).await;
        Ok(())
    }
}

pub(crate) fn build_request_body(req: &ChatRequest) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req.messages.iter().map(turn_to_json).collect();

    let mut body = serde_json::json!({
        "model": req.model,
        "messages": messages,
        "max_tokens": req.max_tokens,
        "temperature": req.temperature,
        "top_p": 1,
        "n": 1,
        "stream": true,
    });
    if let Some(user) = &req.user {
        body["user"] = serde_json::json!(user);
    }
    if !req.functions.is_empty() {
        body["functions"] = serde_json::json!(req.functions);
    }
    body
}

fn turn_to_json(turn: &Turn) -> serde_json::Value {
    let mut msg = serde_json::json!({ "role": turn.role.as_str() });
    match &turn.function_call {
        Some(call) => {
            msg["content"] = if turn.content.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::json!(turn.content)
            };
            msg["function_call"] = serde_json::json!({
                "name": call.name,
                "arguments": call.arguments,
            });
        }
        None if turn.images.is_empty() => msg["content"] = serde_json::json!(turn.content),
        None => {
            let mut parts = vec![serde_json::json!({ "type": "text", "text": turn.content })];
            parts.extend(turn.images.iter().map(|url| {
                serde_json::json!({ "type": "image_url", "image_url": { "url": url } })
            }));
            msg["content"] = serde_json::Value::Array(parts);
        }
    }
    if let Some(name) = &turn.name {
        msg["name"] = serde_json::json!(name);
    }
    msg
}

/// Parse OpenAI streaming SSE response and emit StreamEvents.
/// Each data line contains a JSON delta object; `data: [DONE]` signals end.
async fn process_openai_stream(
    resp: reqwest::Response,
    model: String,
    tx: mpsc::Sender<StreamEvent>,
) {
    use futures_util::StreamExt;

    let mut assembler = StreamAssembler::default();
    let mut lines = SseLineBuffer::new();
    let mut byte_stream = resp.bytes_stream();

    'read: while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        for line in lines.push(&chunk) {
            let Some(SseParsed::Data(data)) = parse_sse_line(&line) else {
                continue;
            };
            // OpenAI signals end-of-stream with a literal `[DONE]` data value
            if data == "[DONE]" {
                assembler.mark_done();
                lines = SseLineBuffer::new();
                break 'read;
            }
            match assembler.ingest(&data) {
                Ok(events) => {
                    for event in events {
                        if tx.send(event).await.is_err() {
                            return; // receiver dropped
                        }
                    }
                }
                Err(message) => {
                    let _ = tx.send(StreamEvent::Error { message }).await;
                    return;
                }
            }
        }
    }

    // A final data line without a trailing newline.
    if let Some(SseParsed::Data(data)) = lines.finish().as_deref().and_then(parse_sse_line) {
        if data == "[DONE]" {
            assembler.mark_done();
        } else {
            match assembler.ingest(&data) {
                Ok(events) => {
                    for event in events {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Err(message) => {
                    let _ = tx.send(StreamEvent::Error { message }).await;
                    return;
                }
            }
        }
    }

    for event in assembler.finish(model) {
        if tx.send(event).await.is_err() {
            return;
        }
    }
}

/// Folds streamed chunks into events.
///
/// Text deltas pass straight through. `function_call` fragments are
/// accumulated and surfaced as one event at the end, and only if no text
/// content was streamed first. `Done` is only reported when the provider
/// said it was finished, either with `[DONE]` or a `finish_reason`.
#[derive(Debug, Default)]
pub(crate) struct StreamAssembler {
    text_started: bool,
    function_name: String,
    function_arguments: String,
    finish_reason: Option<String>,
    model: Option<String>,
    saw_done: bool,
}

impl StreamAssembler {
    pub(crate) fn ingest(&mut self, data: &str) -> Result<Vec<StreamEvent>, String> {
        let chunk: StreamChunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "skipping unparseable stream chunk");
                return Ok(Vec::new());
            }
        };

        if let Some(err) = chunk.error {
            return Err(err.message.unwrap_or_else(|| "provider stream error".to_string()));
        }
        if let Some(model) = chunk.model.filter(|m| !m.is_empty()) {
            self.model = Some(model);
        }

        let mut events = Vec::new();
        // Azure sends an empty choices array first (content filter results)
        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(events);
        };

        if let Some(reason) = choice.finish_reason.filter(|r| !r.is_empty()) {
            self.finish_reason = Some(reason);
        }

        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            self.text_started = true;
            events.push(StreamEvent::TextDelta { text: content });
        } else if let Some(fragment) = choice.delta.function_call {
            if !self.text_started {
                self.function_name.push_str(fragment.name.as_deref().unwrap_or(""));
                self.function_arguments
                    .push_str(fragment.arguments.as_deref().unwrap_or(""));
            }
        }

        Ok(events)
    }

    pub(crate) fn mark_done(&mut self) {
        self.saw_done = true;
    }

    pub(crate) fn finish(self, requested_model: String) -> Vec<StreamEvent> {
        if !self.saw_done && self.finish_reason.is_none() {
            // connection closed mid-reply; a partial function call must not run
            return vec![StreamEvent::Error {
                message: "stream ended before completion".to_string(),
            }];
        }
        let mut events = Vec::new();
        if !self.function_name.is_empty() {
            events.push(StreamEvent::FunctionCall {
                name: self.function_name,
                arguments: self.function_arguments,
            });
        }
        events.push(StreamEvent::Done {
            model: self.model.unwrap_or(requested_model),
            finish_reason: self.finish_reason,
        });
        events
    }
}

// OpenAI streaming chunk types (private, deserialization only)

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<StreamErrorBody>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
    function_call: Option<FunctionCallFragment>,
}

#[derive(Deserialize)]
struct FunctionCallFragment {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct StreamErrorBody {
    message: Option<String>,
}
