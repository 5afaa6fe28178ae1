use async_trait::async_trait;
use relay_core::types::Turn;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::stream::StreamEvent;

/// Function definition sent to the LLM API (legacy `functions` array).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema object describing the arguments.
    pub parameters: serde_json::Value,
}

/// Request to an LLM provider.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    /// Full prompt, system turn first when present.
    pub messages: Vec<Turn>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Functions the model may call. Empty disables function calling.
    pub functions: Vec<FunctionDefinition>,
    /// End-user identifier forwarded for provider-side abuse monitoring.
    pub user: Option<String>,
}

/// Common interface for streaming chat-completion providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    /// Stream response events through a channel.
    ///
    /// Returns `Err` only when the request fails before any event could be
    /// produced (connect errors, non-2xx status). Failures after the stream
    /// has started arrive as [`StreamEvent::Error`]. A well-behaved provider
    /// ends every successful stream with exactly one [`StreamEvent::Done`].
    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Authentication failed ({status}): {message}")]
    Auth { status: u16, message: String },

    #[error("Invalid request ({status}): {message}")]
    InvalidRequest { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    /// The stream broke after it had started.
    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Provider misconfigured: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Whether a retry of the same request has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Http(_) | ProviderError::RateLimited { .. } | ProviderError::Server { .. }
        )
    }

    /// Map a non-success HTTP status onto the error taxonomy.
    pub fn from_status(status: u16, message: String, retry_after_ms: Option<u64>) -> Self {
        match status {
            429 => ProviderError::RateLimited {
                retry_after_ms: retry_after_ms.unwrap_or(5000),
            },
            401 | 403 => ProviderError::Auth { status, message },
            500..=599 => ProviderError::Server { status, message },
            _ => ProviderError::InvalidRequest { status, message },
        }
    }
}
