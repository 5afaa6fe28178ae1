use std::time::Duration;

use crate::platform::PlatformError;
use crate::provider::ProviderError;

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("failed to fetch thread history: {0}")]
    History(#[source] PlatformError),

    /// Nothing but the system turn fits the budget.
    #[error("prompt too long ({used}/{budget} tokens)")]
    TooLong { used: usize, budget: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// No stream event within the staleness window.
    Stale,
    /// The whole session ran past its wall-clock limit.
    Total,
}

/// Why a generation session ended without completing.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("context error: {0}")]
    Context(#[from] ContextError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("timed out ({kind:?}) after {elapsed:?}")]
    Timeout { kind: TimeoutKind, elapsed: Duration },

    #[error("cancelled")]
    Cancelled,

    #[error("function-call limit exceeded ({max_hops} hops)")]
    FunctionLimit { max_hops: u32 },

    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),
}

impl SessionError {
    /// Short error code for structured log fields.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::Context(_) => "CONTEXT_ERROR",
            SessionError::Provider(_) => "PROVIDER_ERROR",
            SessionError::Timeout { .. } => "TIMEOUT",
            SessionError::Cancelled => "CANCELLED",
            SessionError::FunctionLimit { .. } => "FUNCTION_LIMIT",
            SessionError::Platform(_) => "PLATFORM_ERROR",
        }
    }

    /// The single message shown in the thread for this failure. Never
    /// includes raw provider or platform payloads. A timeout quotes the
    /// limit that actually fired.
    pub fn user_notice(&self, total_seconds: u64, stale_seconds: u64) -> String {
        match self {
            SessionError::Context(ContextError::TooLong { used, budget }) => format!(
                ":warning: The previous message is too long ({used}/{budget} prompt tokens)."
            ),
            SessionError::Context(ContextError::History(_)) => {
                ":warning: Failed to load the conversation history. Please try again.".to_string()
            }
            SessionError::Provider(e) => provider_notice(e).to_string(),
            SessionError::Timeout { kind, .. } => {
                let seconds = match kind {
                    TimeoutKind::Stale => stale_seconds,
                    TimeoutKind::Total => total_seconds,
                };
                format!(
                    ":warning: Apologies! It seems that the model didn't respond within the \
                     {seconds}-second timeframe. Please try your request again later."
                )
            }
            SessionError::Cancelled => ":black_square_for_stop: Stopped.".to_string(),
            SessionError::FunctionLimit { max_hops } => format!(
                ":warning: Function-call limit exceeded ({max_hops} calls) without a final answer."
            ),
            SessionError::Platform(_) => {
                ":warning: Failed to update the reply. Please try again.".to_string()
            }
        }
    }
}

fn provider_notice(e: &ProviderError) -> &'static str {
    match e {
        ProviderError::RateLimited { .. } => {
            ":warning: The model is busy right now (rate limited). Please try again in a moment."
        }
        ProviderError::Auth { .. } => {
            ":warning: The model provider rejected the configured credentials."
        }
        ProviderError::InvalidRequest { .. } => {
            ":warning: The model provider rejected the request."
        }
        ProviderError::Config(_) => ":warning: The model provider is not configured correctly.",
        ProviderError::Cancelled => ":black_square_for_stop: Stopped.",
        ProviderError::Http(_)
        | ProviderError::Server { .. }
        | ProviderError::Parse(_)
        | ProviderError::Stream(_) => {
            ":warning: The model provider is unavailable right now. Please try again later."
        }
    }
}
