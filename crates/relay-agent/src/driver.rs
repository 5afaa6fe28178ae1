//! Completion Stream Driver: one streaming request, consumed delta by delta.

use std::sync::Arc;
use std::time::Duration;

use relay_core::types::FunctionCall;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{SessionError, TimeoutKind};
use crate::provider::{ChatRequest, LlmProvider, ProviderError};
use crate::session::{GenerationSession, SessionStatus};
use crate::stream::StreamEvent;
use crate::updater::ReplyUpdater;

/// How a single stream ended when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum DriveOutcome {
    Completed { finish_reason: Option<String> },
    /// The model asked for a local function instead of answering.
    FunctionCall(FunctionCall),
}

/// What one stream has produced so far, beyond the text.
#[derive(Default)]
struct StreamProgress {
    function_call: Option<FunctionCall>,
    finished: Option<Option<String>>,
}

pub struct StreamDriver {
    provider: Arc<dyn LlmProvider>,
    stale_timeout: Duration,
}

impl StreamDriver {
    pub fn new(provider: Arc<dyn LlmProvider>, stale_timeout: Duration) -> Self {
        Self {
            provider,
            stale_timeout,
        }
    }

    /// Stream `req` into `session`, rendering through `updater`.
    ///
    /// Aborts with `Timeout` when no event arrives within the staleness
    /// window or when `deadline` passes, and with `Cancelled` when `cancel`
    /// trips. The partial text stays in `session.accumulated_text` either way.
    pub async fn drive(
        &self,
        req: &ChatRequest,
        session: &mut GenerationSession,
        updater: &mut ReplyUpdater,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<DriveOutcome, SessionError> {
        let (stream_tx, mut stream_rx) = mpsc::channel::<StreamEvent>(64);
        let send_fut = self.provider.send_stream(req, stream_tx);
        tokio::pin!(send_fut);

        session.status = SessionStatus::Streaming;
        let mut progress = StreamProgress::default();
        let mut last_event = Instant::now();

        loop {
            let flush_at = updater.next_due();
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(session = %session.id, "stream cancelled");
                    return Err(SessionError::Cancelled);
                }
                _ = sleep_until(deadline) => {
                    return Err(SessionError::Timeout {
                        kind: TimeoutKind::Total,
                        elapsed: session.elapsed(),
                    });
                }
                _ = sleep_until(last_event + self.stale_timeout) => {
                    warn!(session = %session.id, stale_ms = self.stale_timeout.as_millis() as u64, "stream went stale");
                    return Err(SessionError::Timeout {
                        kind: TimeoutKind::Stale,
                        elapsed: session.elapsed(),
                    });
                }
                _ = sleep_until(flush_at.unwrap_or(deadline)), if flush_at.is_some() => {
                    updater.flush(&session.accumulated_text).await;
                }
                event = stream_rx.recv() => {
                    match event {
                        Some(event) => {
                            last_event = Instant::now();
                            apply(event, session, updater, &mut progress).await?;
                        }
                        None => {
                            // Channel closed before the send future was polled to completion.
                            if let Err(e) = (&mut send_fut).await {
                                warn!(provider = self.provider.name(), error = %e, "send_stream failed");
                                return Err(e.into());
                            }
                            break;
                        }
                    }
                }
                result = &mut send_fut => {
                    if let Err(e) = result {
                        warn!(provider = self.provider.name(), error = %e, "send_stream failed");
                        return Err(e.into());
                    }
                    while let Ok(event) = stream_rx.try_recv() {
                        apply(event, session, updater, &mut progress).await?;
                    }
                    break;
                }
            }
        }

        if let Some(call) = progress.function_call {
            session.status = SessionStatus::AwaitingFunction;
            debug!(session = %session.id, function = %call.name, "stream ended in function call");
            return Ok(DriveOutcome::FunctionCall(call));
        }
        match progress.finished {
            Some(finish_reason) => Ok(DriveOutcome::Completed { finish_reason }),
            None => Err(ProviderError::Stream("stream ended without a completion signal".into()).into()),
        }
    }
}

async fn apply(
    event: StreamEvent,
    session: &mut GenerationSession,
    updater: &mut ReplyUpdater,
    progress: &mut StreamProgress,
) -> Result<(), SessionError> {
    match event {
        StreamEvent::TextDelta { text } => {
            // Text is suspended once the model has switched to a function call.
            if progress.function_call.is_some() || text.is_empty() {
                return Ok(());
            }
            session.accumulated_text.push_str(&text);
            updater.mark_dirty();
            updater.maybe_flush(&session.accumulated_text).await;
        }
        StreamEvent::FunctionCall { name, arguments } => {
            session.status = SessionStatus::AwaitingFunction;
            progress.function_call = Some(FunctionCall { name, arguments });
        }
        StreamEvent::Done {
            model,
            finish_reason,
        } => {
            debug!(session = %session.id, model = %model, finish_reason = ?finish_reason, "stream done");
            progress.finished = Some(finish_reason);
        }
        StreamEvent::Error { message } => {
            warn!(session = %session.id, error = %message, "stream error");
            return Err(ProviderError::Stream(message).into());
        }
    }
    Ok(())
}
