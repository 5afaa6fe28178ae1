//! Session orchestration: admission, context, streaming, function hops, and
//! the single settling edit every session ends with.

use std::sync::Arc;
use std::time::Duration;

use relay_core::config::{ModelConfig, RelayConfig};
use relay_core::types::{MessageRef, ThreadKey, Turn};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::context::ContextAssembler;
use crate::driver::{DriveOutcome, StreamDriver};
use crate::error::{SessionError, TimeoutKind};
use crate::functions::FunctionRegistry;
use crate::guard::{AcquireError, ThreadGuard};
use crate::platform::{ChatPlatform, IncomingMessage};
use crate::provider::{ChatRequest, FunctionDefinition, LlmProvider};
use crate::tokens::TokenCounter;
use crate::transform::ContentPipeline;
use crate::updater::{ReplyUpdater, UpdaterSettings};

/// Posted when a second message arrives while a thread is being answered.
pub const BUSY_NOTICE: &str =
    ":warning: I'm still working on the previous message in this thread. Please wait until it's done.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    Streaming,
    AwaitingFunction,
    Completed,
    Cancelled,
    Failed,
}

/// Per-request state, alive for one request/response cycle.
#[derive(Debug)]
pub struct GenerationSession {
    pub id: Uuid,
    pub thread: ThreadKey,
    pub placeholder: MessageRef,
    pub accumulated_text: String,
    pub status: SessionStatus,
    pub started_at: Instant,
}

impl GenerationSession {
    pub fn new(id: Uuid, thread: ThreadKey, placeholder: MessageRef) -> Self {
        Self {
            id,
            thread,
            placeholder,
            accumulated_text: String::new(),
            status: SessionStatus::Pending,
            started_at: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    /// Another session owns the thread, or the relay is shutting down.
    Rejected,
    Cancelled,
    TimedOut,
    Failed { code: &'static str },
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOutcome::Completed => "completed",
            SessionOutcome::Rejected => "rejected",
            SessionOutcome::Cancelled => "cancelled",
            SessionOutcome::TimedOut => "timed_out",
            SessionOutcome::Failed { .. } => "failed",
        }
    }

    /// Terminal status recorded on the session. A timeout is a cancellation
    /// the relay issued on its own.
    pub fn status(&self) -> SessionStatus {
        match self {
            SessionOutcome::Completed => SessionStatus::Completed,
            SessionOutcome::Cancelled | SessionOutcome::TimedOut => SessionStatus::Cancelled,
            SessionOutcome::Rejected | SessionOutcome::Failed { .. } => SessionStatus::Failed,
        }
    }
}

/// Everything a session needs from configuration, resolved at startup.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub model: ModelConfig,
    pub updater: UpdaterSettings,
    pub loading_text: String,
    pub max_hops: u32,
}

impl RelaySettings {
    pub fn from_config(config: &RelayConfig, bot_user_id: &str) -> relay_core::error::Result<Self> {
        Ok(Self {
            model: config.model_config(bot_user_id)?,
            updater: UpdaterSettings::from_config(&config.reply),
            loading_text: config.reply.loading_text.clone(),
            max_hops: config.functions.max_hops,
        })
    }
}

pub struct Relay {
    platform: Arc<dyn ChatPlatform>,
    driver: StreamDriver,
    assembler: ContextAssembler,
    pipeline: Arc<ContentPipeline>,
    functions: FunctionRegistry,
    function_defs: Vec<FunctionDefinition>,
    function_tokens: usize,
    guard: ThreadGuard,
    settings: RelaySettings,
}

impl Relay {
    pub fn new(
        platform: Arc<dyn ChatPlatform>,
        provider: Arc<dyn LlmProvider>,
        counter: Arc<dyn TokenCounter>,
        pipeline: ContentPipeline,
        functions: FunctionRegistry,
        bot_user_id: &str,
        settings: RelaySettings,
    ) -> Self {
        let pipeline = Arc::new(pipeline);
        let function_defs = functions.definitions();
        let function_tokens = if function_defs.is_empty() {
            0
        } else {
            counter.count_functions(&function_defs)
        };
        info!(
            provider = provider.name(),
            model = %settings.model.model_id,
            context_window = settings.model.context_window_tokens,
            functions = function_defs.len(),
            function_tokens,
            "relay ready"
        );
        Self {
            driver: StreamDriver::new(
                provider,
                Duration::from_secs(settings.model.stale_timeout_seconds),
            ),
            assembler: ContextAssembler::new(counter, Arc::clone(&pipeline), bot_user_id)
                .with_loading_text(settings.loading_text.clone())
                .with_image_input(settings.model.image_input),
            platform,
            pipeline,
            functions,
            function_defs,
            function_tokens,
            guard: ThreadGuard::new(),
            settings,
        }
    }

    pub fn model(&self) -> &ModelConfig {
        &self.settings.model
    }

    pub fn guard(&self) -> &ThreadGuard {
        &self.guard
    }

    pub fn active_sessions(&self) -> usize {
        self.guard.active_count()
    }

    /// Explicit stop from the chat interface.
    pub fn stop(&self, thread: &ThreadKey) -> bool {
        self.guard.cancel(thread)
    }

    /// Refuse new work and cancel everything in flight.
    pub fn shutdown(&self) -> usize {
        self.guard.cancel_all()
    }

    /// Answer one message end to end. Never returns an error: every failure
    /// is settled into the placeholder as a single notice.
    #[instrument(skip(self, message), fields(thread = %message.thread))]
    pub async fn handle(&self, message: IncomingMessage) -> SessionOutcome {
        let permit = match self.guard.try_acquire(&message.thread) {
            Ok(permit) => permit,
            Err(AcquireError::Busy) => {
                info!("thread busy, rejecting message");
                if let Err(e) = self
                    .platform
                    .post_message(&message.thread.channel, message.reply_thread_ts(), BUSY_NOTICE)
                    .await
                {
                    warn!(error = %e, "failed to post busy notice");
                }
                return SessionOutcome::Rejected;
            }
            Err(AcquireError::ShuttingDown) => {
                debug!("shutting down, ignoring message");
                return SessionOutcome::Rejected;
            }
        };

        let deadline = Instant::now() + Duration::from_secs(self.settings.model.timeout_seconds);
        let placeholder = match self
            .platform
            .post_message(
                &message.thread.channel,
                message.reply_thread_ts(),
                &self.settings.loading_text,
            )
            .await
        {
            Ok(placeholder) => placeholder,
            Err(e) => {
                warn!(error = %e, "failed to post placeholder");
                return SessionOutcome::Failed {
                    code: "PLATFORM_ERROR",
                };
            }
        };

        let mut session =
            GenerationSession::new(permit.id(), message.thread.clone(), placeholder.clone());
        let mut updater = ReplyUpdater::new(
            Arc::clone(&self.platform),
            Arc::clone(&self.pipeline),
            placeholder,
            self.settings.updater.clone(),
        );

        let result = self
            .run(&message, &mut session, &mut updater, permit.cancel_token(), deadline)
            .await;
        self.settle(&mut session, &mut updater, result).await
    }

    async fn run(
        &self,
        message: &IncomingMessage,
        session: &mut GenerationSession,
        updater: &mut ReplyUpdater,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<(), SessionError> {
        let model = &self.settings.model;
        let budget = model.context_budget(self.function_tokens);
        let mut turns = self
            .assembler
            .assemble(
                self.platform.as_ref(),
                message,
                Some(session.placeholder.ts.as_str()),
                model.system_priming_text.as_deref(),
                budget,
            )
            .await?;

        let mut hops = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            let req = ChatRequest {
                model: model.model_id.clone(),
                messages: turns.clone(),
                max_tokens: model.max_tokens,
                temperature: model.temperature,
                functions: self.function_defs.clone(),
                user: Some(message.user.clone()),
            };

            let call = match self.driver.drive(&req, session, updater, cancel, deadline).await? {
                DriveOutcome::Completed { finish_reason } => {
                    session.status = SessionStatus::Completed;
                    debug!(finish_reason = ?finish_reason, hops, "generation complete");
                    return Ok(());
                }
                DriveOutcome::FunctionCall(call) => call,
            };

            hops += 1;
            if hops > self.settings.max_hops {
                return Err(SessionError::FunctionLimit {
                    max_hops: self.settings.max_hops,
                });
            }
            info!(hop = hops, function = %call.name, "invoking function");
            let record = tokio::select! {
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                _ = sleep_until(deadline) => {
                    return Err(SessionError::Timeout {
                        kind: TimeoutKind::Total,
                        elapsed: session.elapsed(),
                    });
                }
                record = self.functions.invoke(&call) => record,
            };

            turns.push(Turn::function_request(call));
            turns.push(record.into_turn());
            turns = self.assembler.fit(turns, budget)?;
        }
    }

    async fn settle(
        &self,
        session: &mut GenerationSession,
        updater: &mut ReplyUpdater,
        result: Result<(), SessionError>,
    ) -> SessionOutcome {
        let (outcome, notice) = match &result {
            Ok(()) => (SessionOutcome::Completed, None),
            Err(e) => {
                let model = &self.settings.model;
                let notice = e.user_notice(model.timeout_seconds, model.stale_timeout_seconds);
                let outcome = match e {
                    SessionError::Cancelled => SessionOutcome::Cancelled,
                    SessionError::Timeout { .. } => SessionOutcome::TimedOut,
                    other => SessionOutcome::Failed { code: other.code() },
                };
                warn!(session = %session.id, code = e.code(), error = %e, "session did not complete");
                (outcome, Some(notice))
            }
        };
        session.status = outcome.status();

        let outcome = match updater
            .finish(&session.accumulated_text, notice.as_deref())
            .await
        {
            Ok(_) => outcome,
            Err(e) => {
                warn!(session = %session.id, error = %e, "final edit failed");
                session.status = SessionStatus::Failed;
                match outcome {
                    SessionOutcome::Completed => SessionOutcome::Failed {
                        code: "PLATFORM_ERROR",
                    },
                    other => other,
                }
            }
        };

        info!(
            session = %session.id,
            outcome = outcome.as_str(),
            edits = updater.edits(),
            chars = session.accumulated_text.chars().count(),
            elapsed_ms = session.elapsed().as_millis() as u64,
            "session settled"
        );
        outcome
    }
}
