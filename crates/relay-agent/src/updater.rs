//! Rate-limited rendering of a streaming reply into one placeholder message.

use std::sync::Arc;
use std::time::Duration;

use relay_core::config::ReplyConfig;
use relay_core::types::MessageRef;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::platform::{ChatPlatform, PlatformError};
use crate::transform::ContentPipeline;

/// Shown when a session settles without producing any text.
pub const EMPTY_REPLY: &str = "_(no response)_";

#[derive(Debug, Clone)]
pub struct UpdaterSettings {
    pub min_interval: Duration,
    pub typing_suffix: String,
}

impl UpdaterSettings {
    pub fn from_config(config: &ReplyConfig) -> Self {
        Self {
            min_interval: Duration::from_millis(config.min_edit_interval_ms),
            typing_suffix: config.typing_suffix.clone(),
        }
    }
}

pub struct ReplyUpdater {
    platform: Arc<dyn ChatPlatform>,
    pipeline: Arc<ContentPipeline>,
    target: MessageRef,
    settings: UpdaterSettings,
    last_edit: Instant,
    dirty: bool,
    shown: String,
    edits: u32,
}

impl ReplyUpdater {
    /// `target` was just posted, so the first edit waits a full interval.
    pub fn new(
        platform: Arc<dyn ChatPlatform>,
        pipeline: Arc<ContentPipeline>,
        target: MessageRef,
        settings: UpdaterSettings,
    ) -> Self {
        Self {
            platform,
            pipeline,
            target,
            settings,
            last_edit: Instant::now(),
            dirty: false,
            shown: String::new(),
            edits: 0,
        }
    }

    pub fn target(&self) -> &MessageRef {
        &self.target
    }

    /// Number of successful edits so far.
    pub fn edits(&self) -> u32 {
        self.edits
    }

    /// Record that the accumulated text changed since the last render.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// When the pending render may be flushed, if one is pending.
    pub fn next_due(&self) -> Option<Instant> {
        self.dirty
            .then(|| self.last_edit + self.settings.min_interval)
    }

    /// Render now if a change is pending and the interval has elapsed.
    /// Otherwise the change stays coalesced for the next due time.
    pub async fn maybe_flush(&mut self, accumulated: &str) {
        if let Some(due) = self.next_due() {
            if Instant::now() >= due {
                self.flush(accumulated).await;
            }
        }
    }

    /// Intermediate render with the typing suffix. Failures are tolerated.
    pub async fn flush(&mut self, accumulated: &str) {
        self.dirty = false;
        let rendered = self.pipeline.inbound(accumulated);
        if rendered.trim().is_empty() || rendered == self.shown {
            return;
        }
        let text = format!("{rendered}{}", self.settings.typing_suffix);
        // A failed edit still counts against the interval.
        self.last_edit = Instant::now();
        match self.platform.edit_message(&self.target, &text).await {
            Ok(()) => {
                self.edits += 1;
                self.shown = rendered;
                debug!(message = %self.target, edits = self.edits, "reply updated");
            }
            Err(e) => warn!(message = %self.target, error = %e, "intermediate edit failed"),
        }
    }

    /// Final render: always issued, never suffixed. `notice` is appended
    /// below the text (or replaces it when there is no text).
    pub async fn finish(
        &mut self,
        accumulated: &str,
        notice: Option<&str>,
    ) -> Result<String, PlatformError> {
        self.dirty = false;
        let body = self.pipeline.inbound(accumulated);
        let text = match (body.trim().is_empty(), notice) {
            (true, Some(notice)) => notice.to_string(),
            (false, Some(notice)) => format!("{body}\n\n{notice}"),
            (true, None) => EMPTY_REPLY.to_string(),
            (false, None) => body,
        };
        self.last_edit = Instant::now();
        self.platform.edit_message(&self.target, &text).await?;
        self.edits += 1;
        self.shown = text.clone();
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{ConversationScope, HistoryMessage};
    use async_trait::async_trait;
    use relay_core::types::ThreadKey;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Edits {
        log: Mutex<Vec<String>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl ChatPlatform for Edits {
        async fn fetch_thread_history(
            &self,
            _thread: &ThreadKey,
            _scope: ConversationScope,
        ) -> Result<Vec<HistoryMessage>, PlatformError> {
            Ok(Vec::new())
        }

        async fn post_message(
            &self,
            channel: &str,
            _thread_ts: Option<&str>,
            _text: &str,
        ) -> Result<MessageRef, PlatformError> {
            Ok(MessageRef {
                channel: channel.to_string(),
                ts: "9.0".to_string(),
            })
        }

        async fn edit_message(&self, _message: &MessageRef, text: &str) -> Result<(), PlatformError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(PlatformError::Api {
                    method: "chat.update".into(),
                    error: "msg_too_long".into(),
                });
            }
            self.log.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn updater(platform: Arc<Edits>) -> ReplyUpdater {
        ReplyUpdater::new(
            platform,
            Arc::new(ContentPipeline::passthrough()),
            MessageRef {
                channel: "C1".into(),
                ts: "9.0".into(),
            },
            UpdaterSettings {
                min_interval: Duration::from_millis(1000),
                typing_suffix: " ...".into(),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn coalesces_until_interval_then_finishes_with_full_text() {
        let platform = Arc::new(Edits::default());
        let mut u = updater(platform.clone());

        u.mark_dirty();
        u.maybe_flush("Hel").await;
        u.mark_dirty();
        u.maybe_flush("Hello").await;
        assert!(platform.log.lock().unwrap().is_empty());
        assert!(u.next_due().is_some());

        tokio::time::advance(Duration::from_millis(1000)).await;
        u.mark_dirty();
        u.maybe_flush("Hello").await;
        assert_eq!(*platform.log.lock().unwrap(), vec!["Hello ..."]);
        assert!(u.next_due().is_none());

        let final_text = u.finish("Hello world", None).await.unwrap();
        assert_eq!(final_text, "Hello world");
        assert_eq!(platform.log.lock().unwrap().last().unwrap(), "Hello world");
        assert_eq!(u.edits(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_render_is_not_re_sent() {
        let platform = Arc::new(Edits::default());
        let mut u = updater(platform.clone());
        tokio::time::advance(Duration::from_secs(2)).await;
        u.flush("same").await;
        tokio::time::advance(Duration::from_secs(2)).await;
        u.mark_dirty();
        u.maybe_flush("same").await;
        assert_eq!(platform.log.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn intermediate_failure_is_tolerated_but_final_is_not() {
        let platform = Arc::new(Edits::default());
        let mut u = updater(platform.clone());
        platform.fail.store(true, Ordering::SeqCst);

        tokio::time::advance(Duration::from_secs(2)).await;
        u.mark_dirty();
        u.maybe_flush("partial").await;
        assert_eq!(u.edits(), 0);

        assert!(u.finish("partial", None).await.is_err());
    }

    #[tokio::test]
    async fn notice_is_appended_or_stands_alone() {
        let platform = Arc::new(Edits::default());
        let mut u = updater(platform.clone());
        let text = u.finish("half an ans", Some(":warning: timed out")).await.unwrap();
        assert_eq!(text, "half an ans\n\n:warning: timed out");

        let text = u.finish("", Some(":warning: timed out")).await.unwrap();
        assert_eq!(text, ":warning: timed out");

        let text = u.finish("\n", None).await.unwrap();
        assert_eq!(text, EMPTY_REPLY);
    }
}
