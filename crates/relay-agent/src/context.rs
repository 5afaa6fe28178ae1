//! Context Assembler: thread history in, a token-bounded prompt out.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use relay_core::types::{parse_message_ts, Role, Turn};
use tracing::debug;

use crate::attach;
use crate::error::ContextError;
use crate::platform::{ChatPlatform, HistoryMessage, IncomingMessage};
use crate::tokens::TokenCounter;
use crate::transform::ContentPipeline;
use crate::updater::EMPTY_REPLY;

#[allow(clippy::expect_used)]
static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<@[A-Z0-9]+>\s*").expect("valid regex"));

/// Leading emoji of the status notices the relay posts itself.
const NOTICE_MARKERS: &[&str] = &[":warning:", ":black_square_for_stop:"];

pub struct ContextAssembler {
    counter: Arc<dyn TokenCounter>,
    pipeline: Arc<ContentPipeline>,
    bot_user_id: String,
    loading_text: Option<String>,
    image_input: bool,
}

impl ContextAssembler {
    pub fn new(
        counter: Arc<dyn TokenCounter>,
        pipeline: Arc<ContentPipeline>,
        bot_user_id: impl Into<String>,
    ) -> Self {
        Self {
            counter,
            pipeline,
            bot_user_id: bot_user_id.into(),
            loading_text: None,
            image_input: false,
        }
    }

    /// Placeholder text left behind by sessions that never settled.
    pub fn with_loading_text(mut self, text: impl Into<String>) -> Self {
        self.loading_text = Some(text.into());
        self
    }

    pub fn with_image_input(mut self, enabled: bool) -> Self {
        self.image_input = enabled;
        self
    }

    pub fn counter(&self) -> &Arc<dyn TokenCounter> {
        &self.counter
    }

    /// Fetch, map, and trim the conversation around `message`.
    ///
    /// `exclude_ts` is the placeholder posted for this session, which must
    /// never be fed back to the model.
    pub async fn assemble(
        &self,
        platform: &dyn ChatPlatform,
        message: &IncomingMessage,
        exclude_ts: Option<&str>,
        system: Option<&str>,
        budget: usize,
    ) -> Result<Vec<Turn>, ContextError> {
        let history = platform
            .fetch_thread_history(&message.thread, message.scope)
            .await
            .map_err(ContextError::History)?;
        let fetched = history.len();
        let images = if self.image_input {
            self.download_images(platform, &history, message).await
        } else {
            HashMap::new()
        };
        let turns = self.build_with_images(history, message, exclude_ts, system, images);
        let turns = self.fit(turns, budget)?;
        debug!(
            thread = %message.thread,
            fetched,
            kept = turns.len(),
            budget,
            "context assembled"
        );
        Ok(turns)
    }

    /// Map history messages to turns, in time order, system turn first.
    pub fn build(
        &self,
        history: Vec<HistoryMessage>,
        trigger: &IncomingMessage,
        exclude_ts: Option<&str>,
        system: Option<&str>,
    ) -> Vec<Turn> {
        self.build_with_images(history, trigger, exclude_ts, system, HashMap::new())
    }

    /// `images` holds `data:` URLs keyed by the `ts` of the message they were shared with.
    fn build_with_images(
        &self,
        history: Vec<HistoryMessage>,
        trigger: &IncomingMessage,
        exclude_ts: Option<&str>,
        system: Option<&str>,
        mut images: HashMap<String, Vec<String>>,
    ) -> Vec<Turn> {
        let mut messages: Vec<HistoryMessage> = history
            .into_iter()
            .filter(|m| Some(m.ts.as_str()) != exclude_ts)
            .filter(|m| !self.is_foreign_bot(m))
            .filter_map(|m| self.without_notices(m))
            .collect();

        // History APIs can lag behind the event that triggered us.
        if !messages.iter().any(|m| m.ts == trigger.ts) {
            messages.push(trigger_message(trigger));
        }
        messages.sort_by_key(|m| parse_message_ts(&m.ts));

        let mut turns = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = system {
            turns.push(Turn::system(self.pipeline.system_text(system)));
        }

        let own_mention = format!("<@{}>", self.bot_user_id);
        for (idx, m) in messages.into_iter().enumerate() {
            let text = if idx == 0 {
                strip_mention(&m.text, &own_mention)
            } else {
                m.text
            };
            let author = m.user.as_deref().unwrap_or("unknown");
            let content = format!("<@{author}>: {}", self.pipeline.outbound(&text));
            let timestamp = parse_message_ts(&m.ts);
            if author == self.bot_user_id {
                turns.push(Turn::assistant(content, timestamp));
            } else {
                let attached = images.remove(&m.ts).unwrap_or_default();
                turns.push(Turn::user(content, timestamp).with_images(attached));
            }
        }
        turns
    }

    /// Drop the oldest non-system turns until the prompt fits `budget`.
    ///
    /// Fails when not even one non-system turn fits. The reported size is
    /// the prompt as it stood before the last removal.
    pub fn fit(&self, mut turns: Vec<Turn>, budget: usize) -> Result<Vec<Turn>, ContextError> {
        let mut used = self.counter.count_turns(&turns);
        let mut before_last_removal = used;
        while used > budget {
            let Some(oldest) = turns.iter().position(|t| t.role != Role::System) else {
                break;
            };
            before_last_removal = used;
            turns.remove(oldest);
            used = self.counter.count_turns(&turns);
        }
        if !turns.iter().any(|t| t.role != Role::System) {
            return Err(ContextError::TooLong {
                used: before_last_removal,
                budget,
            });
        }
        Ok(turns)
    }

    fn is_foreign_bot(&self, m: &HistoryMessage) -> bool {
        m.bot_id.is_some() && m.user.as_deref() != Some(self.bot_user_id.as_str())
    }

    /// Drop the relay's own status posts and strip a notice appended below a
    /// partial answer. Returns `None` when nothing of the answer is left.
    fn without_notices(&self, mut m: HistoryMessage) -> Option<HistoryMessage> {
        if m.user.as_deref() != Some(self.bot_user_id.as_str()) {
            return Some(m);
        }
        let text = m.text.trim();
        if text == EMPTY_REPLY
            || self.loading_text.as_deref().map(str::trim) == Some(text)
            || NOTICE_MARKERS.iter().any(|marker| text.starts_with(marker))
        {
            return None;
        }
        let cut = NOTICE_MARKERS
            .iter()
            .filter_map(|marker| m.text.rfind(&format!("\n\n{marker}")))
            .min();
        if let Some(cut) = cut {
            m.text.truncate(cut);
        }
        Some(m)
    }

    async fn download_images(
        &self,
        platform: &dyn ChatPlatform,
        history: &[HistoryMessage],
        trigger: &IncomingMessage,
    ) -> HashMap<String, Vec<String>> {
        let trigger_fallback = trigger_message(trigger);
        let mut candidates: Vec<&HistoryMessage> = history
            .iter()
            .filter(|m| m.bot_id.is_none() && m.user.as_deref() != Some(self.bot_user_id.as_str()))
            .collect();
        if !history.iter().any(|m| m.ts == trigger.ts) {
            candidates.push(&trigger_fallback);
        }

        let mut images = HashMap::new();
        for m in candidates {
            if !m.files.iter().any(|f| f.is_image()) {
                continue;
            }
            let urls = attach::image_urls(platform, &m.files).await;
            if !urls.is_empty() {
                images.insert(m.ts.clone(), urls);
            }
        }
        images
    }
}

fn trigger_message(trigger: &IncomingMessage) -> HistoryMessage {
    HistoryMessage {
        ts: trigger.ts.clone(),
        user: Some(trigger.user.clone()),
        bot_id: None,
        text: trigger.text.clone(),
        files: trigger.files.clone(),
    }
}

fn strip_mention(text: &str, mention: &str) -> String {
    MENTION_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            if caps[0].starts_with(mention) {
                String::new()
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{ConversationScope, FileRef, PlatformError};
    use crate::tokens::CharCounter;
    use async_trait::async_trait;
    use relay_core::config::RedactionConfig;
    use relay_core::types::{MessageRef, ThreadKey};

    use crate::transform::Redactor;

    fn assembler(pipeline: ContentPipeline) -> ContextAssembler {
        ContextAssembler::new(Arc::new(CharCounter), Arc::new(pipeline), "UBOT")
    }

    fn msg(ts: &str, user: &str, text: &str) -> HistoryMessage {
        HistoryMessage {
            ts: ts.into(),
            user: Some(user.into()),
            bot_id: None,
            text: text.into(),
            files: Vec::new(),
        }
    }

    fn trigger(ts: &str, text: &str) -> IncomingMessage {
        IncomingMessage {
            thread: ThreadKey::new("C1", "1.000"),
            ts: ts.into(),
            user: "U1".into(),
            text: text.into(),
            files: Vec::new(),
            scope: ConversationScope::Thread,
        }
    }

    fn own(ts: &str, text: &str) -> HistoryMessage {
        HistoryMessage {
            bot_id: Some("B1".into()),
            ..msg(ts, "UBOT", text)
        }
    }

    #[test]
    fn maps_roles_in_time_order_with_system_first() {
        let a = assembler(ContentPipeline::passthrough());
        let history = vec![
            msg("3.000", "U1", "and the second?"),
            msg("1.000", "U1", "<@UBOT> first question"),
            HistoryMessage {
                bot_id: Some("B1".into()),
                ..msg("2.000", "UBOT", "first answer")
            },
        ];
        let turns = a.build(history, &trigger("4.000", "thanks"), None, Some("be brief"));

        let roles: Vec<Role> = turns.iter().map(|t| t.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::User, Role::User]
        );
        assert_eq!(turns[1].content, "<@U1>: first question");
        assert_eq!(turns[2].content, "<@UBOT>: first answer");
        assert_eq!(turns[4].content, "<@U1>: thanks");
    }

    #[test]
    fn skips_other_bots_and_the_placeholder() {
        let a = assembler(ContentPipeline::passthrough());
        let history = vec![
            msg("1.000", "U1", "hello"),
            HistoryMessage {
                bot_id: Some("BOTHER".into()),
                ..msg("2.000", "UOTHER", "I am a different app")
            },
            HistoryMessage {
                bot_id: Some("B1".into()),
                ..msg("3.000", "UBOT", "Wait a second")
            },
        ];
        let turns = a.build(history, &trigger("1.000", "hello"), Some("3.000"), None);
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].content, "<@U1>: hello");
    }

    #[test]
    fn own_status_notices_are_not_replayed() {
        let a = assembler(ContentPipeline::passthrough()).with_loading_text(":hourglass: Wait a second");
        let history = vec![
            msg("1.000", "U1", "<@UBOT> first"),
            own("2.000", ":hourglass: Wait a second"),
            msg("3.000", "U1", "second"),
            own("4.000", ":warning: I'm still working on the previous message in this thread."),
            own("5.000", "Half of an answer\n\n:black_square_for_stop: Stopped."),
            own("6.000", ":warning: Apologies! It seems that the model didn't respond."),
            own("7.000", EMPTY_REPLY),
            own("8.000", "A full answer"),
        ];
        let turns = a.build(history, &trigger("9.000", "third"), None, None);
        let contents: Vec<&str> = turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(
            contents,
            vec![
                "<@U1>: first",
                "<@U1>: second",
                "<@UBOT>: Half of an answer",
                "<@UBOT>: A full answer",
                "<@U1>: third",
            ]
        );
    }

    #[test]
    fn human_warnings_are_kept() {
        let a = assembler(ContentPipeline::passthrough());
        let turns = a.build(
            vec![msg("1.000", "U1", ":warning: prod is down")],
            &trigger("1.000", ""),
            None,
            None,
        );
        assert_eq!(turns[0].content, "<@U1>: :warning: prod is down");
    }

    #[test]
    fn other_mentions_survive_on_the_root_message() {
        let a = assembler(ContentPipeline::passthrough());
        let turns = a.build(
            vec![msg("1.000", "U1", "<@UBOT> ask <@U2> about it")],
            &trigger("1.000", ""),
            None,
            None,
        );
        assert_eq!(turns[0].content, "<@U1>: ask <@U2> about it");
    }

    #[test]
    fn outbound_pipeline_redacts_history() {
        let redactor = Redactor::from_config(&RedactionConfig {
            enabled: true,
            ..RedactionConfig::default()
        })
        .unwrap();
        let a = assembler(ContentPipeline::new(redactor, false));
        let turns = a.build(
            vec![msg("1.000", "U1", "mail me at jane@example.com")],
            &trigger("1.000", ""),
            None,
            None,
        );
        assert_eq!(turns[0].content, "<@U1>: mail me at [EMAIL]");
    }

    #[test]
    fn fit_keeps_system_and_latest_within_budget() {
        let a = assembler(ContentPipeline::passthrough());
        let history: Vec<HistoryMessage> = (1..=40)
            .map(|i| msg(&format!("{i}.000"), "U1", &"word ".repeat(50)))
            .collect();
        let turns = a.build(history, &trigger("40.000", ""), None, Some("system"));
        let total = CharCounter.count_turns(&turns);
        let budget = total / 3;

        let fitted = a.fit(turns.clone(), budget).unwrap();
        assert!(CharCounter.count_turns(&fitted) <= budget);
        assert_eq!(fitted.first().unwrap().role, Role::System);
        assert_eq!(fitted.last(), turns.last());

        // trimming is idempotent
        assert_eq!(a.fit(fitted.clone(), budget).unwrap(), fitted);
    }

    #[test]
    fn fit_fails_when_only_system_would_remain() {
        let a = assembler(ContentPipeline::passthrough());
        let turns = a.build(
            Vec::new(),
            &trigger("1.000", &"x".repeat(4000)),
            None,
            Some("system"),
        );
        let before = CharCounter.count_turns(&turns);
        match a.fit(turns, 100) {
            Err(ContextError::TooLong { used, budget }) => {
                assert_eq!(used, before);
                assert_eq!(budget, 100);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    struct Broken;

    #[async_trait]
    impl ChatPlatform for Broken {
        async fn fetch_thread_history(
            &self,
            _thread: &ThreadKey,
            _scope: ConversationScope,
        ) -> Result<Vec<HistoryMessage>, PlatformError> {
            Err(PlatformError::Api {
                method: "conversations.replies".into(),
                error: "thread_not_found".into(),
            })
        }

        async fn post_message(
            &self,
            _channel: &str,
            _thread_ts: Option<&str>,
            _text: &str,
        ) -> Result<MessageRef, PlatformError> {
            Err(PlatformError::Transport("unused".into()))
        }

        async fn edit_message(&self, _message: &MessageRef, _text: &str) -> Result<(), PlatformError> {
            Err(PlatformError::Transport("unused".into()))
        }
    }

    const GIF: &[u8] = b"GIF89a\x01\0\x01\0";

    struct Shared {
        history: Vec<HistoryMessage>,
    }

    #[async_trait]
    impl ChatPlatform for Shared {
        async fn fetch_thread_history(
            &self,
            _thread: &ThreadKey,
            _scope: ConversationScope,
        ) -> Result<Vec<HistoryMessage>, PlatformError> {
            Ok(self.history.clone())
        }

        async fn post_message(
            &self,
            _channel: &str,
            _thread_ts: Option<&str>,
            _text: &str,
        ) -> Result<MessageRef, PlatformError> {
            Err(PlatformError::Transport("unused".into()))
        }

        async fn edit_message(&self, _message: &MessageRef, _text: &str) -> Result<(), PlatformError> {
            Err(PlatformError::Transport("unused".into()))
        }

        async fn download_file(&self, _file: &FileRef) -> Result<Vec<u8>, PlatformError> {
            Ok(GIF.to_vec())
        }
    }

    fn gif(url: &str) -> FileRef {
        FileRef {
            name: Some("chart.gif".into()),
            mimetype: Some("image/gif".into()),
            url: url.into(),
        }
    }

    #[tokio::test]
    async fn human_images_are_attached_when_enabled() {
        let platform = Shared {
            history: vec![
                HistoryMessage {
                    files: vec![gif("https://files/1")],
                    ..msg("1.000", "U1", "<@UBOT> what is this?")
                },
                HistoryMessage {
                    files: vec![gif("https://files/2")],
                    ..own("2.000", "a chart")
                },
            ],
        };
        let message = trigger("1.000", "<@UBOT> what is this?");

        let off = assembler(ContentPipeline::passthrough());
        let turns = off.assemble(&platform, &message, None, None, 10_000).await.unwrap();
        assert!(turns.iter().all(|t| t.images.is_empty()));

        let on = assembler(ContentPipeline::passthrough()).with_image_input(true);
        let turns = on.assemble(&platform, &message, None, None, 10_000).await.unwrap();
        assert_eq!(turns[0].images, vec![attach::data_url("image/gif", GIF)]);
        assert!(turns[1].images.is_empty());
    }

    #[tokio::test]
    async fn images_on_a_trigger_missing_from_history_are_attached() {
        let platform = Shared { history: Vec::new() };
        let mut message = trigger("5.000", "look");
        message.files = vec![gif("https://files/5")];
        let a = assembler(ContentPipeline::passthrough()).with_image_input(true);
        let turns = a.assemble(&platform, &message, None, None, 10_000).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].images.len(), 1);
    }

    #[tokio::test]
    async fn history_failure_is_not_an_empty_context() {
        let a = assembler(ContentPipeline::passthrough());
        let err = a
            .assemble(&Broken, &trigger("1.000", "hi"), None, None, 1000)
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::History(_)));
    }
}
