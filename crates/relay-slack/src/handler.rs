//! Decides which Slack events the relay answers.
//!
//! Rules:
//! 1. Edits, deletes and other message subtypes are ignored.
//! 2. Messages from other apps and from the bot itself are ignored.
//! 3. `<@BOT> stop` stops the active session on that thread.
//! 4. Mentions are answered, unless the thread root already mentions the
//!    bot (the message event for the same post answers those).
//! 5. Direct messages are always answered; outside a thread the recent DM
//!    history is the context and the whole DM is one conversation.
//! 6. Channel thread replies are answered only when the root mentions the bot.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use relay_agent::platform::{ConversationScope, HistoryMessage, IncomingMessage, PlatformError};
use relay_core::types::ThreadKey;
use tracing::{debug, warn};

use crate::api::SlackClient;
use crate::events::{MessageEvent, SlackEvent};

#[allow(clippy::expect_used)]
static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<@[A-Z0-9]+(\|[^>]*)?>").expect("valid regex"));

/// Subtypes that still carry a user's message.
const ANSWERABLE_SUBTYPES: &[&str] = &["thread_broadcast", "file_share"];

#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Answer(IncomingMessage),
    Stop(ThreadKey),
    Ignore(&'static str),
}

/// Looks up the root message of a channel thread.
#[async_trait]
pub trait ThreadRoots: Send + Sync {
    async fn root_message(
        &self,
        channel: &str,
        thread_ts: &str,
    ) -> Result<Option<HistoryMessage>, PlatformError>;
}

#[async_trait]
impl ThreadRoots for SlackClient {
    async fn root_message(
        &self,
        channel: &str,
        thread_ts: &str,
    ) -> Result<Option<HistoryMessage>, PlatformError> {
        SlackClient::root_message(self, channel, thread_ts).await
    }
}

#[async_trait]
impl<T: ThreadRoots + ?Sized> ThreadRoots for Arc<T> {
    async fn root_message(
        &self,
        channel: &str,
        thread_ts: &str,
    ) -> Result<Option<HistoryMessage>, PlatformError> {
        (**self).root_message(channel, thread_ts).await
    }
}

pub struct EventRouter<R> {
    roots: R,
    bot_user_id: String,
}

impl<R: ThreadRoots> EventRouter<R> {
    pub fn new(roots: R, bot_user_id: impl Into<String>) -> Self {
        Self {
            roots,
            bot_user_id: bot_user_id.into(),
        }
    }

    pub fn bot_user_id(&self) -> &str {
        &self.bot_user_id
    }

    pub async fn route(&self, event: SlackEvent) -> Route {
        match event {
            SlackEvent::AppMention(m) => self.route_mention(m).await,
            SlackEvent::Message(m) => self.route_message(m).await,
            SlackEvent::Other => Route::Ignore("unsupported event type"),
        }
    }

    async fn route_mention(&self, m: MessageEvent) -> Route {
        if let Some(reason) = self.skip_reason(&m) {
            return Route::Ignore(reason);
        }
        let thread = thread_key(&m);
        if self.is_stop_command(&m.text) {
            return Route::Stop(thread);
        }
        if let Some(root_ts) = m.thread_ts.as_deref() {
            if !m.is_direct() && self.root_mentions_bot(&m.channel, root_ts).await {
                return Route::Ignore("thread root mentions the bot");
            }
        }
        if m.is_direct() && m.thread_ts.is_none() {
            return self.answer(m, thread, ConversationScope::DirectRecent);
        }
        self.answer(m, thread, ConversationScope::Thread)
    }

    async fn route_message(&self, m: MessageEvent) -> Route {
        if let Some(reason) = self.skip_reason(&m) {
            return Route::Ignore(reason);
        }
        let thread = thread_key(&m);
        match (m.is_direct(), m.thread_ts.as_deref()) {
            (false, None) => Route::Ignore("top-level channel message"),
            (true, thread_ts) => {
                if self.is_stop_command(&m.text) {
                    return Route::Stop(thread);
                }
                let scope = if thread_ts.is_some() {
                    ConversationScope::Thread
                } else {
                    ConversationScope::DirectRecent
                };
                self.answer(m, thread, scope)
            }
            (false, Some(root_ts)) => {
                if !self.root_mentions_bot(&m.channel, root_ts).await {
                    return Route::Ignore("thread is not addressed to the bot");
                }
                if self.is_stop_command(&m.text) {
                    return Route::Stop(thread);
                }
                self.answer(m, thread, ConversationScope::Thread)
            }
        }
    }

    fn skip_reason(&self, m: &MessageEvent) -> Option<&'static str> {
        if let Some(subtype) = m.subtype.as_deref() {
            if !ANSWERABLE_SUBTYPES.contains(&subtype) {
                return Some("message subtype");
            }
        }
        match m.user.as_deref() {
            None => Some("no author"),
            Some(user) if user == self.bot_user_id => Some("own message"),
            Some(_) if m.bot_id.is_some() => Some("message from another app"),
            Some(_) => None,
        }
    }

    fn answer(&self, m: MessageEvent, thread: ThreadKey, scope: ConversationScope) -> Route {
        let Some(user) = m.user else {
            return Route::Ignore("no author");
        };
        debug!(thread = %thread, scope = ?scope, "answering message");
        Route::Answer(IncomingMessage {
            thread,
            ts: m.ts,
            user,
            text: m.text,
            files: m.files,
            scope,
        })
    }

    /// `<@BOT> stop`, case-insensitive, nothing else.
    fn is_stop_command(&self, text: &str) -> bool {
        let mention = format!("<@{}", self.bot_user_id);
        if !text.contains(&mention) {
            return false;
        }
        MENTION_RE
            .replace_all(text, "")
            .trim()
            .eq_ignore_ascii_case("stop")
    }

    async fn root_mentions_bot(&self, channel: &str, root_ts: &str) -> bool {
        match self.roots.root_message(channel, root_ts).await {
            Ok(Some(root)) => root.text.contains(&format!("<@{}>", self.bot_user_id)),
            Ok(None) => false,
            Err(e) => {
                warn!(channel, root_ts, error = %e, "failed to load thread root");
                false
            }
        }
    }
}

/// `(channel, thread_ts or ts)`: replies share their root's key. A DM outside
/// a thread is keyed by its channel, matching the history it is answered from.
pub fn thread_key(m: &MessageEvent) -> ThreadKey {
    match &m.thread_ts {
        Some(thread_ts) => ThreadKey::new(m.channel.clone(), thread_ts.clone()),
        None if m.is_direct() => ThreadKey::direct(m.channel.clone()),
        None => ThreadKey::new(m.channel.clone(), m.ts.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Roots {
        root_text: Option<String>,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl ThreadRoots for Roots {
        async fn root_message(
            &self,
            _channel: &str,
            thread_ts: &str,
        ) -> Result<Option<HistoryMessage>, PlatformError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.root_text.clone().map(|text| HistoryMessage {
                ts: thread_ts.to_string(),
                user: Some("U1".into()),
                bot_id: None,
                text,
                files: Vec::new(),
            }))
        }
    }

    fn router(root_text: Option<&str>) -> EventRouter<Roots> {
        EventRouter::new(
            Roots {
                root_text: root_text.map(str::to_string),
                ..Roots::default()
            },
            "UBOT",
        )
    }

    fn event(text: &str, thread_ts: Option<&str>, channel_type: &str) -> MessageEvent {
        MessageEvent {
            channel: "C1".into(),
            ts: "2.000".into(),
            thread_ts: thread_ts.map(str::to_string),
            user: Some("U1".into()),
            text: text.into(),
            files: Vec::new(),
            channel_type: Some(channel_type.into()),
            subtype: None,
            bot_id: None,
        }
    }

    fn answered(route: Route) -> IncomingMessage {
        match route {
            Route::Answer(m) => m,
            other => panic!("expected answer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn top_level_mention_starts_a_thread() {
        let r = router(None);
        let m = answered(
            r.route(SlackEvent::AppMention(event("<@UBOT> hi", None, "channel")))
                .await,
        );
        assert_eq!(m.thread, ThreadKey::new("C1", "2.000"));
        assert_eq!(m.scope, ConversationScope::Thread);
        assert_eq!(m.reply_thread_ts(), Some("2.000"));
    }

    #[tokio::test]
    async fn mention_in_a_bot_thread_is_left_to_the_message_event() {
        let r = router(Some("<@UBOT> original question"));
        let route = r
            .route(SlackEvent::AppMention(event("<@UBOT> more", Some("1.000"), "channel")))
            .await;
        assert_eq!(route, Route::Ignore("thread root mentions the bot"));

        let m = answered(
            r.route(SlackEvent::Message(event("<@UBOT> more", Some("1.000"), "channel")))
                .await,
        );
        assert_eq!(m.thread, ThreadKey::new("C1", "1.000"));
    }

    #[tokio::test]
    async fn mention_in_someone_elses_thread_is_answered_with_the_thread() {
        let r = router(Some("lunch plans?"));
        let m = answered(
            r.route(SlackEvent::AppMention(event("<@UBOT> summarize", Some("1.000"), "channel")))
                .await,
        );
        assert_eq!(m.thread.thread_ts, "1.000");

        let route = r
            .route(SlackEvent::Message(event("pizza", Some("1.000"), "channel")))
            .await;
        assert_eq!(route, Route::Ignore("thread is not addressed to the bot"));
    }

    #[tokio::test]
    async fn direct_messages_use_recent_history_outside_threads() {
        let r = router(None);
        let m = answered(r.route(SlackEvent::Message(event("hello", None, "im"))).await);
        assert_eq!(m.scope, ConversationScope::DirectRecent);
        assert_eq!(m.reply_thread_ts(), None);
        assert_eq!(m.thread, ThreadKey::direct("C1"));

        // every top-level DM shares the channel's key
        let mut later = event("again", None, "im");
        later.ts = "3.000".into();
        assert_eq!(answered(r.route(SlackEvent::Message(later)).await).thread, m.thread);

        let m = answered(
            r.route(SlackEvent::Message(event("and this", Some("1.000"), "im")))
                .await,
        );
        assert_eq!(m.scope, ConversationScope::Thread);
        assert_eq!(r.roots.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn edits_bots_and_own_messages_are_ignored() {
        let r = router(Some("<@UBOT> q"));

        let mut edited = event("x", Some("1.000"), "channel");
        edited.subtype = Some("message_changed".into());
        assert_eq!(
            r.route(SlackEvent::Message(edited)).await,
            Route::Ignore("message subtype")
        );

        let mut other_app = event("x", Some("1.000"), "channel");
        other_app.bot_id = Some("B2".into());
        assert_eq!(
            r.route(SlackEvent::Message(other_app)).await,
            Route::Ignore("message from another app")
        );

        let mut own = event("x", Some("1.000"), "channel");
        own.user = Some("UBOT".into());
        own.bot_id = Some("B1".into());
        assert_eq!(
            r.route(SlackEvent::Message(own)).await,
            Route::Ignore("own message")
        );

        let mut broadcast = event("<@UBOT> again", Some("1.000"), "channel");
        broadcast.subtype = Some("thread_broadcast".into());
        assert!(matches!(
            r.route(SlackEvent::Message(broadcast)).await,
            Route::Answer(_)
        ));
    }

    #[tokio::test]
    async fn stop_command_targets_the_thread() {
        let r = router(Some("<@UBOT> q"));
        assert_eq!(
            r.route(SlackEvent::AppMention(event("<@UBOT>  STOP ", Some("1.000"), "channel")))
                .await,
            Route::Stop(ThreadKey::new("C1", "1.000"))
        );
        assert_eq!(
            r.route(SlackEvent::Message(event("<@UBOT> stop", Some("1.000"), "channel")))
                .await,
            Route::Stop(ThreadKey::new("C1", "1.000"))
        );
        // without the mention it is an ordinary message
        assert!(matches!(
            r.route(SlackEvent::Message(event("stop", Some("1.000"), "channel")))
                .await,
            Route::Answer(_)
        ));
        // "stop" inside a longer request is not a command
        assert!(matches!(
            r.route(SlackEvent::Message(event("<@UBOT> how do I stop a thread?", Some("1.000"), "channel")))
                .await,
            Route::Answer(_)
        ));
    }

    #[tokio::test]
    async fn stop_in_a_direct_message_targets_the_channel() {
        let r = router(None);
        assert_eq!(
            r.route(SlackEvent::Message(event("<@UBOT> stop", None, "im"))).await,
            Route::Stop(ThreadKey::direct("C1"))
        );
    }

    #[tokio::test]
    async fn shared_files_travel_with_the_message() {
        let r = router(None);
        let mut shared = event("what is this?", None, "im");
        shared.subtype = Some("file_share".into());
        shared.files = vec![relay_agent::platform::FileRef {
            name: Some("cat.png".into()),
            mimetype: Some("image/png".into()),
            url: "https://files.slack.com/files-pri/T1-F1/cat.png".into(),
        }];
        let m = answered(r.route(SlackEvent::Message(shared)).await);
        assert_eq!(m.files.len(), 1);
    }
}
