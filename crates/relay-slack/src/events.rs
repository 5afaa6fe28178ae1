//! Slack Events API payloads, parsed with slack-morphism's push-event model
//! and flattened into the fields the relay reads.

use relay_agent::platform::FileRef;
use slack_morphism::prelude::{
    SlackAppMentionEvent, SlackEventCallbackBody, SlackFile, SlackMessageEvent, SlackPushEvent,
};
use tracing::debug;

/// Outer body of a POST to the events endpoint.
#[derive(Debug)]
pub enum EventEnvelope {
    UrlVerification { challenge: String },
    EventCallback { event_id: String, event: SlackEvent },
    Unsupported,
}

impl EventEnvelope {
    /// Parse a request body. Well-formed JSON that slack-morphism does not
    /// model (new event types, unknown subtypes) is `Unsupported`; only a
    /// body that is not JSON at all is an error.
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        match serde_json::from_slice::<SlackPushEvent>(body) {
            Ok(SlackPushEvent::UrlVerification(v)) => Ok(EventEnvelope::UrlVerification {
                challenge: v.challenge,
            }),
            Ok(SlackPushEvent::EventCallback(cb)) => Ok(EventEnvelope::EventCallback {
                event_id: cb.event_id.0,
                event: SlackEvent::from(cb.event),
            }),
            Ok(_) => Ok(EventEnvelope::Unsupported),
            Err(e) => {
                let value: serde_json::Value = serde_json::from_slice(body)?;
                debug!(
                    kind = ?value.get("type"),
                    event = ?value.pointer("/event/type"),
                    error = %e,
                    "unmodelled Slack payload"
                );
                Ok(EventEnvelope::Unsupported)
            }
        }
    }
}

#[derive(Debug)]
pub enum SlackEvent {
    AppMention(MessageEvent),
    Message(MessageEvent),
    Other,
}

impl From<SlackEventCallbackBody> for SlackEvent {
    fn from(body: SlackEventCallbackBody) -> Self {
        match body {
            SlackEventCallbackBody::Message(m) => SlackEvent::Message(m.into()),
            SlackEventCallbackBody::AppMention(m) => SlackEvent::AppMention(m.into()),
            _ => SlackEvent::Other,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessageEvent {
    pub channel: String,
    pub ts: String,
    pub thread_ts: Option<String>,
    pub user: Option<String>,
    pub text: String,
    pub files: Vec<FileRef>,
    /// `im` for direct messages with the bot.
    pub channel_type: Option<String>,
    pub subtype: Option<String>,
    pub bot_id: Option<String>,
}

impl MessageEvent {
    pub fn is_direct(&self) -> bool {
        self.channel_type.as_deref() == Some("im")
    }
}

impl From<SlackMessageEvent> for MessageEvent {
    fn from(m: SlackMessageEvent) -> Self {
        let (text, files) = match m.content {
            Some(content) => (
                content.text.unwrap_or_default(),
                file_refs(content.files.unwrap_or_default()),
            ),
            None => (String::new(), Vec::new()),
        };
        // The wire name, e.g. `message_changed`.
        let subtype = m
            .subtype
            .and_then(|s| serde_json::to_value(s).ok())
            .and_then(|v| v.as_str().map(str::to_string));
        MessageEvent {
            channel: m.origin.channel.map(|c| c.0).unwrap_or_default(),
            ts: m.origin.ts.0,
            thread_ts: m.origin.thread_ts.map(|t| t.0),
            user: m.sender.user.map(|u| u.0),
            text,
            files,
            channel_type: m.origin.channel_type.map(|t| t.0),
            subtype,
            bot_id: m.sender.bot_id.map(|b| b.0),
        }
    }
}

impl From<SlackAppMentionEvent> for MessageEvent {
    fn from(m: SlackAppMentionEvent) -> Self {
        MessageEvent {
            channel: m.channel.0,
            ts: m.origin.ts.0,
            thread_ts: m.origin.thread_ts.map(|t| t.0),
            user: Some(m.user.0),
            text: m.content.text.unwrap_or_default(),
            files: file_refs(m.content.files.unwrap_or_default()),
            channel_type: m.origin.channel_type.map(|t| t.0),
            subtype: None,
            bot_id: None,
        }
    }
}

/// Files without a private URL cannot be downloaded and are dropped.
pub fn file_refs(files: Vec<SlackFile>) -> Vec<FileRef> {
    files
        .into_iter()
        .filter_map(|f| {
            let url = f.url_private?;
            Some(FileRef {
                name: f.name,
                mimetype: f.mimetype.map(|m| m.0),
                url: url.to_string(),
            })
        })
        .collect()
}
