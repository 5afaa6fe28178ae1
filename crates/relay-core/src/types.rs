use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a conversation thread: the channel plus the root message timestamp.
///
/// A top-level message that starts a thread is its own root, so its `ts`
/// doubles as `thread_ts`. A direct conversation answered outside threads is
/// one conversation per channel and has an empty `thread_ts`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadKey {
    pub channel: String,
    pub thread_ts: String,
}

impl ThreadKey {
    pub fn new(channel: impl Into<String>, thread_ts: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            thread_ts: thread_ts.into(),
        }
    }

    /// The whole top-level history of a direct conversation.
    pub fn direct(channel: impl Into<String>) -> Self {
        Self::new(channel, "")
    }

    pub fn is_direct(&self) -> bool {
        self.thread_ts.is_empty()
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_direct() {
            f.write_str(&self.channel)
        } else {
            write!(f, "{}:{}", self.channel, self.thread_ts)
        }
    }
}

/// A posted chat message that can later be edited.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub channel: String,
    pub ts: String,
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.channel, self.ts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Function,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Function => "function",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A function invocation requested by the model. `arguments` is the raw JSON
/// text exactly as the model produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

/// One role-tagged unit of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    /// `None` for synthesized turns (system priming, function results).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Function name for `Role::Function` turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    /// `data:` URLs of images attached to a user turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl Turn {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content, None)
    }

    pub fn user(content: impl Into<String>, timestamp: Option<DateTime<Utc>>) -> Self {
        Self::plain(Role::User, content, timestamp)
    }

    pub fn assistant(content: impl Into<String>, timestamp: Option<DateTime<Utc>>) -> Self {
        Self::plain(Role::Assistant, content, timestamp)
    }

    /// The assistant turn that carried a function-call directive.
    pub fn function_request(call: FunctionCall) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            timestamp: None,
            name: None,
            function_call: Some(call),
            images: Vec::new(),
        }
    }

    /// The result (or failure description) of a local function invocation.
    pub fn function_result(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Function,
            content: content.into(),
            timestamp: None,
            name: Some(name.into()),
            function_call: None,
            images: Vec::new(),
        }
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    fn plain(role: Role, content: impl Into<String>, timestamp: Option<DateTime<Utc>>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp,
            name: None,
            function_call: None,
            images: Vec::new(),
        }
    }
}

/// Parse a Slack-style `"<seconds>.<micros>"` timestamp.
pub fn parse_message_ts(ts: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = ts.split_once('.').unwrap_or((ts, "0"));
    let secs: i64 = secs.parse().ok()?;
    let micros: u32 = format!("{frac:0<6}").get(..6)?.parse().ok()?;
    DateTime::from_timestamp(secs, micros * 1_000)
}
