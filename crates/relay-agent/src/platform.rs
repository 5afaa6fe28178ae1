use async_trait::async_trait;
use relay_core::types::{MessageRef, ThreadKey};

/// How the conversation around a message is reconstructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationScope {
    /// All replies under the thread root. Replies are posted into the thread.
    Thread,
    /// A direct conversation outside any thread: recent channel history is the
    /// context and replies are posted top-level.
    DirectRecent,
}

/// A message the relay has decided to answer.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub thread: ThreadKey,
    /// Timestamp of the triggering message itself.
    pub ts: String,
    pub user: String,
    pub text: String,
    pub files: Vec<FileRef>,
    pub scope: ConversationScope,
}

impl IncomingMessage {
    /// Where replies to this message go: `Some(thread_ts)` for threaded replies.
    pub fn reply_thread_ts(&self) -> Option<&str> {
        match self.scope {
            ConversationScope::Thread => Some(&self.thread.thread_ts),
            ConversationScope::DirectRecent => None,
        }
    }
}

/// One message as returned by the platform's history API.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryMessage {
    pub ts: String,
    /// Author user ID. Absent for some integration posts.
    pub user: Option<String>,
    /// Set when an app or bot posted the message.
    pub bot_id: Option<String>,
    pub text: String,
    pub files: Vec<FileRef>,
}

/// A file shared with a message. `url` needs the bot token to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub name: Option<String>,
    pub mimetype: Option<String>,
    pub url: String,
}

impl FileRef {
    pub fn is_image(&self) -> bool {
        self.mimetype
            .as_deref()
            .is_some_and(|m| m.starts_with("image/"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("{method} failed: {error}")]
    Api { method: String, error: String },

    #[error("rate limited on {method}, retry after {retry_after_ms}ms")]
    RateLimited { method: String, retry_after_ms: u64 },

    #[error("unexpected response from {method}: {detail}")]
    Decode { method: String, detail: String },
}

/// Chat-platform operations the relay depends on.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Ordered messages that make up the conversation `thread` belongs to.
    async fn fetch_thread_history(
        &self,
        thread: &ThreadKey,
        scope: ConversationScope,
    ) -> Result<Vec<HistoryMessage>, PlatformError>;

    /// Post a new message, threaded under `thread_ts` when given.
    async fn post_message(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        text: &str,
    ) -> Result<MessageRef, PlatformError>;

    async fn edit_message(&self, message: &MessageRef, text: &str) -> Result<(), PlatformError>;

    /// Raw bytes of a shared file.
    async fn download_file(&self, file: &FileRef) -> Result<Vec<u8>, PlatformError> {
        Err(PlatformError::Api {
            method: "files.download".to_string(),
            error: format!("downloads not supported for {}", file.url),
        })
    }
}
