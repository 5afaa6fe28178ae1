//! Slack Web API client for the handful of methods the relay calls.

use async_trait::async_trait;
use relay_agent::platform::{ChatPlatform, ConversationScope, FileRef, HistoryMessage, PlatformError};
use relay_core::config::SlackConfig;
use relay_core::types::{MessageRef, ThreadKey};
use slack_morphism::prelude::{
    SlackApiChatPostMessageRequest, SlackApiChatUpdateRequest, SlackApiConversationsHistoryRequest,
    SlackApiConversationsRepliesRequest, SlackApiToken, SlackApiTokenValue, SlackChannelId,
    SlackClientHyperConnector, SlackClientHyperHttpsConnector, SlackClientSession,
    SlackCursorId, SlackHistoryMessage, SlackHyperClient, SlackMessageContent,
    SlackResponseMetadata, SlackTs,
};
use tracing::{debug, warn};
use slack_morphism::errors::SlackClientError;

use crate::error::SlackError;
use crate::events::file_refs;

const REPLIES_PAGE_LIMIT: u16 = 200;
const DIRECT_HISTORY_LIMIT: u16 = 100;
/// Direct conversations outside a thread only look back this far.
const DIRECT_HISTORY_WINDOW_SECS: i64 = 86_400;
/// Used when Slack rate-limits without a `Retry-After`.
const DEFAULT_RETRY_AFTER_MS: u64 = 1000;

pub struct SlackClient {
    client: SlackHyperClient,
    token: SlackApiToken,
    /// Private file URLs are plain HTTPS downloads authorized by the bot token.
    http: reqwest::Client,
    bot_token: String,
}

#[derive(Debug, Clone)]
pub struct AuthTest {
    pub user_id: String,
    pub bot_id: Option<String>,
}

impl SlackClient {
    pub fn new(config: &SlackConfig) -> Result<Self, SlackError> {
        let bot_token = config
            .bot_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or(SlackError::NoToken)?;
        let connector =
            SlackClientHyperConnector::new().map_err(|e| SlackError::Connector(e.to_string()))?;
        Ok(Self {
            client: SlackHyperClient::new(connector),
            token: SlackApiToken::new(SlackApiTokenValue(bot_token.clone())),
            http: reqwest::Client::builder()
                .user_agent(concat!("relay/", env!("CARGO_PKG_VERSION")))
                .build()?,
            bot_token,
        })
    }

    fn session(&self) -> SlackClientSession<'_, SlackClientHyperHttpsConnector> {
        self.client.open_session(&self.token)
    }

    /// Resolve the bot's own user ID.
    pub async fn auth_test(&self) -> Result<AuthTest, PlatformError> {
        let auth = self
            .session()
            .auth_test()
            .await
            .map_err(|e| platform_error("auth.test", e))?;
        Ok(AuthTest {
            user_id: auth.user_id.0,
            bot_id: auth.bot_id.map(|b| b.0),
        })
    }

    /// The root message of a thread, or `None` when it no longer exists.
    pub async fn root_message(
        &self,
        channel: &str,
        thread_ts: &str,
    ) -> Result<Option<HistoryMessage>, PlatformError> {
        let req = SlackApiConversationsHistoryRequest::new()
            .with_channel(SlackChannelId(channel.to_string()))
            .with_latest(SlackTs(thread_ts.to_string()))
            .with_limit(1)
            .with_inclusive(true);
        let resp = self
            .session()
            .conversations_history(&req)
            .await
            .map_err(|e| platform_error("conversations.history", e))?;
        Ok(resp
            .messages
            .into_iter()
            .map(history_message)
            .find(|m| m.ts == thread_ts))
    }

    async fn thread_replies(&self, thread: &ThreadKey) -> Result<Vec<HistoryMessage>, PlatformError> {
        let session = self.session();
        let mut out = Vec::new();
        let mut cursor: Option<SlackCursorId> = None;
        loop {
            let req = SlackApiConversationsRepliesRequest::new(
                SlackChannelId(thread.channel.clone()),
                SlackTs(thread.thread_ts.clone()),
            )
            .with_limit(REPLIES_PAGE_LIMIT)
            .opt_cursor(cursor.take());
            let page = session
                .conversations_replies(&req)
                .await
                .map_err(|e| platform_error("conversations.replies", e))?;
            cursor = next_cursor(page.response_metadata);
            out.extend(page.messages.into_iter().map(history_message));
            if cursor.is_none() {
                break;
            }
        }
        debug!(thread = %thread, messages = out.len(), "fetched thread replies");
        Ok(out)
    }

    async fn recent_direct_history(&self, channel: &str) -> Result<Vec<HistoryMessage>, PlatformError> {
        let oldest = chrono::Utc::now().timestamp() - DIRECT_HISTORY_WINDOW_SECS;
        let req = SlackApiConversationsHistoryRequest::new()
            .with_channel(SlackChannelId(channel.to_string()))
            .with_limit(DIRECT_HISTORY_LIMIT)
            .with_oldest(SlackTs(format!("{oldest}.000000")));
        let resp = self
            .session()
            .conversations_history(&req)
            .await
            .map_err(|e| platform_error("conversations.history", e))?;
        // Newest first on the wire.
        let mut messages: Vec<HistoryMessage> =
            resp.messages.into_iter().map(history_message).collect();
        messages.reverse();
        Ok(messages)
    }
}

pub fn history_message(m: SlackHistoryMessage) -> HistoryMessage {
    HistoryMessage {
        ts: m.origin.ts.0,
        user: m.sender.user.map(|u| u.0),
        bot_id: m.sender.bot_id.map(|b| b.0),
        text: m.content.text.unwrap_or_default(),
        files: file_refs(m.content.files.unwrap_or_default()),
    }
}

/// An empty cursor also means the last page.
fn next_cursor(metadata: Option<SlackResponseMetadata>) -> Option<SlackCursorId> {
    metadata
        .and_then(|m| m.next_cursor)
        .filter(|c| !c.0.is_empty())
}

/// Map a failed Web API call onto the platform error taxonomy.
pub fn platform_error(method: &str, err: SlackClientError) -> PlatformError {
    let detail = err.to_string();
    match err {
        SlackClientError::ApiError(e) => {
            warn!(method, error = %e.code, "slack api call failed");
            PlatformError::Api {
                method: method.to_string(),
                error: e.code,
            }
        }
        SlackClientError::RateLimitError(e) => {
            let retry_after_ms = e
                .retry_after
                .map_or(DEFAULT_RETRY_AFTER_MS, |d| d.as_millis() as u64);
            warn!(method, retry_after_ms, "slack rate limited");
            PlatformError::RateLimited {
                method: method.to_string(),
                retry_after_ms,
            }
        }
        SlackClientError::ProtocolError(_) => PlatformError::Decode {
            method: method.to_string(),
            detail,
        },
        _ => PlatformError::Transport(detail),
    }
}

#[async_trait]
impl ChatPlatform for SlackClient {
    async fn fetch_thread_history(
        &self,
        thread: &ThreadKey,
        scope: ConversationScope,
    ) -> Result<Vec<HistoryMessage>, PlatformError> {
        match scope {
            ConversationScope::Thread => self.thread_replies(thread).await,
            ConversationScope::DirectRecent => self.recent_direct_history(&thread.channel).await,
        }
    }

    async fn post_message(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        text: &str,
    ) -> Result<MessageRef, PlatformError> {
        let req = SlackApiChatPostMessageRequest::new(
            SlackChannelId(channel.to_string()),
            SlackMessageContent::new().with_text(text.to_string()),
        )
        .opt_thread_ts(thread_ts.map(|ts| SlackTs(ts.to_string())));
        let posted = self
            .session()
            .chat_post_message(&req)
            .await
            .map_err(|e| platform_error("chat.postMessage", e))?;
        Ok(MessageRef {
            channel: posted.channel.0,
            ts: posted.ts.0,
        })
    }

    async fn edit_message(&self, message: &MessageRef, text: &str) -> Result<(), PlatformError> {
        let req = SlackApiChatUpdateRequest::new(
            SlackChannelId(message.channel.clone()),
            SlackMessageContent::new().with_text(text.to_string()),
            SlackTs(message.ts.clone()),
        );
        self.session()
            .chat_update(&req)
            .await
            .map_err(|e| platform_error("chat.update", e))?;
        Ok(())
    }

    async fn download_file(&self, file: &FileRef) -> Result<Vec<u8>, PlatformError> {
        const METHOD: &str = "files.download";
        let resp = self
            .http
            .get(&file.url)
            .bearer_auth(&self.bot_token)
            .send()
            .await
            .map_err(|e| PlatformError::Transport(e.to_string()))?;
        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(PlatformError::RateLimited {
                method: METHOD.to_string(),
                retry_after_ms: DEFAULT_RETRY_AFTER_MS,
            });
        }
        if !status.is_success() {
            return Err(PlatformError::Api {
                method: METHOD.to_string(),
                error: format!("HTTP {}", status.as_u16()),
            });
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| PlatformError::Transport(e.to_string()))?;
        debug!(url = %file.url, size = bytes.len(), "downloaded file");
        Ok(bytes.to_vec())
    }
}
