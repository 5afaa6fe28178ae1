use relay_agent::PlatformError;

/// Errors produced while setting up or talking to Slack.
#[derive(Debug, thiserror::Error)]
pub enum SlackError {
    #[error("slack.bot_token is not configured")]
    NoToken,

    #[error("failed to create Slack HTTP connector: {0}")]
    Connector(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Platform(#[from] PlatformError),
}
