pub mod attach;
pub mod context;
pub mod driver;
pub mod error;
pub mod functions;
pub mod guard;
pub mod openai;
pub mod platform;
pub mod provider;
pub mod retry;
pub mod session;
pub mod stream;
pub mod tokens;
pub mod transform;
pub mod updater;

pub use error::{ContextError, SessionError};
pub use platform::{
    ChatPlatform, ConversationScope, FileRef, HistoryMessage, IncomingMessage, PlatformError,
};
pub use provider::{ChatRequest, LlmProvider, ProviderError};
pub use session::{Relay, RelaySettings, SessionOutcome};
