//! Pure text transforms applied at the provider boundary.
//!
//! `outbound` runs on everything sent to the model, `inbound` on everything
//! the model sends back before it is rendered into the thread.

pub mod markdown;
pub mod redact;
pub mod reply;

use relay_core::config::RelayConfig;
use relay_core::error::Result;

pub use markdown::{markdown_to_platform, platform_to_markdown};
pub use redact::Redactor;
pub use reply::{format_assistant_reply, unescape_entities};

/// The configured set of transforms, built once at startup.
#[derive(Debug, Clone)]
pub struct ContentPipeline {
    redactor: Redactor,
    translate_markdown: bool,
}

impl ContentPipeline {
    pub fn new(redactor: Redactor, translate_markdown: bool) -> Self {
        Self {
            redactor,
            translate_markdown,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        Ok(Self::new(
            Redactor::from_config(&config.redaction)?,
            config.reply.translate_markdown,
        ))
    }

    /// No redaction, no dialect translation.
    pub fn passthrough() -> Self {
        Self::new(Redactor::disabled(), false)
    }

    pub fn translates_markdown(&self) -> bool {
        self.translate_markdown
    }

    /// Chat text on its way to the provider.
    pub fn outbound(&self, text: &str) -> String {
        let text = unescape_entities(text);
        let text = self.redactor.redact(&text);
        if self.translate_markdown {
            platform_to_markdown(&text)
        } else {
            text
        }
    }

    /// The system priming text, which is written in the platform dialect.
    pub fn system_text(&self, text: &str) -> String {
        if self.translate_markdown {
            platform_to_markdown(text)
        } else {
            text.to_string()
        }
    }

    /// Model output on its way into the thread.
    pub fn inbound(&self, text: &str) -> String {
        format_assistant_reply(text, self.translate_markdown)
    }
}
