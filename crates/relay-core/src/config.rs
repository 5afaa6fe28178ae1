use figment::{
    providers::{Env, Format, Serialized, Toml},
    value::Uncased,
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::models;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_MAX_TOKENS: u32 = 1024;
pub const DEFAULT_MIN_EDIT_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_LOADING_TEXT: &str = ":hourglass_flowing_sand: Wait a second, please ...";
pub const DEFAULT_TYPING_SUFFIX: &str = " ... :writing_hand:";

/// Priming text sent as the system turn. `{bot_user_id}` is substituted at runtime.
pub const DEFAULT_SYSTEM_TEXT: &str = "
You are a bot in a slack chat room. You might receive messages from multiple people.
Format bold text *like this*, italic text _like this_ and strikethrough text ~like this~.
Slack user IDs match the regex `<@U.*?>`.
Your Slack user ID is <@{bot_user_id}>.
Each message has the author's Slack user ID prepended, like the regex `^<@U.*?>: ` followed by the message text.
";

pub const DEFAULT_REDACT_EMAIL_PATTERN: &str =
    r"\b[A-Za-z0-9.*%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b";
pub const DEFAULT_REDACT_PHONE_PATTERN: &str =
    r"(?:\(\d{3}\)|\b\d{3})[-.\s]?\d{3}[-.\s]?\d{4}\b";
pub const DEFAULT_REDACT_CREDIT_CARD_PATTERN: &str = r"\b\d{4}[- ]?\d{4}[- ]?\d{4}[- ]?\d{4}\b";
pub const DEFAULT_REDACT_SSN_PATTERN: &str = r"\b\d{3}[- ]?\d{2}[- ]?\d{4}\b";
/// Empty means "match nothing".
pub const DEFAULT_REDACT_USER_DEFINED_PATTERN: &str = "";

/// Flat environment keys accepted verbatim, mapped onto their nested config path.
const FLAT_ENV_KEYS: &[(&str, &str)] = &[
    ("OPENAI_API_KEY", "openai.api_key"),
    ("OPENAI_API_BASE", "openai.api_base"),
    ("OPENAI_API_TYPE", "openai.api_type"),
    ("OPENAI_API_VERSION", "openai.api_version"),
    ("OPENAI_DEPLOYMENT_ID", "openai.deployment_id"),
    ("OPENAI_ORG_ID", "openai.organization"),
    ("OPENAI_MODEL", "model.model"),
    ("OPENAI_TEMPERATURE", "model.temperature"),
    ("OPENAI_TIMEOUT_SECONDS", "model.timeout_seconds"),
    ("OPENAI_SYSTEM_TEXT", "model.system_text"),
    ("OPENAI_IMAGE_INPUT", "model.image_input"),
    ("OPENAI_FUNCTION_CALL_MODULE_NAME", "functions.module"),
    ("TRANSLATE_MARKDOWN", "reply.translate_markdown"),
    ("MIN_EDIT_INTERVAL_MS", "reply.min_edit_interval_ms"),
    ("REDACTION_ENABLED", "redaction.enabled"),
    ("REDACT_EMAIL_PATTERN", "redaction.email_pattern"),
    ("REDACT_PHONE_PATTERN", "redaction.phone_pattern"),
    ("REDACT_CREDIT_CARD_PATTERN", "redaction.credit_card_pattern"),
    ("REDACT_SSN_PATTERN", "redaction.ssn_pattern"),
    ("REDACT_USER_DEFINED_PATTERN", "redaction.user_defined_pattern"),
    ("SLACK_BOT_TOKEN", "slack.bot_token"),
    ("SLACK_SIGNING_SECRET", "slack.signing_secret"),
];

/// Top-level config (relay.toml + RELAY_* and flat env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub reply: ReplyConfig,
    #[serde(default)]
    pub redaction: RedactionConfig,
    #[serde(default)]
    pub functions: FunctionsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    pub bot_token: Option<String>,
    pub signing_secret: Option<String>,
    /// Only disable for local testing behind a trusted tunnel.
    #[serde(default = "bool_true")]
    pub verify_signatures: bool,
    /// Resolved through `auth.test` when not set.
    pub bot_user_id: Option<String>,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            signing_secret: None,
            verify_signatures: true,
            bot_user_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApiType {
    #[default]
    OpenAi,
    Azure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_openai_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub api_type: ApiType,
    /// Azure only.
    pub api_version: Option<String>,
    /// Azure only.
    pub deployment_id: Option<String>,
    pub organization: Option<String>,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: default_openai_api_base(),
            api_type: ApiType::OpenAi,
            api_version: None,
            deployment_id: None,
            organization: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Wall-clock limit for a whole session, function-call hops included.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Longest gap allowed between two stream events. Defaults to `timeout_seconds`.
    pub stale_timeout_seconds: Option<u64>,
    /// Tokens reserved for the completion.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Overrides the catalogue lookup; required for models the catalogue doesn't know.
    pub context_window_tokens: Option<u32>,
    #[serde(default = "default_system_text")]
    pub system_text: String,
    /// Attach images posted by humans to the prompt. Only honoured for models
    /// that accept image input, and needs the `files:read` scope.
    #[serde(default)]
    pub image_input: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            stale_timeout_seconds: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            context_window_tokens: None,
            system_text: default_system_text(),
            image_input: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyConfig {
    #[serde(default = "default_min_edit_interval_ms")]
    pub min_edit_interval_ms: u64,
    #[serde(default = "default_loading_text")]
    pub loading_text: String,
    #[serde(default = "default_typing_suffix")]
    pub typing_suffix: String,
    #[serde(default)]
    pub translate_markdown: bool,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            min_edit_interval_ms: DEFAULT_MIN_EDIT_INTERVAL_MS,
            loading_text: default_loading_text(),
            typing_suffix: default_typing_suffix(),
            translate_markdown: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_email_pattern")]
    pub email_pattern: String,
    #[serde(default = "default_phone_pattern")]
    pub phone_pattern: String,
    #[serde(default = "default_credit_card_pattern")]
    pub credit_card_pattern: String,
    #[serde(default = "default_ssn_pattern")]
    pub ssn_pattern: String,
    #[serde(default)]
    pub user_defined_pattern: String,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            email_pattern: default_email_pattern(),
            phone_pattern: default_phone_pattern(),
            credit_card_pattern: default_credit_card_pattern(),
            ssn_pattern: default_ssn_pattern(),
            user_defined_pattern: DEFAULT_REDACT_USER_DEFINED_PATTERN.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionsConfig {
    /// Name of the handler set to expose to the model. `None` disables function calling.
    pub module: Option<String>,
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
}

impl Default for FunctionsConfig {
    fn default() -> Self {
        Self {
            module: None,
            max_hops: default_max_hops(),
        }
    }
}

/// Retry policy for transient provider failures (rate limits, 5xx, transport errors).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// Model settings resolved once per request. Immutable for the session's lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub model_id: String,
    pub temperature: f32,
    pub timeout_seconds: u64,
    pub stale_timeout_seconds: u64,
    pub max_tokens: u32,
    pub context_window_tokens: u32,
    pub system_priming_text: Option<String>,
    pub function_call_handler_name: Option<String>,
    /// Image input requested and supported by the model.
    pub image_input: bool,
}

impl ModelConfig {
    /// Tokens available for the prompt once the completion reservation and the
    /// function schemas are accounted for.
    pub fn context_budget(&self, function_schema_tokens: usize) -> usize {
        (self.context_window_tokens as usize)
            .saturating_sub(self.max_tokens as usize)
            .saturating_sub(1)
            .saturating_sub(function_schema_tokens)
    }
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_openai_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}
fn default_temperature() -> f32 {
    1.0
}
fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}
fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}
fn default_system_text() -> String {
    DEFAULT_SYSTEM_TEXT.to_string()
}
fn default_min_edit_interval_ms() -> u64 {
    DEFAULT_MIN_EDIT_INTERVAL_MS
}
fn default_loading_text() -> String {
    DEFAULT_LOADING_TEXT.to_string()
}
fn default_typing_suffix() -> String {
    DEFAULT_TYPING_SUFFIX.to_string()
}
fn default_email_pattern() -> String {
    DEFAULT_REDACT_EMAIL_PATTERN.to_string()
}
fn default_phone_pattern() -> String {
    DEFAULT_REDACT_PHONE_PATTERN.to_string()
}
fn default_credit_card_pattern() -> String {
    DEFAULT_REDACT_CREDIT_CARD_PATTERN.to_string()
}
fn default_ssn_pattern() -> String {
    DEFAULT_REDACT_SSN_PATTERN.to_string()
}
fn default_max_hops() -> u32 {
    5
}
fn default_max_retries() -> u32 {
    1
}
fn default_backoff_ms() -> u64 {
    500
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl RelayConfig {
    /// Load config with layered overrides.
    ///
    /// Precedence (lowest first):
    ///   1. built-in defaults
    ///   2. TOML file: explicit path, else ~/.relay/relay.toml (missing file is fine)
    ///   3. RELAY_<SECTION>__<KEY> env vars
    ///   4. flat keys such as OPENAI_MODEL or SLACK_BOT_TOKEN
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: Self = Self::figment(&path)
            .extract()
            .map_err(|e| RelayError::Config(e.to_string()))?;
        tracing::debug!(path = %path, model = %config.model.model, "config loaded");
        Ok(config)
    }

    fn figment(path: &str) -> Figment {
        Figment::from(Serialized::defaults(RelayConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("RELAY_").split("__"))
            .merge(flat_env())
    }

    /// Resolve the per-request model settings.
    ///
    /// `bot_user_id` fills the `{bot_user_id}` placeholder in the priming text.
    /// Fails when the model is unknown to the catalogue and no explicit
    /// `context_window_tokens` is configured.
    pub fn model_config(&self, bot_user_id: &str) -> Result<ModelConfig> {
        let settings = &self.model;
        let context_window_tokens = match settings.context_window_tokens {
            Some(n) => n,
            None => models::context_length(&settings.model)?.ok_or_else(|| {
                RelayError::Config(format!(
                    "unknown context window for model {}; set model.context_window_tokens",
                    settings.model
                ))
            })?,
        };

        let system = settings.system_text.replace("{bot_user_id}", bot_user_id);
        let system_priming_text = if system.trim().is_empty() {
            None
        } else {
            Some(system)
        };

        Ok(ModelConfig {
            model_id: settings.model.clone(),
            temperature: settings.temperature,
            timeout_seconds: settings.timeout_seconds,
            stale_timeout_seconds: settings
                .stale_timeout_seconds
                .unwrap_or(settings.timeout_seconds),
            max_tokens: settings.max_tokens,
            context_window_tokens,
            system_priming_text,
            function_call_handler_name: self.functions.module.clone(),
            image_input: settings.image_input && models::accepts_image_input(&settings.model)?,
        })
    }
}

/// Flat env keys (OPENAI_MODEL, SLACK_BOT_TOKEN, ...) renamed onto their nested path.
fn flat_env() -> Env {
    Env::raw().filter_map(|key| {
        FLAT_ENV_KEYS
            .iter()
            .find(|(flat, _)| key.as_str().eq_ignore_ascii_case(flat))
            .map(|(_, nested)| Uncased::from(*nested))
    })
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.relay/relay.toml", home)
}
