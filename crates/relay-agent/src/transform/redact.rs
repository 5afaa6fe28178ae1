use regex::Regex;
use relay_core::config::RedactionConfig;
use relay_core::error::{RelayError, Result};

const MAX_PASSES: usize = 4;

/// Pattern-based scrubbing of sensitive values before text leaves the process.
#[derive(Debug, Clone)]
pub struct Redactor {
    enabled: bool,
    rules: Vec<(Regex, &'static str)>,
}

impl Redactor {
    /// Compile the configured patterns. An empty pattern is skipped.
    pub fn from_config(config: &RedactionConfig) -> Result<Self> {
        let ordered = [
            ("email_pattern", &config.email_pattern, "[EMAIL]"),
            ("credit_card_pattern", &config.credit_card_pattern, "[CREDIT CARD]"),
            ("phone_pattern", &config.phone_pattern, "[PHONE]"),
            ("ssn_pattern", &config.ssn_pattern, "[SSN]"),
            ("user_defined_pattern", &config.user_defined_pattern, "[REDACTED]"),
        ];

        let mut rules = Vec::new();
        for (key, pattern, placeholder) in ordered {
            // "(?!)" is the conventional never-match pattern; the regex crate has no lookaround
            if pattern.trim().is_empty() || pattern.trim() == "(?!)" {
                continue;
            }
            let re = Regex::new(pattern)
                .map_err(|e| RelayError::Config(format!("redaction.{key}: {e}")))?;
            rules.push((re, placeholder));
        }

        Ok(Self {
            enabled: config.enabled,
            rules,
        })
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            rules: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn redact(&self, input: &str) -> String {
        if !self.enabled {
            return input.to_string();
        }
        // Run to a fixpoint: a replacement can expose a boundary that
        // another pattern keys on.
        let mut output = input.to_string();
        for _ in 0..MAX_PASSES {
            let next = self.pass(&output);
            if next == output {
                break;
            }
            output = next;
        }
        output
    }

    fn pass(&self, input: &str) -> String {
        let mut output = input.to_string();
        for (re, placeholder) in &self.rules {
            output = re.replace_all(&output, *placeholder).into_owned();
        }
        output
    }
}
