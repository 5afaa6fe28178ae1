//! Deterministic prompt-size estimation used for context trimming.
//!
//! Accounting follows the ChatML framing: every message costs 3 tokens of
//! overhead plus its role and content, a `name` costs one extra token, and
//! the reply is primed with 3 more.

use std::sync::Arc;

use relay_core::types::Turn;
use tiktoken_rs::{cl100k_base, CoreBPE};
use tracing::warn;

use crate::provider::FunctionDefinition;

const TOKENS_PER_MESSAGE: usize = 3;
const TOKENS_PER_NAME: usize = 1;
const REPLY_PRIMING_TOKENS: usize = 3;
/// Flat charge per attached image: a 512px tile at high detail plus the base cost.
pub const IMAGE_TOKENS: usize = 255;

pub trait TokenCounter: Send + Sync {
    /// Tokens in a bare string.
    fn count_text(&self, text: &str) -> usize;

    /// Tokens the provider will bill for `turns` as a prompt.
    fn count_turns(&self, turns: &[Turn]) -> usize {
        let per_turn: usize = turns
            .iter()
            .map(|turn| {
                let mut n = TOKENS_PER_MESSAGE
                    + self.count_text(turn.role.as_str())
                    + self.count_text(&turn.content);
                if let Some(name) = &turn.name {
                    n += TOKENS_PER_NAME + self.count_text(name);
                }
                if let Some(call) = &turn.function_call {
                    n += 1 + self.count_text(&call.name) + self.count_text(&call.arguments);
                }
                n + IMAGE_TOKENS * turn.images.len()
            })
            .sum();
        per_turn + REPLY_PRIMING_TOKENS
    }

    /// Prompt overhead of sending the function schemas with every request.
    fn count_functions(&self, functions: &[FunctionDefinition]) -> usize {
        if functions.is_empty() {
            return 0;
        }
        let json = serde_json::to_string(functions).unwrap_or_default();
        self.count_text(&json)
    }
}

/// cl100k BPE, the encoding of the GPT-3.5/GPT-4 families.
pub struct BpeCounter {
    bpe: CoreBPE,
}

impl BpeCounter {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self { bpe: cl100k_base()? })
    }
}

impl TokenCounter for BpeCounter {
    fn count_text(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// ceil(chars / 4). Cheap and tokenizer-free.
#[derive(Debug, Default, Clone, Copy)]
pub struct CharCounter;

impl TokenCounter for CharCounter {
    fn count_text(&self, text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }
}

/// BPE counter, or the character heuristic if the BPE tables fail to load.
pub fn default_counter() -> Arc<dyn TokenCounter> {
    match BpeCounter::new() {
        Ok(counter) => Arc::new(counter),
        Err(e) => {
            warn!(error = %e, "failed to load cl100k_base, falling back to character estimate");
            Arc::new(CharCounter)
        }
    }
}
