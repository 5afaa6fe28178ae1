//! Model catalogue: alias resolution and context-window lengths.

use crate::error::{RelayError, Result};

/// Aliases that float over time, mapped to the dated snapshot we assume they point at.
const MODEL_FALLBACKS: &[(&str, &str)] = &[
    ("gpt-3.5-turbo", "gpt-3.5-turbo-0125"),
    ("gpt-3.5-turbo-16k", "gpt-3.5-turbo-16k-0613"),
    ("gpt-4", "gpt-4-0613"),
    ("gpt-4-turbo", "gpt-4-turbo-2024-04-09"),
    ("gpt-4-turbo-preview", "gpt-4-0125-preview"),
    ("gpt-4-32k", "gpt-4-32k-0613"),
    ("gpt-4o", "gpt-4o-2024-05-13"),
    ("gpt-4o-mini", "gpt-4o-mini-2024-07-18"),
    ("gpt-4.1", "gpt-4.1-2025-04-14"),
    ("gpt-4.1-mini", "gpt-4.1-mini-2025-04-14"),
    ("gpt-4.1-nano", "gpt-4.1-nano-2025-04-14"),
    ("gpt-5", "gpt-5-2025-08-07"),
    ("gpt-5-mini", "gpt-5-mini-2025-08-07"),
    ("gpt-5-nano", "gpt-5-nano-2025-08-07"),
    ("o3", "o3-2025-04-16"),
    ("o4-mini", "o4-mini-2025-04-16"),
];

const MODEL_CONTEXT_LENGTHS: &[(&str, u32)] = &[
    ("gpt-3.5-turbo-0301", 4_096),
    ("gpt-3.5-turbo-0613", 4_096),
    ("gpt-3.5-turbo-16k-0613", 16_384),
    ("gpt-3.5-turbo-1106", 16_384),
    ("gpt-3.5-turbo-0125", 16_384),
    ("gpt-4-0314", 8_192),
    ("gpt-4-0613", 8_192),
    ("gpt-4-32k-0314", 32_768),
    ("gpt-4-32k-0613", 32_768),
    ("gpt-4-1106-preview", 128_000),
    ("gpt-4-0125-preview", 128_000),
    ("gpt-4-turbo-2024-04-09", 128_000),
    ("gpt-4o-2024-05-13", 128_000),
    ("gpt-4o-mini-2024-07-18", 128_000),
    ("gpt-4.1-2025-04-14", 1_048_576),
    ("gpt-4.1-mini-2025-04-14", 1_048_576),
    ("gpt-4.1-nano-2025-04-14", 1_048_576),
    ("gpt-5-chat-latest", 128_000),
    ("gpt-5-2025-08-07", 128_000),
    ("gpt-5-mini-2025-08-07", 128_000),
    ("gpt-5-nano-2025-08-07", 128_000),
    ("o3-2025-04-16", 128_000),
    ("o4-mini-2025-04-16", 128_000),
];

/// Snapshot prefixes of models that accept `image_url` content parts.
const IMAGE_INPUT_PREFIXES: &[&str] = &[
    "gpt-4-turbo-2024-04-09",
    "gpt-4o",
    "gpt-4.1",
    "gpt-5",
    "o3",
    "o4-mini",
];

/// Follow the alias table until a concrete snapshot name is reached.
///
/// Names without an alias entry are returned unchanged.
pub fn resolve_model_alias(model: &str) -> Result<String> {
    resolve_with(model, MODEL_FALLBACKS)
}

fn resolve_with(model: &str, table: &[(&str, &str)]) -> Result<String> {
    let mut current = model;
    let mut visited = vec![model];
    while let Some((_, next)) = table.iter().find(|(alias, _)| *alias == current) {
        if visited.contains(next) {
            return Err(RelayError::Config(format!(
                "circular model alias detected at {next}"
            )));
        }
        visited.push(next);
        current = next;
    }
    Ok(current.to_string())
}

/// Context window in tokens, or `None` when the model is not in the catalogue.
pub fn context_length(model: &str) -> Result<Option<u32>> {
    let resolved = resolve_model_alias(model)?;
    Ok(MODEL_CONTEXT_LENGTHS
        .iter()
        .find(|(name, _)| *name == resolved)
        .map(|(_, len)| *len))
}

pub fn accepts_image_input(model: &str) -> Result<bool> {
    let resolved = resolve_model_alias(model)?;
    Ok(IMAGE_INPUT_PREFIXES
        .iter()
        .any(|prefix| resolved.starts_with(prefix)))
}
