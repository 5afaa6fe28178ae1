use std::sync::LazyLock;

use regex::Regex;

use super::markdown::markdown_to_platform;

#[allow(clippy::expect_used)]
static LEADING_NEWLINES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\n+").expect("valid regex"));

/// The model sometimes echoes the `<@U…>: ` author prefix it sees on user turns.
#[allow(clippy::expect_used)]
static ECHOED_AUTHOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^<@U.*?>\s?:\s?").expect("valid regex"));

/// Slack renders no syntax highlighting, so the tag only shows up as noise.
#[allow(clippy::expect_used)]
static FENCE_LANG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```[ \t]*[A-Za-z][A-Za-z0-9+#._-]*[ \t]*\n").expect("valid regex")
});

/// Clean up raw model output for display in the thread.
pub fn format_assistant_reply(content: &str, translate_markdown: bool) -> String {
    let content = LEADING_NEWLINES_RE.replace(content, "");
    let content = ECHOED_AUTHOR_RE.replace(&content, "");
    let content = FENCE_LANG_RE.replace_all(&content, "```\n");

    if translate_markdown {
        markdown_to_platform(&content)
    } else {
        content.into_owned()
    }
}

/// Undo the three HTML entities the chat platform escapes in message text.
pub fn unescape_entities(content: &str) -> String {
    content
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
