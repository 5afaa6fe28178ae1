//! Conversion between Slack mrkdwn and the Markdown dialect language models emit.
//!
//! Code spans and fenced blocks pass through untouched. Links and other
//! `<...>` tokens are swapped for sentinels while the emphasis passes run so
//! URLs containing `_` or `*` are never mistaken for formatting.

use std::sync::LazyLock;

use regex::Regex;

/// Fenced blocks first so their backticks are not read as inline code.
#[allow(clippy::expect_used)]
static CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```.+?```|`[^`\n]+?`").expect("valid regex"));

/// `<https://x|label>`, `<https://x>`, `<@U123>`, `<#C123|general>`.
#[allow(clippy::expect_used)]
static ANGLE_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([^<>\s|]+)(?:\|([^<>\n]*))?>").expect("valid regex"));

#[allow(clippy::expect_used)]
static MD_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[([^\[\]\n]+)\]\(([^()\s]+)\)").expect("valid regex")
});

#[allow(clippy::expect_used)]
static MD_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^#{1,6}[ \t]+(.+?)[ \t]*#*[ \t]*$").expect("valid regex")
});

#[allow(clippy::expect_used)]
static MD_STAR_BULLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^([ \t]*)\*[ \t]+").expect("valid regex"));

const SENTINEL_OPEN: char = '\u{E000}';
const SENTINEL_CLOSE: char = '\u{E001}';

/// Slack mrkdwn to Markdown.
pub fn platform_to_markdown(content: &str) -> String {
    map_prose(content, |prose| {
        let (prose, links) = protect(prose, &ANGLE_TOKEN_RE, |caps| {
            let target = &caps[1];
            match caps.get(2) {
                Some(label) if is_url(target) => format!("[{}]({})", label.as_str(), target),
                _ => caps[0].to_string(),
            }
        });

        // Slack only formats at word edges: `snake_case` and `2*3` are literal.
        let prose = Emphasis::new("*", "*", '*')
            .guarded(is_not_word)
            .replace(&prose, |b| format!("**{b}**"));
        let prose = Emphasis::new("_", "_", '_')
            .guarded(is_not_word)
            .replace(&prose, |b| format!("*{b}*"));
        let prose = Emphasis::new("~", "~", '~')
            .guarded(is_not_word)
            .replace(&prose, |b| format!("~~{b}~~"));

        restore(&prose, &links)
    })
}

/// Markdown to Slack mrkdwn.
pub fn markdown_to_platform(content: &str) -> String {
    let segments = split_code(content);
    let mut result = String::with_capacity(content.len());

    for (idx, segment) in segments.iter().enumerate() {
        match segment {
            Segment::Code(code) => {
                if result.chars().last().is_some_and(is_wide) {
                    result.push(' ');
                }
                result.push_str(code);
                let next = segments.get(idx + 1).and_then(|s| s.text().chars().next());
                if next.is_some_and(is_wide) {
                    result.push(' ');
                }
            }
            Segment::Prose(prose) => result.push_str(&convert_prose_to_platform(prose)),
        }
    }
    result
}

fn convert_prose_to_platform(prose: &str) -> String {
    let (prose, links) = protect(prose, &MD_LINK_RE, |caps| {
        format!("<{}|{}>", &caps[2], &caps[1])
    });
    let (prose, tokens) = protect_from(&prose, &ANGLE_TOKEN_RE, |caps| caps[0].to_string(), links.len());

    let prose = MD_HEADER_RE.replace_all(&prose, |caps: &regex::Captures| {
        let title = &caps[1];
        if title.contains('*') {
            title.to_string()
        } else {
            format!("**{title}**")
        }
    });
    let prose = MD_STAR_BULLET_RE.replace_all(&prose, "${1}• ");

    let prose = Emphasis::new("***", "***", '*').replace(&prose, |b| format!("_*{b}*_"));
    let prose = Emphasis::new("*", "*", '*')
        .guarded(|c| c != '*' && c != '_')
        .replace(&prose, |b| format!("_{b}_"));
    let prose = Emphasis::new("**", "**", '*').replace(&prose, |b| format!("*{b}*"));
    let prose = Emphasis::new("__", "__", '_').replace(&prose, |b| format!("*{b}*"));
    let prose = Emphasis::new("~~", "~~", '~').replace(&prose, |b| format!("~{b}~"));

    let mut prose = prose;
    for pattern in [
        Emphasis::any_body("_*", "*_"),
        Emphasis::new("*", "*", '*'),
        Emphasis::new("_", "_", '_'),
        Emphasis::new("~", "~", '~'),
    ] {
        prose = pattern.pad_wide_neighbours(&prose);
    }

    let mut all = links;
    all.extend(tokens);
    restore(&prose, &all)
}

enum Segment<'a> {
    Code(&'a str),
    Prose(&'a str),
}

impl<'a> Segment<'a> {
    fn text(&self) -> &'a str {
        match self {
            Segment::Code(s) | Segment::Prose(s) => s,
        }
    }
}

fn split_code(content: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut last = 0;
    for m in CODE_RE.find_iter(content) {
        if m.start() > last {
            segments.push(Segment::Prose(&content[last..m.start()]));
        }
        segments.push(Segment::Code(m.as_str()));
        last = m.end();
    }
    if last < content.len() {
        segments.push(Segment::Prose(&content[last..]));
    }
    segments
}

/// Apply `f` to every non-code segment.
fn map_prose(content: &str, f: impl Fn(&str) -> String) -> String {
    split_code(content)
        .into_iter()
        .map(|segment| match segment {
            Segment::Code(code) => code.to_string(),
            Segment::Prose(prose) => f(prose),
        })
        .collect()
}

fn protect(
    text: &str,
    re: &Regex,
    render: impl Fn(&regex::Captures) -> String,
) -> (String, Vec<String>) {
    protect_from(text, re, render, 0)
}

/// Replace each match with a sentinel and return the rendered replacements.
fn protect_from(
    text: &str,
    re: &Regex,
    render: impl Fn(&regex::Captures) -> String,
    first_index: usize,
) -> (String, Vec<String>) {
    let mut rendered = Vec::new();
    let replaced = re.replace_all(text, |caps: &regex::Captures| {
        let index = first_index + rendered.len();
        rendered.push(render(caps));
        format!("{SENTINEL_OPEN}{index}{SENTINEL_CLOSE}")
    });
    (replaced.into_owned(), rendered)
}

fn restore(text: &str, rendered: &[String]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(SENTINEL_OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + SENTINEL_OPEN.len_utf8()..];
        let Some(end) = after.find(SENTINEL_CLOSE) else {
            out.push_str(&rest[start..]);
            return out;
        };
        match after[..end].parse::<usize>().ok().and_then(|i| rendered.get(i)) {
            Some(token) => out.push_str(token),
            None => out.push_str(&rest[start..start + SENTINEL_OPEN.len_utf8() + end + SENTINEL_CLOSE.len_utf8()]),
        }
        rest = &after[end + SENTINEL_CLOSE.len_utf8()..];
    }
    out.push_str(rest);
    out
}

fn is_not_word(c: char) -> bool {
    !(c.is_alphanumeric() || c == '_')
}

fn is_url(target: &str) -> bool {
    target.starts_with("http://") || target.starts_with("https://") || target.starts_with("mailto:")
}

/// A delimited emphasis span such as `*bold*` or `~~strike~~`.
///
/// The body must be non-empty, stay on one line, and neither start nor end
/// with whitespace. When `forbidden` is set the body may not contain that
/// character, so the span closes at its first occurrence.
struct Emphasis<'a> {
    open: &'a str,
    close: &'a str,
    forbidden: Option<char>,
    /// Neighbours allowed immediately outside the delimiters.
    outside: Option<fn(char) -> bool>,
}

impl<'a> Emphasis<'a> {
    fn new(open: &'a str, close: &'a str, forbidden: char) -> Self {
        Self {
            open,
            close,
            forbidden: Some(forbidden),
            outside: None,
        }
    }

    fn any_body(open: &'a str, close: &'a str) -> Self {
        Self {
            open,
            close,
            forbidden: None,
            outside: None,
        }
    }

    fn guarded(mut self, outside: fn(char) -> bool) -> Self {
        self.outside = Some(outside);
        self
    }

    fn outside_ok(&self, c: Option<char>) -> bool {
        match (self.outside, c) {
            (Some(ok), Some(c)) => ok(c),
            _ => true,
        }
    }

    /// Byte range `(start, body_start, body_end, end)` of the span opening at `start`.
    fn match_at(&self, text: &str, start: usize) -> Option<(usize, usize, usize, usize)> {
        if !text[start..].starts_with(self.open) {
            return None;
        }
        if !self.outside_ok(text[..start].chars().last()) {
            return None;
        }
        let body_start = start + self.open.len();
        let first = text[body_start..].chars().next()?;
        if first.is_whitespace() || Some(first) == self.forbidden {
            return None;
        }

        let mut prev = first;
        let mut pos = body_start + first.len_utf8();
        while pos < text.len() {
            let rest = &text[pos..];
            if rest.starts_with(self.close) && !prev.is_whitespace() {
                let end = pos + self.close.len();
                if self.outside_ok(text[end..].chars().next()) {
                    return Some((start, body_start, pos, end));
                }
            }
            let c = rest.chars().next()?;
            if c == '\n' || Some(c) == self.forbidden {
                return None;
            }
            prev = c;
            pos += c.len_utf8();
        }
        None
    }

    /// Left-to-right, non-overlapping replacement of every span.
    fn replace(&self, text: &str, render: impl Fn(&str) -> String) -> String {
        let mut out = String::with_capacity(text.len() + 8);
        let mut i = 0;
        while i < text.len() {
            if let Some((_, body_start, body_end, end)) = self.match_at(text, i) {
                out.push_str(&render(&text[body_start..body_end]));
                i = end;
                continue;
            }
            let Some(c) = text[i..].chars().next() else {
                break;
            };
            out.push(c);
            i += c.len_utf8();
        }
        out
    }

    /// Insert an ASCII space between a span and an adjacent wide character.
    fn pad_wide_neighbours(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len() + 8);
        let mut i = 0;
        while i < text.len() {
            if let Some((start, _, _, end)) = self.match_at(text, i) {
                if text[..start].chars().last().is_some_and(is_wide) {
                    out.push(' ');
                }
                out.push_str(&text[start..end]);
                if text[end..].chars().next().is_some_and(is_wide) {
                    out.push(' ');
                }
                i = end;
                continue;
            }
            let Some(c) = text[i..].chars().next() else {
                break;
            };
            out.push(c);
            i += c.len_utf8();
        }
        out
    }
}

/// East Asian Wide or Fullwidth, per the major Unicode blocks.
fn is_wide(c: char) -> bool {
    matches!(c as u32,
        0x1100..=0x115F
        | 0x2E80..=0x303E
        | 0x3041..=0x33FF
        | 0x3400..=0x4DBF
        | 0x4E00..=0x9FFF
        | 0xA000..=0xA4CF
        | 0xA960..=0xA97F
        | 0xAC00..=0xD7A3
        | 0xF900..=0xFAFF
        | 0xFE30..=0xFE4F
        | 0xFF00..=0xFF60
        | 0xFFE0..=0xFFE6
        | 0x1F300..=0x1F64F
        | 0x1F900..=0x1F9FF
        | 0x20000..=0x2FFFD
        | 0x30000..=0x3FFFD
    )
}
