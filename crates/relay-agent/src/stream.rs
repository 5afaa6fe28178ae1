/// Events emitted during an LLM streaming response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Incremental text content from the model.
    TextDelta { text: String },

    /// Model wants a local function invoked. Emitted once, fully assembled,
    /// after the provider has finished streaming the call's fragments.
    FunctionCall { name: String, arguments: String },

    /// Stream completed successfully.
    Done {
        model: String,
        finish_reason: Option<String>,
    },

    /// Error during streaming.
    Error { message: String },
}

/// Parse a single SSE line.
/// SSE format: `event: <type>\ndata: <json>\n\n`
pub fn parse_sse_line(line: &str) -> Option<SseParsed> {
    if let Some(event_type) = line.strip_prefix("event:") {
        Some(SseParsed::Event(event_type.trim_start().to_string()))
    } else {
        line.strip_prefix("data:")
            .map(|data| SseParsed::Data(data.trim_start().to_string()))
    }
}

#[derive(Debug, PartialEq)]
pub enum SseParsed {
    Event(String),
    Data(String),
}

/// Reassembles SSE lines from arbitrarily split network chunks.
///
/// Buffers raw bytes so a multi-byte character split across two chunks is
/// decoded intact.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buf: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every complete, non-empty line it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            let text = text.trim();
            if !text.is_empty() {
                lines.push(text.to_string());
            }
        }
        lines
    }

    /// Whatever is left once the byte stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = String::from_utf8_lossy(&self.buf).trim().to_string();
        self.buf.clear();
        (!rest.is_empty()).then_some(rest)
    }
}
