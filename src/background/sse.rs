//! Incremental server-sent-events line decoder.

/// One meaningful SSE line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    /// `event: <name>`
    Event(String),
    /// `data: <payload>`, or a bare JSON line.
    Data(String),
    /// `data: [DONE]`
    Done,
}

/// Splits a byte stream into [`SseLine`]s.
///
/// Bytes are buffered until a newline so multi-byte characters split across
/// network chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a network chunk and return every complete line it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseLine> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(line) = parse_line(&String::from_utf8_lossy(&raw)) {
                lines.push(line);
            }
        }
        lines
    }

    /// Flush a trailing line that never got its newline.
    pub fn finish(&mut self) -> Option<SseLine> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&String::from_utf8_lossy(&rest))
    }
}

fn parse_line(line: &str) -> Option<SseLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(name) = trimmed.strip_prefix("event:") {
        return Some(SseLine::Event(name.trim().to_string()));
    }
    if let Some(data) = trimmed.strip_prefix("data:") {
        let data = data.trim();
        return Some(if data == "[DONE]" {
            SseLine::Done
        } else {
            SseLine::Data(data.to_string())
        });
    }
    // Some servers omit the `data:` prefix on JSON lines.
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Some(SseLine::Data(trimmed.to_string()));
    }
    None
}
