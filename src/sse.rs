//! Incremental decoding of `text/event-stream` bodies.
//!
//! Network chunks split events at arbitrary byte offsets (including inside a
//! multi-byte character), so bytes are buffered until a blank line closes an
//! event. Only `data` fields are surfaced; comments and other fields such as
//! `event` or `id` are skipped.

use log::warn;

#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns the data payload of every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = find_blank_line(&self.buf) {
            let raw: Vec<u8> = self.buf.drain(..end + 2).collect();
            let block = match std::str::from_utf8(&raw[..end]) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Dropping event with invalid UTF-8 payload: {}", e);
                    continue;
                }
            };
            if let Some(data) = parse_data(block) {
                events.push(data);
            }
        }
        events
    }

    pub fn has_pending(&self) -> bool {
        self.buf.iter().any(|b| !b.is_ascii_whitespace())
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn parse_data(block: &str) -> Option<String> {
    let mut data: Option<String> = None;
    for line in block.lines() {
        if line.starts_with(':') {
            continue;
        }
        let Some(value) = line.strip_prefix("data:") else {
            continue;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        match data.as_mut() {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(value);
            }
            None => {
                data = Some(value.to_string());
            }
        }
    }
    data
}
