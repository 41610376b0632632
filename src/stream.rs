use url::Url;

use crate::models::{ChatResponse, Source};
use crate::sanitize::sanitize_for_display;

/// Marker the backend appends to a streamed answer when source URLs follow.
pub const SOURCES_SENTINEL: &str = "\n\nИсточники:\n";

/// Accumulates a streamed answer chunk by chunk.
///
/// Bytes are decoded as UTF-8 incrementally: a code point split across two
/// chunks is held back until the rest arrives, and invalid sequences become
/// U+FFFD. The raw text is kept so that the sources trailer is parsed from
/// what the server sent rather than from the display rendering.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    pending: Vec<u8>,
    raw: String,
    display: String,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return the current display text.
    pub fn push(&mut self, chunk: &[u8]) -> &str {
        self.pending.extend_from_slice(chunk);
        let consumed = decode_prefix(&self.pending, &mut self.raw);
        self.pending.drain(..consumed);
        self.display = sanitize_for_display(&self.raw);
        &self.display
    }

    pub fn display(&self) -> &str {
        &self.display
    }

    /// Close the stream and split off the sources trailer, if any.
    pub fn finish(mut self) -> ChatResponse {
        if !self.pending.is_empty() {
            self.raw.push_str(&String::from_utf8_lossy(&self.pending));
            self.pending.clear();
        }
        split_sources(&self.raw)
    }
}

/// Decode as much of `bytes` as forms complete UTF-8 into `out`, returning how
/// many bytes were consumed. An incomplete sequence at the end is left over.
fn decode_prefix(bytes: &[u8], out: &mut String) -> usize {
    let mut rest = bytes;
    loop {
        match std::str::from_utf8(rest) {
            Ok(text) => {
                out.push_str(text);
                return bytes.len();
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                // valid_up_to marks a checked UTF-8 boundary
                out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                match e.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        rest = &after[bad..];
                    }
                    None => return bytes.len() - after.len(),
                }
            }
        }
    }
}

/// Build the final response from a complete streamed body.
pub fn split_sources(text: &str) -> ChatResponse {
    match text.rfind(SOURCES_SENTINEL) {
        Some(idx) => {
            let sources = text[idx + SOURCES_SENTINEL.len()..]
                .lines()
                .map(str::trim)
                .filter(|line| is_absolute_http_url(line))
                .map(Source::from_url)
                .collect();
            ChatResponse {
                answer: sanitize_for_display(&text[..idx]),
                used_search: true,
                sources,
                streamed: true,
                debug: None,
            }
        }
        None => ChatResponse {
            answer: sanitize_for_display(text),
            used_search: false,
            sources: Vec::new(),
            streamed: true,
            debug: None,
        },
    }
}

fn is_absolute_http_url(candidate: &str) -> bool {
    Url::parse(candidate)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
        .unwrap_or(false)
}
