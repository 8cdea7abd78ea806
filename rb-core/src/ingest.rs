//! Incremental extraction of `{content, type}` objects from a streamed
//! `{"messages": [...]}` document.
//!
//! The wrapping document is never parsed as a whole. Each message object is
//! located by its opening key, delimited by brace counting outside string
//! literals, and decoded on its own as soon as its closing brace arrives.

use crate::types::Message;

const OBJECT_KEYS: [&[u8]; 2] = [b"\"content\"", b"\"type\""];

#[derive(Debug, Default)]
pub struct StreamIngestor {
    buffer: String,
    parsed_up_to: usize,
    emitted: usize,
    skipped: usize,
    pending: Option<ObjectScan>,
}

impl StreamIngestor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `text` and return every message object completed by it, in
    /// buffer order. A byte range that produced a message (or a decode
    /// failure) is never scanned again.
    pub fn add_chunk(&mut self, text: &str) -> Vec<Message> {
        self.buffer.push_str(text);
        let mut completed = Vec::new();

        loop {
            let scan = match self.pending.take() {
                Some(scan) => scan,
                None => {
                    let Some(start) = find_object_start(self.buffer.as_bytes(), self.parsed_up_to)
                    else {
                        break;
                    };
                    self.parsed_up_to = start;
                    ObjectScan::new(start)
                }
            };

            match scan.advance(self.buffer.as_bytes()) {
                ScanStep::Incomplete(scan) => {
                    self.pending = Some(scan);
                    break;
                }
                ScanStep::Complete { start, end } => {
                    let raw = &self.buffer[start..end];
                    match serde_json::from_str::<Message>(raw) {
                        Ok(message) => {
                            self.emitted += 1;
                            completed.push(message);
                        }
                        Err(e) => {
                            self.skipped += 1;
                            tracing::warn!(
                                error = %e,
                                offset = start,
                                fragment_len = raw.len(),
                                "skipping malformed message fragment"
                            );
                        }
                    }
                    self.parsed_up_to = end;
                }
            }
        }

        completed
    }

    /// Offset up to which the buffer has been consumed. Never decreases.
    pub fn parsed_up_to(&self) -> usize {
        self.parsed_up_to
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Complete objects that failed to decode and were dropped.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// True while an object has started but its closing brace has not arrived.
    pub fn has_pending_object(&self) -> bool {
        self.pending.is_some()
    }
}

/// Position of the next `{` that opens a message object, i.e. one whose first
/// key is `"content"` or `"type"`. Markers cut off by the end of the buffer
/// are not reported; they are found again once more text arrives.
fn find_object_start(bytes: &[u8], from: usize) -> Option<usize> {
    (from..bytes.len()).find(|&i| bytes[i] == b'{' && opens_message_object(bytes, i + 1))
}

fn opens_message_object(bytes: &[u8], after_brace: usize) -> bool {
    let key_at = skip_whitespace(bytes, after_brace);
    let rest = &bytes[key_at..];
    OBJECT_KEYS.iter().any(|key| {
        rest.starts_with(key) && bytes.get(skip_whitespace(bytes, key_at + key.len())) == Some(&b':')
    })
}

fn skip_whitespace(bytes: &[u8], mut at: usize) -> usize {
    while at < bytes.len() && bytes[at].is_ascii_whitespace() {
        at += 1;
    }
    at
}

/// Brace-counting state for one object. Kept between chunks so an object that
/// arrives in pieces is walked once rather than from its start on every call.
#[derive(Debug, Clone, Copy)]
struct ObjectScan {
    start: usize,
    pos: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

enum ScanStep {
    Incomplete(ObjectScan),
    Complete { start: usize, end: usize },
}

impl ObjectScan {
    fn new(start: usize) -> Self {
        Self {
            start,
            pos: start,
            depth: 0,
            in_string: false,
            escaped: false,
        }
    }

    fn advance(mut self, bytes: &[u8]) -> ScanStep {
        // Every structural byte is ASCII, so walking bytes never splits a
        // UTF-8 sequence at a reported boundary.
        while self.pos < bytes.len() {
            let b = bytes[self.pos];
            self.pos += 1;

            if self.escaped {
                self.escaped = false;
                continue;
            }
            match b {
                b'\\' => self.escaped = true,
                b'"' => self.in_string = !self.in_string,
                b'{' if !self.in_string => self.depth += 1,
                b'}' if !self.in_string => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        return ScanStep::Complete {
                            start: self.start,
                            end: self.pos,
                        };
                    }
                }
                _ => {}
            }
        }
        ScanStep::Incomplete(self)
    }
}
