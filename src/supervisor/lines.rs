//! Reassembly of streamed output chunks into complete lines.
//!
//! A chunk is the text of one read split on `\n`: every element but the last is
//! terminated, the last is whatever followed the final newline (empty when the
//! read ended on a newline). The first element continues the previous chunk's
//! unterminated tail.

#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: String,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return the lines it completed, in order.
    pub fn feed(&mut self, chunk: Vec<String>) -> Vec<String> {
        if chunk.iter().all(String::is_empty) {
            // An all-empty chunk only matters if it terminates a pending tail.
            if chunk.len() > 1 && !self.pending.is_empty() {
                return vec![self.take_pending()];
            }
            return Vec::new();
        }

        let mut parts = chunk.into_iter();
        if let Some(head) = parts.next() {
            self.pending.push_str(&head);
        }
        let mut rest: Vec<String> = parts.collect();
        let Some(tail) = rest.pop() else {
            return Vec::new();
        };

        let mut out = Vec::with_capacity(rest.len() + 1);
        out.push(self.take_pending());
        out.extend(rest.into_iter().map(strip_cr));
        self.pending = tail;
        out
    }

    /// The unterminated tail, if any. Called once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.take_pending())
        }
    }

    fn take_pending(&mut self) -> String {
        strip_cr(std::mem::take(&mut self.pending))
    }
}

fn strip_cr(mut line: String) -> String {
    if line.ends_with('\r') {
        line.pop();
    }
    line
}

/// Incremental UTF-8 decoding for a byte stream read in arbitrary pieces.
///
/// A multi-byte character cut by a read boundary is held back until the next
/// read completes it. Bytes that can never form a character become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `bytes` after whatever the previous call held back.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let held = rest.to_vec();
        self.pending = held;
        out
    }

    /// Whatever is still held back once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let bytes = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Split decoded text from one read into a chunk.
pub fn split_chunk(text: &str) -> Vec<String> {
    text.split('\n').map(str::to_string).collect()
}
