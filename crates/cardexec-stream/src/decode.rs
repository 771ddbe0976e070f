//! UTF-8 decoding across chunk boundaries.

use crate::error::{StreamError, StreamResult};

/// Streaming UTF-8 decoder.
///
/// A multi-byte character split between two network reads is held back
/// until the rest of it arrives. Invalid sequences decode to U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `bytes`, returning every complete character seen so far.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // Incomplete sequence at the end: wait for more bytes.
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Number of bytes held back for an incomplete character.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Flush at end of stream. Dangling bytes are an error.
    pub fn finish(&mut self) -> StreamResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let dangling = self.pending.len();
        self.pending.clear();
        Err(StreamError::TruncatedUtf8(dangling))
    }
}
