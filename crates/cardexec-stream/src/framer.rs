//! Block framing with buffer carry-over.
//!
//! Every byte pushed into a `BlockFramer` ends up either inside exactly one
//! emitted block or in the retained buffer, never both.

use cardexec_core::StreamFormat;
use serde_json::Value;
use tracing::trace;

use crate::detect::detect_format;
use crate::parse::{parse_block, scan_json_values};

const DEFAULT_DELIMITER: &str = "\n";

/// A complete block cut from the stream buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedBlock {
    /// Format the block was framed with.
    pub format: StreamFormat,
    pub text: String,
}

/// Incremental framer for one response body.
#[derive(Debug, Clone)]
pub struct BlockFramer {
    forced: Option<StreamFormat>,
    delimiter: Option<String>,
    buffer: String,
}

impl BlockFramer {
    /// Create a framer. `forced` disables auto-detection.
    pub fn new(forced: Option<StreamFormat>, delimiter: Option<String>) -> Self {
        Self {
            forced,
            delimiter: delimiter.filter(|d| !d.is_empty()),
            buffer: String::new(),
        }
    }

    /// Text retained for the next chunk.
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    fn effective_delimiter(&self) -> &str {
        self.delimiter.as_deref().unwrap_or(DEFAULT_DELIMITER)
    }

    /// Append a decoded chunk and cut every complete block.
    ///
    /// Without a forced format the whole buffer is re-classified on every
    /// push, so a format signal arriving late still takes effect.
    pub fn push(&mut self, chunk: &str) -> Vec<FramedBlock> {
        self.buffer.push_str(chunk);

        let format = self
            .forced
            .unwrap_or_else(|| detect_format(&self.buffer, self.delimiter.as_deref()));

        let texts = match format {
            StreamFormat::Sse => self.take_sse_blocks(),
            StreamFormat::Delimited => self.take_delimited_blocks(),
            StreamFormat::Ndjson => self.take_lines(),
            StreamFormat::Json => self.take_json_values(),
        };

        trace!(
            format = %format,
            blocks = texts.len(),
            retained = self.buffer.len(),
            "Framed stream chunk"
        );

        texts
            .into_iter()
            .map(|text| FramedBlock { format, text })
            .collect()
    }

    /// Parse a block cut by this framer.
    pub fn parse(&self, block: &FramedBlock) -> Vec<Value> {
        parse_block(&block.text, Some(block.format), Some(self.effective_delimiter()))
    }

    /// Drain the residual buffer at end of stream.
    pub fn finish(&mut self) -> Vec<Value> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() {
            return Vec::new();
        }
        parse_block(&rest, self.forced, self.delimiter.as_deref())
    }

    /// Blocks end on `\n\n+` or `\r?\n\r?\n`.
    fn take_sse_blocks(&mut self) -> Vec<String> {
        let bytes = self.buffer.as_bytes();
        let mut blocks = Vec::new();
        let mut start = 0;
        let mut i = 0;

        while i < bytes.len() {
            match sse_boundary_len(bytes, i) {
                Some(len) => {
                    if i > start {
                        blocks.push(self.buffer[start..i].to_string());
                    }
                    i += len;
                    start = i;
                }
                None => i += 1,
            }
        }

        self.buffer.drain(..start);
        blocks
    }

    /// Blocks end on the delimiter written twice.
    fn take_delimited_blocks(&mut self) -> Vec<String> {
        let separator = self.effective_delimiter().repeat(2);
        let mut parts: Vec<&str> = self.buffer.split(separator.as_str()).collect();
        let retained = parts.pop().unwrap_or_default().len();
        if parts.is_empty() {
            return Vec::new();
        }

        let blocks = parts
            .into_iter()
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect();
        let consumed = self.buffer.len() - retained;
        self.buffer.drain(..consumed);
        blocks
    }

    /// One block per newline-terminated, non-blank line.
    fn take_lines(&mut self) -> Vec<String> {
        let Some(last_newline) = self.buffer.rfind('\n') else {
            return Vec::new();
        };

        let blocks = self.buffer[..last_newline]
            .split('\n')
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect();
        self.buffer.drain(..=last_newline);
        blocks
    }

    /// The whole buffer when it is one JSON document, otherwise every
    /// balanced top-level value.
    fn take_json_values(&mut self) -> Vec<String> {
        let trimmed = self.buffer.trim();
        if !trimmed.is_empty() && serde_json::from_str::<Value>(trimmed).is_ok() {
            return vec![std::mem::take(&mut self.buffer)];
        }

        let scan = scan_json_values(&self.buffer);
        if scan.spans.is_empty() {
            return Vec::new();
        }

        let blocks = scan
            .spans
            .iter()
            .map(|&(start, end)| self.buffer[start..end].to_string())
            .collect();
        self.buffer.drain(..scan.consumed);
        blocks
    }
}

/// Length of the SSE record boundary starting at `i`, if any.
fn sse_boundary_len(bytes: &[u8], i: usize) -> Option<usize> {
    if bytes[i] == b'\n' && bytes.get(i + 1) == Some(&b'\n') {
        let run = bytes[i..].iter().take_while(|&&b| b == b'\n').count();
        return Some(run);
    }

    let mut j = i;
    for _ in 0..2 {
        if bytes.get(j) == Some(&b'\r') {
            j += 1;
        }
        if bytes.get(j) != Some(&b'\n') {
            return None;
        }
        j += 1;
    }
    Some(j - i)
}
