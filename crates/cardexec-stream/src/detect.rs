//! Wire format auto-detection.

use cardexec_core::StreamFormat;
use serde_json::Value;

/// Classify a buffered stream body.
///
/// Priority: an SSE `data:`/`event:` field marker, then more than one
/// non-blank line where every line is valid JSON, then a configured
/// delimiter, then plain JSON.
pub fn detect_format(buffer: &str, delimiter: Option<&str>) -> StreamFormat {
    if has_field_marker(buffer, "data:") || has_field_marker(buffer, "event:") {
        return StreamFormat::Sse;
    }

    if looks_like_ndjson(buffer) {
        return StreamFormat::Ndjson;
    }

    if delimiter.is_some_and(|d| !d.is_empty()) {
        return StreamFormat::Delimited;
    }

    StreamFormat::Json
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// `marker` occurring at a word boundary.
pub(crate) fn has_field_marker(buffer: &str, marker: &str) -> bool {
    let bytes = buffer.as_bytes();
    buffer
        .match_indices(marker)
        .any(|(idx, _)| idx == 0 || !is_word_byte(bytes[idx - 1]))
}

/// Non-blank, trimmed lines of `text`.
pub(crate) fn content_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().map(str::trim).filter(|l| !l.is_empty())
}

pub(crate) fn looks_like_ndjson(text: &str) -> bool {
    let mut count = 0usize;
    for line in content_lines(text) {
        if serde_json::from_str::<Value>(line).is_err() {
            return false;
        }
        count += 1;
    }
    count > 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_sse_markers() {
        assert_eq!(detect_format("data: {\"a\":1}\n", None), StreamFormat::Sse);
        assert_eq!(detect_format("event: tick\n", Some("|")), StreamFormat::Sse);
        assert_eq!(detect_format("\n  data:1", None), StreamFormat::Sse);
    }

    #[test]
    fn test_marker_needs_word_boundary() {
        // "metadata:" is not a field marker.
        assert_eq!(detect_format("{\"metadata:\": 1}", None), StreamFormat::Json);
    }

    #[test]
    fn test_detects_ndjson_with_multiple_valid_lines() {
        assert_eq!(
            detect_format("{\"a\":1}\n{\"a\":2}\n", None),
            StreamFormat::Ndjson
        );
        // A single line is not enough.
        assert_eq!(detect_format("{\"a\":1}\n", None), StreamFormat::Json);
        // A partial trailing line disqualifies.
        assert_eq!(detect_format("{\"a\":1}\n{\"a\":", None), StreamFormat::Json);
    }

    #[test]
    fn test_delimiter_then_json() {
        assert_eq!(detect_format("{\"a\":1}||{\"b\"", Some("|")), StreamFormat::Delimited);
        assert_eq!(detect_format("{\"a\":1}", Some("")), StreamFormat::Json);
        assert_eq!(detect_format("[1, 2", None), StreamFormat::Json);
    }
}
