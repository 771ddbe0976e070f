//! Block parsing.
//!
//! A block is one framed unit of stream text. Parsing never fails: an
//! unparseable piece becomes a JSON string holding the raw text.

use cardexec_core::StreamFormat;
use serde_json::{Map, Value};
use tracing::trace;

use crate::detect::{content_lines, detect_format};

/// Key carrying the SSE event name on wrapped items.
pub const SSE_EVENT_KEY: &str = "__sseEvent";
/// Key carrying the parsed SSE payload on wrapped items.
pub const SSE_RAW_KEY: &str = "__raw";
/// Key carrying unparseable SSE data on wrapped items.
pub const SSE_RAW_TEXT_KEY: &str = "__rawText";

/// Parse one block into zero or more values.
///
/// `format` of `None` auto-detects. `delimiter` applies to the delimited
/// format and defaults to a newline.
pub fn parse_block(text: &str, format: Option<StreamFormat>, delimiter: Option<&str>) -> Vec<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let format = format.unwrap_or_else(|| detect_format(trimmed, delimiter));
    match format {
        StreamFormat::Sse => parse_sse(trimmed),
        StreamFormat::Ndjson => parse_ndjson(trimmed),
        StreamFormat::Delimited => {
            let delimiter = delimiter.filter(|d| !d.is_empty()).unwrap_or("\n");
            parse_delimited(text, delimiter)
        }
        StreamFormat::Json => parse_json(trimmed),
    }
}

fn parse_or_raw(piece: &str) -> Value {
    serde_json::from_str(piece).unwrap_or_else(|_| {
        trace!(len = piece.len(), "Keeping unparseable piece as raw text");
        Value::String(piece.to_string())
    })
}

/// Split SSE text into records on blank lines.
fn sse_records(text: &str) -> Vec<Vec<&str>> {
    let mut records = Vec::new();
    let mut current = Vec::new();
    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.trim().is_empty() {
            if !current.is_empty() {
                records.push(std::mem::take(&mut current));
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        records.push(current);
    }
    records
}

enum SseLine<'a> {
    Event(&'a str),
    Data(&'a str),
    Comment,
    Other(&'a str),
}

/// Classify one SSE line: `^\s*(event|data)\s*:\s*(.*)$`, case-insensitive.
fn classify_sse_line(line: &str) -> SseLine<'_> {
    let body = line.trim_start();
    if body.starts_with(':') {
        return SseLine::Comment;
    }

    for (field, is_event) in [("event", true), ("data", false)] {
        let Some(head) = body.get(..field.len()) else {
            continue;
        };
        if !head.eq_ignore_ascii_case(field) {
            continue;
        }
        let rest = body[field.len()..].trim_start();
        if let Some(value) = rest.strip_prefix(':') {
            let value = value.trim_start();
            return if is_event {
                SseLine::Event(value.trim())
            } else {
                SseLine::Data(value)
            };
        }
    }

    SseLine::Other(body.trim())
}

fn parse_sse(text: &str) -> Vec<Value> {
    let mut items = Vec::new();

    for record in sse_records(text) {
        let mut event: Option<&str> = None;
        let mut data: Vec<&str> = Vec::new();

        for line in record {
            match classify_sse_line(line) {
                SseLine::Event(name) => event = Some(name),
                SseLine::Data(part) => data.push(part),
                SseLine::Comment => {}
                // Stray JSON without a `data:` prefix still counts as data.
                SseLine::Other(part) => data.push(part),
            }
        }

        let data_text = data.join("\n");
        if data_text.is_empty() {
            continue;
        }

        let event = event.filter(|name| !name.is_empty());
        let item = match (serde_json::from_str::<Value>(&data_text), event) {
            (Ok(parsed), Some(name)) => wrap_sse_event(name, parsed),
            (Ok(parsed), None) => parsed,
            (Err(_), Some(name)) => {
                let mut wrapped = Map::new();
                wrapped.insert(SSE_EVENT_KEY.to_string(), Value::String(name.to_string()));
                wrapped.insert(SSE_RAW_TEXT_KEY.to_string(), Value::String(data_text));
                Value::Object(wrapped)
            }
            (Err(_), None) => Value::String(data_text),
        };
        items.push(item);
    }

    items
}

/// `{__sseEvent, __raw, ...payload}` for objects, `{__sseEvent, __raw, value}` otherwise.
fn wrap_sse_event(name: &str, parsed: Value) -> Value {
    let mut wrapped = Map::new();
    wrapped.insert(SSE_EVENT_KEY.to_string(), Value::String(name.to_string()));
    wrapped.insert(SSE_RAW_KEY.to_string(), parsed.clone());
    match parsed {
        Value::Object(fields) => {
            for (key, value) in fields {
                wrapped.insert(key, value);
            }
        }
        other => {
            wrapped.insert("value".to_string(), other);
        }
    }
    Value::Object(wrapped)
}

fn parse_ndjson(text: &str) -> Vec<Value> {
    content_lines(text).map(parse_or_raw).collect()
}

fn parse_delimited(text: &str, delimiter: &str) -> Vec<Value> {
    text.split(delimiter)
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .map(parse_or_raw)
        .collect()
}

fn parse_json(text: &str) -> Vec<Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(items)) => items,
        Ok(value) => vec![value],
        Err(_) => {
            let harvested: Vec<Value> = scan_json_values(text)
                .spans
                .into_iter()
                .filter_map(|(start, end)| serde_json::from_str(&text[start..end]).ok())
                .collect();
            if harvested.is_empty() {
                vec![Value::String(text.to_string())]
            } else {
                harvested
            }
        }
    }
}

/// Result of scanning text for balanced top-level `{...}`/`[...]` values.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct JsonScan {
    /// Byte ranges of complete top-level values.
    pub spans: Vec<(usize, usize)>,
    /// Byte offset after the last complete value, or 0.
    pub consumed: usize,
}

/// String-aware balanced bracket scan.
pub(crate) fn scan_json_values(text: &str) -> JsonScan {
    let mut scan = JsonScan::default();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, byte) in text.bytes().enumerate() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match byte {
            b'{' | b'[' => {
                if depth == 0 {
                    start = idx;
                }
                depth += 1;
            }
            b'}' | b']' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    scan.spans.push((start, idx + 1));
                    scan.consumed = idx + 1;
                }
            }
            b'"' if depth > 0 => in_string = true,
            _ => {}
        }
    }

    scan
}
