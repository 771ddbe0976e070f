//! `${{ runtime.* }}` placeholder resolution.
//!
//! Expressions are restricted to a property path rooted at `runtime`:
//! `.ident`, `?.ident`, `[int]` and `['string']` segments. Anything else
//! (other roots, calls, operators) leaves the placeholder unresolved, which
//! renders as `null` for a whole-string placeholder and as an empty string
//! when embedded in text.

use serde_json::Value;

use crate::types::Params;

const OPEN: &str = "${{";
const CLOSE: &str = "}}";
const ROOT: &str = "runtime";

/// Recursively substitute placeholders inside `value`.
///
/// Strings that consist of exactly one placeholder (surrounding whitespace
/// allowed) are replaced by the resolved value with its JSON type intact.
pub fn resolve_placeholders(value: &Value, runtime: &Params) -> Value {
    match value {
        Value::String(text) => resolve_in_string(text, runtime),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_placeholders(item, runtime))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), resolve_placeholders(item, runtime)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// A located `${{ expr }}` occurrence. `start..end` covers the delimiters.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Placeholder<'a> {
    start: usize,
    end: usize,
    expr: &'a str,
}

fn find_placeholders(text: &str) -> Vec<Placeholder<'_>> {
    let mut found = Vec::new();
    let mut from = 0;

    while let Some(offset) = text[from..].find(OPEN) {
        let start = from + offset;
        let body_start = start + OPEN.len();

        // The expression runs up to the first '}' and must be closed by "}}".
        match text[body_start..].find('}') {
            Some(rel) if rel > 0 && text[body_start + rel..].starts_with(CLOSE) => {
                let end = body_start + rel + CLOSE.len();
                found.push(Placeholder {
                    start,
                    end,
                    expr: text[body_start..body_start + rel].trim(),
                });
                from = end;
            }
            Some(_) => from = start + 1,
            None => break,
        }
    }

    found
}

fn resolve_in_string(text: &str, runtime: &Params) -> Value {
    let placeholders = find_placeholders(text);
    if placeholders.is_empty() {
        return Value::String(text.to_string());
    }

    if let [only] = placeholders.as_slice() {
        let outside = text[..only.start].trim().is_empty() && text[only.end..].trim().is_empty();
        if outside {
            return evaluate(only.expr, runtime).unwrap_or(Value::Null);
        }
    }

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for placeholder in &placeholders {
        out.push_str(&text[cursor..placeholder.start]);
        out.push_str(&stringify(evaluate(placeholder.expr, runtime).as_ref()));
        cursor = placeholder.end;
    }
    out.push_str(&text[cursor..]);

    Value::String(out)
}

fn stringify(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(other) => serde_json::to_string(other).unwrap_or_default(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    /// `?.`
    Optional,
    Index(i64),
    Key(String),
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

/// Tokenize a path expression. Returns `None` on any construct outside
/// the supported grammar.
fn tokenize(expr: &str) -> Option<Vec<Token>> {
    let chars: Vec<char> = expr.trim().chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let read_ident = |i: &mut usize| -> String {
        let mut ident = String::new();
        while *i < chars.len() && is_ident_char(chars[*i]) {
            ident.push(chars[*i]);
            *i += 1;
        }
        ident
    };
    let skip_ws = |i: &mut usize| {
        while *i < chars.len() && chars[*i].is_whitespace() {
            *i += 1;
        }
    };

    let root = read_ident(&mut i);
    if root.is_empty() {
        return None;
    }
    tokens.push(Token::Ident(root));

    while i < chars.len() {
        match chars[i] {
            '?' if chars.get(i + 1) == Some(&'.') => {
                tokens.push(Token::Optional);
                i += 2;
                // `a?.b` carries the identifier directly after the dot.
                if i < chars.len() && is_ident_char(chars[i]) {
                    tokens.push(Token::Ident(read_ident(&mut i)));
                }
            }
            '.' => {
                i += 1;
                let ident = read_ident(&mut i);
                if ident.is_empty() {
                    return None;
                }
                tokens.push(Token::Ident(ident));
            }
            '[' => {
                i += 1;
                skip_ws(&mut i);
                match chars.get(i) {
                    Some(&quote) if quote == '\'' || quote == '"' => {
                        i += 1;
                        let mut key = String::new();
                        while i < chars.len() && chars[i] != quote {
                            key.push(chars[i]);
                            i += 1;
                        }
                        if i >= chars.len() {
                            return None;
                        }
                        i += 1;
                        tokens.push(Token::Key(key));
                    }
                    _ => {
                        let mut digits = String::new();
                        if chars.get(i) == Some(&'-') {
                            digits.push('-');
                            i += 1;
                        }
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            digits.push(chars[i]);
                            i += 1;
                        }
                        tokens.push(Token::Index(digits.parse().ok()?));
                    }
                }
                skip_ws(&mut i);
                if chars.get(i) != Some(&']') {
                    return None;
                }
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            _ => return None,
        }
    }

    Some(tokens)
}

/// Evaluate a path expression against the runtime parameters.
/// `None` means unresolved.
fn evaluate(expr: &str, runtime: &Params) -> Option<Value> {
    let tokens = tokenize(expr)?;
    let (root, rest) = tokens.split_first()?;
    if root != &Token::Ident(ROOT.to_string()) {
        return None;
    }

    // `?.` directly after the root changes nothing.
    let mut rest = rest.iter().skip_while(|t| **t == Token::Optional);
    let Some(first) = rest.next() else {
        return Some(Value::Object(runtime.clone()));
    };
    let mut current: Option<&Value> = match first {
        Token::Ident(name) | Token::Key(name) => runtime.get(name.as_str()),
        Token::Index(index) => runtime.get(&index.to_string()),
        Token::Optional => None,
    };

    for token in rest {
        let value = match current {
            Some(Value::Null) | None => {
                // Access on null/undefined short-circuits whether or not `?.`
                // was written, so evaluation never fails loudly.
                return None;
            }
            Some(value) => value,
        };

        current = match token {
            Token::Optional => Some(value),
            Token::Ident(name) | Token::Key(name) => value.get(name.as_str()),
            Token::Index(index) => match value {
                Value::Array(items) => usize::try_from(*index).ok().and_then(|i| items.get(i)),
                Value::Object(map) => map.get(&index.to_string()),
                _ => None,
            },
        };
    }

    current.cloned()
}
