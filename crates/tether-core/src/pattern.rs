//! Capability call patterns.
//!
//! ```text
//! name                 any arguments (`*` globs allowed in the name)
//! name(*)              any arguments
//! name()               only calls without arguments
//! name(k=v, ...)       exactly these arguments
//! name(k=v, ..., *)    these arguments plus any others
//! ```
//!
//! Unquoted values may contain `*` globs. Double-quoted values (and keys)
//! are literal and support `\"` and `\\` escapes. Argument values that are
//! not strings are compared by their compact JSON text.
//!
//! Patterns learned from an approved call are different: they hold the
//! call's arguments as JSON and match only an identical argument map, so
//! `id="3"` never stands in for `id=3`. They serialize as
//! `{"capability": ..., "arguments": {...}}` rather than pattern text.

use crate::checkpoint::Arguments;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid pattern '{pattern}': {reason}")]
pub struct PatternError {
    pub pattern: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ValueMatch {
    Glob(String),
    Literal(String),
}

impl ValueMatch {
    fn matches(&self, text: &str) -> bool {
        match self {
            ValueMatch::Glob(glob) => glob_match(glob, text),
            ValueMatch::Literal(literal) => literal == text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ArgSpec {
    Any,
    Exact(Vec<(String, ValueMatch)>),
    AtLeast(Vec<(String, ValueMatch)>),
    /// One approved call: this capability with exactly these argument values.
    Call(Arguments),
}

/// Stored form of a [`Pattern`].
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PatternRepr {
    Text(String),
    Call { capability: String, arguments: Arguments },
}

/// A parsed capability pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PatternRepr", into = "PatternRepr")]
pub struct Pattern {
    name: String,
    args: ArgSpec,
    source: String,
}

impl Pattern {
    /// Pattern matching exactly this capability with exactly these argument
    /// values, JSON types included.
    pub fn exact(capability: &str, arguments: &Arguments) -> Self {
        Self {
            name: capability.to_string(),
            args: ArgSpec::Call(arguments.clone()),
            source: format_call(capability, arguments),
        }
    }

    /// Identity of the pattern. Unlike the display text it never merges two
    /// approved calls whose arguments differ only in JSON type.
    pub fn key(&self) -> String {
        match &self.args {
            ArgSpec::Call(arguments) => {
                format!("{}{}", self.name, Value::Object(arguments.clone()))
            }
            _ => self.source.clone(),
        }
    }

    /// The capability-name part, possibly a glob.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, capability: &str, arguments: &Arguments) -> bool {
        if let ArgSpec::Call(expected) = &self.args {
            return self.name == capability && expected == arguments;
        }
        if !glob_match(&self.name, capability) {
            return false;
        }
        match &self.args {
            ArgSpec::Any => true,
            ArgSpec::Exact(constraints) => {
                arguments.len() == constraints.len() && constraints_hold(constraints, arguments)
            }
            ArgSpec::AtLeast(constraints) => constraints_hold(constraints, arguments),
            ArgSpec::Call(_) => false,
        }
    }
}

fn constraints_hold(constraints: &[(String, ValueMatch)], arguments: &Arguments) -> bool {
    constraints.iter().all(|(key, expected)| {
        arguments
            .get(key)
            .is_some_and(|value| expected.matches(&value_text(value)))
    })
}

/// Text an argument value is compared by.
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl From<Pattern> for PatternRepr {
    fn from(pattern: Pattern) -> Self {
        match pattern.args {
            ArgSpec::Call(arguments) => PatternRepr::Call {
                capability: pattern.name,
                arguments,
            },
            _ => PatternRepr::Text(pattern.source),
        }
    }
}

impl TryFrom<PatternRepr> for Pattern {
    type Error = PatternError;

    fn try_from(repr: PatternRepr) -> Result<Self, Self::Error> {
        match repr {
            PatternRepr::Text(text) => text.parse(),
            PatternRepr::Call {
                capability,
                arguments,
            } => {
                if capability.is_empty() {
                    return Err(PatternError {
                        pattern: format_call(&capability, &arguments),
                        reason: "empty capability name".into(),
                    });
                }
                Ok(Pattern::exact(&capability, &arguments))
            }
        }
    }
}

impl TryFrom<String> for Pattern {
    type Error = PatternError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl std::str::FromStr for Pattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let source = s.trim();
        let fail = |reason: &str| PatternError {
            pattern: source.to_string(),
            reason: reason.to_string(),
        };

        let (name, inner) = match source.split_once('(') {
            None => (source, None),
            Some((name, rest)) => {
                let inner = rest
                    .strip_suffix(')')
                    .ok_or_else(|| fail("missing closing ')'"))?;
                (name.trim(), Some(inner))
            }
        };
        if name.is_empty() {
            return Err(fail("empty capability name"));
        }
        if name
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '(' | ')' | ',' | '=' | '"'))
        {
            return Err(fail("capability name contains reserved characters"));
        }

        let args = match inner.map(str::trim) {
            None | Some("*") => ArgSpec::Any,
            Some("") => ArgSpec::Exact(Vec::new()),
            Some(inner) => parse_args(inner).map_err(|reason| fail(&reason))?,
        };

        Ok(Self {
            name: name.to_string(),
            args,
            source: source.to_string(),
        })
    }
}

fn parse_args(inner: &str) -> Result<ArgSpec, String> {
    let items = split_items(inner)?;
    let last = items.len() - 1;
    let mut constraints: Vec<(String, ValueMatch)> = Vec::new();
    let mut open = false;

    for (i, item) in items.iter().enumerate() {
        let item = item.trim();
        if item.is_empty() {
            return Err("empty argument constraint".into());
        }
        if item == "*" {
            if i != last {
                return Err("'*' must be the last argument constraint".into());
            }
            open = true;
            continue;
        }
        let (key, raw) = match item.strip_prefix('"') {
            Some(quoted) => {
                let (key, rest) = take_quoted(quoted)?;
                let raw = rest
                    .trim_start()
                    .strip_prefix('=')
                    .ok_or_else(|| format!("expected key=value, got '{item}'"))?;
                (key, raw)
            }
            None => {
                let (key, raw) = item
                    .split_once('=')
                    .ok_or_else(|| format!("expected key=value, got '{item}'"))?;
                let key = key.trim();
                if key.is_empty() || key.contains(['"', '*']) {
                    return Err(format!("invalid argument name '{key}'"));
                }
                (key.to_string(), raw)
            }
        };
        if constraints.iter().any(|(k, _)| *k == key) {
            return Err(format!("argument '{key}' constrained twice"));
        }
        let value = parse_value(raw)?;
        constraints.push((key, value));
    }

    Ok(if open {
        ArgSpec::AtLeast(constraints)
    } else {
        ArgSpec::Exact(constraints)
    })
}

/// Split on commas outside double quotes. Escapes are kept for `parse_value`.
fn split_items(inner: &str) -> Result<Vec<String>, String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in inner.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => items.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if in_quotes {
        return Err("unterminated quoted value".into());
    }
    items.push(current);
    Ok(items)
}

fn parse_value(raw: &str) -> Result<ValueMatch, String> {
    let raw = raw.trim();
    let Some(rest) = raw.strip_prefix('"') else {
        if raw.is_empty() {
            return Err("empty value; use \"\" to match an empty string".into());
        }
        if raw.contains('"') {
            return Err(format!("stray quote in value '{raw}'"));
        }
        return Ok(ValueMatch::Glob(raw.to_string()));
    };

    let (literal, rest) = take_quoted(rest)?;
    if !rest.trim().is_empty() {
        return Err(format!("unexpected text after quoted value in '{raw}'"));
    }
    Ok(ValueMatch::Literal(literal))
}

/// Read a quoted string whose opening quote is already consumed. Returns
/// the unescaped text and whatever follows the closing quote.
fn take_quoted(s: &str) -> Result<(String, &str), String> {
    let mut literal = String::new();
    let mut chars = s.chars();
    loop {
        match chars.next() {
            None => return Err("unterminated quoted value".into()),
            Some('"') => break,
            Some('\\') => match chars.next() {
                Some(c @ ('"' | '\\')) => literal.push(c),
                Some(c) => return Err(format!("unsupported escape '\\{c}'")),
                None => return Err("unterminated quoted value".into()),
            },
            Some(c) => literal.push(c),
        }
    }
    Ok((literal, chars.as_str()))
}

/// Render a call in pattern syntax. The result parses back into a pattern
/// that matches this call. Strings that would read as another JSON type are
/// quoted, so `id="3"` and `id=3` render differently.
pub fn format_call(capability: &str, arguments: &Arguments) -> String {
    let rendered: Vec<String> = arguments
        .iter()
        .map(|(key, value)| format!("{}={}", render_key(key), render_value(value)))
        .collect();
    format!("{capability}({})", rendered.join(", "))
}

fn render_key(key: &str) -> String {
    let plain = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if plain { key.to_string() } else { quote(key) }
}

fn render_value(value: &Value) -> String {
    let text = value_text(value);
    let reads_as_other_type = value.is_string()
        && serde_json::from_str::<Value>(&text).is_ok_and(|parsed| !parsed.is_string());
    let plain = !text.is_empty()
        && !reads_as_other_type
        && text.trim() == text
        && !text
            .chars()
            .any(|c| matches!(c, '*' | '"' | '\\' | ',' | '(' | ')'));
    if plain { text } else { quote(&text) }
}

fn quote(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('"');
    for c in text.chars() {
        if matches!(c, '"' | '\\') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// `*` matches any run of characters, including none.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let (first, rest) = parts.split_first().unwrap_or((&"", &[]));
    let Some(mut remaining) = value.strip_prefix(first) else {
        return false;
    };
    let (last, middle) = rest.split_last().unwrap_or((&"", &[]));
    for part in middle {
        if part.is_empty() {
            continue;
        }
        match remaining.find(part) {
            Some(index) => remaining = &remaining[index + part.len()..],
            None => return false,
        }
    }
    remaining.len() >= last.len() && remaining.ends_with(last)
}
