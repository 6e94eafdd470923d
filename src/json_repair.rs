//! Tolerant decoding of JSON payloads produced by language models.
//!
//! Payloads arrive fenced, truncated mid-value, with bare keys, trailing commas or
//! surrounded by prose. [`parse_tolerant`] tries a direct decode, then a repaired
//! decode, then the leading value, and finally bracketed substrings from the
//! longest down, up to a candidate cap.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::Value;

use crate::error::ParseError;

pub const DEFAULT_MAX_CANDIDATES: usize = 4096;

const MAX_REPAIR_ROUNDS: usize = 8;
const MAX_CANDIDATE_ENDPOINTS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepairKind {
    Truncated,
    MissingSeparator,
    MissingQuotes,
    MultipleValues,
    Unrecoverable,
}

pub trait RepairRecorder: Send + Sync {
    fn record(&self, kind: RepairKind);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecorder;

impl RepairRecorder for NoopRecorder {
    fn record(&self, _kind: RepairKind) {}
}

#[derive(Debug, Default)]
pub struct RepairStats {
    truncated: AtomicU64,
    missing_separator: AtomicU64,
    missing_quotes: AtomicU64,
    multiple_values: AtomicU64,
    unrecoverable: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairCounts {
    pub truncated: u64,
    pub missing_separator: u64,
    pub missing_quotes: u64,
    pub multiple_values: u64,
    pub unrecoverable: u64,
}

impl RepairCounts {
    pub fn total(&self) -> u64 {
        self.truncated
            + self.missing_separator
            + self.missing_quotes
            + self.multiple_values
            + self.unrecoverable
    }
}

impl RepairStats {
    pub fn snapshot(&self) -> RepairCounts {
        RepairCounts {
            truncated: self.truncated.load(Ordering::Relaxed),
            missing_separator: self.missing_separator.load(Ordering::Relaxed),
            missing_quotes: self.missing_quotes.load(Ordering::Relaxed),
            multiple_values: self.multiple_values.load(Ordering::Relaxed),
            unrecoverable: self.unrecoverable.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.truncated,
            &self.missing_separator,
            &self.missing_quotes,
            &self.multiple_values,
            &self.unrecoverable,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl RepairRecorder for RepairStats {
    fn record(&self, kind: RepairKind) {
        let counter = match kind {
            RepairKind::Truncated => &self.truncated,
            RepairKind::MissingSeparator => &self.missing_separator,
            RepairKind::MissingQuotes => &self.missing_quotes,
            RepairKind::MultipleValues => &self.multiple_values,
            RepairKind::Unrecoverable => &self.unrecoverable,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Byte range `[start, end]` over the raw text tried during exhaustive extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairCandidate {
    pub start: usize,
    pub end: usize,
}

impl RepairCandidate {
    pub fn span(&self) -> usize {
        self.end - self.start + 1
    }
}

/// Recovers one JSON value from model output: code fences are stripped, common
/// malformations repaired, and failing that, balanced substrings are tried longest
/// first.
///
/// Substring extraction is bounded, not exhaustive: at most 1024 bracket positions
/// are considered and at most [`DEFAULT_MAX_CANDIDATES`] candidates are decoded. Use
/// [`parse_tolerant_capped`] to choose a different candidate limit.
pub fn parse_tolerant(raw: &str, recorder: &dyn RepairRecorder) -> Result<Value, ParseError> {
    parse_tolerant_capped(raw, recorder, DEFAULT_MAX_CANDIDATES)
}

pub fn parse_tolerant_capped(
    raw: &str,
    recorder: &dyn RepairRecorder,
    max_candidates: usize,
) -> Result<Value, ParseError> {
    let text = strip_code_fence(raw).trim();
    if text.is_empty() {
        recorder.record(RepairKind::Unrecoverable);
        return Err(ParseError::Empty);
    }

    let err = match serde_json::from_str::<Value>(text) {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };
    let kind = classify(&err);
    recorder.record(kind);

    let repaired = repair(text);
    tracing::debug!(
        kind = ?kind,
        before = text.len(),
        after = repaired.len(),
        "repaired structured payload"
    );
    if let Ok(value) = serde_json::from_str::<Value>(&repaired) {
        return Ok(value);
    }

    if kind == RepairKind::MultipleValues
        && let Some(value) = leading_value(text)
    {
        return Ok(value);
    }

    if let Some(value) = extract_exhaustive(text, max_candidates) {
        return Ok(value);
    }

    recorder.record(RepairKind::Unrecoverable);
    tracing::warn!(len = text.len(), "no valid structure found");
    Err(ParseError::NoValidStructure)
}

fn classify(err: &serde_json::Error) -> RepairKind {
    if err.classify() == serde_json::error::Category::Eof {
        return RepairKind::Truncated;
    }
    let message = err.to_string();
    if message.contains("trailing characters") {
        RepairKind::MultipleValues
    } else if message.contains("key must be a string") {
        RepairKind::MissingQuotes
    } else {
        RepairKind::MissingSeparator
    }
}

fn leading_value(text: &str) -> Option<Value> {
    let mut values = serde_json::Deserializer::from_str(text).into_iter::<Value>();
    values.next()?.ok()?;
    let offset = values.byte_offset();
    tracing::debug!(
        kept = offset,
        dropped = text.len() - offset,
        "decoded leading value"
    );
    serde_json::from_str(&text[..offset]).ok()
}

/// Returns the body of a ```json fence if present, else of any fence, else the input.
pub fn strip_code_fence(raw: &str) -> &str {
    let lower = raw.to_ascii_lowercase();
    let open = lower
        .find("```json")
        .or_else(|| lower.find("```"));
    let Some(open) = open else {
        return raw;
    };
    let after_marker = &raw[open + 3..];
    let body_start = match after_marker.find('\n') {
        Some(idx) => open + 3 + idx + 1,
        None => return raw,
    };
    let body = &raw[body_start..];
    match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    }
}

fn extract_exhaustive(text: &str, max_candidates: usize) -> Option<Value> {
    for candidate in candidates(text).into_iter().take(max_candidates) {
        let slice = &text[candidate.start..=candidate.end];
        if let Ok(value) = serde_json::from_str::<Value>(slice) {
            tracing::debug!(start = candidate.start, end = candidate.end, "extracted value");
            return Some(value);
        }
        if let Ok(value) = serde_json::from_str::<Value>(&repair(slice)) {
            tracing::debug!(
                start = candidate.start,
                end = candidate.end,
                "extracted repaired value"
            );
            return Some(value);
        }
    }
    None
}

/// All opener/closer pairs, longest span first, earlier start first on ties.
pub fn candidates(text: &str) -> Vec<RepairCandidate> {
    let mut starts = Vec::new();
    let mut ends = Vec::new();
    for (idx, b) in text.bytes().enumerate() {
        match b {
            b'{' | b'[' => starts.push(idx),
            b'}' | b']' => ends.push(idx),
            _ => {}
        }
    }
    starts.truncate(MAX_CANDIDATE_ENDPOINTS);
    if ends.len() > MAX_CANDIDATE_ENDPOINTS {
        ends.drain(..ends.len() - MAX_CANDIDATE_ENDPOINTS);
    }

    let mut out = Vec::new();
    for &start in &starts {
        for &end in &ends {
            if end > start {
                out.push(RepairCandidate { start, end });
            }
        }
    }
    out.sort_by(|a, b| b.span().cmp(&a.span()).then(a.start.cmp(&b.start)));
    out
}

/// Rewrites common malformations into decodable JSON.
///
/// Valid input is returned unchanged and `repair(repair(x)) == repair(x)`.
pub fn repair(text: &str) -> String {
    if serde_json::from_str::<serde::de::IgnoredAny>(text).is_ok() {
        return text.to_owned();
    }
    let mut current = text.to_owned();
    for _ in 0..MAX_REPAIR_ROUNDS {
        let next = repair_round(&current);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Str(String),
    Open(char),
    Close(char),
    Comma,
    Colon,
    Atom(String),
    Space(String),
}

impl Token {
    fn is_value_end(&self) -> bool {
        matches!(self, Token::Str(_) | Token::Atom(_) | Token::Close(_))
    }

    fn is_value_start(&self) -> bool {
        matches!(self, Token::Str(_) | Token::Atom(_) | Token::Open(_))
    }
}

fn repair_round(text: &str) -> String {
    let mut tokens = tokenize(text);
    quote_bare_keys(&mut tokens);
    insert_missing_commas(&mut tokens);
    fill_dangling_colons(&mut tokens);
    complete_truncated_atom(&mut tokens);
    drop_dangling_keys(&mut tokens);
    strip_trailing_commas(&mut tokens);
    rebalance(&mut tokens);
    render(&tokens)
}

fn tokenize(text: &str) -> Vec<Token> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0usize;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' => {
                let (literal, next) = read_string(&chars, i, '"');
                tokens.push(Token::Str(literal));
                i = next;
            }
            '\'' if closing_single_quote(&chars, i).is_some() => {
                let (literal, next) = read_string(&chars, i, '\'');
                tokens.push(Token::Str(literal));
                i = next;
            }
            '{' | '[' => {
                tokens.push(Token::Open(c));
                i += 1;
            }
            '}' | ']' => {
                tokens.push(Token::Close(c));
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            c if c.is_whitespace() => {
                let start = i;
                while i < chars.len() && chars[i].is_whitespace() {
                    i += 1;
                }
                tokens.push(Token::Space(chars[start..i].iter().collect()));
            }
            _ => {
                let start = i;
                while i < chars.len() && !is_atom_boundary(chars[i]) {
                    i += 1;
                }
                if i == start {
                    i += 1;
                }
                tokens.push(Token::Atom(chars[start..i].iter().collect()));
            }
        }
    }
    tokens
}

fn is_atom_boundary(c: char) -> bool {
    c.is_whitespace() || matches!(c, '"' | '{' | '}' | '[' | ']' | ',' | ':')
}

fn closing_single_quote(chars: &[char], open: usize) -> Option<usize> {
    let mut escaped = false;
    for (offset, &c) in chars[open + 1..].iter().enumerate() {
        match c {
            '\n' => return None,
            '\\' if !escaped => escaped = true,
            '\'' if !escaped => return Some(open + 1 + offset),
            _ => escaped = false,
        }
    }
    None
}

/// Reads a string literal starting at `open`, re-emitted as a double-quoted literal.
/// An unterminated literal is closed at end of input, dropping a dangling backslash.
fn read_string(chars: &[char], open: usize, quote: char) -> (String, usize) {
    let mut out = String::from('"');
    let mut i = open + 1;
    let mut escaped = false;
    while i < chars.len() {
        let c = chars[i];
        i += 1;
        if escaped {
            if quote == '\'' && c == '\'' {
                out.push('\'');
            } else {
                out.push('\\');
                out.push(c);
            }
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            c if c == quote => {
                out.push('"');
                return (out, i);
            }
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    (out, i)
}

fn render(tokens: &[Token]) -> String {
    let mut out = String::new();
    for token in tokens {
        match token {
            Token::Str(s) | Token::Atom(s) | Token::Space(s) => out.push_str(s),
            Token::Open(c) | Token::Close(c) => out.push(*c),
            Token::Comma => out.push(','),
            Token::Colon => out.push(':'),
        }
    }
    out
}

fn prev_significant(tokens: &[Token], idx: usize) -> Option<usize> {
    (0..idx).rev().find(|&i| !matches!(tokens[i], Token::Space(_)))
}

fn next_significant(tokens: &[Token], idx: usize) -> Option<usize> {
    (idx + 1..tokens.len()).find(|&i| !matches!(tokens[i], Token::Space(_)))
}

fn quote_bare_keys(tokens: &mut [Token]) {
    for idx in 0..tokens.len() {
        let Token::Atom(atom) = &tokens[idx] else {
            continue;
        };
        if atom.parse::<f64>().is_ok() {
            continue;
        }
        let after_opener = prev_significant(tokens, idx)
            .is_some_and(|p| matches!(tokens[p], Token::Open('{') | Token::Comma));
        let before_colon =
            next_significant(tokens, idx).is_some_and(|n| matches!(tokens[n], Token::Colon));
        if after_opener && before_colon {
            let quoted = serde_json::Value::String(atom.clone()).to_string();
            tokens[idx] = Token::Str(quoted);
        }
    }
}

fn insert_missing_commas(tokens: &mut Vec<Token>) {
    let mut idx = 0usize;
    while idx < tokens.len() {
        if tokens[idx].is_value_end()
            && let Some(next) = next_significant(tokens, idx)
            && tokens[next].is_value_start()
        {
            tokens.insert(idx + 1, Token::Comma);
        }
        idx += 1;
    }
}

fn fill_dangling_colons(tokens: &mut Vec<Token>) {
    let mut idx = 0usize;
    while idx < tokens.len() {
        if tokens[idx] == Token::Colon {
            let dangling = match next_significant(tokens, idx) {
                None => true,
                Some(next) => matches!(tokens[next], Token::Close(_) | Token::Comma),
            };
            if dangling {
                tokens.insert(idx + 1, Token::Atom("null".to_owned()));
            }
        }
        idx += 1;
    }
}

fn complete_truncated_atom(tokens: &mut Vec<Token>) {
    let Some(last) = prev_significant(tokens, tokens.len()) else {
        return;
    };
    let Token::Atom(atom) = &tokens[last] else {
        return;
    };
    for literal in ["true", "false", "null"] {
        if atom.len() < literal.len() && literal.starts_with(atom.as_str()) {
            tokens[last] = Token::Atom(literal.to_owned());
            return;
        }
    }
    let trimmed = atom.trim_end_matches(['.', '-', '+', 'e', 'E']);
    if trimmed.len() != atom.len()
        && !trimmed.is_empty()
        && trimmed.parse::<f64>().is_ok()
        && atom.parse::<f64>().is_err()
    {
        tokens[last] = Token::Atom(trimmed.to_owned());
    }
}

/// Removes an object key that has no colon before the object closes or input ends.
fn drop_dangling_keys(tokens: &mut Vec<Token>) {
    let mut stack: Vec<char> = Vec::new();
    let mut idx = 0usize;
    while idx < tokens.len() {
        if let Token::Open(c) = tokens[idx] {
            stack.push(c);
        } else if matches!(tokens[idx], Token::Close(_)) {
            stack.pop();
        } else if matches!(tokens[idx], Token::Str(_)) && stack.last() == Some(&'{') {
            let prev = prev_significant(tokens, idx);
            let key_position =
                prev.is_some_and(|p| matches!(tokens[p], Token::Open('{') | Token::Comma));
            let dangling = match next_significant(tokens, idx) {
                None => true,
                Some(next) => matches!(tokens[next], Token::Close('}')),
            };
            if key_position && dangling {
                tokens.remove(idx);
                if let Some(p) = prev
                    && tokens[p] == Token::Comma
                {
                    tokens.remove(p);
                    idx = p;
                }
                continue;
            }
        }
        idx += 1;
    }
}

fn strip_trailing_commas(tokens: &mut Vec<Token>) {
    let mut idx = 0usize;
    while idx < tokens.len() {
        if tokens[idx] == Token::Comma {
            let trailing = match next_significant(tokens, idx) {
                None => true,
                Some(next) => matches!(tokens[next], Token::Close(_)),
            };
            if trailing {
                tokens.remove(idx);
                continue;
            }
        }
        idx += 1;
    }
}

fn closer_for(open: char) -> char {
    if open == '{' { '}' } else { ']' }
}

fn rebalance(tokens: &mut Vec<Token>) {
    let mut stack: Vec<char> = Vec::new();
    let mut out = Vec::with_capacity(tokens.len());
    for token in tokens.drain(..) {
        match token {
            Token::Open(c) => {
                stack.push(c);
                out.push(Token::Open(c));
            }
            Token::Close(c) => {
                let Some(pos) = stack.iter().rposition(|&open| closer_for(open) == c) else {
                    continue;
                };
                while stack.len() > pos + 1 {
                    if let Some(open) = stack.pop() {
                        out.push(Token::Close(closer_for(open)));
                    }
                }
                stack.pop();
                out.push(Token::Close(c));
            }
            other => out.push(other),
        }
    }
    while let Some(open) = stack.pop() {
        out.push(Token::Close(closer_for(open)));
    }
    *tokens = out;
}
