//! One-line summaries of task output.
//!
//! Summaries feed gate context and task-summary events. Dependents always
//! receive the full text, never the summary.

use regex::Regex;
use std::sync::LazyLock;

/// Default lookahead window for the first sentence.
pub const DEFAULT_SUMMARY_LIMIT: usize = 160;

const ELLIPSIS: &str = "...";

static HEADING_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*#+[^\n]*(\n|$)").unwrap());

static HEADING_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|\n)\s*#+\s*").unwrap());

static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Produce a clean one-line summary of agent output.
///
/// Leading heading lines are dropped (unless the text is nothing but
/// headings), remaining heading markers become spaces, whitespace runs
/// collapse to one space, and the result is cut at the first sentence
/// terminator inside the first `limit` characters. Without a terminator the
/// text is hard-truncated at `limit` characters with `...` appended.
pub fn summarize(text: &str, limit: usize) -> String {
    let mut body = text;
    while let Some(m) = HEADING_LINE_RE.find(body) {
        let rest = &body[m.end()..];
        if rest.trim().is_empty() {
            break;
        }
        body = rest;
    }

    let body = HEADING_MARKER_RE.replace_all(body, " ");
    let body = WHITESPACE_RE.replace_all(&body, " ");
    let body = body.trim();

    if let Some(end) = first_sentence_end(body, limit) {
        return body[..end].to_string();
    }

    match body.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}{}", &body[..cut], ELLIPSIS),
        None => body.to_string(),
    }
}

/// Byte offset just past the first `.`, `!` or `?` that ends a sentence
/// within the first `limit` characters.
fn first_sentence_end(text: &str, limit: usize) -> Option<usize> {
    for (i, c) in text.char_indices().take(limit) {
        if i == 0 || !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let end = i + c.len_utf8();
        match text[end..].chars().next() {
            None => return Some(end),
            Some(next) if next.is_whitespace() => return Some(end),
            _ => {}
        }
    }
    None
}
