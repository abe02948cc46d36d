//! Multi-line aware pattern matching over captured output.
//!
//! Scenario authors write long diagnostics across several source lines using
//! backslash continuations:
//!
//! ```text
//! Conflicting syntax: pre-8 "[scheduling][dependencies][X]graph" \
//! vs 8 "[scheduling][graph]X"
//! ```
//!
//! A continuation (`\` immediately followed by a line break) stands for a line
//! break in the captured stream, so the pattern above matches a two-line
//! diagnostic. Line endings are normalised to `\n` on both sides.

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};

/// How a pattern is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// Plain substring search (default)
    #[default]
    Literal,
    /// `regex` crate syntax, compiled in multi-line mode
    Regex,
}

/// Normalise `\r\n` to `\n`.
pub fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n")
}

/// Turn backslash-newline continuations into embedded newlines.
pub fn normalize_continuations(pattern: &str) -> String {
    let pattern = normalize_newlines(pattern);
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek() == Some(&'\n') {
            chars.next();
            out.push('\n');
        } else {
            out.push(c);
        }
    }
    out
}

/// Match a pattern against captured bytes.
///
/// Invalid UTF-8 in the captured stream is replaced, never rejected. A regex
/// that fails to compile is a `Parse` error rather than a failed match.
pub fn matches(pattern: &str, kind: PatternKind, captured: &[u8]) -> HarnessResult<bool> {
    let haystack = normalize_newlines(&String::from_utf8_lossy(captured));
    let needle = normalize_continuations(pattern);

    match kind {
        PatternKind::Literal => Ok(haystack.contains(&needle)),
        PatternKind::Regex => {
            let re = RegexBuilder::new(&needle)
                .multi_line(true)
                .build()
                .map_err(|e| HarnessError::Parse(format!("Invalid pattern '{}': {}", pattern, e)))?;
            Ok(re.is_match(&haystack))
        }
    }
}

/// Compare a whole captured stream with expected text, ignoring trailing
/// whitespace at the end of the stream.
pub fn equals(expected: &str, captured: &[u8]) -> bool {
    let actual = normalize_newlines(&String::from_utf8_lossy(captured));
    let expected = normalize_continuations(expected);
    actual.trim_end() == expected.trim_end()
}
