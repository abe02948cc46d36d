//! Test-anything-protocol recording for a single scenario.
//!
//! ```text
//! 1..2
//! ok 1 - 02-conflicting-syntax-validate
//! not ok 2 - 02-conflicting-syntax-grep
//! ```
//!
//! Each scenario owns one `TapRecorder`. The plan is fixed at construction,
//! before any assertion runs, and every recorded assertion takes the next
//! index from an atomic counter.

pub mod pattern;

pub use pattern::PatternKind;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// One recorded assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapLine {
    pub index: usize,
    pub ok: bool,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<String>,
}

impl fmt::Display for TapLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.ok { "ok" } else { "not ok" };
        match self.skip {
            Some(ref reason) => write!(f, "{} {} # SKIP {}", status, self.index, reason),
            None => write!(f, "{} {} - {}", status, self.index, self.description),
        }
    }
}

/// Per-scenario assertion counter and line log.
#[derive(Debug)]
pub struct TapRecorder {
    plan: usize,
    counter: AtomicUsize,
    lines: Mutex<Vec<TapLine>>,
}

impl TapRecorder {
    pub fn new(plan: usize) -> Self {
        Self {
            plan,
            counter: AtomicUsize::new(0),
            lines: Mutex::new(Vec::new()),
        }
    }

    /// Declared number of assertions.
    pub fn plan(&self) -> usize {
        self.plan
    }

    /// The `1..N` plan line.
    pub fn plan_line(&self) -> String {
        format!("1..{}", self.plan)
    }

    /// Record one assertion and return its 1-based index.
    pub fn record(&self, ok: bool, description: impl Into<String>) -> usize {
        self.push(ok, description.into(), None)
    }

    /// Record `count` skipped assertions. Skips count as executed and passing.
    pub fn skip(&self, count: usize, reason: &str) {
        for _ in 0..count {
            self.push(true, String::new(), Some(reason.to_string()));
        }
    }

    fn push(&self, ok: bool, description: String, skip: Option<String>) -> usize {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let line = TapLine {
            index,
            ok,
            description,
            skip,
        };
        tracing::debug!("[Tap] {}", line);
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line);
        }
        index
    }

    /// Number of assertions executed so far.
    pub fn executed(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }

    /// Number of `not ok` lines.
    pub fn failed(&self) -> usize {
        self.lines().iter().filter(|l| !l.ok).count()
    }

    /// Whether the executed count matches the plan.
    pub fn plan_satisfied(&self) -> bool {
        self.executed() == self.plan
    }

    /// Recorded lines in index order.
    pub fn lines(&self) -> Vec<TapLine> {
        let mut lines = self
            .lines
            .lock()
            .map(|l| l.clone())
            .unwrap_or_default();
        lines.sort_by_key(|l| l.index);
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices_are_sequential() {
        let tap = TapRecorder::new(3);
        assert_eq!(tap.record(true, "a"), 1);
        assert_eq!(tap.record(false, "b"), 2);
        assert_eq!(tap.record(true, "c"), 3);
        assert_eq!(tap.executed(), 3);
        assert_eq!(tap.failed(), 1);
        assert!(tap.plan_satisfied());
    }

    #[test]
    fn test_line_format() {
        let tap = TapRecorder::new(3);
        tap.record(true, "scenario-validate");
        tap.record(false, "scenario-grep");
        tap.skip(1, "no display");
        let rendered: Vec<String> = tap.lines().iter().map(|l| l.to_string()).collect();
        assert_eq!(tap.plan_line(), "1..3");
        assert_eq!(
            rendered,
            vec![
                "ok 1 - scenario-validate",
                "not ok 2 - scenario-grep",
                "ok 3 # SKIP no display",
            ]
        );
    }

    #[test]
    fn test_plan_mismatch_detected() {
        let tap = TapRecorder::new(2);
        tap.record(true, "only one");
        assert!(!tap.plan_satisfied());
    }

    #[test]
    fn test_concurrent_records_get_unique_indices() {
        let tap = std::sync::Arc::new(TapRecorder::new(64));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let tap = tap.clone();
                std::thread::spawn(move || {
                    for i in 0..8 {
                        tap.record(true, format!("t{}-{}", t, i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let indices: Vec<usize> = tap.lines().iter().map(|l| l.index).collect();
        assert_eq!(indices, (1..=64).collect::<Vec<_>>());
    }
}
