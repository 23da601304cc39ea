//! Verification of kernel output against the expectations it prints itself.
//!
//! Kernel tests announce what they expect and what they got with three line
//! prefixes. `[EXPECTED]: ` / `[ ACTUAL ]: ` pairs are compared pointwise.
//! Consecutive `[EXPECTED BLOCK]: ` lines form a block that is compared line
//! by line against the lines that follow it, whatever they are.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, BufRead};

pub const PREFIX_BLOCK_EXPECTED: &str = "[EXPECTED BLOCK]: ";
pub const PREFIX_EXPECTED: &str = "[EXPECTED]: ";
pub const PREFIX_ACTUAL: &str = "[ ACTUAL ]: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchKind {
    /// Expected and actual text differ
    ValueMismatch,
    /// An expectation was superseded by another before any actual value
    MissingActual,
    /// An actual value arrived with nothing pending
    MissingExpected,
    /// An expected block ran out of actual lines
    BlockTruncated,
}

/// One verification failure. Line numbers are 1-based positions in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub kind: MismatchKind,
    pub expected_text: Option<String>,
    pub expected_line: Option<usize>,
    pub actual_text: Option<String>,
    pub actual_line: Option<usize>,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let expected = escape(self.expected_text.as_deref().unwrap_or_default());
        let actual = escape(self.actual_text.as_deref().unwrap_or_default());
        let expected_line = self.expected_line.unwrap_or_default();
        let actual_line = self.actual_line.unwrap_or_default();
        match self.kind {
            MismatchKind::ValueMismatch => write!(
                f,
                "Mismatch on lines {expected_line} and {actual_line} (\"{expected}\" != \"{actual}\")"
            ),
            MismatchKind::MissingActual => write!(
                f,
                "Missing actual value for expected value on line {expected_line} ({expected})."
            ),
            MismatchKind::MissingExpected => write!(
                f,
                "Missing expected value for actual value on line {actual_line} ({actual})."
            ),
            MismatchKind::BlockTruncated if self.actual_line.is_some() => write!(
                f,
                "Actual block on line {expected_line} ended too early on {actual_line} (\"{expected}\" not matched)."
            ),
            MismatchKind::BlockTruncated => write!(
                f,
                "Not enough actual lines for expected block at {expected_line} (\"{expected}\" not matched)."
            ),
        }
    }
}

/// Escapes characters outside printable ASCII as `\xNN`.
pub fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if (' '..='~').contains(&c) {
            escaped.push(c);
        } else {
            escaped.push_str(&format!("\\x{:02x}", c as u32));
        }
    }
    escaped
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Mode {
    #[default]
    None,
    /// Block lines are still being collected
    BlockOpen,
    /// Block is complete and being matched; only while entries remain
    BlockFrozen,
}

/// Line-by-line matcher state. A fresh matcher is needed per stream.
#[derive(Debug, Default)]
pub struct Matcher {
    mode: Mode,
    pending_single: Option<(String, usize)>,
    pending_block: VecDeque<(String, usize)>,
    line_number: usize,
    mismatches: Vec<Mismatch>,
}

impl Matcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes the next line of the stream.
    pub fn feed(&mut self, line: &str) {
        self.line_number += 1;
        let line = line.trim_end();

        if let Some(text) = line.strip_prefix(PREFIX_BLOCK_EXPECTED) {
            if self.mode == Mode::BlockFrozen {
                if let Some((expected, expected_line)) = self.pending_block.front() {
                    self.mismatches.push(Mismatch {
                        kind: MismatchKind::BlockTruncated,
                        expected_text: Some(expected.clone()),
                        expected_line: Some(*expected_line),
                        actual_text: None,
                        actual_line: Some(self.line_number - 1),
                    });
                }
                self.pending_block.clear();
            }
            self.pending_block.push_back((text.to_string(), self.line_number));
            self.mode = Mode::BlockOpen;
            return;
        }

        if let Some((expected, expected_line)) = self.pending_block.pop_front() {
            self.mode = Mode::BlockFrozen;
            if line != expected {
                self.mismatches.push(Mismatch {
                    kind: MismatchKind::ValueMismatch,
                    expected_text: Some(expected),
                    expected_line: Some(expected_line),
                    actual_text: Some(line.to_string()),
                    actual_line: Some(self.line_number),
                });
            }
            if self.pending_block.is_empty() {
                self.mode = Mode::None;
            }
            return;
        }

        if let Some(text) = line.strip_prefix(PREFIX_EXPECTED) {
            if let Some((expected, expected_line)) = self.pending_single.take() {
                self.mismatches.push(Mismatch {
                    kind: MismatchKind::MissingActual,
                    expected_text: Some(expected),
                    expected_line: Some(expected_line),
                    actual_text: None,
                    actual_line: None,
                });
            }
            self.pending_single = Some((text.to_string(), self.line_number));
        } else if let Some(actual) = line.strip_prefix(PREFIX_ACTUAL) {
            match self.pending_single.take() {
                None => self.mismatches.push(Mismatch {
                    kind: MismatchKind::MissingExpected,
                    expected_text: None,
                    expected_line: None,
                    actual_text: Some(actual.to_string()),
                    actual_line: Some(self.line_number),
                }),
                Some((expected, expected_line)) if expected != actual => {
                    self.mismatches.push(Mismatch {
                        kind: MismatchKind::ValueMismatch,
                        expected_text: Some(expected),
                        expected_line: Some(expected_line),
                        actual_text: Some(actual.to_string()),
                        actual_line: Some(self.line_number),
                    })
                }
                Some(_) => {}
            }
        }
    }

    /// Ends the stream and returns every mismatch found.
    ///
    /// A single expectation still pending here is not reported; only being
    /// superseded by another `[EXPECTED]: ` line counts as a missing actual.
    pub fn finish(mut self) -> Vec<Mismatch> {
        if let Some((expected, expected_line)) = self.pending_block.pop_front() {
            self.mismatches.push(Mismatch {
                kind: MismatchKind::BlockTruncated,
                expected_text: Some(expected),
                expected_line: Some(expected_line),
                actual_text: None,
                actual_line: None,
            });
        }
        self.mismatches
    }
}

/// Verifies a whole stream of lines.
pub fn verify<I, S>(lines: I) -> Vec<Mismatch>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut matcher = Matcher::new();
    for line in lines {
        matcher.feed(line.as_ref());
    }
    matcher.finish()
}

/// Verifies a stream read from `reader`, replacing invalid UTF-8.
pub fn verify_reader<R: BufRead>(mut reader: R) -> io::Result<Vec<Mismatch>> {
    let mut matcher = Matcher::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        matcher.feed(&String::from_utf8_lossy(&buf));
    }
    Ok(matcher.finish())
}

pub fn passed(mismatches: &[Mismatch]) -> bool {
    mismatches.is_empty()
}
