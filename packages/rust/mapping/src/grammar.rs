//! Line-oriented mapping grammar.
//!
//! ```text
//! Block  := "SourceField:" FieldName Action+
//! Action := "Result:" CategoryName "Field:" FieldName (";" FieldName)*
//! ```
//!
//! Keywords are case-insensitive. Blank lines and lines starting with `#`
//! are ignored. This scanner is the only place the grammar is encoded: both
//! strict validation and tolerant runtime parsing consume its output.

use regex::Regex;
use std::sync::LazyLock;

use crate::MappingError;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// `Result:` / `Field:` pair as written, before field resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawAction {
    pub line: usize,
    pub category: String,
    pub fields: Vec<String>,
}

/// A syntactically complete block, before field resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawBlock {
    pub line: usize,
    pub source_field: String,
    pub actions: Vec<RawAction>,
}

/// Output of one scan: well-formed blocks plus every sequencing problem.
/// Blocks that contained a sequencing problem are not in `blocks`.
#[derive(Debug, Default)]
pub(crate) struct Scan {
    pub blocks: Vec<RawBlock>,
    pub errors: Vec<MappingError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    /// Between blocks. `resync` suppresses repeated errors while skipping
    /// the rest of a broken block.
    ExpectSourceField { resync: bool },
    /// Inside a block; `empty` until its first complete action.
    ExpectResultOrSourceField { empty: bool },
    /// A `Result:` line was read and needs its `Field:` line.
    ExpectField { category: String, line: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Keyword {
    SourceField,
    Result,
    Field,
}

/// Matches `Keyword: value`.
static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(sourcefield|result|field)\s*:\s*(.*)$").expect("mapping line regex")
});

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

struct Scanner {
    state: State,
    current: Option<RawBlock>,
    out: Scan,
}

impl Scanner {
    fn new() -> Self {
        Self {
            state: State::ExpectSourceField { resync: false },
            current: None,
            out: Scan::default(),
        }
    }

    fn error(&mut self, line: usize, message: impl Into<String>) {
        self.out.errors.push(MappingError::new(line, message));
    }

    /// Drop the block in progress and skip to the next `SourceField:`.
    fn abandon(&mut self) {
        self.current = None;
        self.state = State::ExpectSourceField { resync: true };
    }

    fn finish_block(&mut self) {
        if let Some(block) = self.current.take() {
            self.out.blocks.push(block);
        }
    }

    fn open_block(&mut self, line: usize, value: &str) {
        if value.is_empty() {
            self.error(line, "SourceField: is missing a field name");
            self.abandon();
            return;
        }
        self.current = Some(RawBlock {
            line,
            source_field: value.to_string(),
            actions: Vec::new(),
        });
        self.state = State::ExpectResultOrSourceField { empty: true };
    }

    fn empty_block_error(&mut self) {
        if let Some(block) = self.current.take() {
            self.error(
                block.line,
                format!(
                    "block for source field '{}' has no Result/Field actions",
                    block.source_field
                ),
            );
        }
    }

    fn step(&mut self, line: usize, keyword: Keyword, value: &str) {
        let state = std::mem::replace(&mut self.state, State::ExpectSourceField { resync: true });
        match (state, keyword) {
            (State::ExpectSourceField { .. }, Keyword::SourceField) => {
                self.open_block(line, value);
            }
            (State::ExpectSourceField { resync }, _) => {
                if !resync {
                    self.error(line, "expected SourceField: before Result:/Field: lines");
                }
                self.abandon();
            }

            (State::ExpectResultOrSourceField { empty }, Keyword::SourceField) => {
                if empty {
                    self.empty_block_error();
                } else {
                    self.finish_block();
                }
                self.open_block(line, value);
            }
            (State::ExpectResultOrSourceField { .. }, Keyword::Result) => {
                if value.is_empty() {
                    self.error(line, "Result: is missing a category name");
                    self.abandon();
                } else {
                    self.state = State::ExpectField {
                        category: value.to_string(),
                        line,
                    };
                }
            }
            (State::ExpectResultOrSourceField { .. }, Keyword::Field) => {
                self.error(line, "Field: without a preceding Result:");
                self.abandon();
            }

            (State::ExpectField { category, line: result_line }, Keyword::Field) => {
                let fields: Vec<String> = value
                    .split(';')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(String::from)
                    .collect();
                if fields.is_empty() {
                    self.error(line, "Field: is missing a field name");
                    self.abandon();
                    return;
                }
                if let Some(block) = self.current.as_mut() {
                    block.actions.push(RawAction {
                        line: result_line,
                        category,
                        fields,
                    });
                }
                self.state = State::ExpectResultOrSourceField { empty: false };
            }
            (State::ExpectField { category, line: result_line }, other) => {
                self.error(
                    result_line,
                    format!("Result: '{category}' is not followed by a Field: line"),
                );
                self.current = None;
                if other == Keyword::SourceField {
                    self.open_block(line, value);
                } else {
                    self.abandon();
                }
            }
        }
    }

    fn finish(mut self) -> Scan {
        match std::mem::replace(&mut self.state, State::ExpectSourceField { resync: false }) {
            State::ExpectResultOrSourceField { empty: true } => self.empty_block_error(),
            State::ExpectResultOrSourceField { empty: false } => self.finish_block(),
            State::ExpectField { category, line } => {
                self.error(
                    line,
                    format!("Result: '{category}' is not followed by a Field: line"),
                );
            }
            State::ExpectSourceField { .. } => {}
        }
        self.out
    }
}

/// Run the grammar state machine over `text`.
pub(crate) fn scan(text: &str) -> Scan {
    let mut scanner = Scanner::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let Some(caps) = LINE_RE.captures(trimmed) else {
            let resyncing = matches!(scanner.state, State::ExpectSourceField { resync: true });
            if !resyncing {
                scanner.error(line, format!("unrecognized line '{trimmed}'"));
            }
            scanner.abandon();
            continue;
        };

        let keyword = match caps[1].to_ascii_lowercase().as_str() {
            "sourcefield" => Keyword::SourceField,
            "result" => Keyword::Result,
            _ => Keyword::Field,
        };
        scanner.step(line, keyword, caps[2].trim());
    }

    scanner.finish()
}
