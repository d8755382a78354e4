//! Error types with precise source locations
//!
//! Parse and evaluation errors carry positions in the coordinates of the
//! source the evaluator actually saw. `SourceMap` translates those back into
//! the coordinates of the user's revision before anything is reported.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Position in source code (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} at {position}")]
pub struct ParseError {
    pub message: String,
    pub position: Position,
}

impl ParseError {
    pub fn new(message: impl Into<String>, position: Position) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }
}

/// One active closure call at the time an error was raised
#[derive(Debug, Clone, PartialEq)]
pub struct StackFrame {
    pub function: String,
    pub position: Option<Position>,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct EvalError {
    pub message: String,
    pub position: Option<Position>,
    /// Innermost frame first
    pub stack: Vec<StackFrame>,
}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            position: None,
            stack: Vec::new(),
        }
    }
}

/// Maps positions in the wrapped program back onto the user's revision.
///
/// The execution context prepends exactly `PREFIX_LINES` lines (the callable
/// header) and appends a closing line, so user line `n` is wrapped line
/// `n + PREFIX_LINES` with the column unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceMap {
    line_lengths: Vec<usize>,
}

impl SourceMap {
    pub const PREFIX_LINES: usize = 1;

    pub fn new(code: &str) -> Self {
        Self {
            line_lengths: code.split('\n').map(|line| line.chars().count()).collect(),
        }
    }

    pub fn line_count(&self) -> usize {
        self.line_lengths.len()
    }

    pub fn to_user(&self, position: Position) -> Position {
        if position.line <= Self::PREFIX_LINES {
            return Position::new(1, 1);
        }
        let line = position.line - Self::PREFIX_LINES;
        if line > self.line_lengths.len() {
            // Positions inside the closing line point at the end of the user's code
            let last = self.line_lengths.len();
            return Position::new(last, self.line_lengths[last - 1] + 1);
        }
        Position::new(line, position.column)
    }
}

/// Error taxonomy for the hot-swap sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Revision cannot be parsed; the running process is untouched
    Syntax,
    /// Revision parsed but failed during its initial evaluation
    Init,
    /// A committed generation's per-frame callback failed
    Frame,
    /// A timer, interval or listener callback of the active generation failed
    Async,
    /// A disposer or cleanup step failed (logged, never reported)
    Teardown,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::Syntax => "syntax error",
            FaultKind::Init => "runtime error",
            FaultKind::Frame => "frame error",
            FaultKind::Async => "callback error",
            FaultKind::Teardown => "teardown error",
        }
    }
}

/// Structured, line-addressable error as reported to the editor boundary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptError {
    pub kind: FaultKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<usize>,
}

impl ScriptError {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
            line: None,
            column: None,
        }
    }

    pub fn from_parse(error: &ParseError, map: &SourceMap) -> Self {
        let position = map.to_user(error.position);
        Self {
            kind: FaultKind::Syntax,
            message: error.message.clone(),
            stack: None,
            line: Some(position.line),
            column: Some(position.column),
        }
    }

    pub fn from_eval(kind: FaultKind, error: &EvalError, map: &SourceMap) -> Self {
        let position = error.position.map(|p| map.to_user(p));
        let stack = if error.stack.is_empty() {
            None
        } else {
            let lines: Vec<String> = error
                .stack
                .iter()
                .map(|frame| match frame.position {
                    Some(p) => {
                        let p = map.to_user(p);
                        format!("at {} (line {}, column {})", frame.function, p.line, p.column)
                    }
                    None => format!("at {}", frame.function),
                })
                .collect();
            Some(lines.join("\n"))
        };
        Self {
            kind,
            message: error.message.clone(),
            stack,
            line: position.map(|p| p.line),
            column: position.map(|p| p.column),
        }
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)?;
        if let (Some(line), Some(column)) = (self.line, self.column) {
            write!(f, " (line {}, column {})", line, column)?;
        }
        Ok(())
    }
}

/// Errors surfaced by the sandbox API itself (not by user code)
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("supervisor has been disposed")]
    Disposed,

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_map_shifts_past_prefix() {
        let map = SourceMap::new("(define x 1)\n(define y (+ x 1))");
        assert_eq!(map.line_count(), 2);
        assert_eq!(map.to_user(Position::new(2, 4)), Position::new(1, 4));
        assert_eq!(map.to_user(Position::new(3, 11)), Position::new(2, 11));
    }

    #[test]
    fn test_source_map_clamps_wrapper_lines() {
        let map = SourceMap::new("(define x");
        // Header line
        assert_eq!(map.to_user(Position::new(1, 7)), Position::new(1, 1));
        // Closing line reported as end of user code
        assert_eq!(map.to_user(Position::new(3, 2)), Position::new(1, 10));
    }

    #[test]
    fn test_script_error_renders_stack() {
        let map = SourceMap::new("a\nb\nc");
        let error = EvalError {
            message: "boom".to_string(),
            position: Some(Position::new(3, 2)),
            stack: vec![StackFrame {
                function: "draw".to_string(),
                position: Some(Position::new(4, 1)),
            }],
        };
        let reported = ScriptError::from_eval(FaultKind::Frame, &error, &map);
        assert_eq!(reported.line, Some(2));
        assert_eq!(reported.column, Some(2));
        assert_eq!(reported.stack.as_deref(), Some("at draw (line 3, column 1)"));
        assert_eq!(reported.to_string(), "frame error: boom (line 2, column 2)");
    }
}
