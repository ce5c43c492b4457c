//! Error kinds, the bounded error list and tracebacks.
//!
//! Errors produced anywhere in the pipeline are appended to a shared
//! `ErrorList`. The list is bounded: once full, further errors are dropped
//! on the floor rather than reallocating during error handling.

use crate::pos::Pos;
use std::fmt;

/// Most errors the list will hold at once.
pub const MAX_ERRORS: usize = 100;
/// Messages longer than this are truncated when queued.
pub const MAX_MESSAGE_LEN: usize = 255;

/// Stable error tags, also part of the embedding API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorKind {
    #[default]
    None,
    Parsing,
    Compilation,
    Runtime,
    Timeout,
    Allocation,
    User,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::None => "NONE",
            ErrorKind::Parsing => "PARSING",
            ErrorKind::Compilation => "COMPILATION",
            ErrorKind::Runtime => "RUNTIME",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Allocation => "ALLOCATION",
            ErrorKind::User => "USER",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One frame of a captured traceback, innermost first.
#[derive(Debug, Clone)]
pub struct TracebackItem {
    pub function_name: String,
    pub pos: Pos,
}

/// Call-stack snapshot attached to runtime errors.
#[derive(Debug, Clone, Default)]
pub struct Traceback {
    pub items: Vec<TracebackItem>,
}

impl Traceback {
    pub fn new() -> Self {
        Traceback::default()
    }

    pub fn append(&mut self, function_name: &str, pos: Pos) {
        self.items.push(TracebackItem {
            function_name: function_name.to_string(),
            pos,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl fmt::Display for Traceback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for item in &self.items {
            if item.pos.is_valid() {
                writeln!(f, "\tat {} ({})", item.function_name, item.pos)?;
            } else {
                writeln!(f, "\tat {}", item.function_name)?;
            }
        }
        Ok(())
    }
}

/// A position-annotated error with an optional traceback.
#[derive(Debug, Clone)]
pub struct ScriptError {
    pub kind: ErrorKind,
    pub message: String,
    pub pos: Pos,
    pub traceback: Option<Traceback>,
}

impl ScriptError {
    pub fn new(kind: ErrorKind, pos: Pos, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.len() > MAX_MESSAGE_LEN {
            message.truncate(MAX_MESSAGE_LEN);
        }
        ScriptError {
            kind,
            message,
            pos,
            traceback: None,
        }
    }

    pub fn parsing(pos: Pos, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parsing, pos, message)
    }

    pub fn compilation(pos: Pos, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Compilation, pos, message)
    }

    pub fn runtime(pos: Pos, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, pos, message)
    }

    pub fn timeout(pos: Pos, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, pos, message)
    }

    /// Render the error the way the CLI prints it, including the offending
    /// source line and the traceback when available.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        if self.pos.is_valid() {
            out.push_str(&format!(
                "{} ERROR in \"{}\" on {}:{}: {}\n",
                self.kind,
                self.pos.file_path(),
                self.pos.line + 1,
                self.pos.column + 1,
                self.message
            ));
            if let Some(line) = self.pos.source_line() {
                out.push_str(line);
                out.push('\n');
                for _ in 0..self.pos.column.max(0) {
                    out.push(' ');
                }
                out.push_str("^\n");
            }
        } else {
            out.push_str(&format!("{} ERROR: {}\n", self.kind, self.message));
        }
        if let Some(tb) = &self.traceback {
            out.push_str("Traceback:\n");
            out.push_str(&tb.to_string());
        }
        out
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.pos.is_valid() {
            write!(f, "{}: {} ({})", self.kind, self.message, self.pos)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for ScriptError {}

/// Bounded error queue.
#[derive(Debug, Default)]
pub struct ErrorList {
    errors: Vec<ScriptError>,
}

impl ErrorList {
    pub fn new() -> Self {
        ErrorList::default()
    }

    /// Queue an error; silently dropped once the list is full.
    pub fn add(&mut self, err: ScriptError) {
        if self.errors.len() >= MAX_ERRORS {
            return;
        }
        self.errors.push(err);
    }

    pub fn clear(&mut self) {
        self.errors.clear();
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn get(&self, ix: usize) -> Option<&ScriptError> {
        self.errors.get(ix)
    }

    pub fn last(&self) -> Option<&ScriptError> {
        self.errors.last()
    }

    pub fn last_mut(&mut self) -> Option<&mut ScriptError> {
        self.errors.last_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScriptError> {
        self.errors.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_is_bounded() {
        let mut list = ErrorList::new();
        for i in 0..(MAX_ERRORS + 10) {
            list.add(ScriptError::runtime(Pos::invalid(), format!("e{i}")));
        }
        assert_eq!(list.len(), MAX_ERRORS);
        assert_eq!(list.last().unwrap().message, format!("e{}", MAX_ERRORS - 1));
    }

    #[test]
    fn messages_are_truncated() {
        let long = "x".repeat(1000);
        let err = ScriptError::runtime(Pos::invalid(), long);
        assert_eq!(err.message.len(), MAX_MESSAGE_LEN);
    }

    #[test]
    fn traceback_renders_innermost_first() {
        let mut tb = Traceback::new();
        tb.append("inner", Pos::invalid());
        tb.append("main", Pos::invalid());
        let text = tb.to_string();
        let inner_at = text.find("inner").unwrap();
        let main_at = text.find("main").unwrap();
        assert!(inner_at < main_at);
    }
}
