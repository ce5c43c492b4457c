//! Source files and positions.
//!
//! Every token, AST node and emitted bytecode byte carries a `Pos` so that
//! errors raised anywhere in the pipeline can be mapped back to the source.

use std::fmt;
use std::rc::Rc;

/// A compiled source file: its path plus a line table used when rendering
/// errors and tracebacks.
#[derive(Debug)]
pub struct SourceFile {
    pub path: String,
    /// Directory part of `path` including the trailing separator, or empty.
    /// Relative imports resolve against this.
    pub dir_path: String,
    pub lines: Vec<String>,
}

impl SourceFile {
    pub fn new(path: &str, source: &str) -> Self {
        let dir_path = match path.rfind('/') {
            Some(ix) => path[..=ix].to_string(),
            None => String::new(),
        };
        SourceFile {
            path: path.to_string(),
            dir_path,
            lines: source.lines().map(|l| l.to_string()).collect(),
        }
    }

    /// A file record with no source attached (used before the source is read,
    /// and for code compiled directly from a string).
    pub fn without_source(path: &str) -> Self {
        Self::new(path, "")
    }

    pub fn line(&self, ix: usize) -> Option<&str> {
        self.lines.get(ix).map(|s| s.as_str())
    }
}

/// A position inside a source file. Lines and columns are 0-indexed
/// internally and rendered 1-indexed.
#[derive(Debug, Clone, Default)]
pub struct Pos {
    pub file: Option<Rc<SourceFile>>,
    pub line: i32,
    pub column: i32,
}

impl Pos {
    pub fn new(file: Option<Rc<SourceFile>>, line: i32, column: i32) -> Self {
        Pos { file, line, column }
    }

    /// The "no position" marker used for host-initiated calls and synthetic
    /// code.
    pub fn invalid() -> Self {
        Pos {
            file: None,
            line: -1,
            column: -1,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.line >= 0 && self.column >= 0
    }

    pub fn file_path(&self) -> &str {
        self.file.as_deref().map(|f| f.path.as_str()).unwrap_or("")
    }

    /// The source line this position refers to, if the file kept one.
    pub fn source_line(&self) -> Option<&str> {
        let file = self.file.as_deref()?;
        if self.line < 0 {
            return None;
        }
        file.line(self.line as usize)
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return write!(f, "?");
        }
        match &self.file {
            Some(file) => write!(f, "{}:{}:{}", file.path, self.line + 1, self.column + 1),
            None => write!(f, "{}:{}", self.line + 1, self.column + 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_path_is_split_from_the_file_name() {
        let file = SourceFile::new("lib/util/strings.ape", "var x = 1");
        assert_eq!(file.dir_path, "lib/util/");
        let bare = SourceFile::new("main.ape", "");
        assert_eq!(bare.dir_path, "");
    }

    #[test]
    fn positions_render_one_indexed() {
        let file = Rc::new(SourceFile::new("t.ape", "var x = 1\nvar y = 2"));
        let pos = Pos::new(Some(file), 1, 4);
        assert_eq!(pos.to_string(), "t.ape:2:5");
        assert_eq!(pos.source_line(), Some("var y = 2"));
        assert_eq!(Pos::invalid().to_string(), "?");
    }
}
