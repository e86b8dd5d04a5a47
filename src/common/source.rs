//! Source positions and byte-offset-to-line/column resolution.
//!
//! Tokens and AST nodes carry byte-offset spans into the original source;
//! the `LineIndex` turns an offset into a 1-based line/column pair for
//! diagnostics and for the runtime source map.

/// A byte-offset span in source code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn dummy() -> Self {
        Self { start: 0, end: 0 }
    }
}

/// A human-readable source location (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Maps byte offsets in a source buffer to line/column pairs.
///
/// Line starts are collected once up front; resolution is a binary search
/// over that table.
pub struct LineIndex {
    /// Byte offset of the first character of each line, line 1 first.
    line_starts: Vec<u32>,
}

impl LineIndex {
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0u32];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i as u32 + 1);
            }
        }
        Self { line_starts }
    }

    /// Resolve a byte offset to its 1-based line and column.
    pub fn resolve(&self, offset: u32) -> SourceLocation {
        let line_idx = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        SourceLocation {
            line: line_idx as u32 + 1,
            column: offset - self.line_starts[line_idx] + 1,
        }
    }

    /// Resolve the start of a span.
    pub fn resolve_span(&self, span: Span) -> SourceLocation {
        self.resolve(span.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_lines_and_columns() {
        let idx = LineIndex::new("ab\ncd\n\nx");
        assert_eq!(idx.resolve(0), SourceLocation { line: 1, column: 1 });
        assert_eq!(idx.resolve(1), SourceLocation { line: 1, column: 2 });
        assert_eq!(idx.resolve(3), SourceLocation { line: 2, column: 1 });
        assert_eq!(idx.resolve(6), SourceLocation { line: 3, column: 1 });
        assert_eq!(idx.resolve(7), SourceLocation { line: 4, column: 1 });
    }

    #[test]
    fn offset_past_last_newline_lands_on_last_line() {
        let idx = LineIndex::new("a\nbc");
        assert_eq!(idx.resolve(3), SourceLocation { line: 2, column: 2 });
    }
}
