//! Diagnostics and the public error union.
//!
//! Lexer and parser passes accumulate `Diagnostic`s and surface them
//! together when the pass ends, rendered as `line:col: error: message`
//! joined by newlines. Every other failure kind aborts the run at its
//! first occurrence.

use crate::common::source::SourceLocation;
use thiserror::Error;

/// A single positioned diagnostic collected during a front-end pass.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub location: SourceLocation,
    pub message: String,
}

impl Diagnostic {
    pub fn new(location: SourceLocation, message: impl Into<String>) -> Self {
        Self { location, message: message.into() }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: error: {}", self.location, self.message)
    }
}

/// Collects diagnostics for one pass.
///
/// Phases call `error()` as problems are found and keep going where
/// recovery is possible; the driver checks `has_errors()` after each pass
/// and converts the batch into a single `CoreError::Syntax`.
#[derive(Debug, Default)]
pub struct DiagnosticList {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticList {
    pub fn new() -> Self {
        Self { diagnostics: Vec::new() }
    }

    pub fn error(&mut self, location: SourceLocation, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::new(location, message));
    }

    pub fn has_errors(&self) -> bool {
        !self.diagnostics.is_empty()
    }

    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    /// Convert the accumulated batch into a `CoreError::Syntax` carrying the
    /// first diagnostic's position and all messages joined by newlines.
    /// Returns `None` when no errors were collected.
    pub fn into_error(self) -> Option<CoreError> {
        let first = self.diagnostics.first()?;
        let (line, col) = (first.location.line, first.location.column);
        let message = self
            .diagnostics
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        Some(CoreError::Syntax { line, col, message })
    }
}

/// Errors surfaced to the caller of `Driver::run`.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Lexer or parser rejection in C or assembly source.
    #[error("{message}")]
    Syntax { line: u32, col: u32, message: String },

    /// `_start` missing, or a relocation names a symbol defined in no section.
    #[error("undefined symbol: {0}")]
    UndefinedSymbol(String),

    /// A 32-bit relocation patch fell outside the signed range.
    #[error("relocation overflow at {section}+{offset:#x}: value {value:#x} does not fit in 32 bits")]
    RelocationOverflow { section: &'static str, offset: u64, value: i64 },

    /// The emulator reported an unrecoverable condition. When a source map
    /// was available the message already names the offending source line.
    #[error("guest fault: {0}")]
    GuestFault(String),

    /// Input uses a feature the C or assembly front end does not implement.
    #[error("unsupported: {0}")]
    Unsupported(String),
}
