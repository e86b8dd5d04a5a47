//! Lexer for the C subset.
//!
//! Tokenizes source into identifiers, decimal integers, raw quoted string
//! literals, and punctuation, all carrying byte-offset spans. Preprocessor
//! lines (`#...`) are blanked out before tokenization so spans still index
//! the original text. Errors accumulate into the shared diagnostic list.

use crate::common::error::DiagnosticList;
use crate::common::source::{LineIndex, Span};
use super::token::{Token, TokenKind};

/// Multi-character punctuation first so `==` never lexes as two `=`.
const PUNCTUATIONS: &[&str] = &["==", "!=", "<=", ">=", "+", "-", "*", "/", "=", "<", ">", "(", ")", "{", "}", ";", ","];

pub struct Lexer<'a> {
    input: Vec<u8>,
    pos: usize,
    line_index: &'a LineIndex,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &str, line_index: &'a LineIndex) -> Self {
        Self {
            input: strip_preprocessor_lines(source),
            pos: 0,
            line_index,
        }
    }

    pub fn tokenize(&mut self, diagnostics: &mut DiagnosticList) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token(diagnostics);
            let is_eof = tok.is_eof();
            tokens.push(tok);
            if is_eof {
                break;
            }
        }
        tokens
    }

    fn next_token(&mut self, diagnostics: &mut DiagnosticList) -> Token {
        loop {
            self.skip_whitespace_and_comments();

            if self.pos >= self.input.len() {
                let here = Span::new(self.pos as u32, self.pos as u32);
                return Token::new(TokenKind::Eof, here);
            }

            let start = self.pos;
            let ch = self.input[self.pos];

            if ch.is_ascii_digit() {
                return self.lex_number(start);
            }
            if ch == b'"' {
                match self.lex_string(start) {
                    Some(tok) => return tok,
                    None => {
                        diagnostics.error(
                            self.line_index.resolve(start as u32),
                            "unterminated string literal",
                        );
                        continue;
                    }
                }
            }
            if ch == b'_' || ch.is_ascii_alphabetic() {
                return self.lex_identifier(start);
            }
            if let Some(tok) = self.lex_punctuation(start) {
                return tok;
            }

            diagnostics.error(
                self.line_index.resolve(start as u32),
                format!("unexpected character '{}'", ch as char),
            );
            self.pos += 1;
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            while self.pos < self.input.len() && self.input[self.pos].is_ascii_whitespace() {
                self.pos += 1;
            }
            if self.pos + 1 < self.input.len()
                && self.input[self.pos] == b'/'
                && self.input[self.pos + 1] == b'/'
            {
                while self.pos < self.input.len() && self.input[self.pos] != b'\n' {
                    self.pos += 1;
                }
                continue;
            }
            if self.pos + 1 < self.input.len()
                && self.input[self.pos] == b'/'
                && self.input[self.pos + 1] == b'*'
            {
                self.pos += 2;
                while self.pos + 1 < self.input.len() {
                    if self.input[self.pos] == b'*' && self.input[self.pos + 1] == b'/' {
                        self.pos += 2;
                        break;
                    }
                    self.pos += 1;
                }
                // An unterminated block comment swallows the rest of the file.
                if self.pos + 1 >= self.input.len() {
                    self.pos = self.input.len();
                }
                continue;
            }
            return;
        }
    }

    fn lex_number(&mut self, start: usize) -> Token {
        while self.pos < self.input.len() && self.input[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.input[start..self.pos]).unwrap_or("0");
        let value = text.parse::<i64>().unwrap_or(i64::MAX);
        Token::new(TokenKind::Num(value), Span::new(start as u32, self.pos as u32))
    }

    /// Lex a string literal, keeping the raw quoted form including both
    /// quotes and any escape sequences exactly as written.
    fn lex_string(&mut self, start: usize) -> Option<Token> {
        self.pos += 1; // opening quote
        while self.pos < self.input.len() {
            match self.input[self.pos] {
                b'"' => {
                    self.pos += 1;
                    let raw = String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();
                    return Some(Token::new(
                        TokenKind::Str(raw),
                        Span::new(start as u32, self.pos as u32),
                    ));
                }
                b'\\' if self.pos + 1 < self.input.len() => self.pos += 2,
                b'\n' => break,
                _ => self.pos += 1,
            }
        }
        self.pos = self.input.len().min(self.pos + 1);
        None
    }

    fn lex_identifier(&mut self, start: usize) -> Token {
        while self.pos < self.input.len()
            && (self.input[self.pos] == b'_' || self.input[self.pos].is_ascii_alphanumeric())
        {
            self.pos += 1;
        }
        let name = String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();
        Token::new(TokenKind::Ident(name), Span::new(start as u32, self.pos as u32))
    }

    fn lex_punctuation(&mut self, start: usize) -> Option<Token> {
        let rest = &self.input[self.pos..];
        for punct in PUNCTUATIONS {
            if rest.starts_with(punct.as_bytes()) {
                self.pos += punct.len();
                return Some(Token::new(
                    TokenKind::Punct(punct.to_string()),
                    Span::new(start as u32, self.pos as u32),
                ));
            }
        }
        None
    }
}

/// Blank out `#`-directive lines (typically `#include`) in place, preserving
/// byte offsets so spans keep pointing into the user's original text.
fn strip_preprocessor_lines(source: &str) -> Vec<u8> {
    let mut bytes = source.as_bytes().to_vec();
    let mut line_start = 0;
    while line_start < bytes.len() {
        let line_end = bytes[line_start..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|p| line_start + p)
            .unwrap_or(bytes.len());
        let first = bytes[line_start..line_end]
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .map(|p| line_start + p);
        if let Some(first) = first {
            if bytes[first] == b'#' {
                for b in &mut bytes[line_start..line_end] {
                    *b = b' ';
                }
            }
        }
        line_start = line_end + 1;
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(src: &str) -> Vec<TokenKind> {
        let index = LineIndex::new(src);
        let mut diagnostics = DiagnosticList::new();
        let tokens = Lexer::new(src, &index).tokenize(&mut diagnostics);
        assert!(diagnostics.is_empty(), "unexpected lex errors");
        tokens.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_declaration() {
        let kinds = lex("int a = 10;");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Ident("int".into()),
                TokenKind::Ident("a".into()),
                TokenKind::Punct("=".into()),
                TokenKind::Num(10),
                TokenKind::Punct(";".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn multi_char_punctuation_wins() {
        let kinds = lex("a <= b == c");
        assert!(kinds.contains(&TokenKind::Punct("<=".into())));
        assert!(kinds.contains(&TokenKind::Punct("==".into())));
    }

    #[test]
    fn string_keeps_raw_quoted_form() {
        let kinds = lex("printf(\"%d\\n\", x);");
        assert!(kinds.contains(&TokenKind::Str("\"%d\\n\"".into())));
    }

    #[test]
    fn comments_and_includes_are_discarded() {
        let kinds = lex("#include <stdio.h>\n// line\n/* block */ 7");
        assert_eq!(kinds, vec![TokenKind::Num(7), TokenKind::Eof]);
    }

    #[test]
    fn unterminated_string_is_reported() {
        let src = "\"abc";
        let index = LineIndex::new(src);
        let mut diagnostics = DiagnosticList::new();
        Lexer::new(src, &index).tokenize(&mut diagnostics);
        assert_eq!(diagnostics.len(), 1);
    }
}
