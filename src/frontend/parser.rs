//! Recursive-descent parser for the C subset.
//!
//! Follows the grammar top-down with one token of lookahead (two for the
//! function-header case). The token cursor and the locals table live in the
//! parser itself; errors accumulate into the shared diagnostic list and the
//! parser synchronizes to the next `;` or `}` so later statements still get
//! checked.

use crate::common::error::DiagnosticList;
use crate::common::source::{LineIndex, Span};
use super::ast::{BinOp, LocalTable, Node, NodeKind, Program};
use super::token::{Token, TokenKind};

pub struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    locals: LocalTable,
    line_index: &'a LineIndex,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: Vec<Token>, line_index: &'a LineIndex) -> Self {
        Self {
            tokens,
            pos: 0,
            locals: LocalTable::new(),
            line_index,
        }
    }

    /// Parse the whole token stream into the `_start` body.
    pub fn parse_program(mut self, diagnostics: &mut DiagnosticList) -> Program {
        let mut stmts = Vec::new();
        while !self.at_eof() {
            if self.try_consume_func_header() {
                continue;
            }
            match self.stmt(diagnostics) {
                Some(node) => stmts.push(node),
                None => {
                    self.synchronize();
                    // A stray `}` has no enclosing block to consume it here.
                    if self.at_punct("}") {
                        self.advance();
                    }
                }
            }
        }
        Program { stmts, locals: self.locals }
    }

    // --- token cursor helpers ---

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, n: usize) -> &Token {
        &self.tokens[(self.pos + n).min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn at_eof(&self) -> bool {
        self.peek().is_eof()
    }

    fn at_punct(&self, p: &str) -> bool {
        self.peek().punct() == Some(p)
    }

    fn at_ident(&self, name: &str) -> bool {
        self.peek().ident() == Some(name)
    }

    fn consume_punct(&mut self, p: &str) -> bool {
        if self.at_punct(p) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str, diagnostics: &mut DiagnosticList) -> bool {
        if self.consume_punct(p) {
            return true;
        }
        let tok = self.peek().clone();
        diagnostics.error(
            self.line_index.resolve_span(tok.span),
            format!("expected '{}', got {}", p, describe(&tok)),
        );
        false
    }

    /// Skip to just past the next `;` (or to a `}` / EOF) after an error.
    fn synchronize(&mut self) {
        while !self.at_eof() {
            if self.consume_punct(";") {
                return;
            }
            if self.at_punct("}") {
                return;
            }
            self.advance();
        }
    }

    // --- grammar productions ---

    /// `"int" IDENT "(" [ "void" ] ")"`: consumed, produces nothing.
    fn try_consume_func_header(&mut self) -> bool {
        if !self.at_ident("int") {
            return false;
        }
        let is_header = matches!(self.peek_at(1).kind, TokenKind::Ident(ref n) if n != "int")
            && self.peek_at(2).punct() == Some("(");
        if !is_header {
            return false;
        }
        self.advance(); // int
        self.advance(); // name
        self.advance(); // (
        if self.at_ident("void") {
            self.advance();
        }
        self.consume_punct(")");
        true
    }

    fn stmt(&mut self, diagnostics: &mut DiagnosticList) -> Option<Node> {
        let span = self.peek().span;

        if self.at_ident("if") {
            return self.if_stmt(diagnostics);
        }
        if self.at_ident("while") {
            return self.while_stmt(diagnostics);
        }
        if self.at_punct("{") {
            return self.block(diagnostics);
        }
        if self.at_ident("int") {
            return self.declaration(diagnostics);
        }
        if self.at_ident("return") {
            self.advance();
            let expr = self.expr(diagnostics)?;
            self.expect_punct(";", diagnostics);
            return Some(Node::new(NodeKind::Return(Box::new(expr)), span));
        }
        if self.consume_punct(";") {
            return Some(Node::new(NodeKind::Nop, span));
        }

        let expr = self.expr(diagnostics)?;
        self.expect_punct(";", diagnostics);
        Some(expr)
    }

    fn if_stmt(&mut self, diagnostics: &mut DiagnosticList) -> Option<Node> {
        let span = self.advance().span; // if
        self.expect_punct("(", diagnostics);
        let cond = self.expr(diagnostics)?;
        self.expect_punct(")", diagnostics);
        let then = self.stmt(diagnostics)?;
        let otherwise = if self.at_ident("else") {
            self.advance();
            Some(Box::new(self.stmt(diagnostics)?))
        } else {
            None
        };
        Some(Node::new(
            NodeKind::If(Box::new(cond), Box::new(then), otherwise),
            span,
        ))
    }

    fn while_stmt(&mut self, diagnostics: &mut DiagnosticList) -> Option<Node> {
        let span = self.advance().span; // while
        self.expect_punct("(", diagnostics);
        let cond = self.expr(diagnostics)?;
        self.expect_punct(")", diagnostics);
        let body = self.stmt(diagnostics)?;
        Some(Node::new(NodeKind::While(Box::new(cond), Box::new(body)), span))
    }

    fn block(&mut self, diagnostics: &mut DiagnosticList) -> Option<Node> {
        let span = self.advance().span; // {
        let mut stmts = Vec::new();
        while !self.at_punct("}") && !self.at_eof() {
            match self.stmt(diagnostics) {
                Some(node) => stmts.push(node),
                None => self.synchronize(),
            }
        }
        self.expect_punct("}", diagnostics);
        Some(Node::new(NodeKind::Block(stmts), span))
    }

    /// `"int" { "*" } IDENT [ "=" expr ] ";"`
    fn declaration(&mut self, diagnostics: &mut DiagnosticList) -> Option<Node> {
        let span = self.advance().span; // int
        while self.consume_punct("*") {}
        let name = match self.advance() {
            Token { kind: TokenKind::Ident(name), .. } => name,
            other => {
                diagnostics.error(
                    self.line_index.resolve_span(other.span),
                    format!("expected variable name, got {}", describe(&other)),
                );
                return None;
            }
        };
        self.locals.declare(&name);
        let node = if self.consume_punct("=") {
            let init = self.expr(diagnostics)?;
            Node::new(NodeKind::Assign(name, Box::new(init)), span)
        } else {
            Node::new(NodeKind::Nop, span)
        };
        self.expect_punct(";", diagnostics);
        Some(node)
    }

    fn expr(&mut self, diagnostics: &mut DiagnosticList) -> Option<Node> {
        self.assign(diagnostics)
    }

    /// `equality [ "=" assign ]`, left side restricted to a variable.
    fn assign(&mut self, diagnostics: &mut DiagnosticList) -> Option<Node> {
        let lhs = self.equality(diagnostics)?;
        if !self.at_punct("=") {
            return Some(lhs);
        }
        let eq_span = self.advance().span;
        let rhs = self.assign(diagnostics)?;
        match lhs.kind {
            NodeKind::Var(name) => {
                self.locals.declare(&name);
                Some(Node::new(NodeKind::Assign(name, Box::new(rhs)), lhs.span))
            }
            _ => {
                diagnostics.error(
                    self.line_index.resolve_span(eq_span),
                    "left side of assignment must be a variable",
                );
                None
            }
        }
    }

    fn equality(&mut self, diagnostics: &mut DiagnosticList) -> Option<Node> {
        let mut node = self.relational(diagnostics)?;
        loop {
            let op = if self.at_punct("==") {
                BinOp::Eq
            } else if self.at_punct("!=") {
                BinOp::Ne
            } else {
                return Some(node);
            };
            let span = self.advance().span;
            let rhs = self.relational(diagnostics)?;
            node = Node::new(NodeKind::Binary(op, Box::new(node), Box::new(rhs)), span);
        }
    }

    fn relational(&mut self, diagnostics: &mut DiagnosticList) -> Option<Node> {
        let mut node = self.add(diagnostics)?;
        loop {
            let op = if self.at_punct("<=") {
                BinOp::Le
            } else if self.at_punct(">=") {
                BinOp::Ge
            } else if self.at_punct("<") {
                BinOp::Lt
            } else if self.at_punct(">") {
                BinOp::Gt
            } else {
                return Some(node);
            };
            let span = self.advance().span;
            let rhs = self.add(diagnostics)?;
            node = Node::new(NodeKind::Binary(op, Box::new(node), Box::new(rhs)), span);
        }
    }

    fn add(&mut self, diagnostics: &mut DiagnosticList) -> Option<Node> {
        let mut node = self.mul(diagnostics)?;
        loop {
            let op = if self.at_punct("+") {
                BinOp::Add
            } else if self.at_punct("-") {
                BinOp::Sub
            } else {
                return Some(node);
            };
            let span = self.advance().span;
            let rhs = self.mul(diagnostics)?;
            node = Node::new(NodeKind::Binary(op, Box::new(node), Box::new(rhs)), span);
        }
    }

    fn mul(&mut self, diagnostics: &mut DiagnosticList) -> Option<Node> {
        let mut node = self.unary(diagnostics)?;
        loop {
            let op = if self.at_punct("*") {
                BinOp::Mul
            } else if self.at_punct("/") {
                BinOp::Div
            } else {
                return Some(node);
            };
            let span = self.advance().span;
            let rhs = self.unary(diagnostics)?;
            node = Node::new(NodeKind::Binary(op, Box::new(node), Box::new(rhs)), span);
        }
    }

    /// `("+"|"-") primary | primary`. Unary minus is `0 - primary`.
    fn unary(&mut self, diagnostics: &mut DiagnosticList) -> Option<Node> {
        if self.at_punct("+") {
            self.advance();
            return self.primary(diagnostics);
        }
        if self.at_punct("-") {
            let span = self.advance().span;
            let operand = self.primary(diagnostics)?;
            let zero = Node::new(NodeKind::Num(0), span);
            return Some(Node::new(
                NodeKind::Binary(BinOp::Sub, Box::new(zero), Box::new(operand)),
                span,
            ));
        }
        self.primary(diagnostics)
    }

    fn primary(&mut self, diagnostics: &mut DiagnosticList) -> Option<Node> {
        let tok = self.advance();
        let span = tok.span;
        match tok.kind {
            TokenKind::Num(value) => Some(Node::new(NodeKind::Num(value), span)),
            TokenKind::Str(raw) => Some(Node::new(NodeKind::Str(raw), span)),
            TokenKind::Ident(name) => {
                if self.consume_punct("(") {
                    let args = self.call_args(diagnostics)?;
                    Some(Node::new(NodeKind::Call(name, args), span))
                } else {
                    Some(Node::new(NodeKind::Var(name), span))
                }
            }
            TokenKind::Punct(ref p) if p == "(" => {
                let inner = self.expr(diagnostics)?;
                self.expect_punct(")", diagnostics);
                Some(inner)
            }
            _ => {
                diagnostics.error(
                    self.line_index.resolve_span(span),
                    format!("expected expression, got {}", describe(&tok)),
                );
                None
            }
        }
    }

    fn call_args(&mut self, diagnostics: &mut DiagnosticList) -> Option<Vec<Node>> {
        let mut args = Vec::new();
        if self.consume_punct(")") {
            return Some(args);
        }
        loop {
            args.push(self.expr(diagnostics)?);
            if self.consume_punct(",") {
                continue;
            }
            self.expect_punct(")", diagnostics);
            return Some(args);
        }
    }
}

fn describe(tok: &Token) -> String {
    match &tok.kind {
        TokenKind::Ident(name) => format!("'{}'", name),
        TokenKind::Num(v) => format!("'{}'", v),
        TokenKind::Str(_) => "string literal".to_string(),
        TokenKind::Punct(p) => format!("'{}'", p),
        TokenKind::Eof => "end of input".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::lexer::Lexer;

    fn parse(src: &str) -> (Program, DiagnosticList) {
        let index = LineIndex::new(src);
        let mut diagnostics = DiagnosticList::new();
        let tokens = Lexer::new(src, &index).tokenize(&mut diagnostics);
        let program = Parser::new(tokens, &index).parse_program(&mut diagnostics);
        (program, diagnostics)
    }

    fn parse_ok(src: &str) -> Program {
        let (program, diagnostics) = parse(src);
        assert!(diagnostics.is_empty(), "unexpected parse errors");
        program
    }

    #[test]
    fn function_header_produces_nothing() {
        let program = parse_ok("int main(void) { return 0; }");
        assert_eq!(program.stmts.len(), 1);
        assert!(matches!(program.stmts[0].kind, NodeKind::Block(_)));
    }

    #[test]
    fn precedence_mul_binds_tighter_than_add() {
        let program = parse_ok("a = 1 + 2 * 3;");
        let NodeKind::Assign(_, rhs) = &program.stmts[0].kind else {
            panic!("expected assignment");
        };
        let NodeKind::Binary(BinOp::Add, _, add_rhs) = &rhs.kind else {
            panic!("expected addition at the top");
        };
        assert!(matches!(add_rhs.kind, NodeKind::Binary(BinOp::Mul, _, _)));
    }

    #[test]
    fn declaration_allocates_slots_in_order() {
        let program = parse_ok("int a = 1; int b; int c = a;");
        assert_eq!(program.locals.offset_of("a"), Some(-8));
        assert_eq!(program.locals.offset_of("b"), Some(-16));
        assert_eq!(program.locals.offset_of("c"), Some(-24));
        // `int b;` contributes no code-producing statement
        assert!(matches!(program.stmts[1].kind, NodeKind::Nop));
    }

    #[test]
    fn if_else_and_while_nest() {
        let program = parse_ok("while (i < 3) { if (i == 1) x = 1; else x = 2; i = i + 1; }");
        let NodeKind::While(cond, body) = &program.stmts[0].kind else {
            panic!("expected while");
        };
        assert!(matches!(cond.kind, NodeKind::Binary(BinOp::Lt, _, _)));
        let NodeKind::Block(stmts) = &body.kind else {
            panic!("expected block body");
        };
        assert!(matches!(stmts[0].kind, NodeKind::If(_, _, Some(_))));
    }

    #[test]
    fn call_with_two_args() {
        let program = parse_ok("printf(\"%d\\n\", 1 + 2);");
        let NodeKind::Call(name, args) = &program.stmts[0].kind else {
            panic!("expected call");
        };
        assert_eq!(name, "printf");
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn assignment_to_non_variable_is_an_error() {
        let (_, diagnostics) = parse("1 = 2;");
        assert!(diagnostics.has_errors());
    }

    #[test]
    fn recovers_after_bad_statement() {
        let (program, diagnostics) = parse("int x = ; x = 3;");
        assert!(diagnostics.has_errors());
        // Second statement still parsed after synchronization.
        assert!(program
            .stmts
            .iter()
            .any(|s| matches!(s.kind, NodeKind::Assign(_, _))));
    }
}
