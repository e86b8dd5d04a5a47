//! x86-64 code generator for the C subset.
//!
//! Emits AT&T assembly text with a stack-machine discipline: every
//! expression leaves its value on the machine stack, operators pop their
//! operands and push the result. No register allocation; `%rax` and `%rdi`
//! are the working pair, matching the expression shapes the parser can
//! produce.
//!
//! The whole program becomes the body of `_start`. It never returns:
//! control reaches the `.L.exit` epilogue and leaves through the `exit`
//! syscall, so a missing top-level `return` yields exit code 0.

use std::collections::HashMap;
use std::fmt::Write;

use crate::common::error::CoreError;
use crate::common::source::{LineIndex, Span};
use crate::frontend::ast::{BinOp, Node, NodeKind, Program};

/// One source-map record: the label emitted immediately before a top-level
/// statement and the statement's position in the original source. The
/// driver resolves labels to virtual addresses once the image is linked.
#[derive(Debug, Clone)]
pub struct SourceMapEntry {
    pub label: String,
    pub line: u32,
    pub col: u32,
}

/// Result of code generation: assembly text plus the source map.
#[derive(Debug)]
pub struct CodegenOutput {
    pub assembly: String,
    pub source_map: Vec<SourceMapEntry>,
}

/// Mutable emission state: output text, label counter, string pool, and
/// the source map under construction.
pub struct Codegen<'a> {
    out: String,
    label_counter: u32,
    /// Raw quoted literals in insertion order; index is the `.L.str.<n>` id.
    strings: Vec<String>,
    string_ids: HashMap<String, usize>,
    source_map: Vec<SourceMapEntry>,
    printf_used: bool,
    line_index: &'a LineIndex,
}

impl<'a> Codegen<'a> {
    pub(crate) fn new(line_index: &'a LineIndex) -> Self {
        Self {
            out: String::new(),
            label_counter: 0,
            strings: Vec::new(),
            string_ids: HashMap::new(),
            source_map: Vec::new(),
            printf_used: false,
            line_index,
        }
    }

    pub(crate) fn generate(mut self, program: &Program) -> Result<CodegenOutput, CoreError> {
        self.emit(".text");
        self.emit(".global _start");
        self.emit("_start:");
        self.emit("    pushq %rbp");
        self.emit("    movq %rsp, %rbp");
        self.emit(&format!("    subq ${}, %rsp", program.locals.frame_size()));

        for (i, stmt) in program.stmts.iter().enumerate() {
            if matches!(stmt.kind, NodeKind::Nop) {
                continue;
            }
            let label = format!(".L.stmt.{}", i);
            self.emit(&format!("{}:", label));
            let loc = self.line_index.resolve_span(stmt.span);
            self.source_map.push(SourceMapEntry {
                label,
                line: loc.line,
                col: loc.column,
            });
            self.gen_stmt(stmt, program)?;
        }

        self.emit(".L.exit:");
        self.emit("    movq %rbp, %rsp");
        self.emit("    popq %rbp");
        self.emit("    movq $60, %rax");
        self.emit("    xorq %rdi, %rdi");
        self.emit("    syscall");

        if self.printf_used {
            self.emit_printf_stub();
        }

        let strings = std::mem::take(&mut self.strings);
        if !strings.is_empty() {
            self.emit(".data");
            for (i, raw) in strings.iter().enumerate() {
                self.emit(&format!(".L.str.{}:", i));
                self.emit(&format!("    .asciz {}", raw));
            }
        }

        Ok(CodegenOutput {
            assembly: self.out,
            source_map: self.source_map,
        })
    }

    fn emit(&mut self, line: &str) {
        let _ = writeln!(self.out, "{}", line);
    }

    fn fresh_label(&mut self) -> u32 {
        let n = self.label_counter;
        self.label_counter += 1;
        n
    }

    /// Pool a raw quoted literal, returning its stable `.L.str.<n>` label.
    fn intern_string(&mut self, raw: &str) -> String {
        let id = match self.string_ids.get(raw) {
            Some(&id) => id,
            None => {
                let id = self.strings.len();
                self.strings.push(raw.to_string());
                self.string_ids.insert(raw.to_string(), id);
                id
            }
        };
        format!(".L.str.{}", id)
    }

    fn gen_stmt(&mut self, node: &Node, program: &Program) -> Result<(), CoreError> {
        match &node.kind {
            NodeKind::Nop => Ok(()),
            NodeKind::Block(stmts) => {
                for stmt in stmts {
                    self.gen_stmt(stmt, program)?;
                }
                Ok(())
            }
            NodeKind::If(cond, then, otherwise) => {
                let n = self.fresh_label();
                self.gen_expr(cond, program)?;
                self.emit("    popq %rax");
                self.emit("    testq %rax, %rax");
                match otherwise {
                    Some(else_branch) => {
                        self.emit(&format!("    je .L.else.{}", n));
                        self.gen_stmt(then, program)?;
                        self.emit(&format!("    jmp .L.end.{}", n));
                        self.emit(&format!(".L.else.{}:", n));
                        self.gen_stmt(else_branch, program)?;
                    }
                    None => {
                        self.emit(&format!("    je .L.end.{}", n));
                        self.gen_stmt(then, program)?;
                    }
                }
                self.emit(&format!(".L.end.{}:", n));
                Ok(())
            }
            NodeKind::While(cond, body) => {
                let n = self.fresh_label();
                self.emit(&format!(".L.begin.{}:", n));
                self.gen_expr(cond, program)?;
                self.emit("    popq %rax");
                self.emit("    testq %rax, %rax");
                self.emit(&format!("    je .L.end.{}", n));
                self.gen_stmt(body, program)?;
                self.emit(&format!("    jmp .L.begin.{}", n));
                self.emit(&format!(".L.end.{}:", n));
                Ok(())
            }
            NodeKind::Return(expr) => {
                self.gen_expr(expr, program)?;
                self.emit("    popq %rax");
                self.emit("    jmp .L.exit");
                Ok(())
            }
            // Expression statement: evaluate, then drop the value so the
            // machine stack stays balanced.
            _ => {
                self.gen_expr(node, program)?;
                self.emit("    popq %rax");
                Ok(())
            }
        }
    }

    fn gen_expr(&mut self, node: &Node, program: &Program) -> Result<(), CoreError> {
        match &node.kind {
            NodeKind::Num(value) => {
                if i32::try_from(*value).is_ok() {
                    self.emit(&format!("    pushq ${}", value));
                } else {
                    self.emit(&format!("    movq ${}, %rax", value));
                    self.emit("    pushq %rax");
                }
                Ok(())
            }
            NodeKind::Str(raw) => {
                let label = self.intern_string(raw);
                self.emit(&format!("    leaq {}(%rip), %rax", label));
                self.emit("    pushq %rax");
                Ok(())
            }
            NodeKind::Var(name) => {
                let offset = program.locals.offset_of(name).ok_or_else(|| {
                    self.undeclared(name, node.span)
                })?;
                self.emit(&format!("    movq {}(%rbp), %rax", offset));
                self.emit("    pushq %rax");
                Ok(())
            }
            NodeKind::Assign(name, rhs) => {
                let offset = program.locals.offset_of(name).ok_or_else(|| {
                    self.undeclared(name, node.span)
                })?;
                self.gen_expr(rhs, program)?;
                self.emit("    popq %rax");
                self.emit(&format!("    movq %rax, {}(%rbp)", offset));
                // Re-push so the assignment itself has a value.
                self.emit("    pushq %rax");
                Ok(())
            }
            NodeKind::Binary(op, lhs, rhs) => {
                self.gen_expr(lhs, program)?;
                self.gen_expr(rhs, program)?;
                self.emit("    popq %rdi");
                self.emit("    popq %rax");
                match op {
                    BinOp::Add => self.emit("    addq %rdi, %rax"),
                    BinOp::Sub => self.emit("    subq %rdi, %rax"),
                    BinOp::Mul => self.emit("    imulq %rdi, %rax"),
                    BinOp::Div => {
                        self.emit("    cqo");
                        self.emit("    idivq %rdi");
                    }
                    BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                        let set = match op {
                            BinOp::Eq => "sete",
                            BinOp::Ne => "setne",
                            BinOp::Lt => "setl",
                            BinOp::Le => "setle",
                            BinOp::Gt => "setg",
                            _ => "setge",
                        };
                        self.emit("    cmpq %rdi, %rax");
                        self.emit(&format!("    {} %al", set));
                        self.emit("    movzbq %al, %rax");
                    }
                }
                self.emit("    pushq %rax");
                Ok(())
            }
            NodeKind::Call(name, args) => self.gen_call(name, args, node.span, program),
            NodeKind::Nop | NodeKind::Block(..) | NodeKind::If(..) | NodeKind::While(..)
            | NodeKind::Return(..) => {
                // The parser only produces these in statement position.
                Err(CoreError::Unsupported("statement used as expression".into()))
            }
        }
    }

    fn gen_call(
        &mut self,
        name: &str,
        args: &[Node],
        span: Span,
        program: &Program,
    ) -> Result<(), CoreError> {
        if name != "printf" {
            let loc = self.line_index.resolve_span(span);
            return Err(CoreError::Unsupported(format!(
                "{}: call to unknown function '{}'",
                loc, name
            )));
        }
        if args.is_empty() || args.len() > 2 {
            let loc = self.line_index.resolve_span(span);
            return Err(CoreError::Unsupported(format!(
                "{}: printf takes a format string and at most one integer argument",
                loc
            )));
        }
        for arg in args {
            self.gen_expr(arg, program)?;
        }
        if args.len() == 2 {
            self.emit("    popq %rsi");
        } else {
            self.emit("    xorq %rsi, %rsi");
        }
        self.emit("    popq %rdi");
        // Variadic ABI: zero SSE register count.
        self.emit("    xorq %rax, %rax");
        self.emit("    call __printf");
        self.emit("    pushq %rax");
        self.printf_used = true;
        Ok(())
    }

    fn undeclared(&self, name: &str, span: Span) -> CoreError {
        let loc = self.line_index.resolve_span(span);
        CoreError::Syntax {
            line: loc.line,
            col: loc.column,
            message: format!("{}: error: use of undeclared variable '{}'", loc, name),
        }
    }

    /// Minimal `printf` runtime, appended once per program.
    ///
    /// Contract: `%rdi` holds a NUL-terminated format string, `%rsi` the
    /// only integer argument. `%d` is the sole conversion; `%` followed by
    /// any other byte drops both bytes. Literal bytes go out one write(2)
    /// each; a `%d` expansion is a single write of the full digit run.
    fn emit_printf_stub(&mut self) {
        for line in [
            "__printf:",
            "    pushq %rbp",
            "    movq %rsp, %rbp",
            "    pushq %rbx",
            "    pushq %r12",
            "    pushq %r13",
            "    subq $40, %rsp",
            "    movq %rdi, %rbx",
            "    movq %rsi, %r12",
            ".L.pf.next:",
            "    movzbq (%rbx), %rax",
            "    testq %rax, %rax",
            "    je .L.pf.done",
            "    cmpq $37, %rax",
            "    je .L.pf.conv",
            "    movq $1, %rax",
            "    movq $1, %rdi",
            "    movq %rbx, %rsi",
            "    movq $1, %rdx",
            "    syscall",
            "    incq %rbx",
            "    jmp .L.pf.next",
            ".L.pf.conv:",
            "    movzbq 1(%rbx), %rax",
            "    addq $2, %rbx",
            "    cmpq $100, %rax",
            "    jne .L.pf.next",
            "    movq %r12, %rax",
            "    movq $0, %r13",
            "    cmpq $0, %rax",
            "    jge .L.pf.digits",
            "    movq $1, %r13",
            "    negq %rax",
            ".L.pf.digits:",
            "    leaq -25(%rbp), %rsi",
            "    movq $10, %rdi",
            "    movq $0, %rcx",
            ".L.pf.digit:",
            "    cqo",
            "    idivq %rdi",
            "    addq $48, %rdx",
            "    movb %dl, (%rsi)",
            "    decq %rsi",
            "    incq %rcx",
            "    testq %rax, %rax",
            "    jne .L.pf.digit",
            "    testq %r13, %r13",
            "    je .L.pf.out",
            "    movb $45, (%rsi)",
            "    decq %rsi",
            "    incq %rcx",
            ".L.pf.out:",
            "    incq %rsi",
            "    movq %rcx, %rdx",
            "    movq $1, %rax",
            "    movq $1, %rdi",
            "    syscall",
            "    jmp .L.pf.next",
            ".L.pf.done:",
            "    xorq %rax, %rax",
            "    addq $40, %rsp",
            "    popq %r13",
            "    popq %r12",
            "    popq %rbx",
            "    popq %rbp",
            "    ret",
        ] {
            self.emit(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::DiagnosticList;
    use crate::frontend::lexer::Lexer;
    use crate::frontend::parser::Parser;

    fn compile(src: &str) -> CodegenOutput {
        let index = LineIndex::new(src);
        let mut diagnostics = DiagnosticList::new();
        let tokens = Lexer::new(src, &index).tokenize(&mut diagnostics);
        let program = Parser::new(tokens, &index).parse_program(&mut diagnostics);
        assert!(diagnostics.is_empty(), "unexpected front-end errors");
        Codegen::new(&index).generate(&program).unwrap()
    }

    #[test]
    fn prologue_and_exit_epilogue() {
        let out = compile("int main(){int a=1;return a;}");
        let asm = &out.assembly;
        assert!(asm.contains("_start:"));
        assert!(asm.contains("subq $16, %rsp"));
        assert!(asm.contains(".L.exit:"));
        assert!(asm.contains("movq $60, %rax"));
        // _start never returns via ret; the only ret belongs to __printf.
        assert!(!asm.contains("ret"));
    }

    #[test]
    fn division_uses_cqo_idiv() {
        let out = compile("int a = 7 / 2;");
        assert!(out.assembly.contains("cqo"));
        assert!(out.assembly.contains("idivq %rdi"));
    }

    #[test]
    fn comparison_materializes_zero_or_one() {
        let out = compile("int a = 1 < 2;");
        assert!(out.assembly.contains("cmpq %rdi, %rax"));
        assert!(out.assembly.contains("setl %al"));
        assert!(out.assembly.contains("movzbq %al, %rax"));
    }

    #[test]
    fn string_literals_are_pooled_and_deduplicated() {
        let out = compile("printf(\"%d\\n\", 1); printf(\"%d\\n\", 2); printf(\"x\\n\", 3);");
        let asm = &out.assembly;
        assert!(asm.contains(".L.str.0:"));
        assert!(asm.contains(".L.str.1:"));
        assert!(!asm.contains(".L.str.2:"));
        assert!(asm.contains("leaq .L.str.0(%rip), %rax"));
    }

    #[test]
    fn printf_stub_emitted_once_when_used() {
        let out = compile("printf(\"a\", 0); printf(\"b\", 0);");
        assert_eq!(out.assembly.matches("__printf:").count(), 1);
        let without = compile("int a = 1;");
        assert!(!without.assembly.contains("__printf"));
    }

    #[test]
    fn source_map_covers_code_producing_statements() {
        let out = compile("int a = 1;\nint b;\na = 2;\n");
        let labels: Vec<&str> = out.source_map.iter().map(|e| e.label.as_str()).collect();
        // `int b;` produces no code and gets no record.
        assert_eq!(labels, vec![".L.stmt.0", ".L.stmt.2"]);
        assert_eq!(out.source_map[0].line, 1);
        assert_eq!(out.source_map[1].line, 3);
    }

    #[test]
    fn unknown_function_is_rejected() {
        let src = "foo(1);";
        let index = LineIndex::new(src);
        let mut diagnostics = DiagnosticList::new();
        let tokens = Lexer::new(src, &index).tokenize(&mut diagnostics);
        let program = Parser::new(tokens, &index).parse_program(&mut diagnostics);
        let err = Codegen::new(&index).generate(&program).unwrap_err();
        assert!(matches!(err, CoreError::Unsupported(_)));
    }
}
