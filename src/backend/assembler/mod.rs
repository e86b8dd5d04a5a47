//! AT&T/GAS x86-64 assembler.
//!
//! One pass over the source text: statements land in the current section
//! (`.text` by default), symbol definitions are recorded at their offsets,
//! `.equ`/`.set` constants are substituted into operands, and instructions
//! are encoded immediately. Constants are collected before encoding starts
//! so they may be declared after their first use. Any operand that
//! references a symbol emits a relocation record; the ELF writer resolves
//! them once section virtual addresses are fixed.
//!
//! Errors are collected per line and surfaced together at the end, joined
//! by newlines.

pub mod encoder;
pub mod parser;

use std::collections::{HashMap, HashSet};

use crate::common::error::CoreError;
use encoder::{InstructionEncoder, Relocation};
use parser::{AsmItem, DataValue, Displacement, Immediate, Instruction, Operand, SectionId};

/// A defined symbol: name, owning section, offset within it, and whether
/// `.global` named it.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub section: SectionId,
    pub offset: u64,
    pub global: bool,
}

/// A relocation tagged with the section whose bytes it patches.
#[derive(Debug, Clone)]
pub struct SectionReloc {
    pub section: SectionId,
    pub reloc: Relocation,
}

/// Assembled sections, symbols, and pending relocations.
#[derive(Debug)]
pub struct AsmOutput {
    pub text: Vec<u8>,
    pub data: Vec<u8>,
    pub bss_len: u64,
    pub symbols: Vec<Symbol>,
    pub relocations: Vec<SectionReloc>,
    /// Offset of `_start` within `.text`.
    pub entry_offset: u64,
}

impl AsmOutput {
    pub fn symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }
}

struct Assembler {
    text: InstructionEncoder,
    data: Vec<u8>,
    data_relocs: Vec<Relocation>,
    bss_len: u64,
    current: SectionId,
    symbols: Vec<Symbol>,
    symbol_names: HashMap<String, usize>,
    globals: HashSet<String>,
    equates: HashMap<String, i64>,
    /// (line number, message) pairs, surfaced together at the end.
    errors: Vec<(u32, String)>,
}

/// Assemble AT&T source into section bytes, symbols, and relocations.
pub fn assemble(source: &str) -> Result<AsmOutput, CoreError> {
    let mut asm = Assembler {
        text: InstructionEncoder::new(),
        data: Vec::new(),
        data_relocs: Vec::new(),
        bss_len: 0,
        current: SectionId::Text,
        symbols: Vec::new(),
        symbol_names: HashMap::new(),
        globals: HashSet::new(),
        equates: HashMap::new(),
        errors: Vec::new(),
    };

    let mut parsed: Vec<(u32, Vec<AsmItem>)> = Vec::new();
    for (i, line) in source.lines().enumerate() {
        let line_no = i as u32 + 1;
        match parser::parse_line(line) {
            Ok(items) => parsed.push((line_no, items)),
            Err(message) => asm.errors.push((line_no, message)),
        }
    }

    // Constants first, so `.equ` may follow its uses in the text.
    for (_, items) in &parsed {
        for item in items {
            if let AsmItem::Equ(name, value) = item {
                asm.equates.insert(name.clone(), *value);
            }
        }
    }

    for (line_no, items) in parsed {
        for item in items {
            asm.process(line_no, item);
        }
    }

    asm.finish()
}

impl Assembler {
    fn process(&mut self, line_no: u32, item: AsmItem) {
        match item {
            AsmItem::Empty => {}
            AsmItem::Section(id) => self.current = id,
            AsmItem::Global(name) => {
                self.globals.insert(name);
            }
            AsmItem::Equ(name, value) => {
                self.equates.insert(name, value);
            }
            AsmItem::Label(name) => self.define_symbol(line_no, name),
            AsmItem::Ascii(bytes) | AsmItem::Asciz(bytes) => match self.current {
                SectionId::Text => self.text.bytes.extend_from_slice(&bytes),
                SectionId::Data => self.data.extend_from_slice(&bytes),
                SectionId::Bss => self.error(line_no, "string data not allowed in .bss"),
            },
            AsmItem::Data(size, values) => self.emit_data(line_no, size, &values),
            AsmItem::Instruction(insn) => self.encode_instruction(line_no, insn),
        }
    }

    fn error(&mut self, line_no: u32, message: impl Into<String>) {
        self.errors.push((line_no, message.into()));
    }

    fn current_offset(&self) -> u64 {
        match self.current {
            SectionId::Text => self.text.offset(),
            SectionId::Data => self.data.len() as u64,
            SectionId::Bss => self.bss_len,
        }
    }

    fn define_symbol(&mut self, line_no: u32, name: String) {
        if self.symbol_names.contains_key(&name) {
            self.error(line_no, format!("duplicate symbol: {}", name));
            return;
        }
        let symbol = Symbol {
            name: name.clone(),
            section: self.current,
            offset: self.current_offset(),
            global: false,
        };
        self.symbol_names.insert(name, self.symbols.len());
        self.symbols.push(symbol);
    }

    fn emit_data(&mut self, line_no: u32, size: u8, values: &[DataValue]) {
        for value in values {
            match (self.current, value) {
                (SectionId::Bss, DataValue::Integer(0)) => self.bss_len += size as u64,
                (SectionId::Bss, _) => {
                    self.error(line_no, "only zero values allowed in .bss");
                }
                (_, DataValue::Integer(v)) => {
                    if !fits_in(*v, size) {
                        self.error(line_no, format!("value {} does not fit in {} bytes", v, size));
                        continue;
                    }
                    let section = self.current_bytes();
                    section.extend_from_slice(&v.to_le_bytes()[..size as usize]);
                }
                (_, DataValue::Symbol(sym)) => {
                    if size < 4 {
                        self.error(
                            line_no,
                            format!("symbol reference needs .long or .quad, not {} bytes", size),
                        );
                        continue;
                    }
                    let reloc = Relocation {
                        offset: self.current_offset(),
                        symbol: sym.clone(),
                        size,
                        pc_relative: false,
                        addend: 0,
                    };
                    match self.current {
                        SectionId::Text => self.text.relocations.push(reloc),
                        SectionId::Data => self.data_relocs.push(reloc),
                        SectionId::Bss => unreachable!(),
                    }
                    let section = self.current_bytes();
                    section.extend_from_slice(&[0u8; 8][..size as usize]);
                }
            }
        }
    }

    fn current_bytes(&mut self) -> &mut Vec<u8> {
        match self.current {
            SectionId::Text => &mut self.text.bytes,
            SectionId::Data => &mut self.data,
            SectionId::Bss => unreachable!("no byte image for .bss"),
        }
    }

    fn encode_instruction(&mut self, line_no: u32, mut insn: Instruction) {
        if self.current != SectionId::Text {
            self.error(
                line_no,
                format!("instruction outside .text: {}", insn.mnemonic),
            );
            return;
        }
        self.substitute_equates(&mut insn);
        if let Err(message) = self.text.encode(&insn) {
            self.error(line_no, message);
        }
    }

    /// Replace `.equ`/`.set` constants referenced in operands.
    fn substitute_equates(&mut self, insn: &mut Instruction) {
        for op in &mut insn.operands {
            match op {
                Operand::Immediate(Immediate::Symbol(sym)) => {
                    if let Some(&value) = self.equates.get(sym) {
                        *op = Operand::Immediate(Immediate::Integer(value));
                    }
                }
                Operand::Memory(mem) => {
                    if let Displacement::Symbol(sym) = &mem.displacement {
                        if let Some(&value) = self.equates.get(sym) {
                            mem.displacement = Displacement::Integer(value);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn finish(mut self) -> Result<AsmOutput, CoreError> {
        for symbol in &mut self.symbols {
            symbol.global = self.globals.contains(&symbol.name);
        }

        if !self.errors.is_empty() {
            self.errors.sort_by_key(|(n, _)| *n);
            let line = self.errors[0].0;
            let message = self
                .errors
                .iter()
                .map(|(n, m)| format!("line {}: {}", n, m))
                .collect::<Vec<_>>()
                .join("\n");
            return Err(CoreError::Syntax { line, col: 1, message });
        }

        let mut relocations: Vec<SectionReloc> = self
            .text
            .relocations
            .iter()
            .cloned()
            .map(|reloc| SectionReloc { section: SectionId::Text, reloc })
            .collect();
        relocations.extend(
            self.data_relocs
                .iter()
                .cloned()
                .map(|reloc| SectionReloc { section: SectionId::Data, reloc }),
        );

        // Every relocation target must be a defined symbol.
        for r in &relocations {
            if !self.symbol_names.contains_key(&r.reloc.symbol) {
                return Err(CoreError::UndefinedSymbol(r.reloc.symbol.clone()));
            }
        }

        let entry_offset = match self.symbol_names.get("_start") {
            None => return Err(CoreError::UndefinedSymbol("_start".to_string())),
            Some(&idx) => {
                let start = &self.symbols[idx];
                if start.section != SectionId::Text {
                    return Err(CoreError::Syntax {
                        line: 1,
                        col: 1,
                        message: "_start must be defined in .text".to_string(),
                    });
                }
                start.offset
            }
        };

        Ok(AsmOutput {
            text: self.text.bytes,
            data: self.data,
            bss_len: self.bss_len,
            symbols: self.symbols,
            relocations,
            entry_offset,
        })
    }
}

fn fits_in(value: i64, size: u8) -> bool {
    match size {
        1 => i8::try_from(value).is_ok() || u8::try_from(value).is_ok(),
        2 => i16::try_from(value).is_ok() || u16::try_from(value).is_ok(),
        4 => i32::try_from(value).is_ok() || u32::try_from(value).is_ok(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = r#"
.text
.global _start
_start:
    movq $1, %rax
    movq $1, %rdi
    leaq msg(%rip), %rsi
    movq $len, %rdx
    syscall
    movq $60, %rax
    xorq %rdi, %rdi
    syscall
.data
msg:
    .ascii "Hello\n"
.equ len, 6
"#;

    #[test]
    fn assembles_hello_with_cross_section_relocation() {
        let out = assemble(HELLO).unwrap();
        assert!(!out.text.is_empty());
        assert_eq!(out.data, b"Hello\n");
        assert_eq!(out.entry_offset, 0);

        let msg = out.symbol("msg").unwrap();
        assert_eq!(msg.section, SectionId::Data);
        assert_eq!(msg.offset, 0);
        assert!(out.symbol("_start").unwrap().global);

        // One RIP-relative reference from .text into .data.
        let rip: Vec<_> = out
            .relocations
            .iter()
            .filter(|r| r.reloc.pc_relative)
            .collect();
        assert_eq!(rip.len(), 1);
        assert_eq!(rip[0].reloc.symbol, "msg");
        assert_eq!(rip[0].section, SectionId::Text);
    }

    #[test]
    fn equ_substitutes_into_immediates() {
        let out = assemble(HELLO).unwrap();
        // `movq $len, %rdx` became a plain integer immediate: no relocation
        // for `len` and no symbol either.
        assert!(out.relocations.iter().all(|r| r.reloc.symbol != "len"));
        assert!(out.symbol("len").is_none());
    }

    #[test]
    fn missing_start_is_fatal() {
        let err = assemble(".text\nfoo:\n    ret\n").unwrap_err();
        assert!(matches!(err, CoreError::UndefinedSymbol(s) if s == "_start"));
    }

    #[test]
    fn undefined_relocation_target_is_fatal() {
        let err = assemble(".text\n.global _start\n_start:\n    jmp nowhere\n").unwrap_err();
        assert!(matches!(err, CoreError::UndefinedSymbol(s) if s == "nowhere"));
    }

    #[test]
    fn errors_accumulate_and_join() {
        let src = ".text\n_start:\n    frobq %rax\n    movq %bad, %rax\n";
        let err = assemble(src).unwrap_err();
        let CoreError::Syntax { line, message, .. } = err else {
            panic!("expected syntax error");
        };
        assert_eq!(line, 3);
        assert_eq!(message.lines().count(), 2);
        assert!(message.contains("line 3"));
        assert!(message.contains("line 4"));
    }

    #[test]
    fn bss_reserves_zeroed_space() {
        let src = "
.text
.global _start
_start:
    leaq buf(%rip), %rax
    movq $60, %rax
    xorq %rdi, %rdi
    syscall
.bss
buf:
    .quad 0
    .quad 0
";
        let out = assemble(src).unwrap();
        assert_eq!(out.bss_len, 16);
        assert_eq!(out.symbol("buf").unwrap().section, SectionId::Bss);
    }

    #[test]
    fn duplicate_labels_are_rejected() {
        let src = ".text\n_start:\n_start:\n    ret\n";
        let err = assemble(src).unwrap_err();
        assert!(matches!(err, CoreError::Syntax { .. }));
    }

    #[test]
    fn quad_symbol_in_data_emits_absolute_relocation() {
        let src = "
.text
.global _start
_start:
    movq $60, %rax
    xorq %rdi, %rdi
    syscall
.data
table:
    .quad _start
    .long _start
";
        let out = assemble(src).unwrap();
        let abs: Vec<_> = out
            .relocations
            .iter()
            .filter(|r| r.section == SectionId::Data)
            .collect();
        assert_eq!(abs.len(), 2);
        assert_eq!(abs[0].reloc.size, 8);
        assert_eq!(abs[0].reloc.offset, 0);
        assert_eq!(abs[1].reloc.size, 4);
        assert_eq!(abs[1].reloc.offset, 8);
    }
}
