//! The driver sequences the pipeline: C front end (when the input is C),
//! assembler, ELF writer, then the emulator behind the host adapter. It
//! owns the virtual file store and the stop handle, resolves the C front
//! end's source map against the linked image, and annotates guest faults
//! with the nearest source position.

pub mod cli;

use std::str::FromStr;

use serde::Serialize;

use crate::backend::assembler::{self, AsmOutput};
use crate::backend::codegen::{Codegen, SourceMapEntry};
use crate::backend::elf::{self, ElfImage};
use crate::common::error::{CoreError, DiagnosticList};
use crate::common::source::LineIndex;
use crate::frontend::lexer::Lexer;
use crate::frontend::parser::Parser;
use crate::fs::FileStore;
use crate::vm::adapter::HostAdapter;
use crate::vm::cpu::Cpu;
use crate::vm::sink::OutputSink;
use crate::vm::{RegisterSnapshot, StopHandle};

/// Input languages the toolchain accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    C,
    Asm,
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "c" => Ok(Language::C),
            "asm" => Ok(Language::Asm),
            other => Err(format!("unknown language '{}' (expected c or asm)", other)),
        }
    }
}

/// Result of one run, serializable for `--json` consumers.
#[derive(Debug, Serialize)]
pub struct RunOutcome {
    pub exit_code: u8,
    pub wall_ms: u64,
    pub instruction_count: u64,
    pub registers: RegisterSnapshot,
}

/// One source-map record resolved to its virtual address.
#[derive(Debug, Clone, Copy)]
struct ResolvedMapEntry {
    va: u64,
    line: u32,
    col: u32,
}

/// Everything needed to execute: the linked image and the resolved source
/// map (empty for assembly input).
pub struct BuiltProgram {
    pub image: ElfImage,
    source_map: Vec<ResolvedMapEntry>,
}

pub struct Driver {
    store: FileStore,
    stop: StopHandle,
    pub verbose: bool,
    /// Optional safety net against runaway guests; `None` means unbounded.
    pub instruction_limit: Option<u64>,
}

impl Driver {
    pub fn new() -> Self {
        Self {
            store: FileStore::new(),
            stop: StopHandle::new(),
            verbose: false,
            instruction_limit: None,
        }
    }

    pub fn with_store(store: FileStore) -> Self {
        Self { store, ..Self::new() }
    }

    pub fn store_mut(&mut self) -> &mut FileStore {
        &mut self.store
    }

    /// Handle callers can use to cancel a run in progress from another
    /// thread; the guest then exits with code 130.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Compile C source to assembly text plus its source map.
    pub fn compile(&self, source: &str) -> Result<(String, Vec<SourceMapEntry>), CoreError> {
        let line_index = LineIndex::new(source);
        let mut diagnostics = DiagnosticList::new();

        let tokens = Lexer::new(source, &line_index).tokenize(&mut diagnostics);
        if let Some(err) = check_pass(&mut diagnostics) {
            return Err(err);
        }

        let program = Parser::new(tokens, &line_index).parse_program(&mut diagnostics);
        if let Some(err) = check_pass(&mut diagnostics) {
            return Err(err);
        }

        let output = Codegen::new(&line_index).generate(&program)?;
        Ok((output.assembly, output.source_map))
    }

    /// Assemble and link, resolving the source map against the image.
    pub fn build(&self, language: Language, source: &str) -> Result<BuiltProgram, CoreError> {
        let (assembly, map) = match language {
            Language::C => {
                self.log("compile: C front end");
                self.compile(source)?
            }
            Language::Asm => (source.to_string(), Vec::new()),
        };

        self.log("assemble: encoding sections");
        let mut out = assembler::assemble(&assembly)?;
        self.log("link: writing ET_EXEC image");
        let image = elf::write_executable(&mut out)?;
        let source_map = resolve_source_map(&map, &out, &image);

        Ok(BuiltProgram { image, source_map })
    }

    /// Full pipeline: build, then execute with the given sink.
    pub fn run(
        &mut self,
        language: Language,
        source: &str,
        sink: &mut dyn OutputSink,
    ) -> Result<RunOutcome, CoreError> {
        let program = self.build(language, source)?;

        self.log("run: starting emulator");
        let mut cpu = Cpu::from_binary(&program.image.bytes)
            .map_err(CoreError::GuestFault)?;
        let mut adapter = HostAdapter::new(&mut self.store, sink, self.stop.clone());
        adapter.instruction_limit = self.instruction_limit;

        let run = adapter.run(&mut cpu).map_err(|fault| {
            let mut message = fault.to_string();
            if let Some(entry) = lookup_source(&program.source_map, fault.rip) {
                message = format!("{} (source line {}, col {})", message, entry.line, entry.col);
            }
            CoreError::GuestFault(message)
        })?;

        Ok(RunOutcome {
            exit_code: run.exit_code,
            wall_ms: run.wall_ms,
            instruction_count: run.instruction_count,
            registers: run.registers,
        })
    }

    fn log(&self, message: &str) {
        if self.verbose {
            eprintln!("helix: {}", message);
        }
    }
}

impl Default for Driver {
    fn default() -> Self {
        Self::new()
    }
}

fn check_pass(diagnostics: &mut DiagnosticList) -> Option<CoreError> {
    if diagnostics.has_errors() {
        std::mem::take(diagnostics).into_error()
    } else {
        None
    }
}

/// Resolve codegen labels to virtual addresses. The result is strictly
/// increasing by address; a label that produced no code collapses into its
/// successor and is dropped.
fn resolve_source_map(
    map: &[SourceMapEntry],
    out: &AsmOutput,
    image: &ElfImage,
) -> Vec<ResolvedMapEntry> {
    let mut resolved: Vec<ResolvedMapEntry> = Vec::new();
    for entry in map {
        let Some(va) = image.symbol_va(out, &entry.label) else {
            continue;
        };
        if resolved.last().map_or(false, |prev| prev.va == va) {
            continue;
        }
        resolved.push(ResolvedMapEntry { va, line: entry.line, col: entry.col });
    }
    resolved
}

/// Greatest record with `va <= rip`, by binary search.
fn lookup_source(map: &[ResolvedMapEntry], rip: u64) -> Option<ResolvedMapEntry> {
    let idx = map.partition_point(|e| e.va <= rip);
    if idx == 0 {
        None
    } else {
        Some(map[idx - 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::sink::CaptureSink;

    #[test]
    fn language_parses_from_str() {
        assert_eq!("c".parse::<Language>().unwrap(), Language::C);
        assert_eq!("asm".parse::<Language>().unwrap(), Language::Asm);
        assert!("rust".parse::<Language>().is_err());
    }

    #[test]
    fn source_map_is_strictly_increasing_and_searchable() {
        let driver = Driver::new();
        let src = "int a = 1;\nint b = a + 2;\nint c = b * 3;\n";
        let program = driver.build(Language::C, src).unwrap();
        let map = &program.source_map;
        assert!(!map.is_empty());
        for pair in map.windows(2) {
            assert!(pair[0].va < pair[1].va);
        }
        // An address inside the second statement resolves to line 2.
        let probe = map[1].va + 1;
        assert_eq!(lookup_source(map, probe).unwrap().line, 2);
        // Below the first record there is nothing to blame.
        assert!(lookup_source(map, map[0].va - 1).is_none());
    }

    #[test]
    fn compose_law_c_equals_precompiled_asm() {
        let src = "int main(){int i=0;while(i<3){printf(\"%d\\n\",i);i=i+1;}return 0;}";

        let mut driver = Driver::new();
        let mut direct = CaptureSink::new();
        let outcome_c = driver.run(Language::C, src, &mut direct).unwrap();

        let (assembly, _) = driver.compile(src).unwrap();
        let mut via_asm = CaptureSink::new();
        let outcome_asm = driver.run(Language::Asm, &assembly, &mut via_asm).unwrap();

        assert_eq!(outcome_c.exit_code, outcome_asm.exit_code);
        assert_eq!(direct.stdout, via_asm.stdout);
        assert_eq!(direct.stdout_utf8(), "0\n1\n2\n");
    }

    #[test]
    fn guest_fault_is_annotated_with_source_line() {
        let mut driver = Driver::new();
        let mut sink = CaptureSink::new();
        // Division by zero faults inside the second statement.
        let src = "int a = 0;\nint b = 7 / a;\n";
        let err = driver.run(Language::C, src, &mut sink).unwrap_err();
        let CoreError::GuestFault(message) = err else {
            panic!("expected a guest fault");
        };
        assert!(message.contains("divide error"), "message: {}", message);
        assert!(message.contains("source line 2"), "message: {}", message);
    }
}
