//! x86-64 user-mode emulation and the Linux syscall surface.
//!
//! The emulator proper sits behind the [`Machine`] trait so an alternative
//! backend (or a mock in tests) can be substituted; [`cpu::Cpu`] is the
//! interpreter shipped here. [`adapter::HostAdapter`] drives a machine
//! instruction-by-instruction and services its syscalls against the
//! virtual file store.

pub mod adapter;
pub mod cpu;
pub mod sink;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// General-purpose registers plus the instruction pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
}

impl Reg {
    /// ModR/M register number for the sixteen GPRs.
    pub fn from_num(n: u8) -> Reg {
        match n & 15 {
            0 => Reg::Rax,
            1 => Reg::Rcx,
            2 => Reg::Rdx,
            3 => Reg::Rbx,
            4 => Reg::Rsp,
            5 => Reg::Rbp,
            6 => Reg::Rsi,
            7 => Reg::Rdi,
            8 => Reg::R8,
            9 => Reg::R9,
            10 => Reg::R10,
            11 => Reg::R11,
            12 => Reg::R12,
            13 => Reg::R13,
            14 => Reg::R14,
            _ => Reg::R15,
        }
    }
}

/// What one `step()` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// An ordinary instruction retired.
    Retired,
    /// A `syscall` instruction retired; the instruction pointer already
    /// points past it and the handler decides what lands in `%rax`.
    Syscall,
}

/// An unrecoverable guest condition: bad fetch, unmapped access, divide
/// error, or an opcode outside the supported subset.
#[derive(Debug, Clone)]
pub struct CpuFault {
    /// Address of the faulting instruction.
    pub rip: u64,
    pub message: String,
}

impl CpuFault {
    pub fn new(rip: u64, message: impl Into<String>) -> Self {
        Self { rip, message: message.into() }
    }
}

impl std::fmt::Display for CpuFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at rip={:#018x}", self.message, self.rip)
    }
}

/// The emulator contract the host adapter drives.
///
/// `Cpu` implements this for real; tests substitute lighter mocks.
pub trait Machine {
    fn reg_read_64(&self, reg: Reg) -> u64;
    fn reg_write_64(&mut self, reg: Reg, value: u64);

    fn mem_read_bytes(&self, va: u64, len: u64) -> Result<Vec<u8>, CpuFault>;
    fn mem_write_bytes(&mut self, va: u64, bytes: &[u8]) -> Result<(), CpuFault>;

    /// Map a zero-initialized region at a fixed address.
    fn mem_init_zero_named(&mut self, va: u64, len: u64, name: &str);
    /// Grow or shrink a region created by `mem_init_zero_named`.
    fn mem_resize_region(&mut self, va: u64, new_len: u64);
    /// Map a zero-initialized region at an address of the machine's choice.
    fn mem_init_zero_anywhere(&mut self, len: u64) -> u64;
    /// Record protection bits for a region. Advisory; the interpreter does
    /// not enforce them.
    fn mem_prot(&mut self, _va: u64, _prot: u32) {}

    /// Execute one instruction.
    fn step(&mut self) -> Result<Event, CpuFault>;

    /// Build the System V AMD64 process-start stack: argument and
    /// environment strings at the top, then the `[argc][argv...][NULL]
    /// [envp...][NULL][AT_NULL]` vector, with `%rsp` left 16-aligned at
    /// `argc`.
    fn init_stack_program_start(
        &mut self,
        stack_bytes: u64,
        argv: &[&str],
        envp: &[&str],
    ) -> Result<(), CpuFault> {
        const STACK_TOP: u64 = 0x7F10_0000;
        let base = STACK_TOP - stack_bytes;
        self.mem_init_zero_named(base, stack_bytes, "stack");

        let mut cursor = STACK_TOP;
        let mut place = |m: &mut Self, s: &str| -> Result<u64, CpuFault> {
            cursor -= s.len() as u64 + 1;
            m.mem_write_bytes(cursor, s.as_bytes())?;
            Ok(cursor)
        };
        let argv_ptrs: Vec<u64> = argv
            .iter()
            .map(|s| place(self, s))
            .collect::<Result<_, _>>()?;
        let envp_ptrs: Vec<u64> = envp
            .iter()
            .map(|s| place(self, s))
            .collect::<Result<_, _>>()?;

        // argc + argv + NULL + envp + NULL + AT_NULL (two words).
        let words = 1 + argv_ptrs.len() + 1 + envp_ptrs.len() + 1 + 2;
        let mut sp = (cursor - words as u64 * 8) & !15;
        self.reg_write_64(Reg::Rsp, sp);

        let mut write_word = |m: &mut Self, value: u64| -> Result<(), CpuFault> {
            m.mem_write_bytes(sp, &value.to_le_bytes())?;
            sp += 8;
            Ok(())
        };
        write_word(self, argv.len() as u64)?;
        for ptr in &argv_ptrs {
            write_word(self, *ptr)?;
        }
        write_word(self, 0)?;
        for ptr in &envp_ptrs {
            write_word(self, *ptr)?;
        }
        write_word(self, 0)?;
        write_word(self, 0)?; // AT_NULL
        write_word(self, 0)?;
        Ok(())
    }

    /// Read a NUL-terminated guest string, capped at 4096 bytes.
    fn read_c_string(&self, va: u64) -> Result<String, CpuFault> {
        let mut bytes = Vec::new();
        let mut addr = va;
        while bytes.len() < 4096 {
            let b = self.mem_read_bytes(addr, 1)?[0];
            if b == 0 {
                return Ok(String::from_utf8_lossy(&bytes).into_owned());
            }
            bytes.push(b);
            addr += 1;
        }
        Err(CpuFault::new(va, "unterminated guest string"))
    }
}

/// Cooperative cancellation: raising the flag makes the run end with
/// exit code 130 at the next step boundary. Output already streamed is
/// not retracted.
#[derive(Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Snapshot of the integer registers at run end, rendered as lower-case
/// zero-padded hex strings.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterSnapshot {
    pub rax: String,
    pub rbx: String,
    pub rcx: String,
    pub rdx: String,
    pub rsi: String,
    pub rdi: String,
    pub rsp: String,
    pub rbp: String,
    pub rip: String,
}

impl RegisterSnapshot {
    pub fn capture(machine: &dyn Machine) -> Self {
        let hex = |reg: Reg| format!("{:#018x}", machine.reg_read_64(reg));
        Self {
            rax: hex(Reg::Rax),
            rbx: hex(Reg::Rbx),
            rcx: hex(Reg::Rcx),
            rdx: hex(Reg::Rdx),
            rsi: hex(Reg::Rsi),
            rdi: hex(Reg::Rdi),
            rsp: hex(Reg::Rsp),
            rbp: hex(Reg::Rbp),
            rip: hex(Reg::Rip),
        }
    }
}
