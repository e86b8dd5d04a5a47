//! HelixCore: a self-contained toolchain and user-mode runner for x86-64.
//!
//! Source text in a minimal C subset (or AT&T/GAS assembly directly) is
//! compiled to assembly, assembled and statically linked into an ET_EXEC
//! ELF64 image, and executed on an in-process x86-64 emulator with a Linux
//! syscall surface. Program output streams to caller-supplied sinks; the
//! run result carries the exit code, instruction count, and a register
//! snapshot.

pub(crate) mod common;
pub(crate) mod frontend;
pub mod backend;
pub mod driver;
pub mod fs;
pub mod vm;

pub use common::error::CoreError;
pub use driver::{Driver, Language, RunOutcome};
pub use vm::sink::{CaptureSink, OutputSink, StdioSink};
pub use vm::StopHandle;

/// Shared entry point for the CLI binary.
pub fn cli_main() {
    let args: Vec<String> = std::env::args().collect();
    match driver::cli::run_cli(&args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("helix: error: {}", e);
            std::process::exit(1);
        }
    }
}
