//! Output sinks: the capability interface guest writes stream through.
//!
//! Each guest `write` to descriptor 1 or 2 becomes exactly one sink
//! invocation carrying that write's bytes; nothing is buffered across
//! syscalls and invocations arrive in syscall program order.

use std::io::Write;

pub trait OutputSink {
    fn on_stdout(&mut self, bytes: &[u8]);
    fn on_stderr(&mut self, bytes: &[u8]);
}

/// Accumulates both streams in memory. The workhorse for tests and for
/// callers that want the full output after the run.
#[derive(Debug, Default)]
pub struct CaptureSink {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

impl OutputSink for CaptureSink {
    fn on_stdout(&mut self, bytes: &[u8]) {
        self.stdout.extend_from_slice(bytes);
    }

    fn on_stderr(&mut self, bytes: &[u8]) {
        self.stderr.extend_from_slice(bytes);
    }
}

/// Passes guest output through to the host's own stdout/stderr.
#[derive(Debug, Default)]
pub struct StdioSink;

impl OutputSink for StdioSink {
    fn on_stdout(&mut self, bytes: &[u8]) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(bytes);
        let _ = out.flush();
    }

    fn on_stderr(&mut self, bytes: &[u8]) {
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(bytes);
        let _ = err.flush();
    }
}
