//! Linux syscall surface for the emulator.
//!
//! Installed around a [`Machine`], the adapter drives execution one
//! instruction at a time. When a `syscall` retires it dispatches on
//! `%rax`, services the call against the per-run file-descriptor table,
//! heap, and the virtual file store, then either commits a result into
//! `%rax` or stops the run with an exit code. Errnos go back to the guest
//! as two's-complement negatives; they never become host errors.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::fs::FileStore;
use super::sink::OutputSink;
use super::{CpuFault, Event, Machine, Reg, RegisterSnapshot, StopHandle};

// Linux errno values, returned negated.
const ENOENT: u64 = 2;
const EIO: u64 = 5;
const EBADF: u64 = 9;
const EINVAL: u64 = 22;
const ENOSYS: u64 = 38;

/// Fixed base of the guest heap; `brk` grows upward from here.
pub const HEAP_BASE: u64 = 0x80_0000;
/// The break may move at most this far above the base.
pub const HEAP_LIMIT: u64 = 16 * 1024 * 1024;

const STACK_BYTES: u64 = 1024 * 1024;
const GUEST_ARGV: &[&str] = &["/bin/program"];
const GUEST_ENVP: &[&str] = &["PATH=/bin", "HOME=/"];

const MAP_ANONYMOUS: u64 = 0x20;

/// One open descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum FdEntry {
    Stdin,
    Stdout,
    Stderr,
    File { path: String, offset: u64 },
}

/// Per-run descriptor table. Regular descriptors count up from 3 and are
/// never reused within a run.
#[derive(Debug)]
pub struct FdTable {
    entries: BTreeMap<u64, FdEntry>,
    next_fd: u64,
}

impl FdTable {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(0, FdEntry::Stdin);
        entries.insert(1, FdEntry::Stdout);
        entries.insert(2, FdEntry::Stderr);
        Self { entries, next_fd: 3 }
    }

    pub fn open(&mut self, path: &str) -> u64 {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.entries.insert(
            fd,
            FdEntry::File { path: path.to_string(), offset: 0 },
        );
        fd
    }

    pub fn get_mut(&mut self, fd: u64) -> Option<&mut FdEntry> {
        self.entries.get_mut(&fd)
    }

    pub fn close(&mut self, fd: u64) -> bool {
        self.entries.remove(&fd).is_some()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Program-break state. Pages below the break are zero-initialized and
/// writable; the backing region grows in 4 KiB steps.
#[derive(Debug)]
pub struct Heap {
    base: u64,
    brk: u64,
    mapped: bool,
}

impl Heap {
    pub fn new() -> Self {
        Self { base: HEAP_BASE, brk: HEAP_BASE, mapped: false }
    }

    pub fn brk(&self) -> u64 {
        self.brk
    }

    /// The `brk` syscall. A zero or out-of-window address returns the
    /// current break unchanged; the guest sees no error.
    pub fn set_brk(&mut self, machine: &mut dyn Machine, addr: u64) -> u64 {
        if addr == 0 {
            return self.brk;
        }
        if addr < self.base || addr - self.base >= HEAP_LIMIT {
            return self.brk;
        }
        let used = addr - self.base;
        let backing = ((used + 0xFFF) & !0xFFF).max(0x1000);
        if !self.mapped {
            machine.mem_init_zero_named(self.base, backing, "heap");
            self.mapped = true;
        } else {
            machine.mem_resize_region(self.base, backing);
        }
        self.brk = addr;
        self.brk
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// What a run produced. `wall_ms` covers execution only, not compilation.
pub struct VmRun {
    pub exit_code: u8,
    pub wall_ms: u64,
    pub instruction_count: u64,
    pub registers: RegisterSnapshot,
}

/// The adapter itself: per-run state plus borrowed capabilities.
pub struct HostAdapter<'a> {
    store: &'a mut FileStore,
    sink: &'a mut dyn OutputSink,
    stop: StopHandle,
    fd_table: FdTable,
    heap: Heap,
    /// Abort the run with a fault after this many instructions, if set.
    pub instruction_limit: Option<u64>,
}

enum Disposition {
    /// Result committed to `%rax`; keep stepping.
    Commit(u64),
    /// Stop the run with this exit code.
    Stop(u8),
}

impl<'a> HostAdapter<'a> {
    pub fn new(store: &'a mut FileStore, sink: &'a mut dyn OutputSink, stop: StopHandle) -> Self {
        Self {
            store,
            sink,
            stop,
            fd_table: FdTable::new(),
            heap: Heap::new(),
            instruction_limit: None,
        }
    }

    /// Run a machine to completion. Resets the descriptor table and heap,
    /// builds the start stack, then steps until the guest exits, faults,
    /// or a stop is requested.
    pub fn run(&mut self, machine: &mut dyn Machine) -> Result<VmRun, CpuFault> {
        machine.init_stack_program_start(STACK_BYTES, GUEST_ARGV, GUEST_ENVP)?;
        self.fd_table = FdTable::new();
        self.heap = Heap::new();

        let started = Instant::now();
        let mut instruction_count: u64 = 0;

        let exit_code = loop {
            if self.stop.is_stop_requested() {
                break 130;
            }
            if let Some(limit) = self.instruction_limit {
                if instruction_count >= limit {
                    return Err(CpuFault::new(
                        machine.reg_read_64(Reg::Rip),
                        format!("instruction limit of {} exceeded", limit),
                    ));
                }
            }
            match machine.step()? {
                Event::Retired => instruction_count += 1,
                Event::Syscall => {
                    instruction_count += 1;
                    match self.handle_syscall(machine)? {
                        Disposition::Commit(result) => {
                            machine.reg_write_64(Reg::Rax, result);
                        }
                        Disposition::Stop(code) => break code,
                    }
                }
            }
        };

        Ok(VmRun {
            exit_code,
            wall_ms: started.elapsed().as_millis() as u64,
            instruction_count,
            registers: RegisterSnapshot::capture(machine),
        })
    }

    fn handle_syscall(&mut self, machine: &mut dyn Machine) -> Result<Disposition, CpuFault> {
        let nr = machine.reg_read_64(Reg::Rax);
        let result = match nr {
            0 => self.sys_read(machine)?,
            1 => self.sys_write(machine)?,
            2 => self.sys_open(machine)?,
            3 => self.sys_close(machine),
            4 => self.sys_stat(machine)?,
            5 => self.sys_fstat(machine)?,
            9 => self.sys_mmap(machine),
            12 => {
                let addr = machine.reg_read_64(Reg::Rdi);
                self.heap.set_brk(machine, addr)
            }
            60 | 231 => {
                let code = machine.reg_read_64(Reg::Rdi);
                return Ok(Disposition::Stop((code & 0xFF) as u8));
            }
            _ => neg(ENOSYS),
        };
        Ok(Disposition::Commit(result))
    }

    fn sys_read(&mut self, machine: &mut dyn Machine) -> Result<u64, CpuFault> {
        let fd = machine.reg_read_64(Reg::Rdi);
        let buf = machine.reg_read_64(Reg::Rsi);
        let len = machine.reg_read_64(Reg::Rdx);

        let entry = match self.fd_table.get_mut(fd) {
            None | Some(FdEntry::Stdout) | Some(FdEntry::Stderr) => return Ok(neg(EBADF)),
            // No input stream is wired to the guest; stdin is at EOF.
            Some(FdEntry::Stdin) => return Ok(0),
            Some(entry) => entry,
        };
        let FdEntry::File { path, offset } = entry else {
            unreachable!()
        };

        let Some(bytes) = self.store.read(path) else {
            // The descriptor outlived its backing file.
            return Ok(neg(EIO));
        };
        let start = (*offset).min(bytes.len() as u64) as usize;
        let count = (len as usize).min(bytes.len() - start);
        let chunk = bytes[start..start + count].to_vec();
        *offset += count as u64;
        machine.mem_write_bytes(buf, &chunk)?;
        Ok(count as u64)
    }

    fn sys_write(&mut self, machine: &mut dyn Machine) -> Result<u64, CpuFault> {
        let fd = machine.reg_read_64(Reg::Rdi);
        let buf = machine.reg_read_64(Reg::Rsi);
        let len = machine.reg_read_64(Reg::Rdx);

        let bytes = machine.mem_read_bytes(buf, len)?;
        match self.fd_table.get_mut(fd) {
            Some(FdEntry::Stdout) => {
                self.sink.on_stdout(&bytes);
                Ok(len)
            }
            Some(FdEntry::Stderr) => {
                self.sink.on_stderr(&bytes);
                Ok(len)
            }
            Some(FdEntry::File { path, offset }) => {
                // Positioned overwrite-extend at the descriptor offset.
                let mut content = self.store.read(path).map(<[u8]>::to_vec).unwrap_or_default();
                let start = (*offset).min(content.len() as u64) as usize;
                let end = start + bytes.len();
                if end > content.len() {
                    content.resize(end, 0);
                }
                content[start..end].copy_from_slice(&bytes);
                *offset += bytes.len() as u64;
                let path = path.clone();
                self.store.write(&path, content);
                Ok(len)
            }
            _ => Ok(neg(EBADF)),
        }
    }

    fn sys_open(&mut self, machine: &mut dyn Machine) -> Result<u64, CpuFault> {
        let path = machine.read_c_string(machine.reg_read_64(Reg::Rdi))?;
        if self.store.read(&path).is_none() {
            return Ok(neg(ENOENT));
        }
        Ok(self.fd_table.open(&path))
    }

    fn sys_close(&mut self, machine: &mut dyn Machine) -> u64 {
        let fd = machine.reg_read_64(Reg::Rdi);
        if self.fd_table.close(fd) {
            0
        } else {
            neg(EBADF)
        }
    }

    fn sys_stat(&mut self, machine: &mut dyn Machine) -> Result<u64, CpuFault> {
        let path = machine.read_c_string(machine.reg_read_64(Reg::Rdi))?;
        let buf = machine.reg_read_64(Reg::Rsi);
        match self.store.size(&path) {
            Some(size) => {
                write_stat(machine, buf, size)?;
                Ok(0)
            }
            None => Ok(neg(ENOENT)),
        }
    }

    fn sys_fstat(&mut self, machine: &mut dyn Machine) -> Result<u64, CpuFault> {
        let fd = machine.reg_read_64(Reg::Rdi);
        let buf = machine.reg_read_64(Reg::Rsi);
        let size = match self.fd_table.get_mut(fd) {
            None => return Ok(neg(EBADF)),
            Some(FdEntry::File { path, .. }) => self.store.size(path).unwrap_or(0),
            // The standard streams report a zero length.
            Some(_) => 0,
        };
        write_stat(machine, buf, size)?;
        Ok(0)
    }

    fn sys_mmap(&mut self, machine: &mut dyn Machine) -> u64 {
        let len = machine.reg_read_64(Reg::Rsi);
        let prot = machine.reg_read_64(Reg::Rdx);
        let flags = machine.reg_read_64(Reg::R10);
        if flags & MAP_ANONYMOUS == 0 {
            // File-backed mapping is out of scope.
            return neg(EINVAL);
        }
        let va = machine.mem_init_zero_anywhere(len);
        machine.mem_prot(va, prot as u32);
        va
    }
}

/// Two's-complement encoding of `-errno` in `%rax`.
fn neg(errno: u64) -> u64 {
    (errno as i64).wrapping_neg() as u64
}

/// Fill the fields of `struct stat` the guest contract defines: `st_mode`
/// (regular file, 0755) at offset 16 and `st_size` at offset 48. The rest
/// of the buffer is left untouched.
fn write_stat(machine: &mut dyn Machine, buf: u64, size: u64) -> Result<(), CpuFault> {
    machine.mem_write_bytes(buf + 16, &0o100755u32.to_le_bytes())?;
    machine.mem_write_bytes(buf + 48, &(size as i64).to_le_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::sink::CaptureSink;

    /// Register file plus flat memory, enough to service syscalls without
    /// decoding instructions.
    struct MockMachine {
        regs: [u64; 17],
        mem: Vec<u8>,
        regions: Vec<(u64, u64)>,
    }

    impl MockMachine {
        fn new() -> Self {
            Self { regs: [0; 17], mem: vec![0; 0x10000], regions: Vec::new() }
        }

        fn set(&mut self, reg: Reg, value: u64) {
            self.reg_write_64(reg, value);
        }

        fn put_string(&mut self, va: u64, s: &str) {
            let va = va as usize;
            self.mem[va..va + s.len()].copy_from_slice(s.as_bytes());
            self.mem[va + s.len()] = 0;
        }
    }

    fn slot(reg: Reg) -> usize {
        match reg {
            Reg::Rax => 0,
            Reg::Rcx => 1,
            Reg::Rdx => 2,
            Reg::Rbx => 3,
            Reg::Rsp => 4,
            Reg::Rbp => 5,
            Reg::Rsi => 6,
            Reg::Rdi => 7,
            Reg::R8 => 8,
            Reg::R9 => 9,
            Reg::R10 => 10,
            Reg::R11 => 11,
            Reg::R12 => 12,
            Reg::R13 => 13,
            Reg::R14 => 14,
            Reg::R15 => 15,
            Reg::Rip => 16,
        }
    }

    impl Machine for MockMachine {
        fn reg_read_64(&self, reg: Reg) -> u64 {
            self.regs[slot(reg)]
        }

        fn reg_write_64(&mut self, reg: Reg, value: u64) {
            self.regs[slot(reg)] = value;
        }

        fn mem_read_bytes(&self, va: u64, len: u64) -> Result<Vec<u8>, CpuFault> {
            let va = va as usize;
            Ok(self.mem[va..va + len as usize].to_vec())
        }

        fn mem_write_bytes(&mut self, va: u64, bytes: &[u8]) -> Result<(), CpuFault> {
            let va = va as usize;
            self.mem[va..va + bytes.len()].copy_from_slice(bytes);
            Ok(())
        }

        fn mem_init_zero_named(&mut self, va: u64, len: u64, _name: &str) {
            self.regions.push((va, len));
        }

        fn mem_resize_region(&mut self, va: u64, new_len: u64) {
            if let Some(r) = self.regions.iter_mut().find(|(base, _)| *base == va) {
                r.1 = new_len;
            }
        }

        fn mem_init_zero_anywhere(&mut self, len: u64) -> u64 {
            self.regions.push((0x5000_0000, len));
            0x5000_0000
        }

        fn step(&mut self) -> Result<Event, CpuFault> {
            unimplemented!("mock machine is driven through handle_syscall")
        }
    }

    fn dispatch(
        adapter: &mut HostAdapter<'_>,
        machine: &mut MockMachine,
        nr: u64,
    ) -> u64 {
        machine.set(Reg::Rax, nr);
        match adapter.handle_syscall(machine).unwrap() {
            Disposition::Commit(v) => v,
            Disposition::Stop(code) => code as u64,
        }
    }

    #[test]
    fn open_read_close_seeded_file() {
        let mut store = FileStore::new();
        let mut sink = CaptureSink::new();
        let mut adapter = HostAdapter::new(&mut store, &mut sink, StopHandle::new());
        let mut machine = MockMachine::new();

        machine.put_string(0x100, "/etc/hostname");
        machine.set(Reg::Rdi, 0x100);
        let fd = dispatch(&mut adapter, &mut machine, 2);
        assert_eq!(fd, 3);

        machine.set(Reg::Rdi, fd);
        machine.set(Reg::Rsi, 0x200);
        machine.set(Reg::Rdx, 100);
        let n = dispatch(&mut adapter, &mut machine, 0);
        assert_eq!(n, 10);
        assert_eq!(&machine.mem[0x200..0x200 + 10], b"helixcore\n");

        // Offset advanced to EOF; the next read returns zero.
        let n = dispatch(&mut adapter, &mut machine, 0);
        assert_eq!(n, 0);

        machine.set(Reg::Rdi, fd);
        assert_eq!(dispatch(&mut adapter, &mut machine, 3), 0);
        // Closed descriptor: EBADF on both close and read.
        assert_eq!(dispatch(&mut adapter, &mut machine, 3), neg(EBADF));
        machine.set(Reg::Rsi, 0x200);
        machine.set(Reg::Rdx, 1);
        assert_eq!(dispatch(&mut adapter, &mut machine, 0), neg(EBADF));
    }

    #[test]
    fn descriptors_count_up_and_never_recycle() {
        let mut store = FileStore::new();
        let mut sink = CaptureSink::new();
        let mut adapter = HostAdapter::new(&mut store, &mut sink, StopHandle::new());
        let mut machine = MockMachine::new();

        machine.put_string(0x100, "/proc/version");
        machine.set(Reg::Rdi, 0x100);
        let a = dispatch(&mut adapter, &mut machine, 2);
        machine.set(Reg::Rdi, a);
        dispatch(&mut adapter, &mut machine, 3);
        machine.set(Reg::Rdi, 0x100);
        let b = dispatch(&mut adapter, &mut machine, 2);
        assert_eq!(a, 3);
        assert_eq!(b, 4);
    }

    #[test]
    fn open_missing_file_is_enoent() {
        let mut store = FileStore::new();
        let mut sink = CaptureSink::new();
        let mut adapter = HostAdapter::new(&mut store, &mut sink, StopHandle::new());
        let mut machine = MockMachine::new();

        machine.put_string(0x100, "/nonexistent");
        machine.set(Reg::Rdi, 0x100);
        let r = dispatch(&mut adapter, &mut machine, 2);
        assert_eq!(r, 0xFFFF_FFFF_FFFF_FFFE);
    }

    #[test]
    fn write_routes_to_sinks_one_call_per_syscall() {
        let mut store = FileStore::new();
        let mut sink = CaptureSink::new();
        {
            let mut adapter = HostAdapter::new(&mut store, &mut sink, StopHandle::new());
            let mut machine = MockMachine::new();
            machine.mem[0x300..0x305].copy_from_slice(b"hello");
            machine.set(Reg::Rdi, 1);
            machine.set(Reg::Rsi, 0x300);
            machine.set(Reg::Rdx, 5);
            assert_eq!(dispatch(&mut adapter, &mut machine, 1), 5);
            machine.set(Reg::Rdi, 2);
            assert_eq!(dispatch(&mut adapter, &mut machine, 1), 5);
        }
        assert_eq!(sink.stdout, b"hello");
        assert_eq!(sink.stderr, b"hello");
    }

    #[test]
    fn write_to_regular_fd_updates_store_at_offset() {
        let mut store = FileStore::new();
        store.write("/tmp/out", b"abcdef".to_vec());
        let mut sink = CaptureSink::new();
        let mut adapter = HostAdapter::new(&mut store, &mut sink, StopHandle::new());
        let mut machine = MockMachine::new();

        machine.put_string(0x100, "/tmp/out");
        machine.set(Reg::Rdi, 0x100);
        let fd = dispatch(&mut adapter, &mut machine, 2);

        machine.mem[0x300..0x308].copy_from_slice(b"XYZWWWWW");
        machine.set(Reg::Rdi, fd);
        machine.set(Reg::Rsi, 0x300);
        machine.set(Reg::Rdx, 3);
        assert_eq!(dispatch(&mut adapter, &mut machine, 1), 3);
        // Overwrites at offset 0, then extends past EOF on the next write.
        machine.set(Reg::Rdx, 8);
        assert_eq!(dispatch(&mut adapter, &mut machine, 1), 8);
        assert_eq!(store.read("/tmp/out").unwrap(), b"XYZXYZWWWWW");
    }

    #[test]
    fn stat_writes_size_and_mode_fields() {
        let mut store = FileStore::new();
        let mut sink = CaptureSink::new();
        let mut adapter = HostAdapter::new(&mut store, &mut sink, StopHandle::new());
        let mut machine = MockMachine::new();

        machine.put_string(0x100, "/etc/hostname");
        machine.set(Reg::Rdi, 0x100);
        machine.set(Reg::Rsi, 0x400);
        assert_eq!(dispatch(&mut adapter, &mut machine, 4), 0);
        let mode = u32::from_le_bytes(machine.mem[0x410..0x414].try_into().unwrap());
        let size = u64::from_le_bytes(machine.mem[0x430..0x438].try_into().unwrap());
        assert_eq!(mode, 0o100755);
        assert_eq!(size, 10);
    }

    #[test]
    fn brk_window_boundaries() {
        let mut store = FileStore::new();
        let mut sink = CaptureSink::new();
        let mut adapter = HostAdapter::new(&mut store, &mut sink, StopHandle::new());
        let mut machine = MockMachine::new();

        // brk(0) reports the base on a fresh run.
        machine.set(Reg::Rdi, 0);
        assert_eq!(dispatch(&mut adapter, &mut machine, 12), HEAP_BASE);

        // brk(base) is a legal no-op.
        machine.set(Reg::Rdi, HEAP_BASE);
        assert_eq!(dispatch(&mut adapter, &mut machine, 12), HEAP_BASE);

        // One below the limit is accepted.
        let almost = HEAP_BASE + HEAP_LIMIT - 1;
        machine.set(Reg::Rdi, almost);
        assert_eq!(dispatch(&mut adapter, &mut machine, 12), almost);

        // The limit itself is rejected: current break comes back unchanged.
        machine.set(Reg::Rdi, HEAP_BASE + HEAP_LIMIT);
        assert_eq!(dispatch(&mut adapter, &mut machine, 12), almost);

        // Backing region covers the break, rounded up to a page.
        let (base, len) = machine.regions[machine.regions.len() - 1];
        assert_eq!(base, HEAP_BASE);
        assert_eq!(len, (HEAP_LIMIT - 1 + 0xFFF) & !0xFFF);
    }

    #[test]
    fn mmap_requires_anonymous() {
        let mut store = FileStore::new();
        let mut sink = CaptureSink::new();
        let mut adapter = HostAdapter::new(&mut store, &mut sink, StopHandle::new());
        let mut machine = MockMachine::new();

        machine.set(Reg::Rsi, 0x2000);
        machine.set(Reg::R10, 0x22); // MAP_PRIVATE | MAP_ANONYMOUS
        let va = dispatch(&mut adapter, &mut machine, 9);
        assert_eq!(va, 0x5000_0000);

        machine.set(Reg::R10, 0x2); // MAP_PRIVATE only
        assert_eq!(dispatch(&mut adapter, &mut machine, 9), neg(EINVAL));
    }

    #[test]
    fn unknown_syscall_is_enosys() {
        let mut store = FileStore::new();
        let mut sink = CaptureSink::new();
        let mut adapter = HostAdapter::new(&mut store, &mut sink, StopHandle::new());
        let mut machine = MockMachine::new();
        let r = dispatch(&mut adapter, &mut machine, 4242);
        assert_eq!(r, 0xFFFF_FFFF_FFFF_FFDA);
    }

    #[test]
    fn exit_masks_to_a_byte() {
        let mut store = FileStore::new();
        let mut sink = CaptureSink::new();
        let mut adapter = HostAdapter::new(&mut store, &mut sink, StopHandle::new());
        let mut machine = MockMachine::new();
        machine.set(Reg::Rdi, 256 + 42);
        machine.set(Reg::Rax, 60);
        let Disposition::Stop(code) = adapter.handle_syscall(&mut machine).unwrap() else {
            panic!("exit must stop the run");
        };
        assert_eq!(code, 42);
    }
}
