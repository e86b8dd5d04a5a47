//! ELF64 executable writer.
//!
//! Emits a little-endian ET_EXEC image with a single RWX PT_LOAD segment:
//! 64-byte ELF header, 56-byte program header, then `.text` and `.data`
//! back to back. `.bss` occupies memory after `.data` but no file bytes.
//! Section virtual addresses are fixed by this layout, so the assembler's
//! relocations are resolved and patched here.

use crate::backend::assembler::{AsmOutput, SectionReloc};
use crate::backend::assembler::parser::SectionId;
use crate::common::error::CoreError;

// ELF identification.
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;

const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 0x3E;

const PT_LOAD: u32 = 1;
const PF_X: u32 = 0x1;
const PF_W: u32 = 0x2;
const PF_R: u32 = 0x4;

/// Load address of the image; the file is mapped whole at this base.
pub const LOAD_VADDR: u64 = 0x40_0000;
/// Size of the ELF header plus the one program header.
pub const HEADER_SIZE: u64 = 64 + 56;
/// Virtual address of the first `.text` byte.
pub const TEXT_VADDR: u64 = LOAD_VADDR + HEADER_SIZE;

/// A linked image plus the section addresses the layout fixed.
pub struct ElfImage {
    pub bytes: Vec<u8>,
    pub entry: u64,
    pub text_va: u64,
    pub data_va: u64,
    pub bss_va: u64,
    /// End of the loaded image in memory (past `.bss`).
    pub mem_end: u64,
}

impl ElfImage {
    /// Virtual address of a symbol from the assembled output.
    pub fn symbol_va(&self, out: &AsmOutput, name: &str) -> Option<u64> {
        let sym = out.symbol(name)?;
        Some(self.section_va(sym.section) + sym.offset)
    }

    pub fn section_va(&self, section: SectionId) -> u64 {
        match section {
            SectionId::Text => self.text_va,
            SectionId::Data => self.data_va,
            SectionId::Bss => self.bss_va,
        }
    }
}

/// Resolve relocations and emit the executable image.
pub fn write_executable(out: &mut AsmOutput) -> Result<ElfImage, CoreError> {
    if out.text.is_empty() {
        return Err(CoreError::Syntax {
            line: 1,
            col: 1,
            message: ".text is empty".to_string(),
        });
    }

    let text_va = TEXT_VADDR;
    let data_va = text_va + out.text.len() as u64;
    let bss_va = data_va + out.data.len() as u64;

    let relocations = out.relocations.clone();
    for r in &relocations {
        apply_relocation(out, r, text_va, data_va, bss_va)?;
    }

    let file_size = HEADER_SIZE + out.text.len() as u64 + out.data.len() as u64;
    let mem_size = file_size + out.bss_len;
    let entry = text_va + out.entry_offset;

    let mut bytes = Vec::with_capacity(file_size as usize);

    // ELF header.
    bytes.extend_from_slice(&[0x7F, b'E', b'L', b'F']);
    bytes.push(ELFCLASS64);
    bytes.push(ELFDATA2LSB);
    bytes.push(EV_CURRENT);
    bytes.extend_from_slice(&[0u8; 9]); // OS/ABI, ABI version, padding
    bytes.extend_from_slice(&ET_EXEC.to_le_bytes());
    bytes.extend_from_slice(&EM_X86_64.to_le_bytes());
    bytes.extend_from_slice(&(EV_CURRENT as u32).to_le_bytes());
    bytes.extend_from_slice(&entry.to_le_bytes());
    bytes.extend_from_slice(&64u64.to_le_bytes()); // e_phoff
    bytes.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    bytes.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    bytes.extend_from_slice(&64u16.to_le_bytes()); // e_ehsize
    bytes.extend_from_slice(&56u16.to_le_bytes()); // e_phentsize
    bytes.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
    bytes.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
    bytes.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    bytes.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx

    // The single PT_LOAD program header.
    bytes.extend_from_slice(&PT_LOAD.to_le_bytes());
    bytes.extend_from_slice(&(PF_R | PF_W | PF_X).to_le_bytes());
    bytes.extend_from_slice(&0u64.to_le_bytes()); // p_offset
    bytes.extend_from_slice(&LOAD_VADDR.to_le_bytes()); // p_vaddr
    bytes.extend_from_slice(&LOAD_VADDR.to_le_bytes()); // p_paddr
    bytes.extend_from_slice(&file_size.to_le_bytes()); // p_filesz
    bytes.extend_from_slice(&mem_size.to_le_bytes()); // p_memsz
    bytes.extend_from_slice(&0x1000u64.to_le_bytes()); // p_align

    bytes.extend_from_slice(&out.text);
    bytes.extend_from_slice(&out.data);
    debug_assert_eq!(bytes.len() as u64, file_size);

    Ok(ElfImage {
        bytes,
        entry,
        text_va,
        data_va,
        bss_va,
        mem_end: LOAD_VADDR + mem_size,
    })
}

/// Patch one relocation into its section buffer.
///
/// Absolute: `target + addend`, 4 or 8 bytes. PC-relative (always 4
/// bytes): `target + addend - (site + 4)`. Four-byte patches must fit the
/// signed 32-bit range. Targets outside the three sections were already
/// rejected by the assembler as undefined symbols, so an unresolvable
/// record here is skipped rather than re-reported.
fn apply_relocation(
    out: &mut AsmOutput,
    r: &SectionReloc,
    text_va: u64,
    data_va: u64,
    bss_va: u64,
) -> Result<(), CoreError> {
    let section_va = |s: SectionId| match s {
        SectionId::Text => text_va,
        SectionId::Data => data_va,
        SectionId::Bss => bss_va,
    };

    let Some(symbol) = out.symbol(&r.reloc.symbol) else {
        return Ok(());
    };
    let target = section_va(symbol.section)
        .wrapping_add(symbol.offset)
        .wrapping_add(r.reloc.addend as u64);
    let site_va = section_va(r.section) + r.reloc.offset;

    let value: i64 = if r.reloc.pc_relative {
        target.wrapping_sub(site_va + 4) as i64
    } else {
        target as i64
    };

    let site = r.reloc.offset as usize;
    let buffer = match r.section {
        SectionId::Text => &mut out.text,
        SectionId::Data => &mut out.data,
        SectionId::Bss => return Ok(()),
    };

    match r.reloc.size {
        8 => {
            buffer[site..site + 8].copy_from_slice(&value.to_le_bytes());
        }
        _ => {
            let narrowed = i32::try_from(value).map_err(|_| CoreError::RelocationOverflow {
                section: r.section.name(),
                offset: r.reloc.offset,
                value,
            })?;
            buffer[site..site + 4].copy_from_slice(&narrowed.to_le_bytes());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::assembler::assemble;

    fn read_u16(bytes: &[u8], off: usize) -> u16 {
        u16::from_le_bytes(bytes[off..off + 2].try_into().unwrap())
    }

    fn read_u64(bytes: &[u8], off: usize) -> u64 {
        u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap())
    }

    fn read_i32(bytes: &[u8], off: usize) -> i32 {
        i32::from_le_bytes(bytes[off..off + 4].try_into().unwrap())
    }

    const EXIT_42: &str = "
.text
.global _start
_start:
    movq $60, %rax
    movq $42, %rdi
    syscall
";

    #[test]
    fn header_fields_are_bit_exact() {
        let mut out = assemble(EXIT_42).unwrap();
        let text_len = out.text.len() as u64;
        let image = write_executable(&mut out).unwrap();
        let b = &image.bytes;

        assert_eq!(&b[0..4], &[0x7F, b'E', b'L', b'F']);
        assert_eq!(&b[4..8], &[2, 1, 1, 0]);
        assert_eq!(read_u16(b, 16), 2); // ET_EXEC
        assert_eq!(read_u16(b, 18), 0x3E); // EM_X86_64
        assert_eq!(read_u64(b, 24), 0x400078); // entry at start of .text
        assert_eq!(read_u64(b, 32), 0x40); // e_phoff
        assert_eq!(read_u16(b, 52), 64);
        assert_eq!(read_u16(b, 54), 56);
        assert_eq!(read_u16(b, 56), 1);

        // PT_LOAD program header at offset 64.
        assert_eq!(u32::from_le_bytes(b[64..68].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(b[68..72].try_into().unwrap()), 7);
        assert_eq!(read_u64(b, 72), 0); // p_offset
        assert_eq!(read_u64(b, 80), 0x400000); // p_vaddr
        assert_eq!(read_u64(b, 96), 120 + text_len); // p_filesz
        assert_eq!(read_u64(b, 104), 120 + text_len); // p_memsz (no .bss)
        assert_eq!(read_u64(b, 112), 0x1000); // p_align

        assert_eq!(b.len() as u64, 120 + text_len);
    }

    #[test]
    fn entry_reflects_start_offset() {
        let src = "
.text
.global _start
pad:
    nop
    nop
_start:
    movq $60, %rax
    movq $0, %rdi
    syscall
";
        let mut out = assemble(src).unwrap();
        assert_eq!(out.entry_offset, 2);
        let image = write_executable(&mut out).unwrap();
        assert_eq!(image.entry, 0x40007A);
        assert_eq!(read_u64(&image.bytes, 24), 0x40007A);
    }

    #[test]
    fn bss_extends_memsz_but_not_filesz() {
        let src = "
.text
.global _start
_start:
    movq $60, %rax
    movq $0, %rdi
    syscall
.bss
buf:
    .quad 0
    .quad 0
";
        let mut out = assemble(src).unwrap();
        let text_len = out.text.len() as u64;
        let image = write_executable(&mut out).unwrap();
        assert_eq!(read_u64(&image.bytes, 96), 120 + text_len);
        assert_eq!(read_u64(&image.bytes, 104), 120 + text_len + 16);
        assert_eq!(image.mem_end, 0x400000 + 120 + text_len + 16);
    }

    #[test]
    fn pc_relative_patch_reaches_data_section() {
        let src = "
.text
.global _start
_start:
    leaq msg(%rip), %rsi
    movq $60, %rax
    movq $0, %rdi
    syscall
.data
msg:
    .ascii \"hi\"
";
        let mut out = assemble(src).unwrap();
        let reloc = out.relocations[0].reloc.clone();
        let text_len = out.text.len() as u64;
        let image = write_executable(&mut out).unwrap();

        // Patched value must equal target - (site + 4): msg sits at the
        // start of .data, the site inside .text.
        let target = 0x400078u64 + text_len;
        let site = 0x400078u64 + reloc.offset;
        let expect = target as i64 - (site as i64 + 4);
        let got = read_i32(&image.bytes, 120 + reloc.offset as usize) as i64;
        assert_eq!(got, expect);
    }

    #[test]
    fn absolute_quad_patch_holds_symbol_address() {
        let src = "
.text
.global _start
_start:
    movq $60, %rax
    movq $0, %rdi
    syscall
.data
table:
    .quad table
";
        let mut out = assemble(src).unwrap();
        let text_len = out.text.len() as u64;
        let image = write_executable(&mut out).unwrap();
        let data_va = 0x400078 + text_len;
        let got = read_u64(&image.bytes, 120 + text_len as usize);
        assert_eq!(got, data_va);
    }
}
