//! x86-64 instruction encoder.
//!
//! Encodes parsed instructions into machine code bytes appended to the
//! `.text` buffer. Handles REX prefixes, ModR/M, SIB, and displacement
//! encoding. Symbol references become relocation records resolved by the
//! ELF writer once section addresses are fixed.

use super::parser::{Displacement, Immediate, Instruction, MemoryOperand, Operand};

/// A patch site the ELF writer fills in during layout.
///
/// Absolute records patch `target + addend`; PC-relative records patch
/// `target + addend - (site_va + 4)`. The addend is zero except where an
/// immediate trails the displacement field.
#[derive(Debug, Clone, PartialEq)]
pub struct Relocation {
    /// Offset of the patch site within the section.
    pub offset: u64,
    /// Symbol whose address resolves the patch.
    pub symbol: String,
    /// Patch width in bytes: 4 or 8.
    pub size: u8,
    pub pc_relative: bool,
    pub addend: i64,
}

/// Register encoding (3-bit register number in ModR/M and SIB).
fn reg_num(name: &str) -> Option<u8> {
    match name {
        "al" | "rax" => Some(0),
        "cl" | "rcx" => Some(1),
        "dl" | "rdx" => Some(2),
        "bl" | "rbx" => Some(3),
        "spl" | "rsp" => Some(4),
        "bpl" | "rbp" => Some(5),
        "sil" | "rsi" => Some(6),
        "dil" | "rdi" => Some(7),
        "r8b" | "r8" => Some(0),
        "r9b" | "r9" => Some(1),
        "r10b" | "r10" => Some(2),
        "r11b" | "r11" => Some(3),
        "r12b" | "r12" => Some(4),
        "r13b" | "r13" => Some(5),
        "r14b" | "r14" => Some(6),
        "r15b" | "r15" => Some(7),
        _ => None,
    }
}

/// Does this register need the REX.B/R/X extension bit?
fn needs_rex_ext(name: &str) -> bool {
    matches!(
        name,
        "r8" | "r9" | "r10" | "r11" | "r12" | "r13" | "r14" | "r15"
            | "r8b" | "r9b" | "r10b" | "r11b" | "r12b" | "r13b" | "r14b" | "r15b"
    )
}

/// 8-bit registers that are only reachable with a REX prefix present.
fn is_rex_required_8bit(name: &str) -> bool {
    matches!(name, "spl" | "bpl" | "sil" | "dil")
}

fn is_reg64(name: &str) -> bool {
    matches!(
        name,
        "rax" | "rcx" | "rdx" | "rbx" | "rsp" | "rbp" | "rsi" | "rdi"
            | "r8" | "r9" | "r10" | "r11" | "r12" | "r13" | "r14" | "r15"
    )
}

fn is_reg8(name: &str) -> bool {
    matches!(
        name,
        "al" | "cl" | "dl" | "bl" | "spl" | "bpl" | "sil" | "dil"
            | "r8b" | "r9b" | "r10b" | "r11b" | "r12b" | "r13b" | "r14b" | "r15b"
    )
}

/// Map a condition-code mnemonic suffix to its encoding nibble.
fn cc_from_suffix(cc: &str) -> Result<u8, String> {
    match cc {
        "o" => Ok(0),
        "no" => Ok(1),
        "b" | "c" => Ok(2),
        "ae" | "nb" | "nc" => Ok(3),
        "e" | "z" => Ok(4),
        "ne" | "nz" => Ok(5),
        "be" | "na" => Ok(6),
        "a" | "nbe" => Ok(7),
        "s" => Ok(8),
        "ns" => Ok(9),
        "l" | "nge" => Ok(12),
        "ge" | "nl" => Ok(13),
        "le" | "ng" => Ok(14),
        "g" | "nle" => Ok(15),
        _ => Err(format!("unknown condition code: {}", cc)),
    }
}

/// Appends encoded instructions and their relocation records to one
/// section buffer.
pub struct InstructionEncoder {
    pub bytes: Vec<u8>,
    pub relocations: Vec<Relocation>,
}

impl InstructionEncoder {
    pub fn new() -> Self {
        Self {
            bytes: Vec::new(),
            relocations: Vec::new(),
        }
    }

    pub fn offset(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Encode one instruction, appending its bytes.
    pub fn encode(&mut self, instr: &Instruction) -> Result<(), String> {
        let ops = &instr.operands;
        match instr.mnemonic.as_str() {
            "movq" => self.encode_mov(ops, 8),
            "movb" => self.encode_mov(ops, 1),
            "movzbq" => self.encode_movzbq(ops),
            "leaq" => self.encode_lea(ops),
            "pushq" => self.encode_push(ops),
            "popq" => self.encode_pop(ops),

            "addq" => self.encode_alu(ops, "addq", 0),
            "orq" => self.encode_alu(ops, "orq", 1),
            "andq" => self.encode_alu(ops, "andq", 4),
            "subq" => self.encode_alu(ops, "subq", 5),
            "xorq" => self.encode_alu(ops, "xorq", 6),
            "cmpq" => self.encode_alu(ops, "cmpq", 7),
            "testq" => self.encode_test(ops),

            "imulq" => self.encode_imul(ops),
            "mulq" => self.encode_group3(ops, 4),
            "divq" => self.encode_group3(ops, 6),
            "idivq" => self.encode_group3(ops, 7),
            "notq" => self.encode_group3(ops, 2),
            "negq" => self.encode_group3(ops, 3),

            "incq" => self.encode_group5(ops, 0),
            "decq" => self.encode_group5(ops, 1),

            "cqo" | "cqto" => {
                self.bytes.extend_from_slice(&[0x48, 0x99]);
                Ok(())
            }

            m if m.starts_with("set") => self.encode_setcc(ops, &m[3..]),

            "jmp" => self.encode_jmp(ops),
            m if m.starts_with('j') => self.encode_jcc(ops, &m[1..]),

            "call" => self.encode_call(ops),
            "ret" => {
                self.bytes.push(0xC3);
                Ok(())
            }
            "syscall" => {
                self.bytes.extend_from_slice(&[0x0F, 0x05]);
                Ok(())
            }
            "nop" => {
                self.bytes.push(0x90);
                Ok(())
            }

            other => Err(format!("unhandled instruction: {}", other)),
        }
    }

    // ---- encoding helpers ----

    fn rex(&self, w: bool, r: bool, x: bool, b: bool) -> u8 {
        let mut rex = 0x40u8;
        if w {
            rex |= 0x08;
        }
        if r {
            rex |= 0x04;
        }
        if x {
            rex |= 0x02;
        }
        if b {
            rex |= 0x01;
        }
        rex
    }

    fn modrm(&self, mod_: u8, reg: u8, rm: u8) -> u8 {
        (mod_ << 6) | ((reg & 7) << 3) | (rm & 7)
    }

    fn sib(&self, scale: u8, index: u8, base: u8) -> u8 {
        let scale_bits = match scale {
            2 => 1,
            4 => 2,
            8 => 3,
            _ => 0,
        };
        (scale_bits << 6) | ((index & 7) << 3) | (base & 7)
    }

    /// REX for a reg, reg operation. In AT&T order the source lands in the
    /// ModR/M reg field and the destination in rm.
    fn emit_rex_rr(&mut self, size: u8, reg: &str, rm: &str) {
        let w = size == 8;
        let r = needs_rex_ext(reg);
        let b = needs_rex_ext(rm);
        if w || r || b || is_rex_required_8bit(reg) || is_rex_required_8bit(rm) {
            self.bytes.push(self.rex(w, r, false, b));
        }
    }

    /// REX for a memory operand with `reg` in the reg field.
    fn emit_rex_rm(&mut self, size: u8, reg: &str, mem: &MemoryOperand) {
        let w = size == 8;
        let r = !reg.is_empty() && needs_rex_ext(reg);
        let b = mem.base.as_deref().map_or(false, needs_rex_ext);
        let x = mem.index.as_deref().map_or(false, needs_rex_ext);
        if w || r || b || x || is_rex_required_8bit(reg) {
            self.bytes.push(self.rex(w, r, x, b));
        }
    }

    fn emit_rex_unary(&mut self, size: u8, rm: &str) {
        let w = size == 8;
        let b = needs_rex_ext(rm);
        if w || b || is_rex_required_8bit(rm) {
            self.bytes.push(self.rex(w, false, false, b));
        }
    }

    fn add_relocation(&mut self, symbol: &str, size: u8, pc_relative: bool, addend: i64) {
        self.relocations.push(Relocation {
            offset: self.bytes.len() as u64,
            symbol: symbol.to_string(),
            size,
            pc_relative,
            addend,
        });
    }

    /// ModR/M + SIB + displacement for a memory operand. `reg_field` is the
    /// /r value. `trailing_imm` is the byte count of any immediate that
    /// follows, needed to keep RIP-relative displacements aimed at the next
    /// instruction.
    fn encode_modrm_mem(
        &mut self,
        reg_field: u8,
        mem: &MemoryOperand,
        trailing_imm: i64,
    ) -> Result<(), String> {
        if mem.is_rip_relative() {
            self.bytes.push(self.modrm(0, reg_field, 5));
            match &mem.displacement {
                Displacement::Symbol(sym) => {
                    self.add_relocation(sym, 4, true, -trailing_imm);
                    self.bytes.extend_from_slice(&[0, 0, 0, 0]);
                }
                Displacement::Integer(val) => {
                    self.bytes.extend_from_slice(&(*val as i32).to_le_bytes());
                }
                Displacement::None => {
                    self.bytes.extend_from_slice(&[0, 0, 0, 0]);
                }
            }
            return Ok(());
        }

        let (disp_val, has_symbol) = match &mem.displacement {
            Displacement::None => (0i64, false),
            Displacement::Integer(v) => (*v, false),
            Displacement::Symbol(sym) => {
                self.add_relocation(sym, 4, false, 0);
                (0i64, true)
            }
        };

        // Direct memory reference: SIB with no base, disp32.
        if mem.base.is_none() && mem.index.is_none() {
            self.bytes.push(self.modrm(0, reg_field, 4));
            self.bytes.push(self.sib(1, 4, 5));
            // Relocated displacements were pointed at the wrong offset above:
            // the SIB byte sits between ModR/M and disp32.
            if has_symbol {
                if let Some(reloc) = self.relocations.last_mut() {
                    reloc.offset = self.bytes.len() as u64;
                }
            }
            self.bytes.extend_from_slice(&(disp_val as i32).to_le_bytes());
            return Ok(());
        }

        let base_name = mem.base.as_deref().unwrap_or("");
        let base_num = if base_name.is_empty() {
            5
        } else {
            reg_num(base_name).ok_or_else(|| format!("bad base register: {}", base_name))?
        };

        let need_sib = mem.index.is_some() || (base_num & 7) == 4 || mem.base.is_none();

        let (mod_bits, disp_size) = if has_symbol {
            (2u8, 4u8)
        } else if disp_val == 0 && (base_num & 7) != 5 {
            (0, 0)
        } else if (-128..=127).contains(&disp_val) {
            (1, 1)
        } else {
            (2, 4)
        };

        if need_sib {
            let idx_num = match mem.index.as_deref() {
                Some(idx) => {
                    if idx == "rsp" {
                        return Err("%rsp cannot be an index register".to_string());
                    }
                    reg_num(idx).ok_or_else(|| format!("bad index register: {}", idx))?
                }
                None => 4,
            };
            if mem.base.is_none() {
                self.bytes.push(self.modrm(0, reg_field, 4));
                self.bytes.push(self.sib(mem.scale, idx_num, 5));
                self.bytes.extend_from_slice(&(disp_val as i32).to_le_bytes());
                return Ok(());
            }
            self.bytes.push(self.modrm(mod_bits, reg_field, 4));
            self.bytes.push(self.sib(mem.scale, idx_num, base_num));
        } else {
            self.bytes.push(self.modrm(mod_bits, reg_field, base_num));
        }

        match disp_size {
            0 => {}
            1 => self.bytes.push(disp_val as u8),
            _ => {
                if has_symbol {
                    if let Some(reloc) = self.relocations.last_mut() {
                        reloc.offset = self.bytes.len() as u64;
                    }
                }
                self.bytes.extend_from_slice(&(disp_val as i32).to_le_bytes());
            }
        }
        Ok(())
    }

    // ---- instruction-specific encoders ----

    fn encode_mov(&mut self, ops: &[Operand], size: u8) -> Result<(), String> {
        if ops.len() != 2 {
            return Err("mov requires 2 operands".to_string());
        }
        match (&ops[0], &ops[1]) {
            (Operand::Immediate(imm), Operand::Register(dst)) => {
                self.encode_mov_imm_reg(imm, dst, size)
            }
            (Operand::Register(src), Operand::Register(dst)) => {
                self.check_reg_size(src, size)?;
                self.check_reg_size(dst, size)?;
                let src_num = reg_num(src).ok_or_else(|| format!("bad register: {}", src))?;
                let dst_num = reg_num(dst).ok_or_else(|| format!("bad register: {}", dst))?;
                self.emit_rex_rr(size, src, dst);
                self.bytes.push(if size == 1 { 0x88 } else { 0x89 });
                self.bytes.push(self.modrm(3, src_num, dst_num));
                Ok(())
            }
            (Operand::Memory(mem), Operand::Register(dst)) => {
                self.check_reg_size(dst, size)?;
                let dst_num = reg_num(dst).ok_or_else(|| format!("bad register: {}", dst))?;
                self.emit_rex_rm(size, dst, mem);
                self.bytes.push(if size == 1 { 0x8A } else { 0x8B });
                self.encode_modrm_mem(dst_num, mem, 0)
            }
            (Operand::Register(src), Operand::Memory(mem)) => {
                self.check_reg_size(src, size)?;
                let src_num = reg_num(src).ok_or_else(|| format!("bad register: {}", src))?;
                self.emit_rex_rm(size, src, mem);
                self.bytes.push(if size == 1 { 0x88 } else { 0x89 });
                self.encode_modrm_mem(src_num, mem, 0)
            }
            (Operand::Immediate(Immediate::Integer(val)), Operand::Memory(mem)) => {
                self.emit_rex_rm(size, "", mem);
                self.bytes.push(if size == 1 { 0xC6 } else { 0xC7 });
                let imm_len = if size == 1 { 1 } else { 4 };
                self.encode_modrm_mem(0, mem, imm_len)?;
                if size == 1 {
                    self.bytes.push(*val as u8);
                } else {
                    if i32::try_from(*val).is_err() {
                        return Err(format!("immediate {} does not fit in 32 bits", val));
                    }
                    self.bytes.extend_from_slice(&(*val as i32).to_le_bytes());
                }
                Ok(())
            }
            // Direct-memory source/destination written as a bare symbol.
            (Operand::Label(sym), Operand::Register(_)) | (Operand::Register(_), Operand::Label(sym)) => {
                let mem = MemoryOperand {
                    displacement: Displacement::Symbol(sym.clone()),
                    base: None,
                    index: None,
                    scale: 1,
                };
                let rebuilt = match &ops[0] {
                    Operand::Label(_) => vec![Operand::Memory(mem), ops[1].clone()],
                    _ => vec![ops[0].clone(), Operand::Memory(mem)],
                };
                self.encode_mov(&rebuilt, size)
            }
            _ => Err("unsupported mov operand combination".to_string()),
        }
    }

    fn encode_mov_imm_reg(
        &mut self,
        imm: &Immediate,
        dst: &str,
        size: u8,
    ) -> Result<(), String> {
        let dst_num = reg_num(dst).ok_or_else(|| format!("bad register: {}", dst))?;
        match imm {
            Immediate::Integer(val) => {
                if size == 1 {
                    if needs_rex_ext(dst) || is_rex_required_8bit(dst) {
                        self.bytes.push(self.rex(false, false, false, needs_rex_ext(dst)));
                    }
                    self.bytes.push(0xB0 + (dst_num & 7));
                    self.bytes.push(*val as u8);
                    return Ok(());
                }
                self.check_reg_size(dst, 8)?;
                if i32::try_from(*val).is_ok() {
                    // Sign-extended imm32 form.
                    self.emit_rex_unary(8, dst);
                    self.bytes.push(0xC7);
                    self.bytes.push(self.modrm(3, 0, dst_num));
                    self.bytes.extend_from_slice(&(*val as i32).to_le_bytes());
                } else {
                    // Full 64-bit immediate.
                    self.bytes.push(self.rex(true, false, false, needs_rex_ext(dst)));
                    self.bytes.push(0xB8 + (dst_num & 7));
                    self.bytes.extend_from_slice(&val.to_le_bytes());
                }
                Ok(())
            }
            Immediate::Symbol(sym) => {
                // Symbol address as an immediate: 64-bit form, absolute patch.
                self.check_reg_size(dst, 8)?;
                self.bytes.push(self.rex(true, false, false, needs_rex_ext(dst)));
                self.bytes.push(0xB8 + (dst_num & 7));
                self.add_relocation(sym, 8, false, 0);
                self.bytes.extend_from_slice(&[0u8; 8]);
                Ok(())
            }
        }
    }

    fn encode_movzbq(&mut self, ops: &[Operand]) -> Result<(), String> {
        if ops.len() != 2 {
            return Err("movzbq requires 2 operands".to_string());
        }
        match (&ops[0], &ops[1]) {
            (Operand::Register(src), Operand::Register(dst)) => {
                if !is_reg8(src) {
                    return Err(format!("movzbq source must be a byte register, got %{}", src));
                }
                self.check_reg_size(dst, 8)?;
                let src_num = reg_num(src).ok_or_else(|| format!("bad register: {}", src))?;
                let dst_num = reg_num(dst).ok_or_else(|| format!("bad register: {}", dst))?;
                // Destination occupies the reg field for 0F B6.
                self.emit_rex_rr(8, dst, src);
                self.bytes.extend_from_slice(&[0x0F, 0xB6]);
                self.bytes.push(self.modrm(3, dst_num, src_num));
                Ok(())
            }
            (Operand::Memory(mem), Operand::Register(dst)) => {
                self.check_reg_size(dst, 8)?;
                let dst_num = reg_num(dst).ok_or_else(|| format!("bad register: {}", dst))?;
                self.emit_rex_rm(8, dst, mem);
                self.bytes.extend_from_slice(&[0x0F, 0xB6]);
                self.encode_modrm_mem(dst_num, mem, 0)
            }
            _ => Err("unsupported movzbq operands".to_string()),
        }
    }

    fn encode_lea(&mut self, ops: &[Operand]) -> Result<(), String> {
        if ops.len() != 2 {
            return Err("leaq requires 2 operands".to_string());
        }
        match (&ops[0], &ops[1]) {
            (Operand::Memory(mem), Operand::Register(dst)) => {
                self.check_reg_size(dst, 8)?;
                let dst_num = reg_num(dst).ok_or_else(|| format!("bad register: {}", dst))?;
                self.emit_rex_rm(8, dst, mem);
                self.bytes.push(0x8D);
                self.encode_modrm_mem(dst_num, mem, 0)
            }
            (Operand::Label(sym), Operand::Register(dst)) => {
                let mem = MemoryOperand {
                    displacement: Displacement::Symbol(sym.clone()),
                    base: None,
                    index: None,
                    scale: 1,
                };
                self.encode_lea(&[Operand::Memory(mem), Operand::Register(dst.clone())])
            }
            _ => Err("leaq requires a memory source and register destination".to_string()),
        }
    }

    fn encode_push(&mut self, ops: &[Operand]) -> Result<(), String> {
        if ops.len() != 1 {
            return Err("pushq requires 1 operand".to_string());
        }
        match &ops[0] {
            Operand::Register(reg) => {
                self.check_reg_size(reg, 8)?;
                let num = reg_num(reg).ok_or_else(|| format!("bad register: {}", reg))?;
                if needs_rex_ext(reg) {
                    self.bytes.push(self.rex(false, false, false, true));
                }
                self.bytes.push(0x50 + (num & 7));
                Ok(())
            }
            Operand::Immediate(Immediate::Integer(val)) => {
                if (-128..=127).contains(val) {
                    self.bytes.push(0x6A);
                    self.bytes.push(*val as u8);
                } else if i32::try_from(*val).is_ok() {
                    self.bytes.push(0x68);
                    self.bytes.extend_from_slice(&(*val as i32).to_le_bytes());
                } else {
                    return Err(format!("push immediate {} does not fit in 32 bits", val));
                }
                Ok(())
            }
            Operand::Memory(mem) => {
                self.emit_rex_rm(0, "", mem);
                self.bytes.push(0xFF);
                self.encode_modrm_mem(6, mem, 0)
            }
            _ => Err("unsupported pushq operand".to_string()),
        }
    }

    fn encode_pop(&mut self, ops: &[Operand]) -> Result<(), String> {
        if ops.len() != 1 {
            return Err("popq requires 1 operand".to_string());
        }
        match &ops[0] {
            Operand::Register(reg) => {
                self.check_reg_size(reg, 8)?;
                let num = reg_num(reg).ok_or_else(|| format!("bad register: {}", reg))?;
                if needs_rex_ext(reg) {
                    self.bytes.push(self.rex(false, false, false, true));
                }
                self.bytes.push(0x58 + (num & 7));
                Ok(())
            }
            _ => Err("unsupported popq operand".to_string()),
        }
    }

    /// ALU group: add/or/and/sub/xor/cmp, selected by `alu_op`.
    fn encode_alu(&mut self, ops: &[Operand], mnemonic: &str, alu_op: u8) -> Result<(), String> {
        if ops.len() != 2 {
            return Err(format!("{} requires 2 operands", mnemonic));
        }
        match (&ops[0], &ops[1]) {
            (Operand::Immediate(Immediate::Integer(val)), Operand::Register(dst)) => {
                self.check_reg_size(dst, 8)?;
                let dst_num = reg_num(dst).ok_or_else(|| format!("bad register: {}", dst))?;
                self.emit_rex_unary(8, dst);
                if (-128..=127).contains(val) {
                    self.bytes.push(0x83);
                    self.bytes.push(self.modrm(3, alu_op, dst_num));
                    self.bytes.push(*val as u8);
                } else if i32::try_from(*val).is_ok() {
                    if dst_num == 0 && !needs_rex_ext(dst) {
                        // Short accumulator form.
                        self.bytes.push(0x05 + alu_op * 8);
                    } else {
                        self.bytes.push(0x81);
                        self.bytes.push(self.modrm(3, alu_op, dst_num));
                    }
                    self.bytes.extend_from_slice(&(*val as i32).to_le_bytes());
                } else {
                    return Err(format!(
                        "{} immediate {} does not fit in 32 bits",
                        mnemonic, val
                    ));
                }
                Ok(())
            }
            (Operand::Register(src), Operand::Register(dst)) => {
                self.check_reg_size(src, 8)?;
                self.check_reg_size(dst, 8)?;
                let src_num = reg_num(src).ok_or_else(|| format!("bad register: {}", src))?;
                let dst_num = reg_num(dst).ok_or_else(|| format!("bad register: {}", dst))?;
                self.emit_rex_rr(8, src, dst);
                self.bytes.push(0x01 + alu_op * 8);
                self.bytes.push(self.modrm(3, src_num, dst_num));
                Ok(())
            }
            (Operand::Memory(mem), Operand::Register(dst)) => {
                self.check_reg_size(dst, 8)?;
                let dst_num = reg_num(dst).ok_or_else(|| format!("bad register: {}", dst))?;
                self.emit_rex_rm(8, dst, mem);
                self.bytes.push(0x03 + alu_op * 8);
                self.encode_modrm_mem(dst_num, mem, 0)
            }
            (Operand::Register(src), Operand::Memory(mem)) => {
                self.check_reg_size(src, 8)?;
                let src_num = reg_num(src).ok_or_else(|| format!("bad register: {}", src))?;
                self.emit_rex_rm(8, src, mem);
                self.bytes.push(0x01 + alu_op * 8);
                self.encode_modrm_mem(src_num, mem, 0)
            }
            (Operand::Immediate(Immediate::Integer(val)), Operand::Memory(mem)) => {
                self.emit_rex_rm(8, "", mem);
                if (-128..=127).contains(val) {
                    self.bytes.push(0x83);
                    self.encode_modrm_mem(alu_op, mem, 1)?;
                    self.bytes.push(*val as u8);
                } else if i32::try_from(*val).is_ok() {
                    self.bytes.push(0x81);
                    self.encode_modrm_mem(alu_op, mem, 4)?;
                    self.bytes.extend_from_slice(&(*val as i32).to_le_bytes());
                } else {
                    return Err(format!(
                        "{} immediate {} does not fit in 32 bits",
                        mnemonic, val
                    ));
                }
                Ok(())
            }
            _ => Err(format!("unsupported {} operands", mnemonic)),
        }
    }

    fn encode_test(&mut self, ops: &[Operand]) -> Result<(), String> {
        if ops.len() != 2 {
            return Err("testq requires 2 operands".to_string());
        }
        match (&ops[0], &ops[1]) {
            (Operand::Register(src), Operand::Register(dst)) => {
                self.check_reg_size(src, 8)?;
                self.check_reg_size(dst, 8)?;
                let src_num = reg_num(src).ok_or_else(|| format!("bad register: {}", src))?;
                let dst_num = reg_num(dst).ok_or_else(|| format!("bad register: {}", dst))?;
                self.emit_rex_rr(8, src, dst);
                self.bytes.push(0x85);
                self.bytes.push(self.modrm(3, src_num, dst_num));
                Ok(())
            }
            (Operand::Immediate(Immediate::Integer(val)), Operand::Register(dst)) => {
                self.check_reg_size(dst, 8)?;
                if i32::try_from(*val).is_err() {
                    return Err(format!("test immediate {} does not fit in 32 bits", val));
                }
                let dst_num = reg_num(dst).ok_or_else(|| format!("bad register: {}", dst))?;
                self.emit_rex_unary(8, dst);
                if dst_num == 0 && !needs_rex_ext(dst) {
                    self.bytes.push(0xA9);
                } else {
                    self.bytes.push(0xF7);
                    self.bytes.push(self.modrm(3, 0, dst_num));
                }
                self.bytes.extend_from_slice(&(*val as i32).to_le_bytes());
                Ok(())
            }
            _ => Err("unsupported testq operands".to_string()),
        }
    }

    fn encode_imul(&mut self, ops: &[Operand]) -> Result<(), String> {
        match ops.len() {
            1 => self.encode_group3(ops, 5),
            2 => match (&ops[0], &ops[1]) {
                (Operand::Register(src), Operand::Register(dst)) => {
                    self.check_reg_size(src, 8)?;
                    self.check_reg_size(dst, 8)?;
                    let src_num = reg_num(src).ok_or_else(|| format!("bad register: {}", src))?;
                    let dst_num = reg_num(dst).ok_or_else(|| format!("bad register: {}", dst))?;
                    // Destination is the reg field for 0F AF.
                    self.emit_rex_rr(8, dst, src);
                    self.bytes.extend_from_slice(&[0x0F, 0xAF]);
                    self.bytes.push(self.modrm(3, dst_num, src_num));
                    Ok(())
                }
                (Operand::Memory(mem), Operand::Register(dst)) => {
                    self.check_reg_size(dst, 8)?;
                    let dst_num = reg_num(dst).ok_or_else(|| format!("bad register: {}", dst))?;
                    self.emit_rex_rm(8, dst, mem);
                    self.bytes.extend_from_slice(&[0x0F, 0xAF]);
                    self.encode_modrm_mem(dst_num, mem, 0)
                }
                _ => Err("unsupported imulq operands".to_string()),
            },
            _ => Err("imulq requires 1 or 2 operands".to_string()),
        }
    }

    /// F7-group unary ops: not/neg/mul/imul/div/idiv on r/m64.
    fn encode_group3(&mut self, ops: &[Operand], op_ext: u8) -> Result<(), String> {
        if ops.len() != 1 {
            return Err("unary op requires 1 operand".to_string());
        }
        match &ops[0] {
            Operand::Register(reg) => {
                self.check_reg_size(reg, 8)?;
                let num = reg_num(reg).ok_or_else(|| format!("bad register: {}", reg))?;
                self.emit_rex_unary(8, reg);
                self.bytes.push(0xF7);
                self.bytes.push(self.modrm(3, op_ext, num));
                Ok(())
            }
            Operand::Memory(mem) => {
                self.emit_rex_rm(8, "", mem);
                self.bytes.push(0xF7);
                self.encode_modrm_mem(op_ext, mem, 0)
            }
            _ => Err("unsupported unary operand".to_string()),
        }
    }

    /// FF-group ops: inc (/0) and dec (/1) on r/m64.
    fn encode_group5(&mut self, ops: &[Operand], op_ext: u8) -> Result<(), String> {
        if ops.len() != 1 {
            return Err("inc/dec requires 1 operand".to_string());
        }
        match &ops[0] {
            Operand::Register(reg) => {
                self.check_reg_size(reg, 8)?;
                let num = reg_num(reg).ok_or_else(|| format!("bad register: {}", reg))?;
                self.emit_rex_unary(8, reg);
                self.bytes.push(0xFF);
                self.bytes.push(self.modrm(3, op_ext, num));
                Ok(())
            }
            Operand::Memory(mem) => {
                self.emit_rex_rm(8, "", mem);
                self.bytes.push(0xFF);
                self.encode_modrm_mem(op_ext, mem, 0)
            }
            _ => Err("unsupported inc/dec operand".to_string()),
        }
    }

    fn encode_setcc(&mut self, ops: &[Operand], cc: &str) -> Result<(), String> {
        if ops.len() != 1 {
            return Err("setcc requires 1 operand".to_string());
        }
        let cc = cc_from_suffix(cc)?;
        match &ops[0] {
            Operand::Register(reg) => {
                if !is_reg8(reg) {
                    return Err(format!("setcc requires a byte register, got %{}", reg));
                }
                let num = reg_num(reg).ok_or_else(|| format!("bad register: {}", reg))?;
                if needs_rex_ext(reg) || is_rex_required_8bit(reg) {
                    self.bytes.push(self.rex(false, false, false, needs_rex_ext(reg)));
                }
                self.bytes.extend_from_slice(&[0x0F, 0x90 + cc]);
                self.bytes.push(self.modrm(3, 0, num));
                Ok(())
            }
            _ => Err("setcc requires a register operand".to_string()),
        }
    }

    fn encode_jmp(&mut self, ops: &[Operand]) -> Result<(), String> {
        if ops.len() != 1 {
            return Err("jmp requires 1 operand".to_string());
        }
        match &ops[0] {
            Operand::Label(label) => {
                // Near jump with a 32-bit displacement, patched at layout.
                self.bytes.push(0xE9);
                self.add_relocation(label, 4, true, 0);
                self.bytes.extend_from_slice(&[0, 0, 0, 0]);
                Ok(())
            }
            _ => Err("jmp requires a label operand".to_string()),
        }
    }

    fn encode_jcc(&mut self, ops: &[Operand], cc: &str) -> Result<(), String> {
        if ops.len() != 1 {
            return Err("jcc requires 1 operand".to_string());
        }
        let cc = cc_from_suffix(cc)?;
        match &ops[0] {
            Operand::Label(label) => {
                self.bytes.extend_from_slice(&[0x0F, 0x80 + cc]);
                self.add_relocation(label, 4, true, 0);
                self.bytes.extend_from_slice(&[0, 0, 0, 0]);
                Ok(())
            }
            _ => Err("jcc requires a label operand".to_string()),
        }
    }

    fn encode_call(&mut self, ops: &[Operand]) -> Result<(), String> {
        if ops.len() != 1 {
            return Err("call requires 1 operand".to_string());
        }
        match &ops[0] {
            Operand::Label(label) => {
                self.bytes.push(0xE8);
                self.add_relocation(label, 4, true, 0);
                self.bytes.extend_from_slice(&[0, 0, 0, 0]);
                Ok(())
            }
            _ => Err("call requires a label operand".to_string()),
        }
    }

    fn check_reg_size(&self, reg: &str, size: u8) -> Result<(), String> {
        let ok = match size {
            8 => is_reg64(reg),
            1 => is_reg8(reg),
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(format!("register %{} has the wrong width", reg))
        }
    }
}

impl Default for InstructionEncoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::assembler::parser::parse_line;

    fn encode(line: &str) -> (Vec<u8>, Vec<Relocation>) {
        let items = parse_line(line).unwrap();
        let AsmItem::Instruction(insn) = &items[0] else {
            panic!("expected instruction from {:?}", line);
        };
        let mut enc = InstructionEncoder::new();
        enc.encode(insn).unwrap();
        (enc.bytes, enc.relocations)
    }

    use crate::backend::assembler::parser::AsmItem;

    #[test]
    fn mov_imm_to_reg() {
        let (bytes, _) = encode("movq $60, %rax");
        assert_eq!(bytes, vec![0x48, 0xC7, 0xC0, 60, 0, 0, 0]);
    }

    #[test]
    fn mov_reg_to_reg() {
        let (bytes, _) = encode("movq %rsp, %rbp");
        assert_eq!(bytes, vec![0x48, 0x89, 0xE5]);
    }

    #[test]
    fn mov_large_imm_uses_64_bit_form() {
        let (bytes, _) = encode("movq $4294967296, %rax");
        assert_eq!(bytes[0], 0x48);
        assert_eq!(bytes[1], 0xB8);
        assert_eq!(bytes.len(), 10);
    }

    #[test]
    fn mov_frame_slot() {
        let (bytes, _) = encode("movq %rax, -8(%rbp)");
        assert_eq!(bytes, vec![0x48, 0x89, 0x45, 0xF8]);
        let (bytes, _) = encode("movq -16(%rbp), %rax");
        assert_eq!(bytes, vec![0x48, 0x8B, 0x45, 0xF0]);
    }

    #[test]
    fn push_pop_and_rex_extension() {
        let (bytes, _) = encode("pushq %rbp");
        assert_eq!(bytes, vec![0x55]);
        let (bytes, _) = encode("pushq %r12");
        assert_eq!(bytes, vec![0x41, 0x54]);
        let (bytes, _) = encode("popq %r13");
        assert_eq!(bytes, vec![0x41, 0x5D]);
    }

    #[test]
    fn rip_relative_lea_emits_pc_relocation() {
        let (bytes, relocs) = encode("leaq msg(%rip), %rsi");
        assert_eq!(&bytes[..3], &[0x48, 0x8D, 0x35]);
        assert_eq!(relocs.len(), 1);
        let r = &relocs[0];
        assert_eq!(r.offset, 3);
        assert_eq!(r.symbol, "msg");
        assert_eq!((r.size, r.pc_relative, r.addend), (4, true, 0));
    }

    #[test]
    fn symbol_immediate_is_absolute_8() {
        let (bytes, relocs) = encode("movq $msg, %rdi");
        assert_eq!(&bytes[..2], &[0x48, 0xBF]);
        assert_eq!(relocs[0].size, 8);
        assert!(!relocs[0].pc_relative);
        assert_eq!(relocs[0].offset, 2);
    }

    #[test]
    fn jumps_and_calls_are_pc_relative() {
        let (bytes, relocs) = encode("jmp done");
        assert_eq!(bytes[0], 0xE9);
        assert_eq!(relocs[0].offset, 1);
        assert!(relocs[0].pc_relative);

        let (bytes, relocs) = encode("jne loop");
        assert_eq!(&bytes[..2], &[0x0F, 0x85]);
        assert_eq!(relocs[0].offset, 2);

        let (bytes, relocs) = encode("call __printf");
        assert_eq!(bytes[0], 0xE8);
        assert_eq!(relocs[0].symbol, "__printf");
    }

    #[test]
    fn alu_small_imm_uses_sign_extended_form() {
        let (bytes, _) = encode("subq $16, %rsp");
        assert_eq!(bytes, vec![0x48, 0x83, 0xEC, 0x10]);
        let (bytes, _) = encode("addq $1000, %rbx");
        assert_eq!(bytes, vec![0x48, 0x81, 0xC3, 0xE8, 0x03, 0, 0]);
    }

    #[test]
    fn division_sequence() {
        let (bytes, _) = encode("cqo");
        assert_eq!(bytes, vec![0x48, 0x99]);
        let (bytes, _) = encode("idivq %rdi");
        assert_eq!(bytes, vec![0x48, 0xF7, 0xFF]);
        let (bytes, _) = encode("divq %rcx");
        assert_eq!(bytes, vec![0x48, 0xF7, 0xF1]);
    }

    #[test]
    fn inc_dec_use_ff_group() {
        let (bytes, _) = encode("incq %rbx");
        assert_eq!(bytes, vec![0x48, 0xFF, 0xC3]);
        let (bytes, _) = encode("decq %rsi");
        assert_eq!(bytes, vec![0x48, 0xFF, 0xCE]);
    }

    #[test]
    fn setcc_and_movzbq() {
        let (bytes, _) = encode("sete %al");
        assert_eq!(bytes, vec![0x0F, 0x94, 0xC0]);
        let (bytes, _) = encode("movzbq %al, %rax");
        assert_eq!(bytes, vec![0x48, 0x0F, 0xB6, 0xC0]);
        let (bytes, _) = encode("movzbq (%rbx), %rax");
        assert_eq!(bytes, vec![0x48, 0x0F, 0xB6, 0x03]);
    }

    #[test]
    fn byte_store_for_printf_buffer() {
        let (bytes, _) = encode("movb %dl, (%rsi)");
        assert_eq!(bytes, vec![0x88, 0x16]);
        let (bytes, _) = encode("movb $45, (%rsi)");
        assert_eq!(bytes, vec![0xC6, 0x06, 45]);
    }

    #[test]
    fn syscall_and_ret() {
        let (bytes, _) = encode("syscall");
        assert_eq!(bytes, vec![0x0F, 0x05]);
        let (bytes, _) = encode("ret");
        assert_eq!(bytes, vec![0xC3]);
    }

    #[test]
    fn sib_with_index_scale() {
        let (bytes, _) = encode("movq (%rax,%rbx,8), %rcx");
        assert_eq!(bytes, vec![0x48, 0x8B, 0x0C, 0xD8]);
    }

    #[test]
    fn unknown_mnemonic_is_rejected() {
        let items = parse_line("frobq %rax").unwrap();
        let AsmItem::Instruction(insn) = &items[0] else {
            panic!();
        };
        assert!(InstructionEncoder::new().encode(insn).is_err());
    }
}
