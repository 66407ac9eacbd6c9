//! Prediction of the successor address(es) of the current instruction.

use capstone::arch::x86::X86OperandType;
use capstone::arch::{ArchOperand, BuildsCapstone};
use capstone::{Capstone, InsnGroupId, InsnGroupType, RegId};

use crate::domain::{Domain, MapProt, WordSize};
use crate::error::{DomainError, Error};
use crate::regs::CpuContext;

/// Maximum size of one x86 instruction.
const MAX_INSTR_LEN: usize = 16;

/// Decodes the instruction under the program counter of a paused guest
/// and computes the addresses it can transfer control to.
pub struct Predictor {
    /// Disassembler handle, opened for the guest's word size.
    cs: Capstone,

    /// Guest word width, for reading pointers out of guest memory.
    word_size: WordSize,
}

impl Predictor {
    /// Opens a decoder for the given guest word size.
    pub fn open<E>(word_size: WordSize) -> Result<Self, Error<E>> {
        let mode = match word_size {
            WordSize::Four => capstone::arch::x86::ArchMode::Mode32,
            WordSize::Eight => capstone::arch::x86::ArchMode::Mode64,
        };

        let cs = Capstone::new().x86().mode(mode).detail(true).build()?;

        Ok(Self { cs, word_size })
    }

    /// Returns the `(primary, alternate)` successor addresses of the
    /// instruction at the guest's program counter.
    ///
    /// Both addresses are reported only for a jump or call with an
    /// immediate target (the two arms of a conditional branch); every
    /// other form resolves to a single primary successor. An alternate
    /// equal to the primary is silently dropped.
    pub fn successors<D: Domain>(
        &self,
        domain: &D,
        ctx: &CpuContext,
    ) -> Result<(u64, Option<u64>), Error<D::Error>> {
        let ip = ctx.instr_ptr();

        let window = domain
            .map_memory(ip, 2 * MAX_INSTR_LEN, MapProt::Read)
            .map_err(DomainError)?;

        let insns = self
            .cs
            .disasm_count(&window[..2 * MAX_INSTR_LEN - 1], ip, 2)?;

        if insns.len() < 2 {
            return Err(Error::DecodeFailed);
        }

        let cur = &insns[0];
        let fallthrough = insns[1].address();

        let detail = self.cs.insn_detail(cur)?;

        tracing::trace!(
            addr = format_args!("{ip:#x}"),
            mnemonic = cur.mnemonic().unwrap_or(""),
            op = cur.op_str().unwrap_or(""),
            "predicting successors"
        );

        let has_group = |group: u32| detail.groups().contains(&InsnGroupId(group as u8));

        if has_group(InsnGroupType::CS_GRP_JUMP) || has_group(InsnGroupType::CS_GRP_CALL) {
            let op = detail
                .arch_detail()
                .operands()
                .into_iter()
                .next()
                .ok_or(Error::UnsupportedOperand)?;

            let ArchOperand::X86Operand(op) = op else {
                return Err(Error::UnsupportedOperand);
            };

            match op.op_type {
                X86OperandType::Imm(target) => {
                    // An unconditional jump wastes the fallthrough trap,
                    // which is harmless.
                    let target = target as u64;

                    if target == fallthrough {
                        Ok((fallthrough, None))
                    } else {
                        Ok((fallthrough, Some(target)))
                    }
                }
                X86OperandType::Mem(mem) => {
                    let base = self.reg_value(ctx, mem.base())?;
                    let index = self.reg_value(ctx, mem.index())?;

                    let ea = base
                        .wrapping_add(index.wrapping_mul(mem.scale() as i64 as u64))
                        .wrapping_add(mem.disp() as u64);

                    Ok((self.read_guest_word(domain, ea)?, None))
                }
                X86OperandType::Reg(reg) => Ok((self.lookup_reg(ctx, reg)?, None)),
                _ => Err(Error::UnsupportedOperand),
            }
        } else if has_group(InsnGroupType::CS_GRP_RET) || has_group(InsnGroupType::CS_GRP_IRET) {
            let dest = self.read_guest_word(domain, ctx.stack_ptr())?;

            Ok((dest, None))
        } else {
            Ok((fallthrough, None))
        }
    }

    /// Value of a decoder-reported register, or 0 when absent.
    fn reg_value<E>(&self, ctx: &CpuContext, reg: RegId) -> Result<u64, Error<E>> {
        if reg.0 == 0 {
            return Ok(0);
        }

        self.lookup_reg(ctx, reg)
    }

    /// Translates a decoder register ID into its value in the context.
    fn lookup_reg<E>(&self, ctx: &CpuContext, reg: RegId) -> Result<u64, Error<E>> {
        let name = self.cs.reg_name(reg).ok_or(Error::UnsupportedOperand)?;

        ctx.read_by_name(&name)
            .ok_or_else(|| Error::NoSuchRegister(name))
    }

    /// Reads one guest-word-sized pointer from guest memory.
    fn read_guest_word<D: Domain>(&self, domain: &D, addr: u64) -> Result<u64, Error<D::Error>> {
        let n = self.word_size.bytes();

        let window = domain
            .map_memory(addr, n, MapProt::Read)
            .map_err(DomainError)?;

        let mut raw = [0u8; 8];
        raw[..n].copy_from_slice(&window[..n]);

        Ok(u64::from_le_bytes(raw))
    }
}
