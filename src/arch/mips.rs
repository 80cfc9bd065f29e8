use bit_field::BitField;

use super::{sign_extend, Insn, PrologueDecoder};
use crate::utils::Memory;

const ZERO: u32 = 0;
const SP: u32 = 29;
const FP: u32 = 30;
const RA: u32 = 31;

/// MIPS32 and MIPS64. The 64-bit forms of the prologue instructions are
/// accepted on both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mips;

impl Mips {
    pub fn decode_word(&self, ins: u32) -> Insn {
        let op = ins.get_bits(26..32);
        let rs = ins.get_bits(21..26);
        let rt = ins.get_bits(16..21);
        let rd = ins.get_bits(11..16);
        let funct = ins.get_bits(0..6);
        let imm = sign_extend(ins.get_bits(0..16), 16) as isize;
        match op {
            // SPECIAL
            0x00 => match funct {
                // jr, jalr
                0x08 | 0x09 => Insn::Call,
                // move fp, sp: addu / or / daddu fp, sp, zero
                0x21 | 0x25 | 0x2d if rd == FP && rs == SP && rt == ZERO => {
                    Insn::SetupFramePointer(0)
                }
                _ => Insn::Other,
            },
            // REGIMM bltzal, bgezal (bal)
            0x01 if rt == 0x10 || rt == 0x11 => Insn::Call,
            // jal
            0x03 => Insn::Call,
            // addi, addiu, daddi, daddiu
            0x08 | 0x09 | 0x18 | 0x19 if rs == SP => match rt {
                SP if imm < 0 => Insn::AllocStack(imm.unsigned_abs()),
                FP => Insn::SetupFramePointer(imm),
                _ => Insn::Other,
            },
            // sw, sd
            0x2b | 0x3f if rs == SP => match rt {
                RA => Insn::SaveReturnAddress(imm),
                FP => Insn::SaveFramePointer(imm),
                _ => Insn::Other,
            },
            _ => Insn::Other,
        }
    }
}

impl PrologueDecoder for Mips {
    fn name(&self) -> &'static str {
        "mips"
    }

    fn decode(&self, memory: &dyn Memory, addr: usize) -> Option<(Insn, usize)> {
        memory.read_u32(addr).map(|ins| (self.decode_word(ins), 4))
    }

    /// `jal` plus its delay slot.
    fn boundary_slop(&self) -> usize {
        8
    }
}
