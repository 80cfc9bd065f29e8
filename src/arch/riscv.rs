use bit_field::BitField;
use log::trace;

use super::{sign_extend, Insn, PrologueDecoder};
use crate::utils::Memory;

const RA: u32 = 1;
const SP: u32 = 2;
const S0: u32 = 8;

/// RV32/RV64 with the C extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiscV {
    rv64: bool,
}

impl RiscV {
    pub const RV32: RiscV = RiscV { rv64: false };
    pub const RV64: RiscV = RiscV { rv64: true };

    /// Classify a 32-bit instruction word.
    pub fn decode_word(&self, ins: u32) -> Insn {
        let opcode = ins.get_bits(0..7);
        let rd = ins.get_bits(7..12);
        let funct3 = ins.get_bits(12..15);
        let rs1 = ins.get_bits(15..20);
        let rs2 = ins.get_bits(20..25);
        match opcode {
            // addi rd, rs1, imm
            // imm[11:0] rs1 000 rd 0010011
            0b0010011 if funct3 == 0 && rs1 == SP => {
                let imm = sign_extend(ins.get_bits(20..32), 12) as isize;
                match rd {
                    SP if imm < 0 => Insn::AllocStack(imm.unsigned_abs()),
                    S0 => Insn::SetupFramePointer(imm),
                    _ => Insn::Other,
                }
            }
            // sw/sd rs2, imm(rs1)
            // imm[11:5] rs2 rs1 01x imm[4:0] 0100011
            0b0100011 if rs1 == SP && funct3 == self.store_funct3() => {
                let mut imm = 0u32;
                imm.set_bits(0..5, ins.get_bits(7..12));
                imm.set_bits(5..12, ins.get_bits(25..32));
                let imm = sign_extend(imm, 12) as isize;
                match rs2 {
                    RA => Insn::SaveReturnAddress(imm),
                    S0 => Insn::SaveFramePointer(imm),
                    _ => Insn::Other,
                }
            }
            // jal with a link register; plain `j` is just a branch
            0b1101111 if rd != 0 => Insn::Call,
            // every jalr, including `jr` and `ret`
            0b1100111 => Insn::Call,
            _ => Insn::Other,
        }
    }

    /// Classify a 16-bit compressed instruction.
    pub fn decode_compressed(&self, ins: u16) -> Insn {
        let quadrant = ins.get_bits(0..2);
        let funct3 = ins.get_bits(13..16);
        let rd = ins.get_bits(7..12) as u32;
        let rs2 = ins.get_bits(2..7) as u32;
        match (quadrant, funct3) {
            // c.addi4spn rd', nzuimm
            // 000 [5:4|9:6|2|3] rd' 00
            (0b00, 0b000) => {
                let mut imm = 0u32;
                imm.set_bits(4..6, ins.get_bits(11..13) as u32);
                imm.set_bits(6..10, ins.get_bits(7..11) as u32);
                imm.set_bit(2, ins.get_bit(6));
                imm.set_bit(3, ins.get_bit(5));
                let rd = ins.get_bits(2..5) as u32 + 8;
                if imm != 0 && rd == S0 {
                    Insn::SetupFramePointer(imm as isize)
                } else {
                    Insn::Other
                }
            }
            // c.addi rd, imm
            // 000 [imm5] rd [imm4-0] 01
            (0b01, 0b000) if rd == SP => {
                let mut imm = 0u32;
                imm.set_bits(0..5, ins.get_bits(2..7) as u32);
                imm.set_bit(5, ins.get_bit(12));
                let imm = sign_extend(imm, 6) as isize;
                if imm < 0 {
                    Insn::AllocStack(imm.unsigned_abs())
                } else {
                    Insn::Other
                }
            }
            // c.jal, RV32 only; c.addiw on RV64
            (0b01, 0b001) if !self.rv64 => Insn::Call,
            // c.addi16sp imm
            // 011 [imm9] 00010 [imm4|6|8|7|5] 01
            (0b01, 0b011) if rd == SP => {
                let mut imm = 0u32;
                imm.set_bit(9, ins.get_bit(12));
                imm.set_bit(8, ins.get_bit(4));
                imm.set_bit(7, ins.get_bit(3));
                imm.set_bit(6, ins.get_bit(5));
                imm.set_bit(5, ins.get_bit(2));
                imm.set_bit(4, ins.get_bit(6));
                let imm = sign_extend(imm, 10) as isize;
                trace!("c.addi16sp {imm}");
                if imm < 0 {
                    Insn::AllocStack(imm.unsigned_abs())
                } else {
                    Insn::Other
                }
            }
            // c.jr / c.jalr / c.mv / c.add
            // 100 [b12] rs1 rs2 10
            (0b10, 0b100) => match (ins.get_bit(12), rd, rs2) {
                (_, 0, _) => Insn::Other,
                (_, _, 0) => Insn::Call,
                (false, S0, SP) => Insn::SetupFramePointer(0),
                _ => Insn::Other,
            },
            // c.swsp rs2, uimm(sp)
            // 110 [5:2|7:6] rs2 10
            (0b10, 0b110) if !self.rv64 => {
                let mut imm = 0u32;
                imm.set_bits(2..6, ins.get_bits(9..13) as u32);
                imm.set_bits(6..8, ins.get_bits(7..9) as u32);
                Self::spill(rs2, imm as isize)
            }
            // c.sdsp rs2, uimm(sp)
            // 111 [5:3|8:6] rs2 10
            (0b10, 0b111) if self.rv64 => {
                let mut imm = 0u32;
                imm.set_bits(3..6, ins.get_bits(10..13) as u32);
                imm.set_bits(6..9, ins.get_bits(7..10) as u32);
                Self::spill(rs2, imm as isize)
            }
            _ => Insn::Other,
        }
    }

    fn spill(reg: u32, off: isize) -> Insn {
        match reg {
            RA => Insn::SaveReturnAddress(off),
            S0 => Insn::SaveFramePointer(off),
            _ => Insn::Other,
        }
    }

    fn store_funct3(&self) -> u32 {
        if self.rv64 {
            0b011
        } else {
            0b010
        }
    }
}

impl PrologueDecoder for RiscV {
    fn name(&self) -> &'static str {
        if self.rv64 {
            "riscv64"
        } else {
            "riscv32"
        }
    }

    fn decode(&self, memory: &dyn Memory, addr: usize) -> Option<(Insn, usize)> {
        // Text is only 2-byte aligned once compressed instructions are in
        // play, so a full word is read as two parcels.
        let low = memory.read_u16(addr)?;
        if low.get_bits(0..2) != 0b11 {
            return Some((self.decode_compressed(low), 2));
        }
        let high = memory.read_u16(addr + 2)?;
        let ins = (high as u32) << 16 | low as u32;
        Some((self.decode_word(ins), 4))
    }

    fn boundary_slop(&self) -> usize {
        4
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::fake::FakeMemory;

    const RV64: RiscV = RiscV::RV64;

    #[test]
    fn full_width_prologue() {
        assert_eq!(RV64.decode_word(0xfe010113), Insn::AllocStack(32));
        assert_eq!(RV64.decode_word(0x00113c23), Insn::SaveReturnAddress(24));
        assert_eq!(RV64.decode_word(0x00813823), Insn::SaveFramePointer(16));
        assert_eq!(RV64.decode_word(0x02010413), Insn::SetupFramePointer(32));
        assert_eq!(RV64.decode_word(0x00113423), Insn::SaveReturnAddress(8));
    }

    #[test]
    fn full_width_calls() {
        assert_eq!(RV64.decode_word(0x000000ef), Insn::Call); // jal ra
        assert_eq!(RV64.decode_word(0x000080e7), Insn::Call); // jalr ra
        assert_eq!(RV64.decode_word(0x00008067), Insn::Call); // ret
        assert_eq!(RV64.decode_word(0x00000097), Insn::Other); // auipc ra
    }

    #[test]
    fn releasing_stack_is_not_an_allocation() {
        // addi sp,sp,32
        assert_eq!(RV64.decode_word(0x02010113), Insn::Other);
        // c.addi16sp 64
        assert_eq!(RV64.decode_compressed(0x6121), Insn::Other);
    }

    #[test]
    fn compressed_prologue() {
        assert_eq!(RV64.decode_compressed(0x7139), Insn::AllocStack(64));
        assert_eq!(RV64.decode_compressed(0x1141), Insn::AllocStack(16));
        assert_eq!(RV64.decode_compressed(0xfc06), Insn::SaveReturnAddress(56));
        assert_eq!(RV64.decode_compressed(0xf822), Insn::SaveFramePointer(48));
        assert_eq!(RV64.decode_compressed(0x0080), Insn::SetupFramePointer(64));
        assert_eq!(RV64.decode_compressed(0x9782), Insn::Call); // c.jalr a5
        assert_eq!(RV64.decode_compressed(0x8082), Insn::Call); // c.jr ra
    }

    #[test]
    fn lengths_follow_the_low_bits() {
        let mut mem = FakeMemory::new();
        mem.put_u16s(0x100, &[0x7139, 0xfc06]);
        mem.put_u16s(0x104, &[0x0113, 0xfe01]);
        assert_eq!(RV64.decode(&mem, 0x100), Some((Insn::AllocStack(64), 2)));
        assert_eq!(
            RV64.decode(&mem, 0x102),
            Some((Insn::SaveReturnAddress(56), 2))
        );
        assert_eq!(RV64.decode(&mem, 0x104), Some((Insn::AllocStack(32), 4)));
        assert_eq!(RV64.decode(&mem, 0x108), None);
    }
}
