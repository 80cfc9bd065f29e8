use gimli::Register;

use crate::error::UnwinderError;

/// DWARF register numbers are dense and small on every supported ISA;
/// x86_64 puts its return address column at 16 and AArch64 its sp at 31.
pub const MAX_REGISTERS: usize = 33;

#[cfg(target_arch = "x86_64")]
pub mod native {
    use gimli::{Register, X86_64};
    pub const SP: Register = X86_64::RSP;
    pub const FP: Register = X86_64::RBP;
    pub const RA: Register = X86_64::RA;
}

#[cfg(target_arch = "x86")]
pub mod native {
    use gimli::{Register, X86};
    pub const SP: Register = X86::ESP;
    pub const FP: Register = X86::EBP;
    pub const RA: Register = X86::RA;
}

#[cfg(target_arch = "aarch64")]
pub mod native {
    use gimli::{AArch64, Register};
    pub const SP: Register = AArch64::SP;
    pub const FP: Register = AArch64::X29;
    pub const RA: Register = AArch64::X30;
}

#[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))]
pub mod native {
    use gimli::{Register, RiscV};
    pub const SP: Register = RiscV::SP;
    pub const FP: Register = RiscV::S0;
    pub const RA: Register = RiscV::RA;
}

#[cfg(any(target_arch = "mips", target_arch = "mips64"))]
pub mod native {
    use gimli::Register;
    pub const SP: Register = Register(29);
    pub const FP: Register = Register(30);
    pub const RA: Register = Register(31);
}

// No context capture exists for other targets, so these columns are never
// populated by a live walk.
#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "x86",
    target_arch = "aarch64",
    target_arch = "riscv32",
    target_arch = "riscv64",
    target_arch = "mips",
    target_arch = "mips64"
)))]
pub mod native {
    use gimli::Register;
    pub const SP: Register = Register(0);
    pub const FP: Register = Register(1);
    pub const RA: Register = Register(2);
}

/// Register values known for one frame, indexed by DWARF number, plus the pc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterSet {
    pc: Option<usize>,
    regs: [Option<usize>; MAX_REGISTERS],
}

impl Default for RegisterSet {
    fn default() -> Self {
        Self {
            pc: None,
            regs: [None; MAX_REGISTERS],
        }
    }
}

impl RegisterSet {
    pub fn new(pc: usize, sp: usize) -> Self {
        let mut set = Self::default();
        set.pc = Some(pc);
        set.regs[native::SP.0 as usize] = Some(sp);
        set
    }

    /// Whether `reg` has a slot. Columns past the general purpose registers,
    /// such as vector registers, are not followed.
    pub fn tracks(reg: Register) -> bool {
        (reg.0 as usize) < MAX_REGISTERS
    }

    pub fn get(&self, reg: Register) -> Option<usize> {
        *self.regs.get(reg.0 as usize)?
    }

    pub fn set(&mut self, reg: Register, val: usize) -> Result<(), UnwinderError> {
        *self
            .regs
            .get_mut(reg.0 as usize)
            .ok_or(UnwinderError::UnexpectedRegister(reg.0))? = Some(val);
        Ok(())
    }

    pub fn undef(&mut self, reg: Register) {
        if let Some(slot) = self.regs.get_mut(reg.0 as usize) {
            *slot = None;
        }
    }

    pub fn get_pc(&self) -> Option<usize> {
        self.pc
    }

    pub fn set_pc(&mut self, val: usize) {
        self.pc = Some(val);
    }

    pub fn get_ret(&self) -> Option<usize> {
        self.get(native::RA)
    }

    pub fn stack_ptr(&self) -> Option<usize> {
        self.get(native::SP)
    }

    pub fn set_stack_ptr(&mut self, val: usize) {
        self.regs[native::SP.0 as usize] = Some(val);
    }

    pub fn frame_ptr(&self) -> Option<usize> {
        self.get(native::FP)
    }

    /// Registers that currently hold a value.
    pub fn iter(&self) -> impl Iterator<Item = (Register, usize)> + '_ {
        self.regs
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.map(|v| (Register(i as u16), v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_registers() {
        let mut set = RegisterSet::new(0x1000, 0x8000);
        assert!(matches!(
            set.set(Register(200), 1),
            Err(UnwinderError::UnexpectedRegister(200))
        ));
        assert_eq!(set.get(Register(200)), None);
        set.undef(Register(200));
        assert!(!RegisterSet::tracks(Register(72)));
        assert!(RegisterSet::tracks(native::RA));
        assert_eq!(set.stack_ptr(), Some(0x8000));
        assert_eq!(set.get_pc(), Some(0x1000));
    }

    #[test]
    fn iterates_known_values_only() {
        let mut set = RegisterSet::new(0x1000, 0x8000);
        set.set(native::FP, 0x8100).unwrap();
        let known: Vec<_> = set.iter().map(|(r, _)| r).collect();
        assert_eq!(known.len(), 2);
        set.undef(native::FP);
        assert_eq!(set.frame_ptr(), None);
    }
}
