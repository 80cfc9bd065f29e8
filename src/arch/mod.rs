//! Per-ISA prologue decoding and register capture.

pub mod context;
pub mod mips;
pub mod riscv;

use crate::utils::Memory;

pub use context::RegisterContext;
pub use mips::Mips;
pub use riscv::RiscV;

/// What a single prologue instruction does to the frame.
///
/// Offsets are relative to the stack pointer at the point the instruction
/// executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insn {
    /// `sp -= n`
    AllocStack(usize),
    /// `fp = sp + off`
    SetupFramePointer(isize),
    /// return address stored at `sp + off`
    SaveReturnAddress(isize),
    /// caller frame pointer stored at `sp + off`
    SaveFramePointer(isize),
    /// Any call or indirect jump. Prologues end before the first one.
    Call,
    Other,
}

/// Instruction classifier used by the software unwinder.
pub trait PrologueDecoder {
    fn name(&self) -> &'static str;

    /// Decode the instruction at `addr`, returning it with its length in
    /// bytes. `None` when the text cannot be read.
    fn decode(&self, memory: &dyn Memory, addr: usize) -> Option<(Insn, usize)>;

    /// How far a return address may sit past the end of its calling
    /// function: the width of a call plus any delay slot.
    fn boundary_slop(&self) -> usize;
}

/// Decoder for the ISA this crate was compiled for, if there is one.
pub fn native_decoder() -> Option<&'static dyn PrologueDecoder> {
    if cfg!(target_arch = "riscv64") {
        Some(&RiscV::RV64)
    } else if cfg!(target_arch = "riscv32") {
        Some(&RiscV::RV32)
    } else if cfg!(any(target_arch = "mips", target_arch = "mips64")) {
        Some(&Mips)
    } else {
        None
    }
}

/// Sign-extend the low `bits` bits of `value`.
pub(crate) fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}
