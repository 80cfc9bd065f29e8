//! Unwinding without unwind tables, by reading the prologue of each function
//! on the stack.
//!
//! For every frame the function start comes from the symbol index, and the
//! instructions between that start and the current pc are decoded. The stack
//! allocation, frame pointer setup and return address spill found there give
//! the canonical frame address (the caller's sp) and where the caller's return
//! address and frame pointer are stored.

use log::trace;

use crate::arch::{Insn, PrologueDecoder, RegisterContext};
use crate::backtrace::{TraceInfo, Tracer};
use crate::symbols::{Function, SymbolIndex};
use crate::utils::Memory;

/// Upper bound on instructions decoded per frame.
pub const MAX_SCAN: usize = 128;

/// One level of the call chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub pc: usize,
    pub sp: usize,
    pub fp: Option<usize>,
}

/// What the executed part of a prologue did. Slots are relative to the
/// canonical frame address.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Prologue {
    pub frame_size: usize,
    /// `fp - cfa`, when the frame pointer was set up.
    pub fp_offset: Option<isize>,
    pub ra_slot: Option<isize>,
    pub fp_slot: Option<isize>,
}

impl Prologue {
    /// Decode `[begin, end)`, stopping at the first call.
    pub fn scan(decoder: &dyn PrologueDecoder, memory: &dyn Memory, begin: usize, end: usize) -> Self {
        let mut prologue = Prologue::default();
        let mut addr = begin;
        for _ in 0..MAX_SCAN {
            if addr >= end {
                break;
            }
            let Some((insn, len)) = decoder.decode(memory, addr) else {
                trace!("unreadable text at {addr:#x}");
                break;
            };
            let alloc = prologue.frame_size as isize;
            match insn {
                Insn::AllocStack(n) => prologue.frame_size += n,
                Insn::SetupFramePointer(off) => prologue.fp_offset = Some(off - alloc),
                Insn::SaveReturnAddress(off) => {
                    prologue.ra_slot.get_or_insert(off - alloc);
                }
                Insn::SaveFramePointer(off) => {
                    prologue.fp_slot.get_or_insert(off - alloc);
                }
                Insn::Call => break,
                Insn::Other => {}
            }
            addr += len;
        }
        prologue
    }
}

pub struct CompilerTracer<'a> {
    index: &'a SymbolIndex,
    decoder: &'a dyn PrologueDecoder,
    memory: &'a dyn Memory,
    start: Frame,
    /// Live return address register of the innermost frame.
    live_ra: Option<usize>,
    max_depth: usize,
}

impl<'a> CompilerTracer<'a> {
    pub fn new(
        index: &'a SymbolIndex,
        decoder: &'a dyn PrologueDecoder,
        memory: &'a dyn Memory,
        context: &RegisterContext,
        max_depth: usize,
    ) -> Self {
        Self {
            index,
            decoder,
            memory,
            start: Frame {
                pc: context.pc(),
                sp: context.sp(),
                fp: context.fp(),
            },
            live_ra: context.ra(),
            max_depth,
        }
    }

    /// The function holding `pc`. A return address within a call's width of
    /// a function start may really belong to the function before it, when
    /// the call was the last instruction there.
    fn resolve(&self, pc: usize, innermost: bool) -> Option<&'a Function> {
        let function = self.index.locate(pc)?;
        let slop = self.decoder.boundary_slop();
        if !innermost && pc - function.begin() < slop {
            if let Some(previous) = pc.checked_sub(slop).and_then(|a| self.index.locate(a)) {
                trace!("{pc:#x} moved from {} to {}", function.name(), previous.name());
                return Some(previous);
            }
        }
        Some(function)
    }

    fn step(&self, frame: &Frame, function: &Function, innermost: bool) -> Option<Frame> {
        let prologue = Prologue::scan(self.decoder, self.memory, function.begin(), frame.pc);
        trace!("{}+{:#x}: {prologue:?}", function.name(), frame.pc - function.begin());

        let cfa = match (prologue.fp_offset, frame.fp) {
            (Some(off), Some(fp)) if fp != frame.sp => fp.checked_add_signed(-off)?,
            _ => frame.sp.checked_add(prologue.frame_size)?,
        };
        if cfa < frame.sp {
            trace!("cfa {cfa:#x} below sp {:#x}", frame.sp);
            return None;
        }

        let ra = match prologue.ra_slot {
            Some(slot) => self.memory.read_word(cfa.checked_add_signed(slot)?)?,
            // Nothing spilled yet, so the return address is still live.
            None if innermost => self.live_ra?,
            None => {
                trace!("no return address spill in {}", function.name());
                return None;
            }
        };
        let fp = match prologue.fp_slot {
            Some(slot) => Some(self.memory.read_word(cfa.checked_add_signed(slot)?)?),
            None => frame.fp,
        };
        if ra == 0 {
            return None;
        }
        Some(Frame { pc: ra, sp: cfa, fp })
    }
}

impl Tracer for CompilerTracer<'_> {
    fn trace(&self) -> impl Iterator<Item = TraceInfo<'_>> + '_ {
        CompilerTracerIterator {
            tracer: self,
            frame: Some(self.start),
            depth: 0,
        }
    }
}

pub struct CompilerTracerIterator<'t, 'a> {
    tracer: &'t CompilerTracer<'a>,
    frame: Option<Frame>,
    depth: usize,
}

impl<'t, 'a> Iterator for CompilerTracerIterator<'t, 'a> {
    type Item = TraceInfo<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let frame = self.frame.take()?;
        if self.depth >= self.tracer.max_depth {
            trace!("depth limit {} reached", self.tracer.max_depth);
            return None;
        }
        let innermost = self.depth == 0;
        self.depth += 1;

        let Some(function) = self.tracer.resolve(frame.pc, innermost) else {
            trace!("{:#x} is not inside a known function", frame.pc);
            return None;
        };
        self.frame = self
            .tracer
            .step(&frame, function, innermost)
            .filter(|next| *next != frame);
        Some(TraceInfo::new(frame.pc, Some(function)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{Mips, RiscV};
    use crate::utils::fake::FakeMemory;

    const ADDI_SP_M32: u32 = 0xfe010113;
    const ADDI_SP_M16: u32 = 0xff010113;
    const SD_RA_24: u32 = 0x00113c23;
    const SD_RA_8: u32 = 0x00113423;
    const SD_S0_16: u32 = 0x00813823;
    const ADDI_S0_SP_32: u32 = 0x02010413;
    const JAL_RA: u32 = 0x000000ef;

    /// callee -> caller -> main, with the callee using a frame pointer.
    fn riscv_program() -> (SymbolIndex, FakeMemory) {
        let index: SymbolIndex = [
            Function::new("callee", 0x1000, 0x20),
            Function::new("caller", 0x2000, 0x10),
            Function::new("main", 0x3000, 0x10),
        ]
        .into_iter()
        .collect();
        let mut mem = FakeMemory::new();
        mem.put_u32s(0x1000, &[ADDI_SP_M32, SD_RA_24, SD_S0_16, ADDI_S0_SP_32, JAL_RA]);
        mem.put_u32s(0x2000, &[ADDI_SP_M16, SD_RA_8, JAL_RA]);
        mem.put_u32s(0x3000, &[JAL_RA]);
        // callee frame: 0x7fe0..0x8000
        mem.put_word(0x7ff8, 0x200c);
        mem.put_word(0x7ff0, 0x8100);
        // caller frame: 0x8000..0x8010
        mem.put_word(0x8008, 0x3004);
        (index, mem)
    }

    fn names(tracer: &CompilerTracer<'_>) -> Vec<(String, usize)> {
        tracer
            .trace()
            .map(|info| (info.func_name().unwrap_or("??").to_owned(), info.offset))
            .collect()
    }

    #[test]
    fn prologue_scan_is_cfa_relative() {
        let (_, mem) = riscv_program();
        let p = Prologue::scan(&RiscV::RV64, &mem, 0x1000, 0x1010);
        assert_eq!(
            p,
            Prologue {
                frame_size: 32,
                fp_offset: Some(0),
                ra_slot: Some(-8),
                fp_slot: Some(-16),
            }
        );
        // stops at the call even with a longer window
        let p = Prologue::scan(&RiscV::RV64, &mem, 0x2000, 0x2100);
        assert_eq!(p.frame_size, 16);
        assert_eq!(p.ra_slot, Some(-8));
    }

    #[test]
    fn empty_window_at_function_entry() {
        let (_, mem) = riscv_program();
        assert_eq!(
            Prologue::scan(&RiscV::RV64, &mem, 0x1000, 0x1000),
            Prologue::default()
        );
    }

    #[test]
    fn walks_known_frames() {
        let (index, mem) = riscv_program();
        let ctx = RegisterContext::new(0x1010, 0x7fe0).with_fp(0x8000);
        let tracer = CompilerTracer::new(&index, &RiscV::RV64, &mem, &ctx, 64);
        assert_eq!(
            names(&tracer),
            [
                ("callee".to_owned(), 0x10),
                ("caller".to_owned(), 0xc),
                ("main".to_owned(), 4),
            ]
        );
    }

    #[test]
    fn stack_pointer_used_when_frame_pointer_equals_sp() {
        let (index, mut mem) = riscv_program();
        // fp not yet moved: read through sp + frame size (0x7fe0 + 32)
        let ctx = RegisterContext::new(0x1010, 0x7fe0).with_fp(0x7fe0);
        mem.put_word(0x7ff0, 0x7fe0);
        let tracer = CompilerTracer::new(&index, &RiscV::RV64, &mem, &ctx, 64);
        assert_eq!(names(&tracer).len(), 3);
    }

    #[test]
    fn return_address_at_next_function_start() {
        let index: SymbolIndex = [
            Function::new("callee", 0x1000, 0x20),
            Function::new("tail_caller", 0x4000, 0xc),
            Function::new("after", 0x400c, 0x10),
        ]
        .into_iter()
        .collect();
        let (_, mut mem) = riscv_program();
        mem.put_u32s(0x4000, &[ADDI_SP_M16, SD_RA_8, JAL_RA]);
        mem.put_word(0x7ff8, 0x400c);
        mem.put_word(0x8008, 0);

        let ctx = RegisterContext::new(0x1010, 0x7fe0).with_fp(0x8000);
        let tracer = CompilerTracer::new(&index, &RiscV::RV64, &mem, &ctx, 64);
        assert_eq!(
            names(&tracer),
            [("callee".to_owned(), 0x10), ("tail_caller".to_owned(), 0xc)]
        );
    }

    #[test]
    fn leaf_uses_live_return_address() {
        let (index, mut mem) = riscv_program();
        let index: SymbolIndex = index
            .functions()
            .iter()
            .cloned()
            .chain([Function::new("leaf", 0x5000, 0x10)])
            .collect();
        mem.put_u32s(0x5000, &[ADDI_SP_M16, 0x00000013]);

        let ctx = RegisterContext::new(0x5004, 0x7ff0).with_ra(0x200c);
        let tracer = CompilerTracer::new(&index, &RiscV::RV64, &mem, &ctx, 64);
        let frames = names(&tracer);
        assert_eq!(frames[0], ("leaf".to_owned(), 4));
        assert_eq!(frames[1], ("caller".to_owned(), 0xc));
        assert_eq!(frames[2], ("main".to_owned(), 4));

        let ctx = RegisterContext::new(0x5004, 0x7ff0);
        let tracer = CompilerTracer::new(&index, &RiscV::RV64, &mem, &ctx, 64);
        assert_eq!(names(&tracer), [("leaf".to_owned(), 4)]);
    }

    #[test]
    fn unresolved_pc_ends_the_walk() {
        let (index, mem) = riscv_program();
        let ctx = RegisterContext::new(0x9000, 0x7fe0);
        let tracer = CompilerTracer::new(&index, &RiscV::RV64, &mem, &ctx, 64);
        assert_eq!(tracer.trace().count(), 0);
    }

    #[test]
    fn unknown_return_address_is_not_reported() {
        let (index, mut mem) = riscv_program();
        mem.put_word(0x7ff8, 0x9000);
        let ctx = RegisterContext::new(0x1010, 0x7fe0).with_fp(0x8000);
        let tracer = CompilerTracer::new(&index, &RiscV::RV64, &mem, &ctx, 64);
        assert_eq!(names(&tracer), [("callee".to_owned(), 0x10)]);
    }

    #[test]
    fn depth_limit_cuts_recursion() {
        let index: SymbolIndex = [Function::new("recurse", 0x6000, 0xc)].into_iter().collect();
        let mut mem = FakeMemory::new();
        mem.put_u32s(0x6000, &[ADDI_SP_M16, SD_RA_8, JAL_RA]);
        for i in 0..16 {
            mem.put_word(0x8008 + 16 * i, 0x600c);
        }
        let ctx = RegisterContext::new(0x6008, 0x8000);
        let tracer = CompilerTracer::new(&index, &RiscV::RV64, &mem, &ctx, 5);
        let frames = names(&tracer);
        assert_eq!(frames.len(), 5);
        assert!(frames.iter().all(|(name, _)| name == "recurse"));
    }

    #[test]
    fn mips_frames_with_delay_slot_boundary() {
        let index: SymbolIndex = [
            Function::new("callee", 0x1000, 0x20),
            Function::new("caller", 0x2000, 0x10),
            Function::new("next", 0x2010, 0x10),
        ]
        .into_iter()
        .collect();
        let mut mem = FakeMemory::new();
        // daddiu sp,-48; sd ra,40(sp); sd fp,32(sp); move fp,sp; jal
        mem.put_u32s(0x1000, &[0x67bdffd0, 0xffbf0028, 0xffbe0020, 0x03a0f02d, 0x0c000000]);
        // addiu sp,-16; sd ra,8(sp); jal; nop in the delay slot
        mem.put_u32s(0x2000, &[0x27bdfff0, 0xffbf0008, 0x0c000000, 0]);
        mem.put_word(0x7ff8, 0x2010);
        mem.put_word(0x7ff0, 0x8100);
        mem.put_word(0x8008, 0);

        // fp == sp after `move fp,sp`, so the frame is found through sp
        let ctx = RegisterContext::new(0x1010, 0x7fd0).with_fp(0x7fd0);
        let tracer = CompilerTracer::new(&index, &Mips, &mem, &ctx, 64);
        assert_eq!(
            names(&tracer),
            [("callee".to_owned(), 0x10), ("caller".to_owned(), 0x10)]
        );
    }
}
