use core::mem::size_of;

use gimli::{
    BaseAddresses, CfaRule, EhFrame, EhFrameHdr, EndianSlice, NativeEndian, ParsedEhFrameHdr,
    Pointer, Register, RegisterRule, UnwindContext, UnwindSection,
};
use log::{debug, trace};

use super::arch::{native, RegisterSet};
use crate::arch::RegisterContext;
use crate::backtrace::{TraceInfo, Tracer};
use crate::error::UnwinderError;
use crate::symbols::{LoadedModule, SymbolIndex};
use crate::utils::Memory;

type Slice = EndianSlice<'static, NativeEndian>;

/// `.eh_frame_hdr` and `.eh_frame` of one loaded module.
struct EhInfo {
    base_addrs: BaseAddresses,
    hdr: ParsedEhFrameHdr<Slice>,
    eh_frame: EhFrame<Slice>,
}

impl EhInfo {
    fn for_module(module: &LoadedModule, memory: &dyn Memory) -> Result<Self, UnwinderError> {
        let hdr = module
            .eh_frame_hdr()
            .ok_or(UnwinderError::NoUnwindInfo(module.bias()))?;
        let hdr_addr = hdr.as_ptr() as usize;
        let mut base_addrs = BaseAddresses::default().set_eh_frame_hdr(hdr_addr as u64);
        let hdr = EhFrameHdr::new(hdr, NativeEndian).parse(&base_addrs, size_of::<usize>() as u8)?;

        let eh_frame = match hdr.eh_frame_ptr() {
            Pointer::Direct(addr) => addr as usize,
            Pointer::Indirect(addr) => memory
                .read_word(addr as usize)
                .ok_or(UnwinderError::BadStackRead(addr as usize))?,
        };
        // The section length is not recorded anywhere reachable at run time,
        // so the view runs to the end of the segment holding it.
        let section = module
            .tail(eh_frame)
            .ok_or(UnwinderError::NoUnwindInfo(eh_frame))?;
        base_addrs = base_addrs.set_eh_frame(eh_frame as u64);
        trace!(
            "{}: eh_frame_hdr {hdr_addr:#x}, eh_frame {eh_frame:#x}+{:#x}",
            module.name(),
            section.len()
        );

        Ok(Self {
            base_addrs,
            hdr,
            eh_frame: EhFrame::new(section, NativeEndian),
        })
    }
}

/// Unwinds through the `.eh_frame` tables the loaded modules carry.
pub struct CfiTracer<'a> {
    index: &'a SymbolIndex,
    memory: &'a dyn Memory,
    start: RegisterSet,
    max_depth: usize,
}

impl<'a> CfiTracer<'a> {
    pub fn new(
        index: &'a SymbolIndex,
        memory: &'a dyn Memory,
        context: &RegisterContext,
        max_depth: usize,
    ) -> Self {
        Self {
            index,
            memory,
            start: context.registers().clone(),
            max_depth,
        }
    }
}

impl Tracer for CfiTracer<'_> {
    fn trace(&self) -> impl Iterator<Item = TraceInfo<'_>> + '_ {
        Backtrace {
            unwinder: Unwinder::new(self.index, self.memory, self.start.clone()),
            index: self.index,
            remaining: self.max_depth,
        }
    }
}

pub struct Backtrace<'a> {
    unwinder: Unwinder<'a>,
    index: &'a SymbolIndex,
    remaining: usize,
}

impl<'a> Iterator for Backtrace<'a> {
    type Item = TraceInfo<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let pc = match self.unwinder.next() {
            Ok(Some(pc)) if pc != 0 => pc,
            Ok(_) => {
                self.remaining = 0;
                return None;
            }
            Err(err) => {
                debug!("unwinding stopped: {err}");
                self.remaining = 0;
                return None;
            }
        };
        Some(TraceInfo::new(pc, self.index.locate(self.unwinder.lookup_pc(pc))))
    }
}

struct Unwinder<'a> {
    index: &'a SymbolIndex,
    memory: &'a dyn Memory,
    unwind_ctx: UnwindContext<Slice>,
    /// Parsed tables of the module the last pc was in, keyed by module.
    cached: Option<(*const LoadedModule, EhInfo)>,
    regs: RegisterSet,
    steps: usize,
    is_first: bool,
}

impl<'a> Unwinder<'a> {
    fn new(index: &'a SymbolIndex, memory: &'a dyn Memory, regs: RegisterSet) -> Self {
        Self {
            index,
            memory,
            unwind_ctx: UnwindContext::new(),
            cached: None,
            regs,
            steps: 0,
            is_first: true,
        }
    }

    /// Address to look `pc` up at. Only the starting frame holds an exact
    /// pc; every later one is a return address, which may already belong to
    /// the next function or the next row, so the lookup is done inside the
    /// call instruction.
    fn lookup_pc(&self, pc: usize) -> usize {
        if self.steps == 0 {
            pc
        } else {
            pc - 1
        }
    }

    fn load(&mut self, pc: usize) -> Result<(), UnwinderError> {
        let module = self
            .index
            .module_for(pc)
            .ok_or(UnwinderError::NoUnwindInfo(pc))?;
        let key = module as *const LoadedModule;
        if !matches!(&self.cached, Some((cached, _)) if *cached == key) {
            self.cached = Some((key, EhInfo::for_module(module, self.memory)?));
        }
        Ok(())
    }

    /// The pc of the starting frame, then of each caller in turn. `None`
    /// once the outermost frame has been reported.
    fn next(&mut self) -> Result<Option<usize>, UnwinderError> {
        if self.is_first {
            self.is_first = false;
            return Ok(self.regs.get_pc());
        }
        if !self.step()? {
            return Ok(None);
        }
        Ok(self.regs.get_pc())
    }

    /// Replace the registers of the current frame by those of its caller.
    /// Returns false when the current frame has no caller.
    fn step(&mut self) -> Result<bool, UnwinderError> {
        let pc = self.regs.get_pc().ok_or(UnwinderError::NoReturnAddr)?;
        let lookup = self.lookup_pc(pc);
        self.load(lookup)?;
        let Some((_, info)) = &self.cached else {
            return Err(UnwinderError::NoUnwindInfo(lookup));
        };
        let row = match info.hdr.table() {
            Some(table) => table.unwind_info_for_address(
                &info.eh_frame,
                &info.base_addrs,
                &mut self.unwind_ctx,
                lookup as u64,
                |section, bases, offset| section.cie_from_offset(bases, offset),
            ),
            None => info.eh_frame.unwind_info_for_address(
                &info.base_addrs,
                &mut self.unwind_ctx,
                lookup as u64,
                EhFrame::cie_from_offset,
            ),
        }
        .map_err(|_| UnwinderError::NoUnwindInfo(lookup))?;

        let cfa = match row.cfa() {
            CfaRule::RegisterAndOffset { register, offset } => {
                let reg_val = self
                    .regs
                    .get(*register)
                    .ok_or(UnwinderError::CfaRuleUnknownRegister(register.0))?;
                (reg_val as i64 + offset) as usize
            }
            _ => return Err(UnwinderError::UnsupportedCfaRule),
        };

        let Some(mut caller) = caller_registers(
            &self.regs,
            cfa,
            row.registers(),
            self.memory,
            self.steps == 0,
        )?
        else {
            trace!("{pc:#x}: return address undefined, outermost frame");
            return Ok(false);
        };

        // A frameless leaf may have cfa == sp, but only where the walk starts.
        let sp = self.regs.stack_ptr().unwrap_or(0);
        if cfa < sp || (cfa == sp && self.steps > 0) {
            return Err(UnwinderError::StackNotAdvancing { old: sp, new: cfa });
        }
        let ret = caller.get_ret().ok_or(UnwinderError::NoReturnAddr)?;
        trace!("{pc:#x}: cfa={cfa:#x} ra={ret:#x}");
        caller.set_pc(ret);
        caller.set_stack_ptr(cfa);
        self.regs = caller;
        self.steps += 1;
        Ok(true)
    }
}

/// Registers of the caller, from the rules of the current frame's row.
///
/// gimli leaves undefined rules out of a row, so a return address column
/// without a rule marks the outermost frame (`_start`, a thread entry). The
/// one exception is the starting frame on an ISA with a link register: a leaf
/// that has not spilled it keeps the return address live, and the row says
/// nothing about it.
///
/// Registers without a rule keep their value. Columns the set does not track
/// are skipped, and so are rules this walker cannot evaluate, unless they
/// describe the return address.
fn caller_registers<'r>(
    regs: &RegisterSet,
    cfa: usize,
    rules: impl IntoIterator<Item = &'r (Register, RegisterRule<Slice>)>,
    memory: &dyn Memory,
    starting_frame: bool,
) -> Result<Option<RegisterSet>, UnwinderError> {
    let mut caller = regs.clone();
    let mut ra_rule = false;
    for (reg, rule) in rules {
        let reg = *reg;
        if !RegisterSet::tracks(reg) {
            trace!("register {} not tracked, rule skipped", reg.0);
            continue;
        }
        let value = match rule {
            RegisterRule::Undefined => None,
            RegisterRule::SameValue => regs.get(reg),
            RegisterRule::Offset(offset) => {
                let addr = (cfa as i64 + offset) as usize;
                let value = memory
                    .read_word(addr)
                    .ok_or(UnwinderError::BadStackRead(addr))?;
                Some(value)
            }
            RegisterRule::ValOffset(offset) => Some((cfa as i64 + offset) as usize),
            RegisterRule::Register(other) => regs.get(*other),
            _ if reg == native::RA => return Err(UnwinderError::UnimplementedRegisterRule(reg.0)),
            _ => {
                trace!("unsupported rule for register {}, value dropped", reg.0);
                None
            }
        };
        if reg == native::RA {
            ra_rule = value.is_some();
        }
        match value {
            Some(value) => caller.set(reg, value)?,
            None => caller.undef(reg),
        }
    }
    if !ra_rule && !(starting_frame && regs.get_ret().is_some()) {
        return Ok(None);
    }
    Ok(Some(caller))
}
