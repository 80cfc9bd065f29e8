//! In-process symbolization and stack unwinding for ELF programs.
//!
//! [`SymbolIndex`] maps code addresses to function names using the
//! executable's `.symtab` and the dynamic symbol tables of every loaded
//! module. Two unwinders walk the stack on top of it: [`CfiTracer`] reads
//! the `.eh_frame` tables, [`CompilerTracer`] decodes function prologues on
//! targets where those tables are missing or untrustworthy.
//!
//! Everything reachable from a backtrace entry point only reads memory that
//! was indexed up front, so [`SymbolIndex::global`] should be called once
//! before installing signal handlers.

pub mod arch;
mod backtrace;
mod compiler;
mod dwarf;
mod error;
pub mod stdext;
pub mod symbols;
mod utils;

pub use arch::{native_decoder, Insn, PrologueDecoder, RegisterContext};
pub use backtrace::{
    addr_to_name, addr_to_offset, backtrace_run, backtrace_run_with, show_backtrace,
    show_backtrace_from, write_backtrace, Strategy, TraceInfo, Tracer, UnwindOptions,
};
pub use compiler::{CompilerTracer, Frame, Prologue, MAX_SCAN};
pub use dwarf::{Backtrace, CfiTracer, RegisterSet};
pub use error::{ImageError, UnwinderError};
pub use symbols::{Binding, Function, SymbolIndex, SymbolIndexBuilder};
pub use utils::{Memory, ProcessMemory};
