//! Public entry points: address resolution, backtraces, and printing them.

use core::fmt::{self, Write};

use log::warn;

use crate::arch::{native_decoder, RegisterContext};
use crate::compiler::CompilerTracer;
use crate::dwarf::CfiTracer;
use crate::stdext;
use crate::symbols::{Function, SymbolIndex};
use crate::utils::ProcessMemory;

/// One frame of a backtrace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceInfo<'a> {
    pub pc: usize,
    pub function: Option<&'a Function>,
    /// `pc` minus the function start, 0 when unresolved.
    pub offset: usize,
}

impl<'a> TraceInfo<'a> {
    pub fn new(pc: usize, function: Option<&'a Function>) -> Self {
        Self {
            pc,
            function,
            offset: function.map_or(0, |f| pc.saturating_sub(f.begin())),
        }
    }

    pub fn func_name(&self) -> Option<&'a str> {
        self.function.map(Function::name)
    }

    pub fn func_addr(&self) -> Option<usize> {
        self.function.map(Function::begin)
    }
}

impl fmt::Display for TraceInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\t=>{}()+{:#x}",
            self.func_name().unwrap_or("??"),
            self.offset
        )
    }
}

/// Produces the frames of a call chain, innermost first.
pub trait Tracer {
    fn trace(&self) -> impl Iterator<Item = TraceInfo<'_>> + '_;
}

/// How frames are popped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// `.eh_frame` call frame information.
    Cfi,
    /// Decoding each function's prologue.
    Prologue,
}

impl Default for Strategy {
    fn default() -> Self {
        if cfg!(any(target_arch = "mips", target_arch = "mips64")) {
            Strategy::Prologue
        } else {
            Strategy::Cfi
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindOptions {
    /// Frames reported at most, counting the starting one.
    pub max_depth: usize,
    pub strategy: Strategy,
}

impl Default for UnwindOptions {
    fn default() -> Self {
        Self {
            max_depth: 256,
            strategy: Strategy::default(),
        }
    }
}

impl UnwindOptions {
    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// Name of the function containing `addr`.
pub fn addr_to_name(addr: usize) -> Option<&'static str> {
    SymbolIndex::global().name_of(addr)
}

/// Offset of `addr` into its function, 0 when unresolved.
pub fn addr_to_offset(addr: usize) -> usize {
    SymbolIndex::global().offset_of(addr)
}

/// Call `f` for every frame, innermost first.
///
/// Without a context the walk starts at the caller of this function.
#[inline(never)]
pub fn backtrace_run<F: FnMut(&TraceInfo<'_>)>(context: Option<&RegisterContext>, f: F) {
    let captured;
    let (start, skip) = match context {
        Some(ctx) => (ctx, 0),
        None => match RegisterContext::capture() {
            Some(ctx) => {
                captured = ctx;
                (&captured, 1)
            }
            None => {
                warn!("register capture is not supported on this target");
                return;
            }
        },
    };
    walk(SymbolIndex::global(), start, skip, &UnwindOptions::default(), f);
}

/// [`backtrace_run`] against a given index, with explicit options.
#[inline(never)]
pub fn backtrace_run_with<F: FnMut(&TraceInfo<'_>)>(
    index: &SymbolIndex,
    context: Option<&RegisterContext>,
    options: &UnwindOptions,
    f: F,
) {
    let captured;
    let (start, skip) = match context {
        Some(ctx) => (ctx, 0),
        None => match RegisterContext::capture() {
            Some(ctx) => {
                captured = ctx;
                (&captured, 1)
            }
            None => {
                warn!("register capture is not supported on this target");
                return;
            }
        },
    };
    walk(index, start, skip, options, f);
}

fn walk<F: FnMut(&TraceInfo<'_>)>(
    index: &SymbolIndex,
    start: &RegisterContext,
    skip: usize,
    options: &UnwindOptions,
    mut f: F,
) {
    let memory = ProcessMemory;
    let decoder = match options.strategy {
        Strategy::Cfi => None,
        Strategy::Prologue => {
            let decoder = native_decoder();
            if decoder.is_none() {
                warn!("no prologue decoder for this target, using unwind tables");
            }
            decoder
        }
    };
    let depth = options.max_depth.saturating_add(skip);
    match decoder {
        Some(decoder) => CompilerTracer::new(index, decoder, &memory, start, depth)
            .trace()
            .skip(skip)
            .for_each(|info| f(&info)),
        None => CfiTracer::new(index, &memory, start, depth)
            .trace()
            .skip(skip)
            .for_each(|info| f(&info)),
    };
}

/// Print the backtrace of the caller to stdout.
#[inline(never)]
pub fn show_backtrace() {
    let Some(ctx) = RegisterContext::capture() else {
        warn!("register capture is not supported on this target");
        return;
    };
    print(&ctx, 1);
}

/// Print the backtrace starting at `context`, e.g. one taken from a signal
/// frame, to stdout.
pub fn show_backtrace_from(context: &RegisterContext) {
    print(context, 0);
}

fn print(start: &RegisterContext, skip: usize) {
    let mut out = stdext::STDOUT;
    let _ = write_backtrace(
        &mut out,
        SymbolIndex::global(),
        start,
        skip,
        &UnwindOptions::default(),
    );
}

/// Format a backtrace as `Call trace:` followed by one `\t=>name()+0xOFF`
/// line per frame and a blank line.
pub fn write_backtrace<W: Write>(
    out: &mut W,
    index: &SymbolIndex,
    start: &RegisterContext,
    skip: usize,
    options: &UnwindOptions,
) -> fmt::Result {
    out.write_str("Call trace:\n")?;
    let mut result = Ok(());
    walk(index, start, skip, options, |info| {
        if result.is_ok() {
            result = writeln!(out, "{info}");
        }
    });
    result?;
    out.write_str("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_line_format() {
        let f = Function::new("func0", 0x1000, 0x40);
        assert_eq!(TraceInfo::new(0x1010, Some(&f)).to_string(), "\t=>func0()+0x10");
        assert_eq!(TraceInfo::new(0x1010, None).to_string(), "\t=>??()+0x0");
    }

    #[test]
    fn default_options() {
        let options = UnwindOptions::default();
        assert_eq!(options.max_depth, 256);
        assert_eq!(options.strategy(Strategy::Prologue).strategy, Strategy::Prologue);
        if cfg!(target_arch = "x86_64") {
            assert_eq!(options.strategy, Strategy::Cfi);
        }
    }

    #[test]
    fn unresolved_start_prints_one_placeholder_frame() {
        let index: SymbolIndex = Vec::new().into_iter().collect();
        let ctx = RegisterContext::new(0x10, 0x1000);
        let mut out = String::new();
        let options = UnwindOptions::default().strategy(Strategy::Cfi);
        write_backtrace(&mut out, &index, &ctx, 0, &options).unwrap();
        assert_eq!(out, "Call trace:\n\t=>??()+0x0\n\n");

        // the prologue walker reports nothing it cannot name
        let options = options.strategy(Strategy::Prologue);
        let mut out = String::new();
        write_backtrace(&mut out, &index, &ctx, 0, &options).unwrap();
        if native_decoder().is_some() {
            assert_eq!(out, "Call trace:\n\n");
        }
    }

    #[test]
    fn prologue_without_decoder_falls_back() {
        let index: SymbolIndex = Vec::new().into_iter().collect();
        let ctx = RegisterContext::new(0x10, 0x1000);
        let options = UnwindOptions::default().strategy(Strategy::Prologue);
        let mut frames = 0;
        backtrace_run_with(&index, Some(&ctx), &options, |_| frames += 1);
        let expected = if native_decoder().is_some() { 0 } else { 1 };
        assert_eq!(frames, expected);
    }
}
