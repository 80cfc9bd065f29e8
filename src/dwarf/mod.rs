//! Unwinding through the DWARF call frame information in `.eh_frame`.

mod arch;
mod unwinder;

pub use arch::{native, RegisterSet};
pub use unwinder::{Backtrace, CfiTracer};
