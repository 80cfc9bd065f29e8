//! Starting register state for a walk.

use gimli::Register;

use crate::dwarf::{native, RegisterSet};

/// Snapshot of the registers a walk starts from.
///
/// Only the pc, stack pointer, frame pointer and (where the ISA has one)
/// return-address register are captured live. Callers that have more, e.g.
/// from a signal frame, can add registers by DWARF number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterContext {
    regs: RegisterSet,
}

impl RegisterContext {
    pub fn new(pc: usize, sp: usize) -> Self {
        Self {
            regs: RegisterSet::new(pc, sp),
        }
    }

    pub fn with_fp(self, fp: usize) -> Self {
        self.with_register(native::FP.0, fp)
    }

    pub fn with_ra(self, ra: usize) -> Self {
        self.with_register(native::RA.0, ra)
    }

    /// Set a register by DWARF number. Numbers beyond the tracked range are
    /// ignored.
    pub fn with_register(mut self, reg: u16, value: usize) -> Self {
        let _ = self.regs.set(Register(reg), value);
        self
    }

    pub fn pc(&self) -> usize {
        self.regs.get_pc().unwrap_or(0)
    }

    pub fn sp(&self) -> usize {
        self.regs.stack_ptr().unwrap_or(0)
    }

    pub fn fp(&self) -> Option<usize> {
        self.regs.frame_ptr()
    }

    pub fn ra(&self) -> Option<usize> {
        self.regs.get_ret()
    }

    pub fn registers(&self) -> &RegisterSet {
        &self.regs
    }

    /// Registers of the calling function at the point of the call.
    ///
    /// Always inlined, so the snapshot describes the frame of the function
    /// this appears in.
    #[inline(always)]
    pub fn capture() -> Option<Self> {
        capture_native()
    }

    /// Registers of the interrupted code from a signal handler's `ucontext`
    /// argument.
    ///
    /// # Safety
    ///
    /// `ucontext` must be null or the third argument of an `SA_SIGINFO`
    /// handler that is still running.
    pub unsafe fn from_ucontext(ucontext: *const libc::c_void) -> Option<Self> {
        if ucontext.is_null() {
            return None;
        }
        from_ucontext_native(ucontext)
    }
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn capture_native() -> Option<RegisterContext> {
    let (pc, sp, fp): (usize, usize, usize);
    // SAFETY: only reads registers.
    unsafe {
        core::arch::asm!(
            "lea {pc}, [rip]",
            "mov {sp}, rsp",
            "mov {fp}, rbp",
            pc = out(reg) pc,
            sp = out(reg) sp,
            fp = out(reg) fp,
            options(nomem, nostack, preserves_flags),
        );
    }
    Some(RegisterContext::new(pc, sp).with_fp(fp))
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
fn capture_native() -> Option<RegisterContext> {
    let (pc, sp, fp, ra): (usize, usize, usize, usize);
    // SAFETY: only reads registers. x30 is read before any output is written.
    unsafe {
        core::arch::asm!(
            "mov {ra}, x30",
            "mov {fp}, x29",
            "mov {sp}, sp",
            "adr {pc}, .",
            pc = out(reg) pc,
            sp = out(reg) sp,
            fp = out(reg) fp,
            ra = out(reg) ra,
            options(nomem, nostack, preserves_flags),
        );
    }
    Some(RegisterContext::new(pc, sp).with_fp(fp).with_ra(ra))
}

#[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))]
#[inline(always)]
fn capture_native() -> Option<RegisterContext> {
    let (pc, sp, fp, ra): (usize, usize, usize, usize);
    // SAFETY: only reads registers. ra is read before any output is written.
    unsafe {
        core::arch::asm!(
            "mv {ra}, ra",
            "mv {fp}, s0",
            "mv {sp}, sp",
            "auipc {pc}, 0",
            pc = out(reg) pc,
            sp = out(reg) sp,
            fp = out(reg) fp,
            ra = out(reg) ra,
            options(nomem, nostack, preserves_flags),
        );
    }
    Some(RegisterContext::new(pc, sp).with_fp(fp).with_ra(ra))
}

#[cfg(any(target_arch = "mips", target_arch = "mips64"))]
#[inline(always)]
fn capture_native() -> Option<RegisterContext> {
    let (pc, sp, fp, ra): (usize, usize, usize, usize);
    // SAFETY: only reads registers. `bal` overwrites $31 to learn the pc, so
    // $31 is restored from the copy taken first.
    unsafe {
        core::arch::asm!(
            ".set push",
            ".set noreorder",
            "move {ra}, $31",
            "move {fp}, $30",
            "move {sp}, $29",
            "bal 1f",
            "nop",
            "1:",
            "move {pc}, $31",
            "move $31, {ra}",
            ".set pop",
            pc = out(reg) pc,
            sp = out(reg) sp,
            fp = out(reg) fp,
            ra = out(reg) ra,
            options(nomem, nostack),
        );
    }
    Some(RegisterContext::new(pc, sp).with_fp(fp).with_ra(ra))
}

#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "riscv32",
    target_arch = "riscv64",
    target_arch = "mips",
    target_arch = "mips64"
)))]
#[inline(always)]
fn capture_native() -> Option<RegisterContext> {
    None
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn from_ucontext_native(ucontext: *const libc::c_void) -> Option<RegisterContext> {
    let uc = &*(ucontext as *const libc::ucontext_t);
    let gregs = &uc.uc_mcontext.gregs;
    let reg = |i: libc::c_int| gregs[i as usize] as usize;
    Some(
        RegisterContext::new(reg(libc::REG_RIP), reg(libc::REG_RSP))
            .with_fp(reg(libc::REG_RBP))
            .with_register(gimli::X86_64::RBX.0, reg(libc::REG_RBX))
            .with_register(gimli::X86_64::R12.0, reg(libc::REG_R12))
            .with_register(gimli::X86_64::R13.0, reg(libc::REG_R13))
            .with_register(gimli::X86_64::R14.0, reg(libc::REG_R14))
            .with_register(gimli::X86_64::R15.0, reg(libc::REG_R15)),
    )
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn from_ucontext_native(ucontext: *const libc::c_void) -> Option<RegisterContext> {
    let uc = &*(ucontext as *const libc::ucontext_t);
    let mc = &uc.uc_mcontext;
    let mut ctx = RegisterContext::new(mc.pc as usize, mc.sp as usize);
    for (i, value) in mc.regs.iter().enumerate() {
        ctx = ctx.with_register(i as u16, *value as usize);
    }
    Some(ctx)
}

#[cfg(all(target_os = "linux", target_arch = "riscv64"))]
unsafe fn from_ucontext_native(ucontext: *const libc::c_void) -> Option<RegisterContext> {
    let uc = &*(ucontext as *const libc::ucontext_t);
    // __gregs[0] is the pc, the rest are x1..x31
    let gregs = &uc.uc_mcontext.__gregs;
    let mut ctx = RegisterContext::new(gregs[0] as usize, gregs[2] as usize);
    for (i, value) in gregs.iter().enumerate().skip(1) {
        ctx = ctx.with_register(i as u16, *value as usize);
    }
    Some(ctx)
}

#[cfg(all(target_os = "linux", any(target_arch = "mips", target_arch = "mips64")))]
unsafe fn from_ucontext_native(ucontext: *const libc::c_void) -> Option<RegisterContext> {
    let uc = &*(ucontext as *const mips_ucontext::UContext);
    let mc = &uc.uc_mcontext;
    let gregs = &mc.gregs;
    let mut ctx = RegisterContext::new(mc.pc as usize, gregs[29] as usize);
    for (i, value) in gregs.iter().enumerate() {
        ctx = ctx.with_register(i as u16, *value as usize);
    }
    Some(ctx)
}

/// glibc's MIPS `ucontext_t`, up to the register file.
#[cfg(all(target_os = "linux", any(target_arch = "mips", target_arch = "mips64")))]
mod mips_ucontext {
    #[repr(C)]
    pub struct UContext {
        pub uc_flags: libc::c_ulong,
        pub uc_link: *mut UContext,
        pub uc_stack: libc::stack_t,
        pub uc_mcontext: MContext,
    }

    #[cfg(target_arch = "mips")]
    #[repr(C)]
    pub struct MContext {
        pub regmask: u32,
        pub status: u32,
        pub pc: u64,
        pub gregs: [u64; 32],
    }

    #[cfg(target_arch = "mips64")]
    #[repr(C)]
    pub struct MContext {
        pub gregs: [u64; 32],
        pub fpregs: [f64; 32],
        pub mdhi: u64,
        pub hi: [u64; 3],
        pub mdlo: u64,
        pub lo: [u64; 3],
        pub pc: u64,
    }
}

#[cfg(not(all(
    target_os = "linux",
    any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "riscv64",
        target_arch = "mips",
        target_arch = "mips64"
    )
)))]
unsafe fn from_ucontext_native(_ucontext: *const libc::c_void) -> Option<RegisterContext> {
    None
}
