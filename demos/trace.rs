use elftrace::{addr_to_name, backtrace_run, show_backtrace, show_backtrace_from};
use elftrace::{RegisterContext, SymbolIndex};

#[no_mangle]
#[inline(never)]
fn func2(a: usize, b: usize) -> usize {
    let c = a * b;
    println!("func2: c = {c}");
    show_backtrace();
    c
}

#[no_mangle]
#[inline(never)]
fn func1(a: usize, b: usize) -> usize {
    let c = func2(a, b);
    println!("func1: c = {c}");
    c
}

#[no_mangle]
#[inline(never)]
fn func0(a: usize, b: usize) -> usize {
    let c = func1(a, b);
    println!("func0: c = {c}");
    c
}

#[inline(never)]
fn abort_function() {
    std::process::abort();
}

#[inline(never)]
fn abort_function1() {
    abort_function();
    std::hint::black_box(());
}

extern "C" fn handler(_no: libc::c_int, _info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    // SAFETY: installed with SA_SIGINFO, so `ctx` is the interrupted context.
    match unsafe { RegisterContext::from_ucontext(ctx) } {
        Some(ctx) => show_backtrace_from(&ctx),
        None => show_backtrace(),
    }
    unsafe { libc::_exit(0) };
}

fn main() {
    // Build the index before any handler can run.
    let index = SymbolIndex::global();
    println!("indexed {} functions in {} modules", index.len(), index.modules().len());

    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as *const () as libc::sighandler_t;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGABRT, &action, std::ptr::null_mut());
    }

    let funcptr: fn(usize, usize) -> usize = func0;
    let c = funcptr(4, 5);
    println!("main: c = {c}");
    println!(
        "funcptr's name = {}",
        addr_to_name(funcptr as usize).unwrap_or("??")
    );

    backtrace_run(None, |info| {
        println!("{:#x} {} +{:#x}", info.pc, info.func_name().unwrap_or("??"), info.offset);
    });

    abort_function1();
}
