use core::fmt;

/// `fmt::Write` straight onto a file descriptor with `write(2)`, which is
/// async-signal-safe. Nothing is buffered.
#[derive(Debug, Clone, Copy)]
pub struct FdWriter(pub libc::c_int);

pub const STDOUT: FdWriter = FdWriter(libc::STDOUT_FILENO);

impl fmt::Write for FdWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_all(s.as_bytes(), |chunk| {
            // SAFETY: the pointer and length come from a live slice.
            unsafe { libc::write(self.0, chunk.as_ptr().cast(), chunk.len()) }
        })
    }
}

/// Feed `bytes` to `write` until all of it is taken. A short write may stop
/// inside a multi-byte character, so this works on bytes, not `str`.
fn write_all(mut bytes: &[u8], mut write: impl FnMut(&[u8]) -> isize) -> fmt::Result {
    while !bytes.is_empty() {
        let r = write(bytes);
        if r < 0 {
            if errno() == libc::EINTR {
                continue;
            }
            return Err(fmt::Error);
        }
        if r == 0 {
            return Err(fmt::Error);
        }
        bytes = &bytes[(r as usize)..];
    }
    Ok(())
}

fn errno() -> i32 {
    // SAFETY: the errno location is valid for the calling thread.
    unsafe { *libc::__errno_location() }
}
