use core::mem::size_of;

/// Read access to the address space being unwound.
///
/// Unwinders only ever read through this trait, so the walk can be replayed
/// against a synthetic address space in tests.
pub trait Memory {
    fn read_u16(&self, addr: usize) -> Option<u16>;
    fn read_u32(&self, addr: usize) -> Option<u32>;
    fn read_word(&self, addr: usize) -> Option<usize>;
}

/// The current process, read in place.
///
/// Only null and misaligned addresses are rejected. Callers keep reads inside
/// ranges they already know to be mapped: resolved function bodies for code,
/// and stack slots derived from the live stack pointer.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessMemory;

impl ProcessMemory {
    fn checked<T>(addr: usize) -> Option<*const T> {
        if addr == 0 || addr % core::mem::align_of::<T>() != 0 {
            return None;
        }
        addr.checked_add(size_of::<T>())?;
        Some(addr as *const T)
    }
}

impl Memory for ProcessMemory {
    fn read_u16(&self, addr: usize) -> Option<u16> {
        let ptr = Self::checked::<u16>(addr)?;
        // SAFETY: see the type docs; the address is non-null and aligned.
        Some(unsafe { ptr.read_volatile() })
    }

    fn read_u32(&self, addr: usize) -> Option<u32> {
        let ptr = Self::checked::<u32>(addr)?;
        // SAFETY: as above.
        Some(unsafe { ptr.read_volatile() })
    }

    fn read_word(&self, addr: usize) -> Option<usize> {
        let ptr = Self::checked::<usize>(addr)?;
        // SAFETY: as above.
        Some(unsafe { ptr.read_volatile() })
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::BTreeMap;

    use super::Memory;

    /// Sparse little address space made of byte runs.
    #[derive(Debug, Default)]
    pub(crate) struct FakeMemory {
        bytes: BTreeMap<usize, u8>,
    }

    impl FakeMemory {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn put_bytes(&mut self, addr: usize, data: &[u8]) {
            for (i, b) in data.iter().enumerate() {
                self.bytes.insert(addr + i, *b);
            }
        }

        /// Lay out 32-bit instruction words starting at `addr`.
        pub(crate) fn put_u32s(&mut self, addr: usize, words: &[u32]) {
            for (i, w) in words.iter().enumerate() {
                self.put_bytes(addr + i * 4, &w.to_ne_bytes());
            }
        }

        /// Lay out 16-bit parcels starting at `addr`.
        pub(crate) fn put_u16s(&mut self, addr: usize, parcels: &[u16]) {
            for (i, p) in parcels.iter().enumerate() {
                self.put_bytes(addr + i * 2, &p.to_ne_bytes());
            }
        }

        pub(crate) fn put_word(&mut self, addr: usize, value: usize) {
            self.put_bytes(addr, &value.to_ne_bytes());
        }

        fn read<const N: usize>(&self, addr: usize) -> Option<[u8; N]> {
            let mut out = [0u8; N];
            for (i, b) in out.iter_mut().enumerate() {
                *b = *self.bytes.get(&addr.checked_add(i)?)?;
            }
            Some(out)
        }
    }

    impl Memory for FakeMemory {
        fn read_u16(&self, addr: usize) -> Option<u16> {
            self.read::<2>(addr).map(u16::from_ne_bytes)
        }

        fn read_u32(&self, addr: usize) -> Option<u32> {
            self.read::<4>(addr).map(u32::from_ne_bytes)
        }

        fn read_word(&self, addr: usize) -> Option<usize> {
            self.read::<{ core::mem::size_of::<usize>() }>(addr)
                .map(usize::from_ne_bytes)
        }
    }
}
