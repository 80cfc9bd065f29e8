//! Modules mapped into the process, as reported by the dynamic linker.

use core::mem::size_of;
use core::ops::Range;
use std::ffi::CStr;

use log::{debug, warn};
use object::read::elf::{Dyn as _, FileHeader};
use object::NativeEndian;

use super::gnu_hash;
use super::image::Elf;

pub type Dyn = <Elf as FileHeader>::Dyn;

/// One `PT_LOAD` segment at its runtime address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub range: Range<usize>,
    pub flags: u32,
}

impl Segment {
    pub fn is_executable(&self) -> bool {
        self.flags & object::elf::PF_X != 0
    }
}

/// A loaded object (the main program, a shared library, or the vDSO).
#[derive(Debug, Clone)]
pub struct LoadedModule {
    name: String,
    bias: usize,
    segments: Vec<Segment>,
    dynamic: Option<Range<usize>>,
    eh_frame_hdr: Option<Range<usize>>,
}

/// The parts of a module's dynamic section the symbol index needs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DynamicInfo {
    pub strtab: Option<usize>,
    pub strsz: Option<usize>,
    pub symtab: Option<usize>,
    pub syment: Option<usize>,
    pub hash: Option<usize>,
    pub gnu_hash: Option<usize>,
}

impl DynamicInfo {
    /// Dynamic symbol count, preferring the GNU hash table.
    pub fn symbol_count(&self, module: &LoadedModule) -> usize {
        let gnu = self
            .gnu_hash
            .and_then(|addr| module.tail(addr))
            .and_then(gnu_hash::symbol_count)
            .filter(|&count| count != 0);
        let sysv = self
            .hash
            .and_then(|addr| module.region(addr, 8))
            .and_then(|table| table.get(4..8))
            .map(|nchain| u32::from_ne_bytes([nchain[0], nchain[1], nchain[2], nchain[3]]));
        gnu.or(sysv).unwrap_or(0) as usize
    }
}

impl LoadedModule {
    #[cfg(test)]
    pub(crate) fn synthetic(name: &str, bias: usize, segments: Vec<Segment>) -> Self {
        Self {
            name: name.to_owned(),
            bias,
            segments,
            dynamic: None,
            eh_frame_hdr: None,
        }
    }

    /// Path as given by the dynamic linker; the main program uses the
    /// executable path.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bias(&self) -> usize {
        self.bias
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.segment_for(addr).is_some()
    }

    pub fn segment_for(&self, addr: usize) -> Option<&Segment> {
        self.segments.iter().find(|seg| seg.range.contains(&addr))
    }

    /// Bytes from `addr` to the end of the segment holding it.
    pub fn tail(&self, addr: usize) -> Option<&'static [u8]> {
        let seg = self.segment_for(addr)?;
        self.region(addr, seg.range.end - addr)
    }

    /// Exactly `len` bytes at `addr`, if they lie inside one segment.
    pub fn region(&self, addr: usize, len: usize) -> Option<&'static [u8]> {
        let seg = self.segment_for(addr)?;
        if addr.checked_add(len)? > seg.range.end {
            return None;
        }
        // SAFETY: `addr..addr + len` lies inside a PT_LOAD segment of a
        // module that the dynamic linker reported as mapped. Modules are
        // assumed to stay loaded for the life of the index.
        Some(unsafe { core::slice::from_raw_parts(addr as *const u8, len) })
    }

    pub fn eh_frame_hdr(&self) -> Option<&'static [u8]> {
        let hdr = self.eh_frame_hdr.clone()?;
        self.region(hdr.start, hdr.len())
    }

    pub fn dynamic_entries(&self) -> &'static [Dyn] {
        let Some(range) = self.dynamic.clone() else {
            return &[];
        };
        let Some(bytes) = self.region(range.start, range.len()) else {
            return &[];
        };
        let count = bytes.len() / size_of::<Dyn>();
        object::pod::slice_from_bytes::<Dyn>(bytes, count)
            .map(|(entries, _)| entries)
            .unwrap_or(&[])
    }

    /// Walk the dynamic section up to `DT_NULL`.
    ///
    /// Pointer entries below the module base are treated as missing: the
    /// vDSO reports unrelocated values there.
    pub fn dynamic_info(&self) -> Option<DynamicInfo> {
        let entries = self.dynamic_entries();
        if entries.is_empty() {
            return None;
        }
        let mut info = DynamicInfo::default();
        for entry in entries {
            let tag: u64 = entry.d_tag(NativeEndian).into();
            let val: u64 = entry.d_val(NativeEndian).into();
            let val = val as usize;
            let pointer = || {
                if val >= self.bias {
                    Some(val)
                } else {
                    warn!(
                        "{}: dynamic tag {tag:#x} points below load base ({val:#x} < {:#x})",
                        self.name, self.bias
                    );
                    None
                }
            };
            let Ok(tag) = u32::try_from(tag) else {
                continue;
            };
            match tag {
                object::elf::DT_NULL => break,
                object::elf::DT_STRTAB => info.strtab = pointer(),
                object::elf::DT_SYMTAB => info.symtab = pointer(),
                object::elf::DT_HASH => info.hash = pointer(),
                object::elf::DT_GNU_HASH => info.gnu_hash = pointer(),
                object::elf::DT_STRSZ => info.strsz = Some(val),
                object::elf::DT_SYMENT => info.syment = Some(val),
                _ => {}
            }
        }
        Some(info)
    }
}

/// Visit every module the dynamic linker has mapped, main program first.
pub fn for_each_module<F: FnMut(LoadedModule)>(mut f: F) {
    unsafe extern "C" fn callback<F: FnMut(LoadedModule)>(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut libc::c_void,
    ) -> libc::c_int {
        let f = &mut *(data as *mut F);
        let info = &*info;
        let bias = info.dlpi_addr as usize;
        let name = if info.dlpi_name.is_null() {
            String::new()
        } else {
            CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
        };
        let headers = if info.dlpi_phdr.is_null() {
            &[][..]
        } else {
            core::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize)
        };

        let mut module = LoadedModule {
            name,
            bias,
            segments: Vec::new(),
            dynamic: None,
            eh_frame_hdr: None,
        };
        for header in headers {
            let start = bias.wrapping_add(header.p_vaddr as usize);
            let range = start..start.wrapping_add(header.p_memsz as usize);
            match header.p_type {
                object::elf::PT_LOAD => module.segments.push(Segment {
                    range,
                    flags: header.p_flags,
                }),
                object::elf::PT_DYNAMIC => module.dynamic = Some(range),
                object::elf::PT_GNU_EH_FRAME => module.eh_frame_hdr = Some(range),
                _ => {}
            }
        }
        f(module);
        0
    }

    // SAFETY: the callback only reads the `dl_phdr_info` it is handed, and
    // `f` outlives the call.
    unsafe {
        libc::dl_iterate_phdr(Some(callback::<F>), &mut f as *mut F as *mut libc::c_void);
    }
}

/// Snapshot of all loaded modules.
pub fn loaded_modules() -> Vec<LoadedModule> {
    let mut modules = Vec::new();
    for_each_module(|mut module| {
        if modules.is_empty() && module.name.is_empty() {
            module.name = std::env::current_exe()
                .map(|path| path.display().to_string())
                .unwrap_or_default();
        }
        debug!(
            "module {:?} bias={:#x} segments={}",
            module.name,
            module.bias,
            module.segments.len()
        );
        modules.push(module);
    });
    modules
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn marker() -> usize {
        marker as *const () as usize
    }

    #[test]
    fn main_program_comes_first_and_maps_our_code() {
        let modules = loaded_modules();
        assert!(!modules.is_empty());
        let main = &modules[0];
        let seg = main.segment_for(marker()).expect("code segment");
        assert!(seg.is_executable());
        assert!(main.eh_frame_hdr().is_some());
    }

    #[test]
    fn dynamic_section_is_readable() {
        let modules = loaded_modules();
        let libc_like = modules
            .iter()
            .filter_map(|m| m.dynamic_info())
            .find(|info| info.symtab.is_some() && info.strtab.is_some());
        assert!(libc_like.is_some());
    }

    #[test]
    fn views_stay_inside_segments() {
        let module = LoadedModule::synthetic(
            "fake",
            0x1000,
            vec![Segment {
                range: 0x1000..0x2000,
                flags: 0,
            }],
        );
        assert!(module.region(0x1ff0, 0x20).is_none());
        assert!(module.tail(0x2000).is_none());
        assert!(module.contains(0x1fff));
        assert!(module.dynamic_info().is_none());
    }

    #[test]
    fn dynamic_pointers_below_base_are_unavailable() {
        use object::elf::{DT_GNU_HASH, DT_NULL, DT_STRSZ, DT_STRTAB, DT_SYMTAB};

        // `Dyn` is a pair of words on both ELF classes
        let mut words = vec![0usize; 12];
        let start = words.as_ptr() as usize;
        let bias = start;
        let entries = [
            (DT_STRTAB, 0x40),
            (DT_SYMTAB, bias + 0x100),
            (DT_GNU_HASH, 0x80),
            (DT_STRSZ, 0x20),
            (DT_NULL, 0),
        ];
        for (i, (tag, val)) in entries.iter().enumerate() {
            words[2 * i] = *tag as usize;
            words[2 * i + 1] = *val;
        }
        let len = words.len() * size_of::<usize>();
        let module = LoadedModule {
            dynamic: Some(start..start + len),
            ..LoadedModule::synthetic(
                "vdso-like",
                bias,
                vec![Segment {
                    range: start..start + len,
                    flags: 0,
                }],
            )
        };

        let info = module.dynamic_info().expect("dynamic section");
        assert_eq!(info.strtab, None);
        assert_eq!(info.gnu_hash, None);
        assert_eq!(info.symtab, Some(bias + 0x100));
        assert_eq!(info.strsz, Some(0x20));
        assert_eq!(info.hash, None);
    }
}
