//! Read-only mapping of the running executable.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use log::debug;
use memmap2::Mmap;
use object::read::elf::{FileHeader, SectionHeader as _, SectionTable, SymbolTable};
use object::read::StringTable;
use object::NativeEndian;

use crate::error::ImageError;

#[cfg(target_pointer_width = "32")]
pub type Elf = object::elf::FileHeader32<NativeEndian>;
#[cfg(target_pointer_width = "64")]
pub type Elf = object::elf::FileHeader64<NativeEndian>;

pub type SectionHeader = <Elf as FileHeader>::SectionHeader;
pub type Sym = <Elf as FileHeader>::Sym;

/// The process's own alias for its executable.
pub const SELF_EXE: &str = "/proc/self/exe";

const MAX_SYMLINK_HOPS: usize = 40;

/// Follow symlinks from `path` until a regular file path is reached.
pub fn resolve_symlinks(path: &Path) -> Result<PathBuf, ImageError> {
    let mut path = path.to_path_buf();
    for _ in 0..MAX_SYMLINK_HOPS {
        let meta = fs::symlink_metadata(&path).map_err(|source| ImageError::Resolve {
            path: path.clone(),
            source,
        })?;
        if !meta.file_type().is_symlink() {
            return Ok(path);
        }
        let target = fs::read_link(&path).map_err(|source| ImageError::Resolve {
            path: path.clone(),
            source,
        })?;
        path = if target.is_absolute() {
            target
        } else {
            path.parent().unwrap_or(Path::new("/")).join(target)
        };
    }
    Err(ImageError::SymlinkLoop(path))
}

/// An ELF file mapped whole into memory.
pub struct ImageReader {
    path: PathBuf,
    map: Mmap,
}

impl ImageReader {
    /// Map the executable of the current process.
    pub fn open_self() -> Result<Self, ImageError> {
        let path = resolve_symlinks(Path::new(SELF_EXE))?;
        Self::open(path)
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ImageError> {
        let path = path.into();
        let file = File::open(&path).map_err(|source| ImageError::Open {
            path: path.clone(),
            source,
        })?;
        // SAFETY: the mapping is private and read-only. A concurrent
        // truncation of the file would fault, which we accept for an
        // executable that is currently running.
        let map = unsafe { Mmap::map(&file) }.map_err(|source| ImageError::Map {
            path: path.clone(),
            source,
        })?;
        debug!("mapped {} ({} bytes)", path.display(), map.len());
        Ok(Self { path, map })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &[u8] {
        &self.map
    }

    /// Structural view of the mapped file.
    pub fn parse(&self) -> Result<ElfView<'_>, ImageError> {
        ElfView::parse(&self.map)
    }
}

/// Zero-copy accessors over a mapped ELF file.
pub struct ElfView<'a> {
    endian: NativeEndian,
    header: &'a Elf,
    sections: SectionTable<'a, Elf>,
    symbols: SymbolTable<'a, Elf>,
}

impl<'a> ElfView<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, ImageError> {
        let header = Elf::parse(data)?;
        let endian = header.endian()?;
        let sections = header.sections(endian, data)?;
        let symbols = sections.symbols(endian, data, object::elf::SHT_SYMTAB)?;
        Ok(Self {
            endian,
            header,
            sections,
            symbols,
        })
    }

    pub fn endian(&self) -> NativeEndian {
        self.endian
    }

    /// `e_type`, e.g. `ET_EXEC` or `ET_DYN`.
    pub fn file_type(&self) -> u16 {
        self.header.e_type(self.endian)
    }

    pub fn section_headers(&self) -> &'a [SectionHeader] {
        self.sections.iter().as_slice()
    }

    pub fn section_name(&self, section: &SectionHeader) -> Option<&'a [u8]> {
        self.sections.section_name(self.endian, section).ok()
    }

    pub fn section_by_name(&self, name: &str) -> Option<&'a SectionHeader> {
        self.sections
            .section_by_name(self.endian, name.as_bytes())
            .map(|(_, section)| section)
    }

    /// `.strtab` entry at `offset`.
    pub fn symbol_name(&self, offset: u32) -> Option<&'a [u8]> {
        self.symbols.strings().get(offset).ok()
    }

    pub fn strings(&self) -> StringTable<'a> {
        self.symbols.strings()
    }

    /// Entries of `.symtab`; empty for a stripped file.
    pub fn symbols(&self) -> &'a [Sym] {
        self.symbols.symbols()
    }

    pub fn section_kind(&self, section: &SectionHeader) -> u32 {
        section.sh_type(self.endian)
    }
}
