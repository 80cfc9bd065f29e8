use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Reasons the running executable could not be mapped for symbol reading.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("cannot resolve executable path {path}: {source}")]
    Resolve {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("too many symlink hops while resolving {0}")]
    SymlinkLoop(PathBuf),

    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot map {path}: {source}")]
    Map {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed ELF image: {0}")]
    Elf(#[from] object::Error),
}

/// Why a single unwind step could not be completed.
#[derive(Debug, Error)]
pub enum UnwinderError {
    #[error("no unwind information for {0:#x}")]
    NoUnwindInfo(usize),

    #[error("unsupported CFA rule")]
    UnsupportedCfaRule,

    #[error("CFA rule uses untracked register {0}")]
    CfaRuleUnknownRegister(u16),

    #[error("unexpected register {0}")]
    UnexpectedRegister(u16),

    #[error("unimplemented rule for register {0}")]
    UnimplementedRegisterRule(u16),

    #[error("no return address")]
    NoReturnAddr,

    #[error("unreadable stack slot at {0:#x}")]
    BadStackRead(usize),

    #[error("stack pointer did not advance ({old:#x} -> {new:#x})")]
    StackNotAdvancing { old: usize, new: usize },

    #[error("dwarf: {0}")]
    Dwarf(gimli::Error),
}

impl From<gimli::Error> for UnwinderError {
    fn from(err: gimli::Error) -> Self {
        UnwinderError::Dwarf(err)
    }
}
