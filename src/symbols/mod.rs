//! Address to function index for the executable and every loaded module.
//!
//! The index is built in two passes that both feed [`SymbolIndexBuilder::add_elf_symbol`]:
//! the `.symtab` of the mapped executable, then the dynamic symbol table of
//! each module the dynamic linker reports, read straight out of process
//! memory. Once built it is immutable, and lookups neither lock nor allocate,
//! so they are usable from a signal handler.

pub mod demangle;
pub mod gnu_hash;
pub mod image;
pub mod modules;

use core::mem::size_of;

use log::{debug, warn};
use object::read::elf::Sym as _;
use object::read::StringTable;
use once_cell::sync::OnceCell;

pub use demangle::demangle;
pub use image::{ElfView, ImageReader};
pub use modules::{for_each_module, loaded_modules, DynamicInfo, LoadedModule, Segment};

use image::Sym;

/// How strongly a symbol names its address, strongest first.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Binding {
    #[default]
    Global,
    Weak,
    /// `STB_LOCAL`, or a global with hidden or internal visibility.
    Local,
}

impl Binding {
    fn of(sym: &Sym) -> Self {
        let visibility = sym.st_visibility();
        if visibility == object::elf::STV_HIDDEN || visibility == object::elf::STV_INTERNAL {
            return Binding::Local;
        }
        match sym.st_bind() {
            object::elf::STB_LOCAL => Binding::Local,
            object::elf::STB_WEAK => Binding::Weak,
            _ => Binding::Global,
        }
    }
}

/// A function known to the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    name: String,
    begin: usize,
    size: usize,
    binding: Binding,
}

impl Function {
    pub fn new(name: impl Into<String>, begin: usize, size: usize) -> Self {
        Self {
            name: name.into(),
            begin,
            size,
            binding: Binding::Global,
        }
    }

    pub fn with_binding(mut self, binding: Binding) -> Self {
        self.binding = binding;
        self
    }

    pub fn binding(&self) -> Binding {
        self.binding
    }

    fn leading_underscores(&self) -> usize {
        self.name.bytes().take_while(|&b| b == b'_').count()
    }

    /// Demangled display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn begin(&self) -> usize {
        self.begin
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end(&self) -> usize {
        self.begin.saturating_add(self.size)
    }

    /// Inclusive of `end`, so that a return address just past a trailing
    /// call still belongs to the caller.
    pub fn contains(&self, addr: usize) -> bool {
        self.begin <= addr && addr <= self.end()
    }
}

/// Sorted, immutable address to [`Function`] table plus the module map.
pub struct SymbolIndex {
    functions: Vec<Function>,
    modules: Vec<LoadedModule>,
    image: Option<ImageReader>,
}

static GLOBAL: OnceCell<SymbolIndex> = OnceCell::new();

impl SymbolIndex {
    pub fn builder() -> SymbolIndexBuilder {
        SymbolIndexBuilder::new()
    }

    /// Index the running process with default options.
    pub fn build() -> Self {
        Self::builder().build()
    }

    /// The process-wide index, built by whichever caller gets here first.
    ///
    /// Call this once before installing signal handlers so that a handler
    /// never pays for, or blocks on, the construction.
    pub fn global() -> &'static SymbolIndex {
        GLOBAL.get_or_init(SymbolIndex::build)
    }

    /// The function whose `[begin, end]` range holds `addr`.
    pub fn locate(&self, addr: usize) -> Option<&Function> {
        let last = self.functions.last()?;
        let idx = self.functions.partition_point(|f| f.begin < addr);
        let candidate = if idx == self.functions.len() {
            last
        } else if self.functions[idx].begin > addr {
            self.functions.get(idx.checked_sub(1)?)?
        } else {
            &self.functions[idx]
        };
        candidate.contains(addr).then_some(candidate)
    }

    pub fn name_of(&self, addr: usize) -> Option<&str> {
        self.locate(addr).map(Function::name)
    }

    /// Byte offset of `addr` into its function, 0 when unresolved.
    pub fn offset_of(&self, addr: usize) -> usize {
        self.locate(addr).map_or(0, |f| addr - f.begin)
    }

    pub fn module_for(&self, addr: usize) -> Option<&LoadedModule> {
        self.modules.iter().find(|m| m.contains(addr))
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn modules(&self) -> &[LoadedModule] {
        &self.modules
    }

    /// The mapped executable, if it could be opened.
    pub fn image(&self) -> Option<&ImageReader> {
        self.image.as_ref()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// Collects functions and chooses which sources to read.
pub struct SymbolIndexBuilder {
    self_image: bool,
    loaded_modules: bool,
    functions: Vec<Function>,
}

impl Default for SymbolIndexBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolIndexBuilder {
    pub fn new() -> Self {
        Self {
            self_image: true,
            loaded_modules: true,
            functions: Vec::new(),
        }
    }

    /// Read `.symtab` of the running executable.
    pub fn with_self_image(mut self, enabled: bool) -> Self {
        self.self_image = enabled;
        self
    }

    /// Read the dynamic symbol table of every loaded module. The module map
    /// itself is always recorded.
    pub fn with_loaded_modules(mut self, enabled: bool) -> Self {
        self.loaded_modules = enabled;
        self
    }

    pub fn add_function(&mut self, function: Function) -> &mut Self {
        self.functions.push(function);
        self
    }

    /// Index `sym` at `st_value + bias` if it is a defined function.
    pub fn add_elf_symbol(&mut self, sym: &Sym, strings: StringTable<'_>, bias: usize) {
        let endian = object::NativeEndian;
        if sym.st_type() != object::elf::STT_FUNC || sym.st_shndx(endian) == object::elf::SHN_UNDEF {
            return;
        }
        let value: u64 = sym.st_value(endian).into();
        if value == 0 {
            return;
        }
        let Ok(raw) = strings.get(sym.st_name(endian)) else {
            return;
        };
        let size: u64 = sym.st_size(endian).into();
        self.functions.push(Function {
            name: demangle(raw),
            begin: (value as usize).wrapping_add(bias),
            size: size as usize,
            binding: Binding::of(sym),
        });
    }

    fn add_self_image(&mut self, view: &ElfView<'_>, bias: usize) {
        let strings = view.strings();
        for sym in view.symbols() {
            self.add_elf_symbol(sym, strings, bias);
        }
    }

    fn add_module(&mut self, module: &LoadedModule) {
        let Some(info) = module.dynamic_info() else {
            return;
        };
        let (Some(symtab), Some(strtab)) = (info.symtab, info.strtab) else {
            return;
        };
        if info.syment.map_or(false, |ent| ent != size_of::<Sym>()) {
            warn!("{}: unexpected DT_SYMENT {:?}", module.name(), info.syment);
            return;
        }
        let strings = match info.strsz {
            Some(len) => module.region(strtab, len),
            None => module.tail(strtab),
        };
        let Some(strings) = strings else {
            return;
        };
        let strings = StringTable::new(strings, 0, strings.len() as u64);

        let Some(table) = module.tail(symtab) else {
            return;
        };
        let count = info.symbol_count(module).min(table.len() / size_of::<Sym>());
        let Ok((symbols, _)) = object::pod::slice_from_bytes::<Sym>(table, count) else {
            return;
        };
        let before = self.functions.len();
        for sym in symbols {
            self.add_elf_symbol(sym, strings, module.bias());
        }
        debug!(
            "{}: {} dynamic functions",
            module.name(),
            self.functions.len() - before
        );
    }

    pub fn build(mut self) -> SymbolIndex {
        let modules = loaded_modules();
        if self.loaded_modules {
            for module in &modules {
                self.add_module(module);
            }
        }

        let image = if self.self_image {
            match ImageReader::open_self() {
                Ok(image) => Some(image),
                Err(err) => {
                    warn!("self image unavailable: {err}");
                    None
                }
            }
        } else {
            None
        };
        if let Some(image) = &image {
            let bias = modules.first().map_or(0, LoadedModule::bias);
            match image.parse() {
                Ok(view) => self.add_self_image(&view, bias),
                Err(err) => warn!("cannot parse {}: {err}", image.path().display()),
            }
        }

        let mut index = self.finish();
        index.modules = modules;
        index.image = image;
        index
    }

    /// Sort and drop duplicate start addresses without touching the process.
    pub fn finish(mut self) -> SymbolIndex {
        // Same start: a sized symbol, then the public alias (strongest
        // binding, fewest leading underscores), then the larger extent, then
        // the smaller name. The outcome does not depend on insertion order.
        self.functions.sort_unstable_by(|a, b| {
            a.begin
                .cmp(&b.begin)
                .then((a.size == 0).cmp(&(b.size == 0)))
                .then(a.binding.cmp(&b.binding))
                .then_with(|| a.leading_underscores().cmp(&b.leading_underscores()))
                .then(b.size.cmp(&a.size))
                .then_with(|| a.name.cmp(&b.name))
        });
        self.functions.dedup_by(|later, kept| later.begin == kept.begin);
        debug!("indexed {} functions", self.functions.len());
        SymbolIndex {
            functions: self.functions,
            modules: Vec::new(),
            image: None,
        }
    }
}

impl FromIterator<Function> for SymbolIndex {
    fn from_iter<I: IntoIterator<Item = Function>>(iter: I) -> Self {
        let mut builder = SymbolIndexBuilder::new();
        builder.functions.extend(iter);
        builder.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Function> {
        vec![
            Function::new("alpha", 0x1000, 0x40),
            Function::new("beta", 0x1040, 0x20),
            Function::new("gamma", 0x1100, 0x10),
            Function::new("delta", 0x2000, 0x80),
        ]
    }

    #[test]
    fn points_inside_functions_resolve() {
        let index: SymbolIndex = sample().into_iter().collect();
        for f in sample() {
            for addr in [f.begin(), f.begin() + 1, f.end() - 1] {
                assert_eq!(index.name_of(addr), Some(f.name()), "{addr:#x}");
            }
        }
        assert_eq!(index.offset_of(0x1048), 8);
    }

    #[test]
    fn gaps_and_outskirts_resolve_to_nothing() {
        let index: SymbolIndex = sample().into_iter().collect();
        for addr in [0, 0xfff, 0x1061, 0x10ff, 0x1111, 0x1fff, 0x2081, usize::MAX] {
            assert!(index.locate(addr).is_none(), "{addr:#x}");
            assert_eq!(index.offset_of(addr), 0);
        }
    }

    #[test]
    fn end_is_inclusive_unless_next_starts_there() {
        let index: SymbolIndex = sample().into_iter().collect();
        // gamma ends at 0x1110 with nothing after it
        assert_eq!(index.name_of(0x1110), Some("gamma"));
        // alpha's end is beta's start
        assert_eq!(index.name_of(0x1040), Some("beta"));
        // the last entry
        assert_eq!(index.name_of(0x2080), Some("delta"));
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let mut functions = sample();
        functions.push(Function::new("alias_of_alpha", 0x1000, 0x40));
        functions.push(Function::new("zero_sized", 0x1000, 0));
        let addrs: Vec<usize> = (0xff0..0x2090).step_by(3).collect();

        let reference: SymbolIndex = functions.clone().into_iter().collect();
        let expected: Vec<_> = addrs.iter().map(|&a| reference.locate(a).cloned()).collect();
        for rotation in 0..functions.len() {
            let mut order = functions.clone();
            order.rotate_left(rotation);
            if rotation % 2 == 1 {
                order.reverse();
            }
            let index: SymbolIndex = order.into_iter().collect();
            let got: Vec<_> = addrs.iter().map(|&a| index.locate(a).cloned()).collect();
            assert_eq!(got, expected);
        }
        assert_eq!(reference.name_of(0x1000), Some("alias_of_alpha"));
        assert_eq!(reference.len(), 4);
    }

    #[test]
    fn public_aliases_win() {
        let functions = vec![
            Function::new("__libc_malloc", 0x3000, 0x80),
            Function::new("malloc", 0x3000, 0x80),
            Function::new("gsignal", 0x4000, 0x40).with_binding(Binding::Weak),
            Function::new("raise", 0x4000, 0x40),
            Function::new("helper", 0x5000, 0x40).with_binding(Binding::Local),
            Function::new("_start_helper", 0x5000, 0x20).with_binding(Binding::Weak),
            Function::new("entry", 0x6000, 0),
            Function::new("_entry_local", 0x6000, 0x10).with_binding(Binding::Local),
        ];
        for rotation in 0..functions.len() {
            let mut order = functions.clone();
            order.rotate_left(rotation);
            let index: SymbolIndex = order.into_iter().collect();
            assert_eq!(index.name_of(0x3010), Some("malloc"));
            assert_eq!(index.name_of(0x4000), Some("raise"));
            assert_eq!(index.name_of(0x5000), Some("_start_helper"));
            assert_eq!(index.name_of(0x6008), Some("_entry_local"));
            assert_eq!(index.len(), 4);
        }
    }

    #[test]
    fn empty_index() {
        let index: SymbolIndex = Vec::new().into_iter().collect();
        assert!(index.is_empty());
        assert!(index.locate(0x1000).is_none());
    }

    #[inline(never)]
    fn indexed_by_self_image() -> usize {
        std::hint::black_box(7)
    }

    #[test]
    fn process_index_finds_own_code() {
        let index = SymbolIndex::global();
        let addr = indexed_by_self_image as *const () as usize;
        let f = index.locate(addr).expect("own function");
        assert!(f.name().ends_with("indexed_by_self_image"), "{}", f.name());
        assert_eq!(index.offset_of(addr), 0);
        assert!(index.image().is_some());
        assert!(index.module_for(addr).is_some());
    }

    #[test]
    fn dynamic_symbols_of_libc_are_indexed() {
        let index = SymbolIndex::builder().with_self_image(false).build();
        assert!(index.image().is_none());
        assert!(index.functions().iter().any(|f| f.name() == "malloc"));
    }
}
