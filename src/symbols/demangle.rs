//! Display names for raw linker symbols.
//!
//! Rust symbols (legacy `_ZN..E` and v0 `_R`) go through `rustc_demangle` and
//! are printed without the trailing hash. Itanium C++ symbols go through
//! `cpp_demangle`. Anything that fails to demangle is kept as is.

/// Turn a raw symbol name into its display form. Never fails.
pub fn demangle(raw: &[u8]) -> String {
    if let Ok(s) = core::str::from_utf8(raw) {
        if let Ok(d) = rustc_demangle::try_demangle(s) {
            return format!("{d:#}");
        }
    }
    if raw.starts_with(b"_Z") {
        if let Ok(symbol) = cpp_demangle::Symbol::new(raw) {
            if let Ok(d) = symbol.demangle(&cpp_demangle::DemangleOptions::default()) {
                return d;
            }
        }
    }
    String::from_utf8_lossy(raw).into_owned()
}
