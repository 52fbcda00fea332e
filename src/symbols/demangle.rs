use std::path::Path;

use backtrace::SymbolName;

/// Source files whose frames are allocation plumbing rather than the allocating code.
const INTERNAL_FILES: &[&str] = &[
    // the allocation shims of the standard library
    "/library/alloc/src/",
    "/library/std/src/alloc.rs",
    "/library/std/src/sys/alloc/",
    "/library/core/src/alloc/",
    // the stack walker
    "/backtrace-0.",
    // this crate
    concat!(env!("CARGO_MANIFEST_DIR"), "/src/"),
];

/// Allocator shims the compiler emits between `alloc::alloc` and the global allocator. They
/// have no source file.
const INTERNAL_FUNCTIONS: &[&str] = &[
    "__rust_alloc",
    "__rust_alloc_zeroed",
    "__rust_realloc",
    "__rust_dealloc",
    "__rg_alloc",
    "__rg_alloc_zeroed",
    "__rg_realloc",
    "__rg_dealloc",
    "__rdl_alloc",
    "__rdl_alloc_zeroed",
    "__rdl_realloc",
    "__rdl_dealloc",
];

/// Placeholder printed for frames without a function name.
pub const UNAVAILABLE_FUNCTION: &str = "(Function name unavailable)";

/// Renders a symbol name demangled and without its trailing hash.
pub fn display_name(name: &SymbolName<'_>) -> String {
    format!("{name:#}")
}

/// Removes a trailing `::h0123456789abcdef` hash segment from a demangled name.
pub fn strip_hash(name: &str) -> &str {
    match name.rsplit_once("::") {
        Some((path, last))
            if last.len() == 17
                && last.starts_with('h')
                && last[1..].bytes().all(|b| b.is_ascii_hexdigit()) =>
        {
            path
        }
        _ => name,
    }
}

/// Returns whether the function `name` is the one named by `pattern`.
///
/// The pattern matches the full path (`my_crate::io::read_all`) or any trailing part of it
/// (`read_all`, `io::read_all`).
pub fn function_matches(name: &str, pattern: &str) -> bool {
    let name = strip_hash(name);
    if pattern.is_empty() {
        return false;
    }
    name == pattern
        || name
            .strip_suffix(pattern)
            .is_some_and(|prefix| prefix.ends_with("::"))
}

/// Returns whether frames located in `file` are internal to the heap or to leakwatch.
pub fn is_internal_file(file: &Path) -> bool {
    let file = file.to_string_lossy().replace('\\', "/");
    INTERNAL_FILES.iter().any(|internal| file.contains(internal))
}

/// Returns whether the function `name` is an allocator shim.
pub fn is_internal_function(name: &str) -> bool {
    let name = strip_hash(name);
    let last = name.rsplit_once("::").map_or(name, |(_, last)| last);
    INTERNAL_FUNCTIONS.contains(&last)
}
