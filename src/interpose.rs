//! Import patching: redirecting a module's calls to an imported function to a replacement.
//!
//! A patch table is a list of [`ImportPatch`] entries. [`patch_module`] rewrites every import
//! slot of the target module bound to each entry's symbol so that it points to the replacement;
//! [`restore_module`] writes the real address back. All binary-format work lives in the
//! platform patcher; this module only sees the entries.

pub mod crt;
#[cfg(all(target_os = "linux", target_pointer_width = "64"))]
mod elf;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Error, Result};

/// One redirection: calls from the patched module to `symbol`, exported by `export_module`, go
/// to `replacement` instead.
#[derive(Debug, Clone, Copy)]
pub struct ImportPatch {
    /// File name of the exporting module, e.g. `libc.so.6`.
    pub export_module: &'static str,
    pub symbol: &'static str,
    /// Address of the replacement function.
    pub replacement: usize,
    /// Receives the real address of the symbol when the patch is applied.
    pub original: Option<&'static AtomicUsize>,
}

impl ImportPatch {
    pub fn new(export_module: &'static str, symbol: &'static str, replacement: usize) -> Self {
        Self {
            export_module,
            symbol,
            replacement,
            original: None,
        }
    }

    /// Records the real address of the symbol in `slot` when the patch is applied, so the
    /// replacement can call through to it.
    pub fn with_original(mut self, slot: &'static AtomicUsize) -> Self {
        self.original = Some(slot);
        self
    }

    fn store_original(&self, address: usize) {
        if let Some(slot) = self.original {
            slot.store(address, Ordering::Release);
        }
    }
}

/// The module whose imports are patched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Module {
    /// The main executable.
    Main,
    /// A loaded shared object, matched by file name (or full path).
    Named(String),
}

impl Module {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Main => write!(f, "<main executable>"),
            Self::Named(name) => write!(f, "{name}"),
        }
    }
}

/// Result of applying or restoring a patch table.
#[derive(Debug, Default)]
pub struct PatchOutcome {
    /// Entries successfully applied.
    pub applied: usize,
    pub failures: Vec<Error>,
}

impl PatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Redirects the import slots of `module` as described by `table`.
///
/// Each entry is applied independently: a failing entry is logged and recorded in
/// [`PatchOutcome::failures`], and the remaining entries are still applied.
pub fn patch_module(module: &Module, table: &[ImportPatch]) -> PatchOutcome {
    apply_table(module, table, Direction::Patch)
}

/// Writes the real addresses back into the slots redirected by [`patch_module`].
pub fn restore_module(module: &Module, table: &[ImportPatch]) -> PatchOutcome {
    apply_table(module, table, Direction::Restore)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Patch,
    Restore,
}

fn apply_table(module: &Module, table: &[ImportPatch], direction: Direction) -> PatchOutcome {
    let mut outcome = PatchOutcome::default();
    for entry in table {
        match apply_entry(module, entry, direction) {
            Ok(slots) => {
                tracing::debug!(
                    %module,
                    symbol = entry.symbol,
                    slots,
                    ?direction,
                    "import slots rewritten"
                );
                outcome.applied += 1;
            }
            Err(err) => {
                tracing::error!(%module, symbol = entry.symbol, ?direction, %err, "import patch failed");
                outcome.failures.push(err);
            }
        }
    }
    outcome
}

#[cfg(all(target_os = "linux", target_pointer_width = "64"))]
fn apply_entry(module: &Module, entry: &ImportPatch, direction: Direction) -> Result<usize> {
    let real = elf::export_address(entry.export_module, entry.symbol)?;
    let image = elf::Image::find(module)?;
    let (from, to) = match direction {
        Direction::Patch => {
            entry.store_original(real);
            (real, entry.replacement)
        }
        Direction::Restore => (entry.replacement, real),
    };
    let rewritten = image.rewrite_slots(entry.symbol, from, to)?;
    if rewritten == 0 {
        return Err(Error::ImportNotFound {
            module: module.to_string(),
            symbol: entry.symbol.to_string(),
        });
    }
    Ok(rewritten)
}

#[cfg(not(all(target_os = "linux", target_pointer_width = "64")))]
fn apply_entry(_module: &Module, _entry: &ImportPatch, _direction: Direction) -> Result<usize> {
    Err(Error::Unsupported("import patching"))
}

#[cfg(test)]
mod test {

    use super::*;

    static ORIGINAL: AtomicUsize = AtomicUsize::new(0);

    #[test]
    fn test_should_build_patch_entry() {
        let entry = ImportPatch::new("libc.so.6", "malloc", 0x1234).with_original(&ORIGINAL);
        assert_eq!(entry.export_module, "libc.so.6");
        assert_eq!(entry.symbol, "malloc");
        assert_eq!(entry.replacement, 0x1234);
        entry.store_original(0x5678);
        assert_eq!(ORIGINAL.load(Ordering::Acquire), 0x5678);
    }

    #[test]
    fn test_should_display_module() {
        assert_eq!(Module::Main.to_string(), "<main executable>");
        assert_eq!(Module::named("libfoo.so").to_string(), "libfoo.so");
    }

    #[test]
    fn test_should_report_every_failed_entry() {
        let table = [
            ImportPatch::new("libleakwatch-missing.so.1", "malloc", 0x10),
            ImportPatch::new("libleakwatch-missing.so.2", "free", 0x20),
        ];
        let outcome = patch_module(&Module::Main, &table);
        assert_eq!(outcome.applied, 0);
        assert_eq!(outcome.failures.len(), 2);
        assert!(!outcome.is_complete());
    }
}
