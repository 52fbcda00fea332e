//! Symbol resolution: turning captured program counters into function names and source
//! locations.

pub mod demangle;
mod ignore;
mod search_path;

use std::collections::HashMap;
use std::ffi::c_void;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

pub use self::ignore::IgnoreList;
pub use self::search_path::{SYMBOL_PATH_VAR, SymbolSearchPath};
use crate::error::{Error, Result};
use crate::guard::InternalScope;

/// One symbol found at an address. Inlined calls yield several symbols for the same address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSymbol {
    /// Demangled function name, without its hash.
    pub name: Option<String>,
    pub file: Option<PathBuf>,
    pub line: Option<u32>,
}

/// Everything the symbol handler knows about one program counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFrame {
    pub address: usize,
    /// Innermost inlined symbol first.
    pub symbols: Vec<FrameSymbol>,
}

impl ResolvedFrame {
    pub fn unresolved(address: usize) -> Self {
        Self {
            address,
            symbols: Vec::new(),
        }
    }

    /// Whether at least one symbol at this address carries a function name.
    pub fn has_function_name(&self) -> bool {
        self.symbols.iter().any(|symbol| symbol.name.is_some())
    }
}

/// A platform symbol-handling service.
pub trait Symbolizer: Send + Sync {
    /// Prepares the service and checks that it can resolve symbols.
    ///
    /// `search_path` lists where the debug information is expected. A service which locates the
    /// debug information on its own only uses it in its diagnostics.
    fn initialize(&self, search_path: &SymbolSearchPath) -> Result<()>;

    /// Resolves the return address `pc`.
    fn resolve(&self, pc: usize) -> ResolvedFrame;
}

/// [`Symbolizer`] reading the debug information of the loaded images through [`backtrace`].
///
/// [`backtrace`] finds the debug information of each image itself: in the image, next to it, or
/// in the system debug directories through build ids and debug links. The search path is only
/// logged and quoted in the initialization error.
#[derive(Debug, Default, Clone, Copy)]
pub struct BacktraceSymbolizer;

#[inline(never)]
fn resolvable_marker() -> usize {
    std::hint::black_box(0)
}

impl Symbolizer for BacktraceSymbolizer {
    fn initialize(&self, search_path: &SymbolSearchPath) -> Result<()> {
        tracing::debug!(%search_path, "initializing symbol handler");
        // resolution looks up the byte before a return address
        let marker = (resolvable_marker as fn() -> usize) as usize + 1;
        if self.resolve(marker).has_function_name() {
            Ok(())
        } else {
            Err(Error::SymbolsUnavailable(format!(
                "no debug information found (search path: {search_path})"
            )))
        }
    }

    fn resolve(&self, pc: usize) -> ResolvedFrame {
        let mut frame = ResolvedFrame::unresolved(pc);
        backtrace::resolve(pc as *mut c_void, |symbol| {
            frame.symbols.push(FrameSymbol {
                name: symbol.name().map(|name| demangle::display_name(&name)),
                file: symbol.filename().map(PathBuf::from),
                line: symbol.lineno(),
            });
        });
        frame
    }
}

/// Memoizes [`Symbolizer::resolve`] by program counter.
pub struct SymbolCache {
    symbolizer: Box<dyn Symbolizer>,
    frames: Mutex<HashMap<usize, Arc<ResolvedFrame>>>,
}

impl SymbolCache {
    pub fn new(symbolizer: Box<dyn Symbolizer>) -> Self {
        Self {
            symbolizer,
            frames: Mutex::new(HashMap::new()),
        }
    }

    pub fn initialize(&self, search_path: &SymbolSearchPath) -> Result<()> {
        self.symbolizer.initialize(search_path)
    }

    pub fn resolve(&self, pc: usize) -> Arc<ResolvedFrame> {
        if let Some(frame) = self.frames.lock().get(&pc) {
            return frame.clone();
        }
        // resolved without the lock held: the symbolizer may take its own locks
        let resolved = self.symbolizer.resolve(pc);
        let mut frames = self.frames.lock();
        let _scope = InternalScope::enter();
        frames.entry(pc).or_insert_with(|| Arc::new(resolved)).clone()
    }

    /// Drops every cached frame and releases the cache's storage.
    pub fn clear(&self) {
        let frames = std::mem::take(&mut *self.frames.lock());
        drop(frames);
    }

    /// Number of distinct program counters resolved so far.
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
pub(crate) mod test {

    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    pub(crate) fn symbol(name: Option<&str>, file: Option<&str>, line: u32) -> FrameSymbol {
        FrameSymbol {
            name: name.map(str::to_string),
            file: file.map(PathBuf::from),
            line: file.map(|_| line),
        }
    }

    /// Resolves from a fixed table; anything else is unresolved.
    #[derive(Default)]
    pub(crate) struct FakeSymbolizer {
        frames: HashMap<usize, Vec<FrameSymbol>>,
        resolved: Arc<AtomicUsize>,
        unavailable: bool,
    }

    impl FakeSymbolizer {
        /// One named function per address, all in the same application source file.
        pub(crate) fn new(functions: &[(usize, &str)]) -> Self {
            functions
                .iter()
                .enumerate()
                .fold(Self::default(), |fake, (index, (pc, name))| {
                    fake.with(
                        *pc,
                        vec![symbol(
                            Some(*name),
                            Some("/home/u/app/src/main.rs"),
                            10 + index as u32,
                        )],
                    )
                })
        }

        pub(crate) fn with_inlined(pc: usize, names: &[&str]) -> Self {
            Self::default().with(
                pc,
                names
                    .iter()
                    .map(|name| symbol(Some(*name), None, 0))
                    .collect(),
            )
        }

        pub(crate) fn with(mut self, pc: usize, symbols: Vec<FrameSymbol>) -> Self {
            self.frames.insert(pc, symbols);
            self
        }

        pub(crate) fn unavailable(mut self) -> Self {
            self.unavailable = true;
            self
        }

        pub(crate) fn counter(&self) -> Arc<AtomicUsize> {
            self.resolved.clone()
        }
    }

    impl Symbolizer for FakeSymbolizer {
        fn initialize(&self, search_path: &SymbolSearchPath) -> Result<()> {
            if self.unavailable {
                Err(Error::SymbolsUnavailable(search_path.to_string()))
            } else {
                Ok(())
            }
        }

        fn resolve(&self, pc: usize) -> ResolvedFrame {
            self.resolved.fetch_add(1, Ordering::Relaxed);
            ResolvedFrame {
                address: pc,
                symbols: self.frames.get(&pc).cloned().unwrap_or_default(),
            }
        }
    }

    #[inline(never)]
    fn resolve_me() -> usize {
        std::hint::black_box(42)
    }

    #[test]
    fn test_should_initialize_without_searching_the_path() {
        let search_path = SymbolSearchPath::from_parts(None, Some("/nonexistent/leakwatch".into()));
        assert!(BacktraceSymbolizer.initialize(&search_path).is_ok());
        assert!(BacktraceSymbolizer.initialize(&SymbolSearchPath::default()).is_ok());
    }

    #[test]
    fn test_should_resolve_own_function() {
        let symbolizer = BacktraceSymbolizer;
        assert!(symbolizer.initialize(&SymbolSearchPath::build()).is_ok());

        let frame = symbolizer.resolve((resolve_me as fn() -> usize) as usize + 1);
        assert!(frame.has_function_name());
        let symbol = &frame.symbols[0];
        assert!(
            symbol
                .name
                .as_deref()
                .is_some_and(|name| name.ends_with("symbols::test::resolve_me")),
            "{symbol:?}"
        );
        assert!(
            symbol
                .file
                .as_deref()
                .is_some_and(|file| file.ends_with(Path::new("src/symbols.rs")))
        );
    }

    #[test]
    fn test_should_not_resolve_garbage() {
        let frame = BacktraceSymbolizer.resolve(0x10);
        assert!(!frame.has_function_name());
        assert_eq!(frame.address, 0x10);
    }

    #[test]
    fn test_should_cache_resolved_frames() {
        let fake = FakeSymbolizer::new(&[(0x10, "demo::main")]);
        let resolved = fake.counter();
        let cache = SymbolCache::new(Box::new(fake));

        let first = cache.resolve(0x10);
        let second = cache.resolve(0x10);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(resolved.load(Ordering::Relaxed), 1);
        assert_eq!(first.symbols[0].name.as_deref(), Some("demo::main"));
        assert_eq!(first.symbols[0].line, Some(10));

        assert!(!cache.resolve(0x20).has_function_name());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_should_report_unavailable_symbols() {
        let cache = SymbolCache::new(Box::new(FakeSymbolizer::default().unavailable()));
        assert!(matches!(
            cache.initialize(&SymbolSearchPath::default()),
            Err(Error::SymbolsUnavailable(_))
        ));
    }
}
