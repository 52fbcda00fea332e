use std::collections::HashMap;

use parking_lot::Mutex;

use super::SymbolCache;
use super::demangle;
use crate::callstack::CallStack;
use crate::guard::InternalScope;

/// Functions whose allocations are never tracked, wherever they are called from.
///
/// A call stack is ignored when any of its frames, including frames inlined into it, resolves
/// to one of the listed functions. Verdicts are cached per program counter.
#[derive(Debug, Default)]
pub struct IgnoreList {
    functions: Vec<String>,
    verdicts: Mutex<HashMap<usize, bool>>,
}

impl IgnoreList {
    pub fn new(functions: Vec<String>) -> Self {
        Self {
            functions,
            verdicts: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn functions(&self) -> &[String] {
        &self.functions
    }

    /// Returns whether `call_stack` passes through an ignored function.
    pub fn matches(&self, call_stack: &CallStack, symbols: &SymbolCache) -> bool {
        if self.functions.is_empty() {
            return false;
        }
        call_stack
            .frames()
            .iter()
            .any(|&pc| self.frame_matches(pc, symbols))
    }

    fn frame_matches(&self, pc: usize, symbols: &SymbolCache) -> bool {
        if let Some(verdict) = self.verdicts.lock().get(&pc).copied() {
            return verdict;
        }

        let frame = symbols.resolve(pc);
        let verdict = frame
            .symbols
            .iter()
            .filter_map(|symbol| symbol.name.as_deref())
            .any(|name| {
                self.functions
                    .iter()
                    .any(|function| demangle::function_matches(name, function))
            });
        let mut verdicts = self.verdicts.lock();
        let _scope = InternalScope::enter();
        verdicts.insert(pc, verdict);
        verdict
    }

    /// Forgets the cached verdicts.
    pub fn clear(&self) {
        let verdicts = std::mem::take(&mut *self.verdicts.lock());
        drop(verdicts);
    }
}

#[cfg(test)]
mod test {

    use super::*;
    use crate::symbols::test::FakeSymbolizer;

    #[test]
    fn test_should_match_ignored_function_anywhere_in_stack() {
        let symbols = SymbolCache::new(Box::new(FakeSymbolizer::new(&[
            (0x10, "demo::alloc_string"),
            (0x20, "demo::get_os_version"),
            (0x30, "demo::main"),
        ])));
        let ignore = IgnoreList::new(vec!["get_os_version".to_string()]);

        assert!(ignore.matches(&CallStack::new(&[0x10, 0x20, 0x30]), &symbols));
        assert!(!ignore.matches(&CallStack::new(&[0x10, 0x30]), &symbols));
        // unresolvable frames never match
        assert!(!ignore.matches(&CallStack::new(&[0x999]), &symbols));
    }

    #[test]
    fn test_should_match_inlined_symbols() {
        let symbols = SymbolCache::new(Box::new(FakeSymbolizer::with_inlined(
            0x10,
            &["demo::abcdefg", "demo::caller"],
        )));
        let ignore = IgnoreList::new(vec!["abcdefg".to_string()]);
        assert!(ignore.matches(&CallStack::new(&[0x10]), &symbols));
    }

    #[test]
    fn test_should_never_match_when_empty() {
        let symbols = SymbolCache::new(Box::new(FakeSymbolizer::new(&[(0x10, "demo::x")])));
        let ignore = IgnoreList::default();
        assert!(ignore.is_empty());
        assert!(!ignore.matches(&CallStack::new(&[0x10]), &symbols));
    }
}
