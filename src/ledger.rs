use std::cell::RefCell;
use std::collections::HashMap;

use parking_lot::ReentrantMutex;

use crate::callstack::CallStack;
use crate::guard::InternalScope;
use crate::hook::RequestId;

/// What the ledger knows about one outstanding allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub call_stack: CallStack,
    /// Requested size of the block, in bytes.
    pub size: usize,
    reported: bool,
}

impl LedgerEntry {
    pub fn new(call_stack: CallStack, size: usize) -> Self {
        Self {
            call_stack,
            size,
            reported: false,
        }
    }

    /// Whether the entry was marked as already reported.
    pub fn is_reported(&self) -> bool {
        self.reported
    }
}

/// Maps each outstanding allocation's [`RequestId`] to the call stack that allocated it.
///
/// The map is guarded by a reentrant mutex: a thread growing the map may allocate while holding
/// the lock. Entries removed from the map are dropped after the lock is released.
#[derive(Default)]
pub struct Ledger {
    entries: ReentrantMutex<RefCell<HashMap<RequestId, LedgerEntry>>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites the entry for `request`.
    pub fn record(&self, request: RequestId, entry: LedgerEntry) {
        let previous = {
            let entries = self.entries.lock();
            let _scope = InternalScope::enter();
            entries.borrow_mut().insert(request, entry)
        };
        drop(previous);
    }

    /// Removes the entry for `request`; returns whether there was one.
    pub fn release(&self, request: RequestId) -> bool {
        let removed = {
            let entries = self.entries.lock();
            entries.borrow_mut().remove(&request)
        };
        removed.is_some()
    }

    /// Moves the liability of `previous` to `request` in a single critical section.
    pub fn replace(&self, previous: RequestId, request: RequestId, entry: LedgerEntry) {
        let (removed, overwritten) = {
            let entries = self.entries.lock();
            let mut entries = entries.borrow_mut();
            let _scope = InternalScope::enter();
            (entries.remove(&previous), entries.insert(request, entry))
        };
        drop((removed, overwritten));
    }

    /// Returns the call stack recorded for `request`.
    pub fn lookup(&self, request: RequestId) -> Option<CallStack> {
        self.get(request).map(|entry| entry.call_stack)
    }

    pub fn get(&self, request: RequestId) -> Option<LedgerEntry> {
        let entries = self.entries.lock();
        let entry = entries.borrow().get(&request).cloned();
        entry
    }

    pub fn contains(&self, request: RequestId) -> bool {
        self.entries.lock().borrow().contains_key(&request)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries not yet marked as reported.
    pub fn unreported(&self) -> usize {
        self.entries
            .lock()
            .borrow()
            .values()
            .filter(|entry| !entry.reported)
            .count()
    }

    /// Marks every current entry as reported; later reports only show newer allocations.
    pub fn mark_all_reported(&self) {
        let entries = self.entries.lock();
        for entry in entries.borrow_mut().values_mut() {
            entry.reported = true;
        }
    }

    /// Snapshots all entries, ordered by request id.
    pub fn entries(&self) -> Vec<(RequestId, LedgerEntry)> {
        let mut snapshot: Vec<_> = {
            let entries = self.entries.lock();
            let entries = entries.borrow();
            entries
                .iter()
                .map(|(request, entry)| (*request, entry.clone()))
                .collect()
        };
        snapshot.sort_by_key(|(request, _)| *request);
        snapshot
    }

    /// Drops every entry and releases the map's storage.
    pub fn clear(&self) {
        let drained = {
            let entries = self.entries.lock();
            std::mem::take(&mut *entries.borrow_mut())
        };
        drop(drained);
    }
}

#[cfg(test)]
mod test {

    use std::sync::Arc;

    use super::*;

    fn entry(frames: &[usize], size: usize) -> LedgerEntry {
        LedgerEntry::new(CallStack::new(frames), size)
    }

    #[test]
    fn test_should_record_and_release() {
        let ledger = Ledger::new();
        ledger.record(1.into(), entry(&[0x10, 0x20], 40));
        ledger.record(2.into(), entry(&[0x30], 8));
        assert_eq!(ledger.len(), 2);
        assert_eq!(
            ledger.lookup(1.into()).expect("recorded").frames(),
            &[0x10, 0x20]
        );

        assert!(ledger.release(1.into()));
        assert!(ledger.lookup(1.into()).is_none());
        // releasing twice is a no-op
        assert!(!ledger.release(1.into()));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_should_overwrite_existing_entry() {
        let ledger = Ledger::new();
        ledger.record(1.into(), entry(&[0x10], 4));
        ledger.record(1.into(), entry(&[0x20], 8));
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.get(1.into()).expect("recorded").size, 8);
    }

    #[test]
    fn test_should_move_liability_on_replace() {
        let ledger = Ledger::new();
        ledger.record(1.into(), entry(&[0x10], 4));
        ledger.replace(1.into(), 2.into(), entry(&[0x20], 16));
        assert!(!ledger.contains(1.into()));
        assert_eq!(ledger.get(2.into()).expect("moved").size, 16);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_should_mark_all_reported() {
        let ledger = Ledger::new();
        ledger.record(1.into(), entry(&[0x10], 4));
        ledger.record(2.into(), entry(&[0x10], 4));
        assert_eq!(ledger.unreported(), 2);

        ledger.mark_all_reported();
        assert_eq!(ledger.unreported(), 0);
        assert!(ledger.get(1.into()).expect("recorded").is_reported());

        ledger.record(3.into(), entry(&[0x10], 4));
        assert_eq!(ledger.unreported(), 1);
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn test_should_snapshot_in_request_order() {
        let ledger = Ledger::new();
        for request in [5u64, 1, 3] {
            ledger.record(request.into(), entry(&[], 1));
        }
        let requests: Vec<_> = ledger.entries().iter().map(|(r, _)| r.get()).collect();
        assert_eq!(requests, vec![1, 3, 5]);

        ledger.clear();
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_should_support_concurrent_writers() {
        let ledger = Arc::new(Ledger::new());
        let workers: Vec<_> = (0..8u64)
            .map(|worker| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    for n in 0..1000u64 {
                        let request = RequestId::from(worker * 1000 + n);
                        ledger.record(request, entry(&[n as usize], 1));
                        if n % 2 == 0 {
                            ledger.release(request);
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker panicked");
        }
        assert_eq!(ledger.len(), 8 * 500);
    }
}
