//! The allocation hook mechanism shared by every instrumented heap.
//!
//! A heap raises a [`HookEvent`] for every allocation, free and reallocation and hands it to the
//! [`AllocHook`] currently installed on it. Hooks are installed with
//! [`TrackedHeap::set_alloc_hook`], which returns the previously installed hook so that the new
//! one can chain to it.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide allocation sequence number.
///
/// Every heap draws from the same counter, so a request id is unique for the whole process
/// lifetime and never reused after a free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

static NEXT_REQUEST: AtomicU64 = AtomicU64::new(1);

impl RequestId {
    /// Draws the next request id.
    #[inline]
    pub fn next() -> Self {
        Self(NEXT_REQUEST.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a block is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockUse {
    /// A block requested by the host program.
    Normal,
    /// Storage owned by the leak detector. None of it outlives the detector.
    Internal,
    /// A block requested while tracking was off on the allocating thread: inside the tracking
    /// logic or inside [`crate::untracked`].
    Ignored,
}

/// The kind of heap operation being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Alloc,
    Free,
    /// The block identified by `previous` was replaced by the event's block.
    Realloc { previous: RequestId },
}

/// One intercepted heap operation.
#[derive(Debug, Clone, Copy)]
pub struct HookEvent {
    pub kind: HookKind,
    /// Request id of the affected block (the new block for a realloc).
    pub request: RequestId,
    /// User data of the affected block.
    pub data: *const u8,
    /// Size of the user data, in bytes.
    pub size: usize,
    pub block_use: BlockUse,
}

/// Receives heap events.
pub trait AllocHook: Send + Sync {
    /// Handles one event.
    ///
    /// Returning `false` for an [`HookKind::Alloc`] or [`HookKind::Realloc`] event denies the
    /// request. The return value is ignored for frees.
    fn on_event(&self, event: &HookEvent) -> bool;
}

/// A block the heap still considers outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub request: RequestId,
    pub address: usize,
    pub size: usize,
    pub block_use: BlockUse,
}

/// A heap exposing a hook slot and an enumerable live-block list.
pub trait TrackedHeap: Send + Sync {
    /// Installs `hook`, returning the hook that was installed before.
    fn set_alloc_hook(&self, hook: Option<Arc<dyn AllocHook>>) -> Option<Arc<dyn AllocHook>>;

    /// Snapshots the live blocks, most recently allocated first.
    fn live_blocks(&self) -> Vec<BlockInfo>;
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_should_draw_increasing_request_ids() {
        let first = RequestId::next();
        let second = RequestId::next();
        assert!(second > first);
        assert_eq!(RequestId::from(42).get(), 42);
        assert_eq!(RequestId::from(7).to_string(), "7");
    }
}
