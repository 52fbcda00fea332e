//! Instrumented replacements for the C allocator.
//!
//! Once the table returned by [`patch_table`] is applied to a module, that module's calls to
//! `malloc`, `calloc`, `realloc` and `free` go to the `leakwatch_*` wrappers. Each wrapper calls
//! the real function and then raises a [`HookEvent`] through the process-wide [`ForeignHeap`],
//! which is the heap the detector attaches to for patched modules.

use std::collections::BTreeMap;
use std::ffi::c_void;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::ImportPatch;
use crate::guard::{ReentrancyGuard, Suppression};
use crate::hook::{AllocHook, BlockInfo, BlockUse, HookEvent, HookKind, RequestId, TrackedHeap};

/// Exporting module of the C allocator.
pub const LIBC: &str = "libc.so.6";

static MALLOC: AtomicUsize = AtomicUsize::new(0);
static CALLOC: AtomicUsize = AtomicUsize::new(0);
static REALLOC: AtomicUsize = AtomicUsize::new(0);
static FREE: AtomicUsize = AtomicUsize::new(0);

static FOREIGN_HEAP: ForeignHeap = ForeignHeap::new();

type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);

/// The patch table redirecting the C allocator of a module to the wrappers of this module.
pub fn patch_table() -> Vec<ImportPatch> {
    vec![
        ImportPatch::new(LIBC, "malloc", leakwatch_malloc as MallocFn as usize)
            .with_original(&MALLOC),
        ImportPatch::new(LIBC, "calloc", leakwatch_calloc as CallocFn as usize)
            .with_original(&CALLOC),
        ImportPatch::new(LIBC, "realloc", leakwatch_realloc as ReallocFn as usize)
            .with_original(&REALLOC),
        ImportPatch::new(LIBC, "free", leakwatch_free as FreeFn as usize).with_original(&FREE),
    ]
}

// The real functions, as recorded when the table was applied. Before that the wrappers call
// the C allocator this crate was linked against.

fn original_malloc() -> MallocFn {
    match MALLOC.load(Ordering::Acquire) {
        0 => libc::malloc,
        address => unsafe { std::mem::transmute::<usize, MallocFn>(address) },
    }
}

fn original_calloc() -> CallocFn {
    match CALLOC.load(Ordering::Acquire) {
        0 => libc::calloc,
        address => unsafe { std::mem::transmute::<usize, CallocFn>(address) },
    }
}

fn original_realloc() -> ReallocFn {
    match REALLOC.load(Ordering::Acquire) {
        0 => libc::realloc,
        address => unsafe { std::mem::transmute::<usize, ReallocFn>(address) },
    }
}

fn original_free() -> FreeFn {
    match FREE.load(Ordering::Acquire) {
        0 => libc::free,
        address => unsafe { std::mem::transmute::<usize, FreeFn>(address) },
    }
}

/// Whether the calling thread is inside the tracking logic, in which case the wrappers only
/// forward.
#[inline]
fn forwarding() -> bool {
    ReentrancyGuard::is_active()
}

/// # Safety
///
/// Same contract as `malloc`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn leakwatch_malloc(size: usize) -> *mut c_void {
    let data = unsafe { original_malloc()(size) };
    if data.is_null() || forwarding() {
        return data;
    }
    FOREIGN_HEAP.allocated(data, size)
}

/// # Safety
///
/// Same contract as `calloc`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn leakwatch_calloc(count: usize, size: usize) -> *mut c_void {
    let data = unsafe { original_calloc()(count, size) };
    if data.is_null() || forwarding() {
        return data;
    }
    FOREIGN_HEAP.allocated(data, count.saturating_mul(size))
}

/// # Safety
///
/// Same contract as `realloc`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn leakwatch_realloc(data: *mut c_void, size: usize) -> *mut c_void {
    if forwarding() {
        return unsafe { original_realloc()(data, size) };
    }
    if data.is_null() {
        return unsafe { leakwatch_malloc(size) };
    }

    // taken out while `data` is still allocated, so no other thread can be handed its address
    let previous = FOREIGN_HEAP.remove(data as usize);
    let resized = unsafe { original_realloc()(data, size) };
    if resized.is_null() {
        if let Some(block) = previous {
            if size == 0 {
                // a zero-sized realloc frees the block
                FOREIGN_HEAP.released(data, block);
            } else {
                FOREIGN_HEAP.insert(data as usize, block);
            }
        }
        return resized;
    }
    FOREIGN_HEAP.reallocated(previous, data, resized, size);
    resized
}

/// # Safety
///
/// Same contract as `free`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn leakwatch_free(data: *mut c_void) {
    if !data.is_null() && !forwarding() {
        FOREIGN_HEAP.freed(data);
    }
    unsafe { original_free()(data) };
}

#[derive(Debug, Clone, Copy)]
struct ForeignBlock {
    request: RequestId,
    size: usize,
}

/// The blocks allocated through the C allocator wrappers, as a [`TrackedHeap`].
///
/// Blocks are keyed by address internally and get a [`RequestId`] from the same sequence as
/// every other heap. Blocks allocated while tracking is suppressed are not kept.
pub struct ForeignHeap {
    hook: spin::RwLock<Option<Arc<dyn AllocHook>>>,
    blocks: Mutex<BTreeMap<usize, ForeignBlock>>,
}

impl ForeignHeap {
    const fn new() -> Self {
        Self {
            hook: spin::RwLock::new(None),
            blocks: parking_lot::const_mutex(BTreeMap::new()),
        }
    }

    /// The heap fed by the wrappers.
    pub fn global() -> &'static Self {
        &FOREIGN_HEAP
    }

    /// Number of blocks currently known.
    pub fn live_count(&self) -> usize {
        self.blocks.lock().len()
    }

    fn raise(&self, event: &HookEvent) -> bool {
        let hook = self.hook.read().clone();
        match hook {
            Some(hook) => hook.on_event(event),
            None => true,
        }
    }

    fn insert(&self, address: usize, block: ForeignBlock) {
        // the map grows through the allocator being wrapped
        let _guard = ReentrancyGuard::force();
        self.blocks.lock().insert(address, block);
    }

    fn remove(&self, address: usize) -> Option<ForeignBlock> {
        let _guard = ReentrancyGuard::force();
        self.blocks.lock().remove(&address)
    }

    fn get(&self, address: usize) -> Option<ForeignBlock> {
        self.blocks.lock().get(&address).copied()
    }

    fn allocated(&self, data: *mut c_void, size: usize) -> *mut c_void {
        if Suppression::is_active() || self.admit(data, size) {
            data
        } else {
            unsafe { original_free()(data) };
            std::ptr::null_mut()
        }
    }

    /// Raises the allocation event for a new block and keeps it unless the hook denies it.
    fn admit(&self, data: *mut c_void, size: usize) -> bool {
        let request = RequestId::next();
        let allowed = self.raise(&HookEvent {
            kind: HookKind::Alloc,
            request,
            data: data as *const u8,
            size,
            block_use: BlockUse::Normal,
        });
        if allowed {
            self.insert(data as usize, ForeignBlock { request, size });
        }
        allowed
    }

    /// Records the move of `previous`, already taken out of the map, from `old` to `new`.
    fn reallocated(
        &self,
        previous: Option<ForeignBlock>,
        old: *mut c_void,
        new: *mut c_void,
        size: usize,
    ) {
        let Some(previous) = previous else {
            // the old block is already gone, so a denial cannot be honored
            if !Suppression::is_active() {
                self.admit(new, size);
            }
            return;
        };
        if Suppression::is_active() {
            self.released(old, previous);
            return;
        }
        let request = RequestId::next();
        self.raise(&HookEvent {
            kind: HookKind::Realloc {
                previous: previous.request,
            },
            request,
            data: new as *const u8,
            size,
            block_use: BlockUse::Normal,
        });
        self.insert(new as usize, ForeignBlock { request, size });
    }

    fn freed(&self, data: *mut c_void) {
        if let Some(block) = self.get(data as usize) {
            self.released(data, block);
            self.remove(data as usize);
        }
    }

    /// Raises the free event of `block`, which lived at `data`.
    fn released(&self, data: *mut c_void, block: ForeignBlock) {
        self.raise(&HookEvent {
            kind: HookKind::Free,
            request: block.request,
            data: data as *const u8,
            size: block.size,
            block_use: BlockUse::Normal,
        });
    }
}

impl TrackedHeap for ForeignHeap {
    fn set_alloc_hook(&self, hook: Option<Arc<dyn AllocHook>>) -> Option<Arc<dyn AllocHook>> {
        std::mem::replace(&mut *self.hook.write(), hook)
    }

    fn live_blocks(&self) -> Vec<BlockInfo> {
        let _guard = ReentrancyGuard::force();
        let blocks = self.blocks.lock();
        let mut live: Vec<BlockInfo> = blocks
            .iter()
            .map(|(address, block)| BlockInfo {
                request: block.request,
                address: *address,
                size: block.size,
                block_use: BlockUse::Normal,
            })
            .collect();
        drop(blocks);
        live.sort_by(|a, b| b.request.cmp(&a.request));
        live
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_should_build_patch_table() {
        let table = patch_table();
        let symbols: Vec<_> = table.iter().map(|entry| entry.symbol).collect();
        assert_eq!(symbols, vec!["malloc", "calloc", "realloc", "free"]);
        assert!(table.iter().all(|entry| entry.export_module == LIBC));
        assert!(table.iter().all(|entry| entry.original.is_some()));
        assert_eq!(
            table[0].replacement,
            leakwatch_malloc as MallocFn as usize
        );
    }

    #[test]
    fn test_should_track_blocks_through_wrappers() {
        let heap = ForeignHeap::global();
        unsafe {
            let data = leakwatch_malloc(24);
            assert!(!data.is_null());
            assert!(heap.live_blocks().iter().any(|block| block.address == data as usize));

            let zeroed = leakwatch_calloc(4, 8).cast::<u8>();
            assert!(std::slice::from_raw_parts(zeroed, 32).iter().all(|b| *b == 0));

            let grown = leakwatch_realloc(data, 4096);
            let blocks = heap.live_blocks();
            assert!(!blocks.iter().any(|block| block.address == data as usize) || grown == data);
            let block = blocks
                .iter()
                .find(|block| block.address == grown as usize)
                .expect("grown block");
            assert_eq!(block.size, 4096);

            leakwatch_free(grown);
            leakwatch_free(zeroed.cast());
            let blocks = heap.live_blocks();
            assert!(!blocks.iter().any(|block| block.address == grown as usize));
            assert!(!blocks.iter().any(|block| block.address == zeroed as usize));
        }
    }

    fn request_at(address: *mut c_void) -> Option<RequestId> {
        ForeignHeap::global()
            .live_blocks()
            .iter()
            .find(|block| block.address == address as usize)
            .map(|block| block.request)
    }

    #[test]
    fn test_should_rekey_block_on_realloc() {
        unsafe {
            let data = leakwatch_malloc(16);
            let before = request_at(data).expect("tracked");
            let moved = leakwatch_realloc(data, 64 * 1024);
            let after = request_at(moved).expect("tracked after realloc");
            assert!(after > before);
            if moved != data {
                assert_eq!(request_at(data), None);
            }
            leakwatch_free(moved);
            assert_eq!(request_at(moved), None);
        }
    }

    #[test]
    fn test_should_keep_block_when_realloc_fails() {
        unsafe {
            let data = leakwatch_malloc(16);
            let before = request_at(data).expect("tracked");
            assert!(leakwatch_realloc(data, usize::MAX / 2).is_null());
            assert_eq!(request_at(data), Some(before));
            leakwatch_free(data);
        }
    }

    #[test]
    fn test_should_forward_inside_tracking_logic() {
        let heap = ForeignHeap::global();
        let data = {
            let _guard = ReentrancyGuard::force();
            unsafe { leakwatch_malloc(16) }
        };
        assert!(!heap.live_blocks().iter().any(|block| block.address == data as usize));
        unsafe { leakwatch_free(data) };
    }
}
