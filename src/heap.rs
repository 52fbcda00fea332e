use std::alloc::{GlobalAlloc, Layout, System};
use std::mem::{align_of, size_of};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::guard::{InternalScope, ReentrancyGuard, Suppression};
use crate::hook::{AllocHook, BlockInfo, BlockUse, HookEvent, HookKind, RequestId, TrackedHeap};

/// Extra room reserved when snapshotting the live list, for blocks allocated between counting
/// and copying.
const SNAPSHOT_SLACK: usize = 16;

/// Bookkeeping stored right in front of every block's user data.
#[repr(C)]
struct BlockHeader {
    /// Next block towards the tail (allocated earlier).
    older: *mut BlockHeader,
    /// Next block towards the head (allocated later).
    newer: *mut BlockHeader,
    request: RequestId,
    size: usize,
    block_use: BlockUse,
}

const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Doubly linked list of live blocks, newest at the head.
struct LiveList {
    head: *mut BlockHeader,
    count: usize,
}

// The list only ever points into blocks owned by the heap, and it is only touched under the
// heap's lock.
unsafe impl Send for LiveList {}

impl LiveList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            count: 0,
        }
    }

    /// # Safety
    ///
    /// `header` must point to an initialized header that is not linked.
    unsafe fn push_front(&mut self, header: *mut BlockHeader) {
        unsafe {
            (*header).newer = ptr::null_mut();
            (*header).older = self.head;
            if !self.head.is_null() {
                (*self.head).newer = header;
            }
        }
        self.head = header;
        self.count += 1;
    }

    /// # Safety
    ///
    /// `header` must be linked into this list.
    unsafe fn unlink(&mut self, header: *mut BlockHeader) {
        unsafe {
            let older = (*header).older;
            let newer = (*header).newer;
            if newer.is_null() {
                self.head = older;
            } else {
                (*newer).older = older;
            }
            if !older.is_null() {
                (*older).newer = newer;
            }
            (*header).older = ptr::null_mut();
            (*header).newer = ptr::null_mut();
        }
        self.count -= 1;
    }
}

/// A debug heap: a [`GlobalAlloc`] wrapper which tags every block with a request id, keeps all
/// live blocks in an enumerable list and raises a [`HookEvent`] for every operation.
///
/// It is the allocator the leak detector attaches to. It can be installed as the global
/// allocator or used directly as an allocator object.
///
/// ## Example
///
/// ```rust
/// use leakwatch::DebugHeap;
///
/// #[global_allocator]
/// static HEAP: DebugHeap = DebugHeap::new();
/// ```
pub struct DebugHeap<A = System> {
    inner: A,
    live: spin::Mutex<LiveList>,
    hook: spin::RwLock<Option<Arc<dyn AllocHook>>>,
    allocated: AtomicUsize,
}

impl DebugHeap<System> {
    /// Creates a new [`DebugHeap`] backed by the [`System`] allocator.
    pub const fn new() -> Self {
        Self::with_allocator(System)
    }
}

impl Default for DebugHeap<System> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> DebugHeap<A> {
    /// Creates a new [`DebugHeap`] serving blocks from `inner`.
    pub const fn with_allocator(inner: A) -> Self {
        Self {
            inner,
            live: spin::Mutex::new(LiveList::new()),
            hook: spin::RwLock::new(None),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Returns the number of user bytes currently allocated from this heap.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Returns the number of live blocks.
    pub fn live_count(&self) -> usize {
        self.live.lock().count
    }

    /// Passes `event` to the installed hook; `true` when there is none.
    fn raise(&self, event: &HookEvent) -> bool {
        let hook = self.hook.read().clone();
        match hook {
            Some(hook) => hook.on_event(event),
            None => true,
        }
    }
}

/// Computes the layout of the raw block and the offset of the user data inside it.
fn block_layout(layout: Layout) -> Option<(Layout, usize)> {
    let align = layout.align().max(align_of::<BlockHeader>());
    let offset = HEADER_SIZE.checked_next_multiple_of(align)?;
    let size = offset.checked_add(layout.size())?;
    Layout::from_size_align(size, align)
        .ok()
        .map(|raw| (raw, offset))
}

/// # Safety
///
/// `data` must be the user data pointer of a block allocated by a [`DebugHeap`].
#[inline]
unsafe fn header_of(data: *mut u8) -> *mut BlockHeader {
    unsafe { data.sub(HEADER_SIZE).cast() }
}

#[inline]
fn current_block_use() -> BlockUse {
    if InternalScope::is_active() {
        BlockUse::Internal
    } else if ReentrancyGuard::is_active() || Suppression::is_active() {
        BlockUse::Ignored
    } else {
        BlockUse::Normal
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for DebugHeap<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Some((raw_layout, offset)) = block_layout(layout) else {
            return ptr::null_mut();
        };
        let raw = unsafe { self.inner.alloc(raw_layout) };
        if raw.is_null() {
            return raw;
        }

        let data = unsafe { raw.add(offset) };
        let header = unsafe { header_of(data) };
        let request = RequestId::next();
        let block_use = current_block_use();
        unsafe {
            header.write(BlockHeader {
                older: ptr::null_mut(),
                newer: ptr::null_mut(),
                request,
                size: layout.size(),
                block_use,
            });
            self.live.lock().push_front(header);
        }
        self.allocated.fetch_add(layout.size(), Ordering::Relaxed);

        let event = HookEvent {
            kind: HookKind::Alloc,
            request,
            data,
            size: layout.size(),
            block_use,
        };
        if !self.raise(&event) {
            unsafe {
                self.live.lock().unlink(header);
                self.allocated.fetch_sub(layout.size(), Ordering::Relaxed);
                self.inner.dealloc(raw, raw_layout);
            }
            return ptr::null_mut();
        }

        data
    }

    unsafe fn dealloc(&self, data: *mut u8, layout: Layout) {
        let Some((raw_layout, offset)) = block_layout(layout) else {
            return;
        };
        let header = unsafe { header_of(data) };
        let (request, size, block_use) =
            unsafe { ((*header).request, (*header).size, (*header).block_use) };

        self.raise(&HookEvent {
            kind: HookKind::Free,
            request,
            data,
            size,
            block_use,
        });

        unsafe {
            self.live.lock().unlink(header);
        }
        self.allocated.fetch_sub(size, Ordering::Relaxed);
        unsafe { self.inner.dealloc(data.sub(offset), raw_layout) };
    }

    unsafe fn realloc(&self, data: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
            return ptr::null_mut();
        };
        let (Some((old_raw_layout, old_offset)), Some((new_raw_layout, new_offset))) =
            (block_layout(layout), block_layout(new_layout))
        else {
            return ptr::null_mut();
        };

        let raw = unsafe { self.inner.alloc(new_raw_layout) };
        if raw.is_null() {
            return raw;
        }
        let new_data = unsafe { raw.add(new_offset) };
        unsafe { ptr::copy_nonoverlapping(data, new_data, layout.size().min(new_size)) };

        let old_header = unsafe { header_of(data) };
        let (previous, old_size, old_use) =
            unsafe { ((*old_header).request, (*old_header).size, (*old_header).block_use) };
        let new_header = unsafe { header_of(new_data) };
        let request = RequestId::next();
        // an untracked block stays untracked when it grows
        let block_use = match old_use {
            BlockUse::Normal => current_block_use(),
            untracked => untracked,
        };
        unsafe {
            new_header.write(BlockHeader {
                older: ptr::null_mut(),
                newer: ptr::null_mut(),
                request,
                size: new_size,
                block_use,
            });
            let mut live = self.live.lock();
            live.unlink(old_header);
            live.push_front(new_header);
        }
        self.allocated.fetch_add(new_size, Ordering::Relaxed);
        self.allocated.fetch_sub(old_size, Ordering::Relaxed);

        let event = HookEvent {
            kind: HookKind::Realloc { previous },
            request,
            data: new_data,
            size: new_size,
            block_use,
        };
        if !self.raise(&event) {
            unsafe {
                let mut live = self.live.lock();
                live.unlink(new_header);
                live.push_front(old_header);
            }
            self.allocated.fetch_add(old_size, Ordering::Relaxed);
            self.allocated.fetch_sub(new_size, Ordering::Relaxed);
            unsafe { self.inner.dealloc(raw, new_raw_layout) };
            return ptr::null_mut();
        }

        unsafe { self.inner.dealloc(data.sub(old_offset), old_raw_layout) };
        new_data
    }
}

impl<A: Send + Sync> TrackedHeap for DebugHeap<A> {
    fn set_alloc_hook(&self, hook: Option<Arc<dyn AllocHook>>) -> Option<Arc<dyn AllocHook>> {
        std::mem::replace(&mut *self.hook.write(), hook)
    }

    fn live_blocks(&self) -> Vec<BlockInfo> {
        // the snapshot storage itself is allocated from this heap when it is the global
        // allocator, so it must be sized before the list lock is taken
        let _guard = ReentrancyGuard::force();
        loop {
            let expected = self.live.lock().count;
            let mut blocks = Vec::with_capacity(expected + SNAPSHOT_SLACK);

            let live = self.live.lock();
            if live.count > blocks.capacity() {
                continue;
            }
            let mut cursor = live.head;
            while !cursor.is_null() {
                let header = unsafe { &*cursor };
                blocks.push(BlockInfo {
                    request: header.request,
                    address: cursor as usize + HEADER_SIZE,
                    size: header.size,
                    block_use: header.block_use,
                });
                cursor = header.older;
            }
            return blocks;
        }
    }
}
