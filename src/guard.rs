//! Per-thread reentrancy protection for the tracking logic.
//!
//! Any allocation made while a [`ReentrancyGuard`] is alive on the current thread is ignored: it
//! is still served by the heap, but it never reaches the call stack capturer or the ledger. This
//! is what stops the ledger's own storage growth from recursing into itself.
//!
//! Storage owned by the detector is allocated inside an [`InternalScope`] and marked internal, so
//! that the detector can check at shutdown that it released all of it.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    // Const-initialized and without a destructor, so it never allocates and stays accessible
    // while the thread is being torn down.
    static DEPTH: Cell<u32> = const { Cell::new(0) };
    static SUPPRESSED: Cell<u32> = const { Cell::new(0) };
    static OWNED: Cell<u32> = const { Cell::new(0) };
}

/// Scoped marker for "currently inside tracking logic".
///
/// The nesting depth is raised on construction and lowered on drop, so every exit path clears
/// it, including early returns and unwinding.
#[derive(Debug)]
pub struct ReentrancyGuard {
    // Bound to the thread whose counter it raised.
    _not_send: PhantomData<*const ()>,
}

impl ReentrancyGuard {
    /// Enters the tracking logic if the current thread is not already inside it.
    ///
    /// Returns [`None`] when the thread is already inside, in which case the caller must only
    /// forward the event and return.
    #[inline]
    pub fn enter() -> Option<Self> {
        let entered = DEPTH
            .try_with(|depth| {
                if depth.get() == 0 {
                    depth.set(1);
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);

        // a refused entry must not build a guard, its drop would lower the outer depth
        entered.then(|| Self {
            _not_send: PhantomData,
        })
    }

    /// Raises the depth unconditionally.
    ///
    /// Used by code that must run untracked regardless of the current state, such as the
    /// reporter and the detector's setup and teardown.
    #[inline]
    pub fn force() -> Self {
        let _ = DEPTH.try_with(|depth| depth.set(depth.get().saturating_add(1)));
        Self {
            _not_send: PhantomData,
        }
    }

    /// Returns whether the current thread is inside the tracking logic.
    #[inline]
    pub fn is_active() -> bool {
        DEPTH.try_with(|depth| depth.get() > 0).unwrap_or(true)
    }
}

impl Drop for ReentrancyGuard {
    #[inline]
    fn drop(&mut self) {
        let _ = DEPTH.try_with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Scoped suppression of tracking requested by the host program, see [`crate::untracked`].
///
/// Unlike a [`ReentrancyGuard`], suppression does not stop the tracking logic from running: frees
/// made while suppressed still release their ledger entries. Blocks allocated while suppressed are
/// ignored.
#[derive(Debug)]
pub struct Suppression {
    _not_send: PhantomData<*const ()>,
}

impl Suppression {
    #[inline]
    pub fn new() -> Self {
        let _ = SUPPRESSED.try_with(|depth| depth.set(depth.get().saturating_add(1)));
        Self {
            _not_send: PhantomData,
        }
    }

    #[inline]
    pub fn is_active() -> bool {
        SUPPRESSED.try_with(|depth| depth.get() > 0).unwrap_or(false)
    }
}

impl Default for Suppression {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Suppression {
    #[inline]
    fn drop(&mut self) {
        let _ = SUPPRESSED.try_with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Scoped marker for "allocating storage owned by the detector".
///
/// Blocks allocated inside the scope are [`crate::BlockUse::Internal`]. The detector releases
/// every one of them when it shuts down.
#[derive(Debug)]
pub(crate) struct InternalScope {
    _not_send: PhantomData<*const ()>,
}

impl InternalScope {
    #[inline]
    pub(crate) fn enter() -> Self {
        let _ = OWNED.try_with(|depth| depth.set(depth.get().saturating_add(1)));
        Self {
            _not_send: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn is_active() -> bool {
        OWNED.try_with(|depth| depth.get() > 0).unwrap_or(false)
    }
}

impl Drop for InternalScope {
    #[inline]
    fn drop(&mut self) {
        let _ = OWNED.try_with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}
