use std::ffi::c_void;

/// A platform stack-walking service.
pub trait StackWalker: Send + Sync {
    /// Calls `visit` with the program counter of every frame of the current thread, innermost
    /// first, until it returns `false` or the stack is exhausted.
    fn walk(&self, visit: &mut dyn FnMut(usize) -> bool);
}

/// Walks the stack with the unwinder, through [`backtrace::trace_unsynchronized`].
///
/// Runs inside allocation events, so it must not take the `backtrace` crate's global lock.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnwindWalker;

impl StackWalker for UnwindWalker {
    #[inline(never)]
    fn walk(&self, visit: &mut dyn FnMut(usize) -> bool) {
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                let ip: *mut c_void = frame.ip();
                visit(ip as usize)
            });
        }
    }
}
