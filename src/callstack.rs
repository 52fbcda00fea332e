//! Call stack capture.
//!
//! The [`Capturer`] walks the current thread's stack from the point of interception outwards and
//! records one program counter per frame, most recent first.

pub mod arch;
mod walker;

use std::sync::Arc;

use self::arch::{CurrentFrame, HostArch};
pub use self::walker::{StackWalker, UnwindWalker};
use crate::guard::InternalScope;

/// Upper bound for any configured trace depth.
pub const MAX_TRACE_FRAMES_LIMIT: usize = 1024;

/// Number of frames skipped from the top of the walk when the capturer cannot find its own
/// frame: the unwinder callback, the unwinder entry point, the walker and the capturer itself.
pub const FALLBACK_SKIP_FRAMES: usize = 4;

/// Maximum distance, in bytes, between the program counter read inside [`Capturer::capture`]
/// and the return address the unwinder reports for the same frame.
const ANCHOR_WINDOW: usize = 1024;

/// How many frames from the top of the walk are searched for the capturer's own frame.
const ANCHOR_SEARCH_FRAMES: usize = 16;

/// An ordered list of return addresses; frame 0 is the most recent call.
///
/// Immutable once captured and cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStack {
    frames: Arc<[usize]>,
}

impl CallStack {
    pub fn new(frames: &[usize]) -> Self {
        let _scope = InternalScope::enter();
        Self {
            frames: Arc::from(frames),
        }
    }

    pub fn empty() -> Self {
        Self::new(&[])
    }

    pub fn frames(&self) -> &[usize] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Captures [`CallStack`]s through a [`StackWalker`].
pub struct Capturer {
    walker: Box<dyn StackWalker>,
}

impl Default for Capturer {
    fn default() -> Self {
        Self::new(Box::new(UnwindWalker))
    }
}

impl Capturer {
    pub fn new(walker: Box<dyn StackWalker>) -> Self {
        Self { walker }
    }

    /// Captures at most `max_frames` frames of the calling thread; frame 0 is the caller of
    /// this function.
    ///
    /// The storage for the result is allocated here, so this must run while the thread holds a
    /// [`crate::guard::ReentrancyGuard`] when called from inside an allocation event.
    #[inline(never)]
    pub fn capture(&self, max_frames: usize) -> CallStack {
        let max_frames = max_frames.min(MAX_TRACE_FRAMES_LIMIT);
        let anchor = HostArch::program_counter();

        let limit = max_frames + ANCHOR_SEARCH_FRAMES;
        let mut raw = Vec::with_capacity(limit);
        self.walker.walk(&mut |pc| {
            // a zero program counter marks the end of the stack
            if pc == 0 {
                return false;
            }
            raw.push(pc);
            raw.len() < limit
        });

        CallStack::new(select_frames(&raw, anchor, max_frames))
    }

    /// Returns whether the walker yields any frame at all.
    pub fn can_walk(&self) -> bool {
        let mut walked = false;
        self.walker.walk(&mut |_| {
            walked = true;
            false
        });
        walked
    }
}

/// Drops the frames belonging to the walk itself and caps the result at `max_frames`.
fn select_frames(raw: &[usize], anchor: Option<usize>, max_frames: usize) -> &[usize] {
    let anchored = anchor.and_then(|anchor| {
        raw.iter()
            .take(ANCHOR_SEARCH_FRAMES)
            .position(|&pc| pc.wrapping_sub(anchor) < ANCHOR_WINDOW)
    });
    let start = match anchored {
        Some(index) => index + 1,
        None => FALLBACK_SKIP_FRAMES,
    }
    .min(raw.len());
    let end = raw.len().min(start + max_frames);

    &raw[start..end]
}
