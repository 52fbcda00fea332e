#![crate_name = "leakwatch"]
#![crate_type = "lib"]

//! # Leakwatch
//!
//! An in-process memory leak detector: a debug heap with allocation hooks, import patching for
//! the C allocator, call stack capture and symbolized leak reports.
//!
//! ## Introduction
//!
//! Leakwatch intercepts every allocation, reallocation and free made through an instrumented
//! heap, records the call stack of each allocation and, when the detector is detached, reports
//! every block which was allocated but never freed: its size, the source locations of its call
//! stack and a dump of its contents.
//!
//! Allocations are intercepted in two ways:
//!
//! - through a [`DebugHeap`], a [`std::alloc::GlobalAlloc`] wrapper which calls a hook for each
//!   allocation event;
//! - by patching the import slots of a loaded module, so that its calls to `malloc`, `calloc`,
//!   `realloc` and `free` go to instrumented wrappers (64-bit Linux only).
//!
//! ## Usage
//!
//! ### Cargo.toml
//!
//! ```toml
//! [dependencies]
//! leakwatch = "0.1"
//! ```
//!
//! ### Setup
//!
//! Set the allocator to a [`DebugHeap`] and attach a [`Detector`] at the beginning of `main`.
//! The report is emitted when the detector is dropped:
//!
//! ```rust
//! use leakwatch::{DebugHeap, Detector};
//!
//! #[global_allocator]
//! static HEAP: DebugHeap = DebugHeap::new();
//!
//! fn main() {
//!     let _detector = Detector::attach(&HEAP);
//!
//!     let leaked = Box::leak(Box::new([0u8; 40]));
//!     assert_eq!(leaked.len(), 40);
//! }
//! ```
//!
//! [`Detector::attach`] reads its [`Config`] from the `LEAKWATCH_*` environment variables; use
//! [`Detector::builder`] to configure it in code:
//!
//! ```rust
//! use leakwatch::{Config, DebugHeap, Detector, SharedBuffer};
//!
//! static HEAP: DebugHeap = DebugHeap::new();
//!
//! let report = SharedBuffer::new();
//! let detector = Detector::builder()
//!     .config(Config::default().with_max_trace_frames(16).ignore_function("cache_init"))
//!     .report_to(report.clone())
//!     .heap(&HEAP)
//!     .attach();
//!
//! let summary = detector.detach();
//! assert!(summary.is_clean());
//! assert!(report.contents().contains("No memory leaks detected."));
//! ```
//!
//! ### Querying while attached
//!
//! - [`Detector::leak_count`]: number of live tracked allocations not yet reported;
//! - [`Detector::report_leaks`]: emits a report right away;
//! - [`Detector::mark_all_reported`]: later reports only show newer allocations;
//! - [`Detector::resolve_callstacks`]: resolves symbols now, while the modules are still loaded.
//!
//! ### Patching the C allocator
//!
//! ```rust,no_run
//! use leakwatch::interpose::{Module, crt};
//! use leakwatch::{DebugHeap, Detector};
//!
//! static HEAP: DebugHeap = DebugHeap::new();
//!
//! let detector = Detector::builder()
//!     .heap(&HEAP)
//!     .patch(Module::named("libfoo.so"), crt::patch_table())
//!     .attach();
//! ```
//!
//! ## Untracked allocations
//!
//! Allocations made inside [`untracked`] are never reported.
//!
//! ## Debug only
//!
//! Every tracked allocation captures a call stack, which is slow. Leakwatch is meant for debug
//! builds.
//!

#![doc(html_playground_url = "https://play.rust-lang.org")]

pub mod callstack;
pub mod config;
mod detector;
mod error;
mod guard;
mod heap;
pub mod hook;
pub mod interpose;
pub mod ledger;
pub mod report;
pub mod symbols;

pub use self::callstack::{CallStack, Capturer, StackWalker};
pub use self::config::{Config, Encoding, ReportConfig};
pub use self::detector::{Detector, DetectorBuilder, HookChain};
pub use self::error::{Error, Result};
pub use self::guard::{ReentrancyGuard, Suppression};
pub use self::heap::DebugHeap;
pub use self::hook::{AllocHook, BlockInfo, BlockUse, HookEvent, HookKind, RequestId, TrackedHeap};
pub use self::interpose::crt::ForeignHeap;
pub use self::report::{ReportSummary, SharedBuffer};
pub use self::symbols::{BacktraceSymbolizer, Symbolizer};

/// Runs `f` with tracking suppressed on the current thread.
///
/// Blocks allocated inside `f` are never reported; blocks freed inside `f` are still released.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    let _suppression = Suppression::new();
    f()
}
