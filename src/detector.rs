//! The leak detector.
//!
//! A [`Detector`] owns all tracking state: the capturer, the ledger, the symbol cache and the
//! report sink. Attaching installs a [`HookChain`] into every heap and applies the import patch
//! tables; detaching undoes both in reverse order and emits the final report.

use std::collections::HashSet;
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::callstack::{Capturer, MAX_TRACE_FRAMES_LIMIT, StackWalker, UnwindWalker};
use crate::config::Config;
use crate::guard::{InternalScope, ReentrancyGuard};
use crate::hook::{AllocHook, BlockUse, HookEvent, HookKind, RequestId, TrackedHeap};
use crate::interpose::crt::ForeignHeap;
use crate::interpose::{self, ImportPatch, Module};
use crate::ledger::{Ledger, LedgerEntry};
use crate::report::{ReportOptions, ReportSink, ReportSummary, Reporter};
use crate::symbols::{BacktraceSymbolizer, IgnoreList, SymbolCache, SymbolSearchPath, Symbolizer};

/// Options which can change while attached.
struct Options {
    max_trace_frames: AtomicUsize,
    max_data_dump: AtomicUsize,
    show_internal_frames: AtomicBool,
}

/// The tracking engine shared by every hook of one detector.
struct Engine {
    options: Options,
    capturer: Capturer,
    ledger: Ledger,
    symbols: SymbolCache,
    ignore: IgnoreList,
    /// Live allocations dropped by the ignore list.
    ignored: Mutex<HashSet<RequestId>>,
    sink: Mutex<ReportSink>,
}

impl Engine {
    fn report_options(&self) -> ReportOptions {
        ReportOptions {
            max_data_dump: self.options.max_data_dump.load(Ordering::Relaxed),
            show_internal_frames: self.options.show_internal_frames.load(Ordering::Relaxed),
        }
    }

    fn message(&self, args: fmt::Arguments<'_>) {
        let mut sink = self.sink.lock();
        Reporter::new(&mut sink, &self.symbols, self.report_options()).message(args);
    }

    /// Records a new allocation, replacing `previous` for a reallocation.
    fn on_alloc(&self, request: RequestId, size: usize, previous: Option<RequestId>) {
        let call_stack = self
            .capturer
            .capture(self.options.max_trace_frames.load(Ordering::Relaxed));

        if !self.ignore.is_empty() && self.ignore.matches(&call_stack, &self.symbols) {
            if let Some(previous) = previous {
                self.on_free(previous);
            }
            let mut ignored = self.ignored.lock();
            let _scope = InternalScope::enter();
            ignored.insert(request);
            return;
        }

        let entry = LedgerEntry::new(call_stack, size);
        match previous {
            Some(previous) => {
                self.ledger.replace(previous, request, entry);
                if !self.ignore.is_empty() {
                    self.ignored.lock().remove(&previous);
                }
            }
            None => self.ledger.record(request, entry),
        }
    }

    fn on_free(&self, request: RequestId) {
        if !self.ledger.release(request) && !self.ignore.is_empty() {
            self.ignored.lock().remove(&request);
        }
    }

    /// Frees the storage the engine grew while attached.
    fn release_storage(&self) {
        self.ledger.clear();
        self.symbols.clear();
        self.ignore.clear();
        let ignored = std::mem::take(&mut *self.ignored.lock());
        drop(ignored);
    }

    /// Reports the detector's own blocks of `heaps` allocated after `since` that are still live.
    fn check_internal_leaks(&self, heaps: &[&dyn TrackedHeap], since: RequestId) -> usize {
        let _guard = ReentrancyGuard::force();
        let mut blocks = Vec::new();
        for heap in heaps {
            blocks.extend(heap.live_blocks());
        }
        let mut sink = self.sink.lock();
        Reporter::new(&mut sink, &self.symbols, self.report_options()).internal_leaks(&blocks, since)
    }

    fn report(&self, heaps: &[&dyn TrackedHeap], since: RequestId) -> ReportSummary {
        let _guard = ReentrancyGuard::force();
        let mut blocks = Vec::new();
        for heap in heaps {
            blocks.extend(heap.live_blocks());
        }
        blocks.sort_by(|a, b| b.request.cmp(&a.request));
        {
            let ignored = self.ignored.lock();
            blocks.retain(|block| !ignored.contains(&block.request));
        }

        let mut sink = self.sink.lock();
        Reporter::new(&mut sink, &self.symbols, self.report_options()).report(
            &self.ledger,
            &blocks,
            since,
        )
    }
}

/// The hook a detector installs into one heap.
///
/// Every event is forwarded to the hook that was installed before, on every path and while the
/// reentrancy guard is still held. The predecessor's verdict is the chain's verdict, and a
/// denied request never reaches the ledger.
pub struct HookChain {
    engine: Arc<Engine>,
    predecessor: OnceLock<Option<Arc<dyn AllocHook>>>,
}

impl HookChain {
    fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            predecessor: OnceLock::new(),
        }
    }

    fn predecessor(&self) -> Option<Arc<dyn AllocHook>> {
        self.predecessor.get().cloned().flatten()
    }

    fn forward(&self, event: &HookEvent) -> bool {
        match self.predecessor.get() {
            Some(Some(predecessor)) => predecessor.on_event(event),
            _ => true,
        }
    }
}

impl AllocHook for HookChain {
    fn on_event(&self, event: &HookEvent) -> bool {
        let Some(_guard) = ReentrancyGuard::enter() else {
            return self.forward(event);
        };

        match event.kind {
            HookKind::Alloc => {
                let allowed = self.forward(event);
                if allowed && event.block_use == BlockUse::Normal {
                    self.engine.on_alloc(event.request, event.size, None);
                }
                allowed
            }
            HookKind::Realloc { previous } => {
                let allowed = self.forward(event);
                if allowed {
                    match event.block_use {
                        BlockUse::Normal => {
                            self.engine.on_alloc(event.request, event.size, Some(previous))
                        }
                        // moved out of tracking by a suppressed reallocation
                        BlockUse::Internal | BlockUse::Ignored => self.engine.on_free(previous),
                    }
                }
                allowed
            }
            HookKind::Free => {
                self.engine.on_free(event.request);
                self.forward(event)
            }
        }
    }
}

struct Attachment<'h> {
    heap: &'h dyn TrackedHeap,
    chain: Arc<HookChain>,
}

impl<'h> Attachment<'h> {
    fn install(heap: &'h dyn TrackedHeap, engine: &Arc<Engine>) -> Self {
        let chain = Arc::new(HookChain::new(engine.clone()));
        let predecessor = heap.set_alloc_hook(Some(chain.clone() as Arc<dyn AllocHook>));
        let _ = chain.predecessor.set(predecessor);
        Self { heap, chain }
    }

    fn uninstall(&self, engine: &Engine) {
        let current = self.heap.set_alloc_hook(self.chain.predecessor());
        let ours = Arc::as_ptr(&self.chain);
        let still_ours = current
            .as_ref()
            .is_some_and(|hook| std::ptr::addr_eq(Arc::as_ptr(hook), ours));
        if !still_ours {
            // a hook installed after ours stays in place
            self.heap.set_alloc_hook(current);
            tracing::warn!("the allocation hook was replaced while the leak detector was attached");
            engine.message(format_args!(
                "WARNING: leakwatch: The allocation hook function was unhooked prematurely!\n    \
                 leakwatch may have failed to detect some memory leaks.\n"
            ));
        }
    }
}

/// An attached leak detector.
///
/// Dropping it (or calling [`Detector::detach`]) restores the patched imports, uninstalls the
/// hooks and emits the final report.
///
/// ## Example
///
/// ```rust
/// use leakwatch::{DebugHeap, Detector};
///
/// static HEAP: DebugHeap = DebugHeap::new();
///
/// let detector = Detector::builder().heap(&HEAP).attach();
/// assert_eq!(detector.leak_count(), 0);
/// ```
pub struct Detector<'h> {
    engine: Arc<Engine>,
    attachments: Vec<Attachment<'h>>,
    patches: Vec<(Module, Vec<ImportPatch>)>,
    attached_at: RequestId,
    detached: bool,
}

impl<'h> Detector<'h> {
    pub fn builder() -> DetectorBuilder<'h> {
        DetectorBuilder::default()
    }

    /// Attaches to `heap` with the configuration of the environment.
    pub fn attach<H: TrackedHeap>(heap: &'h H) -> Self {
        Self::builder().config(Config::from_env()).heap(heap).attach()
    }

    /// Number of tracked allocations not yet marked as reported.
    pub fn leak_count(&self) -> usize {
        self.engine.ledger.unreported()
    }

    /// Reports the current leaks right away.
    pub fn report_leaks(&self) -> ReportSummary {
        let _guard = ReentrancyGuard::force();
        let heaps: Vec<&dyn TrackedHeap> = self.attachments.iter().map(|a| a.heap).collect();
        self.engine.report(&heaps, self.attached_at)
    }

    /// Resolves the call stacks of all unreported allocations; returns how many frames could
    /// not be resolved to a function name.
    pub fn resolve_callstacks(&self) -> usize {
        let _guard = ReentrancyGuard::force();
        Reporter::resolve_callstacks(&self.engine.symbols, &self.engine.ledger)
    }

    /// Marks every current allocation as reported, so later reports only show newer ones.
    pub fn mark_all_reported(&self) {
        let _guard = ReentrancyGuard::force();
        self.engine.ledger.mark_all_reported();
    }

    /// Changes the capture depth and the report options. The depth applies to allocations made
    /// from now on.
    pub fn set_options(&self, max_trace_frames: usize, max_data_dump: usize, show_internal_frames: bool) {
        let options = &self.engine.options;
        options
            .max_trace_frames
            .store(max_trace_frames.min(MAX_TRACE_FRAMES_LIMIT), Ordering::Relaxed);
        options.max_data_dump.store(max_data_dump, Ordering::Relaxed);
        options
            .show_internal_frames
            .store(show_internal_frames, Ordering::Relaxed);
    }

    /// Detaches and returns the summary of the final report.
    pub fn detach(mut self) -> ReportSummary {
        self.shutdown()
    }

    fn shutdown(&mut self) -> ReportSummary {
        self.detached = true;
        let _guard = ReentrancyGuard::force();

        for (module, table) in self.patches.iter().rev() {
            let outcome = interpose::restore_module(module, table);
            for failure in &outcome.failures {
                self.engine.message(format_args!(
                    "ERROR: leakwatch: Failed to restore an import of {module}: {failure}.\n"
                ));
            }
        }
        for attachment in self.attachments.iter().rev() {
            attachment.uninstall(&self.engine);
        }

        let heaps: Vec<&dyn TrackedHeap> = self.attachments.iter().map(|a| a.heap).collect();
        let mut summary = self.engine.report(&heaps, self.attached_at);
        self.engine.release_storage();
        summary.internal += self.engine.check_internal_leaks(&heaps, self.attached_at);
        self.engine
            .message(format_args!("leakwatch is now exiting.\n"));
        self.engine.sink.lock().flush();

        tracing::info!(
            leaks = summary.leaks,
            internal = summary.internal,
            missing = summary.missing,
            untracked = summary.untracked,
            "leak detector detached"
        );
        summary
    }
}

impl Drop for Detector<'_> {
    fn drop(&mut self) {
        if !self.detached {
            self.shutdown();
        }
    }
}

/// Builds and attaches a [`Detector`].
pub struct DetectorBuilder<'h> {
    config: Config,
    symbolizer: Box<dyn Symbolizer>,
    walker: Box<dyn StackWalker>,
    writer: Option<Box<dyn Write + Send>>,
    heaps: Vec<&'h dyn TrackedHeap>,
    patches: Vec<(Module, Vec<ImportPatch>)>,
}

impl Default for DetectorBuilder<'_> {
    fn default() -> Self {
        Self {
            config: Config::default(),
            symbolizer: Box::new(BacktraceSymbolizer),
            walker: Box::new(UnwindWalker),
            writer: None,
            heaps: Vec::new(),
            patches: Vec::new(),
        }
    }
}

impl<'h> DetectorBuilder<'h> {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn symbolizer(mut self, symbolizer: impl Symbolizer + 'static) -> Self {
        self.symbolizer = Box::new(symbolizer);
        self
    }

    pub fn walker(mut self, walker: impl StackWalker + 'static) -> Self {
        self.walker = Box::new(walker);
        self
    }

    /// Sends the report to `writer` instead of the destinations of the configuration.
    pub fn report_to(mut self, writer: impl Write + Send + 'static) -> Self {
        self.writer = Some(Box::new(writer));
        self
    }

    /// Tracks the allocations of `heap`.
    pub fn heap<H: TrackedHeap>(mut self, heap: &'h H) -> Self {
        self.heaps.push(heap);
        self
    }

    /// Redirects the imports of `module` listed in `table` while attached.
    pub fn patch(mut self, module: Module, table: Vec<ImportPatch>) -> Self {
        self.patches.push((module, table));
        self
    }

    /// Installs the hooks and the import patches.
    pub fn attach(self) -> Detector<'h> {
        let _guard = ReentrancyGuard::force();
        let Self {
            config,
            symbolizer,
            walker,
            writer,
            mut heaps,
            patches,
        } = self;

        let encoding = config.report.encoding;
        let (sink, sink_error) = match writer {
            Some(writer) => (ReportSink::writer(writer, encoding), None),
            None => match ReportSink::from_config(&config.report) {
                Ok(sink) => (sink, None),
                Err(err) => {
                    tracing::warn!(%err, "failed to open the report file");
                    (ReportSink::debugger(encoding), Some(err))
                }
            },
        };

        let engine = Arc::new(Engine {
            options: Options {
                max_trace_frames: AtomicUsize::new(config.max_trace_frames.min(MAX_TRACE_FRAMES_LIMIT)),
                max_data_dump: AtomicUsize::new(config.max_data_dump),
                show_internal_frames: AtomicBool::new(config.show_internal_frames),
            },
            capturer: Capturer::new(walker),
            ledger: Ledger::new(),
            symbols: SymbolCache::new(symbolizer),
            ignore: IgnoreList::new(config.ignore_functions.clone()),
            ignored: Mutex::new(HashSet::new()),
            sink: Mutex::new(sink),
        });

        engine.message(format_args!(
            "leakwatch {} installed.\n",
            env!("CARGO_PKG_VERSION")
        ));
        if let Some(err) = sink_error {
            engine.message(format_args!(
                "WARNING: leakwatch: The report file could not be opened ({err}). \
                 Reporting to the debugger only.\n"
            ));
        }
        if !engine.capturer.can_walk() {
            tracing::warn!("the stack walker returned no frame; call stacks will be empty");
            engine.message(format_args!(
                "WARNING: leakwatch: The stack walker is not functional. \
                 Call stacks will not be available for leaked blocks.\n"
            ));
        }
        let search_path = SymbolSearchPath::build();
        if let Err(err) = engine.symbols.initialize(&search_path) {
            tracing::warn!(%err, %search_path, "symbol handler unavailable");
            engine.message(format_args!(
                "WARNING: leakwatch: The symbol handler failed to initialize ({err}).\n    \
                 Stack traces will probably not be available for leaked blocks.\n"
            ));
        }

        let attached_at = RequestId::next();
        if !patches.is_empty() {
            heaps.push(ForeignHeap::global());
        }
        let attachments: Vec<_> = heaps
            .into_iter()
            .map(|heap| Attachment::install(heap, &engine))
            .collect();

        for (module, table) in &patches {
            let outcome = interpose::patch_module(module, table);
            for failure in &outcome.failures {
                engine.message(format_args!(
                    "ERROR: leakwatch: Failed to patch an import of {module}: {failure}.\n"
                ));
            }
        }

        tracing::info!(
            heaps = attachments.len(),
            patches = patches.len(),
            max_trace_frames = config.max_trace_frames,
            "leak detector attached"
        );

        Detector {
            engine,
            attachments,
            patches,
            attached_at,
            detached: false,
        }
    }
}

#[cfg(test)]
mod test {

    use std::alloc::{GlobalAlloc, Layout};
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::heap::DebugHeap;
    use crate::report::SharedBuffer;
    use crate::symbols::test::FakeSymbolizer;

    /// Yields four frames of walker plumbing, then `frames`.
    struct FixedWalker(Vec<usize>);

    impl StackWalker for FixedWalker {
        fn walk(&self, visit: &mut dyn FnMut(usize) -> bool) {
            for pc in [1, 2, 3, 4].iter().chain(&self.0) {
                if !visit(*pc) {
                    break;
                }
            }
        }
    }

    struct SilentWalker;

    impl StackWalker for SilentWalker {
        fn walk(&self, _visit: &mut dyn FnMut(usize) -> bool) {}
    }

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<HookKind>>,
        deny: bool,
    }

    impl AllocHook for Recorder {
        fn on_event(&self, event: &HookEvent) -> bool {
            self.events.lock().unwrap().push(event.kind);
            !self.deny
        }
    }

    fn detector<'h>(heap: &'h DebugHeap, buffer: &SharedBuffer) -> DetectorBuilder<'h> {
        Detector::builder()
            .walker(FixedWalker(vec![0x20, 0x30]))
            .symbolizer(FakeSymbolizer::new(&[(0x20, "demo::build"), (0x30, "demo::main")]))
            .report_to(buffer.clone())
            .heap(heap)
    }

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size, 8).unwrap()
    }

    #[test]
    fn test_should_track_and_report_leaks() {
        let heap = DebugHeap::new();
        let buffer = SharedBuffer::new();
        let detector = detector(&heap, &buffer).attach();

        let a = unsafe { heap.alloc(layout(40)) };
        let b = unsafe { heap.alloc(layout(40)) };
        unsafe { heap.dealloc(b, layout(40)) };
        assert_eq!(detector.leak_count(), 1);
        assert_eq!(detector.resolve_callstacks(), 0);

        let summary = detector.detach();
        assert_eq!(summary.leaks, 1);
        assert_eq!(summary.internal, 0);
        let report = buffer.contents();
        assert!(report.starts_with("leakwatch "), "{report}");
        assert!(report.contains("WARNING: Detected memory leaks!\n"));
        assert!(report.contains(": 40 bytes ----------\n"));
        assert!(report.contains("/home/u/app/src/main.rs (10): demo::build\n"));
        assert!(report.contains("Detected 1 memory leak.\n"));
        assert!(report.ends_with("leakwatch is now exiting.\n"));

        unsafe { heap.dealloc(a, layout(40)) };
    }

    #[test]
    fn test_should_detect_leaked_detector_storage() {
        let heap = DebugHeap::new();
        let buffer = SharedBuffer::new();
        let detector = detector(&heap, &buffer).attach();

        let kept = {
            let _scope = InternalScope::enter();
            unsafe { heap.alloc(layout(24)) }
        };
        assert_eq!(detector.leak_count(), 0);

        let summary = detector.detach();
        assert_eq!(summary.internal, 1);
        assert_eq!(summary.leaks, 0);
        assert!(!summary.is_clean());
        let report = buffer.contents();
        assert!(
            report.contains(
                "No memory leaks detected.\n\
                 ERROR: leakwatch: Detected a memory leak internal to the leak detector!\n"
            ),
            "{report}"
        );
        assert!(report.contains(": 24 bytes ----------\n"));
        assert!(report.ends_with("leakwatch is now exiting.\n"));

        unsafe { heap.dealloc(kept, layout(24)) };
    }

    #[test]
    fn test_should_release_storage_on_shutdown() {
        let heap = DebugHeap::new();
        let buffer = SharedBuffer::new();
        let mut detector = detector(&heap, &buffer)
            .config(Config::default().ignore_function("demo::main"))
            .attach();

        let block = unsafe { heap.alloc(layout(8)) };
        assert_eq!(detector.engine.ignored.lock().len(), 1);
        assert!(!detector.engine.symbols.is_empty());

        let summary = detector.shutdown();
        assert_eq!(summary.internal, 0);
        assert!(detector.engine.ledger.is_empty());
        assert!(detector.engine.symbols.is_empty());
        assert!(detector.engine.ignored.lock().is_empty());

        unsafe { heap.dealloc(block, layout(8)) };
    }

    #[test]
    fn test_should_report_zero_leaks_when_all_freed() {
        let heap = DebugHeap::new();
        let buffer = SharedBuffer::new();
        let detector = detector(&heap, &buffer).attach();

        let blocks: Vec<_> = (0..16).map(|n| unsafe { heap.alloc(layout(n + 1)) }).collect();
        assert_eq!(detector.leak_count(), 16);
        for (n, block) in blocks.into_iter().enumerate() {
            unsafe { heap.dealloc(block, layout(n + 1)) };
        }
        assert_eq!(detector.leak_count(), 0);
        assert!(detector.detach().is_clean());
        assert!(buffer.contents().contains("No memory leaks detected.\n"));
    }

    #[test]
    fn test_should_move_liability_on_realloc() {
        let heap = DebugHeap::new();
        let buffer = SharedBuffer::new();
        let detector = detector(&heap, &buffer).attach();

        let data = unsafe { heap.alloc(layout(8)) };
        let old_request = heap.live_blocks()[0].request;
        let grown = unsafe { heap.realloc(data, layout(8), 64) };
        let new_request = heap.live_blocks()[0].request;
        assert_ne!(old_request, new_request);
        assert!(!detector.engine.ledger.contains(old_request));
        assert_eq!(
            detector.engine.ledger.get(new_request).expect("tracked").size,
            64
        );
        assert_eq!(detector.leak_count(), 1);

        unsafe { heap.dealloc(grown, layout(64)) };
        assert_eq!(detector.leak_count(), 0);
    }

    #[test]
    fn test_should_only_report_new_leaks_after_mark() {
        let heap = DebugHeap::new();
        let buffer = SharedBuffer::new();
        let detector = detector(&heap, &buffer).attach();

        let old = unsafe { heap.alloc(layout(16)) };
        detector.mark_all_reported();
        assert_eq!(detector.leak_count(), 0);
        let new = unsafe { heap.alloc(layout(24)) };
        assert_eq!(detector.leak_count(), 1);

        let summary = detector.report_leaks();
        assert_eq!(summary.leaks, 1);
        let report = buffer.contents();
        assert!(report.contains(": 24 bytes ----------"));
        assert!(!report.contains(": 16 bytes ----------"));

        drop(detector);
        unsafe {
            heap.dealloc(old, layout(16));
            heap.dealloc(new, layout(24));
        }
    }

    #[test]
    fn test_should_chain_to_previous_hook() {
        let heap = DebugHeap::new();
        let recorder = Arc::new(Recorder::default());
        heap.set_alloc_hook(Some(recorder.clone()));

        let buffer = SharedBuffer::new();
        let detector = detector(&heap, &buffer).attach();
        let data = unsafe { heap.alloc(layout(8)) };
        let grown = unsafe { heap.realloc(data, layout(8), 16) };
        unsafe { heap.dealloc(grown, layout(16)) };
        // ignored allocations are forwarded too
        let ignored = crate::untracked(|| unsafe { heap.alloc(layout(8)) });
        unsafe { heap.dealloc(ignored, layout(8)) };
        drop(detector);

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events.len(), 5);
        assert_eq!(events[0], HookKind::Alloc);
        assert!(matches!(events[1], HookKind::Realloc { .. }));
        assert_eq!(events[2], HookKind::Free);
        assert_eq!(events[3], HookKind::Alloc);
        assert_eq!(events[4], HookKind::Free);

        // the previous hook is back in place
        let restored = heap.set_alloc_hook(None).expect("previous hook");
        assert!(std::ptr::addr_eq(Arc::as_ptr(&restored), Arc::as_ptr(&recorder)));
    }

    #[test]
    fn test_should_not_track_denied_allocations() {
        let heap = DebugHeap::new();
        heap.set_alloc_hook(Some(Arc::new(Recorder {
            deny: true,
            ..Default::default()
        })));

        let buffer = SharedBuffer::new();
        let detector = detector(&heap, &buffer).attach();
        assert!(unsafe { heap.alloc(layout(8)) }.is_null());
        assert_eq!(detector.leak_count(), 0);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_should_ignore_configured_functions() {
        let heap = DebugHeap::new();
        let buffer = SharedBuffer::new();
        let detector = detector(&heap, &buffer)
            .config(Config::default().ignore_function("build"))
            .attach();

        let data = unsafe { heap.alloc(layout(8)) };
        assert_eq!(detector.leak_count(), 0);
        let summary = detector.report_leaks();
        assert_eq!(summary, ReportSummary::default());

        unsafe { heap.dealloc(data, layout(8)) };
        assert!(detector.engine.ignored.lock().is_empty());
    }

    #[test]
    fn test_should_release_entries_freed_while_suppressed() {
        let heap = DebugHeap::new();
        let buffer = SharedBuffer::new();
        let detector = detector(&heap, &buffer).attach();

        let data = unsafe { heap.alloc(layout(8)) };
        let grown = unsafe { heap.realloc(data, layout(8), 32) };
        assert_eq!(detector.leak_count(), 1);
        let moved = crate::untracked(|| unsafe { heap.realloc(grown, layout(32), 64) });
        assert_eq!(detector.leak_count(), 0);

        crate::untracked(|| unsafe { heap.dealloc(moved, layout(64)) });
        assert!(detector.detach().is_clean());
    }

    #[test]
    fn test_should_warn_about_replaced_hook() {
        let heap = DebugHeap::new();
        let buffer = SharedBuffer::new();
        let detector = detector(&heap, &buffer).attach();

        let intruder: Arc<dyn AllocHook> = Arc::new(Recorder::default());
        heap.set_alloc_hook(Some(intruder.clone()));
        drop(detector);

        assert!(buffer.contents().contains("unhooked prematurely"));
        let kept = heap.set_alloc_hook(None).expect("intruder kept");
        assert!(std::ptr::addr_eq(Arc::as_ptr(&kept), Arc::as_ptr(&intruder)));
    }

    #[test]
    fn test_should_warn_about_degraded_setup() {
        let heap = DebugHeap::new();
        let buffer = SharedBuffer::new();
        let detector = Detector::builder()
            .walker(SilentWalker)
            .symbolizer(FakeSymbolizer::default().unavailable())
            .report_to(buffer.clone())
            .heap(&heap)
            .attach();

        // tracking still works
        let data = unsafe { heap.alloc(layout(8)) };
        assert_eq!(detector.leak_count(), 1);
        unsafe { heap.dealloc(data, layout(8)) };
        drop(detector);

        let report = buffer.contents();
        assert!(report.contains("WARNING: leakwatch: The stack walker is not functional."));
        assert!(report.contains("WARNING: leakwatch: The symbol handler failed to initialize"));
    }

    #[test]
    fn test_should_apply_new_options() {
        let heap = DebugHeap::new();
        let buffer = SharedBuffer::new();
        let detector = detector(&heap, &buffer).attach();
        detector.set_options(1, 0, true);

        let data = unsafe { heap.alloc(layout(8)) };
        let request = heap.live_blocks()[0].request;
        assert_eq!(
            detector.engine.ledger.lookup(request).expect("tracked").frames(),
            &[0x20]
        );
        detector.report_leaks();
        assert!(!buffer.contents().contains("  Data:"));

        unsafe { heap.dealloc(data, layout(8)) };
    }
}
