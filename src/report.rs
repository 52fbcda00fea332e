//! The leak report.
//!
//! The report is a sequence of messages sent to a [`ReportSink`]. Each message is capped at
//! [`MAX_MESSAGE_LENGTH`] characters; longer messages are cut, which is not an error.

mod dump;
mod sink;

use std::collections::HashSet;
use std::fmt::{self, Write as _};
use std::mem::size_of;

pub use self::sink::{ReportSink, SharedBuffer};
use crate::callstack::CallStack;
use crate::config::Encoding;
use crate::hook::{BlockInfo, BlockUse, RequestId};
use crate::ledger::{Ledger, LedgerEntry};
use crate::symbols::demangle::{self, UNAVAILABLE_FUNCTION};
use crate::symbols::SymbolCache;

/// Maximum length of one report message, in characters.
pub const MAX_MESSAGE_LENGTH: usize = 5119;

const ADDRESS_WIDTH: usize = size_of::<usize>() * 2;

/// A report message under construction. Text past [`MAX_MESSAGE_LENGTH`] is dropped.
#[derive(Debug, Default)]
pub struct Message {
    text: String,
    chars: usize,
    truncated: bool,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn len(&self) -> usize {
        self.chars
    }

    pub fn is_empty(&self) -> bool {
        self.chars == 0
    }
}

impl fmt::Write for Message {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.truncated {
            return Ok(());
        }
        let room = MAX_MESSAGE_LENGTH - self.chars;
        match s.char_indices().nth(room) {
            None => {
                self.text.push_str(s);
                self.chars += s.chars().count();
            }
            Some((cut, _)) => {
                self.text.push_str(&s[..cut]);
                self.chars = MAX_MESSAGE_LENGTH;
                self.truncated = true;
            }
        }
        Ok(())
    }
}

/// Outcome of one report.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReportSummary {
    /// Leaked blocks reported.
    pub leaks: usize,
    /// Blocks owned by leakwatch which were still live: tracked by mistake or never released.
    pub internal: usize,
    /// Unreported ledger entries whose block was in none of the heaps.
    pub missing: usize,
    /// Live blocks allocated while attached that never reached the ledger.
    pub untracked: usize,
}

impl ReportSummary {
    /// No leak and no internal error.
    pub fn is_clean(&self) -> bool {
        self.leaks == 0 && self.internal == 0
    }
}

/// How a report renders call stacks and data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportOptions {
    pub max_data_dump: usize,
    pub show_internal_frames: bool,
}

/// Formats leaks into a [`ReportSink`].
pub struct Reporter<'a> {
    sink: &'a mut ReportSink,
    symbols: &'a SymbolCache,
    options: ReportOptions,
}

impl<'a> Reporter<'a> {
    pub fn new(sink: &'a mut ReportSink, symbols: &'a SymbolCache, options: ReportOptions) -> Self {
        Self {
            sink,
            symbols,
            options,
        }
    }

    /// Emits one formatted message.
    pub fn message(&mut self, args: fmt::Arguments<'_>) {
        let mut message = Message::new();
        let _ = message.write_fmt(args);
        self.emit(&message);
    }

    fn emit(&mut self, message: &Message) {
        self.sink.emit(message.as_str());
        if message.is_truncated() {
            self.sink.emit("\n");
        }
    }

    /// Reports every live block in `blocks` that still has an unreported ledger entry.
    ///
    /// Blocks are expected most recent first. Blocks allocated before `since` are never counted
    /// as untracked.
    pub fn report(&mut self, ledger: &Ledger, blocks: &[BlockInfo], since: RequestId) -> ReportSummary {
        let mut summary = ReportSummary::default();
        let mut seen = HashSet::with_capacity(blocks.len());

        for block in blocks {
            let Some(entry) = ledger.get(block.request) else {
                if block.block_use == BlockUse::Normal && block.request > since {
                    summary.untracked += 1;
                }
                continue;
            };
            seen.insert(block.request);

            if block.block_use == BlockUse::Internal {
                summary.internal += 1;
                self.message(format_args!(
                    "ERROR: leakwatch: Detected a memory leak internal to the leak detector!\n"
                ));
                self.report_block(block, &entry, false);
                continue;
            }
            if entry.is_reported() {
                continue;
            }
            if summary.leaks == 0 {
                self.message(format_args!("WARNING: Detected memory leaks!\n"));
            }
            summary.leaks += 1;
            self.report_block(block, &entry, true);
        }

        summary.missing = ledger
            .entries()
            .iter()
            .filter(|(request, entry)| !entry.is_reported() && !seen.contains(request))
            .count();
        if summary.missing > 0 {
            self.message(format_args!(
                "WARNING: leakwatch: {} tracked allocation(s) are missing from the heap.\n",
                summary.missing
            ));
        }
        if summary.untracked > 0 {
            self.message(format_args!(
                "WARNING: leakwatch: {} live allocation(s) were made without being tracked.\n",
                summary.untracked
            ));
        }

        match summary.leaks {
            0 => self.message(format_args!("No memory leaks detected.\n")),
            1 => self.message(format_args!("Detected 1 memory leak.\n")),
            n => self.message(format_args!("Detected {n} memory leaks.\n")),
        }
        self.sink.flush();

        summary
    }

    /// Warns about every live internal block in `blocks` allocated after `since`; returns how
    /// many there are.
    pub fn internal_leaks(&mut self, blocks: &[BlockInfo], since: RequestId) -> usize {
        let mut count = 0;
        for block in blocks
            .iter()
            .filter(|block| block.block_use == BlockUse::Internal && block.request > since)
        {
            count += 1;
            self.message(format_args!(
                "ERROR: leakwatch: Detected a memory leak internal to the leak detector!\n"
            ));
            self.block_header(block);
        }
        if count > 0 {
            self.sink.flush();
        }
        count
    }

    fn block_header(&mut self, block: &BlockInfo) {
        self.message(format_args!(
            "---------- Block {} at 0x{:0width$X}: {} bytes ----------\n",
            block.request,
            block.address,
            block.size,
            width = ADDRESS_WIDTH
        ));
    }

    fn report_block(&mut self, block: &BlockInfo, entry: &LedgerEntry, with_data: bool) {
        self.block_header(block);
        let call_stack = self.format_call_stack(&entry.call_stack);
        self.emit(&call_stack);

        let dump_len = block.size.min(self.options.max_data_dump);
        if with_data && dump_len > 0 {
            // SAFETY: the block is live and at least `block.size` bytes long
            let data = unsafe { std::slice::from_raw_parts(block.address as *const u8, dump_len) };
            self.message(format_args!("  Data:\n"));
            let lines = match self.sink.encoding() {
                Encoding::Ascii => dump::hex_ascii(data),
                Encoding::Unicode => dump::hex_unicode(data),
            };
            for line in lines {
                self.sink.emit(&line);
            }
        }
        self.message(format_args!("\n"));
    }

    /// Formats the call stack section of one block as a single message.
    pub fn format_call_stack(&self, call_stack: &CallStack) -> Message {
        let mut message = Message::new();
        let _ = message.write_str("  Call Stack:\n");

        for &pc in call_stack.frames() {
            let frame = self.symbols.resolve(pc);
            if frame.symbols.is_empty() {
                let _ = writeln!(
                    message,
                    "    0x{pc:0width$X} (unavailable): {UNAVAILABLE_FUNCTION}",
                    width = ADDRESS_WIDTH
                );
                continue;
            }
            for symbol in &frame.symbols {
                let internal = symbol.file.as_deref().is_some_and(demangle::is_internal_file)
                    || symbol.name.as_deref().is_some_and(demangle::is_internal_function);
                if internal && !self.options.show_internal_frames {
                    continue;
                }
                let function = symbol.name.as_deref().unwrap_or(UNAVAILABLE_FUNCTION);
                match &symbol.file {
                    Some(file) => {
                        let _ = writeln!(
                            message,
                            "    {} ({}): {function}",
                            file.display(),
                            symbol.line.unwrap_or(0)
                        );
                    }
                    None => {
                        let _ = writeln!(
                            message,
                            "    0x{pc:0width$X} (unavailable): {function}",
                            width = ADDRESS_WIDTH
                        );
                    }
                }
            }
        }

        message
    }

    /// Resolves every frame of every unreported entry; returns how many frames have no function
    /// name.
    pub fn resolve_callstacks(symbols: &SymbolCache, ledger: &Ledger) -> usize {
        ledger
            .entries()
            .iter()
            .filter(|(_, entry)| !entry.is_reported())
            .flat_map(|(_, entry)| entry.call_stack.frames().to_vec())
            .filter(|pc| !symbols.resolve(*pc).has_function_name())
            .count()
    }
}
