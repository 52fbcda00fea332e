//! Detector configuration.
//!
//! A [`Config`] is built in code with the `with_*` methods, or read from the environment with
//! [`Config::from_env`]:
//!
//! - `LEAKWATCH_MAX_TRACE_FRAMES`: frames captured per allocation (default 64, at most 1024)
//! - `LEAKWATCH_MAX_DATA_DUMP`: bytes of each leaked block dumped in the report (default 256)
//! - `LEAKWATCH_SHOW_INTERNAL_FRAMES`: keep allocator and leakwatch frames in call stacks
//! - `LEAKWATCH_IGNORE_FUNCTIONS`: comma separated functions whose allocations are ignored
//! - `LEAKWATCH_REPORT_FILE`: file the report is written to
//! - `LEAKWATCH_REPORT_TO_DEBUGGER`: also write the report to standard error (default on)
//! - `LEAKWATCH_REPORT_ENCODING`: `ascii` (UTF-8) or `unicode` (UTF-16LE)

use std::path::PathBuf;

use crate::callstack::MAX_TRACE_FRAMES_LIMIT;

pub const DEFAULT_MAX_TRACE_FRAMES: usize = 64;
pub const DEFAULT_MAX_DATA_DUMP: usize = 256;

const MAX_TRACE_FRAMES_VAR: &str = "LEAKWATCH_MAX_TRACE_FRAMES";
const MAX_DATA_DUMP_VAR: &str = "LEAKWATCH_MAX_DATA_DUMP";
const SHOW_INTERNAL_FRAMES_VAR: &str = "LEAKWATCH_SHOW_INTERNAL_FRAMES";
const IGNORE_FUNCTIONS_VAR: &str = "LEAKWATCH_IGNORE_FUNCTIONS";
const REPORT_FILE_VAR: &str = "LEAKWATCH_REPORT_FILE";
const REPORT_TO_DEBUGGER_VAR: &str = "LEAKWATCH_REPORT_TO_DEBUGGER";
const REPORT_ENCODING_VAR: &str = "LEAKWATCH_REPORT_ENCODING";

/// Text encoding of the report.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// Narrow text, written as UTF-8. Data dumps show bytes as ASCII.
    #[default]
    Ascii,
    /// Wide text, written as UTF-16LE. Data dumps show 16-bit units as characters.
    Unicode,
}

impl Encoding {
    /// Parses an encoding name (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ascii" | "ansi" | "narrow" | "utf8" | "utf-8" => Some(Self::Ascii),
            "unicode" | "wide" | "utf16" | "utf-16" => Some(Self::Unicode),
            _ => None,
        }
    }
}

/// Where the report goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportConfig {
    pub file: Option<PathBuf>,
    /// Write to the debugger channel, which is standard error.
    pub to_debugger: bool,
    pub encoding: Encoding,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            file: None,
            to_debugger: true,
            encoding: Encoding::Ascii,
        }
    }
}

/// Leak detector options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub max_trace_frames: usize,
    pub max_data_dump: usize,
    pub show_internal_frames: bool,
    pub ignore_functions: Vec<String>,
    pub report: ReportConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_trace_frames: DEFAULT_MAX_TRACE_FRAMES,
            max_data_dump: DEFAULT_MAX_DATA_DUMP,
            show_internal_frames: false,
            ignore_functions: Vec::new(),
            report: ReportConfig::default(),
        }
    }
}

impl Config {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration from `lookup`, which maps a variable name to its value.
    ///
    /// Unset variables keep their default; malformed ones are logged and keep their default too.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(frames) = parse_var(&lookup, MAX_TRACE_FRAMES_VAR, |v| v.parse().ok()) {
            config = config.with_max_trace_frames(frames);
        }
        if let Some(bytes) = parse_var(&lookup, MAX_DATA_DUMP_VAR, |v| v.parse().ok()) {
            config.max_data_dump = bytes;
        }
        if let Some(show) = parse_var(&lookup, SHOW_INTERNAL_FRAMES_VAR, parse_bool) {
            config.show_internal_frames = show;
        }
        if let Some(functions) = lookup(IGNORE_FUNCTIONS_VAR) {
            config.ignore_functions = functions
                .split(',')
                .map(str::trim)
                .filter(|function| !function.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(file) = lookup(REPORT_FILE_VAR).filter(|file| !file.trim().is_empty()) {
            config.report.file = Some(PathBuf::from(file.trim()));
        }
        if let Some(to_debugger) = parse_var(&lookup, REPORT_TO_DEBUGGER_VAR, parse_bool) {
            config.report.to_debugger = to_debugger;
        }
        if let Some(encoding) = parse_var(&lookup, REPORT_ENCODING_VAR, Encoding::from_str_loose)
        {
            config.report.encoding = encoding;
        }

        config
    }

    /// Sets the number of frames captured per allocation, capped at
    /// [`MAX_TRACE_FRAMES_LIMIT`].
    #[must_use]
    pub fn with_max_trace_frames(mut self, frames: usize) -> Self {
        self.max_trace_frames = frames.min(MAX_TRACE_FRAMES_LIMIT);
        self
    }

    /// Sets how many bytes of each leaked block are dumped; `0` disables the dump.
    #[must_use]
    pub fn with_max_data_dump(mut self, bytes: usize) -> Self {
        self.max_data_dump = bytes;
        self
    }

    #[must_use]
    pub fn with_show_internal_frames(mut self, show: bool) -> Self {
        self.show_internal_frames = show;
        self
    }

    /// Ignores every allocation made by `function`, matched by full path or trailing path.
    #[must_use]
    pub fn ignore_function(mut self, function: impl Into<String>) -> Self {
        self.ignore_functions.push(function.into());
        self
    }

    #[must_use]
    pub fn with_report_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.report.file = Some(file.into());
        self
    }

    #[must_use]
    pub fn with_report_to_debugger(mut self, to_debugger: bool) -> Self {
        self.report.to_debugger = to_debugger;
        self
    }

    #[must_use]
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.report.encoding = encoding;
        self
    }
}

fn parse_var<F, T, P>(lookup: &F, key: &str, parse: P) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    P: FnOnce(&str) -> Option<T>,
{
    let raw = lookup(key)?;
    let parsed = parse(raw.trim());
    if parsed.is_none() {
        tracing::warn!(key, value = %raw, "ignoring malformed leakwatch option");
    }
    parsed
}

/// Parses a boolean option value (case-insensitive).
#[must_use]
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}
