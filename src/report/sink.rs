use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{Encoding, ReportConfig};
use crate::error::Result;

/// Destination of report messages: a file (or any writer) and/or the debugger channel.
///
/// The file receives the text in the configured [`Encoding`]; the debugger channel, which is
/// standard error, always receives UTF-8.
pub struct ReportSink {
    file: Option<Box<dyn Write + Send>>,
    debugger: Option<Box<dyn Write + Send>>,
    encoding: Encoding,
    failed: bool,
}

impl ReportSink {
    /// Opens the destinations named by `config`. The report file is truncated.
    pub fn from_config(config: &ReportConfig) -> Result<Self> {
        let file = match &config.file {
            Some(path) => Some(Box::new(BufWriter::new(File::create(path)?)) as Box<dyn Write + Send>),
            None => None,
        };
        Ok(Self {
            file,
            debugger: config.to_debugger.then(debugger_channel),
            encoding: config.encoding,
            failed: false,
        })
    }

    /// Reports to the debugger channel only.
    pub fn debugger(encoding: Encoding) -> Self {
        Self {
            file: None,
            debugger: Some(debugger_channel()),
            encoding,
            failed: false,
        }
    }

    /// Reports to `writer`, as if it were the report file.
    pub fn writer(writer: impl Write + Send + 'static, encoding: Encoding) -> Self {
        Self {
            file: Some(Box::new(writer)),
            debugger: None,
            encoding,
            failed: false,
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Writes one message to every destination.
    pub fn emit(&mut self, message: &str) {
        let mut result = Ok(());
        if let Some(file) = self.file.as_mut() {
            result = match self.encoding {
                Encoding::Ascii => file.write_all(message.as_bytes()),
                Encoding::Unicode => {
                    let wide: Vec<u8> = message.encode_utf16().flat_map(u16::to_le_bytes).collect();
                    file.write_all(&wide)
                }
            };
        }
        if let Some(debugger) = self.debugger.as_mut() {
            result = result.and(debugger.write_all(message.as_bytes()));
        }
        self.note(result);
    }

    pub fn flush(&mut self) {
        let mut result = Ok(());
        for writer in [self.file.as_mut(), self.debugger.as_mut()].into_iter().flatten() {
            result = result.and(writer.flush());
        }
        self.note(result);
    }

    fn note(&mut self, result: io::Result<()>) {
        if let Err(err) = result {
            if !self.failed {
                tracing::warn!(%err, "failed to write the leak report");
            }
            self.failed = true;
        }
    }
}

fn debugger_channel() -> Box<dyn Write + Send> {
    Box::new(io::stderr())
}

/// A cloneable in-memory report destination.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    /// The collected report, decoded as UTF-8.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
