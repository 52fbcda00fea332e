use thiserror::Error;

/// Result type returned by fallible `leakwatch` operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while setting up or tearing down leak detection.
///
/// None of these abort tracking: the detector reports them and keeps going in a degraded mode.
#[derive(Debug, Error)]
pub enum Error {
    /// The module whose imports should be patched is not loaded in this process.
    #[error("module `{0}` is not loaded")]
    ModuleNotFound(String),
    /// The exporting module does not export the named symbol.
    #[error("module `{module}` does not export `{symbol}`")]
    ExportNotFound { module: String, symbol: String },
    /// The target module has no import slot bound to the named symbol.
    #[error("module `{module}` does not import `{symbol}`")]
    ImportNotFound { module: String, symbol: String },
    /// Changing the protection of an import slot failed.
    #[error("failed to change the protection of the import slot at {address:#x}: {source}")]
    Protect {
        address: usize,
        #[source]
        source: std::io::Error,
    },
    /// The symbol handler could not be initialized; stack traces will be incomplete.
    #[error("the symbol handler failed to initialize: {0}")]
    SymbolsUnavailable(String),
    /// The requested mechanism is not available on this platform.
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
