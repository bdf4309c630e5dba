//! Error types for library loading and class registration.
//!
//! Looking up a class that does not exist, or that the requesting loader does
//! not own, is not an error: those lookups return `None`.

use std::path::PathBuf;

use crate::factory::LoaderRef;

/// Result type for class loader operations.
pub type Result<T> = std::result::Result<T, ClassLoadError>;

/// Class loader error types.
#[derive(Debug, thiserror::Error)]
pub enum ClassLoadError {
    /// The library file does not exist.
    #[error("Library not found: {0}")]
    LibraryNotFound(PathBuf),

    /// The file is not something the backend can load.
    #[error("Invalid library: {0}")]
    InvalidLibrary(String),

    /// The dynamic-load primitive failed to open the library.
    #[error("Failed to load library {path}: {reason}")]
    LoadFailed { path: PathBuf, reason: String },

    /// A required export is missing from the library.
    #[error("Missing symbol `{symbol}` in {path}")]
    SymbolMissing { path: PathBuf, symbol: String },

    /// The library was built against a different plugin ABI.
    #[error("Plugin ABI mismatch: expected {expected}, found {found}")]
    AbiMismatch { expected: u32, found: u32 },

    /// The library opened but its initializer reported a failure.
    #[error("Library initializer failed for {path}: {reason}")]
    InitFailed { path: PathBuf, reason: String },

    /// `register` was called while no library load was in progress.
    #[error("Class {0} registered outside of an active library load")]
    NoActiveLoad(String),

    /// `register` named a different loader than the one currently loading.
    #[error("Registration on behalf of {requested} while {active} is loading")]
    LoaderMismatch {
        requested: LoaderRef,
        active: LoaderRef,
    },

    /// Instances created from the loader's libraries are still alive.
    #[error("{count} instance(s) created by {loader} are still alive")]
    InstancesAlive { loader: LoaderRef, count: usize },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ClassLoadError {
    fn from(err: serde_json::Error) -> Self {
        ClassLoadError::Config(err.to_string())
    }
}
