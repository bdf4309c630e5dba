//! Native library backend for .so/.dylib/.dll files.
//!
//! Plugins are expected to be built with the same toolchain and the same
//! version of this crate as the host; the exported ABI version is checked
//! before the entry point is resolved.

use std::path::{Path, PathBuf};

use libloading::{Library, Symbol};

use super::{
    is_native_library, AbiVersionFn, LibraryBackend, LibraryHandle, PluginInitFn, Registrar,
    ABI_VERSION, ABI_VERSION_SYMBOL, ENTRY_SYMBOL,
};
use crate::config::ClassLoaderConfig;
use crate::error::{ClassLoadError, Result};

/// Loader for native shared libraries, backed by `libloading`.
#[derive(Debug, Clone)]
pub struct NativeLibraryBackend {
    entry_symbol: String,
    verify_abi: bool,
}

impl NativeLibraryBackend {
    pub fn new() -> Self {
        Self {
            entry_symbol: ENTRY_SYMBOL.to_string(),
            verify_abi: true,
        }
    }

    pub fn from_config(config: &ClassLoaderConfig) -> Self {
        Self {
            entry_symbol: config.entry_symbol.clone(),
            verify_abi: config.verify_abi,
        }
    }

    pub fn entry_symbol(&self) -> &str {
        &self.entry_symbol
    }

    fn check_abi(&self, path: &Path, library: &Library) -> Result<()> {
        // SAFETY: the symbol is declared by `export_plugin!` with this signature.
        let version: Symbol<AbiVersionFn> = unsafe {
            library.get(ABI_VERSION_SYMBOL.as_bytes()).map_err(|_| {
                ClassLoadError::SymbolMissing {
                    path: path.to_path_buf(),
                    symbol: ABI_VERSION_SYMBOL.to_string(),
                }
            })?
        };
        let found = unsafe { version() };
        if found != ABI_VERSION {
            return Err(ClassLoadError::AbiMismatch {
                expected: ABI_VERSION,
                found,
            });
        }
        Ok(())
    }
}

impl Default for NativeLibraryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LibraryBackend for NativeLibraryBackend {
    fn open(&self, path: &Path) -> Result<Box<dyn LibraryHandle>> {
        if !path.exists() {
            return Err(ClassLoadError::LibraryNotFound(path.to_path_buf()));
        }

        if !is_native_library(path) {
            return Err(ClassLoadError::InvalidLibrary(format!(
                "{} is not a native library file",
                path.display()
            )));
        }

        // SAFETY: loading a library runs its static constructors; plugins are
        // trusted code built against this crate.
        let library = unsafe {
            Library::new(path).map_err(|e| ClassLoadError::LoadFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        };

        if self.verify_abi {
            self.check_abi(path, &library)?;
        }

        tracing::debug!("Opened native library: {}", path.display());
        Ok(Box::new(NativeLibrary {
            path: path.to_path_buf(),
            library,
            entry_symbol: self.entry_symbol.clone(),
        }))
    }
}

/// An open native library. Closed when dropped.
struct NativeLibrary {
    path: PathBuf,
    library: Library,
    entry_symbol: String,
}

impl LibraryHandle for NativeLibrary {
    fn path(&self) -> &Path {
        &self.path
    }

    fn initialize(&mut self, registrar: &Registrar<'_>) -> Result<()> {
        // SAFETY: the entry point is declared by `export_plugin!` with this signature.
        let init: Symbol<PluginInitFn> = unsafe {
            self.library
                .get(self.entry_symbol.as_bytes())
                .map_err(|_| ClassLoadError::SymbolMissing {
                    path: self.path.clone(),
                    symbol: self.entry_symbol.clone(),
                })?
        };

        let status = unsafe { init(registrar as *const Registrar<'_>) };
        match status {
            0 => Ok(()),
            1 => Err(ClassLoadError::InitFailed {
                path: self.path.clone(),
                reason: "initializer returned an error".to_string(),
            }),
            2 => Err(ClassLoadError::InitFailed {
                path: self.path.clone(),
                reason: "initializer panicked".to_string(),
            }),
            other => Err(ClassLoadError::InitFailed {
                path: self.path.clone(),
                reason: format!("initializer returned status {}", other),
            }),
        }
    }
}

impl Drop for NativeLibrary {
    fn drop(&mut self) {
        tracing::debug!("Closing native library: {}", self.path.display());
    }
}
