//! In-process libraries.
//!
//! Statically linked plugins register themselves through the same
//! [`Registrar`] as native ones. Each "library" is a path mapped to an
//! initializer function; opening it never touches the filesystem.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{LibraryBackend, LibraryHandle, Registrar};
use crate::error::{ClassLoadError, Result};

type InitFn = Arc<dyn Fn(&Registrar<'_>) -> Result<()> + Send + Sync>;

/// Backend serving libraries compiled into the host.
#[derive(Clone, Default)]
pub struct StaticLibraryBackend {
    libraries: Arc<RwLock<HashMap<PathBuf, InitFn>>>,
}

impl StaticLibraryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`StaticLibraryBackend::add_library`].
    pub fn with_library<F>(self, path: impl Into<PathBuf>, init: F) -> Self
    where
        F: Fn(&Registrar<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.add_library(path, init);
        self
    }

    /// Make `path` openable; opening it runs `init`.
    pub fn add_library<F>(&self, path: impl Into<PathBuf>, init: F)
    where
        F: Fn(&Registrar<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.libraries.write().insert(path.into(), Arc::new(init));
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.libraries.read().contains_key(path)
    }
}

impl LibraryBackend for StaticLibraryBackend {
    fn open(&self, path: &Path) -> Result<Box<dyn LibraryHandle>> {
        let init = self
            .libraries
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| ClassLoadError::LibraryNotFound(path.to_path_buf()))?;
        Ok(Box::new(StaticLibrary {
            path: path.to_path_buf(),
            init,
        }))
    }
}

struct StaticLibrary {
    path: PathBuf,
    init: InitFn,
}

impl LibraryHandle for StaticLibrary {
    fn path(&self) -> &Path {
        &self.path
    }

    fn initialize(&mut self, registrar: &Registrar<'_>) -> Result<()> {
        (self.init)(registrar)
    }
}
