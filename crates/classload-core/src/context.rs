//! Load context: which loader and library are currently being loaded.
//!
//! Library loads nest (an initializer may load another library), so the
//! context is a stack of frames. It lives inside the registry state and is
//! only touched while holding the registry lock.

use std::path::{Path, PathBuf};

use crate::factory::{FactoryKey, LoaderRef};

/// One active library load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadFrame {
    /// Library being loaded.
    pub library: PathBuf,
    /// Loader performing the load.
    pub loader: LoaderRef,
    /// Classes registered or claimed by `loader` during this load.
    pub registered: Vec<FactoryKey>,
    /// Subset of `registered` that `loader` did not own before this load.
    pub claimed: Vec<FactoryKey>,
    /// Other libraries whose factories `loader` claimed during this load.
    pub dependencies: Vec<PathBuf>,
}

impl LoadFrame {
    pub fn new(library: impl Into<PathBuf>, loader: LoaderRef) -> Self {
        Self {
            library: library.into(),
            loader,
            registered: Vec::new(),
            claimed: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, key: FactoryKey, newly_claimed: bool) {
        if newly_claimed && !self.claimed.contains(&key) {
            self.claimed.push(key.clone());
        }
        if !self.registered.contains(&key) {
            self.registered.push(key);
        }
    }

    pub(crate) fn record_dependency(&mut self, library: &Path) {
        if library != self.library && !self.dependencies.iter().any(|dep| dep == library) {
            self.dependencies.push(library.to_path_buf());
        }
    }
}

/// Stack of active library loads.
#[derive(Debug, Default)]
pub struct LoadContext {
    frames: Vec<LoadFrame>,
}

impl LoadContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: LoadFrame) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Option<LoadFrame> {
        self.frames.pop()
    }

    /// Innermost active load.
    pub fn current(&self) -> Option<&LoadFrame> {
        self.frames.last()
    }

    pub(crate) fn current_mut(&mut self) -> Option<&mut LoadFrame> {
        self.frames.last_mut()
    }

    pub fn current_loading_library(&self) -> Option<&Path> {
        self.current().map(|frame| frame.library.as_path())
    }

    pub fn current_active_loader(&self) -> Option<LoaderRef> {
        self.current().map(|frame| frame.loader)
    }

    /// Whether `library` is being loaded anywhere on the stack.
    pub fn is_loading(&self, library: &Path) -> bool {
        self.frames.iter().any(|frame| frame.library == library)
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_active(&self) -> bool {
        !self.frames.is_empty()
    }
}
