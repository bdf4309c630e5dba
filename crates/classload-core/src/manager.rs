//! Library load/unload lifecycle.
//!
//! The manager drives the dynamic-load primitive and keeps the registry's
//! bookkeeping in step with it: which loader loaded which library, which
//! classes each load claimed, and which libraries those classes came from.
//!
//! A library's initializer runs only when the library is first opened. A
//! second loader loading the same path attaches to the factories that came
//! from it instead of reopening it.
//!
//! A load that claims a class first registered by another library depends on
//! that library. An open library stays open while any loader's record loads
//! it or depends on it.
//!
//! `load` holds the registry lock for its whole duration, including the
//! plugin's initializer. Initializers must not block indefinitely.

use std::iter;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;

use crate::config::ClassLoaderConfig;
use crate::error::{ClassLoadError, Result};
use crate::context::LoadFrame;
use crate::factory::{Factory, FactoryKey, LoaderRef};
use crate::library::{LibraryBackend, LoadHost, NativeLibraryBackend, Registrar};
use crate::registry::{LoadedLibrary, OpenLibrary, Registry};

/// Loads and unloads libraries on behalf of loaders.
pub struct LoaderManager {
    registry: Arc<Registry>,
    backend: Arc<dyn LibraryBackend>,
}

impl LoaderManager {
    /// Create a manager on the process-wide registry.
    pub fn new(backend: Arc<dyn LibraryBackend>) -> Self {
        Self::with_registry(Registry::global(), backend)
    }

    pub fn with_registry(registry: Arc<Registry>, backend: Arc<dyn LibraryBackend>) -> Self {
        Self { registry, backend }
    }

    /// Native libraries on the process-wide registry.
    pub fn native(config: &ClassLoaderConfig) -> Self {
        Self::new(Arc::new(NativeLibraryBackend::from_config(config)))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Whether any loader currently has `path` loaded.
    pub fn is_loaded(&self, path: &Path) -> bool {
        let state = self.registry.lock();
        let loaded = state.borrow().libraries.contains_key(path);
        loaded
    }

    /// Whether `loader` currently has `path` loaded.
    pub fn is_loaded_by(&self, path: &Path, loader: LoaderRef) -> bool {
        let state = self.registry.lock();
        let loaded = state
            .borrow()
            .loaded
            .get(&loader)
            .is_some_and(|libraries| libraries.iter().any(|lib| lib.path == path));
        loaded
    }

    /// Libraries `loader` has loaded, in load order.
    pub fn loaded_libraries(&self, loader: LoaderRef) -> Vec<LoadedLibrary> {
        let state = self.registry.lock();
        let libraries = state
            .borrow()
            .loaded
            .get(&loader)
            .cloned()
            .unwrap_or_default();
        libraries
    }

    /// Every library path currently open.
    pub fn open_libraries(&self) -> Vec<PathBuf> {
        let state = self.registry.lock();
        let mut paths: Vec<PathBuf> = state.borrow().libraries.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Load `path` for `loader`.
    ///
    /// Loading a path the loader already has is a no-op. If the library
    /// fails to open, nothing is registered. If it opens but its initializer
    /// fails or panics, the claims that load added are released again before
    /// the library is closed. Claims the loader already held are kept.
    pub fn load(&self, path: &Path, loader: LoaderRef) -> Result<()> {
        let state = self.registry.lock();

        if self.is_loaded_by(path, loader) {
            tracing::debug!("{} already loaded by {}", path.display(), loader);
            return Ok(());
        }

        {
            let state = state.borrow();
            if state.context.is_loading(path) {
                return Err(ClassLoadError::LoadFailed {
                    path: path.to_path_buf(),
                    reason: "library is already being loaded further up the stack".to_string(),
                });
            }
        }

        if self.attach(path, loader) {
            return Ok(());
        }

        let mut handle = self.backend.open(path).map_err(|e| {
            tracing::warn!("Failed to open {}: {}", path.display(), e);
            e
        })?;

        let (outcome, frame) = self.registry.with_load_context(path, loader, || {
            let registrar = Registrar::new(self, path, loader);
            panic::catch_unwind(AssertUnwindSafe(|| handle.initialize(&registrar))).unwrap_or_else(
                |_| {
                    Err(ClassLoadError::InitFailed {
                        path: path.to_path_buf(),
                        reason: "initializer panicked".to_string(),
                    })
                },
            )
        });

        if let Err(e) = outcome {
            let released = self.exclusive_claims(&frame.claimed, loader);
            let reclaimed = self.registry.release_ownership(&released, loader);
            tracing::warn!(
                "Initializer of {} failed for {}: {} (rolled back {} claim(s))",
                path.display(),
                loader,
                e,
                released.len()
            );
            tracing::debug!("Reclaimed {} factories from {}", reclaimed.len(), path.display());
            let unused = {
                let mut state = state.borrow_mut();
                if state.is_referenced(path) {
                    // Successful loads depend on classes from `path`.
                    if state.libraries.contains_key(path) {
                        Some(handle)
                    } else {
                        state
                            .libraries
                            .insert(path.to_path_buf(), OpenLibrary { handle });
                        None
                    }
                } else {
                    let purged = state.purge_library(path);
                    if !purged.is_empty() {
                        tracing::warn!(
                            "Dropped {} factories still pointing into {}",
                            purged.len(),
                            path.display()
                        );
                    }
                    Some(handle)
                }
            };
            drop(unused);
            return Err(e);
        }

        let LoadFrame {
            registered: classes,
            dependencies,
            ..
        } = frame;
        tracing::info!(
            "Loaded {} for {} ({} classes, {} dependencies)",
            path.display(),
            loader,
            classes.len(),
            dependencies.len()
        );

        let replaced = {
            let mut state = state.borrow_mut();
            state.loaded.entry(loader).or_default().push(LoadedLibrary {
                path: path.to_path_buf(),
                classes,
                dependencies,
                loaded_at: Utc::now(),
            });
            state
                .libraries
                .insert(path.to_path_buf(), OpenLibrary { handle })
        };
        if let Some(previous) = replaced {
            tracing::debug!("Replaced earlier handle of {}", previous.handle.path().display());
            drop(previous);
        }
        Ok(())
    }

    /// Keys in `keys` that no remaining library record of `loader` lists.
    fn exclusive_claims(&self, keys: &[FactoryKey], loader: LoaderRef) -> Vec<FactoryKey> {
        let state = self.registry.lock();
        let state = state.borrow();
        keys.iter()
            .filter(|key| !state.is_recorded_for(loader, key))
            .cloned()
            .collect()
    }

    /// Attach `loader` to a library some other loader already loaded.
    ///
    /// A library that is only open because other loads depend on it may have
    /// lost factories nobody owned anymore, so it is initialized again
    /// instead.
    fn attach(&self, path: &Path, loader: LoaderRef) -> bool {
        let state = self.registry.lock();
        let mut state = state.borrow_mut();

        if !state.libraries.contains_key(path) {
            return false;
        }
        if !state.has_direct_loader(path) {
            tracing::debug!(
                "{} is only open as a dependency, initializing it again for {}",
                path.display(),
                loader
            );
            return false;
        }

        let keys = state.keys_of_library(path);
        let classes: Vec<FactoryKey> = keys
            .into_iter()
            .filter(|key| state.claim(key, loader))
            .collect();

        tracing::info!(
            "{} attached to already loaded {} ({} classes)",
            loader,
            path.display(),
            classes.len()
        );
        state.loaded.entry(loader).or_default().push(LoadedLibrary {
            path: path.to_path_buf(),
            classes,
            dependencies: Vec::new(),
            loaded_at: Utc::now(),
        });
        true
    }

    /// Unload `path` for `loader`.
    ///
    /// Releases the loader's claims on the classes it got from `path`, except
    /// those another of its loaded libraries also provides. `path` and the
    /// libraries this load depended on are closed once nothing references
    /// them. Unloading a path the loader never loaded does nothing.
    pub fn unload(&self, path: &Path, loader: LoaderRef) {
        let state = self.registry.lock();

        let record = {
            let mut state = state.borrow_mut();
            let Some(libraries) = state.loaded.get_mut(&loader) else {
                return;
            };
            let Some(index) = libraries.iter().position(|lib| lib.path == path) else {
                tracing::debug!("{} has not loaded {}", loader, path.display());
                return;
            };
            let record = libraries.remove(index);
            if libraries.is_empty() {
                state.loaded.remove(&loader);
            }
            record
        };

        let released = self.exclusive_claims(&record.classes, loader);
        let reclaimed = self.registry.release_ownership(&released, loader);

        let closed = state.borrow_mut().close_unreferenced(
            iter::once(path).chain(record.dependencies.iter().map(PathBuf::as_path)),
        );

        tracing::info!(
            "Unloaded {} for {} ({} factories reclaimed)",
            path.display(),
            loader,
            reclaimed.len()
        );

        for open in closed {
            tracing::info!("Closing {}", open.handle.path().display());
            drop(open);
        }
    }

    /// Unload every library `loader` has loaded, newest first.
    pub fn unload_all(&self, loader: LoaderRef) {
        let _state = self.registry.lock();
        let libraries = self.loaded_libraries(loader);
        for library in libraries.iter().rev() {
            self.unload(&library.path, loader);
        }
    }
}

impl LoadHost for LoaderManager {
    fn register_factory(&self, factory: Factory, owner: LoaderRef) -> Result<()> {
        self.registry.register(factory, owner)
    }

    fn load_library(&self, path: &Path, loader: LoaderRef) -> Result<()> {
        self.load(path, loader)
    }
}
