//! Host-visible class loaders.
//!
//! A [`ClassLoader`] is one plugin-loading context. Libraries loaded through
//! it register their classes under its [`LoaderRef`], and only it can create
//! instances of them. "Not registered" and "not owned by this loader" are
//! reported the same way: the class is simply unavailable.

use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::ClassLoaderConfig;
use crate::error::{ClassLoadError, Result};
use crate::factory::LoaderRef;
use crate::interface::Interface;
use crate::library;
use crate::manager::LoaderManager;
use crate::registry::LoadedLibrary;

/// A plugin-loading context.
///
/// Dropping the loader unloads every library it loaded, unless instances it
/// created are still alive.
pub struct ClassLoader {
    id: LoaderRef,
    manager: Arc<LoaderManager>,
    config: ClassLoaderConfig,
    live_instances: Arc<AtomicUsize>,
}

impl ClassLoader {
    pub fn new(manager: Arc<LoaderManager>) -> Self {
        Self::with_config(manager, ClassLoaderConfig::default())
    }

    pub fn with_config(manager: Arc<LoaderManager>, config: ClassLoaderConfig) -> Self {
        let id = LoaderRef::mint();
        tracing::debug!("Created class loader {}", id);
        Self {
            id,
            manager,
            config,
            live_instances: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A loader for native libraries on the process-wide registry.
    pub fn native(config: ClassLoaderConfig) -> Self {
        let manager = Arc::new(LoaderManager::native(&config));
        Self::with_config(manager, config)
    }

    pub fn id(&self) -> LoaderRef {
        self.id
    }

    pub fn config(&self) -> &ClassLoaderConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<LoaderManager> {
        &self.manager
    }

    /// Load a library, resolving bare names through the search paths.
    ///
    /// Returns the path the library was loaded from.
    pub fn load_library(&self, library: impl AsRef<Path>) -> Result<PathBuf> {
        let path = self.config.resolve(library);
        self.manager.load(&path, self.id)?;
        Ok(path)
    }

    /// Unload a library this loader loaded.
    ///
    /// Refused while instances created by this loader are alive, since their
    /// code may live in the library. Unloading a library this loader never
    /// loaded does nothing.
    pub fn unload_library(&self, library: impl AsRef<Path>) -> Result<()> {
        let path = self.config.resolve(library);
        let _state = self.manager.registry().lock();

        if !self.manager.is_loaded_by(&path, self.id) {
            tracing::debug!("{} has not loaded {}", self.id, path.display());
            return Ok(());
        }

        let live = self.live_instances();
        if live > 0 {
            tracing::warn!(
                "Refusing to unload {} for {}: {} instance(s) still alive",
                path.display(),
                self.id,
                live
            );
            return Err(ClassLoadError::InstancesAlive {
                loader: self.id,
                count: live,
            });
        }

        self.manager.unload(&path, self.id);
        Ok(())
    }

    /// Unload every library this loader loaded.
    pub fn unload_all(&self) -> Result<()> {
        let _state = self.manager.registry().lock();
        let live = self.live_instances();
        if live > 0 {
            return Err(ClassLoadError::InstancesAlive {
                loader: self.id,
                count: live,
            });
        }
        self.manager.unload_all(self.id);
        Ok(())
    }

    /// Load every native library in `dir`.
    ///
    /// Libraries that fail to load are logged and skipped. Returns the paths
    /// that loaded.
    pub fn load_directory(&self, dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(ClassLoadError::LibraryNotFound(dir.to_path_buf()));
        }

        let mut loaded = Vec::new();
        for path in library::discover(dir) {
            match self.manager.load(&path, self.id) {
                Ok(()) => loaded.push(path),
                Err(e) => tracing::warn!("Skipping {}: {}", path.display(), e),
            }
        }

        tracing::info!(
            "Loaded {} libraries from {} for {}",
            loaded.len(),
            dir.display(),
            self.id
        );
        Ok(loaded)
    }

    /// Create an instance of `class_name` behind interface `B`.
    ///
    /// Returns `None` when the class is not available to this loader.
    pub fn create_instance<B: Interface + ?Sized>(&self, class_name: &str) -> Option<Instance<B>> {
        // Counted before the lookup so a concurrent unload sees it.
        self.live_instances.fetch_add(1, Ordering::SeqCst);
        match self.manager.registry().create::<B>(class_name, self.id) {
            Some(value) => Some(Instance {
                value: ManuallyDrop::new(value),
                live: Arc::clone(&self.live_instances),
            }),
            None => {
                self.live_instances.fetch_sub(1, Ordering::SeqCst);
                None
            }
        }
    }

    /// Classes under interface `B` this loader can create.
    pub fn valid_class_names<B: Interface + ?Sized>(&self) -> Vec<String> {
        self.manager.registry().list_owned::<B>(self.id)
    }

    pub fn is_class_valid<B: Interface + ?Sized>(&self, class_name: &str) -> bool {
        self.manager.registry().is_class_valid::<B>(class_name, self.id)
    }

    pub fn loaded_libraries(&self) -> Vec<LoadedLibrary> {
        self.manager.loaded_libraries(self.id)
    }

    pub fn is_library_loaded(&self, library: impl AsRef<Path>) -> bool {
        let path = self.config.resolve(library);
        self.manager.is_loaded_by(&path, self.id)
    }

    /// Instances created by this loader that have not been dropped yet.
    pub fn live_instances(&self) -> usize {
        self.live_instances.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ClassLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassLoader")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("live_instances", &self.live_instances())
            .finish_non_exhaustive()
    }
}

impl Drop for ClassLoader {
    fn drop(&mut self) {
        if let Err(e) = self.unload_all() {
            tracing::warn!("Leaving libraries of {} loaded: {}", self.id, e);
        }
    }
}

/// An object created through a [`ClassLoader`].
///
/// Keeps the loader's live-instance count up to date.
pub struct Instance<B: ?Sized> {
    value: ManuallyDrop<Box<B>>,
    live: Arc<AtomicUsize>,
}

impl<B: ?Sized> Deref for Instance<B> {
    type Target = B;

    fn deref(&self) -> &B {
        &self.value
    }
}

impl<B: ?Sized> DerefMut for Instance<B> {
    fn deref_mut(&mut self) -> &mut B {
        &mut self.value
    }
}

impl<B: ?Sized> Drop for Instance<B> {
    fn drop(&mut self) {
        // The destructor may be library code; release the count only after it ran.
        // SAFETY: `value` is never used again.
        unsafe { ManuallyDrop::drop(&mut self.value) };
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<B: ?Sized + fmt::Debug> fmt::Debug for Instance<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self.value, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declare_interface;
    use crate::library::StaticLibraryBackend;
    use crate::registry::Registry;

    trait Greeter {
        fn greet(&self) -> String;
    }

    declare_interface!(dyn Greeter, "test.loader.Greeter");

    struct English;

    impl Greeter for English {
        fn greet(&self) -> String {
            "hello".to_string()
        }
    }

    fn manager() -> Arc<LoaderManager> {
        let backend = StaticLibraryBackend::new().with_library("/plugins/libgreet.so", |r| {
            r.register::<dyn Greeter, _>("English", || Box::new(English) as Box<dyn Greeter>)
        });
        Arc::new(LoaderManager::with_registry(
            Arc::new(Registry::new()),
            Arc::new(backend),
        ))
    }

    #[test]
    fn test_instance_counting() {
        let loader = ClassLoader::new(manager());
        loader.load_library("/plugins/libgreet.so").unwrap();

        let a = loader.create_instance::<dyn Greeter>("English").unwrap();
        let b = loader.create_instance::<dyn Greeter>("English").unwrap();
        assert_eq!(a.greet(), "hello");
        assert_eq!(loader.live_instances(), 2);

        assert!(loader.create_instance::<dyn Greeter>("French").is_none());
        assert_eq!(loader.live_instances(), 2);

        drop(a);
        drop(b);
        assert_eq!(loader.live_instances(), 0);
    }

    #[test]
    fn test_unload_refused_while_instances_alive() {
        let loader = ClassLoader::new(manager());
        loader.load_library("/plugins/libgreet.so").unwrap();

        let instance = loader.create_instance::<dyn Greeter>("English").unwrap();
        let err = loader.unload_library("/plugins/libgreet.so").unwrap_err();
        assert!(matches!(err, ClassLoadError::InstancesAlive { count: 1, .. }));
        assert!(loader.is_library_loaded("/plugins/libgreet.so"));

        drop(instance);
        loader.unload_library("/plugins/libgreet.so").unwrap();
        assert!(!loader.is_library_loaded("/plugins/libgreet.so"));
        assert!(!loader.is_class_valid::<dyn Greeter>("English"));
    }

    #[test]
    fn test_drop_unloads_libraries() {
        let manager = manager();
        let loader = ClassLoader::new(Arc::clone(&manager));
        loader.load_library("/plugins/libgreet.so").unwrap();
        assert!(manager.is_loaded(Path::new("/plugins/libgreet.so")));

        drop(loader);
        assert!(!manager.is_loaded(Path::new("/plugins/libgreet.so")));
        assert!(manager.registry().all_factories().is_empty());
    }

    #[test]
    fn test_load_directory_requires_directory() {
        let loader = ClassLoader::new(manager());
        let err = loader.load_directory("/nonexistent/plugins").unwrap_err();
        assert!(matches!(err, ClassLoadError::LibraryNotFound(_)));
    }
}
