//! Process-wide class registry.
//!
//! The registry owns every [`Factory`], keyed by interface id and then class
//! name. All state (factories, the load context, open libraries and the
//! per-loader library records) sits behind one reentrant lock: registration
//! runs as a side effect of loading a library, and the loader manager already
//! holds the lock while it drives that load.
//!
//! The lock wraps a `RefCell`. Borrows are kept short and are never held
//! across a call into plugin code, so a plugin initializer or constructor may
//! call back into the registry on the same thread.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use scopeguard::ScopeGuard;
use serde::{Deserialize, Serialize};

use crate::context::{LoadContext, LoadFrame};
use crate::error::{ClassLoadError, Result};
use crate::factory::{Factory, FactoryInfo, FactoryKey, LoaderRef};
use crate::interface::Interface;
use crate::library::LibraryHandle;

static GLOBAL_REGISTRY: Lazy<Arc<Registry>> = Lazy::new(|| Arc::new(Registry::new()));

/// A library one loader has loaded, and the classes it claimed doing so.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedLibrary {
    /// Library path as passed to the loader manager.
    pub path: PathBuf,
    /// Classes the loader registered or attached to while loading `path`.
    pub classes: Vec<FactoryKey>,
    /// Other libraries providing classes the loader claimed while loading
    /// `path`. They stay open as long as this record exists.
    #[serde(default)]
    pub dependencies: Vec<PathBuf>,
    /// When the load completed.
    pub loaded_at: DateTime<Utc>,
}

/// An open library handle shared by every loader that loaded it.
pub(crate) struct OpenLibrary {
    pub(crate) handle: Box<dyn LibraryHandle>,
}

enum Lookup<'a> {
    Found(&'a Factory),
    NotFound,
    NotOwned,
}

#[derive(Default)]
pub(crate) struct RegistryState {
    pub(crate) factories: HashMap<String, BTreeMap<String, Factory>>,
    pub(crate) context: LoadContext,
    pub(crate) libraries: HashMap<PathBuf, OpenLibrary>,
    pub(crate) loaded: HashMap<LoaderRef, Vec<LoadedLibrary>>,
}

impl RegistryState {
    fn lookup(&self, interface: &str, class_name: &str, requester: LoaderRef) -> Lookup<'_> {
        match self
            .factories
            .get(interface)
            .and_then(|classes| classes.get(class_name))
        {
            Some(factory) if factory.is_owned_by(requester) => Lookup::Found(factory),
            Some(_) => Lookup::NotOwned,
            None => Lookup::NotFound,
        }
    }

    /// Keys of every factory registered from `library`.
    pub(crate) fn keys_of_library(&self, library: &Path) -> Vec<FactoryKey> {
        let mut keys: Vec<FactoryKey> = self
            .factories
            .values()
            .flat_map(|classes| classes.values())
            .filter(|factory| factory.library() == library)
            .map(Factory::key)
            .collect();
        keys.sort();
        keys
    }

    /// Add `loader` to the ownership set of an existing factory.
    pub(crate) fn claim(&mut self, key: &FactoryKey, loader: LoaderRef) -> bool {
        match self
            .factories
            .get_mut(&key.interface)
            .and_then(|classes| classes.get_mut(&key.class_name))
        {
            Some(factory) => {
                factory.add_owner(loader);
                true
            }
            None => false,
        }
    }

    /// Whether any of `loader`'s library records lists `key`.
    pub(crate) fn is_recorded_for(&self, loader: LoaderRef, key: &FactoryKey) -> bool {
        self.loaded
            .get(&loader)
            .is_some_and(|records| records.iter().any(|record| record.classes.contains(key)))
    }

    /// Whether some loader loaded `library` itself, as opposed to only
    /// depending on it.
    pub(crate) fn has_direct_loader(&self, library: &Path) -> bool {
        self.loaded
            .values()
            .flatten()
            .any(|record| record.path == library)
    }

    /// Whether any library record loads or depends on `library`.
    pub(crate) fn is_referenced(&self, library: &Path) -> bool {
        self.loaded.values().flatten().any(|record| {
            record.path == library || record.dependencies.iter().any(|dep| dep == library)
        })
    }

    /// Purge and detach every open library in `candidates` that no record
    /// references anymore. The caller drops the returned handles once the
    /// state borrow is released.
    pub(crate) fn close_unreferenced<'a>(
        &mut self,
        candidates: impl IntoIterator<Item = &'a Path>,
    ) -> Vec<OpenLibrary> {
        let mut closed = Vec::new();
        for library in candidates {
            if self.is_referenced(library) || !self.libraries.contains_key(library) {
                continue;
            }
            let purged = self.purge_library(library);
            if !purged.is_empty() {
                tracing::warn!(
                    "Dropped {} factories still pointing into {}",
                    purged.len(),
                    library.display()
                );
            }
            if let Some(open) = self.libraries.remove(library) {
                closed.push(open);
            }
        }
        closed
    }

    /// Drop `owner`'s claim on each key and reclaim factories nobody owns.
    pub(crate) fn release(&mut self, keys: &[FactoryKey], owner: LoaderRef) -> Vec<FactoryKey> {
        let mut reclaimed = Vec::new();
        for key in keys {
            let Some(classes) = self.factories.get_mut(&key.interface) else {
                continue;
            };
            let orphaned = match classes.get_mut(&key.class_name) {
                Some(factory) => {
                    factory.remove_owner(owner);
                    !factory.is_owned_by_anybody()
                }
                None => false,
            };
            if orphaned {
                classes.remove(&key.class_name);
                reclaimed.push(key.clone());
            }
        }
        self.factories.retain(|_, classes| !classes.is_empty());
        reclaimed
    }

    /// Remove every factory that came from `library`, whoever owns it.
    pub(crate) fn purge_library(&mut self, library: &Path) -> Vec<FactoryKey> {
        let mut purged = Vec::new();
        for classes in self.factories.values_mut() {
            classes.retain(|_, factory| {
                let keep = factory.library() != library;
                if !keep {
                    purged.push(factory.key());
                }
                keep
            });
        }
        self.factories.retain(|_, classes| !classes.is_empty());
        purged
    }
}

/// Registry of class factories, keyed by interface id and class name.
pub struct Registry {
    state: ReentrantMutex<RefCell<RegistryState>>,
}

impl Registry {
    /// Create an empty registry.
    ///
    /// Most hosts share [`Registry::global`]; separate instances are useful
    /// for embedding and tests.
    pub fn new() -> Self {
        Self {
            state: ReentrantMutex::new(RefCell::new(RegistryState::default())),
        }
    }

    /// The process-wide registry.
    pub fn global() -> Arc<Registry> {
        Arc::clone(&GLOBAL_REGISTRY)
    }

    pub(crate) fn lock(&self) -> ReentrantMutexGuard<'_, RefCell<RegistryState>> {
        self.state.lock()
    }

    /// Run `f` with `(library, loader)` pushed on the load context.
    ///
    /// The frame is popped again on every exit path, including unwinding, and
    /// is returned together with `f`'s output so the caller can see which
    /// classes were registered during the load. The registry lock is held for
    /// the whole call.
    pub fn with_load_context<R>(
        &self,
        library: &Path,
        loader: LoaderRef,
        f: impl FnOnce() -> R,
    ) -> (R, LoadFrame) {
        let state = self.state.lock();
        state
            .borrow_mut()
            .context
            .push(LoadFrame::new(library, loader));
        let restore = scopeguard::guard(&state, |state| {
            state.borrow_mut().context.pop();
        });

        let output = f();

        let frame = ScopeGuard::into_inner(restore).borrow_mut().context.pop();
        debug_assert!(
            frame
                .as_ref()
                .is_some_and(|frame| frame.library == library && frame.loader == loader),
            "load context stack corrupted"
        );
        (output, frame.unwrap_or_else(|| LoadFrame::new(library, loader)))
    }

    /// Factories registered under `interface`.
    ///
    /// An interface nobody registered yields an empty list.
    pub fn factories(&self, interface: &str) -> Vec<FactoryInfo> {
        let state = self.state.lock();
        let state = state.borrow();
        state
            .factories
            .get(interface)
            .map(|classes| classes.values().map(Factory::info).collect())
            .unwrap_or_default()
    }

    /// Record `factory` on behalf of `owner`.
    ///
    /// Must run inside a library load performed by `owner`. If the
    /// `(interface, class)` pair is already registered, `owner` is added to
    /// the existing factory's ownership set and `factory` is discarded.
    pub fn register(&self, mut factory: Factory, owner: LoaderRef) -> Result<()> {
        let state = self.state.lock();
        let mut state = state.borrow_mut();

        let active = state
            .context
            .current_active_loader()
            .ok_or_else(|| ClassLoadError::NoActiveLoad(factory.key().to_string()))?;
        if active != owner {
            return Err(ClassLoadError::LoaderMismatch {
                requested: owner,
                active,
            });
        }

        let key = factory.key();
        tracing::info!(
            "Register class: {} from {} for {}",
            key,
            factory.library().display(),
            owner
        );

        let classes = state.factories.entry(key.interface.clone()).or_default();
        let (newly_claimed, provider) = match classes.get_mut(&key.class_name) {
            Some(existing) => {
                let provider = existing.library().to_path_buf();
                if provider != factory.library() {
                    tracing::warn!(
                        "Class {} already registered from {}, ignoring the copy in {}",
                        key,
                        provider.display(),
                        factory.library().display()
                    );
                }
                (existing.add_owner(owner), provider)
            }
            None => {
                let provider = factory.library().to_path_buf();
                factory.add_owner(owner);
                classes.insert(key.class_name.clone(), factory);
                (true, provider)
            }
        };

        if let Some(frame) = state.context.current_mut() {
            frame.record(key, newly_claimed);
            frame.record_dependency(&provider);
        }
        Ok(())
    }

    /// Create a new instance of `class_name` behind interface `B`.
    ///
    /// Returns `None` when no such class is registered or when `requester`
    /// does not own it.
    pub fn create<B: Interface + ?Sized>(
        &self,
        class_name: &str,
        requester: LoaderRef,
    ) -> Option<Box<B>> {
        let state = self.state.lock();
        let creator = {
            let state = state.borrow();
            let lookup = state.lookup(B::ID, class_name, requester);
            let creator = match lookup {
                Lookup::Found(factory) => {
                    let creator = factory.creator::<B>();
                    if creator.is_none() {
                        tracing::warn!(
                            "Class {}::{} was registered for a different type with the same interface id",
                            B::ID,
                            class_name
                        );
                    }
                    creator
                }
                Lookup::NotOwned => {
                    tracing::debug!(
                        "Class {}::{} is not owned by {}",
                        B::ID,
                        class_name,
                        requester
                    );
                    None
                }
                Lookup::NotFound => {
                    tracing::debug!("Class {}::{} is not registered", B::ID, class_name);
                    None
                }
            };
            creator
        }?;
        // Constructors run without a RefCell borrow so they may use the registry.
        Some(creator())
    }

    /// Class names under interface `B` that `requester` owns.
    pub fn list_owned<B: Interface + ?Sized>(&self, requester: LoaderRef) -> Vec<String> {
        self.list_owned_by_id(B::ID, requester)
    }

    /// Class names under `interface` that `requester` owns.
    pub fn list_owned_by_id(&self, interface: &str, requester: LoaderRef) -> Vec<String> {
        let state = self.state.lock();
        let state = state.borrow();
        state
            .factories
            .get(interface)
            .map(|classes| {
                classes
                    .values()
                    .filter(|factory| factory.is_owned_by(requester))
                    .map(|factory| factory.class_name().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether `requester` may create `class_name` through interface `B`.
    pub fn is_class_valid<B: Interface + ?Sized>(
        &self,
        class_name: &str,
        requester: LoaderRef,
    ) -> bool {
        let state = self.state.lock();
        let state = state.borrow();
        let lookup = state.lookup(B::ID, class_name, requester);
        matches!(lookup, Lookup::Found(_))
    }

    /// Remove `owner` from each named factory, reclaiming factories that end
    /// up with no owner. Returns the reclaimed keys.
    pub fn release_ownership(&self, keys: &[FactoryKey], owner: LoaderRef) -> Vec<FactoryKey> {
        let state = self.state.lock();
        let reclaimed = state.borrow_mut().release(keys, owner);
        for key in &reclaimed {
            tracing::debug!("Reclaimed factory {} after {} released it", key, owner);
        }
        reclaimed
    }

    /// Every registered factory, across interfaces.
    pub fn all_factories(&self) -> Vec<FactoryInfo> {
        let state = self.state.lock();
        let state = state.borrow();
        let mut all: Vec<FactoryInfo> = state
            .factories
            .values()
            .flat_map(|classes| classes.values().map(Factory::info))
            .collect();
        all.sort_by(|a, b| {
            (a.interface.as_str(), a.class_name.as_str())
                .cmp(&(b.interface.as_str(), b.class_name.as_str()))
        });
        all
    }

    /// Interfaces with at least one registered class.
    pub fn interfaces(&self) -> Vec<String> {
        let state = self.state.lock();
        let state = state.borrow();
        let mut interfaces: Vec<String> = state
            .factories
            .iter()
            .filter(|(_, classes)| !classes.is_empty())
            .map(|(interface, _)| interface.clone())
            .collect();
        interfaces.sort();
        interfaces
    }

    /// Keys of every factory registered from `library`.
    pub fn factories_of_library(&self, library: &Path) -> Vec<FactoryKey> {
        let state = self.state.lock();
        let keys = state.borrow().keys_of_library(library);
        keys
    }

    pub fn current_active_loader(&self) -> Option<LoaderRef> {
        let state = self.state.lock();
        let loader = state.borrow().context.current_active_loader();
        loader
    }

    pub fn current_loading_library(&self) -> Option<PathBuf> {
        let state = self.state.lock();
        let library = state
            .borrow()
            .context
            .current_loading_library()
            .map(Path::to_path_buf);
        library
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declare_interface;

    trait Shape {
        fn sides(&self) -> u32;
    }

    declare_interface!(dyn Shape, "test.registry.Shape");

    struct Triangle;

    impl Shape for Triangle {
        fn sides(&self) -> u32 {
            3
        }
    }

    fn triangle(library: &str) -> Factory {
        Factory::new::<dyn Shape, _>("Triangle", library, || Box::new(Triangle) as Box<dyn Shape>)
    }

    #[test]
    fn test_registry_singleton() {
        let r1 = Registry::global();
        let r2 = Registry::global();
        assert!(Arc::ptr_eq(&r1, &r2));
    }

    #[test]
    fn test_register_requires_active_load() {
        let registry = Registry::new();
        let loader = LoaderRef::mint();
        let err = registry.register(triangle("/lib/a.so"), loader).unwrap_err();
        assert!(matches!(err, ClassLoadError::NoActiveLoad(_)));
        assert!(registry.all_factories().is_empty());
    }

    #[test]
    fn test_register_rejects_other_loader() {
        let registry = Registry::new();
        let active = LoaderRef::mint();
        let other = LoaderRef::mint();
        let (result, _) = registry.with_load_context(Path::new("/lib/a.so"), active, || {
            registry.register(triangle("/lib/a.so"), other)
        });
        assert!(matches!(
            result,
            Err(ClassLoadError::LoaderMismatch { requested, active: a }) if requested == other && a == active
        ));
    }

    #[test]
    fn test_load_context_restored_after_panic() {
        let registry = Registry::new();
        let loader = LoaderRef::mint();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            registry.with_load_context(Path::new("/lib/a.so"), loader, || {
                panic!("initializer aborted");
            })
        }));
        assert!(result.is_err());
        assert!(registry.current_active_loader().is_none());
    }

    #[test]
    fn test_frame_records_registered_classes() {
        let registry = Registry::new();
        let loader = LoaderRef::mint();
        let (result, frame) = registry.with_load_context(Path::new("/lib/a.so"), loader, || {
            assert_eq!(registry.current_active_loader(), Some(loader));
            registry.register(triangle("/lib/a.so"), loader)
        });
        result.unwrap();
        assert_eq!(frame.registered, vec![FactoryKey::new("test.registry.Shape", "Triangle")]);
        assert_eq!(
            registry.create::<dyn Shape>("Triangle", loader).unwrap().sides(),
            3
        );
    }

    #[test]
    fn test_factories_for_unknown_interface() {
        let registry = Registry::new();
        assert!(registry.factories("test.Unknown").is_empty());
        assert!(registry.interfaces().is_empty());
    }

    #[test]
    fn test_purge_library() {
        let registry = Registry::new();
        let loader = LoaderRef::mint();
        registry
            .with_load_context(Path::new("/lib/a.so"), loader, || {
                registry.register(triangle("/lib/a.so"), loader)
            })
            .0
            .unwrap();
        let purged = registry.lock().borrow_mut().purge_library(Path::new("/lib/a.so"));
        assert_eq!(purged.len(), 1);
        assert!(registry.all_factories().is_empty());
        assert!(registry.lock().borrow().factories.is_empty());
    }

    #[test]
    fn test_release_prunes_empty_interfaces() {
        let registry = Registry::new();
        let loader = LoaderRef::mint();
        let (result, frame) = registry.with_load_context(Path::new("/lib/a.so"), loader, || {
            registry.register(triangle("/lib/a.so"), loader)
        });
        result.unwrap();

        let reclaimed = registry.release_ownership(&frame.registered, loader);
        assert_eq!(reclaimed, frame.registered);
        assert!(registry.lock().borrow().factories.is_empty());
    }

    #[test]
    fn test_factories_query_does_not_grow_registry() {
        let registry = Registry::new();
        for i in 0..16 {
            assert!(registry.factories(&format!("test.Unknown{}", i)).is_empty());
        }
        assert!(registry.lock().borrow().factories.is_empty());
    }

    #[test]
    fn test_register_tracks_prior_claims_and_providers() {
        let registry = Registry::new();
        let loader = LoaderRef::mint();
        registry
            .with_load_context(Path::new("/lib/a.so"), loader, || {
                registry.register(triangle("/lib/a.so"), loader)
            })
            .0
            .unwrap();

        let (result, frame) = registry.with_load_context(Path::new("/lib/b.so"), loader, || {
            registry.register(triangle("/lib/b.so"), loader)
        });
        result.unwrap();
        assert_eq!(frame.registered, vec![FactoryKey::new("test.registry.Shape", "Triangle")]);
        assert!(frame.claimed.is_empty());
        assert_eq!(frame.dependencies, vec![PathBuf::from("/lib/a.so")]);
    }
}
