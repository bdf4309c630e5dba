//! Type-erased class factories and loader identities.
//!
//! A [`Factory`] is bound to one `(interface, class name)` pair. It stores its
//! creation function behind `dyn Any` so the registry can hold factories for
//! any interface in one map, and it records which loaders currently claim it.

use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::interface::Interface;

static NEXT_LOADER_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of one loader (one plugin context).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LoaderRef(u64);

impl LoaderRef {
    /// Mint a fresh loader identity, unique for the life of the process.
    pub fn mint() -> Self {
        Self(NEXT_LOADER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value of this identity.
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LoaderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loader#{}", self.0)
    }
}

/// The `(interface, class name)` pair a factory is registered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FactoryKey {
    /// Base interface identifier.
    pub interface: String,
    /// Class name, unique within the interface.
    pub class_name: String,
}

impl FactoryKey {
    pub fn new(interface: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            class_name: class_name.into(),
        }
    }
}

impl fmt::Display for FactoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.interface, self.class_name)
    }
}

/// Stored behind `dyn Any`; downcasting to `Creator<B>` checks the interface.
struct Creator<B: ?Sized>(Arc<dyn Fn() -> Box<B> + Send + Sync>);

/// A registered creation capability for one concrete class.
pub struct Factory {
    interface: String,
    class_name: String,
    library: PathBuf,
    owners: Vec<LoaderRef>,
    creator: Box<dyn Any + Send + Sync>,
}

impl Factory {
    /// Bind a creation function for class `class_name` under interface `B`.
    ///
    /// The factory starts with an empty ownership set; the registry adds the
    /// registering loader when the factory is recorded.
    pub fn new<B, F>(class_name: impl Into<String>, library: impl AsRef<Path>, creator: F) -> Self
    where
        B: Interface + ?Sized,
        F: Fn() -> Box<B> + Send + Sync + 'static,
    {
        let creator: Creator<B> = Creator(Arc::new(creator));
        Self {
            interface: B::ID.to_string(),
            class_name: class_name.into(),
            library: library.as_ref().to_path_buf(),
            owners: Vec::new(),
            creator: Box::new(creator),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Library the class was registered from.
    pub fn library(&self) -> &Path {
        &self.library
    }

    pub fn key(&self) -> FactoryKey {
        FactoryKey::new(&self.interface, &self.class_name)
    }

    /// Allocate a new instance behind interface `B`.
    ///
    /// Returns `None` when `B` is not the interface this factory was built
    /// for.
    pub fn create<B: Interface + ?Sized>(&self) -> Option<Box<B>> {
        self.creator::<B>().map(|create| create())
    }

    pub(crate) fn creator<B: Interface + ?Sized>(
        &self,
    ) -> Option<Arc<dyn Fn() -> Box<B> + Send + Sync>> {
        self.creator
            .downcast_ref::<Creator<B>>()
            .map(|creator| Arc::clone(&creator.0))
    }

    pub fn is_owned_by(&self, loader: LoaderRef) -> bool {
        self.owners.contains(&loader)
    }

    pub fn is_owned_by_anybody(&self) -> bool {
        !self.owners.is_empty()
    }

    /// Add `loader` to the ownership set. Returns whether it was newly added.
    pub fn add_owner(&mut self, loader: LoaderRef) -> bool {
        if self.is_owned_by(loader) {
            return false;
        }
        self.owners.push(loader);
        true
    }

    /// Remove `loader` from the ownership set. Returns whether it was present.
    pub fn remove_owner(&mut self, loader: LoaderRef) -> bool {
        let before = self.owners.len();
        self.owners.retain(|owner| *owner != loader);
        self.owners.len() != before
    }

    /// Owning loaders, in the order they claimed this factory.
    pub fn owners(&self) -> &[LoaderRef] {
        &self.owners
    }

    pub fn info(&self) -> FactoryInfo {
        FactoryInfo {
            interface: self.interface.clone(),
            class_name: self.class_name.clone(),
            library: self.library.clone(),
            owners: self.owners.clone(),
        }
    }
}

impl fmt::Debug for Factory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Factory")
            .field("interface", &self.interface)
            .field("class_name", &self.class_name)
            .field("library", &self.library)
            .field("owners", &self.owners)
            .finish_non_exhaustive()
    }
}

/// Snapshot of a registered factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoryInfo {
    pub interface: String,
    pub class_name: String,
    pub library: PathBuf,
    pub owners: Vec<LoaderRef>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declare_interface;

    trait Animal {
        fn sound(&self) -> &'static str;
    }

    trait Vehicle {}

    declare_interface!(dyn Animal, "test.Animal");
    declare_interface!(dyn Vehicle, "test.Vehicle");

    struct Dog;

    impl Animal for Dog {
        fn sound(&self) -> &'static str {
            "woof"
        }
    }

    fn dog_factory() -> Factory {
        Factory::new::<dyn Animal, _>("Dog", "/plugins/libanimals.so", || {
            Box::new(Dog) as Box<dyn Animal>
        })
    }

    #[test]
    fn test_create_through_interface() {
        let factory = dog_factory();
        let animal = factory.create::<dyn Animal>().unwrap();
        assert_eq!(animal.sound(), "woof");
        assert_eq!(factory.interface(), "test.Animal");
        assert_eq!(factory.key(), FactoryKey::new("test.Animal", "Dog"));
    }

    #[test]
    fn test_create_with_wrong_interface() {
        let factory = dog_factory();
        assert!(factory.create::<dyn Vehicle>().is_none());
    }

    #[test]
    fn test_ownership_set() {
        let mut factory = dog_factory();
        let a = LoaderRef::mint();
        let b = LoaderRef::mint();

        assert!(!factory.is_owned_by_anybody());
        assert!(factory.add_owner(a));
        assert!(!factory.add_owner(a));
        assert!(factory.add_owner(b));
        assert_eq!(factory.owners(), &[a, b]);

        assert!(factory.remove_owner(a));
        assert!(!factory.remove_owner(a));
        assert!(!factory.is_owned_by(a));
        assert!(factory.is_owned_by(b));
    }

    #[test]
    fn test_loader_refs_are_unique() {
        let a = LoaderRef::mint();
        let b = LoaderRef::mint();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), format!("loader#{}", a.id()));
    }
}
