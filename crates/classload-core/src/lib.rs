//! Plugin class loading.
//!
//! Libraries register concrete classes under abstract interfaces while they
//! are being loaded. Each registration is owned by the loader that loaded the
//! library, and only owning loaders can instantiate the class.

pub mod config;
pub mod context;
pub mod error;
pub mod factory;
pub mod interface;
pub mod library;
pub mod loader;
pub mod manager;
pub mod registry;

pub use config::ClassLoaderConfig;
pub use context::{LoadContext, LoadFrame};
pub use error::{ClassLoadError, Result};
pub use factory::{Factory, FactoryInfo, FactoryKey, LoaderRef};
pub use interface::Interface;
pub use library::{
    LibraryBackend, LibraryHandle, LoadHost, NativeLibraryBackend, Registrar,
    StaticLibraryBackend, ABI_VERSION,
};
pub use loader::{ClassLoader, Instance};
pub use manager::LoaderManager;
pub use registry::{LoadedLibrary, Registry};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::{defaults, env_vars, ClassLoaderConfig};
    pub use crate::error::{ClassLoadError, Result};
    pub use crate::factory::LoaderRef;
    pub use crate::interface::Interface;
    pub use crate::library::Registrar;
    pub use crate::loader::{ClassLoader, Instance};
    pub use crate::manager::LoaderManager;
    pub use crate::{declare_interface, export_plugin, register_class};
}
