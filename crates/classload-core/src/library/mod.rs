//! The dynamic-load primitive and the registration surface plugins see.
//!
//! A [`LibraryBackend`] opens libraries; the resulting [`LibraryHandle`] runs
//! the library's initializer once and closes the library when dropped. The
//! initializer receives a [`Registrar`] through which it registers classes.
//!
//! Registration goes through the `&dyn LoadHost` inside the registrar, so the
//! code that touches the registry is always the host's copy, even when the
//! plugin was linked against its own copy of this crate.

mod in_process;
mod native;

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::factory::{Factory, LoaderRef};
use crate::interface::Interface;

pub use in_process::StaticLibraryBackend;
pub use native::NativeLibraryBackend;

/// Plugin ABI version. Bumped whenever [`Registrar`] or [`Factory`] change
/// layout.
pub const ABI_VERSION: u32 = 1;

/// Exported by plugins: `extern "C" fn() -> u32` returning [`ABI_VERSION`].
pub const ABI_VERSION_SYMBOL: &str = "classload_abi_version";

/// Default plugin entry point, see [`PluginInitFn`].
pub const ENTRY_SYMBOL: &str = "classload_plugin_init";

/// Signature of the plugin entry point. Returns 0 on success.
pub type PluginInitFn = for<'a> unsafe extern "C" fn(registrar: *const Registrar<'a>) -> i32;

/// Signature of the ABI version export.
pub type AbiVersionFn = unsafe extern "C" fn() -> u32;

/// Opens libraries.
pub trait LibraryBackend: Send + Sync {
    /// Map the library at `path` without running its initializer.
    fn open(&self, path: &Path) -> Result<Box<dyn LibraryHandle>>;
}

/// An open library. Dropping the handle closes it.
pub trait LibraryHandle: Send {
    fn path(&self) -> &Path;

    /// Run the library's registration code.
    fn initialize(&mut self, registrar: &Registrar<'_>) -> Result<()>;
}

/// Host services a registrar forwards to.
pub trait LoadHost {
    /// Record `factory` for `owner` in the host registry.
    fn register_factory(&self, factory: Factory, owner: LoaderRef) -> Result<()>;

    /// Load another library, possibly for a different loader.
    fn load_library(&self, path: &Path, loader: LoaderRef) -> Result<()>;
}

/// Handed to a library's initializer for the duration of one load.
pub struct Registrar<'a> {
    host: &'a dyn LoadHost,
    library: &'a Path,
    loader: LoaderRef,
}

impl<'a> Registrar<'a> {
    pub fn new(host: &'a dyn LoadHost, library: &'a Path, loader: LoaderRef) -> Self {
        Self {
            host,
            library,
            loader,
        }
    }

    /// Library being loaded.
    pub fn library(&self) -> &Path {
        self.library
    }

    /// Loader the library is being loaded for.
    pub fn loader(&self) -> LoaderRef {
        self.loader
    }

    /// Register class `class_name` under interface `B`.
    pub fn register<B, F>(&self, class_name: &str, creator: F) -> Result<()>
    where
        B: Interface + ?Sized,
        F: Fn() -> Box<B> + Send + Sync + 'static,
    {
        self.register_factory(Factory::new::<B, F>(class_name, self.library, creator))
    }

    pub fn register_factory(&self, factory: Factory) -> Result<()> {
        self.host.register_factory(factory, self.loader)
    }

    /// Load a dependency while this library is still initializing.
    pub fn load_library(&self, path: impl AsRef<Path>, loader: LoaderRef) -> Result<()> {
        self.host.load_library(path.as_ref(), loader)
    }
}

/// Register a `Default`-constructible class through a registrar.
///
/// ```rust,ignore
/// register_class!(registrar, dyn Shape, Circle, "Circle")?;
/// ```
#[macro_export]
macro_rules! register_class {
    ($registrar:expr, $interface:ty, $class:ty, $name:expr) => {
        $registrar.register::<$interface, _>(
            $name,
            || -> ::std::boxed::Box<$interface> {
                ::std::boxed::Box::new(<$class as ::std::default::Default>::default())
            },
        )
    };
}

/// Export the plugin entry points for a cdylib.
///
/// `$init` is a `fn(&Registrar<'_>) -> Result<()>`. Panics inside it are
/// caught and reported as an initializer failure.
#[macro_export]
macro_rules! export_plugin {
    ($init:path) => {
        #[no_mangle]
        pub extern "C" fn classload_abi_version() -> u32 {
            $crate::ABI_VERSION
        }

        #[no_mangle]
        #[allow(improper_ctypes_definitions)]
        pub unsafe extern "C" fn classload_plugin_init(
            registrar: *const $crate::Registrar<'_>,
        ) -> i32 {
            // SAFETY: the host passes a registrar that outlives this call.
            let registrar = match unsafe { registrar.as_ref() } {
                Some(registrar) => registrar,
                None => return -1,
            };
            match ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| $init(registrar))) {
                Ok(Ok(())) => 0,
                Ok(Err(_)) => 1,
                Err(_) => 2,
            }
        }
    };
}

/// Check if a file is a native shared library for this platform family.
pub fn is_native_library(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| matches!(ext, "so" | "dylib" | "dll"))
        .unwrap_or(false)
}

/// Native libraries directly inside `dir`, sorted by path.
///
/// An unreadable directory yields an empty list.
pub fn discover(dir: &Path) -> Vec<PathBuf> {
    let mut libraries = Vec::new();

    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() && is_native_library(&path) {
                libraries.push(path);
            }
        }
    }

    libraries.sort();
    libraries
}
