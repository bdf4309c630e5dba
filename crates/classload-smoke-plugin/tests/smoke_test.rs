//! Smoke Plugin Tests
//!
//! Loads the plugin both ways it can be linked:
//! - In-process, through its registration function
//! - As a native library, when the cdylib artifact has been built

use std::path::{Path, PathBuf};
use std::sync::Arc;

use classload_core::{
    ClassLoader, ClassLoaderConfig, LoaderManager, NativeLibraryBackend, Registry,
    StaticLibraryBackend,
};
use classload_smoke_plugin::{register_classes, Describe, Shape};

/// Locate the built cdylib next to the test binary's target directory.
fn native_artifact() -> Option<PathBuf> {
    let file_name = libloading::library_filename("classload_smoke_plugin");
    let target_dir = std::env::var_os("CARGO_TARGET_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target"));

    ["debug", "release"]
        .iter()
        .map(|profile| target_dir.join(profile).join(&file_name))
        .find(|candidate| candidate.is_file())
}

fn isolated_loader(backend: Arc<dyn classload_core::LibraryBackend>) -> ClassLoader {
    let manager = LoaderManager::with_registry(Arc::new(Registry::new()), backend);
    ClassLoader::with_config(Arc::new(manager), ClassLoaderConfig::default())
}

#[test]
fn test_static_registration() {
    let backend = StaticLibraryBackend::new().with_library("/static/libsmoke.so", register_classes);
    let loader = isolated_loader(Arc::new(backend));
    loader.load_library("/static/libsmoke.so").unwrap();

    assert_eq!(
        loader.valid_class_names::<dyn Shape>(),
        vec!["Circle".to_string(), "Square".to_string()]
    );
    assert_eq!(loader.valid_class_names::<dyn Describe>(), vec!["Square".to_string()]);

    let square = loader.create_instance::<dyn Shape>("Square").unwrap();
    assert_eq!(square.name(), "square");
    assert_eq!(square.sides(), 4);
    assert!((square.area() - 4.0).abs() < f64::EPSILON);

    let description = loader.create_instance::<dyn Describe>("Square").unwrap();
    assert_eq!(description.describe(), "square with side 2");
    assert!(loader.create_instance::<dyn Describe>("Circle").is_none());
}

#[test]
fn test_native_load_and_unload() {
    let Some(artifact) = native_artifact() else {
        eprintln!("Skipping: smoke plugin cdylib has not been built");
        return;
    };

    let loader = isolated_loader(Arc::new(NativeLibraryBackend::new()));
    let path = loader.load_library(&artifact).unwrap();
    assert_eq!(path, artifact);

    {
        let circle = loader.create_instance::<dyn Shape>("Circle").unwrap();
        assert_eq!(circle.name(), "circle");
        assert!((circle.area() - std::f64::consts::PI).abs() < 1e-9);
        assert_eq!(loader.live_instances(), 1);
    }

    let records = loader.loaded_libraries();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].classes.len(), 3);

    loader.unload_library(&artifact).unwrap();
    assert!(!loader.is_library_loaded(&artifact));
    assert!(loader.manager().registry().all_factories().is_empty());
}

#[test]
fn test_native_entry_symbol_override() {
    let Some(artifact) = native_artifact() else {
        eprintln!("Skipping: smoke plugin cdylib has not been built");
        return;
    };

    let config = ClassLoaderConfig {
        entry_symbol: "missing_entry_point".to_string(),
        ..ClassLoaderConfig::default()
    };
    let loader = isolated_loader(Arc::new(NativeLibraryBackend::from_config(&config)));

    let err = loader.load_library(&artifact).unwrap_err();
    assert!(matches!(
        err,
        classload_core::ClassLoadError::SymbolMissing { ref symbol, .. } if symbol == "missing_entry_point"
    ));
    assert!(loader.loaded_libraries().is_empty());
}
