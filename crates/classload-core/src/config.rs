//! Class loader configuration.
//!
//! Defaults and environment variable names live in their own modules so the
//! CLI and embedding hosts share one set of constants.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ClassLoadError, Result};

/// Default values.
pub mod defaults {
    /// Plugin entry point symbol.
    pub const ENTRY_SYMBOL: &str = crate::library::ENTRY_SYMBOL;
    /// Whether the exported ABI version is checked before initialization.
    pub const VERIFY_ABI: bool = true;
}

/// Environment variable names.
pub mod env_vars {
    /// Library search path, entries separated like `PATH`.
    pub const SEARCH_PATH: &str = "CLASSLOAD_PATH";
    pub const ENTRY_SYMBOL: &str = "CLASSLOAD_ENTRY_SYMBOL";
    /// `true`/`false`/`1`/`0`.
    pub const VERIFY_ABI: &str = "CLASSLOAD_VERIFY_ABI";
    /// Emit logs as JSON lines.
    pub const LOG_JSON: &str = "CLASSLOAD_LOG_JSON";
}

/// Settings for resolving and opening plugin libraries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassLoaderConfig {
    /// Directories searched for libraries given by relative path or bare name.
    pub search_paths: Vec<PathBuf>,
    /// Symbol resolved and called to run a library's registrations.
    pub entry_symbol: String,
    /// Check `classload_abi_version` before running the entry point.
    pub verify_abi: bool,
}

impl Default for ClassLoaderConfig {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            entry_symbol: defaults::ENTRY_SYMBOL.to_string(),
            verify_abi: defaults::VERIFY_ABI,
        }
    }
}

impl ClassLoaderConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(paths) = lookup(env_vars::SEARCH_PATH) {
            config.search_paths = std::env::split_paths(&paths)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
        }

        if let Some(symbol) = lookup(env_vars::ENTRY_SYMBOL).filter(|s| !s.trim().is_empty()) {
            config.entry_symbol = symbol.trim().to_string();
        }

        if let Some(verify) = lookup(env_vars::VERIFY_ABI) {
            match verify.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => config.verify_abi = true,
                "0" | "false" | "no" => config.verify_abi = false,
                other => tracing::warn!(
                    "Ignoring {}={}: expected true or false",
                    env_vars::VERIFY_ABI,
                    other
                ),
            }
        }

        config
    }

    /// Load a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            ClassLoadError::Config(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.entry_symbol.trim().is_empty() {
            return Err(ClassLoadError::Config(
                "entry_symbol must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }

    /// Map a library reference to the path handed to the loader manager.
    ///
    /// Absolute paths are used as given. Otherwise each search path is tried
    /// with the name as given and with the platform's library file name
    /// (`foo` becomes `libfoo.so` on Linux); the first existing file wins. If
    /// nothing matches, the name is returned unchanged.
    pub fn resolve(&self, library: impl AsRef<Path>) -> PathBuf {
        let library = library.as_ref();
        if library.is_absolute() {
            return library.to_path_buf();
        }

        let platform_name = libloading::library_filename(library.as_os_str());
        for dir in &self.search_paths {
            for candidate in [dir.join(library), dir.join(&platform_name)] {
                if candidate.is_file() {
                    return candidate;
                }
            }
        }

        library.to_path_buf()
    }
}
