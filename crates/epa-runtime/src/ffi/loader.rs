//! Dynamic library loading for the EPA library
//!
//! Provides cross-platform dynamic library loading using `libloading`.
//! Handles platform-specific library naming conventions and search paths.
//! Loaded libraries are shared (`Arc`) so function objects created by a
//! library can keep it loaded, and cached per resolved path for the whole
//! process so every loader hands out the same instance.

use libloading::Library;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

static LOADED: OnceLock<Mutex<HashMap<PathBuf, Arc<Library>>>> = OnceLock::new();

fn loaded() -> MutexGuard<'static, HashMap<PathBuf, Arc<Library>>> {
    LOADED
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Cached library for `path`, opened with `open` on first use
fn cached_or_load(
    path: PathBuf,
    open: impl FnOnce(&Path) -> Result<Library, LoadError>,
) -> Result<Arc<Library>, LoadError> {
    let mut loaded = loaded();
    if let Some(library) = loaded.get(&path) {
        return Ok(library.clone());
    }

    let library = Arc::new(open(&path)?);
    tracing::debug!(target: "epa::ffi::loader", path = %path.display(), "library loaded");
    loaded.insert(path, library.clone());
    Ok(library)
}

/// Library loading errors
#[derive(Debug, Clone, PartialEq)]
pub enum LoadError {
    /// Library file not found in search paths
    LibraryNotFound(String),
    /// Symbol not found in library
    SymbolNotFound { library: String, symbol: String },
    /// Failed to load library
    LoadFailed(String),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::LibraryNotFound(name) => write!(f, "Library not found: {}", name),
            LoadError::SymbolNotFound { library, symbol } => {
                write!(f, "Symbol '{}' not found in library '{}'", symbol, library)
            }
            LoadError::LoadFailed(msg) => write!(f, "Failed to load library: {}", msg),
        }
    }
}

impl std::error::Error for LoadError {}

/// Dynamic library loader with platform-specific path resolution
///
/// # Safety
///
/// Loading dynamic libraries is inherently unsafe. The loaded code runs in the
/// same process and can perform arbitrary operations.
pub struct LibraryLoader {
    /// Library search paths, highest priority first
    search_paths: Vec<PathBuf>,
}

impl LibraryLoader {
    /// Create a new library loader with default search paths
    pub fn new() -> Self {
        Self {
            search_paths: Self::default_search_paths(),
        }
    }

    /// Create a loader that searches `extra` before the defaults
    pub fn with_search_paths(extra: &[PathBuf]) -> Self {
        let mut loader = Self::new();
        for path in extra.iter().rev() {
            loader.add_search_path(path.clone());
        }
        loader
    }

    /// Get platform-specific default library search paths
    ///
    /// - Linux: /usr/lib, /usr/local/lib, /lib (+ lib64 variants)
    /// - macOS: /usr/lib, /usr/local/lib, /opt/homebrew/lib
    /// - Windows: C:\Windows\System32
    /// - All platforms: current working directory first
    fn default_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(target_os = "linux")]
        {
            paths.push(PathBuf::from("/usr/local/lib"));
            paths.push(PathBuf::from("/usr/lib"));
            paths.push(PathBuf::from("/lib"));

            if cfg!(target_pointer_width = "64") {
                paths.push(PathBuf::from("/usr/lib64"));
                paths.push(PathBuf::from("/lib64"));
            }
        }

        #[cfg(target_os = "macos")]
        {
            paths.push(PathBuf::from("/usr/local/lib"));
            paths.push(PathBuf::from("/opt/homebrew/lib"));
            paths.push(PathBuf::from("/usr/lib"));
        }

        #[cfg(target_os = "windows")]
        {
            paths.push(PathBuf::from("C:\\Windows\\System32"));
            if let Ok(system_root) = std::env::var("SystemRoot") {
                paths.push(PathBuf::from(format!("{}\\System32", system_root)));
            }
        }

        if let Ok(cwd) = std::env::current_dir() {
            paths.insert(0, cwd);
        }

        paths
    }

    /// Resolve a library name to a full path
    ///
    /// - Linux: lib{name}.so
    /// - macOS: lib{name}.dylib or lib{name}.so
    /// - Windows: {name}.dll
    ///
    /// A name containing a path separator is used as a path.
    fn resolve_library_path(&self, name: &str) -> Option<PathBuf> {
        let path = Path::new(name);
        if path.components().count() > 1 || path.is_absolute() {
            return path.exists().then(|| path.to_path_buf());
        }

        let extensions: &[&str] = if cfg!(target_os = "windows") {
            &["dll"]
        } else if cfg!(target_os = "macos") {
            &["dylib", "so"]
        } else {
            &["so"]
        };

        let prefixes: &[&str] = if cfg!(target_os = "windows") {
            &["", "lib"]
        } else {
            &["lib", ""]
        };

        for search_path in &self.search_paths {
            for prefix in prefixes {
                for ext in extensions {
                    let full_path = search_path.join(format!("{}{}.{}", prefix, name, ext));
                    if full_path.exists() {
                        return Some(full_path);
                    }
                }
            }
        }

        None
    }

    /// Load a library by name or path, or return the cached instance
    ///
    /// # Safety
    ///
    /// Loading a dynamic library executes its initialization code. The caller
    /// must trust the library.
    pub fn load(&self, name: &str) -> Result<Arc<Library>, LoadError> {
        let path = self
            .resolve_library_path(name)
            .ok_or_else(|| LoadError::LibraryNotFound(name.to_string()))?;

        cached_or_load(path, |path| unsafe {
            Library::new(path).map_err(|e| LoadError::LoadFailed(e.to_string()))
        })
    }

    /// Add a custom search path (prepended to search list)
    pub fn add_search_path(&mut self, path: PathBuf) {
        self.search_paths.insert(0, path);
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Number of libraries loaded in this process
    pub fn loaded_count() -> usize {
        loaded().len()
    }
}

impl Default for LibraryLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy a symbol out of a library
///
/// # Safety
///
/// `T` must match the symbol's real type, and the value must not be used
/// after `library` is unloaded.
pub unsafe fn symbol<T: Copy>(library: &Library, library_name: &str, name: &str) -> Result<T, LoadError> {
    library
        .get::<T>(name.as_bytes())
        .map(|symbol| *symbol)
        .map_err(|_| LoadError::SymbolNotFound {
            library: library_name.to_string(),
            symbol: name.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_search_paths_not_empty() {
        let paths = LibraryLoader::default_search_paths();
        assert!(!paths.is_empty());

        if let Ok(cwd) = std::env::current_dir() {
            assert_eq!(paths[0], cwd);
        }
    }

    #[test]
    fn test_library_not_found() {
        let loader = LibraryLoader::new();
        let result = loader.load("nonexistent_epa_library_xyz");
        assert!(matches!(result, Err(LoadError::LibraryNotFound(_))));
    }

    #[test]
    fn test_missing_explicit_path() {
        let loader = LibraryLoader::new();
        let result = loader.load("/definitely/missing/libepa.so");
        assert!(matches!(result, Err(LoadError::LibraryNotFound(_))));
    }

    #[test]
    fn test_extra_search_paths_come_first() {
        let extra = vec![PathBuf::from("/opt/epa/lib"), PathBuf::from("/srv/epa")];
        let loader = LibraryLoader::with_search_paths(&extra);
        assert_eq!(&loader.search_paths()[..2], extra.as_slice());
    }

    #[test]
    fn test_resolves_platform_file_name() {
        let dir = TempDir::new().unwrap();
        let file_name = if cfg!(target_os = "windows") {
            "epa.dll"
        } else if cfg!(target_os = "macos") {
            "libepa.dylib"
        } else {
            "libepa.so"
        };
        std::fs::write(dir.path().join(file_name), b"").unwrap();

        let loader = LibraryLoader::with_search_paths(&[dir.path().to_path_buf()]);
        assert_eq!(
            loader.resolve_library_path("epa"),
            Some(dir.path().join(file_name))
        );
    }

    #[test]
    fn test_invalid_library_file_fails_to_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("libbroken.so");
        std::fs::write(&path, b"not a shared object").unwrap();

        let loader = LibraryLoader::new();
        let result = loader.load(path.to_str().unwrap());
        assert!(matches!(result, Err(LoadError::LoadFailed(_))));
        assert!(!loaded().contains_key(&path));
    }

    #[cfg(unix)]
    fn this_process(_: &Path) -> Result<Library, LoadError> {
        Ok(libloading::os::unix::Library::this().into())
    }

    #[cfg(windows)]
    fn this_process(_: &Path) -> Result<Library, LoadError> {
        libloading::os::windows::Library::this()
            .map(Into::into)
            .map_err(|e| LoadError::LoadFailed(e.to_string()))
    }

    #[test]
    fn test_cache_is_shared_across_loaders() {
        let path = PathBuf::from("/cache/test/libepa_self.so");
        let first = cached_or_load(path.clone(), this_process).unwrap();
        let count = LibraryLoader::loaded_count();

        let second = cached_or_load(path, |_| panic!("cached library opened twice")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(LibraryLoader::loaded_count(), count);
    }
}
