//! Symbol lookup in dynamic libraries
//!
//! Libraries are loaded through `libloading` and handed to a scope, which
//! unloads them when it closes. Symbols come back as zero-length segments
//! rooted at that scope, so a downcall through a symbol of an unloaded
//! library fails the liveness check instead of jumping into freed code.

use crate::error::{FfiError, FfiResult};
use crate::scope::Scope;
use crate::segment::MemorySegment;
use libloading::Library;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("Library not found: {0}")]
    LibraryNotFound(String),

    #[error("Symbol '{symbol}' not found in {library}")]
    SymbolNotFound { library: String, symbol: String },

    #[error("Failed to load library: {0}")]
    LoadFailed(String),
}

/// Finds native symbols by name
pub trait SymbolLookup {
    /// Address of `name`, rooted at the scope that keeps it loaded
    fn find(&self, name: &str) -> Option<MemorySegment>;

    /// Human-readable description for diagnostics
    fn label(&self) -> String;

    fn require(&self, name: &str) -> FfiResult<MemorySegment> {
        self.find(name).ok_or_else(|| {
            FfiError::Lookup(LookupError::SymbolNotFound {
                library: self.label(),
                symbol: name.to_string(),
            })
        })
    }
}

fn symbol_address(library: &Library, name: &str) -> Option<usize> {
    // SAFETY: the symbol is only read as an address, never dereferenced here
    let symbol = unsafe { library.get::<*mut c_void>(name.as_bytes()) }.ok()?;
    let address = *symbol as usize;
    (address != 0).then_some(address)
}

/// Libraries loaded by name, owned by a scope
pub struct LibraryLookup {
    scope: Scope,
    search_paths: Vec<PathBuf>,
    loaded: Vec<(PathBuf, Weak<Library>)>,
}

impl LibraryLookup {
    /// Empty lookup whose libraries will belong to `scope`
    pub fn new(scope: &Scope) -> Self {
        Self {
            scope: scope.clone(),
            search_paths: default_search_paths(),
            loaded: Vec::new(),
        }
    }

    /// Resolve and load one library in one step
    ///
    /// # Safety
    ///
    /// Loading runs the library's initializers; the library must be trusted.
    pub unsafe fn open(name: &str, scope: &Scope) -> FfiResult<Self> {
        let mut lookup = Self::new(scope);
        lookup.load(name)?;
        Ok(lookup)
    }

    /// Search `path` before the defaults
    pub fn add_search_path(&mut self, path: impl Into<PathBuf>) {
        self.search_paths.insert(0, path.into());
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Load a library by short name ("m") or path
    ///
    /// # Safety
    ///
    /// Loading runs the library's initializers; the library must be trusted.
    pub unsafe fn load(&mut self, name: &str) -> FfiResult<()> {
        let path = resolve_library_path(&self.search_paths, name)
            .ok_or_else(|| LookupError::LibraryNotFound(name.to_string()))?;
        if self.loaded.iter().any(|(p, lib)| *p == path && lib.strong_count() > 0) {
            return Ok(());
        }

        let library = Library::new(&path).map_err(|e| LookupError::LoadFailed(e.to_string()))?;
        let library = Arc::new(library);
        let weak = Arc::downgrade(&library);
        // the scope holds the only strong reference
        self.scope.attach(Box::new(library))?;

        debug!(scope = %self.scope.id(), path = %path.display(), "library loaded");
        self.loaded.push((path, weak));
        Ok(())
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.iter().filter(|(_, lib)| lib.strong_count() > 0).count()
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

impl SymbolLookup for LibraryLookup {
    fn find(&self, name: &str) -> Option<MemorySegment> {
        let _guard = self.scope.acquire("symbol lookup").ok()?;
        self.loaded.iter().find_map(|(_, library)| {
            let library = library.upgrade()?;
            let address = symbol_address(&library, name)?;
            Some(MemorySegment::from_scope(self.scope.clone(), address, 0))
        })
    }

    fn label(&self) -> String {
        let names: Vec<String> = self
            .loaded
            .iter()
            .map(|(path, _)| path.display().to_string())
            .collect();
        format!("[{}]", names.join(", "))
    }
}

/// Symbols already linked into the running process
pub struct ProcessLookup {
    library: Library,
}

/// Lookup over the process image and the libraries it was linked against
pub fn default_lookup() -> FfiResult<ProcessLookup> {
    #[cfg(unix)]
    {
        let library = libloading::os::unix::Library::this();
        Ok(ProcessLookup {
            library: library.into(),
        })
    }
    #[cfg(windows)]
    {
        let library = libloading::os::windows::Library::this()
            .map_err(|e| LookupError::LoadFailed(e.to_string()))?;
        Ok(ProcessLookup {
            library: library.into(),
        })
    }
}

impl SymbolLookup for ProcessLookup {
    fn find(&self, name: &str) -> Option<MemorySegment> {
        symbol_address(&self.library, name).map(MemorySegment::of_address)
    }

    fn label(&self) -> String {
        "process image".to_string()
    }
}

const SYSTEM_LIBRARY_DIRS: &[&str] = if cfg!(target_os = "macos") {
    &["/usr/lib", "/usr/local/lib", "/opt/homebrew/lib"]
} else if cfg!(all(target_os = "linux", target_arch = "x86_64")) {
    &[
        "/usr/lib",
        "/usr/local/lib",
        "/lib",
        "/usr/lib64",
        "/lib64",
        "/usr/lib/x86_64-linux-gnu",
        "/lib/x86_64-linux-gnu",
    ]
} else if cfg!(all(target_os = "linux", target_arch = "aarch64")) {
    &[
        "/usr/lib",
        "/usr/local/lib",
        "/lib",
        "/usr/lib64",
        "/lib64",
        "/usr/lib/aarch64-linux-gnu",
        "/lib/aarch64-linux-gnu",
    ]
} else if cfg!(unix) {
    &["/usr/lib", "/usr/local/lib", "/lib"]
} else {
    &[]
};

/// Working directory first, then the platform's system library directories
fn default_search_paths() -> Vec<PathBuf> {
    std::env::current_dir()
        .into_iter()
        .chain(SYSTEM_LIBRARY_DIRS.iter().map(PathBuf::from))
        .collect()
}

/// Platform file name candidates for a short library name
fn candidate_names(name: &str) -> Vec<String> {
    let extensions: &[&str] = if cfg!(target_os = "windows") {
        &["dll"]
    } else if cfg!(target_os = "macos") {
        &["dylib", "so"]
    } else if cfg!(target_os = "aix") {
        &["a", "so"]
    } else {
        &["so", "so.6"]
    };
    let prefixes: &[&str] = if cfg!(target_os = "windows") {
        &["", "lib"]
    } else {
        &["lib", ""]
    };

    let mut names = Vec::new();
    for prefix in prefixes {
        for ext in extensions {
            names.push(format!("{}{}.{}", prefix, name, ext));
        }
    }
    names
}

fn resolve_library_path(search_paths: &[PathBuf], name: &str) -> Option<PathBuf> {
    let path = Path::new(name);
    if path.is_absolute() {
        return path.exists().then(|| path.to_path_buf());
    }
    // a relative path or full file name is tried as given first
    if path.components().count() > 1 || path.extension().is_some() {
        for dir in search_paths {
            let full = dir.join(path);
            if full.exists() {
                return Some(full);
            }
        }
    }

    let candidates = candidate_names(name);
    search_paths.iter().find_map(|dir| {
        candidates
            .iter()
            .map(|file| dir.join(file))
            .find(|full| full.exists())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_working_directory_searched_first() {
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(default_search_paths().first(), Some(&cwd));
    }

    #[test]
    fn test_missing_library_reported() {
        let scope = Scope::auto();
        let mut lookup = LibraryLookup::new(&scope);
        let result = unsafe { lookup.load("nonexistent_library_xyz") };
        assert!(matches!(
            result,
            Err(FfiError::Lookup(LookupError::LibraryNotFound(_)))
        ));
        assert_eq!(lookup.loaded_count(), 0);
    }

    #[test]
    fn test_custom_search_path_first() {
        let mut lookup = LibraryLookup::new(&Scope::auto());
        lookup.add_search_path("/custom/path");
        assert_eq!(lookup.search_paths()[0], PathBuf::from("/custom/path"));
    }

    #[test]
    fn test_resolve_finds_file_in_search_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(candidate_names("fake")[0].clone());
        std::fs::write(&file, b"").unwrap();
        let resolved = resolve_library_path(&[dir.path().to_path_buf()], "fake");
        assert_eq!(resolved, Some(file));
    }

    #[cfg(unix)]
    #[test]
    fn test_process_lookup_finds_libc_symbol() {
        let lookup = default_lookup().unwrap();
        let strlen = lookup.require("strlen").unwrap();
        assert!(!strlen.is_null());
        assert!(lookup.find("definitely_not_a_symbol_xyz").is_none());
    }
}
