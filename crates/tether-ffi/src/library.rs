//! Native library loading and per-library call state.
//!
//! Loading is delegated to `libloading`; on POSIX the library is opened with
//! immediate symbol resolution (`RTLD_NOW`). A `None` path binds to the
//! current process through a single shared module handle that is never
//! closed.

use std::ffi::CString;
use std::os::raw::c_void;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::alloc::{CallStack, TempAlloc};
use crate::error::{FfiError, Result};

/// The synthetic handle for the process's own symbol table.
static SELF_MODULE: Lazy<std::result::Result<libloading::Library, String>> =
    Lazy::new(|| open_self().map_err(|e| e.to_string()));

#[cfg(unix)]
fn open_self() -> std::result::Result<libloading::Library, libloading::Error> {
    Ok(libloading::os::unix::Library::this().into())
}

#[cfg(windows)]
fn open_self() -> std::result::Result<libloading::Library, libloading::Error> {
    libloading::os::windows::Library::this().map(Into::into)
}

#[cfg(unix)]
fn open_path(path: &Path) -> std::result::Result<libloading::Library, libloading::Error> {
    use libloading::os::unix::{Library, RTLD_LOCAL, RTLD_NOW};
    unsafe { Library::open(Some(path), RTLD_NOW | RTLD_LOCAL).map(Into::into) }
}

#[cfg(windows)]
fn open_path(path: &Path) -> std::result::Result<libloading::Library, libloading::Error> {
    // libloading converts the path to UTF-16 for LoadLibraryW.
    unsafe { libloading::Library::new(path) }
}

enum ModuleRef {
    Loaded(libloading::Library),
    /// The current process; shared, never unloaded.
    Process(&'static libloading::Library),
}

/// A loaded module plus enough context for error messages.
pub struct NativeLibrary {
    module: ModuleRef,
    name: String,
}

impl NativeLibrary {
    /// Open a shared library, or bind to the current process when `path` is
    /// `None`.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let module = open_path(path).map_err(|e| {
                    FfiError::load(format!("cannot load '{}': {}", path.display(), e))
                })?;
                let name = path.display().to_string();
                log::debug!("loaded library '{name}'");
                Ok(NativeLibrary {
                    module: ModuleRef::Loaded(module),
                    name,
                })
            }
            None => {
                let module = SELF_MODULE
                    .as_ref()
                    .map_err(|e| FfiError::load(format!("cannot bind current process: {e}")))?;
                Ok(NativeLibrary {
                    module: ModuleRef::Process(module),
                    name: "<process>".to_string(),
                })
            }
        }
    }

    /// Resolve an exported symbol to its raw address.
    pub fn resolve(&self, symbol: &str) -> Result<*const c_void> {
        let c_name = CString::new(symbol)
            .map_err(|_| FfiError::load(format!("invalid symbol name '{symbol}'")))?;
        let module = match &self.module {
            ModuleRef::Loaded(m) => m,
            ModuleRef::Process(m) => m,
        };
        let sym = unsafe {
            module
                .get::<unsafe extern "C" fn()>(c_name.as_bytes_with_nul())
                .map_err(|e| {
                    FfiError::load(format!("cannot find '{}' in '{}': {}", symbol, self.name, e))
                })?
        };
        let addr = unsafe { sym.try_as_raw_ptr() }
            .ok_or_else(|| FfiError::load(format!("cannot take address of '{symbol}'")))?;
        Ok(addr as *const c_void)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// State shared by every function loaded from one library.
///
/// Dropped (and the module unloaded) when the last callable created from the
/// library goes away; the current-process module is the exception and stays
/// open.
pub struct LibraryData {
    pub library: NativeLibrary,
    pub call_stack: CallStack,
    pub tmp_alloc: TempAlloc,
}

impl LibraryData {
    pub fn open(path: Option<&Path>) -> Result<Arc<Self>> {
        Ok(Arc::new(LibraryData {
            library: NativeLibrary::open(path)?,
            call_stack: CallStack::new(),
            tmp_alloc: TempAlloc::new(),
        }))
    }
}

impl Drop for LibraryData {
    fn drop(&mut self) {
        if matches!(self.module_ref(), ModuleRef::Loaded(_)) {
            log::debug!("unloading library '{}'", self.library.name);
        }
    }
}

impl LibraryData {
    fn module_ref(&self) -> &ModuleRef {
        &self.library.module
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_is_load_failure() {
        let err = NativeLibrary::open(Some(Path::new("/nonexistent/libtether-missing.so")))
            .err()
            .unwrap_or_else(|| panic!("expected load failure"));
        assert!(matches!(err, FfiError::LoadFailure(_)));
    }

    #[test]
    fn process_handle_resolves_libc_symbols() {
        let lib = NativeLibrary::open(None).unwrap();
        let addr = lib.resolve("strlen").unwrap();
        assert!(!addr.is_null());
    }

    #[test]
    fn missing_symbol_is_load_failure() {
        let lib = NativeLibrary::open(None).unwrap();
        let err = lib.resolve("tether_definitely_not_a_symbol").unwrap_err();
        assert!(matches!(err, FfiError::LoadFailure(_)));
    }
}
