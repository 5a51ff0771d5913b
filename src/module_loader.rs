//! Materialization module loader (C12).
//!
//! The actual "make a directory exist for this name" policy is pluggable:
//! it lives in a dynamically loaded shared object exposing four C symbols
//! (`module_init`, `module_dir`, `module_dowork`, `module_clean`). This
//! mirrors the original's `libltdl`-based loader with `libloading`, the
//! crate the rest of this corpus reaches for when it needs `dlopen`.
//!
//! Before loading, the module file is checked the way the original's
//! `module_check()` does: must be a regular file, not owned by anyone but
//! root, and not world-writable — loading an untrusted `.so` as root is
//! the single riskiest thing this daemon does.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use libloading::{Library, Symbol};

use crate::error::ModuleError;

/// Last three digits are minor, remaining digits are major — matches the
/// original's `MODULE_PROTOCOL_SUPPORTED`.
const MODULE_PROTOCOL_SUPPORTED: i32 = 1001;

#[repr(C)]
struct ModuleInfoRaw {
    name: *const c_char,
    protocol: c_int,
}

type ModuleInitFn = unsafe extern "C" fn(subopt: *mut c_char, autofs_root: *const c_char) -> *const ModuleInfoRaw;
type ModuleDirFn = unsafe extern "C" fn(path: *mut c_char, size: c_int, name: *const c_char);
type ModuleDoworkFn =
    unsafe extern "C" fn(name: *const c_char, autofs_root: *const c_char, rpath: *mut c_char, size: c_int) -> c_int;
type ModuleCleanFn = unsafe extern "C" fn();

const PATH_BUF_SIZE: usize = 4096;

/// A loaded materialization module. Must outlive any `CString` produced
/// by calls into it; the library is `dlclose`d (after `module_clean()`)
/// on drop.
pub struct Module {
    // Kept alive for the lifetime of the resolved symbols below; never
    // read directly once loaded.
    _lib: Library,
    init: ModuleInitFn,
    dir: ModuleDirFn,
    dowork: ModuleDoworkFn,
    clean: ModuleCleanFn,
    name: String,
}

impl Module {
    /// Validate, load, and initialize the module at `path`, passing
    /// `subopt` (the `-o` suboption string, if any) and `autofs_root`
    /// (the mount point) to `module_init`.
    pub fn load(path: &Path, subopt: Option<&str>, autofs_root: &str) -> Result<Self, ModuleError> {
        check_module_file(path)?;

        // SAFETY: `path` has just been verified to be a regular,
        // root-owned, non-world-writable file.
        let lib = unsafe { Library::new(path) }?;

        let init: ModuleInitFn = unsafe { resolve(&lib, "module_init")? };
        let dir: ModuleDirFn = unsafe { resolve(&lib, "module_dir")? };
        let dowork: ModuleDoworkFn = unsafe { resolve(&lib, "module_dowork")? };
        let clean: ModuleCleanFn = unsafe { resolve(&lib, "module_clean")? };

        let mut subopt_buf = subopt.map(|s| CString::new(s).unwrap_or_default().into_bytes_with_nul());
        let subopt_ptr = subopt_buf
            .as_mut()
            .map(|b| b.as_mut_ptr() as *mut c_char)
            .unwrap_or(std::ptr::null_mut());
        let root_c = CString::new(autofs_root).unwrap_or_default();

        // SAFETY: all four symbols were just resolved from the loaded
        // library and match the ABI the module contract defines.
        let info = unsafe { init(subopt_ptr, root_c.as_ptr()) };
        if info.is_null() {
            return Err(ModuleError::InitFailed);
        }
        let info = unsafe { &*info };

        if info.protocol != MODULE_PROTOCOL_SUPPORTED {
            return Err(ModuleError::ProtocolMismatch {
                got: info.protocol as u32,
                want: MODULE_PROTOCOL_SUPPORTED as u32,
            });
        }
        if info.name.is_null() {
            return Err(ModuleError::EmptyName);
        }
        let name = unsafe { CStr::from_ptr(info.name) }.to_string_lossy().into_owned();
        if name.is_empty() {
            return Err(ModuleError::EmptyName);
        }

        log::info!("module {} loaded from {}", name, path.display());

        Ok(Self {
            _lib: lib,
            init,
            dir,
            dowork,
            clean,
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Where the module would materialize `name` as a directory, before
    /// any actual work is done — used to create the mountpoint itself.
    pub fn dir(&self, name: &str) -> PathBuf {
        let name_c = CString::new(name).unwrap_or_default();
        let mut buf = vec![0u8; PATH_BUF_SIZE];
        // SAFETY: `buf` is sized and the module writes at most `size`
        // bytes including the terminator, per the module ABI contract.
        unsafe {
            (self.dir)(buf.as_mut_ptr() as *mut c_char, buf.len() as c_int, name_c.as_ptr());
        }
        let nul = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        buf.truncate(nul);
        PathBuf::from(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Do whatever work is needed to materialize `name` under
    /// `autofs_root`, returning the real path to bind-mount on success.
    pub fn dowork(&self, name: &str, autofs_root: &str) -> Option<PathBuf> {
        let name_c = CString::new(name).unwrap_or_default();
        let root_c = CString::new(autofs_root).unwrap_or_default();
        let mut buf = vec![0u8; PATH_BUF_SIZE];
        // SAFETY: same buffer contract as `dir`.
        let ok = unsafe {
            (self.dowork)(
                name_c.as_ptr(),
                root_c.as_ptr(),
                buf.as_mut_ptr() as *mut c_char,
                buf.len() as c_int,
            )
        };
        if ok == 0 {
            return None;
        }
        let nul = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        buf.truncate(nul);
        Some(PathBuf::from(String::from_utf8_lossy(&buf).into_owned()))
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        // SAFETY: module_clean takes no arguments and must be callable
        // any number of times before the library is unloaded.
        unsafe { (self.clean)() };
    }
}

unsafe fn resolve<T: Copy>(lib: &Library, name: &'static str) -> Result<T, ModuleError> {
    let sym: Symbol<T> = lib.get(name.as_bytes()).map_err(|_| ModuleError::MissingSymbol(name))?;
    Ok(*sym)
}

fn check_module_file(path: &Path) -> Result<(), ModuleError> {
    let meta = std::fs::metadata(path).map_err(|_| ModuleError::NotRegularFile(path.to_path_buf()))?;
    if !meta.is_file() {
        return Err(ModuleError::NotRegularFile(path.to_path_buf()));
    }
    if meta.mode() & 0o002 != 0 {
        return Err(ModuleError::WorldWritable(path.to_path_buf()));
    }
    if meta.uid() != 0 {
        return Err(ModuleError::NotOwnedByRoot(path.to_path_buf()));
    }
    Ok(())
}
