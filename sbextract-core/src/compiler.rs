//! Compilation of textual sandbox profiles.
//!
//! The compiler itself lives in the system's `libsandbox`; this module only
//! hands it a path and copies out the opaque buffer it returns.

use std::path::Path;

use crate::error::Result;

pub trait ProfileCompiler {
    /// Compiles the profile script at `path` into its binary form.
    fn compile(&self, path: &Path) -> Result<Vec<u8>>;
}

/// The platform's own profile compiler.
#[derive(Debug, Clone, Copy, Default)]
pub struct SandboxCompiler {
    /// Mode flag passed through to `sandbox_compile_file`.
    pub mode: i32,
}

impl ProfileCompiler for SandboxCompiler {
    fn compile(&self, path: &Path) -> Result<Vec<u8>> {
        // libsandbox needs the full path
        let path = std::fs::canonicalize(path)?;
        log::info!("compiling sandbox profile {}", path.display());
        let compiled = native::compile_file(&path, self.mode)?;
        log::debug!("compiled profile is {} bytes", compiled.len());
        Ok(compiled)
    }
}

#[cfg(target_os = "macos")]
mod native {
    use std::ffi::{c_char, c_int, c_uint, c_void, CStr, CString};
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    use crate::error::{Error, Result};

    #[repr(C)]
    struct SandboxProfile {
        #[allow(dead_code)]
        kind: c_uint,
        data: *const c_void,
        data_len: usize,
    }

    #[link(name = "sandbox")]
    extern "C" {
        fn sandbox_compile_file(
            path: *const c_char,
            mode: c_int,
            error: *mut *mut c_char,
        ) -> *mut SandboxProfile;
        fn sandbox_free_profile(profile: *mut SandboxProfile);
    }

    pub(super) fn compile_file(path: &Path, mode: i32) -> Result<Vec<u8>> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| Error::Compile("path contains a NUL byte".to_string()))?;
        let mut error: *mut c_char = std::ptr::null_mut();

        // SAFETY: `c_path` outlives the call and `error` is a valid out slot.
        let profile = unsafe { sandbox_compile_file(c_path.as_ptr(), mode, &mut error) };
        if profile.is_null() {
            let message = if error.is_null() {
                "unknown error".to_string()
            } else {
                // SAFETY: libsandbox hands back a malloc'd NUL-terminated
                // string that the caller owns.
                unsafe {
                    let message = CStr::from_ptr(error).to_string_lossy().into_owned();
                    libc::free(error.cast());
                    message
                }
            };
            return Err(Error::Compile(message));
        }

        // SAFETY: a non-null profile stays valid until it is freed below.
        let data = unsafe {
            let profile = &*profile;
            if profile.data.is_null() {
                Vec::new()
            } else {
                std::slice::from_raw_parts(profile.data.cast::<u8>(), profile.data_len).to_vec()
            }
        };
        unsafe { sandbox_free_profile(profile) };
        Ok(data)
    }
}

#[cfg(not(target_os = "macos"))]
mod native {
    use std::path::Path;

    use crate::error::{Error, Result};

    pub(super) fn compile_file(_path: &Path, _mode: i32) -> Result<Vec<u8>> {
        Err(Error::Unsupported("sandbox profile compilation"))
    }
}
