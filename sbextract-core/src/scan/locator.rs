use memchr::memmem;

use crate::binary::PAGE_SIZE;
use crate::error::{Error, Result};
use crate::header::macho::has_macho_magic;
use crate::scan::Scanner;

/// Bundle identifier of the sandbox kernel extension.
pub const SANDBOX_BUNDLE_ID: &str = "com.apple.security.sandbox";

/// Width of the zero-padded name field of a `kmod_info` record; the version
/// string follows directly.
pub const KMOD_MAX_NAME: usize = 64;

impl<'a> Scanner<'a> {
    /// Offset of the first occurrence of `pattern` at or after `from`.
    pub fn find_bytes(&self, pattern: &[u8], from: usize) -> Option<usize> {
        let haystack = self.image.bytes().get(from..)?;
        memmem::find(haystack, pattern).map(|pos| from + pos)
    }

    /// Finds the Mach-O header of the image embedding `marker`.
    ///
    /// Embedded images start on a page boundary, so only page-aligned
    /// offsets at or below `marker` are probed, nearest first.
    pub fn find_embedded_header(&self, marker: usize) -> Result<usize> {
        let bytes = self.image.bytes();
        let mut pos = marker & !(PAGE_SIZE - 1);
        loop {
            if bytes.get(pos..).is_some_and(has_macho_magic) {
                log::debug!("embedded Mach-O header at offset {pos:#x} (marker {marker:#x})");
                return Ok(pos);
            }
            if pos < PAGE_SIZE {
                return Err(Error::DriverNotFound);
            }
            pos -= PAGE_SIZE;
        }
    }

    /// Locates the kernel extension registered as `bundle_id` and returns the
    /// offset of its Mach-O header.
    ///
    /// The anchor is the extension's `kmod_info`: the identifier padded with
    /// NULs to [`KMOD_MAX_NAME`] bytes and followed by a version string that
    /// starts with a digit. Hits without a version digit are skipped.
    pub fn find_kext(&self, bundle_id: &str) -> Result<usize> {
        if bundle_id.is_empty() || bundle_id.len() >= KMOD_MAX_NAME {
            return Err(Error::DriverNotFound);
        }
        let mut pattern = bundle_id.as_bytes().to_vec();
        pattern.resize(KMOD_MAX_NAME, 0);

        let bytes = self.image.bytes();
        let mut cursor = 0;
        while let Some(pos) = self.find_bytes(&pattern, cursor) {
            if bytes
                .get(pos + KMOD_MAX_NAME)
                .is_some_and(u8::is_ascii_digit)
            {
                log::info!("kmod_info for {bundle_id} at offset {pos:#x}");
                return self.find_embedded_header(pos);
            }
            cursor = pos + 1;
        }
        Err(Error::DriverNotFound)
    }

    pub fn find_sandbox_driver(&self) -> Result<usize> {
        self.find_kext(SANDBOX_BUNDLE_ID)
    }
}
