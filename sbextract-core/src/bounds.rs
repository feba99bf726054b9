//! Checked address translation over a [`LoadedImage`].
//!
//! Every read the scanners perform goes through these helpers; none of them
//! index the image buffer without first proving the access is in bounds.

use std::ops::Range;

use byteorder::{ByteOrder, LE};

use crate::binary::{LoadedImage, MAX_IMAGE_SIZE};
use crate::error::{Error, Result};
use crate::sections::SectionKey;

impl LoadedImage {
    /// Size of a pointer slot: 8 for 64-bit images, 4 otherwise.
    pub fn pointer_width(&self) -> usize {
        if self.is_64 {
            8
        } else {
            4
        }
    }

    /// Translates a virtual address inside `[base, base + len)` to a buffer
    /// offset.
    pub fn to_offset(&self, vmaddr: u64) -> Result<usize> {
        vmaddr
            .checked_sub(self.base)
            .filter(|rel| *rel < self.bytes.len() as u64)
            .map(|rel| rel as usize)
            .ok_or(Error::AddressOutOfRange(vmaddr))
    }

    pub fn to_vmaddr(&self, offset: usize) -> u64 {
        self.base.saturating_add(offset as u64)
    }

    pub fn in_section(&self, key: SectionKey, vmaddr: u64) -> bool {
        self.sections
            .get(&key)
            .is_some_and(|extent| extent.contains_inclusive(vmaddr))
    }

    /// True if `size` bytes starting at `vmaddr` can be read from the image.
    pub fn is_valid_extent(&self, vmaddr: u64, size: u64) -> bool {
        if size >= MAX_IMAGE_SIZE {
            return false;
        }
        vmaddr
            .checked_sub(self.base)
            .and_then(|rel| rel.checked_add(size))
            .is_some_and(|end| end <= self.bytes.len() as u64)
    }

    /// Buffer offsets covered by a tracked section.
    pub fn section_range(&self, key: SectionKey) -> Option<Range<usize>> {
        let extent = self.sections.get(&key)?;
        let start = (extent.addr - self.base) as usize;
        Some(start..start + extent.size as usize)
    }

    pub fn slice(&self, vmaddr: u64, size: u64) -> Result<&[u8]> {
        if !self.is_valid_extent(vmaddr, size) {
            return Err(Error::AddressOutOfRange(vmaddr));
        }
        let start = (vmaddr - self.base) as usize;
        Ok(&self.bytes[start..start + size as usize])
    }

    /// Reads the pointer-sized little-endian slot at buffer `offset`.
    pub fn read_pointer_at(&self, offset: usize) -> Result<u64> {
        let width = self.pointer_width();
        let raw = offset
            .checked_add(width)
            .and_then(|end| self.bytes.get(offset..end))
            .ok_or_else(|| Error::AddressOutOfRange(self.to_vmaddr(offset)))?;
        Ok(if self.is_64 {
            LE::read_u64(raw)
        } else {
            u64::from(LE::read_u32(raw))
        })
    }

    pub fn read_pointer(&self, vmaddr: u64) -> Result<u64> {
        self.read_pointer_at(self.to_offset(vmaddr)?)
    }

    /// Reads a `(pointer, length)` record of two pointer-sized words.
    pub fn read_blob_record(&self, vmaddr: u64) -> Result<(u64, u64)> {
        let width = self.pointer_width() as u64;
        if !self.is_valid_extent(vmaddr, 2 * width) {
            return Err(Error::AddressOutOfRange(vmaddr));
        }
        Ok((self.read_pointer(vmaddr)?, self.read_pointer(vmaddr + width)?))
    }

    /// Reads the NUL-terminated string at `vmaddr`. Invalid UTF-8 is
    /// replaced rather than rejected.
    pub fn c_str(&self, vmaddr: u64) -> Result<String> {
        let start = self.to_offset(vmaddr)?;
        let tail = &self.bytes[start..];
        let len = memchr::memchr(0, tail).ok_or(Error::UnterminatedString(vmaddr))?;
        Ok(String::from_utf8_lossy(&tail[..len]).into_owned())
    }
}
