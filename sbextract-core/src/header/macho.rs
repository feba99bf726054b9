use crate::error::{Error, Result};
use crate::header::Header;
use byteorder::{ReadBytesExt, LE};
use goblin::mach::header::{MH_MAGIC, MH_MAGIC_64, SIZEOF_HEADER_32, SIZEOF_HEADER_64};
use std::io;

/// The 32-bit Mach-O header (`struct mach_header`).
///
/// Only little-endian images are recognised; byte-swapped (`MH_CIGAM`) and
/// fat headers are rejected as not Mach-O.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachHeader32 {
    /// Always `MH_MAGIC` (`0xfeedface`).
    pub magic: u32,
    pub cputype: i32,
    pub cpusubtype: i32,
    /// `MH_EXECUTE`, `MH_KEXT_BUNDLE`, ...
    pub filetype: u32,
    /// Number of load commands.
    pub ncmds: u32,
    /// Size of all load commands, in bytes.
    pub sizeofcmds: u32,
    pub flags: u32,
}

/// The 64-bit Mach-O header (`struct mach_header_64`).
///
/// Identical to [`MachHeader32`] apart from the magic and a trailing
/// reserved word, which makes load commands start 4 bytes later.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachHeader64 {
    /// Always `MH_MAGIC_64` (`0xfeedfacf`).
    pub magic: u32,
    pub cputype: i32,
    pub cpusubtype: i32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
    pub reserved: u32,
}

/// A Mach-O header decoded once according to its magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachHeader {
    Bits32(MachHeader32),
    Bits64(MachHeader64),
}

/// Returns true if `bytes` starts with a thin little-endian Mach-O magic.
pub fn has_macho_magic(bytes: &[u8]) -> bool {
    match bytes.get(..4) {
        Some(&[a, b, c, d]) => {
            let magic = u32::from_le_bytes([a, b, c, d]);
            magic == MH_MAGIC || magic == MH_MAGIC_64
        }
        _ => false,
    }
}

impl MachHeader {
    pub fn from_reader<R: io::Read>(cur: &mut R) -> Result<MachHeader> {
        Self::decode(cur).map_err(|e| match e {
            Error::Io(io) if io.kind() == io::ErrorKind::UnexpectedEof => Error::HeaderRead,
            other => other,
        })
    }

    fn decode<R: io::Read>(cur: &mut R) -> Result<MachHeader> {
        let magic = cur.read_u32::<LE>()?;
        if magic != MH_MAGIC && magic != MH_MAGIC_64 {
            return Err(Error::NotMachO { magic });
        }

        let cputype = cur.read_i32::<LE>()?;
        let cpusubtype = cur.read_i32::<LE>()?;
        let filetype = cur.read_u32::<LE>()?;
        let ncmds = cur.read_u32::<LE>()?;
        let sizeofcmds = cur.read_u32::<LE>()?;
        let flags = cur.read_u32::<LE>()?;

        if magic == MH_MAGIC {
            return Ok(MachHeader::Bits32(MachHeader32 {
                magic,
                cputype,
                cpusubtype,
                filetype,
                ncmds,
                sizeofcmds,
                flags,
            }));
        }

        Ok(MachHeader::Bits64(MachHeader64 {
            magic,
            cputype,
            cpusubtype,
            filetype,
            ncmds,
            sizeofcmds,
            flags,
            reserved: cur.read_u32::<LE>()?,
        }))
    }

    fn inner(&self) -> &dyn Header {
        match self {
            MachHeader::Bits32(h) => h,
            MachHeader::Bits64(h) => h,
        }
    }
}

impl Header for MachHeader32 {
    fn cpu_type(&self) -> i32 {
        self.cputype
    }

    fn file_type(&self) -> u32 {
        self.filetype
    }

    fn is_64(&self) -> bool {
        false
    }

    fn format_name(&self) -> &'static str {
        "Mach-O 32"
    }

    fn ncmds(&self) -> u32 {
        self.ncmds
    }

    fn sizeofcmds(&self) -> u32 {
        self.sizeofcmds
    }

    fn header_size(&self) -> usize {
        SIZEOF_HEADER_32
    }
}

impl Header for MachHeader64 {
    fn cpu_type(&self) -> i32 {
        self.cputype
    }

    fn file_type(&self) -> u32 {
        self.filetype
    }

    fn is_64(&self) -> bool {
        true
    }

    fn format_name(&self) -> &'static str {
        "Mach-O 64"
    }

    fn ncmds(&self) -> u32 {
        self.ncmds
    }

    fn sizeofcmds(&self) -> u32 {
        self.sizeofcmds
    }

    fn header_size(&self) -> usize {
        SIZEOF_HEADER_64
    }
}

impl Header for MachHeader {
    fn cpu_type(&self) -> i32 {
        self.inner().cpu_type()
    }

    fn file_type(&self) -> u32 {
        self.inner().file_type()
    }

    fn is_64(&self) -> bool {
        self.inner().is_64()
    }

    fn format_name(&self) -> &'static str {
        self.inner().format_name()
    }

    fn ncmds(&self) -> u32 {
        self.inner().ncmds()
    }

    fn sizeofcmds(&self) -> u32 {
        self.inner().sizeofcmds()
    }

    fn header_size(&self) -> usize {
        self.inner().header_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn raw_header(magic: u32, ncmds: u32, sizeofcmds: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        for word in [magic, 0x0100_000c, 0, 2, ncmds, sizeofcmds, 0, 0] {
            buf.extend_from_slice(&word.to_le_bytes());
        }
        buf
    }

    #[test]
    fn decodes_64_bit_header() {
        let buf = raw_header(MH_MAGIC_64, 3, 0x200);
        let header = MachHeader::from_reader(&mut Cursor::new(&buf)).unwrap();
        assert!(matches!(header, MachHeader::Bits64(_)));
        assert!(header.is_64());
        assert_eq!(header.ncmds(), 3);
        assert_eq!(header.sizeofcmds(), 0x200);
        assert_eq!(header.header_size(), 32);
        assert_eq!(header.cpu_type(), 0x0100_000c);
    }

    #[test]
    fn decodes_32_bit_header() {
        let buf = raw_header(MH_MAGIC, 1, 56);
        let header = MachHeader::from_reader(&mut Cursor::new(&buf)).unwrap();
        assert!(!header.is_64());
        assert_eq!(header.header_size(), 28);
        assert_eq!(header.format_name(), "Mach-O 32");
    }

    #[test]
    fn rejects_foreign_magic() {
        let buf = raw_header(0xcafe_babe, 0, 0);
        let err = MachHeader::from_reader(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(err, Error::NotMachO { magic: 0xcafe_babe }));
    }

    #[test]
    fn foreign_magic_wins_over_short_input() {
        let buf = *b"\x7fELF";
        let err = MachHeader::from_reader(&mut Cursor::new(&buf[..])).unwrap_err();
        assert!(matches!(err, Error::NotMachO { .. }));
    }

    #[test]
    fn short_input_is_a_header_read_error() {
        let buf = MH_MAGIC_64.to_le_bytes();
        let err = MachHeader::from_reader(&mut Cursor::new(&buf[..])).unwrap_err();
        assert!(matches!(err, Error::HeaderRead));
    }

    #[test]
    fn magic_probe() {
        assert!(has_macho_magic(&MH_MAGIC.to_le_bytes()));
        assert!(has_macho_magic(&MH_MAGIC_64.to_le_bytes()));
        assert!(!has_macho_magic(b"\x7fELF"));
        assert!(!has_macho_magic(&[0xcf, 0xfa]));
    }
}
