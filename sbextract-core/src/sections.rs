use std::fmt;
use std::io::{self, Cursor, Read};

use byteorder::{ByteOrder, ReadBytesExt, LE};
use goblin::mach::load_command::{
    LC_SEGMENT, LC_SEGMENT_64, SIZEOF_SECTION_32, SIZEOF_SECTION_64, SIZEOF_SEGMENT_COMMAND_32,
    SIZEOF_SEGMENT_COMMAND_64,
};

use crate::error::{Error, Result};

/// Segment name of the unmapped low page; never loaded.
pub const PAGEZERO: &str = "__PAGEZERO";

/// Upper bound on sections per segment accepted from untrusted input.
pub const MAX_SECTIONS: u32 = 1000;

/// A `(segment, section)` name pair identifying a tracked section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionKey {
    pub segment: &'static str,
    pub section: &'static str,
}

impl SectionKey {
    /// C string literals.
    pub const TEXT_CSTRING: SectionKey = SectionKey::new("__TEXT", "__cstring");
    /// Constant pointer arrays.
    pub const DATA_CONST: SectionKey = SectionKey::new("__DATA", "__const");
    /// Initialised mutable data.
    pub const DATA_DATA: SectionKey = SectionKey::new("__DATA", "__data");

    /// Sections whose extents are recorded while loading.
    pub const TRACKED: [SectionKey; 3] = [Self::TEXT_CSTRING, Self::DATA_CONST, Self::DATA_DATA];

    pub const fn new(segment: &'static str, section: &'static str) -> Self {
        Self { segment, section }
    }

    pub fn matches(&self, section: &Section) -> bool {
        self.segment == section.segname && self.section == section.sectname
    }
}

impl fmt::Display for SectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.segment, self.section)
    }
}

/// A virtual address range `[addr, addr + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub addr: u64,
    pub size: u64,
}

impl Extent {
    pub fn new(addr: u64, size: u64) -> Self {
        Self { addr, size }
    }

    /// Membership with the end address counted as inside, which is how the
    /// table heuristics have always treated section bounds.
    pub fn contains_inclusive(&self, vmaddr: u64) -> bool {
        vmaddr >= self.addr && vmaddr - self.addr <= self.size
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub sectname: String,
    pub segname: String,
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub is_64: bool,
    pub sections: Vec<Section>,
}

impl Segment {
    pub fn is_pagezero(&self) -> bool {
        self.name == PAGEZERO
    }

    /// Number of bytes copied from the file into memory.
    pub fn load_size(&self) -> u64 {
        self.filesize.min(self.vmsize)
    }

    /// Parses an `LC_SEGMENT`/`LC_SEGMENT_64` command.
    ///
    /// `raw` starts at the command and runs to the end of the load command
    /// area; `cmdsize` is the size the command declares for itself.
    pub fn parse(raw: &[u8], cmdsize: usize, is_64: bool, index: u32) -> Result<Self> {
        let (header_size, section_size) = if is_64 {
            (SIZEOF_SEGMENT_COMMAND_64, SIZEOF_SECTION_64)
        } else {
            (SIZEOF_SEGMENT_COMMAND_32, SIZEOF_SECTION_32)
        };
        if cmdsize < header_size || raw.len() < header_size {
            return Err(Error::IllegalLoadCommand { index });
        }

        let mut cur = Cursor::new(&raw[8..header_size]);
        let name = read_name(&mut cur)?;
        let vmaddr = read_word(&mut cur, is_64)?;
        let vmsize = read_word(&mut cur, is_64)?;
        let fileoff = read_word(&mut cur, is_64)?;
        let filesize = read_word(&mut cur, is_64)?;
        let _maxprot = cur.read_i32::<LE>()?;
        let _initprot = cur.read_i32::<LE>()?;
        let nsects = cur.read_u32::<LE>()?;

        // checked for __PAGEZERO as well, which is stricter than skipping it
        let needed = nsects as u64 * section_size as u64 + header_size as u64;
        if nsects > MAX_SECTIONS || needed > cmdsize as u64 {
            return Err(Error::IllegalSectionCount {
                segment: name,
                count: nsects,
            });
        }

        let body = raw
            .get(header_size..cmdsize)
            .ok_or(Error::IllegalLoadCommand { index })?;
        let mut cur = Cursor::new(body);
        let mut sections = Vec::with_capacity(nsects as usize);
        for _ in 0..nsects {
            sections.push(Section::from_reader(&mut cur, is_64)?);
        }

        log::debug!(
            "segment {name:<16} vmaddr={vmaddr:#x} vmsize={vmsize:#x} fileoff={fileoff:#x} filesize={filesize:#x} nsects={nsects}"
        );

        Ok(Segment {
            name,
            vmaddr,
            vmsize,
            fileoff,
            filesize,
            is_64,
            sections,
        })
    }
}

impl Section {
    fn from_reader<R: Read>(cur: &mut R, is_64: bool) -> io::Result<Self> {
        let sectname = read_name(cur)?;
        let segname = read_name(cur)?;
        let addr = read_word(cur, is_64)?;
        let size = read_word(cur, is_64)?;
        let offset = cur.read_u32::<LE>()?;
        // align, reloff, nreloc, flags, reserved1, reserved2 (+ reserved3)
        let trailing = if is_64 { 7 } else { 6 };
        for _ in 0..trailing {
            cur.read_u32::<LE>()?;
        }

        Ok(Section {
            sectname,
            segname,
            addr,
            size,
            offset,
        })
    }
}

/// Walks `ncmds` load commands in `commands` and collects every segment.
///
/// Commands must lie entirely inside `commands`; anything else is an
/// [`Error::IllegalLoadCommand`].
pub fn parse_segments(commands: &[u8], ncmds: u32) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut offset = 0usize;

    for index in 0..ncmds {
        let raw = commands
            .get(offset..)
            .filter(|raw| raw.len() >= 8)
            .ok_or(Error::IllegalLoadCommand { index })?;
        let cmd = LE::read_u32(&raw[0..4]);
        let cmdsize = LE::read_u32(&raw[4..8]) as usize;
        if cmdsize < 8 {
            return Err(Error::IllegalLoadCommand { index });
        }

        match cmd {
            LC_SEGMENT_64 => segments.push(Segment::parse(raw, cmdsize, true, index)?),
            LC_SEGMENT => segments.push(Segment::parse(raw, cmdsize, false, index)?),
            _ => log::trace!("skipping load command {cmd:#x} ({cmdsize} bytes)"),
        }

        if cmdsize > raw.len() {
            return Err(Error::IllegalLoadCommand { index });
        }
        offset += cmdsize;
    }

    Ok(segments)
}

fn read_name<R: Read>(cur: &mut R) -> io::Result<String> {
    let mut raw = [0u8; 16];
    cur.read_exact(&mut raw)?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
}

fn read_word<R: Read>(cur: &mut R, is_64: bool) -> io::Result<u64> {
    if is_64 {
        cur.read_u64::<LE>()
    } else {
        cur.read_u32::<LE>().map(u64::from)
    }
}
