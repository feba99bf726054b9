use crate::error::{Error, Result};
use crate::header::{Header, MachHeader};
use crate::sections::{parse_segments, Extent, SectionKey, Segment};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

/// Only this much of the file is read to find the header and load commands.
pub const HEADER_PREFIX_SIZE: usize = 4096;

/// Largest virtual span (and largest single extent) accepted from a file.
pub const MAX_IMAGE_SIZE: u64 = 100 * 1024 * 1024;

pub const PAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Sections that must be present, otherwise loading fails with
    /// [`Error::UnexpectedLayout`].
    pub required_sections: Vec<SectionKey>,
}

impl LoadOptions {
    /// Requirements of the built-in profile scan.
    pub fn profiles() -> Self {
        Self {
            required_sections: SectionKey::TRACKED.to_vec(),
        }
    }
}

/// The virtual address space of a Mach-O file, rebuilt in one buffer.
///
/// Byte `i` of the buffer holds the content of virtual address `base + i`.
/// Gaps between segments and the tail of segments whose virtual size exceeds
/// their file size are zero.
#[derive(Debug)]
pub struct LoadedImage {
    pub path: String,
    pub header: MachHeader,
    pub segments: Vec<Segment>,
    pub(crate) bytes: Vec<u8>,
    pub(crate) is_64: bool,
    pub(crate) base: u64,
    pub(crate) sections: HashMap<SectionKey, Extent>,
}

impl LoadedImage {
    pub fn open<P: AsRef<Path>>(path: P, options: &LoadOptions) -> Result<Self> {
        let mut file = File::open(&path)?;

        let mut prefix = Vec::with_capacity(HEADER_PREFIX_SIZE);
        (&mut file)
            .take(HEADER_PREFIX_SIZE as u64)
            .read_to_end(&mut prefix)?;

        let header = MachHeader::from_reader(&mut Cursor::new(&prefix))?;
        let commands_start = header.header_size();
        let available = HEADER_PREFIX_SIZE - commands_start;
        let declared = header.sizeofcmds();
        if declared as usize > available {
            return Err(Error::HeaderTooLong {
                declared,
                available,
            });
        }
        let commands = prefix
            .get(commands_start..commands_start + declared as usize)
            .ok_or(Error::HeaderRead)?;

        let segments = parse_segments(commands, header.ncmds())?;
        let (base, span) = vm_span(&segments)?;
        log::info!(
            "{}: {} with {} segments, image {:#x}..{:#x}",
            path.as_ref().display(),
            header.format_name(),
            segments.len(),
            base,
            base + span
        );

        let mut bytes = vec![0u8; span as usize];
        let copied = prefix.len().min(bytes.len());
        bytes[..copied].copy_from_slice(&prefix[..copied]);

        let mut sections = HashMap::new();
        for seg in segments.iter().filter(|seg| !seg.is_pagezero()) {
            let dest = (seg.vmaddr - base) as usize;
            let size = seg.load_size() as usize;
            file.seek(SeekFrom::Start(seg.fileoff))?;
            file.read_exact(&mut bytes[dest..dest + size])
                .map_err(|e| match e.kind() {
                    io::ErrorKind::UnexpectedEof => Error::SegmentRead {
                        segment: seg.name.clone(),
                    },
                    _ => Error::Io(e),
                })?;

            for section in &seg.sections {
                let Some(key) = SectionKey::TRACKED.into_iter().find(|k| k.matches(section)) else {
                    continue;
                };
                let inside = section.addr >= base
                    && section
                        .addr
                        .checked_add(section.size)
                        .is_some_and(|end| end <= base + span);
                if inside {
                    sections.insert(key, Extent::new(section.addr, section.size));
                } else {
                    log::warn!(
                        "section {key} at {:#x} (+{:#x}) lies outside the image, ignoring it",
                        section.addr,
                        section.size
                    );
                }
            }
        }

        if let Some(missing) = options
            .required_sections
            .iter()
            .find(|key| !sections.contains_key(*key))
        {
            return Err(Error::UnexpectedLayout(*missing));
        }

        Ok(Self {
            path: path.as_ref().display().to_string(),
            is_64: header.is_64(),
            header,
            segments,
            bytes,
            base,
            sections,
        })
    }

    /// Lowest virtual address of the image.
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn is_64(&self) -> bool {
        self.is_64
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Extent of a tracked section, if the file has it.
    pub fn section(&self, key: SectionKey) -> Option<Extent> {
        self.sections.get(&key).copied()
    }

    #[cfg(test)]
    pub(crate) fn from_parts(
        bytes: Vec<u8>,
        is_64: bool,
        base: u64,
        sections: &[(SectionKey, Extent)],
    ) -> Self {
        use crate::header::{MachHeader32, MachHeader64};
        use goblin::mach::header::{MH_MAGIC, MH_MAGIC_64};

        let header = if is_64 {
            MachHeader::Bits64(MachHeader64 {
                magic: MH_MAGIC_64,
                cputype: 0,
                cpusubtype: 0,
                filetype: 0,
                ncmds: 0,
                sizeofcmds: 0,
                flags: 0,
                reserved: 0,
            })
        } else {
            MachHeader::Bits32(MachHeader32 {
                magic: MH_MAGIC,
                cputype: 0,
                cpusubtype: 0,
                filetype: 0,
                ncmds: 0,
                sizeofcmds: 0,
                flags: 0,
            })
        };
        Self {
            path: String::new(),
            header,
            segments: Vec::new(),
            bytes,
            is_64,
            base,
            sections: sections.iter().copied().collect(),
        }
    }
}

/// Returns `(lowest vmaddr, span)` over every segment except `__PAGEZERO`.
fn vm_span(segments: &[Segment]) -> Result<(u64, u64)> {
    let mut lowest = u64::MAX;
    let mut highest = 0u64;

    for seg in segments.iter().filter(|seg| !seg.is_pagezero()) {
        let end = seg.vmaddr.checked_add(seg.vmsize).ok_or(Error::ImageTooBig {
            span: u64::MAX,
            limit: MAX_IMAGE_SIZE,
        })?;
        lowest = lowest.min(seg.vmaddr);
        highest = highest.max(end);
    }

    if highest <= lowest {
        return Err(Error::NoSegments);
    }
    let span = highest - lowest;
    if span > MAX_IMAGE_SIZE {
        return Err(Error::ImageTooBig {
            span,
            limit: MAX_IMAGE_SIZE,
        });
    }
    Ok((lowest, span))
}
