//! Synthetic Mach-O files for tests.

use std::io::Write;

use goblin::mach::header::{MH_MAGIC, MH_MAGIC_64};
use goblin::mach::load_command::{
    LC_SEGMENT, LC_SEGMENT_64, SIZEOF_SECTION_32, SIZEOF_SECTION_64, SIZEOF_SEGMENT_COMMAND_32,
    SIZEOF_SEGMENT_COMMAND_64,
};
use tempfile::NamedTempFile;

/// Segment payloads are laid out page by page starting here.
pub(crate) const FIRST_PAYLOAD: usize = 0x1000;

struct TestSection {
    segname: String,
    sectname: String,
    addr: u64,
    size: u64,
}

struct TestSegment {
    name: String,
    vmaddr: u64,
    vmsize: u64,
    data: Vec<u8>,
    sections: Vec<TestSection>,
}

pub(crate) struct MachOBuilder {
    is_64: bool,
    segments: Vec<TestSegment>,
}

impl MachOBuilder {
    pub(crate) fn new(is_64: bool) -> Self {
        Self {
            is_64,
            segments: Vec::new(),
        }
    }

    pub(crate) fn segment(mut self, name: &str, vmaddr: u64, vmsize: u64, data: Vec<u8>) -> Self {
        self.segments.push(TestSegment {
            name: name.to_string(),
            vmaddr,
            vmsize,
            data,
            sections: Vec::new(),
        });
        self
    }

    /// Adds a section to the most recently added segment.
    pub(crate) fn section(mut self, segname: &str, sectname: &str, addr: u64, size: u64) -> Self {
        let segment = self.segments.last_mut().expect("section() needs a segment");
        segment.sections.push(TestSection {
            segname: segname.to_string(),
            sectname: sectname.to_string(),
            addr,
            size,
        });
        self
    }

    /// File offset each segment's payload is written at.
    pub(crate) fn payload_offsets(&self) -> Vec<usize> {
        let mut next = FIRST_PAYLOAD;
        self.segments
            .iter()
            .map(|seg| {
                let at = next;
                next += seg.data.len().div_ceil(0x1000) * 0x1000;
                at
            })
            .collect()
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        let (seg_size, sect_size) = if self.is_64 {
            (SIZEOF_SEGMENT_COMMAND_64, SIZEOF_SECTION_64)
        } else {
            (SIZEOF_SEGMENT_COMMAND_32, SIZEOF_SECTION_32)
        };
        let offsets = self.payload_offsets();

        let mut commands = Vec::new();
        for (seg, &fileoff) in self.segments.iter().zip(&offsets) {
            let cmdsize = seg_size + seg.sections.len() * sect_size;
            put_u32(&mut commands, if self.is_64 { LC_SEGMENT_64 } else { LC_SEGMENT });
            put_u32(&mut commands, cmdsize as u32);
            put_name(&mut commands, &seg.name);
            self.put_word(&mut commands, seg.vmaddr);
            self.put_word(&mut commands, seg.vmsize);
            self.put_word(&mut commands, fileoff as u64);
            self.put_word(&mut commands, seg.data.len() as u64);
            put_u32(&mut commands, 7);
            put_u32(&mut commands, 5);
            put_u32(&mut commands, seg.sections.len() as u32);
            put_u32(&mut commands, 0);
            for sect in &seg.sections {
                put_name(&mut commands, &sect.sectname);
                put_name(&mut commands, &sect.segname);
                self.put_word(&mut commands, sect.addr);
                self.put_word(&mut commands, sect.size);
                let trailing = if self.is_64 { 8 } else { 7 };
                for _ in 0..trailing {
                    put_u32(&mut commands, 0);
                }
            }
        }

        let mut file = Vec::new();
        put_u32(&mut file, if self.is_64 { MH_MAGIC_64 } else { MH_MAGIC });
        put_u32(&mut file, if self.is_64 { 0x0100_000c } else { 12 });
        put_u32(&mut file, 0);
        put_u32(&mut file, 2);
        put_u32(&mut file, self.segments.len() as u32);
        put_u32(&mut file, commands.len() as u32);
        put_u32(&mut file, 0);
        if self.is_64 {
            put_u32(&mut file, 0);
        }
        file.extend_from_slice(&commands);

        for (seg, &fileoff) in self.segments.iter().zip(&offsets) {
            if file.len() < fileoff {
                file.resize(fileoff, 0);
            }
            file.extend_from_slice(&seg.data);
        }
        if file.len() < FIRST_PAYLOAD {
            file.resize(FIRST_PAYLOAD, 0);
        }
        file
    }

    pub(crate) fn write(&self) -> NamedTempFile {
        write_temp(&self.build())
    }

    fn put_word(&self, out: &mut Vec<u8>, value: u64) {
        if self.is_64 {
            out.extend_from_slice(&value.to_le_bytes());
        } else {
            put_u32(out, value as u32);
        }
    }
}

pub(crate) fn write_temp(bytes: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

pub(crate) fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_name(out: &mut Vec<u8>, name: &str) {
    let mut raw = [0u8; 16];
    raw[..name.len()].copy_from_slice(name.as_bytes());
    out.extend_from_slice(&raw);
}
