use std::fmt;

use crate::binary::LoadedImage;
use crate::error::{Error, Result};
use crate::scan::Scanner;
use crate::sections::SectionKey;

/// A name table needs more than this many consecutive string pointers.
pub const MIN_NAME_RUN: usize = 3;

/// The default operation is always the first entry of the operation table.
pub const DEFAULT_OPERATION: &[u8] = b"default\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// Pointers into `__TEXT,__cstring`.
    ProfileNames,
    /// Pointers to `(blob, length)` records in `__DATA,__data`.
    ProfileData,
    /// Pointers to operation name strings inside an embedded driver.
    OperationNames,
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TableKind::ProfileNames => "profile names",
            TableKind::ProfileData => "profile data",
            TableKind::OperationNames => "operation names",
        };
        write!(f, "{}", name)
    }
}

/// A run of pointer-sized slots inside a [`LoadedImage`].
///
/// For [`TableKind::OperationNames`] the length is only the number of slots
/// left before the end of the image; the walker decides where the table
/// really ends.
#[derive(Debug, Clone, Copy)]
pub struct Table<'a> {
    image: &'a LoadedImage,
    kind: TableKind,
    start: usize,
    len: usize,
}

impl<'a> Table<'a> {
    pub fn image(&self) -> &'a LoadedImage {
        self.image
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    /// Buffer offset of the first slot.
    pub fn start(&self) -> usize {
        self.start
    }

    pub fn vmaddr(&self) -> u64 {
        self.image.to_vmaddr(self.start)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn width(&self) -> usize {
        self.image.pointer_width()
    }

    /// Value stored in slot `index`.
    pub fn slot(&self, index: usize) -> Result<u64> {
        if index >= self.len {
            let past = self.start.saturating_add(index.saturating_mul(self.width()));
            return Err(Error::AddressOutOfRange(self.image.to_vmaddr(past)));
        }
        self.image.read_pointer_at(self.start + index * self.width())
    }
}

impl<'a> Scanner<'a> {
    /// Finds the array of profile name pointers in `__DATA,__const`.
    ///
    /// The first slot that starts a run of more than [`MIN_NAME_RUN`]
    /// pointers into `__TEXT,__cstring` wins, and the run length becomes the
    /// profile count.
    pub fn find_name_table(&self) -> Result<Table<'a>> {
        let region = self.pointer_region()?;
        let width = self.image.pointer_width();
        let is_name = |value: u64| self.image.in_section(SectionKey::TEXT_CSTRING, value);

        let mut pos = region.start;
        while pos + width <= region.end {
            let run = self.run_length(pos, region.end, is_name);
            if run > MIN_NAME_RUN {
                log::info!(
                    "profile name table at {:#x} with {run} entries",
                    self.image.to_vmaddr(pos)
                );
                return Ok(self.table(TableKind::ProfileNames, pos, run));
            }
            // every start inside this run sees a shorter run
            pos += (run + 1) * width;
        }
        Err(Error::NameTableNotFound)
    }

    /// Finds the array of exactly `expected` profile record pointers in
    /// `__DATA,__const`.
    ///
    /// A slot qualifies if it points into `__DATA,__data` at a readable
    /// `(blob, length)` record whose blob is itself readable.
    pub fn find_data_table(&self, expected: usize) -> Result<Table<'a>> {
        if expected == 0 {
            return Err(Error::DataTableNotFound { expected });
        }
        let region = self.pointer_region()?;
        let width = self.image.pointer_width();
        let is_record = |value: u64| self.is_profile_record(value);

        let mut pos = region.start;
        while pos + width <= region.end {
            let run = self.run_length(pos, region.end, is_record);
            if run >= expected {
                // a longer run holds a run of exactly `expected` at its tail
                let start = pos + (run - expected) * width;
                log::info!(
                    "profile data table at {:#x} with {expected} entries",
                    self.image.to_vmaddr(start)
                );
                return Ok(self.table(TableKind::ProfileData, start, expected));
            }
            pos += (run + 1) * width;
        }
        Err(Error::DataTableNotFound { expected })
    }

    /// Finds the operation name table of the driver starting at `driver`.
    ///
    /// The table is the first pointer to the first `"default"` string at or
    /// after the driver header.
    pub fn find_operation_table(&self, driver: usize) -> Result<Table<'a>> {
        let default = self
            .find_bytes(DEFAULT_OPERATION, driver)
            .ok_or(Error::OperationTableNotFound)?;
        let target = self.image.to_vmaddr(default);
        let width = self.image.pointer_width();
        let needle = target.to_le_bytes();

        let start = self
            .find_bytes(&needle[..width], driver)
            .ok_or(Error::OperationTableNotFound)?;
        log::info!(
            "operation name table at {:#x} (default operation at {target:#x})",
            self.image.to_vmaddr(start)
        );
        let capacity = (self.image.len() - start) / width;
        Ok(self.table(TableKind::OperationNames, start, capacity))
    }

    fn is_profile_record(&self, value: u64) -> bool {
        if !self.image.in_section(SectionKey::DATA_DATA, value) {
            return false;
        }
        match self.image.read_blob_record(value) {
            Ok((blob, len)) => self.image.is_valid_extent(blob, len),
            Err(_) => false,
        }
    }

    /// Number of consecutive slots from `start` whose value satisfies
    /// `accept`, without reading past `end`.
    fn run_length(&self, start: usize, end: usize, accept: impl Fn(u64) -> bool) -> usize {
        let width = self.image.pointer_width();
        let mut count = 0;
        let mut cur = start;
        while cur + width <= end {
            match self.image.read_pointer_at(cur) {
                Ok(value) if accept(value) => {
                    count += 1;
                    cur += width;
                }
                _ => break,
            }
        }
        count
    }

    fn pointer_region(&self) -> Result<std::ops::Range<usize>> {
        self.image
            .section_range(SectionKey::DATA_CONST)
            .ok_or(Error::UnexpectedLayout(SectionKey::DATA_CONST))
    }

    fn table(&self, kind: TableKind, start: usize, len: usize) -> Table<'a> {
        Table {
            image: self.image,
            kind,
            start,
            len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sections::Extent;

    const BASE: u64 = 0x1_0000_0000;
    const CSTRING: u64 = BASE + 0x1000;
    const CONST: u64 = BASE + 0x2000;
    const DATA: u64 = BASE + 0x3000;
    const BLOBS: u64 = BASE + 0x4000;

    /// 64-bit image with `__const` slots set to `slots` and `records`
    /// `(blob, len)` pairs written at the start of `__data`.
    fn image_with(slots: &[u64], records: &[(u64, u64)]) -> LoadedImage {
        let mut bytes = vec![0u8; 0x5000];
        for (i, value) in slots.iter().enumerate() {
            let at = 0x2000 + i * 8;
            bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
        }
        for (i, (blob, len)) in records.iter().enumerate() {
            let at = 0x3000 + i * 16;
            bytes[at..at + 8].copy_from_slice(&blob.to_le_bytes());
            bytes[at + 8..at + 16].copy_from_slice(&len.to_le_bytes());
        }
        LoadedImage::from_parts(
            bytes,
            true,
            BASE,
            &[
                (SectionKey::TEXT_CSTRING, Extent::new(CSTRING, 0x100)),
                (SectionKey::DATA_CONST, Extent::new(CONST, 0x100)),
                (SectionKey::DATA_DATA, Extent::new(DATA, 0x100)),
            ],
        )
    }

    fn record(i: u64) -> u64 {
        DATA + i * 16
    }

    #[test]
    fn name_table_reports_the_whole_first_run() {
        let slots = [
            0,
            CSTRING,
            CSTRING + 8,
            CSTRING + 16,
            CSTRING + 24,
            CSTRING + 32,
            DATA,
        ];
        let image = image_with(&slots, &[]);
        let table = Scanner::new(&image).find_name_table().unwrap();

        assert_eq!(table.kind(), TableKind::ProfileNames);
        assert_eq!(table.start(), 0x2008);
        assert_eq!(table.vmaddr(), CONST + 8);
        assert_eq!(table.len(), 5);
        assert_eq!(table.slot(4).unwrap(), CSTRING + 32);
        assert!(table.slot(5).is_err());
    }

    #[test]
    fn short_runs_are_skipped() {
        let slots = [
            CSTRING,
            CSTRING,
            CSTRING,
            0,
            CSTRING,
            CSTRING,
            CSTRING,
            CSTRING,
            0,
        ];
        let image = image_with(&slots, &[]);
        let table = Scanner::new(&image).find_name_table().unwrap();
        assert_eq!(table.start(), 0x2000 + 4 * 8);
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn no_name_run_is_not_found() {
        let image = image_with(&[CSTRING, CSTRING, CSTRING], &[]);
        let err = Scanner::new(&image).find_name_table().unwrap_err();
        assert!(matches!(err, Error::NameTableNotFound));
    }

    #[test]
    fn data_table_needs_an_exact_count() {
        let records: Vec<_> = (0..5).map(|i| (BLOBS + i * 0x100, 0x40)).collect();
        let slots = [0, record(0), record(1), record(2), record(3), 0];
        let image = image_with(&slots, &records);

        let err = Scanner::new(&image).find_data_table(5).unwrap_err();
        assert!(matches!(err, Error::DataTableNotFound { expected: 5 }));

        let table = Scanner::new(&image).find_data_table(4).unwrap();
        assert_eq!(table.start(), 0x2008);
        assert_eq!(table.kind(), TableKind::ProfileData);
    }

    #[test]
    fn longer_data_run_matches_at_its_tail() {
        let records: Vec<_> = (0..6).map(|i| (BLOBS + i * 0x100, 0x40)).collect();
        let slots: Vec<u64> = (0..6).map(record).collect();
        let image = image_with(&slots, &records);

        let table = Scanner::new(&image).find_data_table(5).unwrap();
        assert_eq!(table.start(), 0x2008);
        assert_eq!(table.slot(0).unwrap(), record(1));
    }

    #[test]
    fn data_slots_with_bad_blobs_break_the_run() {
        let mut records: Vec<_> = (0..5).map(|i| (BLOBS + i * 0x100, 0x40)).collect();
        // blob running off the end of the image
        records[2] = (BLOBS + 0xff0, 0x20);
        let slots: Vec<u64> = (0..5).map(record).collect();
        let image = image_with(&slots, &records);

        let err = Scanner::new(&image).find_data_table(5).unwrap_err();
        assert!(matches!(err, Error::DataTableNotFound { .. }));
        // the two slots before the bad one still form a run of two
        assert_eq!(Scanner::new(&image).find_data_table(2).unwrap().start(), 0x2000);
    }

    #[test]
    fn operation_table_points_at_default() {
        let mut bytes = vec![0u8; 0x3000];
        bytes[0x1100..0x1108].copy_from_slice(DEFAULT_OPERATION);
        let target = BASE + 0x1100;
        bytes[0x1804..0x180c].copy_from_slice(&target.to_le_bytes());
        let image = LoadedImage::from_parts(bytes, true, BASE, &[]);

        let table = Scanner::new(&image).find_operation_table(0x1000).unwrap();
        assert_eq!(table.start(), 0x1804);
        assert_eq!(table.len(), (0x3000 - 0x1804) / 8);
    }

    #[test]
    fn operation_table_lookup_starts_at_the_driver() {
        let mut bytes = vec![0u8; 0x3000];
        bytes[0x100..0x108].copy_from_slice(DEFAULT_OPERATION);
        let image = LoadedImage::from_parts(bytes, true, BASE, &[]);

        let err = Scanner::new(&image).find_operation_table(0x1000).unwrap_err();
        assert!(matches!(err, Error::OperationTableNotFound));
    }
}
