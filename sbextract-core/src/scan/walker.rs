use crate::error::{Error, Result};
use crate::scan::discovery::{Table, TableKind};
use crate::scan::Scanner;
use crate::sections::SectionKey;

/// One built-in profile: its name and the compiled profile bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile<'a> {
    pub name: String,
    pub data: &'a [u8],
}

/// Walks a profile name table and its data table in lockstep.
///
/// Ends at the first name slot that no longer points into
/// `__TEXT,__cstring`. A failed dereference is yielded once, after which
/// the walk is over.
#[derive(Debug)]
pub struct ProfileWalker<'a> {
    names: Table<'a>,
    data: Table<'a>,
    index: usize,
    done: bool,
}

impl<'a> ProfileWalker<'a> {
    pub fn new(names: Table<'a>, data: Table<'a>) -> Self {
        debug_assert_eq!(names.kind(), TableKind::ProfileNames);
        debug_assert_eq!(data.kind(), TableKind::ProfileData);
        Self {
            names,
            data,
            index: 0,
            done: false,
        }
    }

    fn profile_at(&self, index: usize) -> Result<Option<Profile<'a>>> {
        let image = self.names.image();
        let name_ptr = self.names.slot(index)?;
        if !image.in_section(SectionKey::TEXT_CSTRING, name_ptr) {
            return Ok(None);
        }
        let record = self.data.slot(index)?;
        let (blob, len) = image.read_blob_record(record)?;
        Ok(Some(Profile {
            name: image.c_str(name_ptr)?,
            data: image.slice(blob, len)?,
        }))
    }
}

impl<'a> Iterator for ProfileWalker<'a> {
    type Item = Result<Profile<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.index >= self.names.len() || self.index >= self.data.len() {
            return None;
        }
        match self.profile_at(self.index) {
            Ok(Some(profile)) => {
                self.index += 1;
                Some(Ok(profile))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Walks an operation name table.
///
/// The first entry is the default operation. The table ends at a null slot
/// or when the default operation's pointer shows up again.
#[derive(Debug)]
pub struct OperationNames<'a> {
    table: Table<'a>,
    default: Option<u64>,
    index: usize,
    done: bool,
}

impl<'a> OperationNames<'a> {
    pub fn new(table: Table<'a>) -> Self {
        Self {
            table,
            default: None,
            index: 0,
            done: false,
        }
    }

    fn name_at(&mut self, index: usize) -> Result<Option<String>> {
        let value = self.table.slot(index)?;
        if value == 0 || self.default == Some(value) {
            return Ok(None);
        }
        if index == 0 {
            self.default = Some(value);
        }
        self.table.image().c_str(value).map(Some)
    }
}

impl<'a> Iterator for OperationNames<'a> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.index >= self.table.len() {
            return None;
        }
        match self.name_at(self.index) {
            Ok(Some(name)) => {
                self.index += 1;
                Some(Ok(name))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl<'a> Scanner<'a> {
    /// Discovers both profile tables and walks them.
    pub fn profiles(&self) -> Result<ProfileWalker<'a>> {
        let names = self.find_name_table()?;
        let data = self.find_data_table(names.len())?;
        Ok(ProfileWalker::new(names, data))
    }

    /// Locates the sandbox driver, then walks its operation name table.
    pub fn operation_names(&self) -> Result<OperationNames<'a>> {
        let driver = self.find_sandbox_driver()?;
        let table = self.find_operation_table(driver)?;
        Ok(OperationNames::new(table))
    }
}

/// Convenience for callers that want every operation name or an error.
pub fn collect_operation_names(scanner: &Scanner<'_>) -> Result<Vec<String>> {
    let names = scanner.operation_names()?.collect::<Result<Vec<_>>>()?;
    if names.is_empty() {
        return Err(Error::OperationTableNotFound);
    }
    Ok(names)
}
