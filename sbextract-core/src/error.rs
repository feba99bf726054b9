use thiserror::Error;

use crate::sections::SectionKey;

/// Everything that can go wrong while loading or scanning a Mach-O image.
///
/// All variants are terminal for the current invocation; nothing is retried.
#[derive(Error, Debug)]
pub enum Error {
    #[error("file is not a thin 32/64-bit Mach-O (magic {magic:#010x})")]
    NotMachO { magic: u32 },

    #[error("file is too short to hold its Mach-O header and load commands")]
    HeaderRead,

    #[error("load commands declare {declared} bytes, only {available} fit in the header prefix")]
    HeaderTooLong { declared: u32, available: usize },

    #[error("load command #{index} leaves the load command area")]
    IllegalLoadCommand { index: u32 },

    #[error("segment {segment} declares an illegal section count of {count}")]
    IllegalSectionCount { segment: String, count: u32 },

    #[error("required section {0} is missing")]
    UnexpectedLayout(SectionKey),

    #[error("no loadable segments")]
    NoSegments,

    #[error("segments span {span:#x} bytes, more than the {limit:#x} byte limit")]
    ImageTooBig { span: u64, limit: u64 },

    #[error("short read while loading segment {segment}")]
    SegmentRead { segment: String },

    #[error("address {0:#x} is outside the loaded image")]
    AddressOutOfRange(u64),

    #[error("string at {0:#x} runs off the end of the image")]
    UnterminatedString(u64),

    #[error("embedded driver not found")]
    DriverNotFound,

    #[error("profile name table not found")]
    NameTableNotFound,

    #[error("profile data table with {expected} entries not found")]
    DataTableNotFound { expected: usize },

    #[error("operation name table not found")]
    OperationTableNotFound,

    #[error("profile compilation failed: {0}")]
    Compile(String),

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
