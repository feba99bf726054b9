pub mod macho;

pub use macho::{MachHeader, MachHeader32, MachHeader64};

pub trait Header: std::fmt::Debug + Send + Sync {
    /// Returns the CPU type field.
    fn cpu_type(&self) -> i32;

    /// Returns the file type, e.g. `MH_EXECUTE` or `MH_KEXT_BUNDLE`.
    fn file_type(&self) -> u32;

    /// Returns true if this is a 64-bit binary.
    fn is_64(&self) -> bool;

    /// Returns a short human-readable name, e.g. "Mach-O 64".
    fn format_name(&self) -> &'static str;

    /// Number of load commands following the header.
    fn ncmds(&self) -> u32;

    /// Total size in bytes of all load commands.
    fn sizeofcmds(&self) -> u32;

    /// Size of the fixed header itself; load commands start right after it.
    fn header_size(&self) -> usize;
}
