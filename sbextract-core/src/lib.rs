pub mod binary;
mod bounds;
pub mod compiler;
pub mod error;
pub mod header;
pub mod scan;
pub mod sections;
#[cfg(test)]
mod testutil;

pub use binary::*;
pub use compiler::*;
pub use error::{Error, Result};
pub use header::{Header, MachHeader};
pub use scan::*;
pub use sections::*;
