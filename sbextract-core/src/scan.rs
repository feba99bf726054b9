pub mod discovery;
pub mod locator;
pub mod walker;

pub use discovery::*;
pub use locator::*;
pub use walker::*;

use crate::binary::LoadedImage;

/// Heuristic searches over one loaded image.
#[derive(Debug, Clone, Copy)]
pub struct Scanner<'a> {
    pub image: &'a LoadedImage,
}

impl<'a> Scanner<'a> {
    pub fn new(image: &'a LoadedImage) -> Self {
        Self { image }
    }
}
