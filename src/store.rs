//! Document field storage and the dense sort/score map.

pub mod document;
pub mod sortmap;

pub use document::{DocumentReader, DocumentSource, DocumentWriter};
pub use sortmap::{SortColumn, SortMapCursor, SortMapWriter};
