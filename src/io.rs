//! Buffered file I/O, scalar encoding and compression.

pub mod buffer;
pub mod codec;
pub mod compress;

pub use buffer::{BufFile, SharedFile, FILE_BUFFER_LEN, MIN_IO_BUFFER};
