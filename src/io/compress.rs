//! Streaming zlib compression between raw buffers and buffered files.
//!
//! The document store compresses each stored field (level 6) and the raw
//! document blob (level 9) independently; generic length-prefixed compressed
//! byte strings are also available on [`BufFile`] directly.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::error::{CallunaError, Result};
use crate::io::buffer::BufFile;

/// Compression level for stored fields.
pub const FIELD_COMPRESSION: u32 = 6;

/// Compression level for whole-document blobs.
pub const DOCUMENT_COMPRESSION: u32 = 9;

/// Deflate `src` into `dst` at the given level.
pub fn compress_into(src: &[u8], dst: &mut BufFile, level: u32) -> Result<()> {
    let mut encoder = ZlibEncoder::new(dst, Compression::new(level));
    encoder
        .write_all(src)
        .and_then(|_| encoder.finish().map(|_| ()))
        .map_err(map_zlib_err)
}

/// Inflate `src` into `dst`.
pub fn decompress_into(src: &[u8], dst: &mut BufFile) -> Result<()> {
    let mut decoder = ZlibDecoder::new(src);
    let mut chunk = [0u8; 4096];
    loop {
        let n = decoder.read(&mut chunk).map_err(map_zlib_err)?;
        if n == 0 {
            return Ok(());
        }
        dst.write_all(&chunk[..n])?;
    }
}

fn map_zlib_err(err: std::io::Error) -> CallunaError {
    if err.kind() == std::io::ErrorKind::OutOfMemory {
        CallunaError::memory("zlib buffer")
    } else {
        CallunaError::Io(err)
    }
}

impl BufFile {
    /// Write a VInt compressed-length prefix followed by the deflated bytes.
    pub fn write_zbytes(&mut self, raw: &[u8], level: u32) -> Result<()> {
        let mut staged = BufFile::memory(raw.len().min(4096).max(64))?;
        compress_into(raw, &mut staged, level)?;
        self.write_vint(staged.len() as u32)?;
        self.write_all(staged.data())
    }

    /// Read a length-prefixed deflated byte string and inflate it.
    pub fn read_zbytes(&mut self) -> Result<Vec<u8>> {
        let packed = self.read_bytes()?;
        let mut out = BufFile::memory(packed.len().max(64))?;
        decompress_into(&packed, &mut out)?;
        Ok(out.data().to_vec())
    }
}
